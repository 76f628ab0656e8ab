//! # Result Utilities
//!
//! Methods for [`std::result::Result`] manipulation.

use std::fmt::Display;

/// Unwraps Result, or Panics with the error's display message.
///
/// Unlike `.unwrap()`, the panic message is the error itself; with no
/// `called Result::unwrap()` prefix.
///
/// Backs the panicking ``init(...) -> T`` variants of
/// ``try_init(...) -> Result<T, E>`` constructors.
pub fn expect_unwrap<T, E>(result: Result<T, E>) -> T
where
    E: Display,
{
    match result {
        Ok(t) => t,
        Err(e) => panic!("{e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn try_halve(value: i32) -> Result<i32, String> {
        if value % 2 == 0 {
            Ok(value / 2)
        } else {
            Err(format!("{value} is odd"))
        }
    }

    #[test]
    fn test_expect_unwrap() {
        assert_eq!(expect_unwrap(try_halve(42)), 21);
    }

    #[should_panic(expected = "7 is odd")]
    #[test]
    fn test_expect_unwrap_panic() {
        expect_unwrap(try_halve(7));
    }
}
