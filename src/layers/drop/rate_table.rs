//! # Progressive Drop Path Rates
//!
//! Stochastic depth rates ramp linearly from 0 at the first block to the
//! configured maximum at the last block, across every stage of a model.

/// `n` evenly spaced values from `start` to `end`, inclusive.
#[must_use]
pub fn linspace(
    start: f64,
    end: f64,
    n: usize,
) -> Vec<f64> {
    match n {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Per-stage slices of a model-wide progressive drop path ramp.
#[derive(Debug, Clone)]
pub struct DropPathRateDepthTable {
    rates: Vec<f64>,
    stage_depths: Vec<usize>,
}

impl DropPathRateDepthTable {
    /// Build the table for `stage_depths` blocks ramping to `drop_path_rate`.
    #[must_use]
    pub fn new(
        drop_path_rate: f64,
        stage_depths: &[usize],
    ) -> Self {
        let stage_depths = stage_depths.to_vec();
        let rates = linspace(0.0, drop_path_rate, stage_depths.iter().sum());
        Self {
            rates,
            stage_depths,
        }
    }

    /// The depth of each stage.
    pub fn stage_depths(&self) -> &[usize] {
        &self.stage_depths
    }

    /// Total number of blocks.
    pub fn total_depth(&self) -> usize {
        self.rates.len()
    }

    /// The drop path rates of one stage's blocks.
    ///
    /// ## Panics
    ///
    /// If `stage_i` is out of bounds.
    #[must_use]
    pub fn stage_rates(
        &self,
        stage_i: usize,
    ) -> Vec<f64> {
        assert!(
            stage_i < self.stage_depths.len(),
            "Stage index {stage_i} out of bounds for {} stages",
            self.stage_depths.len()
        );
        let start = self.stage_depths[..stage_i].iter().sum::<usize>();
        let end = start + self.stage_depths[stage_i];
        self.rates[start..end].to_vec()
    }

    /// All stage rate slices, in order.
    #[must_use]
    pub fn all_stage_rates(&self) -> Vec<Vec<f64>> {
        (0..self.stage_depths.len())
            .map(|i| self.stage_rates(i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::assert_close_to_vec;
    use hamcrest::prelude::*;

    #[test]
    fn test_linspace() {
        assert!(linspace(0.0, 1.0, 0).is_empty());
        assert_eq!(linspace(0.3, 1.0, 1), vec![0.3]);
        assert_close_to_vec(
            &linspace(0.0, 0.1, 9),
            &[0.0, 0.0125, 0.025, 0.0375, 0.05, 0.0625, 0.075, 0.0875, 0.1],
            0.0001,
        );
    }

    #[test]
    fn test_table() {
        let depths = vec![1, 2, 10];
        let table = DropPathRateDepthTable::new(0.12, &depths);

        assert_that!(
            &table.stage_depths().to_vec(),
            contains(depths.clone()).exactly()
        );
        assert_eq!(table.total_depth(), 13);

        assert_close_to_vec(&table.stage_rates(0), &[0.0], 0.0001);
        assert_close_to_vec(&table.stage_rates(1), &[0.01, 0.02], 0.0001);

        let rates = table.all_stage_rates();
        assert_eq!(rates.len(), 3);
        assert_eq!(rates[2].len(), 10);
        assert_close_to_vec(&rates[2][9..], &[0.12], 0.0001);
    }

    #[test]
    fn test_zero_rate() {
        let table = DropPathRateDepthTable::new(0.0, &[2, 0, 3]);
        assert!(table.stage_rates(1).is_empty());
        assert!(
            table
                .all_stage_rates()
                .iter()
                .flatten()
                .all(|&r| r == 0.0)
        );
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_stage_out_of_bounds() {
        let _ = DropPathRateDepthTable::new(0.1, &[2]).stage_rates(1);
    }
}
