//! Token sequence pooling.
use crate::models::cvt::error::CvtConfigError;
use burn::prelude::{Backend, Tensor};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// How the last-stage token sequence is reduced to one vector per image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    /// Select the class token (index 0).
    #[default]
    Cls,

    /// Average over every token, class token included.
    Mean,
}

impl PoolMode {
    /// Pool a ``(B, N, D)`` token sequence to ``(B, D)``.
    #[must_use]
    pub fn pool<B: Backend>(
        &self,
        tokens: Tensor<B, 3>,
    ) -> Tensor<B, 2> {
        match self {
            PoolMode::Cls => {
                let [batch, _, d] = tokens.dims();
                tokens.slice([0..batch, 0..1, 0..d]).squeeze(1)
            }
            PoolMode::Mean => tokens.mean_dim(1).squeeze(1),
        }
    }
}

impl Display for PoolMode {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            PoolMode::Cls => write!(f, "cls"),
            PoolMode::Mean => write!(f, "mean"),
        }
    }
}

impl FromStr for PoolMode {
    type Err = CvtConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cls" => Ok(PoolMode::Cls),
            "mean" => Ok(PoolMode::Mean),
            other => Err(CvtConfigError::UnknownPool(other.to_string())),
        }
    }
}
