//! Configuration errors for CvT models.

/// Errors raised while validating a CvT configuration or input size.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CvtConfigError {
    /// The model needs at least one stage.
    #[error("at least one stage is required")]
    NoStages,

    /// A size parameter was zero.
    #[error("{field} must be non-zero")]
    ZeroSized {
        /// The offending field, e.g. `stages[1].stride`.
        field: String,
    },

    /// Consecutive head counts must scale by an integer factor.
    #[error(
        "stage {stage} heads ({heads}) must be a multiple of stage {prev_stage} heads ({prev_heads})"
    )]
    HeadRatio {
        /// The stage whose head count does not divide.
        stage: usize,
        /// That stage's head count.
        heads: usize,
        /// The preceding stage.
        prev_stage: usize,
        /// The preceding stage's head count.
        prev_heads: usize,
    },

    /// The last stage must split the class token evenly into heads.
    #[error(
        "last stage width ({d_embed}) must equal num_heads ({num_heads}) * dim_head ({dim_head}) to carry the class token"
    )]
    ClassTokenWidth {
        /// The last stage's embedding width.
        d_embed: usize,
        /// The last stage's head count.
        num_heads: usize,
        /// The per-head width.
        dim_head: usize,
    },

    /// A rate was outside `[0, 1]`.
    #[error("{field} must be in [0, 1], got {value}")]
    Probability {
        /// The offending field.
        field: String,
        /// The offending value.
        value: f64,
    },

    /// The image cannot be tiled by the stage strides.
    #[error("image size {size} is not a positive multiple of the cumulative stride {stride}")]
    ImageSize {
        /// The image side.
        size: usize,
        /// The product of all stage strides.
        stride: usize,
    },

    /// An unrecognized pooling strategy name.
    #[error("unknown pooling strategy {0:?}; expected \"cls\" or \"mean\"")]
    UnknownPool(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            CvtConfigError::HeadRatio {
                stage: 2,
                heads: 4,
                prev_stage: 1,
                prev_heads: 3,
            }
            .to_string(),
            "stage 2 heads (4) must be a multiple of stage 1 heads (3)"
        );
        assert_eq!(
            CvtConfigError::ImageSize {
                size: 100,
                stride: 16
            }
            .to_string(),
            "image size 100 is not a positive multiple of the cumulative stride 16"
        );
        assert_eq!(
            CvtConfigError::UnknownPool("max".to_string()).to_string(),
            "unknown pooling strategy \"max\"; expected \"cls\" or \"mean\""
        );
    }
}
