//! Pre-normalization wrappers.
//!
//! Each wrapper applies a `LayerNorm` over the last dimension, then the
//! wrapped transformation. Residuals are added by the enclosing block.
use crate::models::cvt::conv_attention::{ConvAttention, ConvAttentionConfig, ConvAttentionMeta};
use crate::models::cvt::feed_forward::{FeedForward, FeedForwardConfig, FeedForwardMeta};
use burn::module::Module;
use burn::nn::{LayerNorm, LayerNormConfig};
use burn::prelude::{Backend, Tensor};

/// `LayerNorm` then [`FeedForward`].
#[derive(Module, Debug)]
pub struct PreNorm<B: Backend> {
    /// Input normalization.
    pub norm: LayerNorm<B>,

    /// Wrapped feed-forward.
    pub ff: FeedForward<B>,
}

impl<B: Backend> PreNorm<B> {
    /// Forward pass; shape preserving.
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
    ) -> Tensor<B, 3> {
        self.ff.forward(self.norm.forward(x))
    }
}

impl FeedForwardConfig {
    /// Initialize a [`FeedForward`] behind a [`PreNorm`].
    #[must_use]
    pub fn init_pre_norm<B: Backend>(
        &self,
        device: &B::Device,
    ) -> PreNorm<B> {
        PreNorm {
            norm: LayerNormConfig::new(self.d_input()).init(device),
            ff: self.init(device),
        }
    }
}

/// `LayerNorm` then [`ConvAttention`], forwarding the grid side.
#[derive(Module, Debug)]
pub struct PreNormIm<B: Backend> {
    /// Input normalization.
    pub norm: LayerNorm<B>,

    /// Wrapped attention.
    pub attn: ConvAttention<B>,
}

impl<B: Backend> PreNormIm<B> {
    /// Forward pass; shape preserving.
    ///
    /// ## Arguments
    ///
    /// - `x`: Token sequence of shape (B, N, C).
    /// - `grid_size`: The side of the square token grid.
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        grid_size: usize,
    ) -> Tensor<B, 3> {
        self.attn.forward(self.norm.forward(x), grid_size)
    }
}

impl ConvAttentionConfig {
    /// Initialize a [`ConvAttention`] behind a [`PreNormIm`].
    #[must_use]
    pub fn init_pre_norm<B: Backend>(
        &self,
        device: &B::Device,
    ) -> PreNormIm<B> {
        PreNormIm {
            norm: LayerNormConfig::new(self.d_input()).init(device),
            attn: self.init(device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    #[test]
    fn test_pre_norm() {
        let device = Default::default();
        let pre: PreNorm<NdArray> = FeedForwardConfig::new(8)
            .with_d_hidden(Some(32))
            .init_pre_norm(&device);
        assert_eq!(pre.ff.d_hidden(), 32);

        let x = Tensor::<NdArray, 3>::random([2, 5, 8], Distribution::Normal(0., 1.), &device);
        let y = pre.forward(x.clone());
        assert_eq!(y.dims(), [2, 5, 8]);

        // No residual inside the wrapper.
        y.to_data().assert_approx_eq::<f32>(
            &pre.ff.forward(pre.norm.forward(x)).to_data(),
            Default::default(),
        );
    }

    #[test]
    fn test_pre_norm_im() {
        let device = Default::default();
        let pre: PreNormIm<NdArray> = ConvAttentionConfig::new(12, 3, 4).init_pre_norm(&device);

        let x = Tensor::<NdArray, 3>::random([2, 16, 12], Distribution::Normal(0., 1.), &device);
        let y = pre.forward(x.clone(), 4);
        assert_eq!(y.dims(), [2, 16, 12]);

        y.to_data().assert_approx_eq::<f32>(
            &pre.attn.forward(pre.norm.forward(x), 4).to_data(),
            Default::default(),
        );
    }
}
