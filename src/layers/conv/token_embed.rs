//! # Convolutional Token Embedding
use crate::layers::conv::sep_conv::conv_output_size;
use bimm_contracts::{ShapeContract, run_every_nth, shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{LayerNorm, LayerNormConfig, PaddingConfig2d};
use burn::prelude::{Backend, Tensor};

/// Common introspection interface for `ConvTokenEmbed` configs and modules.
pub trait ConvTokenEmbedMeta {
    /// Input feature dimension size.
    fn d_input(&self) -> usize;

    /// Output (token) feature dimension size.
    fn d_output(&self) -> usize;

    /// Convolution kernel size.
    fn kernel_size(&self) -> usize;

    /// Convolution stride.
    fn stride(&self) -> usize;

    /// Convolution padding.
    fn padding(&self) -> usize;

    /// Token grid side for a given input side.
    fn grid_size(
        &self,
        input_size: usize,
    ) -> usize {
        conv_output_size(
            input_size,
            self.kernel_size(),
            self.stride(),
            self.padding(),
        )
    }
}

/// Configuration for [`ConvTokenEmbed`].
#[derive(Config, Debug, Copy)]
pub struct ConvTokenEmbedConfig {
    /// Input feature dimension size.
    pub d_input: usize,

    /// Output feature dimension size.
    pub d_output: usize,

    /// Convolution kernel size.
    pub kernel_size: usize,

    /// Convolution stride.
    pub stride: usize,

    /// Convolution padding.
    pub padding: usize,
}

impl ConvTokenEmbedMeta for ConvTokenEmbedConfig {
    fn d_input(&self) -> usize {
        self.d_input
    }

    fn d_output(&self) -> usize {
        self.d_output
    }

    fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    fn stride(&self) -> usize {
        self.stride
    }

    fn padding(&self) -> usize {
        self.padding
    }
}

impl ConvTokenEmbedConfig {
    /// Initialize a [`ConvTokenEmbed`] module.
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> ConvTokenEmbed<B> {
        ConvTokenEmbed {
            stride: self.stride,
            padding: self.padding,
            projection: Conv2dConfig::new(
                [self.d_input, self.d_output],
                [self.kernel_size, self.kernel_size],
            )
            .with_stride([self.stride, self.stride])
            .with_padding(PaddingConfig2d::Explicit(self.padding, self.padding))
            .init(device),
            norm: LayerNormConfig::new(self.d_output).init(device),
        }
    }
}

/// Strided convolution to a token grid, flattened and layer-normalized.
#[derive(Module, Debug)]
pub struct ConvTokenEmbed<B: Backend> {
    /// Convolution stride.
    pub stride: usize,

    /// Convolution padding.
    pub padding: usize,

    /// Convolutional projection to token features.
    pub projection: Conv2d<B>,

    /// Token normalization.
    pub norm: LayerNorm<B>,
}

impl<B: Backend> ConvTokenEmbedMeta for ConvTokenEmbed<B> {
    fn d_input(&self) -> usize {
        self.projection.weight.dims()[1]
    }

    fn d_output(&self) -> usize {
        self.projection.weight.dims()[0]
    }

    fn kernel_size(&self) -> usize {
        self.projection.weight.dims()[2]
    }

    fn stride(&self) -> usize {
        self.stride
    }

    fn padding(&self) -> usize {
        self.padding
    }
}

impl<B: Backend> ConvTokenEmbed<B> {
    /// Embed an image-like tensor as a token sequence.
    ///
    /// ## Arguments
    ///
    /// * `x` - Input tensor of shape ``(B, d_input, H, W)``.
    ///
    /// ## Returns
    ///
    /// * Tokens of shape ``(B, H' * W', d_output)``, row-major over the grid.
    /// * The grid shape ``[H', W']``.
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
    ) -> (Tensor<B, 3>, [usize; 2]) {
        static INPUT_CONTRACT: ShapeContract =
            shape_contract!("batch", "d_input", "height", "width");
        let [batch, height, width] = INPUT_CONTRACT.unpack_shape(
            &x,
            &["batch", "height", "width"],
            &[("d_input", self.d_input())],
        );

        let x = self.projection.forward(x);
        let [_, d_output, grid_h, grid_w] = x.dims();
        run_every_nth!({
            assert_eq!(
                [grid_h, grid_w],
                [self.grid_size(height), self.grid_size(width)]
            );
        });

        // b c h w -> b (h w) c
        let x = x
            .reshape([batch, d_output, grid_h * grid_w])
            .swap_dims(1, 2);

        (self.norm.forward(x), [grid_h, grid_w])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    #[test]
    fn test_config_meta() {
        let config = ConvTokenEmbedConfig::new(3, 64, 7, 4, 2);
        assert_eq!(config.d_input(), 3);
        assert_eq!(config.d_output(), 64);
        assert_eq!(config.grid_size(224), 56);
        assert_eq!(config.grid_size(32), 8);
    }

    #[test]
    fn test_token_embed() {
        let device = Default::default();
        let config = ConvTokenEmbedConfig::new(3, 12, 3, 2, 1);
        let module: ConvTokenEmbed<NdArray> = config.init(&device);

        assert_eq!(module.d_input(), 3);
        assert_eq!(module.d_output(), 12);
        assert_eq!(module.kernel_size(), 3);
        assert_eq!(module.stride(), 2);
        assert_eq!(module.padding(), 1);

        let x = Tensor::<NdArray, 4>::random([2, 3, 16, 16], Distribution::Default, &device);
        let (tokens, grid) = module.forward(x.clone());
        assert_eq!(grid, [8, 8]);
        assert_eq!(tokens.dims(), [2, 64, 12]);

        // Token (i * w + j) holds grid cell (i, j).
        let grid_x = module.projection.forward(x);
        let cell = grid_x
            .slice([0..2, 0..12, 3..4, 5..6])
            .reshape([2, 1, 12]);
        let expected = module.norm.forward(cell);
        let actual = tokens.slice([0..2, 29..30, 0..12]);
        actual
            .to_data()
            .assert_approx_eq::<f32>(&expected.to_data(), Default::default());
    }
}
