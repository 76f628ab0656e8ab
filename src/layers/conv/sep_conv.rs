//! # Depthwise-Separable Convolution
use bimm_contracts::{ShapeContract, run_every_nth, shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::prelude::{Backend, Tensor};

/// Output size of a square convolution along one spatial dimension.
///
/// ## Panics
///
/// If the kernel does not fit the padded input.
#[inline]
#[must_use]
pub fn conv_output_size(
    input_size: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
) -> usize {
    let padded = input_size + 2 * padding;
    assert!(
        padded >= kernel_size,
        "kernel size {kernel_size} exceeds padded input size {padded}"
    );
    (padded - kernel_size) / stride + 1
}

/// Common introspection interface for `SepConv2d` configs and modules.
pub trait SepConv2dMeta {
    /// Input channels.
    fn d_input(&self) -> usize;

    /// Output channels.
    fn d_output(&self) -> usize;

    /// Depthwise kernel size.
    fn kernel_size(&self) -> usize;

    /// Depthwise stride.
    fn stride(&self) -> usize;

    /// Depthwise padding.
    fn padding(&self) -> usize;

    /// Spatial output size for a given spatial input size.
    fn output_size(
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

/// Configuration for [`SepConv2d`].
#[derive(Config, Debug)]
pub struct SepConv2dConfig {
    /// Input channels.
    pub d_input: usize,

    /// Output channels.
    pub d_output: usize,

    /// Depthwise kernel size.
    pub kernel_size: usize,

    /// Depthwise stride.
    #[config(default = 1)]
    pub stride: usize,

    /// Depthwise padding; `(kernel_size - 1) / 2` when unset.
    #[config(default = "None")]
    pub padding: Option<usize>,
}

impl SepConv2dMeta for SepConv2dConfig {
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
        self.padding.unwrap_or((self.kernel_size - 1) / 2)
    }
}

impl SepConv2dConfig {
    /// Initialize a [`SepConv2d`] module.
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> SepConv2d<B> {
        assert!(
            self.d_input > 0 && self.d_output > 0 && self.kernel_size > 0 && self.stride > 0,
            "SepConv2d sizes must be non-zero: {self:?}"
        );
        let padding = self.padding();

        let depthwise = Conv2dConfig::new([self.d_input, self.d_input], [self.kernel_size; 2])
            .with_stride([self.stride; 2])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_groups(self.d_input)
            .init(device);

        let norm: BatchNorm<B, 2> = BatchNormConfig::new(self.d_input).init(device);

        let pointwise = Conv2dConfig::new([self.d_input, self.d_output], [1, 1]).init(device);

        SepConv2d {
            kernel_size: self.kernel_size,
            stride: self.stride,
            padding,
            depthwise,
            norm,
            pointwise,
        }
    }
}

/// Depthwise convolution, batch norm, then a pointwise (1x1) convolution.
#[derive(Module, Debug)]
pub struct SepConv2d<B: Backend> {
    /// Depthwise kernel size.
    pub kernel_size: usize,

    /// Depthwise stride.
    pub stride: usize,

    /// Depthwise padding.
    pub padding: usize,

    /// Per-channel spatial convolution.
    pub depthwise: Conv2d<B>,

    /// Normalization between the two convolutions.
    pub norm: BatchNorm<B, 2>,

    /// Channel-mixing 1x1 convolution.
    pub pointwise: Conv2d<B>,
}

impl<B: Backend> SepConv2dMeta for SepConv2d<B> {
    fn d_input(&self) -> usize {
        self.pointwise.weight.dims()[1]
    }

    fn d_output(&self) -> usize {
        self.pointwise.weight.dims()[0]
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

impl<B: Backend> SepConv2d<B> {
    /// Apply the separable convolution.
    ///
    /// ## Arguments
    ///
    /// * `x` - Input tensor of shape ``(B, d_input, H, W)``.
    ///
    /// ## Returns
    ///
    /// * Output tensor of shape ``(B, d_output, H', W')``.
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        static INPUT_CONTRACT: ShapeContract =
            shape_contract!("batch", "d_input", "height", "width");
        let [batch, height, width] = INPUT_CONTRACT.unpack_shape(
            &x,
            &["batch", "height", "width"],
            &[("d_input", self.d_input())],
        );

        let x = self.depthwise.forward(x);
        let x = self.norm.forward(x);
        let x = self.pointwise.forward(x);

        run_every_nth!({
            static OUTPUT_CONTRACT: ShapeContract =
                shape_contract!("batch", "d_output", "out_height", "out_width");
            OUTPUT_CONTRACT.assert_shape(
                &x,
                &[
                    ("batch", batch),
                    ("d_output", self.d_output()),
                    ("out_height", self.output_size(height)),
                    ("out_width", self.output_size(width)),
                ],
            );
        });

        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    #[test]
    fn test_conv_output_size() {
        assert_eq!(conv_output_size(224, 7, 4, 2), 56);
        assert_eq!(conv_output_size(56, 3, 2, 1), 28);
        assert_eq!(conv_output_size(14, 3, 1, 1), 14);
        assert_eq!(conv_output_size(7, 3, 2, 1), 4);
    }

    #[test]
    fn test_config_meta() {
        let config = SepConv2dConfig::new(8, 16, 3);
        assert_eq!(config.d_input(), 8);
        assert_eq!(config.d_output(), 16);
        assert_eq!(config.stride(), 1);
        assert_eq!(config.padding(), 1);
        assert_eq!(config.output_size(10), 10);

        let config = config.with_stride(2).with_padding(Some(0));
        assert_eq!(config.padding(), 0);
        assert_eq!(config.output_size(10), 4);
    }

    #[test]
    fn test_sep_conv() {
        let device = Default::default();
        let config = SepConv2dConfig::new(4, 6, 3).with_stride(2);
        let module: SepConv2d<NdArray> = config.init(&device);

        assert_eq!(module.d_input(), 4);
        assert_eq!(module.d_output(), 6);
        assert_eq!(module.kernel_size(), 3);
        assert_eq!(module.stride(), 2);
        assert_eq!(module.padding(), 1);

        // Depthwise groups: one input channel per filter.
        assert_eq!(module.depthwise.weight.dims(), [4, 1, 3, 3]);
        assert_eq!(module.pointwise.weight.dims(), [6, 4, 1, 1]);

        let x = Tensor::<NdArray, 4>::random([2, 4, 8, 8], Distribution::Default, &device);
        let y = module.forward(x);
        assert_eq!(y.dims(), [2, 6, 4, 4]);
    }
}
