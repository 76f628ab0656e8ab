//! Position-wise feed-forward.
use bimm_contracts::{ShapeContract, run_every_nth, shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig, Gelu, Linear, LinearConfig};
use burn::prelude::{Backend, Tensor};

/// Common introspection interface for `FeedForward` configs and modules.
pub trait FeedForwardMeta {
    /// Input and output feature size.
    fn d_input(&self) -> usize;

    /// Hidden feature size.
    fn d_hidden(&self) -> usize;

    /// Dropout rate after each projection.
    fn drop(&self) -> f64;
}

/// Configuration for [`FeedForward`].
#[derive(Config, Debug)]
pub struct FeedForwardConfig {
    /// Input and output feature size.
    pub d_input: usize,

    /// Hidden feature size; defaults to `d_input`.
    #[config(default = "None")]
    pub d_hidden: Option<usize>,

    /// Dropout rate after each projection.
    #[config(default = 0.)]
    pub drop: f64,
}

impl FeedForwardMeta for FeedForwardConfig {
    fn d_input(&self) -> usize {
        self.d_input
    }

    fn d_hidden(&self) -> usize {
        self.d_hidden.unwrap_or(self.d_input)
    }

    fn drop(&self) -> f64 {
        self.drop
    }
}

impl FeedForwardConfig {
    /// Initialize a [`FeedForward`] module.
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> FeedForward<B> {
        let d_input = self.d_input();
        let d_hidden = self.d_hidden();

        FeedForward {
            fc1: LinearConfig::new(d_input, d_hidden).init(device),
            fc2: LinearConfig::new(d_hidden, d_input).init(device),
            act: Gelu::new(),
            drop: DropoutConfig { prob: self.drop }.init(),
        }
    }
}

/// Position-wise two layer MLP.
///
/// ``Linear -> GELU -> Dropout -> Linear -> Dropout``
#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
    act: Gelu,
    drop: Dropout,
}

impl<B: Backend> FeedForwardMeta for FeedForward<B> {
    fn d_input(&self) -> usize {
        self.fc1.weight.dims()[0]
    }

    fn d_hidden(&self) -> usize {
        self.fc1.weight.dims()[1]
    }

    fn drop(&self) -> f64 {
        self.drop.prob
    }
}

impl<B: Backend> FeedForward<B> {
    /// Apply the MLP over the last dimension.
    #[must_use]
    pub fn forward<const D: usize>(
        &self,
        x: Tensor<B, D>,
    ) -> Tensor<B, D> {
        run_every_nth!({
            static INPUT_CONTRACT: ShapeContract = shape_contract!(..., "in");
            INPUT_CONTRACT.assert_shape(&x, &[("in", self.d_input())]);
        });

        let x = self.fc1.forward(x);
        let x = self.act.forward(x);
        let x = self.drop.forward(x);

        let x = self.fc2.forward(x);
        self.drop.forward(x)
    }
}
