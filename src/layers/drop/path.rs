//! # DropPath (Stochastic Depth)
//!
//! Every CvT block wraps its attention and feed-forward residual branches in
//! a [`DropPath`] gate. During training, a gate skips its branch for a random
//! subset of the batch, so deep stages (ten blocks in the last CvT-13 stage)
//! train as an ensemble of shallower networks. The per-block rates come from
//! [`super::rate_table`].
//!
//! Deep Networks with Stochastic Depth (<https://arxiv.org/abs/1603.09382>)
use burn::config::Config;
use burn::module::Module;
use burn::prelude::{Backend, Tensor};
use burn::tensor::Distribution;

/// Panics unless `prob` lies in `[0, 1]`.
#[inline(always)]
fn check_probability(prob: f64) -> f64 {
    assert!(
        (0.0..=1.0).contains(&prob),
        "Probability should be between 0 and 1, but got {prob}"
    );
    prob
}

/// Applies a per-sample branch mask drawn by `sample`.
///
/// ## Arguments
///
/// * `x`: Input tensor; dim 0 is the batch.
/// * `drop_prob`: Probability of dropping a sample's branch.
/// * `training`: Identity unless set.
/// * `scale_by_keep`: Rescale survivors by `1 / (1 - drop_prob)`.
/// * `sample`: Draws the `[batch, 1, ...]` keep mask.
#[inline(always)]
#[must_use]
fn drop_path_with_sampler<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    drop_prob: f64,
    training: bool,
    scale_by_keep: bool,
    sample: fn([usize; D], f64, &B::Device) -> Tensor<B, D>,
) -> Tensor<B, D> {
    check_probability(drop_prob);

    if !training || drop_prob == 0.0 {
        return x;
    }

    let keep_prob = 1.0 - drop_prob;

    let mut mask_shape = [1; D];
    mask_shape[0] = x.dims()[0];

    let mask = sample(mask_shape, keep_prob, &x.device());
    let mask = if scale_by_keep && keep_prob > 0.0 {
        mask.div_scalar(keep_prob)
    } else {
        mask
    };

    x * mask
}

/// Functional DropPath with Bernoulli sampling.
#[must_use]
pub fn drop_path<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    drop_prob: f64,
    training: bool,
    scale_by_keep: bool,
) -> Tensor<B, D> {
    drop_path_with_sampler(
        x,
        drop_prob,
        training,
        scale_by_keep,
        |shape, keep_prob, device| {
            Tensor::<B, D>::random(shape, Distribution::Bernoulli(keep_prob), device)
        },
    )
}

/// Common introspection interface for `DropPath` configs and modules.
pub trait DropPathMeta {
    /// Probability of dropping a branch.
    fn drop_prob(&self) -> f64;

    /// Probability of keeping a branch.
    fn keep_prob(&self) -> f64 {
        1.0 - self.drop_prob()
    }

    /// Are survivors rescaled by the keep probability?
    fn scale_by_keep(&self) -> bool;
}

/// Configuration for [`DropPath`].
#[derive(Config, Debug)]
pub struct DropPathConfig {
    /// Probability of dropping a branch.
    #[config(default = 0.0)]
    pub drop_prob: f64,

    /// Rescale survivors by the keep probability.
    #[config(default = true)]
    pub scale_by_keep: bool,
}

impl DropPathMeta for DropPathConfig {
    fn drop_prob(&self) -> f64 {
        self.drop_prob
    }

    fn scale_by_keep(&self) -> bool {
        self.scale_by_keep
    }
}

impl DropPathConfig {
    /// Initializes a [`DropPath`] module.
    #[must_use]
    pub fn init(&self) -> DropPath {
        DropPath {
            drop_prob: check_probability(self.drop_prob),
            scale_by_keep: self.scale_by_keep,
        }
    }
}

/// Residual branch gate of a transformer block.
///
/// Samples one keep/drop decision per batch item. It only fires on autodiff
/// backends with a non-zero rate; model inference always sees the identity.
#[derive(Module, Clone, Debug)]
pub struct DropPath {
    /// Probability of dropping a branch.
    pub drop_prob: f64,

    /// Rescale survivors by the keep probability.
    pub scale_by_keep: bool,
}

impl DropPathMeta for DropPath {
    fn drop_prob(&self) -> f64 {
        self.drop_prob
    }

    fn scale_by_keep(&self) -> bool {
        self.scale_by_keep
    }
}

impl DropPath {
    /// Gates the input tensor.
    #[must_use]
    pub fn forward<B: Backend, const D: usize>(
        &self,
        input: Tensor<B, D>,
    ) -> Tensor<B, D> {
        drop_path(input, self.drop_prob, B::ad_enabled(), self.scale_by_keep)
    }

    /// Computes `x + gate(f(x))`.
    #[inline]
    #[must_use]
    pub fn with_skip<B: Backend, const D: usize, F>(
        &self,
        x: Tensor<B, D>,
        f: F,
    ) -> Tensor<B, D>
    where
        F: FnOnce(Tensor<B, D>) -> Tensor<B, D>,
    {
        x.clone() + self.forward(f(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    fn fixed_mask<B: Backend>(
        shape: [usize; 3],
        keep_prob: f64,
        device: &B::Device,
    ) -> Tensor<B, 3> {
        assert_eq!(shape, [3, 1, 1]);
        assert_eq!(keep_prob, 0.75);
        Tensor::<B, 3>::from_data([[[1.0]], [[0.0]], [[1.0]]], device)
    }

    #[test]
    fn test_inactive_is_identity() {
        let device = Default::default();
        let x = Tensor::<NdArray, 3>::random([3, 2, 4], Distribution::Uniform(0.0, 1.0), &device);

        let res = drop_path_with_sampler(x.clone(), 0.25, false, true, fixed_mask::<NdArray>);
        res.to_data().assert_eq(&x.to_data(), true);

        let res = drop_path_with_sampler(x.clone(), 0.0, true, true, |_, _, _| {
            unreachable!("no sampling at zero rate")
        });
        res.to_data().assert_eq(&x.to_data(), true);
    }

    #[test]
    fn test_training_masks_samples() {
        let device = Default::default();
        let x = Tensor::<NdArray, 3>::random([3, 2, 4], Distribution::Uniform(0.0, 1.0), &device);
        let mask = Tensor::<NdArray, 3>::from_data([[[1.0]], [[0.0]], [[1.0]]], &device);

        let res = drop_path_with_sampler(x.clone(), 0.25, true, false, fixed_mask::<NdArray>);
        res.to_data()
            .assert_eq(&(x.clone() * mask.clone()).to_data(), true);

        let res = drop_path_with_sampler(x.clone(), 0.25, true, true, fixed_mask::<NdArray>);
        res.to_data()
            .assert_approx_eq::<f32>(&(x * mask).div_scalar(0.75).to_data(), Default::default());
    }

    #[test]
    fn test_module_meta() {
        let config = DropPathConfig::new().with_drop_prob(0.2);
        assert_eq!(config.drop_prob(), 0.2);
        assert_eq!(config.keep_prob(), 0.8);
        assert!(config.scale_by_keep());

        let module = config.init();
        assert_eq!(module.drop_prob(), 0.2);
        assert!(module.scale_by_keep());

        // NdArray is not an autodiff backend; the gate is the identity.
        let device = Default::default();
        let x = Tensor::<NdArray, 3>::random([2, 3, 4], Distribution::Uniform(0.0, 1.0), &device);
        module.forward(x.clone()).to_data().assert_eq(&x.to_data(), true);

        let doubled = module.with_skip(x.clone(), |x| x);
        doubled
            .to_data()
            .assert_eq(&x.mul_scalar(2.0).to_data(), true);
    }

    #[test]
    fn test_autodiff_gate() {
        type B = Autodiff<NdArray>;
        let device = Default::default();
        let x = Tensor::<B, 3>::random([2, 3, 4], Distribution::Uniform(0.0, 1.0), &device);

        // Every sample drops the branch; only the skip survives.
        let module = DropPathConfig::new().with_drop_prob(1.0).init();
        module
            .with_skip(x.clone(), |x| x.mul_scalar(2.0))
            .to_data()
            .assert_eq(&x.to_data(), true);

        // Zero rate stays the identity while training.
        let module = DropPathConfig::new().init();
        module
            .with_skip(x.clone(), |x| x.mul_scalar(2.0))
            .to_data()
            .assert_eq(&x.clone().mul_scalar(3.0).to_data(), true);

        // Inference backend ignores the rate.
        let x = Tensor::<NdArray, 3>::from_data(x.to_data(), &device);
        DropPathConfig::new()
            .with_drop_prob(1.0)
            .init()
            .with_skip(x.clone(), |x| x.mul_scalar(2.0))
            .to_data()
            .assert_eq(&x.mul_scalar(3.0).to_data(), true);
    }

    #[test]
    #[should_panic(expected = "Probability should be between 0 and 1")]
    fn test_bad_probability() {
        let _ = DropPathConfig::new().with_drop_prob(1.5).init();
    }
}
