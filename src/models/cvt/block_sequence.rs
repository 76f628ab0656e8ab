//! Per-stage transformer stacks.
use crate::models::cvt::block::{
    ConvTransformerBlock, ConvTransformerBlockConfig, ConvTransformerBlockMeta,
};
use bimm_contracts::{ShapeContract, run_every_nth, shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::prelude::{Backend, Tensor};

/// Common introspection interface for `ConvTransformerBlockSequence`.
pub trait ConvTransformerBlockSequenceMeta {
    /// Token feature size.
    fn d_input(&self) -> usize;

    /// Number of blocks.
    fn depth(&self) -> usize;

    /// Number of attention heads.
    fn num_heads(&self) -> usize;

    /// Feature size of each head.
    fn dim_head(&self) -> usize;

    /// Hidden size of the feed-forward.
    fn d_hidden(&self) -> usize;

    /// Kernel size of the attention projections.
    fn kernel_size(&self) -> usize;

    /// Stride of the key/value projections.
    fn kv_stride(&self) -> usize;

    /// Does the sequence lead with a class token?
    fn last_stage(&self) -> bool;

    /// Dropout rate of the attention output and feed-forward.
    fn drop_rate(&self) -> f64;

    /// Per-block stochastic depth rates.
    fn drop_path_rates(&self) -> Vec<f64>;
}

/// Configuration for [`ConvTransformerBlockSequence`].
#[derive(Config, Debug)]
pub struct ConvTransformerBlockSequenceConfig {
    /// Token feature size.
    pub d_input: usize,

    /// Number of blocks.
    pub depth: usize,

    /// Number of attention heads.
    pub num_heads: usize,

    /// Feature size of each head.
    pub dim_head: usize,

    /// Hidden size of the feed-forward.
    pub d_hidden: usize,

    /// Kernel size of the attention projections.
    #[config(default = 3)]
    pub kernel_size: usize,

    /// Stride of the key/value projections.
    #[config(default = 2)]
    pub kv_stride: usize,

    /// Does the sequence lead with a class token?
    #[config(default = false)]
    pub last_stage: bool,

    /// Dropout rate of the attention output and feed-forward.
    #[config(default = 0.)]
    pub drop_rate: f64,

    /// Per-block stochastic depth rates; all zero when unset.
    #[config(default = "None")]
    pub drop_path_rates: Option<Vec<f64>>,
}

impl ConvTransformerBlockSequenceMeta for ConvTransformerBlockSequenceConfig {
    fn d_input(&self) -> usize {
        self.d_input
    }

    fn depth(&self) -> usize {
        self.depth
    }

    fn num_heads(&self) -> usize {
        self.num_heads
    }

    fn dim_head(&self) -> usize {
        self.dim_head
    }

    fn d_hidden(&self) -> usize {
        self.d_hidden
    }

    fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    fn kv_stride(&self) -> usize {
        self.kv_stride
    }

    fn last_stage(&self) -> bool {
        self.last_stage
    }

    fn drop_rate(&self) -> f64 {
        self.drop_rate
    }

    fn drop_path_rates(&self) -> Vec<f64> {
        match &self.drop_path_rates {
            Some(rates) => {
                assert_eq!(
                    rates.len(),
                    self.depth,
                    "expected one drop path rate per block"
                );
                rates.clone()
            }
            None => vec![0.0; self.depth],
        }
    }
}

impl ConvTransformerBlockSequenceConfig {
    /// The per-block configs.
    #[must_use]
    pub fn block_configs(&self) -> Vec<ConvTransformerBlockConfig> {
        let common = ConvTransformerBlockConfig::new(
            self.d_input,
            self.num_heads,
            self.dim_head,
            self.d_hidden,
        )
        .with_kernel_size(self.kernel_size)
        .with_kv_stride(self.kv_stride)
        .with_last_stage(self.last_stage)
        .with_drop_rate(self.drop_rate);

        self.drop_path_rates()
            .into_iter()
            .map(|rate| common.clone().with_drop_path_rate(rate))
            .collect()
    }

    /// Initialize a [`ConvTransformerBlockSequence`].
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> ConvTransformerBlockSequence<B> {
        assert!(self.depth > 0, "depth must be non-zero");
        ConvTransformerBlockSequence {
            blocks: self
                .block_configs()
                .into_iter()
                .map(|config| config.init(device))
                .collect(),
        }
    }
}

/// A fixed-depth stack of [`ConvTransformerBlock`]s at one grid resolution.
#[derive(Module, Debug)]
pub struct ConvTransformerBlockSequence<B: Backend> {
    /// The blocks, applied in order.
    pub blocks: Vec<ConvTransformerBlock<B>>,
}

impl<B: Backend> ConvTransformerBlockSequenceMeta for ConvTransformerBlockSequence<B> {
    fn d_input(&self) -> usize {
        self.blocks[0].d_input()
    }

    fn depth(&self) -> usize {
        self.blocks.len()
    }

    fn num_heads(&self) -> usize {
        self.blocks[0].num_heads()
    }

    fn dim_head(&self) -> usize {
        self.blocks[0].dim_head()
    }

    fn d_hidden(&self) -> usize {
        self.blocks[0].d_hidden()
    }

    fn kernel_size(&self) -> usize {
        self.blocks[0].kernel_size()
    }

    fn kv_stride(&self) -> usize {
        self.blocks[0].kv_stride()
    }

    fn last_stage(&self) -> bool {
        self.blocks[0].last_stage()
    }

    fn drop_rate(&self) -> f64 {
        self.blocks[0].drop_rate()
    }

    fn drop_path_rates(&self) -> Vec<f64> {
        self.blocks.iter().map(|b| b.drop_path_rate()).collect()
    }
}

impl<B: Backend> ConvTransformerBlockSequence<B> {
    /// Applies every block in order.
    ///
    /// ## Arguments
    ///
    /// - `x`: Token sequence of shape (B, N, C); N = `grid_size`^2, plus the
    ///   class token in the last stage.
    /// - `grid_size`: The side of the square token grid.
    ///
    /// ## Returns
    ///
    /// - Token sequence of shape (B, N, C).
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        grid_size: usize,
    ) -> Tensor<B, 3> {
        static CONTRACT: ShapeContract =
            shape_contract!("batch", "grid" * "grid" + "cls", "d_input");
        let env = [
            ("grid", grid_size),
            ("cls", usize::from(self.last_stage())),
            ("d_input", self.d_input()),
        ];

        run_every_nth!(CONTRACT.assert_shape(&x, &env));

        let mut x = x;
        for block in &self.blocks {
            x = block.forward(x, grid_size);
        }

        run_every_nth!(CONTRACT.assert_shape(&x, &env));

        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    #[test]
    fn test_config() {
        let config = ConvTransformerBlockSequenceConfig::new(12, 3, 3, 4, 48);
        assert_eq!(config.d_input(), 12);
        assert_eq!(config.depth(), 3);
        assert_eq!(config.num_heads(), 3);
        assert_eq!(config.dim_head(), 4);
        assert_eq!(config.d_hidden(), 48);
        assert_eq!(config.kernel_size(), 3);
        assert_eq!(config.kv_stride(), 2);
        assert!(!config.last_stage());
        assert_eq!(config.drop_rate(), 0.0);
        assert_eq!(config.drop_path_rates(), vec![0.0; 3]);

        let config = config
            .with_drop_rate(0.1)
            .with_drop_path_rates(Some(vec![0.0, 0.05, 0.1]));
        let block_configs = config.block_configs();
        assert_eq!(block_configs.len(), 3);
        for (i, block) in block_configs.iter().enumerate() {
            assert_eq!(block.d_input(), 12);
            assert_eq!(block.drop_rate(), 0.1);
            assert_eq!(block.drop_path_rate(), [0.0, 0.05, 0.1][i]);
        }
    }

    #[test]
    #[should_panic(expected = "expected one drop path rate per block")]
    fn test_rate_count_mismatch() {
        let config = ConvTransformerBlockSequenceConfig::new(12, 3, 3, 4, 48)
            .with_drop_path_rates(Some(vec![0.1]));
        let _ = config.block_configs();
    }

    #[test]
    fn test_module() {
        let device = Default::default();
        let config = ConvTransformerBlockSequenceConfig::new(12, 2, 3, 4, 24)
            .with_drop_path_rates(Some(vec![0.0, 0.1]));
        let module: ConvTransformerBlockSequence<NdArray> = config.init(&device);

        assert_eq!(module.d_input(), 12);
        assert_eq!(module.depth(), 2);
        assert_eq!(module.num_heads(), 3);
        assert_eq!(module.dim_head(), 4);
        assert_eq!(module.d_hidden(), 24);
        assert_eq!(module.kernel_size(), 3);
        assert_eq!(module.kv_stride(), 2);
        assert!(!module.last_stage());
        assert_eq!(module.drop_path_rates(), vec![0.0, 0.1]);

        let x = Tensor::<NdArray, 3>::random([2, 36, 12], Distribution::Normal(0., 1.), &device);
        let y = module.forward(x.clone(), 6);
        assert_eq!(y.dims(), [2, 36, 12]);

        let mut expected = x;
        for block in &module.blocks {
            expected = block.forward(expected, 6);
        }
        y.to_data()
            .assert_approx_eq::<f32>(&expected.to_data(), Default::default());
    }

    #[test]
    fn test_last_stage_tokens() {
        let device = Default::default();
        let module: ConvTransformerBlockSequence<NdArray> =
            ConvTransformerBlockSequenceConfig::new(12, 1, 3, 4, 24)
                .with_kv_stride(1)
                .with_last_stage(true)
                .init(&device);

        let x = Tensor::<NdArray, 3>::random([1, 5, 12], Distribution::Normal(0., 1.), &device);
        assert_eq!(module.forward(x, 2).dims(), [1, 5, 12]);
    }
}
