//! Pre-norm transformer block with convolutional attention.
use crate::layers::drop::path::{DropPath, DropPathConfig, DropPathMeta};
use crate::models::cvt::conv_attention::{ConvAttentionConfig, ConvAttentionMeta};
use crate::models::cvt::feed_forward::{FeedForwardConfig, FeedForwardMeta};
use crate::models::cvt::pre_norm::{PreNorm, PreNormIm};
use bimm_contracts::{ShapeContract, run_every_nth, shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::prelude::{Backend, Tensor};

/// Common introspection interface for `ConvTransformerBlock`.
pub trait ConvTransformerBlockMeta {
    /// Token feature size.
    fn d_input(&self) -> usize;

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

    /// Stochastic depth rate of both residual branches.
    fn drop_path_rate(&self) -> f64;
}

/// Configuration for [`ConvTransformerBlock`].
#[derive(Config, Debug)]
pub struct ConvTransformerBlockConfig {
    /// Token feature size.
    pub d_input: usize,

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

    /// Stochastic depth rate of both residual branches.
    #[config(default = 0.)]
    pub drop_path_rate: f64,
}

impl ConvTransformerBlockMeta for ConvTransformerBlockConfig {
    fn d_input(&self) -> usize {
        self.d_input
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

    fn drop_path_rate(&self) -> f64 {
        self.drop_path_rate
    }
}

impl ConvTransformerBlockConfig {
    /// The attention sub-layer config.
    #[must_use]
    pub fn attention_config(&self) -> ConvAttentionConfig {
        ConvAttentionConfig::new(self.d_input, self.num_heads, self.dim_head)
            .with_kernel_size(self.kernel_size)
            .with_kv_stride(self.kv_stride)
            .with_last_stage(self.last_stage)
            .with_proj_drop(self.drop_rate)
    }

    /// The feed-forward sub-layer config.
    #[must_use]
    pub fn feed_forward_config(&self) -> FeedForwardConfig {
        FeedForwardConfig::new(self.d_input)
            .with_d_hidden(Some(self.d_hidden))
            .with_drop(self.drop_rate)
    }

    /// Initialize a [`ConvTransformerBlock`].
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> ConvTransformerBlock<B> {
        ConvTransformerBlock {
            attn: self.attention_config().init_pre_norm(device),
            ff: self.feed_forward_config().init_pre_norm(device),
            drop_path: DropPathConfig::new()
                .with_drop_prob(self.drop_path_rate)
                .init(),
        }
    }
}

/// Pre-norm transformer block with convolutional attention.
///
/// ```text
/// x = x + drop_path(attn(norm(x), grid_size))
/// x = x + drop_path(ff(norm(x)))
/// ```
#[derive(Module, Debug)]
pub struct ConvTransformerBlock<B: Backend> {
    /// Normalized attention branch.
    pub attn: PreNormIm<B>,

    /// Normalized feed-forward branch.
    pub ff: PreNorm<B>,

    /// Residual branch gate.
    pub drop_path: DropPath,
}

impl<B: Backend> ConvTransformerBlockMeta for ConvTransformerBlock<B> {
    fn d_input(&self) -> usize {
        self.attn.attn.d_input()
    }

    fn num_heads(&self) -> usize {
        self.attn.attn.num_heads()
    }

    fn dim_head(&self) -> usize {
        self.attn.attn.dim_head()
    }

    fn d_hidden(&self) -> usize {
        self.ff.ff.d_hidden()
    }

    fn kernel_size(&self) -> usize {
        self.attn.attn.kernel_size()
    }

    fn kv_stride(&self) -> usize {
        self.attn.attn.kv_stride()
    }

    fn last_stage(&self) -> bool {
        self.attn.attn.last_stage()
    }

    fn drop_rate(&self) -> f64 {
        self.ff.ff.drop()
    }

    fn drop_path_rate(&self) -> f64 {
        self.drop_path.drop_prob()
    }
}

impl<B: Backend> ConvTransformerBlock<B> {
    /// Forward pass.
    ///
    /// ## Arguments
    ///
    /// - `x`: Token sequence of shape (B, N, C).
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
        static CONTRACT: ShapeContract = shape_contract!("batch", "tokens", "d_input");
        let [batch, tokens] =
            CONTRACT.unpack_shape(&x, &["batch", "tokens"], &[("d_input", self.d_input())]);

        let x = self
            .drop_path
            .with_skip(x, |x| self.attn.forward(x, grid_size));
        let x = self.drop_path.with_skip(x, |x| self.ff.forward(x));

        run_every_nth!(CONTRACT.assert_shape(
            &x,
            &[
                ("batch", batch),
                ("tokens", tokens),
                ("d_input", self.d_input())
            ]
        ));

        x
    }
}
