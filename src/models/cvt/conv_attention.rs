//! # Convolutional Attention
use crate::layers::conv::sep_conv::{SepConv2d, SepConv2dConfig, SepConv2dMeta};
use bimm_contracts::{ShapeContract, run_every_nth, shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::{Backend, Tensor};
use burn::tensor::activation::softmax;

/// Common introspection interface for `ConvAttention`.
pub trait ConvAttentionMeta {
    /// Input/output token feature size.
    fn d_input(&self) -> usize;

    /// Number of attention heads.
    fn num_heads(&self) -> usize;

    /// Feature size of each head.
    fn dim_head(&self) -> usize;

    /// Concatenated head feature size.
    fn d_inner(&self) -> usize {
        self.num_heads() * self.dim_head()
    }

    /// Kernel size of the projection convolutions.
    fn kernel_size(&self) -> usize;

    /// Stride of the key/value projection convolutions.
    fn kv_stride(&self) -> usize;

    /// Does the sequence lead with a class token?
    fn last_stage(&self) -> bool;

    /// Is there an output projection?
    ///
    /// A single head as wide as the input is returned as-is.
    fn enable_proj(&self) -> bool {
        !(self.num_heads() == 1 && self.dim_head() == self.d_input())
    }

    /// Dropout rate after the output projection.
    fn proj_drop(&self) -> f64;

    /// The attention logit scale, ``dim_head^-0.5``.
    fn scale(&self) -> f64 {
        (self.dim_head() as f64).powf(-0.5)
    }
}

/// Configuration for [`ConvAttention`].
#[derive(Config, Debug)]
pub struct ConvAttentionConfig {
    /// Input/output token feature size.
    pub d_input: usize,

    /// Number of attention heads.
    pub num_heads: usize,

    /// Feature size of each head.
    pub dim_head: usize,

    /// Kernel size of the projection convolutions.
    #[config(default = 3)]
    pub kernel_size: usize,

    /// Stride of the key/value projection convolutions.
    #[config(default = 2)]
    pub kv_stride: usize,

    /// Does the sequence lead with a class token?
    #[config(default = false)]
    pub last_stage: bool,

    /// Dropout rate after the output projection.
    #[config(default = 0.)]
    pub proj_drop: f64,
}

impl ConvAttentionMeta for ConvAttentionConfig {
    fn d_input(&self) -> usize {
        self.d_input
    }

    fn num_heads(&self) -> usize {
        self.num_heads
    }

    fn dim_head(&self) -> usize {
        self.dim_head
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

    fn proj_drop(&self) -> f64 {
        self.proj_drop
    }
}

impl ConvAttentionConfig {
    /// Initialize a [`ConvAttention`] module.
    ///
    /// ## Panics
    ///
    /// If `last_stage` is set and the class token cannot be split into heads.
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> ConvAttention<B> {
        assert!(
            self.num_heads > 0 && self.dim_head > 0,
            "num_heads and dim_head must be non-zero: {self:?}"
        );
        assert!(
            !self.last_stage || self.d_input == self.d_inner(),
            "class token width {} must equal num_heads * dim_head = {}",
            self.d_input,
            self.d_inner(),
        );

        let d_inner = self.d_inner();
        let projection = |stride: usize| {
            SepConv2dConfig::new(self.d_input, d_inner, self.kernel_size)
                .with_stride(stride)
                .init(device)
        };

        ConvAttention {
            num_heads: self.num_heads,
            dim_head: self.dim_head,
            last_stage: self.last_stage,
            to_q: projection(1),
            to_k: projection(self.kv_stride),
            to_v: projection(self.kv_stride),
            proj: if self.enable_proj() {
                Some(LinearConfig::new(d_inner, self.d_input).init(device))
            } else {
                None
            },
            proj_drop: DropoutConfig {
                prob: self.proj_drop,
            }
            .init(),
        }
    }
}

/// Multi-head self-attention with convolutional Q/K/V projections.
///
/// Tokens are laid back onto their square grid; queries are projected at
/// full resolution and keys/values at `kv_stride`. When `last_stage` is set
/// the leading class token bypasses the convolutions and joins Q, K and V
/// directly.
#[derive(Module, Debug)]
pub struct ConvAttention<B: Backend> {
    /// Number of attention heads.
    pub num_heads: usize,

    /// Feature size of each head.
    pub dim_head: usize,

    /// Does the sequence lead with a class token?
    pub last_stage: bool,

    /// Query projection.
    pub to_q: SepConv2d<B>,

    /// Key projection.
    pub to_k: SepConv2d<B>,

    /// Value projection.
    pub to_v: SepConv2d<B>,

    /// Output projection; absent for a single full-width head.
    pub proj: Option<Linear<B>>,

    /// Dropout after the output projection.
    pub proj_drop: Dropout,
}

impl<B: Backend> ConvAttentionMeta for ConvAttention<B> {
    fn d_input(&self) -> usize {
        self.to_q.d_input()
    }

    fn num_heads(&self) -> usize {
        self.num_heads
    }

    fn dim_head(&self) -> usize {
        self.dim_head
    }

    fn kernel_size(&self) -> usize {
        self.to_q.kernel_size()
    }

    fn kv_stride(&self) -> usize {
        self.to_k.stride()
    }

    fn last_stage(&self) -> bool {
        self.last_stage
    }

    fn enable_proj(&self) -> bool {
        self.proj.is_some()
    }

    fn proj_drop(&self) -> f64 {
        self.proj_drop.prob
    }
}

impl<B: Backend> ConvAttention<B> {
    /// Forward pass.
    ///
    /// ## Arguments
    ///
    /// - `x`: Input tensor of shape (B, N, C); N = `grid_size`^2, plus one
    ///   leading class token in the last stage.
    /// - `grid_size`: The side of the square token grid.
    ///
    /// ## Returns
    ///
    /// - Output tensor of shape (B, N, C).
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        grid_size: usize,
    ) -> Tensor<B, 3> {
        static CONTRACT: ShapeContract = shape_contract!("batch", "n", "d_input");
        let [batch, n] = CONTRACT.unpack_shape(&x, &["batch", "n"], &[("d_input", self.d_input())]);
        let d_input = self.d_input();

        let num_cls = usize::from(self.last_stage);
        assert_eq!(
            n,
            grid_size * grid_size + num_cls,
            "token count {n} does not match a {grid_size}x{grid_size} grid (class tokens: {num_cls})"
        );

        let (cls, x) = if self.last_stage {
            let cls = x
                .clone()
                .slice([0..batch, 0..1, 0..d_input])
                .reshape([batch, 1, self.num_heads, self.dim_head])
                .swap_dims(1, 2);
            // (b, num_heads, 1, dim_head)

            (Some(cls), x.slice([0..batch, 1..n, 0..d_input]))
        } else {
            (None, x)
        };

        // b (h w) c -> b c h w
        let grid = x
            .swap_dims(1, 2)
            .reshape([batch, d_input, grid_size, grid_size]);

        let q = self.split_heads(self.to_q.forward(grid.clone()));
        let k = self.split_heads(self.to_k.forward(grid.clone()));
        let v = self.split_heads(self.to_v.forward(grid));
        // (b, num_heads, tokens, dim_head)

        let (q, k, v) = match cls {
            Some(cls) => (
                Tensor::cat(vec![cls.clone(), q], 2),
                Tensor::cat(vec![cls.clone(), k], 2),
                Tensor::cat(vec![cls, v], 2),
            ),
            None => (q, k, v),
        };

        let attn = self.attention(q, k);
        // (b, num_heads, n, kv_tokens)

        let x = attn.matmul(v);
        let x = x.swap_dims(1, 2).reshape([batch, n, self.d_inner()]);
        // (b, n, d_inner)

        let x = match &self.proj {
            Some(proj) => self.proj_drop.forward(proj.forward(x)),
            None => x,
        };

        run_every_nth!(CONTRACT.assert_shape(
            &x,
            &[("batch", batch), ("n", n), ("d_input", d_input)]
        ));

        x
    }

    /// Split a projected grid into per-head token sequences.
    ///
    /// ## Arguments
    ///
    /// - `x`: Projection of shape (B, `num_heads` * `dim_head`, H, W).
    ///
    /// ## Returns
    ///
    /// - Tensor of shape (B, `num_heads`, H*W, `dim_head`).
    #[must_use]
    fn split_heads(
        &self,
        x: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let [batch, _, h, w] = x.dims();
        // b (heads d) h w -> b heads (h w) d
        x.reshape([batch, self.num_heads, self.dim_head, h * w])
            .swap_dims(2, 3)
    }

    /// Scaled dot-product attention weights.
    ///
    /// ## Arguments
    ///
    /// - `q`: Query tensor of shape (B, `num_heads`, Nq, `dim_head`).
    /// - `k`: Key tensor of shape (B, `num_heads`, Nk, `dim_head`).
    ///
    /// ## Returns
    ///
    /// - ``softmax(q k^T * dim_head^-0.5)``, of shape (B, `num_heads`, Nq, Nk).
    #[must_use]
    fn attention(
        &self,
        q: Tensor<B, 4>,
        k: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let dots = q.matmul(k.swap_dims(2, 3)).mul_scalar(self.scale());
        softmax(dots, 3)
    }
}
