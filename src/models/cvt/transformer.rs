//! # CvT Model
use crate::layers::conv::token_embed::{ConvTokenEmbed, ConvTokenEmbedConfig, ConvTokenEmbedMeta};
use crate::layers::drop::rate_table::DropPathRateDepthTable;
use crate::models::cvt::block_sequence::{
    ConvTransformerBlockSequence, ConvTransformerBlockSequenceConfig,
    ConvTransformerBlockSequenceMeta,
};
use crate::models::cvt::error::CvtConfigError;
use crate::models::cvt::pooling::PoolMode;
use crate::utility::results::expect_unwrap;
use bimm_contracts::{ShapeContract, run_every_nth, shape_contract};
use burn::config::Config;
use burn::module::{Ignored, Module, Param};
use burn::nn::{Dropout, DropoutConfig, Initializer, LayerNorm, LayerNormConfig};
use burn::prelude::{Backend, Tensor};

/// Configuration of a single CvT stage.
#[derive(Config, Debug, PartialEq, Eq)]
pub struct StageConfig {
    /// Token embedding kernel size.
    pub kernel_size: usize,

    /// Token embedding stride.
    pub stride: usize,

    /// Token embedding padding.
    pub padding: usize,

    /// Attention heads in the stage's blocks.
    pub num_heads: usize,

    /// Number of transformer blocks.
    pub depth: usize,
}

/// The CvT-13 style stage layout.
///
/// | kernel | stride | padding | heads | depth |
/// |--------|--------|---------|-------|-------|
/// | 7      | 4      | 2       | 1     | 1     |
/// | 3      | 2      | 1       | 3     | 2     |
/// | 3      | 2      | 1       | 6     | 10    |
#[must_use]
pub fn default_stages() -> Vec<StageConfig> {
    vec![
        StageConfig::new(7, 4, 2, 1, 1),
        StageConfig::new(3, 2, 1, 3, 2),
        StageConfig::new(3, 2, 1, 6, 10),
    ]
}

/// Common introspection interface for `Cvt` configs and modules.
pub trait CvtMeta {
    /// Input image channels.
    fn d_input(&self) -> usize;

    /// First stage embedding width.
    fn d_embed(&self) -> usize;

    /// The stage layout.
    fn stages(&self) -> Vec<StageConfig>;

    /// Feature size of each attention head.
    fn dim_head(&self) -> usize;

    /// Width of the output vector.
    fn d_output(&self) -> usize;

    /// Token pooling strategy.
    fn pool(&self) -> PoolMode;

    /// Attention output and feed-forward dropout rate.
    fn dropout(&self) -> f64;

    /// Dropout rate on the last stage sequence.
    fn emb_dropout(&self) -> f64;

    /// Feed-forward expansion factor.
    fn scale_dim(&self) -> usize;

    /// Kernel size of the attention projections.
    fn attn_kernel_size(&self) -> usize;

    /// Key/value stride in every stage but the last.
    fn kv_stride(&self) -> usize;

    /// Maximum stochastic depth rate.
    fn drop_path_rate(&self) -> f64;

    /// Product of all stage strides.
    fn cumulative_stride(&self) -> usize {
        self.stages().iter().map(|s| s.stride).product()
    }
}

/// Configuration for the [`Cvt`] model.
#[derive(Config, Debug, PartialEq)]
pub struct CvtConfig {
    /// Input image channels.
    pub d_input: usize,

    /// First stage embedding width.
    #[config(default = 64)]
    pub d_embed: usize,

    /// The stage layout.
    #[config(default = "default_stages()")]
    pub stages: Vec<StageConfig>,

    /// Feature size of each attention head; `d_embed` when unset.
    #[config(default = "None")]
    pub dim_head: Option<usize>,

    /// Token pooling strategy.
    #[config(default = "PoolMode::Cls")]
    pub pool: PoolMode,

    /// Attention output and feed-forward dropout rate.
    #[config(default = 0.)]
    pub dropout: f64,

    /// Dropout rate on the last stage sequence, after the class token is added.
    #[config(default = 0.)]
    pub emb_dropout: f64,

    /// Feed-forward expansion factor.
    #[config(default = 4)]
    pub scale_dim: usize,

    /// Kernel size of the attention projections.
    #[config(default = 3)]
    pub attn_kernel_size: usize,

    /// Key/value stride in every stage but the last.
    #[config(default = 2)]
    pub kv_stride: usize,

    /// Maximum stochastic depth rate, ramped linearly over all blocks.
    #[config(default = 0.)]
    pub drop_path_rate: f64,
}

impl CvtMeta for CvtConfig {
    fn d_input(&self) -> usize {
        self.d_input
    }

    fn d_embed(&self) -> usize {
        self.d_embed
    }

    fn stages(&self) -> Vec<StageConfig> {
        self.stages.clone()
    }

    fn dim_head(&self) -> usize {
        self.dim_head.unwrap_or(self.d_embed)
    }

    fn d_output(&self) -> usize {
        self.stage_dims().last().copied().unwrap_or(self.d_embed)
    }

    fn pool(&self) -> PoolMode {
        self.pool
    }

    fn dropout(&self) -> f64 {
        self.dropout
    }

    fn emb_dropout(&self) -> f64 {
        self.emb_dropout
    }

    fn scale_dim(&self) -> usize {
        self.scale_dim
    }

    fn attn_kernel_size(&self) -> usize {
        self.attn_kernel_size
    }

    fn kv_stride(&self) -> usize {
        self.kv_stride
    }

    fn drop_path_rate(&self) -> f64 {
        self.drop_path_rate
    }
}

/// Validated construction plan for a [`Cvt`] model.
#[derive(Debug, Clone)]
pub struct CvtPlan {
    /// Token embedding config of each stage.
    pub embed_configs: Vec<ConvTokenEmbedConfig>,

    /// Transformer config of each stage.
    pub block_configs: Vec<ConvTransformerBlockSequenceConfig>,

    /// Embedding width of each stage.
    pub stage_dims: Vec<usize>,

    /// Product of the strides up to and including each stage.
    pub cumulative_strides: Vec<usize>,
}

impl CvtPlan {
    /// Width of the output vector.
    #[must_use]
    pub fn d_output(&self) -> usize {
        self.stage_dims.last().copied().unwrap_or_default()
    }

    /// The token grid side of each stage for a square `image_size` input.
    pub fn stage_resolutions(
        &self,
        image_size: usize,
    ) -> Result<Vec<usize>, CvtConfigError> {
        resolve_stage_resolutions(&self.embed_configs, image_size)
    }
}

/// Walk an image side through a chain of token embeddings.
fn resolve_stage_resolutions<E: ConvTokenEmbedMeta>(
    embeds: &[E],
    image_size: usize,
) -> Result<Vec<usize>, CvtConfigError> {
    let stride: usize = embeds.iter().map(|e| e.stride()).product();
    let err = CvtConfigError::ImageSize {
        size: image_size,
        stride,
    };
    if image_size == 0 || image_size % stride != 0 {
        return Err(err);
    }

    let mut size = image_size;
    let mut resolutions = Vec::with_capacity(embeds.len());
    for embed in embeds {
        if size + 2 * embed.padding() < embed.kernel_size() {
            return Err(err);
        }
        size = embed.grid_size(size);
        resolutions.push(size);
    }
    Ok(resolutions)
}

fn check_nonzero(
    field: &str,
    value: usize,
) -> Result<(), CvtConfigError> {
    if value == 0 {
        return Err(CvtConfigError::ZeroSized {
            field: field.to_string(),
        });
    }
    Ok(())
}

fn check_rate(
    field: &str,
    value: f64,
) -> Result<(), CvtConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(CvtConfigError::Probability {
            field: field.to_string(),
            value,
        });
    }
    Ok(())
}

impl CvtConfig {
    /// Embedding width of each stage.
    ///
    /// Each stage scales the previous width by its head count ratio.
    #[must_use]
    pub fn stage_dims(&self) -> Vec<usize> {
        let mut dim = self.d_embed;
        let mut prev_heads = self.stages.first().map_or(1, |s| s.num_heads);
        self.stages
            .iter()
            .map(|stage| {
                dim *= stage.num_heads.checked_div(prev_heads).unwrap_or(0);
                prev_heads = stage.num_heads;
                dim
            })
            .collect()
    }

    /// Check config validity and return a construction plan.
    ///
    /// Performs every model constraint check without allocating parameters.
    pub fn validate(&self) -> Result<CvtPlan, CvtConfigError> {
        if self.stages.is_empty() {
            return Err(CvtConfigError::NoStages);
        }
        check_nonzero("d_input", self.d_input)?;
        check_nonzero("d_embed", self.d_embed)?;
        check_nonzero("dim_head", self.dim_head())?;
        check_nonzero("scale_dim", self.scale_dim)?;
        check_nonzero("attn_kernel_size", self.attn_kernel_size)?;
        check_nonzero("kv_stride", self.kv_stride)?;
        for (i, stage) in self.stages.iter().enumerate() {
            check_nonzero(&format!("stages[{i}].kernel_size"), stage.kernel_size)?;
            check_nonzero(&format!("stages[{i}].stride"), stage.stride)?;
            check_nonzero(&format!("stages[{i}].num_heads"), stage.num_heads)?;
            check_nonzero(&format!("stages[{i}].depth"), stage.depth)?;
        }
        check_rate("dropout", self.dropout)?;
        check_rate("emb_dropout", self.emb_dropout)?;
        check_rate("drop_path_rate", self.drop_path_rate)?;

        for (i, pair) in self.stages.windows(2).enumerate() {
            if pair[1].num_heads % pair[0].num_heads != 0 {
                return Err(CvtConfigError::HeadRatio {
                    stage: i + 1,
                    heads: pair[1].num_heads,
                    prev_stage: i,
                    prev_heads: pair[0].num_heads,
                });
            }
        }

        let stage_dims = self.stage_dims();
        let dim_head = self.dim_head();
        let last = self.stages.len() - 1;
        let last_heads = self.stages[last].num_heads;
        if stage_dims[last] != last_heads * dim_head {
            return Err(CvtConfigError::ClassTokenWidth {
                d_embed: stage_dims[last],
                num_heads: last_heads,
                dim_head,
            });
        }

        let cumulative_strides: Vec<usize> = self
            .stages
            .iter()
            .scan(1, |acc, stage| {
                *acc *= stage.stride;
                Some(*acc)
            })
            .collect();

        let dpr_table = DropPathRateDepthTable::new(
            self.drop_path_rate,
            &self.stages.iter().map(|s| s.depth).collect::<Vec<_>>(),
        );

        let embed_configs: Vec<ConvTokenEmbedConfig> = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, stage)| {
                let d_input = if i == 0 {
                    self.d_input
                } else {
                    stage_dims[i - 1]
                };
                ConvTokenEmbedConfig::new(
                    d_input,
                    stage_dims[i],
                    stage.kernel_size,
                    stage.stride,
                    stage.padding,
                )
            })
            .collect();

        let block_configs: Vec<ConvTransformerBlockSequenceConfig> = self
            .stages
            .iter()
            .zip(dpr_table.all_stage_rates())
            .enumerate()
            .map(|(i, (stage, drop_path_rates))| {
                let last_stage = i == last;
                ConvTransformerBlockSequenceConfig::new(
                    stage_dims[i],
                    stage.depth,
                    stage.num_heads,
                    dim_head,
                    stage_dims[i] * self.scale_dim,
                )
                .with_kernel_size(self.attn_kernel_size)
                .with_kv_stride(if last_stage { 1 } else { self.kv_stride })
                .with_last_stage(last_stage)
                .with_drop_rate(self.dropout)
                .with_drop_path_rates(Some(drop_path_rates))
            })
            .collect();

        tracing::debug!(
            ?stage_dims,
            ?cumulative_strides,
            depths = ?dpr_table.stage_depths(),
            blocks = dpr_table.total_depth(),
            dim_head,
            "validated cvt plan"
        );

        Ok(CvtPlan {
            embed_configs,
            block_configs,
            stage_dims,
            cumulative_strides,
        })
    }

    /// Initialize a [`Cvt`] model, or report why the config is invalid.
    pub fn try_init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<Cvt<B>, CvtConfigError> {
        let plan = self.validate()?;
        let d_output = plan.d_output();

        Ok(Cvt {
            stage_embeds: plan
                .embed_configs
                .iter()
                .map(|config| config.init(device))
                .collect(),
            stage_transformers: plan
                .block_configs
                .iter()
                .map(|config| config.init(device))
                .collect(),
            cls_token: Initializer::Normal {
                mean: 0.0,
                std: 1.0,
            }
            .init([1, 1, d_output], device),
            emb_dropout: DropoutConfig {
                prob: self.emb_dropout,
            }
            .init(),
            head_norm: LayerNormConfig::new(d_output).init(device),
            pool: Ignored(self.pool),
            kv_stride: self.kv_stride,
            drop_path_rate: self.drop_path_rate,
        })
    }

    /// Initialize a [`Cvt`] model.
    ///
    /// ## Panics
    ///
    /// If the config is invalid; see [`CvtConfig::validate`].
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Cvt<B> {
        expect_unwrap(self.try_init(device))
    }
}

/// Convolutional Vision Transformer backbone.
///
/// Maps ``(B, d_input, S, S)`` images to ``(B, d_output)`` vectors.
#[derive(Module, Debug)]
pub struct Cvt<B: Backend> {
    /// Token embedding of each stage.
    pub stage_embeds: Vec<ConvTokenEmbed<B>>,

    /// Transformer stack of each stage.
    pub stage_transformers: Vec<ConvTransformerBlockSequence<B>>,

    /// Learned class token, ``(1, 1, d_output)``.
    pub cls_token: Param<Tensor<B, 3>>,

    /// Dropout on the last stage sequence.
    pub emb_dropout: Dropout,

    /// Output normalization.
    pub head_norm: LayerNorm<B>,

    /// Token pooling strategy.
    pub pool: Ignored<PoolMode>,

    /// Key/value stride in every stage but the last.
    pub kv_stride: usize,

    /// Maximum stochastic depth rate.
    pub drop_path_rate: f64,
}

impl<B: Backend> CvtMeta for Cvt<B> {
    fn d_input(&self) -> usize {
        self.stage_embeds[0].d_input()
    }

    fn d_embed(&self) -> usize {
        self.stage_embeds[0].d_output()
    }

    fn stages(&self) -> Vec<StageConfig> {
        self.stage_embeds
            .iter()
            .zip(&self.stage_transformers)
            .map(|(embed, blocks)| {
                StageConfig::new(
                    embed.kernel_size(),
                    embed.stride(),
                    embed.padding(),
                    blocks.num_heads(),
                    blocks.depth(),
                )
            })
            .collect()
    }

    fn dim_head(&self) -> usize {
        self.stage_transformers[0].dim_head()
    }

    fn d_output(&self) -> usize {
        self.cls_token.dims()[2]
    }

    fn pool(&self) -> PoolMode {
        self.pool.0
    }

    fn dropout(&self) -> f64 {
        self.stage_transformers[0].drop_rate()
    }

    fn emb_dropout(&self) -> f64 {
        self.emb_dropout.prob
    }

    fn scale_dim(&self) -> usize {
        let blocks = &self.stage_transformers[0];
        blocks.d_hidden() / blocks.d_input()
    }

    fn attn_kernel_size(&self) -> usize {
        self.stage_transformers[0].kernel_size()
    }

    fn kv_stride(&self) -> usize {
        self.kv_stride
    }

    fn drop_path_rate(&self) -> f64 {
        self.drop_path_rate
    }
}

impl<B: Backend> Cvt<B> {
    /// The token grid side of each stage for a square `image_size` input.
    pub fn stage_resolutions(
        &self,
        image_size: usize,
    ) -> Result<Vec<usize>, CvtConfigError> {
        resolve_stage_resolutions(&self.stage_embeds, image_size)
    }

    /// Prepend the class token to a ``(B, N, D)`` sequence.
    #[inline(always)]
    #[must_use]
    fn prepend_cls_token(
        &self,
        tokens: Tensor<B, 3>,
    ) -> Tensor<B, 3> {
        let [batch, _, _] = tokens.dims();
        let cls = self.cls_token.val().repeat_dim(0, batch);
        Tensor::cat(vec![cls, tokens], 1)
    }

    /// Run every stage; returns the last stage sequence, class token first.
    ///
    /// ## Arguments
    ///
    /// - `input`: Images of shape (B, `d_input`, S, S).
    ///
    /// ## Returns
    ///
    /// - Tokens of shape (B, 1 + (S / `cumulative_stride`)^2, `d_output`).
    #[must_use]
    pub fn apply_stages(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 3> {
        let last = self.stage_embeds.len() - 1;

        let mut x = input;
        for stage in 0..last {
            let (tokens, [h, w]) = self.stage_embeds[stage].forward(x);
            let tokens = self.stage_transformers[stage].forward(tokens, h);
            let [batch, n, d] = tokens.dims();
            tracing::trace!(stage, grid = h, tokens = n, d, "cvt stage");

            // b (h w) c -> b c h w
            x = tokens.swap_dims(1, 2).reshape([batch, d, h, w]);
        }

        let (tokens, [h, _]) = self.stage_embeds[last].forward(x);
        let tokens = self.emb_dropout.forward(self.prepend_cls_token(tokens));
        let tokens = self.stage_transformers[last].forward(tokens, h);
        let [_, n, d] = tokens.dims();
        tracing::trace!(stage = last, grid = h, tokens = n, d, "cvt stage");

        tokens
    }

    /// Pool a token sequence into one vector per image.
    #[inline(always)]
    #[must_use]
    pub fn aggregate_tokens(
        &self,
        tokens: Tensor<B, 3>,
    ) -> Tensor<B, 2> {
        self.pool.0.pool(tokens)
    }

    /// Normalize pooled vectors.
    #[inline(always)]
    #[must_use]
    pub fn apply_head(
        &self,
        input: Tensor<B, 2>,
    ) -> Tensor<B, 2> {
        self.head_norm.forward(input)
    }

    /// Apply the model to a batch of square images.
    ///
    /// ## Arguments
    ///
    /// - `input`: Images of shape (B, `d_input`, S, S); S must be a
    ///   multiple of `cumulative_stride`.
    ///
    /// ## Returns
    ///
    /// - Output tensor of shape (B, `d_output`).
    ///
    /// ## Panics
    ///
    /// On non-square images, or sizes the stage strides cannot tile.
    #[must_use]
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 2> {
        static INPUT_CONTRACT: ShapeContract =
            shape_contract!("batch", "d_input", "height", "width");
        let [batch, height, width] = INPUT_CONTRACT.unpack_shape(
            &input,
            &["batch", "height", "width"],
            &[("d_input", self.d_input())],
        );
        assert_eq!(height, width, "expected a square image, got {height}x{width}");
        let resolutions = expect_unwrap(self.stage_resolutions(height));

        let x = self.apply_stages(input);
        run_every_nth!({
            static TOKEN_CONTRACT: ShapeContract =
                shape_contract!("batch", "grid" * "grid" + "cls", "d_output");
            TOKEN_CONTRACT.assert_shape(
                &x,
                &[
                    ("batch", batch),
                    ("grid", resolutions[resolutions.len() - 1]),
                    ("cls", 1),
                    ("d_output", self.d_output()),
                ],
            );
        });

        let x = self.aggregate_tokens(x);
        self.apply_head(x)
    }
}
