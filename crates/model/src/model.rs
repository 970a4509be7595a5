use attention::reference::ExactAttention;
use attention::{BatchChunk, Config as AttentionConfig};
use candle_core::{Error, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::block::{PassContext, SpatialTransformer};
use crate::config::ModelConfig;
use crate::patch::{AttentionSite, TransformerOptions};

/// Spatial-transformer denoiser with one transformer per resolution level.
///
/// Level `i` runs at `1 / 2^i` of the latent resolution. After the coarsest
/// level the features are upsampled back to full resolution, merged with the
/// first level's output and passed through an output transformer whose layer
/// index is `levels`.
pub struct Model {
    config: ModelConfig,
    levels: Vec<SpatialTransformer>,
    output: SpatialTransformer,
    kernel: ExactAttention,
    attention_config: AttentionConfig,
    _weights: VarMap,
}

impl Model {
    /// Builds the model with freshly initialised weights.
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.dtype, &config.device);

        let mut levels = Vec::with_capacity(config.levels);
        for layer in 0..config.levels {
            levels.push(SpatialTransformer::new(
                layer,
                &config,
                vb.pp(format!("level{layer}")),
            )?);
        }
        let output = SpatialTransformer::new(config.levels, &config, vb.pp("output"))?;

        log::info!(
            "model init levels={} hidden={} heads={} context_dim={} dtype={:?}",
            config.levels,
            config.hidden_dim,
            config.n_heads,
            config.context_dim,
            config.dtype
        );

        Ok(Self {
            config,
            levels,
            output,
            kernel: ExactAttention::new(),
            attention_config: AttentionConfig::from_env(),
            _weights: varmap,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Every attention module, ordered by layer then kind.
    pub fn attention_sites(&self) -> Vec<AttentionSite> {
        self.levels
            .iter()
            .chain(std::iter::once(&self.output))
            .flat_map(|level| level.attention_sites())
            .collect()
    }

    /// Forward pass producing a tensor shaped like `latent`.
    pub fn forward(
        &self,
        latent: &Tensor,
        context: &Tensor,
        cond_or_uncond: &[BatchChunk],
        patches: &TransformerOptions,
    ) -> Result<Tensor> {
        let (batch, channels, height, width) = latent.dims4()?;
        if channels != self.config.in_channels {
            return Err(Error::Msg(format!(
                "latent has {channels} channels, model expects {}",
                self.config.in_channels
            )));
        }
        let divisor = self.config.max_downsample();
        if height % divisor != 0 || width % divisor != 0 {
            return Err(Error::Msg(format!(
                "latent {height}x{width} must be divisible by {divisor}"
            )));
        }
        let (ctx_batch, _, ctx_dim) = context.dims3()?;
        if ctx_batch != batch || ctx_dim != self.config.context_dim {
            return Err(Error::Msg(format!(
                "context expected [{batch}, tokens, {}] got {:?}",
                self.config.context_dim,
                context.dims()
            )));
        }
        if cond_or_uncond.is_empty() || batch % cond_or_uncond.len() != 0 {
            return Err(Error::Msg(format!(
                "batch {batch} cannot be split into {} guidance chunks",
                cond_or_uncond.len()
            )));
        }

        let pass = PassContext {
            cond_or_uncond,
            latent_shape: (height, width),
            patches,
            kernel: &self.kernel,
            attention_config: &self.attention_config,
        };

        let mut hidden = latent.clone();
        let mut first = None;
        for (index, level) in self.levels.iter().enumerate() {
            if index > 0 {
                hidden = hidden.avg_pool2d(2)?;
            }
            hidden = level.forward(&hidden, context, &pass)?;
            if first.is_none() {
                first = Some(hidden.clone());
            }
        }

        let merged = match first {
            Some(skip) if self.levels.len() > 1 => {
                (hidden.upsample_nearest2d(height, width)? + skip)?
            }
            _ => hidden,
        };
        self.output.forward(&merged, context, &pass)
    }
}
