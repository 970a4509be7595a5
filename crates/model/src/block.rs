use std::fmt;

use attention::interop::attend_packed;
use attention::{Attention, AttentionKind, BatchChunk, Config as AttentionConfig, ExtraOptions};
use candle_core::{bail, Error, Result, Tensor};
use candle_nn::{layer_norm, linear, linear_no_bias, LayerNorm, Linear, Module, VarBuilder};

use crate::config::ModelConfig;
use crate::patch::{AttentionSite, TransformerOptions};

/// Per-forward state shared by every attention module of one pass.
pub(crate) struct PassContext<'a> {
    pub cond_or_uncond: &'a [BatchChunk],
    pub latent_shape: (usize, usize),
    pub patches: &'a TransformerOptions,
    pub kernel: &'a dyn Attention,
    pub attention_config: &'a AttentionConfig,
}

/// Multi-head attention with separate query/key/value projections.
pub struct AttentionModule {
    kind: AttentionKind,
    heads: usize,
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    to_out: Linear,
}

impl fmt::Debug for AttentionModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttentionModule")
            .field("kind", &self.kind)
            .field("heads", &self.heads)
            .finish()
    }
}

impl AttentionModule {
    fn new(kind: AttentionKind, config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let context_dim = match kind {
            AttentionKind::SelfAttention => config.hidden_dim,
            AttentionKind::CrossAttention => config.context_dim,
        };
        Ok(Self {
            kind,
            heads: config.n_heads,
            to_q: linear_no_bias(config.hidden_dim, config.hidden_dim, vb.pp("to_q"))?,
            to_k: linear_no_bias(context_dim, config.hidden_dim, vb.pp("to_k"))?,
            to_v: linear_no_bias(context_dim, config.hidden_dim, vb.pp("to_v"))?,
            to_out: linear(config.hidden_dim, config.hidden_dim, vb.pp("to_out"))?,
        })
    }

    pub fn kind(&self) -> AttentionKind {
        self.kind
    }

    /// Attends `hidden` (`[batch, seq, hidden]`) to itself or to `context`.
    pub(crate) fn forward(
        &self,
        hidden: &Tensor,
        context: &Tensor,
        layer: usize,
        pass: &PassContext<'_>,
    ) -> Result<Tensor> {
        let site = AttentionSite::new(layer, self.kind);
        let patch = pass.patches.patch(&site);
        let options = ExtraOptions {
            kind: self.kind,
            layer,
            heads: self.heads,
            cond_or_uncond: pass.cond_or_uncond.to_vec(),
            latent_shape: Some(pass.latent_shape),
        };

        let context = match (self.kind, patch) {
            (AttentionKind::SelfAttention, _) => hidden.clone(),
            (AttentionKind::CrossAttention, Some(patch)) => patch
                .prepare_context(context, &options)
                .map_err(|e| Error::Msg(format!("{site}: {e}")))?,
            (AttentionKind::CrossAttention, None) => context.clone(),
        };

        let q = self.to_q.forward(hidden)?;
        let k = self.to_k.forward(&context)?;
        let v = self.to_v.forward(&context)?;

        let out = match patch {
            Some(patch) => patch.attend(&q, &k, &v, &options, pass.kernel),
            None => attend_packed(pass.kernel, &q, &k, &v, self.heads, pass.attention_config),
        }
        .map_err(|e| Error::Msg(format!("{site}: {e}")))?;

        if out.dims() != q.dims() {
            bail!(
                "{site}: attention returned {:?}, expected {:?}",
                out.dims(),
                q.dims()
            );
        }
        self.to_out.forward(&out)
    }
}

/// Transformer over the flattened spatial positions of one resolution level.
#[derive(Debug)]
pub struct SpatialTransformer {
    layer: usize,
    proj_in: Linear,
    norm1: LayerNorm,
    attn1: AttentionModule,
    norm2: LayerNorm,
    attn2: AttentionModule,
    norm3: LayerNorm,
    ff_in: Linear,
    ff_out: Linear,
    proj_out: Linear,
}

impl SpatialTransformer {
    pub(crate) fn new(layer: usize, config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_dim;
        Ok(Self {
            layer,
            proj_in: linear(config.in_channels, hidden, vb.pp("proj_in"))?,
            norm1: layer_norm(hidden, 1e-5, vb.pp("norm1"))?,
            attn1: AttentionModule::new(AttentionKind::SelfAttention, config, vb.pp("attn1"))?,
            norm2: layer_norm(hidden, 1e-5, vb.pp("norm2"))?,
            attn2: AttentionModule::new(AttentionKind::CrossAttention, config, vb.pp("attn2"))?,
            norm3: layer_norm(hidden, 1e-5, vb.pp("norm3"))?,
            ff_in: linear(hidden, hidden * 4, vb.pp("ff_in"))?,
            ff_out: linear(hidden * 4, hidden, vb.pp("ff_out"))?,
            proj_out: linear(hidden, config.in_channels, vb.pp("proj_out"))?,
        })
    }

    pub fn layer(&self) -> usize {
        self.layer
    }

    /// Sites of the attention modules owned by this transformer.
    pub fn attention_sites(&self) -> [AttentionSite; 2] {
        [
            AttentionSite::new(self.layer, self.attn1.kind()),
            AttentionSite::new(self.layer, self.attn2.kind()),
        ]
    }

    /// Applies the transformer to `x` (`[batch, channels, height, width]`).
    pub(crate) fn forward(
        &self,
        x: &Tensor,
        context: &Tensor,
        pass: &PassContext<'_>,
    ) -> Result<Tensor> {
        let (batch, channels, height, width) = x.dims4()?;
        let tokens = x
            .flatten_from(2)?
            .transpose(1, 2)?
            .contiguous()?;
        let mut hidden = self.proj_in.forward(&tokens)?;

        let normed = self.norm1.forward(&hidden)?;
        hidden = (&hidden + self.attn1.forward(&normed, context, self.layer, pass)?)?;
        let normed = self.norm2.forward(&hidden)?;
        hidden = (&hidden + self.attn2.forward(&normed, context, self.layer, pass)?)?;
        let normed = self.norm3.forward(&hidden)?;
        let ff = self.ff_out.forward(&self.ff_in.forward(&normed)?.gelu()?)?;
        hidden = (&hidden + ff)?;

        let out = self
            .proj_out
            .forward(&hidden)?
            .transpose(1, 2)?
            .reshape((batch, channels, height, width))?;
        x + out
    }
}
