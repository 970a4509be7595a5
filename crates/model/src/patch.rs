//! The per-site attention patch API.
//!
//! Patches never mutate a [`Model`]; they live in the [`TransformerOptions`]
//! of a [`ModelPatcher`]. Cloning a patcher copies the hook table (cheaply,
//! patches are reference counted) and shares the model weights, so patching a
//! clone leaves the original handle untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use attention::{Attention, AttentionError, AttentionKind, BatchChunk, ExtraOptions};
use candle_core::{Error, Result, Tensor};

use crate::model::Model;

/// Interception function installed on an attention module.
pub trait AttentionPatch: Send + Sync + fmt::Debug {
    /// Rewrites the cross-attention context before the key/value projections.
    fn prepare_context(
        &self,
        context: &Tensor,
        _options: &ExtraOptions,
    ) -> std::result::Result<Tensor, AttentionError> {
        Ok(context.clone())
    }

    /// Replaces the attention function for packed `[batch, seq, heads * dim]`
    /// operands. `kernel` is the host's default attention implementation.
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        options: &ExtraOptions,
        kernel: &dyn Attention,
    ) -> std::result::Result<Tensor, AttentionError>;
}

/// Address of one attention module inside the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttentionSite {
    pub layer: usize,
    pub kind: AttentionKind,
}

impl AttentionSite {
    pub fn new(layer: usize, kind: AttentionKind) -> Self {
        Self { layer, kind }
    }
}

impl fmt::Display for AttentionSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer{}.{}", self.layer, self.kind)
    }
}

/// Hook table consulted by the model on every forward pass.
#[derive(Debug, Clone, Default)]
pub struct TransformerOptions {
    patches_replace: BTreeMap<AttentionSite, Arc<dyn AttentionPatch>>,
}

impl TransformerOptions {
    pub fn patch(&self, site: &AttentionSite) -> Option<&Arc<dyn AttentionPatch>> {
        self.patches_replace.get(site)
    }

    pub fn patched_sites(&self) -> Vec<AttentionSite> {
        self.patches_replace.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.patches_replace.is_empty()
    }
}

/// Cloneable model handle carrying its own attention hook table.
#[derive(Clone)]
pub struct ModelPatcher {
    model: Arc<Model>,
    options: TransformerOptions,
}

impl fmt::Debug for ModelPatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelPatcher")
            .field("sites", &self.model.attention_sites().len())
            .field("patched", &self.options.patched_sites())
            .finish()
    }
}

impl ModelPatcher {
    pub fn new(model: Model) -> Self {
        Self {
            model: Arc::new(model),
            options: TransformerOptions::default(),
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn options(&self) -> &TransformerOptions {
        &self.options
    }

    /// Every attention module the model exposes.
    pub fn attention_sites(&self) -> Vec<AttentionSite> {
        self.model.attention_sites()
    }

    /// Whether both handles wrap the same model weights.
    pub fn shares_model_with(&self, other: &ModelPatcher) -> bool {
        Arc::ptr_eq(&self.model, &other.model)
    }

    /// Registers `patch` on `site`, replacing any previous patch there.
    pub fn set_attention_patch(
        &mut self,
        site: AttentionSite,
        patch: Arc<dyn AttentionPatch>,
    ) -> Result<()> {
        if !self.model.attention_sites().contains(&site) {
            return Err(Error::Msg(format!("model has no attention module at {site}")));
        }
        log::debug!("attention patch set on {site}");
        self.options.patches_replace.insert(site, patch);
        Ok(())
    }

    /// Registers `patch` on the self-attention module of `layer`.
    pub fn set_model_attn1_replace(
        &mut self,
        patch: Arc<dyn AttentionPatch>,
        layer: usize,
    ) -> Result<()> {
        self.set_attention_patch(AttentionSite::new(layer, AttentionKind::SelfAttention), patch)
    }

    /// Registers `patch` on the cross-attention module of `layer`.
    pub fn set_model_attn2_replace(
        &mut self,
        patch: Arc<dyn AttentionPatch>,
        layer: usize,
    ) -> Result<()> {
        self.set_attention_patch(AttentionSite::new(layer, AttentionKind::CrossAttention), patch)
    }

    /// Runs one denoiser forward pass with this handle's patches.
    ///
    /// `latent` is `[batch, channels, height, width]`, `context` is
    /// `[batch, tokens, context_dim]` and `cond_or_uncond` describes the
    /// guidance chunks along the batch axis.
    pub fn apply_model(
        &self,
        latent: &Tensor,
        context: &Tensor,
        cond_or_uncond: &[BatchChunk],
    ) -> Result<Tensor> {
        self.model
            .forward(latent, context, cond_or_uncond, &self.options)
    }
}
