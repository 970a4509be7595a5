//! Attention patch installation.
//!
//! [`install`] parses the combined positive conditioning into an immutable
//! [`AttentionPatchContext`] and registers one [`CouplePatch`] per attention
//! site on a clone of the caller's [`ModelPatcher`]. The caller's handle is
//! never modified.

use std::str::FromStr;
use std::sync::Arc;

use attention::masks::MaskResample;
use attention::Config as AttentionConfig;
use candle_core::Tensor;
use conditioning::{Conditioning, MaskSharing};
use model::ModelPatcher;

use crate::error::{CoupleError, Result};
use crate::executor::CouplePatch;
use crate::settings::CoupleSettings;

/// Selector passed to the host's patch API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatchMode {
    /// Masked attention hooks on every attention module.
    #[default]
    Attention,
    /// Latent-space coupling; leaves the model untouched.
    Latent,
}

impl PatchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PatchMode::Attention => "Attention",
            PatchMode::Latent => "Latent",
        }
    }
}

impl FromStr for PatchMode {
    type Err = CoupleError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "Attention" | "attention" => Ok(Self::Attention),
            "Latent" | "latent" => Ok(Self::Latent),
            other => Err(CoupleError::UnsupportedPatchMode(other.to_string())),
        }
    }
}

/// Spatial extent of one region.
#[derive(Debug, Clone)]
pub enum RegionMask {
    /// No mask was attached; the region covers the whole canvas.
    Full,
    /// Image-space `[height, width]` f32 mask.
    Spatial(Tensor),
}

/// One positive conditioning entry as seen by the executor.
#[derive(Debug, Clone)]
pub struct CoupleRegion {
    /// Token count of the entry's embedding.
    pub tokens: usize,
    pub mask: RegionMask,
    /// Mask strength; multiplies the region's blend weight.
    pub strength: f32,
}

/// Everything an installed patch needs, fixed at install time.
#[derive(Debug)]
pub struct AttentionPatchContext {
    regions: Vec<CoupleRegion>,
    negative_tokens: usize,
    context: Tensor,
    mask_hw: Option<(usize, usize)>,
    resample: MaskResample,
    attention: AttentionConfig,
}

impl AttentionPatchContext {
    /// Parses `positive` into regions and takes the first `negative` entry.
    ///
    /// The cross-attention context is every positive embedding followed by
    /// the negative embedding, concatenated along the token axis.
    pub fn from_conditioning(
        positive: &Conditioning,
        negative: &Conditioning,
        settings: &CoupleSettings,
    ) -> Result<Self> {
        if positive.is_empty() {
            return Err(CoupleError::invalid("positive", "conditioning is empty"));
        }
        let negative_entry = negative
            .entries()
            .first()
            .ok_or_else(|| CoupleError::invalid("negative", "conditioning is empty"))?;
        if negative.len() > 1 {
            log::warn!(
                "negative conditioning has {} entries; only the first is used",
                negative.len()
            );
        }

        let dim = negative_entry.embedding_dim();
        let dtype = negative_entry.embedding().dtype();
        let mut regions = Vec::with_capacity(positive.len());
        let mut embeddings = Vec::with_capacity(positive.len() + 1);
        let mut mask_hw: Option<(usize, usize)> = None;

        for (index, entry) in positive.iter().enumerate() {
            if entry.embedding_dim() != dim {
                return Err(CoupleError::invalid(
                    "positive",
                    format!(
                        "entry {index} has embedding width {}, negative has {dim}",
                        entry.embedding_dim()
                    ),
                ));
            }
            let (mask, strength) = match entry.mask() {
                None => (RegionMask::Full, 1.0),
                Some(annotation) => {
                    let found = annotation.mask.dims();
                    match mask_hw {
                        None => mask_hw = Some(found),
                        Some(expected) if expected != found => {
                            return Err(CoupleError::InconsistentRegionShapes {
                                index,
                                expected,
                                found,
                            })
                        }
                        Some(_) => {}
                    }
                    if annotation.sharing == MaskSharing::MaskBounds {
                        log::warn!("entry {index} requests mask-bounds sharing; using the full canvas");
                    }
                    (
                        RegionMask::Spatial(annotation.mask.tensor().clone()),
                        annotation.strength,
                    )
                }
            };
            regions.push(CoupleRegion {
                tokens: entry.tokens(),
                mask,
                strength,
            });
            embeddings.push(entry.embedding().to_dtype(dtype)?);
        }
        embeddings.push(negative_entry.embedding().clone());
        let context = Tensor::cat(&embeddings, 1)?;

        Ok(Self {
            regions,
            negative_tokens: negative_entry.tokens(),
            context,
            mask_hw,
            resample: settings.mask_resample,
            attention: settings.attention.clone(),
        })
    }

    pub fn regions(&self) -> &[CoupleRegion] {
        &self.regions
    }

    pub fn negative_tokens(&self) -> usize {
        self.negative_tokens
    }

    /// Total key/value length of the rewritten cross-attention context.
    pub fn total_tokens(&self) -> usize {
        self.regions.iter().map(|r| r.tokens).sum::<usize>() + self.negative_tokens
    }

    /// `(start, len)` of every region's token segment.
    pub fn region_segments(&self) -> Vec<(usize, usize)> {
        let mut start = 0;
        self.regions
            .iter()
            .map(|region| {
                let segment = (start, region.tokens);
                start += region.tokens;
                segment
            })
            .collect()
    }

    /// `(start, len)` of the negative token segment.
    pub fn negative_segment(&self) -> (usize, usize) {
        (self.total_tokens() - self.negative_tokens, self.negative_tokens)
    }

    /// Concatenated context embedding `[1, total_tokens, dim]`.
    pub fn context_embedding(&self) -> &Tensor {
        &self.context
    }

    pub fn embedding_dim(&self) -> usize {
        self.context.dims()[2]
    }

    /// `(height, width)` shared by every spatial region mask.
    pub fn mask_hw(&self) -> Option<(usize, usize)> {
        self.mask_hw
    }

    pub fn resample(&self) -> MaskResample {
        self.resample
    }

    pub fn attention_config(&self) -> &AttentionConfig {
        &self.attention
    }
}

/// Installs masked region attention on a copy of `model`.
///
/// Returns the patched handle along with `positive` and `negative`
/// unchanged.
pub fn install(
    model: &ModelPatcher,
    positive: &Conditioning,
    negative: &Conditioning,
    mode: PatchMode,
    settings: &CoupleSettings,
) -> Result<(ModelPatcher, Conditioning, Conditioning)> {
    if mode == PatchMode::Latent {
        log::info!("patch mode {}: model left unpatched", mode.as_str());
        return Ok((model.clone(), positive.clone(), negative.clone()));
    }

    let context = Arc::new(AttentionPatchContext::from_conditioning(
        positive, negative, settings,
    )?);
    let context_dim = model.model().config().context_dim;
    if context.embedding_dim() != context_dim {
        return Err(CoupleError::invalid(
            "positive",
            format!(
                "embedding width {} does not match model context width {context_dim}",
                context.embedding_dim()
            ),
        ));
    }

    let mut patched = model.clone();
    let sites = patched.attention_sites();
    for site in &sites {
        let patch = CouplePatch::new(Arc::clone(&context), site.kind);
        patched.set_attention_patch(*site, Arc::new(patch))?;
    }

    let tokens: Vec<usize> = context.regions().iter().map(|r| r.tokens).collect();
    log::info!(
        "couple installed: regions={} tokens={:?} negative_tokens={} sites={} resample={:?}",
        context.regions().len(),
        tokens,
        context.negative_tokens(),
        sites.len(),
        context.resample()
    );
    Ok((patched, positive.clone(), negative.clone()))
}
