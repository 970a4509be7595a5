//! Conditioning entries and the mask annotation applied to them.

use candle_core::{Error, Result, Tensor};

use crate::mask::SpatialMask;

/// Upper bound accepted for a mask strength.
pub const MAX_MASK_STRENGTH: f32 = 10.0;

/// How the sampler treats the annotated area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaskSharing {
    /// The conditioning applies to the whole canvas, weighted by the mask.
    #[default]
    Default,
    /// The conditioning is cropped to the mask's bounding box.
    MaskBounds,
}

/// Mask attached to a conditioning entry.
#[derive(Debug, Clone)]
pub struct MaskAnnotation {
    pub mask: SpatialMask,
    pub strength: f32,
    pub sharing: MaskSharing,
}

/// One embedding plus its metadata.
#[derive(Debug, Clone)]
pub struct ConditioningEntry {
    embedding: Tensor,
    pooled: Option<Tensor>,
    mask: Option<MaskAnnotation>,
}

impl ConditioningEntry {
    /// Wraps an embedding shaped `[1, tokens, dim]` (or `[tokens, dim]`).
    pub fn new(embedding: Tensor) -> Result<Self> {
        let embedding = match embedding.dims() {
            [1, tokens, dim] if *tokens > 0 && *dim > 0 => embedding,
            [tokens, dim] if *tokens > 0 && *dim > 0 => embedding.unsqueeze(0)?,
            dims => {
                return Err(Error::Msg(format!(
                    "conditioning embedding expected [1, tokens, dim], got {:?}",
                    dims
                )))
            }
        };
        Ok(Self {
            embedding,
            pooled: None,
            mask: None,
        })
    }

    /// Attaches a pooled embedding.
    pub fn with_pooled(mut self, pooled: Tensor) -> Self {
        self.pooled = Some(pooled);
        self
    }

    /// Embedding tensor `[1, tokens, dim]`.
    pub fn embedding(&self) -> &Tensor {
        &self.embedding
    }

    pub fn pooled(&self) -> Option<&Tensor> {
        self.pooled.as_ref()
    }

    pub fn mask(&self) -> Option<&MaskAnnotation> {
        self.mask.as_ref()
    }

    /// Number of tokens in the embedding.
    pub fn tokens(&self) -> usize {
        self.embedding.dims()[1]
    }

    /// Width of every token embedding.
    pub fn embedding_dim(&self) -> usize {
        self.embedding.dims()[2]
    }
}

/// Ordered list of conditioning entries.
#[derive(Debug, Clone, Default)]
pub struct Conditioning {
    entries: Vec<ConditioningEntry>,
}

impl Conditioning {
    pub fn new(entries: Vec<ConditioningEntry>) -> Self {
        Self { entries }
    }

    /// Single unmasked entry wrapping `embedding`.
    pub fn from_embedding(embedding: Tensor) -> Result<Self> {
        Ok(Self::new(vec![ConditioningEntry::new(embedding)?]))
    }

    pub fn entries(&self) -> &[ConditioningEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ConditioningEntry> {
        self.entries.iter()
    }

    /// Returns a copy with `mask` attached to every entry.
    pub fn set_mask(&self, mask: &SpatialMask, sharing: MaskSharing, strength: f32) -> Result<Self> {
        if !(0.0..=MAX_MASK_STRENGTH).contains(&strength) {
            return Err(Error::Msg(format!(
                "mask strength must be in [0, {MAX_MASK_STRENGTH}], got {strength}"
            )));
        }
        let entries = self
            .entries
            .iter()
            .map(|entry| ConditioningEntry {
                mask: Some(MaskAnnotation {
                    mask: mask.clone(),
                    strength,
                    sharing,
                }),
                ..entry.clone()
            })
            .collect();
        Ok(Self { entries })
    }

    /// Concatenates `self` and `other`.
    pub fn combine(&self, other: &Conditioning) -> Self {
        let mut entries = Vec::with_capacity(self.len() + other.len());
        entries.extend(self.entries.iter().cloned());
        entries.extend(other.entries.iter().cloned());
        Self { entries }
    }
}

impl<'a> IntoIterator for &'a Conditioning {
    type Item = &'a ConditioningEntry;
    type IntoIter = std::slice::Iter<'a, ConditioningEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
