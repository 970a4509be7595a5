//! Per-call metadata that hosts attach to every attention invocation.
//!
//! A denoiser usually evaluates the conditional and unconditional branches in
//! one batch. [`ExtraOptions::cond_or_uncond`] records the order of those
//! branches along the batch axis so interception code can split the batch into
//! equally sized chunks without guessing.

use std::fmt;

use crate::core::AttentionError;

/// Attention flavour of a module inside a transformer block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttentionKind {
    /// Query, key and value all come from the image latent.
    SelfAttention,
    /// Key and value come from the text conditioning.
    CrossAttention,
}

impl AttentionKind {
    /// Conventional module name (`attn1` for self, `attn2` for cross).
    pub fn module_name(self) -> &'static str {
        match self {
            AttentionKind::SelfAttention => "attn1",
            AttentionKind::CrossAttention => "attn2",
        }
    }
}

impl fmt::Display for AttentionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.module_name())
    }
}

/// Which guidance branch a batch chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchChunk {
    /// Positive (conditional) branch.
    Cond,
    /// Negative (unconditional) branch.
    Uncond,
}

/// Metadata passed alongside `q`, `k`, `v` to interception functions.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtraOptions {
    /// Self- or cross-attention.
    pub kind: AttentionKind,
    /// Index of the transformer layer issuing the call.
    pub layer: usize,
    /// Number of heads packed into the last dimension of `q`/`k`/`v`.
    pub heads: usize,
    /// Order of guidance branches along the batch axis.
    pub cond_or_uncond: Vec<BatchChunk>,
    /// Height and width of the full-resolution latent, when known.
    pub latent_shape: Option<(usize, usize)>,
}

impl ExtraOptions {
    /// Number of batch rows in every chunk of a batch with `batch` rows.
    pub fn chunk_size(&self, batch: usize) -> Result<usize, AttentionError> {
        let chunks = self.cond_or_uncond.len();
        if chunks == 0 {
            return Err(AttentionError::InvalidShape {
                context: "cond_or_uncond must list at least one batch chunk".to_string(),
            });
        }
        if batch == 0 || batch % chunks != 0 {
            return Err(AttentionError::InvalidShape {
                context: format!("batch {batch} is not divisible into {chunks} chunks"),
            });
        }
        Ok(batch / chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(chunks: Vec<BatchChunk>) -> ExtraOptions {
        ExtraOptions {
            kind: AttentionKind::CrossAttention,
            layer: 0,
            heads: 1,
            cond_or_uncond: chunks,
            latent_shape: None,
        }
    }

    #[test]
    fn chunk_size_splits_evenly() {
        let opts = options(vec![BatchChunk::Cond, BatchChunk::Uncond]);
        assert_eq!(opts.chunk_size(4), Ok(2));
        assert!(opts.chunk_size(3).is_err());
        assert!(options(Vec::new()).chunk_size(2).is_err());
    }
}
