//! Core traits and types shared across attention implementations.
//!
//! Implementations are expected to operate on tensors with layout
//! `[batch, n_heads, seq_len, head_dim]`. The output tensor mirrors the query
//! layout, and reductions may be promoted to `f32` regardless of the incoming
//! dtype (`bf16`, `f16`, or `f32`) depending on [`PrecisionPolicy`].

pub mod config;
pub mod errors;
pub mod options;

use candle_core::Tensor;

pub use config::{Config, PrecisionPolicy};
pub use errors::{to_backend_err, AttentionError};
pub use options::{AttentionKind, BatchChunk, ExtraOptions};

/// Unified interface for attention kernels.
///
/// * `q`, `k`, and `v` share the layout `[batch, n_heads, seq_len, head_dim]`;
///   `k` and `v` may use a different sequence length than `q`.
/// * The returned tensor mirrors the layout and dtype of `q`.
/// * Masks, when present, are additive and shaped `[batch, 1 or n_heads, q_len, k_len]`.
pub trait Attention: Send + Sync {
    /// Compute attention of `q` over `k`/`v` with an optional additive mask.
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError>;
}
