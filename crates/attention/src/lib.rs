//! Attention primitives for region-coupled diffusion denoisers.
//!
//! The crate defines a portable API for computing non-causal scaled dot-product
//! attention over tensors with layout `[batch, n_heads, seq_len, head_dim]`.
//! Hosts hand attention calls around in the packed layout
//! `[batch, seq_len, n_heads * head_dim]`; [`interop`] converts between the two.
//!
//! Alongside the kernel the crate carries the spatial mask math used to couple
//! several conditionings inside one attention call: resizing image-space masks
//! to the feature grid of an attention layer and turning raw per-region
//! weights into blend weights that sum to one at every query position.

pub mod core;
pub mod interop;
pub mod masks;
pub mod reference;

pub use crate::core::{
    to_backend_err, Attention, AttentionError, AttentionKind, BatchChunk, Config, ExtraOptions,
    PrecisionPolicy,
};
