//! Host-side denoiser model and its attention patch API.
//!
//! [`Model`] is a compact spatial-transformer denoiser: one transformer per
//! resolution level plus a full-resolution output transformer. Every
//! transformer holds a self-attention (`attn1`) and a cross-attention
//! (`attn2`) module, each addressable as an [`AttentionSite`]. Interception
//! functions implementing [`AttentionPatch`] are registered per site on a
//! [`ModelPatcher`], a cheap clone-on-patch handle around a shared [`Model`].

pub mod block;
pub mod config;
pub mod model;
pub mod patch;

pub use block::{AttentionModule, SpatialTransformer};
pub use config::ModelConfig;
pub use model::Model;
pub use patch::{AttentionPatch, AttentionSite, ModelPatcher, TransformerOptions};
