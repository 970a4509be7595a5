//! Spatial mask utilities for region-coupled attention.
//!
//! Region masks live in image space as `[height, width]` tensors with dtype
//! [`MASK_DTYPE`]. Every attention layer sees the latent at its own
//! resolution, so masks are resized per call ([`resize`]) and turned into
//! per-query blend weights ([`blend`]).

pub mod blend;
pub mod resize;

use candle_core::DType;

/// Dtype shared by all spatial masks and blend weights.
pub const MASK_DTYPE: DType = DType::F32;

pub use blend::{blend, normalize_weights, BlendWeights};
pub use resize::{infer_feature_grid, resize_mask, MaskResample};
