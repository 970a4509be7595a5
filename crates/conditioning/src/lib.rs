//! Conditioning payloads and image-space masks.
//!
//! A [`Conditioning`] is an ordered list of [`ConditioningEntry`] values, each
//! holding a text embedding shaped `[1, tokens, dim]` plus optional metadata
//! such as a pooled embedding or a [`MaskAnnotation`]. Masks are
//! [`SpatialMask`] grids in image coordinates with values in `[0, 1]`.

pub mod entry;
pub mod mask;

pub use entry::{Conditioning, ConditioningEntry, MaskAnnotation, MaskSharing, MAX_MASK_STRENGTH};
pub use mask::SpatialMask;
