//! Region-conditioned attention coupling.
//!
//! A request flows through three stages:
//!
//! 1. [`regions`] assembles one mask-annotated positive conditioning from
//!    either a two-way split of the canvas or an explicit region list.
//! 2. [`install`] parses that conditioning into an immutable
//!    [`AttentionPatchContext`] and registers a [`CouplePatch`] on every
//!    attention site of a cloned [`model::ModelPatcher`].
//! 3. [`executor`] runs inside each patched attention call: it attends per
//!    region and blends the outputs with the region masks resized to the
//!    layer's feature grid.
//!
//! [`nodes`] exposes the stages as host nodes with declared, bounds-checked
//! inputs; [`settings`] carries the injected configuration.

pub mod error;
pub mod executor;
pub mod install;
pub mod nodes;
pub mod regions;
pub mod settings;

pub use error::{CoupleError, Result};
pub use executor::CouplePatch;
pub use install::{install, AttentionPatchContext, CoupleRegion, PatchMode, RegionMask};
pub use nodes::{collect_regions, node_definitions, ComfyCouple, ComfyCoupleMask, ComfyCoupleRegion, NodeDefinition, SplitParams};
pub use regions::{
    build_from_region_list, build_from_split, split_rectangles, LeftoverMaskPolicy, Orientation, Rect, Region,
};
pub use settings::CoupleSettings;
