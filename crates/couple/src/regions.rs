//! Region assembly: turning user inputs into one mask-annotated positive
//! conditioning list ready for [`install`](crate::install::install).
//!
//! Two layouts are supported. [`build_from_split`] divides the canvas with a
//! single horizontal or vertical line; [`build_from_region_list`] takes an
//! arbitrary ordered list of regions and gives the first region's
//! conditioning whatever area the other regions leave uncovered.

use std::str::FromStr;

use candle_core::Device;
use conditioning::{Conditioning, MaskSharing, SpatialMask};
use serde::Deserialize;

use crate::error::{CoupleError, Result};

/// Smallest canvas edge accepted by the split layout.
pub const MIN_DIMENSION: usize = 16;
/// Canvas edges advance in multiples of the latent downscale factor.
pub const DIMENSION_STEP: usize = 8;

const REGION_STRENGTH: f32 = 1.0;

/// Direction of the dividing line of a split layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// Regions side by side, divided at a column.
    Horizontal,
    /// Regions stacked, divided at a row.
    Vertical,
}

impl Orientation {
    pub fn as_str(self) -> &'static str {
        match self {
            Orientation::Horizontal => "horizontal",
            Orientation::Vertical => "vertical",
        }
    }
}

impl FromStr for Orientation {
    type Err = CoupleError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "horizontal" => Ok(Self::Horizontal),
            "vertical" => Ok(Self::Vertical),
            other => Err(CoupleError::UnsupportedOrientation(other.to_string())),
        }
    }
}

/// Treatment of the leftover mask `1 - Σ masks[1..]` of a region list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeftoverMaskPolicy {
    /// Keep the raw values; overlapping regions produce negative weights.
    #[default]
    PassThrough,
    /// Clamp the leftover mask into `[0, 1]`.
    ClampToZero,
}

impl FromStr for LeftoverMaskPolicy {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pass_through" | "passthrough" => Ok(Self::PassThrough),
            "clamp_to_zero" | "clamp" => Ok(Self::ClampToZero),
            other => Err(format!("unknown leftover mask policy '{other}'")),
        }
    }
}

/// Axis-aligned rectangle in canvas pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Rect {
    pub fn contains(&self, x: usize, y: usize) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }

    /// Canvas-sized mask holding `1.0` inside the rectangle and `0.0` outside.
    pub fn to_mask(&self, canvas_w: usize, canvas_h: usize, device: &Device) -> Result<SpatialMask> {
        let canvas = SpatialMask::solid(0.0, canvas_w, canvas_h, device)?;
        let fill = SpatialMask::solid(1.0, self.width, self.height, device)?;
        Ok(canvas.composite_add(&fill, self.x, self.y)?)
    }
}

/// A conditioning restricted to a spatial mask.
#[derive(Debug, Clone)]
pub struct Region {
    pub conditioning: Conditioning,
    pub mask: SpatialMask,
}

impl Region {
    pub fn new(conditioning: Conditioning, mask: SpatialMask) -> Self {
        Self { conditioning, mask }
    }
}

/// The two rectangles of a split layout.
///
/// The first rectangle spans from the dividing line to the far edge
/// (`[width * center, width)` columns for a horizontal split); the second
/// spans from the near edge to the line.
pub fn split_rectangles(
    orientation: Orientation,
    center: f64,
    width: usize,
    height: usize,
) -> Result<(Rect, Rect)> {
    if !(0.0..=1.0).contains(&center) {
        return Err(CoupleError::invalid(
            "center",
            format!("must be within [0, 1], got {center}"),
        ));
    }
    if width == 0 || height == 0 {
        return Err(CoupleError::invalid(
            "width/height",
            format!("canvas must be non-empty, got {width}x{height}"),
        ));
    }

    let rects = match orientation {
        Orientation::Horizontal => {
            let split = ((width as f64 * center).floor() as usize).min(width);
            (
                Rect { x: split, y: 0, width: width - split, height },
                Rect { x: 0, y: 0, width: split, height },
            )
        }
        Orientation::Vertical => {
            let split = ((height as f64 * center).floor() as usize).min(height);
            (
                Rect { x: 0, y: split, width, height: height - split },
                Rect { x: 0, y: 0, width, height: split },
            )
        }
    };
    Ok(rects)
}

/// Builds the combined positive conditioning for a two-way split.
///
/// `positive_1` is annotated with the second rectangle (left or top part)
/// and `positive_2` with the first (right or bottom part); the result lists
/// `positive_1`'s entries before `positive_2`'s.
pub fn build_from_split(
    positive_1: &Conditioning,
    positive_2: &Conditioning,
    orientation: Orientation,
    center: f64,
    width: usize,
    height: usize,
) -> Result<Conditioning> {
    let device = positive_1
        .entries()
        .first()
        .map(|entry| entry.embedding().device().clone())
        .ok_or_else(|| CoupleError::invalid("positive_1", "conditioning is empty"))?;
    if positive_2.is_empty() {
        return Err(CoupleError::invalid("positive_2", "conditioning is empty"));
    }

    let (first, second) = split_rectangles(orientation, center, width, height)?;
    let first_mask = first.to_mask(width, height, &device)?;
    let second_mask = second.to_mask(width, height, &device)?;

    log::debug!(
        "split layout orientation={} center={center} canvas={width}x{height} first={first:?} second={second:?}",
        orientation.as_str()
    );

    let masked_1 = positive_1.set_mask(&second_mask, MaskSharing::Default, REGION_STRENGTH)?;
    let masked_2 = positive_2.set_mask(&first_mask, MaskSharing::Default, REGION_STRENGTH)?;
    Ok(masked_1.combine(&masked_2))
}

/// Builds the combined positive conditioning for an ordered region list.
///
/// The result holds every region with its own mask, followed by the first
/// region's conditioning once more with the leftover mask
/// `1 - Σ masks[1..]`, treated according to `policy`.
pub fn build_from_region_list(regions: &[Region], policy: LeftoverMaskPolicy) -> Result<Conditioning> {
    let (first, rest) = match regions {
        [first, rest @ ..] if !rest.is_empty() => (first, rest),
        _ => {
            return Err(CoupleError::invalid(
                "regions",
                format!("at least 2 regions are required, got {}", regions.len()),
            ))
        }
    };

    let expected = first.mask.dims();
    for (index, region) in regions.iter().enumerate() {
        if region.mask.dims() != expected {
            return Err(CoupleError::InconsistentRegionShapes {
                index,
                expected,
                found: region.mask.dims(),
            });
        }
        if region.conditioning.is_empty() {
            return Err(CoupleError::invalid(
                "regions",
                format!("region {} has an empty conditioning", index + 1),
            ));
        }
    }

    let (height, width) = expected;
    let mut leftover = SpatialMask::solid(1.0, width, height, first.mask.device())?;
    let mut combined =
        first
            .conditioning
            .set_mask(&first.mask, MaskSharing::Default, REGION_STRENGTH)?;
    for region in rest {
        leftover = leftover.subtract(&region.mask)?;
        let masked = region
            .conditioning
            .set_mask(&region.mask, MaskSharing::Default, REGION_STRENGTH)?;
        combined = combined.combine(&masked);
    }

    let leftover = match policy {
        LeftoverMaskPolicy::PassThrough => leftover,
        LeftoverMaskPolicy::ClampToZero => leftover.clamp_unit()?,
    };
    let base = first
        .conditioning
        .set_mask(&leftover, MaskSharing::Default, REGION_STRENGTH)?;
    Ok(combined.combine(&base))
}
