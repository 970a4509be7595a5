//! Resampling of image-space masks onto attention feature grids.
//!
//! Resizing is separable: every output row and column is a weighted sum of
//! input rows and columns. [`MaskResample::Area`] averages the covered input
//! cells (adaptive average pooling), which avoids aliasing when a large mask
//! is reduced to a small feature map.

use std::str::FromStr;

use candle_core::Tensor;
use serde::Deserialize;

use crate::core::{to_backend_err, AttentionError};
use crate::masks::MASK_DTYPE;

/// Downsample rates tried when the full-resolution latent shape is known.
const DOWNSAMPLE_RATES: [usize; 7] = [1, 2, 4, 8, 16, 32, 64];

/// Interpolation used to map a mask onto a feature grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskResample {
    /// Nearest input cell (`floor(dst * in / out)`).
    Nearest,
    /// Bilinear with half-pixel centres and edge clamping.
    Bilinear,
    /// Mean over the input cells covered by each output cell.
    #[default]
    Area,
}

impl FromStr for MaskResample {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "nearest" => Ok(Self::Nearest),
            "bilinear" => Ok(Self::Bilinear),
            "area" => Ok(Self::Area),
            other => Err(format!("unknown mask resample mode '{other}'")),
        }
    }
}

/// Resize a `[height, width]` mask to `[out_h, out_w]`.
///
/// The result is always [`MASK_DTYPE`] and lives on the mask's device.
pub fn resize_mask(
    mask: &Tensor,
    out_h: usize,
    out_w: usize,
    mode: MaskResample,
) -> Result<Tensor, AttentionError> {
    let (in_h, in_w) = mask.dims2().map_err(|_| AttentionError::InvalidShape {
        context: format!("mask must be [height, width], got {:?}", mask.dims()),
    })?;
    if in_h == 0 || in_w == 0 || out_h == 0 || out_w == 0 {
        return Err(AttentionError::InvalidShape {
            context: format!("cannot resize mask {in_h}x{in_w} to {out_h}x{out_w}"),
        });
    }
    if (in_h, in_w) == (out_h, out_w) {
        return mask.to_dtype(MASK_DTYPE).map_err(to_backend_err);
    }

    let rows = mask
        .to_dtype(MASK_DTYPE)
        .and_then(|m| m.to_vec2::<f32>())
        .map_err(to_backend_err)?;
    let row_taps = axis_taps(in_h, out_h, mode);
    let col_taps = axis_taps(in_w, out_w, mode);

    let mut out = Vec::with_capacity(out_h * out_w);
    for taps_y in &row_taps {
        for taps_x in &col_taps {
            let mut acc = 0f32;
            for &(iy, wy) in taps_y {
                let row = &rows[iy];
                for &(ix, wx) in taps_x {
                    acc += wy * wx * row[ix];
                }
            }
            out.push(acc);
        }
    }
    Tensor::from_vec(out, (out_h, out_w), mask.device()).map_err(to_backend_err)
}

/// Per output index, the contributing input indices and their weights.
fn axis_taps(input: usize, output: usize, mode: MaskResample) -> Vec<Vec<(usize, f32)>> {
    (0..output)
        .map(|dst| match mode {
            MaskResample::Nearest => {
                let src = (dst * input / output).min(input - 1);
                vec![(src, 1.0)]
            }
            MaskResample::Bilinear => {
                let scale = input as f64 / output as f64;
                let src = ((dst as f64 + 0.5) * scale - 0.5).max(0.0);
                let lo = (src.floor() as usize).min(input - 1);
                let hi = (lo + 1).min(input - 1);
                let frac = (src - lo as f64).clamp(0.0, 1.0) as f32;
                if lo == hi || frac == 0.0 {
                    vec![(lo, 1.0)]
                } else {
                    vec![(lo, 1.0 - frac), (hi, frac)]
                }
            }
            MaskResample::Area => {
                let start = dst * input / output;
                let end = ((dst + 1) * input).div_ceil(output).max(start + 1);
                let weight = 1.0 / (end - start) as f32;
                (start..end).map(|src| (src, weight)).collect()
            }
        })
        .collect()
}

/// Recover the `(height, width)` feature grid an attention layer operates on.
///
/// When the full-resolution latent shape is known, the grid is the latent
/// shape divided (rounding up, as strided convolutions do) by the first
/// downsample rate whose area equals `seq_len`. Otherwise the mask aspect
/// ratio picks the divisor of `seq_len` closest to `sqrt(seq_len * H / W)`.
pub fn infer_feature_grid(
    seq_len: usize,
    mask_hw: (usize, usize),
    latent_hw: Option<(usize, usize)>,
) -> Result<(usize, usize), AttentionError> {
    if seq_len == 0 {
        return Err(AttentionError::InvalidShape {
            context: "attention query holds no positions".to_string(),
        });
    }

    if let Some((latent_h, latent_w)) = latent_hw {
        for rate in DOWNSAMPLE_RATES {
            let h = latent_h.div_ceil(rate);
            let w = latent_w.div_ceil(rate);
            if h * w == seq_len {
                return Ok((h, w));
            }
        }
    }

    let (mask_h, mask_w) = mask_hw;
    if mask_h == 0 || mask_w == 0 {
        return Err(AttentionError::InvalidShape {
            context: format!("mask {mask_h}x{mask_w} has no area"),
        });
    }
    let target = (seq_len as f64 * mask_h as f64 / mask_w as f64).sqrt();
    let best = (1..=seq_len)
        .filter(|h| seq_len % h == 0)
        .min_by(|a, b| {
            let da = (*a as f64 - target).abs();
            let db = (*b as f64 - target).abs();
            da.total_cmp(&db)
        });
    match best {
        Some(h) if ratio_close(h, seq_len / h, mask_h, mask_w) => Ok((h, seq_len / h)),
        _ => Err(AttentionError::InvalidShape {
            context: format!(
                "cannot map {seq_len} query positions onto a grid with aspect {mask_h}:{mask_w}"
            ),
        }),
    }
}

/// Accepts grids whose aspect ratio is within a factor of two of the mask's.
fn ratio_close(h: usize, w: usize, mask_h: usize, mask_w: usize) -> bool {
    let grid = h as f64 / w as f64;
    let mask = mask_h as f64 / mask_w as f64;
    let ratio = grid / mask;
    (0.5..=2.0).contains(&ratio)
}
