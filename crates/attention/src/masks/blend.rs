//! Normalised mask-weighted blending of per-region attention outputs.
//!
//! Raw region weights are divided by their per-position sum. Positions that
//! no region covers (sum exactly zero) are split evenly across all regions so
//! the blend never divides by zero.

use candle_core::{DType, Tensor};

use crate::core::{to_backend_err, AttentionError};
use crate::masks::MASK_DTYPE;

/// Blend weights `[regions, positions]` whose columns sum to one.
#[derive(Debug, Clone)]
pub struct BlendWeights {
    /// Normalised weights.
    pub weights: Tensor,
    /// Positions that fell back to an even split.
    pub uncovered: usize,
}

/// Normalise raw `[regions, positions]` weights column by column.
pub fn normalize_weights(raw: &Tensor) -> Result<BlendWeights, AttentionError> {
    let (regions, positions) = raw.dims2().map_err(|_| AttentionError::InvalidShape {
        context: format!(
            "blend weights must be [regions, positions], got {:?}",
            raw.dims()
        ),
    })?;
    if regions == 0 {
        return Err(AttentionError::InvalidShape {
            context: "blend needs at least one region".to_string(),
        });
    }

    let raw = raw.to_dtype(MASK_DTYPE).map_err(to_backend_err)?;
    let sum = raw.sum_keepdim(0).map_err(to_backend_err)?;
    let zero = sum
        .zeros_like()
        .and_then(|z| sum.eq(&z))
        .map_err(to_backend_err)?;
    let safe_sum = sum
        .ones_like()
        .and_then(|ones| zero.where_cond(&ones, &sum))
        .map_err(to_backend_err)?;
    let normalized = raw.broadcast_div(&safe_sum).map_err(to_backend_err)?;

    let even = Tensor::full(1f32 / regions as f32, (regions, positions), raw.device())
        .map_err(to_backend_err)?;
    let weights = zero
        .broadcast_as((regions, positions))
        .and_then(|z| z.where_cond(&even, &normalized))
        .map_err(to_backend_err)?;

    let uncovered = zero
        .to_dtype(DType::F32)
        .and_then(|z| z.sum_all())
        .and_then(|z| z.to_vec0::<f32>())
        .map_err(to_backend_err)? as usize;

    Ok(BlendWeights { weights, uncovered })
}

/// Weighted sum of per-region outputs `[batch, positions, channels]`.
///
/// `weights` is `[regions, positions]`; the blend runs in the outputs' dtype.
pub fn blend(outputs: &[Tensor], weights: &Tensor) -> Result<Tensor, AttentionError> {
    let (regions, positions) = weights.dims2().map_err(|_| AttentionError::InvalidShape {
        context: format!(
            "blend weights must be [regions, positions], got {:?}",
            weights.dims()
        ),
    })?;
    if outputs.len() != regions {
        return Err(AttentionError::InvalidShape {
            context: format!(
                "got {} region outputs for {regions} weight rows",
                outputs.len()
            ),
        });
    }
    let first = &outputs[0];
    let (_, seq, _) = first.dims3().map_err(|_| AttentionError::InvalidShape {
        context: format!(
            "region output must be [batch, seq, channels], got {:?}",
            first.dims()
        ),
    })?;
    if seq != positions {
        return Err(AttentionError::InvalidShape {
            context: format!("region output covers {seq} positions, weights cover {positions}"),
        });
    }
    if let Some(bad) = outputs.iter().find(|o| o.dims() != first.dims()) {
        return Err(AttentionError::InvalidShape {
            context: format!(
                "region outputs disagree: {:?} vs {:?}",
                first.dims(),
                bad.dims()
            ),
        });
    }

    let stacked = Tensor::stack(outputs, 0).map_err(to_backend_err)?;
    let w = weights
        .to_dtype(first.dtype())
        .and_then(|w| w.reshape((regions, 1, positions, 1)))
        .map_err(to_backend_err)?;
    stacked
        .broadcast_mul(&w)
        .and_then(|t| t.sum(0))
        .map_err(to_backend_err)
}
