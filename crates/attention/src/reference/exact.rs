//! Reference attention kernel.
//!
//! The exact path prioritises numerical fidelity and mirrors the semantics
//! described by the [`Attention`](crate::core::Attention) trait.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};
use candle_nn::ops::softmax_last_dim;

use crate::core::{to_backend_err, Attention, AttentionError, Config, PrecisionPolicy};

/// Numerically stable, portable non-causal attention kernel.
#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    /// Construct a reference attention kernel.
    pub fn new() -> Self {
        Self {
            first_call: OnceLock::new(),
        }
    }
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init precision={:?} scale={:?} device={:?}",
                config.precision,
                config.scale,
                q.device().location()
            );
        }

        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(AttentionError::InvalidShape {
                context: "q, k, v must reside on the same device".to_string(),
            });
        }

        let dtype = q.dtype();
        if dtype != k.dtype() || dtype != v.dtype() {
            return Err(AttentionError::InvalidShape {
                context: "q, k, v must share the same dtype".to_string(),
            });
        }

        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }

        let (batch, heads, q_len, head_dim) =
            q.dims4().map_err(|_| AttentionError::InvalidShape {
                context: "q must have shape [batch, heads, seq_len, head_dim]".to_string(),
            })?;
        let (kb, kh, k_len, kd) = k.dims4().map_err(|_| AttentionError::InvalidShape {
            context: "k must have shape [batch, heads, seq_len, head_dim]".to_string(),
        })?;
        let (vb, vh, vk, vd) = v.dims4().map_err(|_| AttentionError::InvalidShape {
            context: "v must have shape [batch, heads, seq_len, head_dim]".to_string(),
        })?;

        if kb != batch || kh != heads || kd != head_dim {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "k shape mismatch: expected [{batch}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
                ),
            });
        }
        if vb != batch || vh != heads || vk != k_len || vd != head_dim {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "v shape mismatch: expected [{batch}, {heads}, {k_len}, {head_dim}] got [{vb}, {vh}, {vk}, {vd}]"
                ),
            });
        }
        if k_len == 0 {
            return Err(AttentionError::InvalidShape {
                context: "k and v must hold at least one token".to_string(),
            });
        }

        let work_dtype = match config.precision {
            PrecisionPolicy::ForceF32 => DType::F32,
            PrecisionPolicy::Inherit => dtype,
        };
        let q_work = q.to_dtype(work_dtype).map_err(to_backend_err)?;
        let k_work = k.to_dtype(work_dtype).map_err(to_backend_err)?;
        let v_work = v.to_dtype(work_dtype).map_err(to_backend_err)?;

        let merged = batch * heads;
        let q_view = q_work
            .contiguous()
            .and_then(|t| t.reshape((merged, q_len, head_dim)))
            .map_err(to_backend_err)?;
        let k_t = k_work
            .contiguous()
            .and_then(|t| t.reshape((merged, k_len, head_dim)))
            .and_then(|t| t.transpose(1, 2))
            .and_then(|t| t.contiguous())
            .map_err(to_backend_err)?;

        let scale = config
            .scale
            .unwrap_or_else(|| 1.0 / (head_dim as f32).sqrt());
        let scores = q_view
            .matmul(&k_t)
            .and_then(|s| s.affine(scale as f64, 0.0))
            .and_then(|s| s.reshape((batch, heads, q_len, k_len)))
            .map_err(to_backend_err)?;

        let scores = match mask {
            Some(mask) => {
                if !device.same_device(mask.device()) {
                    return Err(AttentionError::InvalidShape {
                        context: "mask must reside on the same device as q".to_string(),
                    });
                }
                let (mb, mh, mq, mk) = mask.dims4().map_err(|_| AttentionError::InvalidShape {
                    context: "mask must have shape [batch, heads|1, q_len, k_len]".to_string(),
                })?;
                if mb != batch || mq != q_len || mk != k_len {
                    return Err(AttentionError::InvalidShape {
                        context: format!(
                            "mask shape mismatch: expected [{batch}, 1|{heads}, {q_len}, {k_len}] got [{mb}, {mh}, {mq}, {mk}]"
                        ),
                    });
                }
                if mh != 1 && mh != heads {
                    return Err(AttentionError::InvalidShape {
                        context: format!("mask head dimension must be 1 or {heads}, got {mh}"),
                    });
                }
                let mask = mask.to_dtype(work_dtype).map_err(to_backend_err)?;
                scores.broadcast_add(&mask).map_err(to_backend_err)?
            }
            None => scores,
        };

        let probs = scores
            .reshape((merged, q_len, k_len))
            .and_then(|s| softmax_last_dim(&s))
            .map_err(to_backend_err)?;
        let v_view = v_work
            .contiguous()
            .and_then(|t| t.reshape((merged, k_len, head_dim)))
            .map_err(to_backend_err)?;
        let output = probs
            .matmul(&v_view)
            .and_then(|o| o.reshape((batch, heads, q_len, head_dim)))
            .map_err(to_backend_err)?;

        output.to_dtype(dtype).map_err(to_backend_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Result as CandleResult};

    fn build_inputs(device: &Device, k_len: usize) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let q_data: Vec<f32> = (0..64).map(|i| (i as f32) * 0.01).collect();
        let kv_data: Vec<f32> = (0..(16 * k_len)).map(|i| ((i % 13) as f32) * 0.07).collect();
        let q = Tensor::from_vec(q_data, (1, 2, 4, 8), device)?;
        let k = Tensor::from_vec(kv_data.clone(), (1, 2, k_len, 8), device)?;
        let v = Tensor::from_vec(kv_data, (1, 2, k_len, 8), device)?;
        Ok((q, k, v))
    }

    fn naive_attention(q: &Tensor, k: &Tensor, v: &Tensor) -> CandleResult<Tensor> {
        let (batch, heads, q_len, head_dim) = q.dims4()?;
        let (_, _, k_len, _) = k.dims4()?;
        let mut output = vec![0f32; batch * heads * q_len * head_dim];

        let q_vec = q.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let k_vec = k.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let v_vec = v.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let scale = 1.0 / (head_dim as f32).sqrt();

        for bh in 0..batch * heads {
            for q_idx in 0..q_len {
                let mut row = vec![0f32; k_len];
                let mut max_val = f32::NEG_INFINITY;
                for (k_idx, slot) in row.iter_mut().enumerate() {
                    let mut dot = 0f32;
                    for d in 0..head_dim {
                        let qi = (bh * q_len + q_idx) * head_dim + d;
                        let ki = (bh * k_len + k_idx) * head_dim + d;
                        dot += q_vec[qi] * k_vec[ki];
                    }
                    *slot = dot * scale;
                    max_val = max_val.max(*slot);
                }
                let mut denom = 0f32;
                for val in row.iter_mut() {
                    *val = (*val - max_val).exp();
                    denom += *val;
                }
                for d in 0..head_dim {
                    let mut acc = 0f32;
                    for (k_idx, weight) in row.iter().enumerate() {
                        let vi = (bh * k_len + k_idx) * head_dim + d;
                        acc += weight / denom * v_vec[vi];
                    }
                    output[(bh * q_len + q_idx) * head_dim + d] = acc;
                }
            }
        }

        Tensor::from_vec(output, (batch, heads, q_len, head_dim), q.device())
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> CandleResult<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_vec0::<f32>()
    }

    #[test]
    fn exact_attention_matches_naive() -> CandleResult<()> {
        let device = Device::Cpu;
        for k_len in [1usize, 3, 7] {
            let (q, k, v) = build_inputs(&device, k_len)?;
            let output = ExactAttention::new()
                .attend(&q, &k, &v, None, &Config::default())
                .unwrap();
            let expected = naive_attention(&q, &k, &v)?;
            assert!(max_abs_diff(&output, &expected)? < 1e-4, "k_len {k_len}");
        }
        Ok(())
    }

    #[test]
    fn additive_mask_removes_keys() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device, 2)?;
        // Drop the second key for every query: output equals v[..., 0, :].
        let mask = Tensor::from_vec(vec![0f32, f32::NEG_INFINITY], (1, 1, 1, 2), &device)?
            .broadcast_as((1, 1, 4, 2))?
            .contiguous()?;
        let out = ExactAttention::new()
            .attend(&q, &k, &v, Some(&mask), &Config::default())
            .unwrap();
        let first_value = v.narrow(2, 0, 1)?.broadcast_as((1, 2, 4, 8))?;
        assert!(max_abs_diff(&out, &first_value)? < 1e-6);
        Ok(())
    }

    #[test]
    fn mismatched_shapes_error() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((1, 2, 5, 8), DType::F32, &device).unwrap();
        let v = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let err = ExactAttention::new()
            .attend(&q, &k, &v, None, &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn mask_shape_validation() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let v = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let mask = Tensor::zeros((1, 3, 4, 4), DType::F32, &device).unwrap();
        let err = ExactAttention::new()
            .attend(&q, &k, &v, Some(&mask), &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn dtype_matrix() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device, 4)?;
        let reference = ExactAttention::new()
            .attend(&q, &k, &v, None, &Config::default())
            .unwrap();
        for dtype in [DType::F32, DType::BF16, DType::F16] {
            let out = ExactAttention::new()
                .attend(
                    &q.to_dtype(dtype)?,
                    &k.to_dtype(dtype)?,
                    &v.to_dtype(dtype)?,
                    None,
                    &Config::default(),
                )
                .unwrap();
            assert_eq!(out.dtype(), dtype);
            let max = max_abs_diff(&out, &reference)?;
            assert!(max < 5e-2, "dtype {dtype:?} diverged by {max}");
        }
        Ok(())
    }

    #[test]
    fn numerical_stability() {
        let device = Device::Cpu;
        let q = Tensor::full(10_000.0f32, (1, 1, 4, 4), &device).unwrap();
        let k = Tensor::full(-10_000.0f32, (1, 1, 4, 4), &device).unwrap();
        let v = Tensor::ones((1, 1, 4, 4), DType::F32, &device).unwrap();
        let out = ExactAttention::new()
            .attend(&q, &k, &v, None, &Config::default())
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(out.iter().all(|value| value.is_finite()));
    }
}
