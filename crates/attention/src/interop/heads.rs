//! Conversions between the packed host layout and the per-head kernel layout.
//!
//! Hosts pass attention operands as `[batch, seq_len, n_heads * head_dim]`.
//! Kernels implementing [`Attention`] expect `[batch, n_heads, seq_len,
//! head_dim]`. [`attend_packed`] performs the round trip around a kernel call.

use candle_core::Tensor;

use crate::core::{to_backend_err, Attention, AttentionError, Config};

/// Reshape `[batch, seq, heads * dim]` into `[batch, heads, seq, dim]`.
pub fn split_heads(tensor: &Tensor, heads: usize) -> Result<Tensor, AttentionError> {
    let (batch, seq, inner) = tensor.dims3().map_err(|_| AttentionError::InvalidShape {
        context: format!(
            "packed attention operand must be [batch, seq, inner], got {:?}",
            tensor.dims()
        ),
    })?;
    if heads == 0 || inner % heads != 0 {
        return Err(AttentionError::InvalidShape {
            context: format!("inner dimension {inner} is not divisible by {heads} heads"),
        });
    }
    tensor
        .reshape((batch, seq, heads, inner / heads))
        .and_then(|t| t.transpose(1, 2))
        .and_then(|t| t.contiguous())
        .map_err(to_backend_err)
}

/// Reshape `[batch, heads, seq, dim]` back into `[batch, seq, heads * dim]`.
pub fn merge_heads(tensor: &Tensor) -> Result<Tensor, AttentionError> {
    let (batch, heads, seq, dim) = tensor.dims4().map_err(|_| AttentionError::InvalidShape {
        context: format!(
            "per-head attention output must be [batch, heads, seq, dim], got {:?}",
            tensor.dims()
        ),
    })?;
    tensor
        .transpose(1, 2)
        .and_then(|t| t.contiguous())
        .and_then(|t| t.reshape((batch, seq, heads * dim)))
        .map_err(to_backend_err)
}

/// Runs `kernel` on packed operands and returns a packed output shaped like `q`.
pub fn attend_packed(
    kernel: &dyn Attention,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    heads: usize,
    config: &Config,
) -> Result<Tensor, AttentionError> {
    let q_heads = split_heads(q, heads)?;
    let k_heads = split_heads(k, heads)?;
    let v_heads = split_heads(v, heads)?;
    let out = kernel.attend(&q_heads, &k_heads, &v_heads, None, config)?;
    merge_heads(&out)
}
