//! Masked multi-region attention, run inside every patched attention call.
//!
//! For `Cond` batch chunks each region attends on its own (cross-attention
//! slices the key/value tokens per region, self-attention reuses the shared
//! operands) and the per-region outputs are blended with the region masks
//! resized onto the layer's feature grid. `Uncond` chunks attend to the
//! negative segment only and are never blended.

use std::sync::Arc;

use attention::interop::attend_packed;
use attention::masks::{blend, infer_feature_grid, normalize_weights, resize_mask, BlendWeights};
use attention::{to_backend_err, Attention, AttentionError, AttentionKind, BatchChunk, ExtraOptions};
use candle_core::{Device, Tensor};
use model::AttentionPatch;

use crate::install::{AttentionPatchContext, RegionMask};

/// Interception function registered on one attention site.
#[derive(Debug, Clone)]
pub struct CouplePatch {
    context: Arc<AttentionPatchContext>,
    kind: AttentionKind,
}

impl CouplePatch {
    pub fn new(context: Arc<AttentionPatchContext>, kind: AttentionKind) -> Self {
        Self { context, kind }
    }

    pub fn kind(&self) -> AttentionKind {
        self.kind
    }

    pub fn context(&self) -> &AttentionPatchContext {
        &self.context
    }

    /// Normalised `[regions, seq]` blend weights for a layer with `seq`
    /// query positions.
    pub fn region_weights(
        &self,
        seq: usize,
        options: &ExtraOptions,
        device: &Device,
    ) -> Result<BlendWeights, AttentionError> {
        let ctx = &self.context;
        let grid = match ctx.mask_hw() {
            Some(mask_hw) => Some(infer_feature_grid(seq, mask_hw, options.latent_shape)?),
            None => None,
        };

        let mut rows = Vec::with_capacity(ctx.regions().len());
        for region in ctx.regions() {
            let row = match (&region.mask, grid) {
                (RegionMask::Spatial(mask), Some((h, w))) => resize_mask(mask, h, w, ctx.resample())?
                    .to_device(device)
                    .and_then(|m| m.flatten_all())
                    .and_then(|m| m.affine(region.strength as f64, 0.0)),
                _ => Tensor::full(region.strength, seq, device),
            }
            .map_err(to_backend_err)?;
            rows.push(row);
        }
        let raw = Tensor::stack(&rows, 0).map_err(to_backend_err)?;
        let weights = normalize_weights(&raw)?;

        if weights.uncovered > 0 {
            log::debug!(
                "layer{}.{}: {} of {seq} positions uncovered, splitting evenly",
                options.layer,
                options.kind,
                weights.uncovered
            );
        }
        log::debug!(
            "layer{}.{}: seq={seq} grid={:?} regions={}",
            options.layer,
            options.kind,
            grid,
            rows.len()
        );
        Ok(weights)
    }

    fn attend_cond(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        options: &ExtraOptions,
        weights: &BlendWeights,
        kernel: &dyn Attention,
    ) -> Result<Tensor, AttentionError> {
        let config = self.context.attention_config();
        let outputs = match self.kind {
            AttentionKind::SelfAttention => (0..self.context.regions().len())
                .map(|_| attend_packed(kernel, q, k, v, options.heads, config))
                .collect::<Result<Vec<_>, _>>()?,
            AttentionKind::CrossAttention => self
                .context
                .region_segments()
                .into_iter()
                .map(|(start, len)| {
                    let k_r = k.narrow(1, start, len).map_err(to_backend_err)?;
                    let v_r = v.narrow(1, start, len).map_err(to_backend_err)?;
                    attend_packed(kernel, q, &k_r, &v_r, options.heads, config)
                })
                .collect::<Result<Vec<_>, _>>()?,
        };
        blend(&outputs, &weights.weights)
    }

    fn attend_uncond(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        options: &ExtraOptions,
        kernel: &dyn Attention,
    ) -> Result<Tensor, AttentionError> {
        let config = self.context.attention_config();
        match self.kind {
            AttentionKind::SelfAttention => attend_packed(kernel, q, k, v, options.heads, config),
            AttentionKind::CrossAttention => {
                let (start, len) = self.context.negative_segment();
                let k_n = k.narrow(1, start, len).map_err(to_backend_err)?;
                let v_n = v.narrow(1, start, len).map_err(to_backend_err)?;
                attend_packed(kernel, q, &k_n, &v_n, options.heads, config)
            }
        }
    }
}

impl AttentionPatch for CouplePatch {
    fn prepare_context(
        &self,
        context: &Tensor,
        _options: &ExtraOptions,
    ) -> Result<Tensor, AttentionError> {
        let (batch, _, dim) = context.dims3().map_err(|_| AttentionError::InvalidShape {
            context: format!("context must be [batch, tokens, dim], got {:?}", context.dims()),
        })?;
        if dim != self.context.embedding_dim() {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "context width {dim} does not match region embeddings ({})",
                    self.context.embedding_dim()
                ),
            });
        }
        let total = self.context.total_tokens();
        self.context
            .context_embedding()
            .to_device(context.device())
            .and_then(|c| c.to_dtype(context.dtype()))
            .and_then(|c| c.broadcast_as((batch, total, dim)))
            .and_then(|c| c.contiguous())
            .map_err(to_backend_err)
    }

    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        options: &ExtraOptions,
        kernel: &dyn Attention,
    ) -> Result<Tensor, AttentionError> {
        if options.kind != self.kind {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "patch for {} invoked as {}",
                    self.kind.module_name(),
                    options.kind.module_name()
                ),
            });
        }
        let (batch, seq, _) = q.dims3().map_err(|_| AttentionError::InvalidShape {
            context: format!("query must be [batch, seq, heads * dim], got {:?}", q.dims()),
        })?;
        if self.kind == AttentionKind::CrossAttention {
            let kv_len = k.dims().get(1).copied().unwrap_or(0);
            if kv_len != self.context.total_tokens() {
                return Err(AttentionError::InvalidShape {
                    context: format!(
                        "key/value hold {kv_len} tokens, regions plus negative hold {}",
                        self.context.total_tokens()
                    ),
                });
            }
        }

        let chunk = options.chunk_size(batch)?;
        let weights = if options.cond_or_uncond.contains(&BatchChunk::Cond) {
            Some(self.region_weights(seq, options, q.device())?)
        } else {
            None
        };

        let mut outputs = Vec::with_capacity(options.cond_or_uncond.len());
        for (index, branch) in options.cond_or_uncond.iter().enumerate() {
            let rows = |t: &Tensor| t.narrow(0, index * chunk, chunk).map_err(to_backend_err);
            let (q_c, k_c, v_c) = (rows(q)?, rows(k)?, rows(v)?);
            let out = match (branch, &weights) {
                (BatchChunk::Cond, Some(weights)) => {
                    self.attend_cond(&q_c, &k_c, &v_c, options, weights, kernel)?
                }
                _ => self.attend_uncond(&q_c, &k_c, &v_c, options, kernel)?,
            };
            outputs.push(out);
        }
        Tensor::cat(&outputs, 0).map_err(to_backend_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regions::{build_from_region_list, build_from_split, LeftoverMaskPolicy, Orientation, Region};
    use crate::settings::CoupleSettings;
    use attention::reference::ExactAttention;
    use attention::Config;
    use candle_core::{DType, IndexOp};
    use conditioning::{Conditioning, SpatialMask};
    use std::sync::Mutex;

    const HEADS: usize = 2;
    const DIM: usize = 8;

    /// Records `[batch, heads, seq, head_dim]` operands before delegating.
    #[derive(Default)]
    struct RecordingKernel {
        calls: Mutex<Vec<(Tensor, Tensor, Tensor)>>,
        inner: ExactAttention,
    }

    impl RecordingKernel {
        fn calls(&self) -> Vec<(Tensor, Tensor, Tensor)> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }
    }

    impl Attention for RecordingKernel {
        fn attend(
            &self,
            q: &Tensor,
            k: &Tensor,
            v: &Tensor,
            mask: Option<&Tensor>,
            config: &Config,
        ) -> Result<Tensor, AttentionError> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((q.clone(), k.clone(), v.clone()));
            }
            self.inner.attend(q, k, v, mask, config)
        }
    }

    fn cond(tokens: usize) -> anyhow::Result<Conditioning> {
        Ok(Conditioning::from_embedding(Tensor::randn(
            0f32,
            1.0,
            (1, tokens, DIM),
            &Device::Cpu,
        )?)?)
    }

    fn options(kind: AttentionKind, chunks: Vec<BatchChunk>, latent: (usize, usize)) -> ExtraOptions {
        ExtraOptions {
            kind,
            layer: 0,
            heads: HEADS,
            cond_or_uncond: chunks,
            latent_shape: Some(latent),
        }
    }

    fn patch(positive: &Conditioning, negative: &Conditioning, kind: AttentionKind) -> anyhow::Result<CouplePatch> {
        let ctx = AttentionPatchContext::from_conditioning(positive, negative, &CoupleSettings::default())?;
        Ok(CouplePatch::new(Arc::new(ctx), kind))
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> anyhow::Result<f32> {
        Ok(a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_vec0::<f32>()?)
    }

    #[test]
    fn cross_attention_slices_tokens_per_region() -> anyhow::Result<()> {
        let mask = SpatialMask::solid(1.0, 8, 8, &Device::Cpu)?;
        let positive = cond(3)?
            .set_mask(&mask, conditioning::MaskSharing::Default, 1.0)?
            .combine(&cond(5)?);
        let negative = cond(4)?;
        let couple = patch(&positive, &negative, AttentionKind::CrossAttention)?;
        let opts = options(
            AttentionKind::CrossAttention,
            vec![BatchChunk::Cond, BatchChunk::Uncond],
            (8, 8),
        );

        let context = couple.prepare_context(&Tensor::zeros((2, 77, DIM), DType::F32, &Device::Cpu)?, &opts)?;
        assert_eq!(context.dims(), &[2, 12, DIM]);
        let total = couple.context().total_tokens();
        let segments: usize = couple.context().region_segments().iter().map(|(_, len)| len).sum();
        assert_eq!(segments + couple.context().negative_tokens(), total);

        let q = Tensor::randn(0f32, 1.0, (2, 64, HEADS * 4), &Device::Cpu)?;
        let kv = Tensor::randn(0f32, 1.0, (2, total, HEADS * 4), &Device::Cpu)?;
        let kernel = RecordingKernel::default();
        let out = couple.attend(&q, &kv, &kv, &opts, &kernel)?;
        assert_eq!(out.dims(), q.dims());

        let key_lens: Vec<usize> = kernel.calls().iter().map(|(_, k, _)| k.dims()[2]).collect();
        assert_eq!(key_lens, vec![3, 5, 4]);

        let short = kv.narrow(1, 0, total - 1)?;
        assert!(couple.attend(&q, &short, &short, &opts, &kernel).is_err());
        Ok(())
    }

    #[test]
    fn self_attention_reuses_identical_operands() -> anyhow::Result<()> {
        let positive = build_from_split(&cond(2)?, &cond(3)?, Orientation::Horizontal, 0.5, 64, 64)?;
        let couple = patch(&positive, &cond(2)?, AttentionKind::SelfAttention)?;
        let opts = options(AttentionKind::SelfAttention, vec![BatchChunk::Cond], (8, 8));

        let x = Tensor::randn(0f32, 1.0, (1, 64, HEADS * 4), &Device::Cpu)?;
        let kernel = RecordingKernel::default();
        let out = couple.attend(&x, &x, &x, &opts, &kernel)?;

        let calls = kernel.calls();
        assert_eq!(calls.len(), 2);
        for (q, k, v) in &calls[1..] {
            assert_eq!(max_abs_diff(q, &calls[0].0)?, 0.0);
            assert_eq!(max_abs_diff(k, &calls[0].1)?, 0.0);
            assert_eq!(max_abs_diff(v, &calls[0].2)?, 0.0);
        }
        let plain = attend_packed(&ExactAttention::new(), &x, &x, &x, HEADS, &Config::default())?;
        assert!(max_abs_diff(&out, &plain)? < 1e-5);
        Ok(())
    }

    #[test]
    fn horizontal_split_selects_region_per_column() -> anyhow::Result<()> {
        let positive = build_from_split(&cond(2)?, &cond(3)?, Orientation::Horizontal, 0.5, 512, 512)?;
        let negative = cond(4)?;
        let couple = patch(&positive, &negative, AttentionKind::CrossAttention)?;
        let opts = options(
            AttentionKind::CrossAttention,
            vec![BatchChunk::Cond, BatchChunk::Uncond],
            (64, 64),
        );

        // 8x8 grid: the layer runs at 1/8 of a 64x64 latent.
        let q = Tensor::randn(0f32, 1.0, (2, 64, HEADS * 4), &Device::Cpu)?;
        let kv = Tensor::randn(0f32, 1.0, (2, 9, HEADS * 4), &Device::Cpu)?;
        let out = couple.attend(&q, &kv, &kv, &opts, &ExactAttention::new())?;

        let exact = ExactAttention::new();
        let config = Config::default();
        let q_cond = q.i(0..1)?;
        let kv_cond = kv.i(0..1)?;
        let left = attend_packed(&exact, &q_cond, &kv_cond.narrow(1, 0, 2)?, &kv_cond.narrow(1, 0, 2)?, HEADS, &config)?;
        let right = attend_packed(&exact, &q_cond, &kv_cond.narrow(1, 2, 3)?, &kv_cond.narrow(1, 2, 3)?, HEADS, &config)?;
        let negative_out = attend_packed(
            &exact,
            &q.i(1..2)?,
            &kv.i(1..2)?.narrow(1, 5, 4)?,
            &kv.i(1..2)?.narrow(1, 5, 4)?,
            HEADS,
            &config,
        )?;

        let cond_out = out.i(0)?;
        for pos in 0..64 {
            let expected = if pos % 8 < 4 { left.i((0, pos))? } else { right.i((0, pos))? };
            assert!(max_abs_diff(&cond_out.i(pos)?, &expected)? < 1e-5, "position {pos}");
        }
        assert!(max_abs_diff(&out.i(1..2)?, &negative_out)? < 1e-5);
        Ok(())
    }

    #[test]
    fn partition_list_matches_first_region_inside_its_mask() -> anyhow::Result<()> {
        let column_mask = |cols: std::ops::Range<usize>| -> anyhow::Result<SpatialMask> {
            let data: Vec<f32> = (0..16 * 24)
                .map(|i| if cols.contains(&(i % 24)) { 1.0 } else { 0.0 })
                .collect();
            Ok(SpatialMask::new(Tensor::from_vec(data, (16, 24), &Device::Cpu)?)?)
        };
        let regions = vec![
            Region::new(cond(2)?, column_mask(0..8)?),
            Region::new(cond(3)?, column_mask(8..16)?),
            Region::new(cond(4)?, column_mask(16..24)?),
        ];
        let positive = build_from_region_list(&regions, LeftoverMaskPolicy::PassThrough)?;
        let couple = patch(&positive, &cond(1)?, AttentionKind::CrossAttention)?;
        let opts = options(AttentionKind::CrossAttention, vec![BatchChunk::Cond], (4, 6));

        // Total tokens: 2 + 3 + 4 + 2 (leftover copy of region 1) + 1.
        let q = Tensor::randn(0f32, 1.0, (1, 24, HEADS * 4), &Device::Cpu)?;
        let kv = Tensor::randn(0f32, 1.0, (1, 12, HEADS * 4), &Device::Cpu)?;
        let out = couple.attend(&q, &kv, &kv, &opts, &ExactAttention::new())?;

        let exact = ExactAttention::new();
        let config = Config::default();
        let own = attend_packed(&exact, &q, &kv.narrow(1, 0, 2)?, &kv.narrow(1, 0, 2)?, HEADS, &config)?;
        let leftover = attend_packed(&exact, &q, &kv.narrow(1, 9, 2)?, &kv.narrow(1, 9, 2)?, HEADS, &config)?;
        let expected = own.add(&leftover)?.affine(0.5, 0.0)?;
        for pos in (0..24).filter(|p| p % 6 < 2) {
            assert!(max_abs_diff(&out.i((0, pos))?, &expected.i((0, pos))?)? < 1e-5, "position {pos}");
        }
        Ok(())
    }

    #[test]
    fn weights_sum_to_one_including_uncovered_positions() -> anyhow::Result<()> {
        let empty = SpatialMask::solid(0.0, 8, 8, &Device::Cpu)?;
        let half = SpatialMask::new(Tensor::from_vec(
            (0..64).map(|i| if i < 32 { 0.5f32 } else { 0.0 }).collect::<Vec<_>>(),
            (8, 8),
            &Device::Cpu,
        )?)?;
        let positive = cond(1)?
            .set_mask(&empty, conditioning::MaskSharing::Default, 1.0)?
            .combine(&cond(1)?.set_mask(&half, conditioning::MaskSharing::Default, 1.0)?);
        let couple = patch(&positive, &cond(1)?, AttentionKind::SelfAttention)?;
        let opts = options(AttentionKind::SelfAttention, vec![BatchChunk::Cond], (8, 8));

        let weights = couple.region_weights(64, &opts, &Device::Cpu)?;
        assert_eq!(weights.uncovered, 32);
        let sums = weights.weights.sum(0)?.to_vec1::<f32>()?;
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-6));
        let first = weights.weights.i(0)?.to_vec1::<f32>()?;
        assert_eq!(first[0], 0.0);
        assert_eq!(first[63], 0.5);
        Ok(())
    }

    #[test]
    fn rejects_mismatched_invocation() -> anyhow::Result<()> {
        let couple = patch(&cond(2)?, &cond(2)?, AttentionKind::SelfAttention)?;
        let x = Tensor::zeros((3, 4, HEADS * 4), DType::F32, &Device::Cpu)?;
        let kernel = ExactAttention::new();
        let cross = options(AttentionKind::CrossAttention, vec![BatchChunk::Cond], (2, 2));
        assert!(couple.attend(&x, &x, &x, &cross, &kernel).is_err());
        let uneven = options(AttentionKind::SelfAttention, vec![BatchChunk::Cond, BatchChunk::Uncond], (2, 2));
        assert!(couple.attend(&x, &x, &x, &uneven, &kernel).is_err());
        Ok(())
    }
}
