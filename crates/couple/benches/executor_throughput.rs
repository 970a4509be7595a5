use std::sync::Arc;

use attention::reference::ExactAttention;
use attention::{AttentionKind, BatchChunk, ExtraOptions};
use candle_core::{Device, Tensor};
use conditioning::Conditioning;
use couple::{build_from_split, AttentionPatchContext, CoupleSettings, CouplePatch, Orientation};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use model::AttentionPatch;

const HEADS: usize = 8;
const HEAD_DIM: usize = 40;
const CONTEXT_DIM: usize = 768;
const TOKENS: usize = 77;

fn conditioning(device: &Device) -> Conditioning {
    let embedding = Tensor::randn(0f32, 1.0, (1, TOKENS, CONTEXT_DIM), device).expect("embedding");
    Conditioning::from_embedding(embedding).expect("conditioning")
}

fn bench_executor(c: &mut Criterion) {
    let device = Device::Cpu;
    let positive = build_from_split(
        &conditioning(&device),
        &conditioning(&device),
        Orientation::Horizontal,
        0.5,
        512,
        512,
    )
    .expect("split");
    let context = Arc::new(
        AttentionPatchContext::from_conditioning(&positive, &conditioning(&device), &CoupleSettings::default())
            .expect("context"),
    );
    let kernel = ExactAttention::new();
    let hidden = HEADS * HEAD_DIM;

    for kind in [AttentionKind::SelfAttention, AttentionKind::CrossAttention] {
        let mut group = c.benchmark_group(format!("couple/{kind}"));
        let patch = CouplePatch::new(Arc::clone(&context), kind);
        // Feature grids of a 64x64 latent at rates 8, 4 and 2.
        for side in [8usize, 16, 32] {
            let seq = side * side;
            let q = Tensor::randn(0f32, 1.0, (2, seq, hidden), &device).expect("query");
            let kv = match kind {
                AttentionKind::SelfAttention => q.clone(),
                AttentionKind::CrossAttention => {
                    Tensor::randn(0f32, 1.0, (2, context.total_tokens(), hidden), &device).expect("context")
                }
            };
            let options = ExtraOptions {
                kind,
                layer: 0,
                heads: HEADS,
                cond_or_uncond: vec![BatchChunk::Cond, BatchChunk::Uncond],
                latent_shape: Some((64, 64)),
            };

            group.throughput(Throughput::Elements((2 * seq * hidden) as u64));
            group.bench_with_input(BenchmarkId::new("attend", seq), &(q, kv), |b, (q, kv)| {
                b.iter(|| {
                    let out = patch
                        .attend(black_box(q), kv, kv, &options, &kernel)
                        .expect("attend");
                    black_box(out);
                });
            });
        }
        group.finish();
    }
}

criterion_group!(benches, bench_executor);
criterion_main!(benches);
