//! End-to-end benchmarks: forward latency and full generation.

use bitnet_runtime::inference::{GenerationParams, InferenceEngine, TextGenerator};
use bitnet_runtime::model::demo::{demo_model_bytes, DemoModelSpec};
use bitnet_runtime::{GenerateRequest, KernelConfig, ModelFile, RuntimeConfig, Session};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

fn demo_session(kernels: KernelConfig) -> Session {
    let spec = DemoModelSpec {
        hidden: 256,
        heads: 8,
        kv_heads: 4,
        layers: 4,
        ffn_dim: 512,
        vocab: 512,
        context_length: 1024,
        ..DemoModelSpec::default()
    };
    let file = ModelFile::from_bytes(demo_model_bytes(42, &spec).unwrap()).unwrap();
    let config = RuntimeConfig {
        kernels,
        ..RuntimeConfig::default()
    };
    Session::from_file(file, config).unwrap()
}

fn bench_full_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_generation");
    let session = demo_session(KernelConfig::default());

    for max_tokens in [8, 32, 64] {
        let req = GenerateRequest::new("The quick brown fox", max_tokens);
        group.bench_with_input(BenchmarkId::new("greedy", max_tokens), &req, |b, req| {
            b.iter(|| session.generate(req).unwrap());
        });
    }
    group.finish();
}

fn bench_forward_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward_latency");
    for (name, kernels) in [("default", KernelConfig::default()), ("strict", KernelConfig::strict())] {
        let session = demo_session(kernels);
        let engine: &InferenceEngine = session.engine();
        group.bench_function(BenchmarkId::new("step", name), |b| {
            let mut state = engine.new_state(1);
            b.iter(|| engine.forward(&mut state, 5, 0, true).unwrap());
        });
    }
    group.finish();
}

fn bench_prefill(c: &mut Criterion) {
    let mut group = c.benchmark_group("prefill");
    let session = demo_session(KernelConfig::default());
    let generator = TextGenerator::new(session.engine());
    let params = GenerationParams {
        max_tokens: 1,
        seed: 0,
        topk: 0,
    };
    for len in [4usize, 16, 64] {
        let prompt: Vec<i32> = (0..len as i32).map(|i| 3 + i % 90).collect();
        group.bench_with_input(BenchmarkId::new("tokens", len), &prompt, |b, prompt| {
            b.iter(|| generator.generate(prompt, params, None).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_full_generation, bench_forward_latency, bench_prefill);
criterion_main!(benches);
