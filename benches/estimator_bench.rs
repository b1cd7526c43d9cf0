use criterion::{black_box, criterion_group, criterion_main, Criterion};
use creditd::usage::estimator::{encoder_for, strip_model_prefix};

const PROMPT: &str = "The quick brown fox jumps over the lazy dog, repeated a few times to \
    give the tokenizer a realistic chat message to chew through during benchmarking runs.";

fn encoder_benchmark(c: &mut Criterion) {
    // warm the process-wide cache once so the steady-state benchmark
    // measures a cache hit, not the one-time tiktoken ranks load.
    encoder_for("gpt-4o", "gpt-4o");

    c.bench_function("encoder_for cache hit", |b| {
        b.iter(|| encoder_for(black_box("gpt-4o"), "gpt-4o"))
    });

    c.bench_function("encode_ordinary a realistic prompt", |b| {
        let encoder = encoder_for("gpt-4o", "gpt-4o");
        b.iter(|| encoder.encode_ordinary(black_box(PROMPT)).len())
    });

    c.bench_function("strip_model_prefix", |b| {
        b.iter(|| strip_model_prefix(black_box("azure/gpt-4o-mini"), black_box("azure/")))
    });
}

criterion_group!(benches, encoder_benchmark);
criterion_main!(benches);
