use criterion::{black_box, criterion_group, criterion_main, Criterion};
use creditd::config::CreditConfig;
use creditd::pricing::{resolve, ModelInfo, ModelPrice};
use rust_decimal::Decimal;

fn lookup(model_id: &str) -> Option<ModelInfo> {
    match model_id {
        "gpt-4o-mini-finetuned" => Some(ModelInfo {
            id: model_id.to_string(),
            base_model_id: Some("gpt-4o-mini".to_string()),
            price: None,
        }),
        "gpt-4o-mini" => Some(ModelInfo {
            id: model_id.to_string(),
            base_model_id: Some("gpt-4o".to_string()),
            price: None,
        }),
        "gpt-4o" => Some(ModelInfo {
            id: model_id.to_string(),
            base_model_id: None,
            price: Some(ModelPrice {
                prompt_price: Some(Decimal::new(250, 2)),
                completion_price: Some(Decimal::new(1000, 2)),
                request_price: None,
                minimum_credit: None,
            }),
        }),
        _ => None,
    }
}

fn resolve_benchmark(c: &mut Criterion) {
    let config = CreditConfig::default();

    c.bench_function("resolve direct price", |b| {
        b.iter(|| resolve(&config, black_box("gpt-4o"), lookup))
    });

    c.bench_function("resolve through inheritance chain", |b| {
        b.iter(|| resolve(&config, black_box("gpt-4o-mini-finetuned"), lookup))
    });

    c.bench_function("resolve unknown model falls back to defaults", |b| {
        b.iter(|| resolve(&config, black_box("no-such-model"), lookup))
    });
}

criterion_group!(benches, resolve_benchmark);
criterion_main!(benches);
