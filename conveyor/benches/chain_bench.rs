//! Benchmarks for chain dispatch overhead.

use conveyor::prelude::*;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn build_bare_chain() -> Chain<u64> {
    ChainBuilder::new("bare")
        .handle_fn(|message: u64, _cancel| async move {
            black_box(message);
            Ok(())
        })
        .expect("handler")
        .build()
        .expect("chain")
}

fn build_stacked_chain() -> Chain<u64> {
    ChainBuilder::new("stacked")
        .filter(|_message: &u64| true)
        .skip(0)
        .concurrent(64)
        .expect("concurrent")
        .keyed(|message: &u64| message % 8)
        .expect("keyed")
        .handle_fn(|message: u64, _cancel| async move {
            black_box(message);
            Ok(())
        })
        .expect("handler")
        .build()
        .expect("chain")
}

fn dispatch_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("runtime");

    let bare = runtime.block_on(async { build_bare_chain() });
    c.bench_function("dispatch_bare", |b| {
        b.iter(|| {
            runtime.block_on(async {
                bare.dispatch(black_box(42), CancelToken::new())
                    .await
                    .expect("dispatch")
            })
        })
    });

    let stacked = runtime.block_on(async { build_stacked_chain() });
    c.bench_function("dispatch_four_stages", |b| {
        b.iter(|| {
            runtime.block_on(async {
                stacked
                    .dispatch(black_box(42), CancelToken::new())
                    .await
                    .expect("dispatch")
            })
        })
    });
}

criterion_group!(benches, dispatch_benchmark);
criterion_main!(benches);
