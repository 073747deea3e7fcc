//! One training step of a small classifier on each backend.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tandem_core::activation::{Sigmoid, SoftMax};
use tandem_core::layers::{Conv2d, FullyConnected};
use tandem_core::{Backend, CpuNetwork, GpuNetwork, LearningParams, Network, NetworkLayout};

fn digit_layout() -> NetworkLayout {
    NetworkLayout::new()
        .with_layer(Conv2d::new((28, 28), 1, (5, 5), false, 4, Sigmoid).unwrap())
        .unwrap()
        .with_layer(FullyConnected::new(24 * 24 * 4, 10, SoftMax::new()).unwrap())
        .unwrap()
}

fn prepare<B: Backend>(network: &mut Network<B>) {
    let mut rng = StdRng::seed_from_u64(0);
    network.initialize_weights(0).unwrap();
    for bi in 0..network.batch_size() {
        for ni in 0..28 * 28 {
            network.set_input(bi, ni, rng.gen()).unwrap();
        }
        network.set_target(bi, rng.gen_range(0..10), 1.0).unwrap();
    }
}

fn benchmark_learn_step(c: &mut Criterion) {
    // A subscriber may already be installed by the harness.
    let _ = tandem_tracing::init_global_tracing(&tandem_tracing::TracingConfig::from_env());
    let mut group = c.benchmark_group("learn_step");
    group.sample_size(10);
    let layout = Arc::new(digit_layout());
    let params = LearningParams::new(0.01, false);

    for batch_size in [1, 16] {
        group.bench_with_input(BenchmarkId::new("cpu", batch_size), &batch_size, |b, &n| {
            let mut network = CpuNetwork::new(Arc::clone(&layout), n).unwrap();
            prepare(&mut network);
            b.iter(|| black_box(network.learn(&params, true).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("gpu", batch_size), &batch_size, |b, &n| {
            let mut network = GpuNetwork::new(Arc::clone(&layout), n).unwrap();
            prepare(&mut network);
            b.iter(|| black_box(network.learn(&params, true).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_learn_step);
criterion_main!(benches);
