//! Benchmarks for the hyperbolic update kernel.
//!
//! Run with: `cargo bench --bench step_bench`
//!
//! Times one full step (all passes) over periodic line meshes of
//! increasing size, with and without limiting, and the scalar loop
//! instantiation against the vectorized one.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use cg_rs::offline::line::{periodic_line_mesh, periodic_line_mesh_scalar};
use cg_rs::{
    Euler1D, HyperbolicKernel, KernelConfig, MultiComponentVector, NullCommunicator, OfflineData,
};

const GAMMA: f64 = 1.4;

fn initial(x: f64) -> [f64; 3] {
    let rho = 1.0 + 0.3 * x.sin();
    let u = 0.2 * x.cos();
    let p = 1.0 + 0.1 * (3.0 * x).sin();
    [rho, rho * u, p / (GAMMA - 1.0) + 0.5 * rho * u * u]
}

fn setup(offline: &OfflineData<1>, positions: &[f64]) -> MultiComponentVector<3> {
    let mut u = MultiComponentVector::<3>::new(offline.partitioner.clone());
    for (i, &x) in positions.iter().enumerate() {
        u.write_tensor(&initial(x), i);
    }
    u
}

fn bench_full_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_step");
    let euler = Euler1D::new(GAMMA);
    let comm = NullCommunicator;

    for n in [1024usize, 4096, 16384] {
        let (offline, positions) = periodic_line_mesh(n, 0.0, 2.0 * std::f64::consts::PI);
        let u = setup(&offline, &positions);
        let mut new_u = u.clone();
        let mut kernel = HyperbolicKernel::new(&euler, &offline, &comm, |x, _| initial(x[0]));

        group.bench_with_input(BenchmarkId::new("limited", n), &n, |b, _| {
            b.iter(|| {
                kernel
                    .step::<0>(black_box(&u), [], [], &mut new_u, 0.0)
                    .unwrap()
            });
        });
    }

    group.finish();
}

fn bench_low_order_only(c: &mut Criterion) {
    let mut group = c.benchmark_group("low_order_step");
    let euler = Euler1D::new(GAMMA);
    let comm = NullCommunicator;

    for n in [4096usize] {
        let (offline, positions) = periodic_line_mesh(n, 0.0, 2.0 * std::f64::consts::PI);
        let u = setup(&offline, &positions);
        let mut new_u = u.clone();
        let mut kernel = HyperbolicKernel::new(&euler, &offline, &comm, |x, _| initial(x[0]))
            .with_config(KernelConfig::default().with_limiter_iterations(0));

        group.bench_with_input(BenchmarkId::new("unlimited", n), &n, |b, _| {
            b.iter(|| {
                kernel
                    .step::<0>(black_box(&u), [], [], &mut new_u, 0.0)
                    .unwrap()
            });
        });
    }

    group.finish();
}

fn bench_scalar_vs_simd(c: &mut Criterion) {
    let mut group = c.benchmark_group("loop_instantiation");
    let euler = Euler1D::new(GAMMA);
    let comm = NullCommunicator;
    let n = 4096;

    let (aligned, positions) = periodic_line_mesh(n, 0.0, 2.0 * std::f64::consts::PI);
    let (scalar, _) = periodic_line_mesh_scalar(n, 0.0, 2.0 * std::f64::consts::PI);

    for (label, offline) in [("simd", &aligned), ("scalar", &scalar)] {
        let u = setup(offline, &positions);
        let mut new_u = u.clone();
        let mut kernel = HyperbolicKernel::new(&euler, offline, &comm, |x, _| initial(x[0]));

        group.bench_with_input(BenchmarkId::new(label, n), &n, |b, _| {
            b.iter(|| {
                kernel
                    .step::<0>(black_box(&u), [], [], &mut new_u, 0.0)
                    .unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_full_step,
    bench_low_order_only,
    bench_scalar_vs_simd
);
criterion_main!(benches);
