use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use fluidtrail::{
    CpuBackend, FieldKind, FramePlan, Impulse, SolverConfig, SolverPipeline,
};
use glam::Vec2;

const DT: f32 = 1.0 / 60.0;

fn pipeline(config: &SolverConfig) -> SolverPipeline<CpuBackend> {
    SolverPipeline::new(CpuBackend::new(), config).unwrap()
}

fn stir() -> Option<Impulse> {
    Some(Impulse::new(Vec2::new(1.0, 0.0), Vec2::splat(0.5), 4.0))
}

fn benchmark_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("simulation_step");
    let config = SolverConfig {
        lod: 0,
        ..SolverConfig::default()
    };

    // Test different grid sizes
    for size in [64u32, 128, 256].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut solver = pipeline(&config);
            solver.step((size, size), DT, stir()).unwrap();

            b.iter(|| {
                black_box(solver.step((size, size), DT, stir()).unwrap());
            });
        });
    }
    group.finish();
}

fn benchmark_full_scenario(c: &mut Criterion) {
    c.bench_function("full_128x128_20steps", |b| {
        let config = SolverConfig {
            lod: 0,
            ..SolverConfig::default()
        };
        b.iter(|| {
            let mut solver = pipeline(&config);
            for _ in 0..20 {
                black_box(solver.step((128, 128), DT, stir()).unwrap());
            }
        });
    });
}

fn benchmark_stages(c: &mut Criterion) {
    let mut group = c.benchmark_group("stages");
    let config = SolverConfig {
        lod: 0,
        ..SolverConfig::default()
    };

    // Run a few frames to get realistic state
    let mut solver = pipeline(&config);
    for _ in 0..5 {
        solver.step((128, 128), DT, stir()).unwrap();
    }
    let FramePlan::Run(frame) = solver.prepare((128, 128), DT).unwrap() else {
        panic!("128x128 frame should run");
    };

    group.bench_function("project", |b| {
        b.iter(|| black_box(solver.project(&frame)));
    });

    group.bench_function("advect_density", |b| {
        b.iter(|| solver.advect(FieldKind::Density, &frame));
    });

    group.bench_function("diffuse_velocity", |b| {
        b.iter(|| solver.diffuse(FieldKind::Velocity, &frame));
    });

    group.bench_function("draw", |b| {
        b.iter(|| solver.draw(&frame));
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_step,
    benchmark_full_scenario,
    benchmark_stages
);
criterion_main!(benches);
