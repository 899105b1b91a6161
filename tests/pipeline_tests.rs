#![cfg(feature = "cpu")]

use std::time::{Duration, Instant};

use fluidtrail::{
    BufferRole, CpuBackend, FieldKind, FieldMetrics, FluidError, FrameClock, FrameOutcome,
    FrameParams, FramePlan, GridSize, GridTexture, HostTexture, Impulse, SampleFormat,
    SkipReason, SolverConfig, SolverPipeline,
};
use glam::{Vec2, Vec4};

fn config() -> SolverConfig {
    SolverConfig {
        lod: 0,
        ..SolverConfig::default()
    }
}

/// No diffusion, unit gains: every stage except the one under test is exact.
fn inviscid() -> SolverConfig {
    SolverConfig {
        lod: 0,
        density_gain: 1.0,
        velocity_gain: 1.0,
        diffusion_rate: 0.0,
        viscosity: 0.0,
        ..SolverConfig::default()
    }
}

fn pipeline(config: &SolverConfig) -> SolverPipeline<CpuBackend> {
    SolverPipeline::new(CpuBackend::new(), config).unwrap()
}

fn frame(pipeline: &mut SolverPipeline<CpuBackend>, viewport: (u32, u32), dt: f32) -> FrameParams {
    match pipeline.prepare(viewport, dt).unwrap() {
        FramePlan::Run(frame) => frame,
        FramePlan::Skip(reason) => panic!("frame unexpectedly skipped: {reason:?}"),
    }
}

fn scalar_field(size: GridSize, f: impl Fn(u32, u32) -> f32) -> HostTexture {
    HostTexture::from_fn(size, SampleFormat::R32Float, |x, y| Vec4::splat(f(x, y))).unwrap()
}

fn vector_field(size: GridSize, f: impl Fn(u32, u32) -> Vec2) -> HostTexture {
    HostTexture::from_fn(size, SampleFormat::Rg32Float, |x, y| {
        f(x, y).extend(0.0).extend(0.0)
    })
    .unwrap()
}

#[test]
fn test_resize_to_same_size_allocates_once() {
    let mut solver = pipeline(&config());

    solver.prepare((8, 8), 0.1).unwrap();
    let after_first = solver.backend().allocations();
    assert_eq!(after_first, 10, "every field buffer should be allocated once");
    assert_eq!(solver.fields().generation(), 1);

    solver.prepare((8, 8), 0.1).unwrap();
    assert_eq!(
        solver.backend().allocations(),
        after_first,
        "same size must not reallocate"
    );
    assert_eq!(solver.fields().generation(), 1);

    solver.prepare((16, 8), 0.1).unwrap();
    assert_eq!(solver.backend().allocations(), 20);
    assert_eq!(solver.fields().generation(), 2);
    assert_eq!(solver.grid(), GridSize::new(16, 8));
}

#[test]
fn test_reallocated_fields_are_cleared() {
    let mut solver = pipeline(&config());
    solver.prepare((8, 8), 0.1).unwrap();
    solver
        .write_field(FieldKind::Density, &scalar_field(GridSize::new(8, 8), |_, _| 1.0))
        .unwrap();
    assert_eq!(solver.read_buffer(BufferRole::Density).unwrap().sum().x, 64.0);

    solver.prepare((4, 4), 0.1).unwrap();
    let density = solver.read_buffer(BufferRole::Density).unwrap();
    assert_eq!(density.size(), GridSize::new(4, 4));
    assert_eq!(density.sum().x, 0.0, "new buffers should start at zero");
    let velocity = solver.read_buffer(BufferRole::Velocity).unwrap();
    assert_eq!(velocity.sum().truncate().truncate(), Vec2::ZERO);
}

#[test]
fn test_zero_viewport_skips_frame() {
    let mut solver = pipeline(&config());
    let outcome = solver.step((0, 10), 0.1, None).unwrap();
    assert_eq!(outcome, FrameOutcome::Skipped(SkipReason::ZeroArea));
    assert_eq!(solver.backend().allocations(), 0);
    assert!(solver.visualization().is_none());
    assert_eq!(solver.frames(), 0);

    // lod can collapse a tiny viewport as well
    let mut coarse = pipeline(&SolverConfig::default());
    let outcome = coarse.step((1, 1), 0.1, None).unwrap();
    assert_eq!(outcome, FrameOutcome::Skipped(SkipReason::ZeroArea));
}

#[test]
fn test_lod_downsamples_viewport() {
    let config = SolverConfig {
        lod: 2,
        ..SolverConfig::default()
    };
    let mut solver = pipeline(&config);
    let outcome = solver.step((64, 32), 0.1, None).unwrap();
    assert_eq!(
        outcome,
        FrameOutcome::Completed {
            grid: GridSize::new(16, 8),
            injected: false
        }
    );
    assert_eq!(solver.visualization().map(|v| v.size()), Some(GridSize::new(16, 8)));
}

#[test]
fn test_degenerate_workgroup_skips_frame() {
    let mut solver = SolverPipeline::new(CpuBackend::with_workgroup([0, 8]), &config()).unwrap();
    let outcome = solver.step((8, 8), 0.1, None).unwrap();
    assert_eq!(outcome, FrameOutcome::Skipped(SkipReason::DegenerateDispatch));
    assert_eq!(solver.backend().allocations(), 0);
}

#[test]
fn test_advect_with_zero_velocity_is_identity() {
    let mut solver = pipeline(&config());
    let frame = frame(&mut solver, (6, 5), 0.5);
    let pattern = scalar_field(frame.grid(), |x, y| x as f32 + 10.0 * y as f32);
    solver.write_field(FieldKind::Density, &pattern).unwrap();

    solver.advect(FieldKind::Density, &frame);

    assert_eq!(solver.read_buffer(BufferRole::Density).unwrap(), pattern);
}

#[test]
fn test_diffuse_with_zero_rate_is_identity() {
    let mut solver = pipeline(&inviscid());
    let frame = frame(&mut solver, (7, 7), 0.25);
    assert_eq!(frame.density_a, 0.0);
    let pattern = scalar_field(frame.grid(), |x, y| ((x * 3 + y * 5) % 7) as f32 * 0.125);
    solver.write_field(FieldKind::Density, &pattern).unwrap();

    solver.diffuse(FieldKind::Density, &frame);

    assert_eq!(solver.read_buffer(BufferRole::Density).unwrap(), pattern);
}

#[test]
fn test_diffuse_spreads_and_keeps_mass() {
    let config = SolverConfig {
        lod: 0,
        diffusion_rate: 0.01,
        ..SolverConfig::default()
    };
    let mut solver = pipeline(&config);
    let frame = frame(&mut solver, (9, 9), 0.1);
    assert!(frame.density_a > 0.0);
    solver
        .write_field(
            FieldKind::Density,
            &scalar_field(frame.grid(), |x, y| if (x, y) == (4, 4) { 1.0 } else { 0.0 }),
        )
        .unwrap();

    solver.diffuse(FieldKind::Density, &frame);

    let density = solver.read_buffer(BufferRole::Density).unwrap();
    assert!(density.scalar(4, 4) < 1.0, "peak should spread out");
    assert!(density.scalar(5, 4) > 0.0, "neighbours should receive density");
    assert!(density.texels().iter().all(|t| t.x >= 0.0));
    let total = density.sum().x;
    assert!((total - 1.0).abs() < 0.05, "mass should be roughly kept, got {total}");
}

#[test]
fn test_project_leaves_uniform_flow_unchanged() {
    let mut solver = pipeline(&config());
    let frame = frame(&mut solver, (8, 6), 0.1);
    let uniform = vector_field(frame.grid(), |_, _| Vec2::new(1.5, -0.5));
    solver.write_field(FieldKind::Velocity, &uniform).unwrap();

    assert!(solver.project(&frame));

    assert_eq!(solver.read_buffer(BufferRole::Velocity).unwrap(), uniform);
}

#[test]
fn test_project_reduces_divergence() {
    let mut solver = pipeline(&config());
    let frame = frame(&mut solver, (16, 16), 0.1);
    assert_eq!(frame.pressure_iterations, 30);

    // Radial burst around the grid centre
    let explosion = vector_field(frame.grid(), |x, y| {
        let offset = Vec2::new(x as f32 - 7.5, y as f32 - 7.5);
        offset * (-offset.length_squared() / 18.0).exp()
    });
    solver.write_field(FieldKind::Velocity, &explosion).unwrap();
    let density = solver.read_buffer(BufferRole::Density).unwrap();
    let before = FieldMetrics::analyze(&density, &explosion, 0).velocity_divergence;

    assert!(solver.project(&frame));

    let projected = solver.read_buffer(BufferRole::Velocity).unwrap();
    let after = FieldMetrics::analyze(&density, &projected, 1).velocity_divergence;
    assert!(
        after < 0.5 * before,
        "projection should at least halve divergence: {before} -> {after}"
    );
}

#[test]
fn test_projection_switch_disables_project() {
    let config = SolverConfig {
        lod: 0,
        projection: false,
        ..SolverConfig::default()
    };
    let mut solver = pipeline(&config);
    let frame = frame(&mut solver, (8, 8), 0.1);
    let radial = vector_field(frame.grid(), |x, _| Vec2::new(x as f32, 0.0));
    solver.write_field(FieldKind::Velocity, &radial).unwrap();

    assert!(!solver.project(&frame));
    assert_eq!(solver.read_buffer(BufferRole::Velocity).unwrap(), radial);
}

#[test]
fn test_add_source_without_impulse_is_untouched() {
    let mut solver = pipeline(&config());
    let frame = frame(&mut solver, (5, 5), 0.1);
    let density = scalar_field(frame.grid(), |x, y| (x * y) as f32 * 0.3);
    let velocity = vector_field(frame.grid(), |x, y| Vec2::new(x as f32, -(y as f32)));
    solver.write_field(FieldKind::Density, &density).unwrap();
    solver.write_field(FieldKind::Velocity, &velocity).unwrap();

    assert!(!solver.add_source(FieldKind::Density, &frame, None));
    assert!(!solver.add_source(FieldKind::Velocity, &frame, None));

    assert_eq!(solver.read_buffer(BufferRole::Density).unwrap(), density);
    assert_eq!(solver.read_buffer(BufferRole::Velocity).unwrap(), velocity);
}

#[test]
fn test_single_cell_impulse() {
    let mut solver = pipeline(&inviscid());
    let impulse = Impulse::new(Vec2::ZERO, Vec2::splat(0.5), 1.0);

    let outcome = solver.step((4, 4), 1.0, Some(impulse)).unwrap();
    assert_eq!(
        outcome,
        FrameOutcome::Completed {
            grid: GridSize::new(4, 4),
            injected: true
        }
    );

    let density = solver.read_buffer(BufferRole::Density).unwrap();
    for y in 0..4 {
        for x in 0..4 {
            let expected = if (x, y) == (2, 2) { 1.0 } else { 0.0 };
            assert_eq!(density.scalar(x, y), expected, "density at ({x}, {y})");
        }
    }
}

#[test]
fn test_impulse_falloff_is_radial() {
    let mut solver = pipeline(&inviscid());
    let frame = frame(&mut solver, (9, 9), 1.0);
    let impulse = Impulse::new(Vec2::ZERO, Vec2::splat(0.5), 2.0);

    assert!(solver.add_source(FieldKind::Density, &frame, Some(&impulse)));

    let density = solver.read_buffer(BufferRole::Density).unwrap();
    assert_eq!(density.scalar(4, 4), 1.0);
    assert_eq!(density.scalar(5, 4), 0.75);
    assert_eq!(density.scalar(4, 3), 0.75);
    assert_eq!(density.scalar(5, 5), 0.5);
    assert_eq!(density.scalar(6, 4), 0.0, "distance equal to the radius is outside");
}

#[test]
fn test_uniform_flow_carries_density() {
    let mut solver = pipeline(&inviscid());
    solver.prepare((4, 4), 1.0).unwrap();
    let grid = GridSize::new(4, 4);
    solver
        .write_field(
            FieldKind::Density,
            &scalar_field(grid, |x, y| if (x, y) == (0, 0) { 1.0 } else { 0.0 }),
        )
        .unwrap();
    solver
        .write_field(FieldKind::Velocity, &vector_field(grid, |_, _| Vec2::X))
        .unwrap();

    solver.step((4, 4), 1.0, None).unwrap();

    let density = solver.read_buffer(BufferRole::Density).unwrap();
    assert!((density.scalar(1, 0) - 1.0).abs() < 1e-5, "density should move one cell right");
    assert!(density.texels().iter().all(|t| t.x >= 0.0), "no negative density");
    let velocity = solver.read_buffer(BufferRole::Velocity).unwrap();
    assert_eq!(velocity.vector(2, 2), Vec2::X, "uniform flow is divergence-free");
}

#[test]
fn test_advect_clamps_at_boundary() {
    let mut solver = pipeline(&config());
    let frame = frame(&mut solver, (5, 3), 1.0);
    solver
        .write_field(FieldKind::Density, &scalar_field(frame.grid(), |x, _| x as f32))
        .unwrap();
    solver
        .write_field(
            FieldKind::Velocity,
            &vector_field(frame.grid(), |_, _| Vec2::new(-100.0, 40.0)),
        )
        .unwrap();

    solver.advect(FieldKind::Density, &frame);

    let density = solver.read_buffer(BufferRole::Density).unwrap();
    for texel in density.texels() {
        assert_eq!(texel.x, 4.0, "every trace should land on the right edge");
    }
}

#[test]
fn test_non_divisible_grid_runs() {
    let mut solver = pipeline(&config());
    let frame = frame(&mut solver, (10, 6), 0.05);
    assert_eq!(frame.dispatch.groups, [2, 1]);
    assert_eq!(frame.dispatch.padded(), (16, 8));

    let impulse = Impulse::new(Vec2::new(1.0, 0.5), Vec2::new(0.9, 0.9), 3.0);
    for _ in 0..3 {
        solver.step((10, 6), 0.05, Some(impulse)).unwrap();
    }

    let visualization = solver.read_buffer(BufferRole::Visualization).unwrap();
    assert_eq!(visualization.size(), GridSize::new(10, 6));
    assert!(visualization.texels().iter().all(|t| t.is_finite()));
    let density = solver.read_buffer(BufferRole::Density).unwrap();
    assert!(density.sum().x > 0.0);
    assert!(density.texels().iter().all(|t| t.x.is_finite()));
}

#[test]
fn test_draw_blends_ink_and_flow() {
    let mut solver = pipeline(&config());
    let frame = frame(&mut solver, (3, 1), 0.1);
    let grid = frame.grid();
    let density = scalar_field(grid, |x, _| [0.0, 1.0, 2.0][x as usize]);
    let velocity = vector_field(grid, |x, _| if x == 2 { Vec2::new(40.0, 0.0) } else { Vec2::ZERO });
    solver.write_field(FieldKind::Density, &density).unwrap();
    solver.write_field(FieldKind::Velocity, &velocity).unwrap();

    solver.draw(&frame);

    let visualization = solver.read_buffer(BufferRole::Visualization).unwrap();
    let palette = solver.params().palette;
    assert_eq!(visualization.get(0, 0), Vec4::ZERO);

    let still = visualization.get(1, 0);
    assert!((still.truncate() - palette.ink).length() < 1e-6);
    assert_eq!(still.w, 1.0);

    let moving = visualization.get(2, 0);
    assert!((moving.truncate() - palette.flow).length() < 1e-6);
    assert_eq!(moving.w, 1.0, "ink saturates at one");

    assert_eq!(solver.read_buffer(BufferRole::Density).unwrap(), density);
    assert_eq!(solver.read_buffer(BufferRole::Velocity).unwrap(), velocity);
}

#[test]
fn test_swap_parity_follows_stage_count() {
    let mut solver = pipeline(&config());
    let impulse = Impulse::new(Vec2::X, Vec2::splat(0.5), 2.0);

    // density: add source, diffuse, advect; velocity adds two projections
    solver.step((8, 8), 0.1, Some(impulse)).unwrap();
    let buffers = solver.fields().buffers().unwrap();
    assert_eq!(buffers.density.current_slot(), 1);
    assert_eq!(buffers.velocity.current_slot(), 1);
    assert_eq!(buffers.pressure.current_slot(), 0);

    solver.step((8, 8), 0.1, None).unwrap();
    let buffers = solver.fields().buffers().unwrap();
    assert_eq!(buffers.density.current_slot(), 1);
    assert_eq!(buffers.velocity.current_slot(), 1);
}

#[test]
fn test_params_changes_apply_next_frame() {
    let mut solver = pipeline(&inviscid());
    solver.params_mut().density_gain = 3.0;
    let impulse = Impulse::new(Vec2::ZERO, Vec2::splat(0.5), 1.0);
    solver.step((4, 4), 1.0, Some(impulse)).unwrap();
    let density = solver.read_buffer(BufferRole::Density).unwrap();
    assert_eq!(density.scalar(2, 2), 3.0);
}

#[test]
fn test_invalid_time_step_skips_frame() {
    let mut solver = pipeline(&config());
    let impulse = Impulse::new(Vec2::X, Vec2::splat(0.5), 2.0);
    for dt in [f32::NAN, f32::INFINITY, -0.1] {
        let outcome = solver.step((8, 8), dt, Some(impulse)).unwrap();
        assert_eq!(outcome, FrameOutcome::Skipped(SkipReason::InvalidTimeStep));
    }
    assert_eq!(solver.backend().allocations(), 0);
    assert_eq!(solver.frames(), 0);

    // dt == 0 is a valid, motionless frame
    assert!(matches!(
        solver.step((8, 8), 0.0, Some(impulse)).unwrap(),
        FrameOutcome::Completed { .. }
    ));
}

#[test]
fn test_invalid_runtime_params_are_rejected() {
    let mut solver = pipeline(&config());
    solver.step((8, 8), 0.1, None).unwrap();

    // a == -0.25 would make the Jacobi denominator vanish
    solver.params_mut().diffusion_rate = -0.25 / (0.1 * 64.0);
    assert!(matches!(
        solver.step((8, 8), 0.1, None),
        Err(FluidError::Config(_))
    ));
    assert_eq!(solver.frames(), 1);

    solver.params_mut().diffusion_rate = 0.0;
    solver.step((8, 8), 0.1, None).unwrap();
    let density = solver.read_buffer(BufferRole::Density).unwrap();
    assert!(density.texels().iter().all(|t| t.is_finite()));
}

#[test]
fn test_frame_clock_follows_config() {
    let config = SolverConfig {
        max_time_step: 0.05,
        ..SolverConfig::default()
    };
    let mut clock = FrameClock::from_config(&config);
    assert_eq!(clock.max_step(), 0.05);
    let start = Instant::now();
    clock.tick_at(start);
    assert_eq!(clock.tick_at(start + Duration::from_secs(1)), 0.05);
}

#[test]
fn test_frame_clock_caps_time_step() {
    let mut clock = FrameClock::new(1.0 / 15.0);
    let start = Instant::now();
    assert_eq!(clock.tick_at(start), 0.0, "first tick has no history");

    let dt = clock.tick_at(start + Duration::from_millis(10));
    assert!((dt - 0.01).abs() < 1e-4);

    let dt = clock.tick_at(start + Duration::from_secs(2));
    assert_eq!(dt, 1.0 / 15.0);
}
