use std::path::{Path, PathBuf};

use fluidtrail::{
    AnalysisRecorder, BufferRole, DefaultBackend, FieldMetrics, FluidBackend, FrameClock,
    FrameOutcome, ImageExporter, PointerSource, SolverConfig, SolverPipeline, SourceProvider,
};
use glam::Vec2;
use log::{info, warn};
use rand::Rng;

const VIEWPORT: (u32, u32) = (512, 512);

/// Usage: `fluidtrail [config.json|-] [frames] [output-dir]`
fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let config = match args.get(1).map(String::as_str) {
        Some(path) if path != "-" => SolverConfig::load(Path::new(path))?,
        _ => SolverConfig::default(),
    };
    let frames = args
        .get(2)
        .map(|count| count.parse::<usize>())
        .transpose()?
        .unwrap_or(60);
    let output_dir = PathBuf::from(args.get(3).map(String::as_str).unwrap_or("frames"));
    std::fs::create_dir_all(&output_dir)?;

    let backend = create_backend(&config)?;
    let mut pipeline = SolverPipeline::new(backend, &config)?;
    run_headless(&mut pipeline, &config, frames, &output_dir)?;
    Ok(())
}

#[cfg(feature = "cpu")]
fn create_backend(config: &SolverConfig) -> fluidtrail::Result<DefaultBackend> {
    Ok(fluidtrail::CpuBackend::with_workgroup(config.workgroup_size))
}

#[cfg(all(feature = "gpu", not(feature = "cpu")))]
fn create_backend(config: &SolverConfig) -> fluidtrail::Result<DefaultBackend> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(fluidtrail::GpuBackend::with_workgroup(config.workgroup_size))
}

/// Drags a scripted pointer around the viewport and exports frames and metrics.
fn run_headless(
    pipeline: &mut SolverPipeline<DefaultBackend>,
    config: &SolverConfig,
    frames: usize,
    output_dir: &Path,
) -> fluidtrail::Result<()> {
    info!(
        "running {} frames at {}x{} on the {} backend",
        frames,
        VIEWPORT.0,
        VIEWPORT.1,
        pipeline.backend().name()
    );

    let exporter = ImageExporter::new(VIEWPORT.0, VIEWPORT.1);
    let mut recorder = AnalysisRecorder::new();
    let mut pointer = PointerSource::new(config.pointer_radius);
    let mut rng = rand::thread_rng();
    let mut clock = FrameClock::from_config(config);

    let centre = Vec2::new(VIEWPORT.0 as f32, VIEWPORT.1 as f32) * 0.5;
    let orbit = VIEWPORT.0.min(VIEWPORT.1) as f32 * 0.3;

    for frame in 0..frames {
        let angle = frame as f32 / frames.max(1) as f32 * std::f32::consts::TAU;
        let jitter = Vec2::new(rng.gen_range(-2.0..2.0), rng.gen_range(-2.0..2.0));
        let position = centre + Vec2::new(angle.cos(), angle.sin()) * orbit + jitter;
        // Release the button every so often so the trail breaks up.
        pointer.record(position, frame % 40 < 30);

        let impulse = pointer.poll(VIEWPORT);
        let dt = clock.tick();
        match pipeline.step(VIEWPORT, dt, impulse)? {
            FrameOutcome::Skipped(reason) => warn!("frame {frame} skipped: {reason:?}"),
            FrameOutcome::Completed { .. } => {
                let metrics = FieldMetrics::capture(pipeline)?;
                if frame % 10 == 0 {
                    metrics.log_summary();
                    let path = output_dir.join(format!("frame_{frame:04}.png"));
                    exporter.export_pipeline_png(pipeline, &path)?;
                }
                recorder.record(metrics);
            }
        }
    }

    if pipeline.frames() == 0 {
        warn!("no frame completed, nothing to export");
        return Ok(());
    }

    let velocity = pipeline.read_buffer(BufferRole::Velocity)?;
    exporter.export_velocity_png(&velocity, &output_dir.join("velocity.png"))?;
    exporter.export_pipeline_png(pipeline, &output_dir.join("final.png"))?;
    recorder.write_json(&output_dir.join("metrics.json"))?;
    recorder.log_trends();

    info!("wrote output to {}", output_dir.display());
    Ok(())
}
