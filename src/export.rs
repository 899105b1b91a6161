use std::path::{Path, PathBuf};

use log::debug;

use crate::backend::FluidBackend;
use crate::error::Result;
use crate::impulse::SourceProvider;
use crate::pipeline::{BufferRole, FrameOutcome, SolverPipeline};
use crate::render::Renderer;
use crate::texture::HostTexture;

/// Writes solver output to PNG files.
pub struct ImageExporter {
    renderer: Renderer,
}

impl ImageExporter {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            renderer: Renderer::new(width, height),
        }
    }

    pub fn with_renderer(renderer: Renderer) -> Self {
        Self { renderer }
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn export_visualization_png(&self, visualization: &HostTexture, path: &Path) -> Result<()> {
        let img = self.renderer.render_visualization(visualization);
        img.save(path)?;
        Ok(())
    }

    pub fn export_velocity_png(&self, velocity: &HostTexture, path: &Path) -> Result<()> {
        let img = self.renderer.render_velocity_field(velocity);
        img.save(path)?;
        Ok(())
    }

    /// Downloads the latest visualization and writes it to `path`.
    pub fn export_pipeline_png<B: FluidBackend>(
        &self,
        pipeline: &mut SolverPipeline<B>,
        path: &Path,
    ) -> Result<()> {
        let visualization = pipeline.read_buffer(BufferRole::Visualization)?;
        self.export_visualization_png(&visualization, path)
    }

    /// Steps the pipeline `steps` times with impulses from `source`, writing one
    /// PNG per completed frame. Skipped frames produce no file.
    #[allow(clippy::too_many_arguments)]
    pub fn export_frame_sequence<B: FluidBackend>(
        &self,
        pipeline: &mut SolverPipeline<B>,
        source: &mut impl SourceProvider,
        viewport: (u32, u32),
        dt: f32,
        steps: usize,
        output_dir: &Path,
        prefix: &str,
    ) -> Result<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(steps);
        for i in 0..steps {
            let impulse = source.poll(viewport);
            if let FrameOutcome::Skipped(reason) = pipeline.step(viewport, dt, impulse)? {
                debug!("frame {i} not exported: {reason:?}");
                continue;
            }

            let filename = format!("{}_frame_{:04}.png", prefix, i);
            let path = output_dir.join(filename);
            self.export_pipeline_png(pipeline, &path)?;
            written.push(path);
        }
        Ok(written)
    }
}
