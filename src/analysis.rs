use std::collections::HashMap;
use std::path::Path;

use log::info;
use serde::Serialize;

use crate::backend::FluidBackend;
use crate::error::Result;
use crate::pipeline::{BufferRole, SolverPipeline};
use crate::texture::{GridTexture, HostTexture};

#[derive(Debug, Clone, Serialize)]
pub struct FieldMetrics {
    pub total_mass: f32,
    pub max_density: f32,
    pub min_density: f32,
    pub avg_density: f32,
    pub total_kinetic_energy: f32,
    pub max_velocity: f32,
    pub avg_velocity: f32,
    pub density_entropy: f32,
    /// Mean |∇·v| with the solver's clamped central differences.
    pub velocity_divergence: f32,
    pub vorticity: f32,
    pub frame: u64,
}

impl FieldMetrics {
    pub fn analyze(density: &HostTexture, velocity: &HostTexture, frame: u64) -> Self {
        let size = density.size();
        let cells = size.cells().max(1) as f32;

        let mut total_mass: f32 = 0.0;
        let mut max_density = f32::MIN;
        let mut min_density = f32::MAX;
        let mut total_kinetic_energy: f32 = 0.0;
        let mut max_velocity: f32 = 0.0;
        let mut velocity_sum: f32 = 0.0;
        let mut density_histogram = HashMap::new();
        let mut total_divergence = 0.0;
        let mut total_vorticity = 0.0;

        for y in 0..size.height {
            for x in 0..size.width {
                let amount = density.scalar(x, y);
                total_mass += amount;
                max_density = max_density.max(amount);
                min_density = min_density.min(amount);

                let flow = velocity.vector(x, y);
                let speed = flow.length();
                total_kinetic_energy += 0.5 * speed * speed;
                max_velocity = max_velocity.max(speed);
                velocity_sum += speed;

                let quantized_density = (amount * 10.0).floor() as i64;
                *density_histogram.entry(quantized_density).or_insert(0u32) += 1;

                let (xi, yi) = (i64::from(x), i64::from(y));
                let right = velocity.load(xi + 1, yi);
                let left = velocity.load(xi - 1, yi);
                let up = velocity.load(xi, yi + 1);
                let down = velocity.load(xi, yi - 1);

                let divergence = 0.5 * (right.x - left.x + up.y - down.y);
                total_divergence += divergence.abs();

                let vorticity = 0.5 * (right.y - left.y - (up.x - down.x));
                total_vorticity += vorticity.abs();
            }
        }

        if size.is_empty() {
            max_density = 0.0;
            min_density = 0.0;
        }

        let mut entropy = 0.0;
        for &count in density_histogram.values() {
            let probability = count as f32 / cells;
            if probability > 0.0 {
                entropy -= probability * probability.log2();
            }
        }

        Self {
            total_mass,
            max_density,
            min_density,
            avg_density: total_mass / cells,
            total_kinetic_energy,
            max_velocity,
            avg_velocity: velocity_sum / cells,
            density_entropy: entropy,
            velocity_divergence: total_divergence / cells,
            vorticity: total_vorticity / cells,
            frame,
        }
    }

    /// Reads density and velocity back from the pipeline and measures them.
    pub fn capture<B: FluidBackend>(pipeline: &mut SolverPipeline<B>) -> Result<Self> {
        let density = pipeline.read_buffer(BufferRole::Density)?;
        let velocity = pipeline.read_buffer(BufferRole::Velocity)?;
        Ok(Self::analyze(&density, &velocity, pipeline.frames()))
    }

    pub fn log_summary(&self) {
        info!(
            "frame {}: mass {:.6}, density [{:.6}, {:.6}], kinetic energy {:.6}, max speed {:.6}, divergence {:.6}, vorticity {:.6}",
            self.frame,
            self.total_mass,
            self.min_density,
            self.max_density,
            self.total_kinetic_energy,
            self.max_velocity,
            self.velocity_divergence,
            self.vorticity
        );
    }
}

#[derive(Debug, Default)]
pub struct AnalysisRecorder {
    pub metrics_history: Vec<FieldMetrics>,
}

impl AnalysisRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, metrics: FieldMetrics) {
        self.metrics_history.push(metrics);
    }

    pub fn record_frame<B: FluidBackend>(&mut self, pipeline: &mut SolverPipeline<B>) -> Result<()> {
        let metrics = FieldMetrics::capture(pipeline)?;
        self.record(metrics);
        Ok(())
    }

    pub fn latest(&self) -> Option<&FieldMetrics> {
        self.metrics_history.last()
    }

    pub fn log_trends(&self) {
        let (Some(first), Some(last)) = (self.metrics_history.first(), self.metrics_history.last())
        else {
            return;
        };
        if self.metrics_history.len() < 2 {
            return;
        }

        info!(
            "mass change: {:.6} -> {:.6} ({:+.3}%)",
            first.total_mass,
            last.total_mass,
            (last.total_mass - first.total_mass) / first.total_mass.abs().max(0.001) * 100.0
        );
        info!(
            "kinetic energy change: {:.6} -> {:.6} ({:+.3}%)",
            first.total_kinetic_energy,
            last.total_kinetic_energy,
            (last.total_kinetic_energy - first.total_kinetic_energy)
                / first.total_kinetic_energy.max(0.001)
                * 100.0
        );
        info!(
            "divergence change: {:.6} -> {:.6}",
            first.velocity_divergence, last.velocity_divergence
        );
    }

    /// Writes the recorded history as a JSON array.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.metrics_history)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}
