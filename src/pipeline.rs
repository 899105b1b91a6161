//! Per-frame orchestration of the solver stages

use std::time::Instant;

use glam::Vec4;
use log::{debug, warn};

use crate::backend::{FluidBackend, Relaxation, SourceTerm, StageContext};
use crate::config::{Palette, SolverConfig, SolverParams};
use crate::error::{FluidError, Result};
use crate::fields::{BufferPair, FieldBuffers, FieldSet};
use crate::grid::{Dispatch, GridSize};
use crate::impulse::Impulse;
use crate::texture::{GridTexture, HostTexture};

/// Which field a density/velocity stage acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Density,
    Velocity,
}

/// Any buffer the pipeline exposes for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferRole {
    Density,
    Velocity,
    Divergence,
    Pressure,
    Visualization,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ZeroArea,
    DegenerateDispatch,
    /// `dt` was negative or not finite.
    InvalidTimeStep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Skipped(SkipReason),
    Completed { grid: GridSize, injected: bool },
}

/// Coefficients bound for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameParams {
    pub dispatch: Dispatch,
    pub dt: f32,
    pub density_gain: f32,
    pub velocity_gain: f32,
    /// Diffusion weight `dt * diffusion_rate * W * H`.
    pub density_a: f32,
    /// Diffusion weight `dt * viscosity * W * H`.
    pub velocity_a: f32,
    pub relaxation_iterations: u32,
    pub pressure_iterations: u32,
    pub projection: bool,
    pub palette: Palette,
}

impl FrameParams {
    pub fn new(params: &SolverParams, dispatch: Dispatch, dt: f32) -> Self {
        let area = dispatch.grid.area();
        Self {
            dispatch,
            dt,
            density_gain: params.density_gain,
            velocity_gain: params.velocity_gain,
            density_a: dt * params.diffusion_rate * area,
            velocity_a: dt * params.viscosity * area,
            relaxation_iterations: params.relaxation_iterations,
            pressure_iterations: params.pressure_iterations,
            projection: params.projection,
            palette: params.palette,
        }
    }

    pub fn grid(&self) -> GridSize {
        self.dispatch.grid
    }

    fn context(&self) -> StageContext {
        StageContext {
            dispatch: self.dispatch,
            dt: self.dt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FramePlan {
    Skip(SkipReason),
    Run(FrameParams),
}

/// Measures frame durations for the solver's time step.
#[derive(Debug, Clone)]
pub struct FrameClock {
    last: Option<Instant>,
    max_step: f32,
}

impl FrameClock {
    pub fn new(max_step: f32) -> Self {
        Self {
            last: None,
            max_step,
        }
    }

    /// Capped at the configured `max_time_step`.
    pub fn from_config(config: &SolverConfig) -> Self {
        Self::new(config.max_time_step)
    }

    pub fn max_step(&self) -> f32 {
        self.max_step
    }

    pub fn tick(&mut self) -> f32 {
        self.tick_at(Instant::now())
    }

    /// Seconds since the previous tick, capped at `max_step`. The first tick is zero.
    pub fn tick_at(&mut self, now: Instant) -> f32 {
        let dt = self
            .last
            .map(|last| now.saturating_duration_since(last).as_secs_f32())
            .unwrap_or(0.0);
        self.last = Some(now);
        dt.min(self.max_step)
    }
}

impl<T> FieldBuffers<T> {
    fn pair_mut(&mut self, field: FieldKind) -> &mut BufferPair<T> {
        match field {
            FieldKind::Density => &mut self.density,
            FieldKind::Velocity => &mut self.velocity,
        }
    }

    fn relaxation_mut(&mut self, field: FieldKind) -> (&mut BufferPair<T>, &mut T) {
        match field {
            FieldKind::Density => (&mut self.density, &mut self.density_scratch),
            FieldKind::Velocity => (&mut self.velocity, &mut self.velocity_scratch),
        }
    }

    fn role(&self, role: BufferRole) -> &T {
        match role {
            BufferRole::Density => self.density.current(),
            BufferRole::Velocity => self.velocity.current(),
            BufferRole::Divergence => &self.divergence,
            BufferRole::Pressure => self.pressure.current(),
            BufferRole::Visualization => &self.visualization,
        }
    }
}

/// Runs the fixed stage sequence once per frame and owns every field buffer.
pub struct SolverPipeline<B: FluidBackend> {
    backend: B,
    params: SolverParams,
    fields: FieldSet<B::Texture>,
    frames: u64,
}

impl<B: FluidBackend> SolverPipeline<B> {
    pub fn new(backend: B, config: &SolverConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_params(backend, config.params()))
    }

    pub fn with_params(backend: B, params: SolverParams) -> Self {
        Self {
            backend,
            params,
            fields: FieldSet::new(),
            frames: 0,
        }
    }

    pub fn params(&self) -> &SolverParams {
        &self.params
    }

    /// Changes take effect at the start of the next frame.
    pub fn params_mut(&mut self) -> &mut SolverParams {
        &mut self.params
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn grid(&self) -> GridSize {
        self.fields.size()
    }

    pub fn fields(&self) -> &FieldSet<B::Texture> {
        &self.fields
    }

    /// Completed frames so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Runs one frame: density step, velocity step, draw.
    pub fn step(
        &mut self,
        viewport: (u32, u32),
        dt: f32,
        impulse: Option<Impulse>,
    ) -> Result<FrameOutcome> {
        let frame = match self.prepare(viewport, dt)? {
            FramePlan::Run(frame) => frame,
            FramePlan::Skip(reason) => {
                match reason {
                    SkipReason::ZeroArea => debug!("skipping frame: empty viewport {viewport:?}"),
                    SkipReason::DegenerateDispatch => warn!(
                        "skipping frame: work-group {:?} cannot cover the grid",
                        self.backend.workgroup_size()
                    ),
                    SkipReason::InvalidTimeStep => warn!("skipping frame: invalid dt {dt}"),
                }
                return Ok(FrameOutcome::Skipped(reason));
            }
        };

        let impulse = impulse.and_then(Impulse::sanitized);
        self.density_step(&frame, impulse.as_ref());
        self.velocity_step(&frame, impulse.as_ref());
        self.draw(&frame);

        self.frames += 1;
        debug!(
            "frame {} on {} backend: {}x{}, dt {:.4}, impulse {}",
            self.frames,
            self.backend.name(),
            frame.grid().width,
            frame.grid().height,
            frame.dt,
            impulse.is_some()
        );
        Ok(FrameOutcome::Completed {
            grid: frame.grid(),
            injected: impulse.is_some(),
        })
    }

    /// Sizes the fields for `viewport` and binds this frame's parameters.
    ///
    /// Nothing is allocated when the frame has to be skipped. Parameters changed
    /// through `params_mut` are validated here.
    pub fn prepare(&mut self, viewport: (u32, u32), dt: f32) -> Result<FramePlan> {
        self.params.validate()?;
        if !dt.is_finite() || dt < 0.0 {
            return Ok(FramePlan::Skip(SkipReason::InvalidTimeStep));
        }
        let grid = GridSize::from_viewport(viewport.0, viewport.1, self.params.lod);
        if grid.is_empty() {
            return Ok(FramePlan::Skip(SkipReason::ZeroArea));
        }
        let Some(dispatch) = Dispatch::for_grid(grid, self.backend.workgroup_size()) else {
            return Ok(FramePlan::Skip(SkipReason::DegenerateDispatch));
        };
        self.fields.ensure_size(&mut self.backend, grid)?;
        Ok(FramePlan::Run(FrameParams::new(&self.params, dispatch, dt)))
    }

    pub fn density_step(&mut self, frame: &FrameParams, impulse: Option<&Impulse>) {
        self.add_source(FieldKind::Density, frame, impulse);
        self.diffuse(FieldKind::Density, frame);
        self.advect(FieldKind::Density, frame);
    }

    pub fn velocity_step(&mut self, frame: &FrameParams, impulse: Option<&Impulse>) {
        self.add_source(FieldKind::Velocity, frame, impulse);
        self.diffuse(FieldKind::Velocity, frame);
        self.project(frame);
        self.advect(FieldKind::Velocity, frame);
        self.project(frame);
    }

    /// Injects the impulse into `field`. Returns whether anything was dispatched.
    pub fn add_source(
        &mut self,
        field: FieldKind,
        frame: &FrameParams,
        impulse: Option<&Impulse>,
    ) -> bool {
        let Some(impulse) = impulse else {
            return false;
        };
        let Some(buffers) = self.fields.buffers_mut() else {
            return false;
        };
        let amount = match field {
            FieldKind::Density => Vec4::X * frame.density_gain,
            FieldKind::Velocity => impulse.velocity.extend(0.0).extend(0.0) * frame.velocity_gain,
        };
        let source = SourceTerm {
            center: impulse.target_cell(frame.grid()),
            radius: impulse.radius,
            amount: amount * frame.dt,
        };

        let pair = buffers.pair_mut(field);
        let (current, previous) = pair.split_mut();
        self.backend
            .add_source(&frame.context(), current, previous, &source);
        pair.swap();
        true
    }

    /// Implicit diffusion by Jacobi relaxation, ending with the swap that makes
    /// the diffused field current.
    pub fn diffuse(&mut self, field: FieldKind, frame: &FrameParams) {
        let Some(buffers) = self.fields.buffers_mut() else {
            return;
        };
        let a = match field {
            FieldKind::Density => frame.density_a,
            FieldKind::Velocity => frame.velocity_a,
        };
        let ctx = frame.context();
        let coefficients = Relaxation::diffusion(a);
        let (pair, scratch) = buffers.relaxation_mut(field);

        // First pass seeds the iterate with the undiffused field. With a == 0 it
        // is an exact copy and further passes would change nothing.
        {
            let (current, previous) = pair.split_mut();
            self.backend
                .relax(&ctx, current, current, previous, coefficients);
        }
        if a > 0.0 {
            for _ in 1..frame.relaxation_iterations {
                {
                    let (current, previous) = pair.split_mut();
                    self.backend
                        .relax(&ctx, current, previous, scratch, coefficients);
                }
                pair.exchange_previous(scratch);
            }
        }
        pair.swap();
    }

    /// Semi-Lagrangian transport of `field` along the current velocity.
    pub fn advect(&mut self, field: FieldKind, frame: &FrameParams) {
        let Some(buffers) = self.fields.buffers_mut() else {
            return;
        };
        let ctx = frame.context();
        match field {
            FieldKind::Density => {
                let (current, previous) = buffers.density.split_mut();
                self.backend
                    .advect(&ctx, current, buffers.velocity.current(), previous);
                buffers.density.swap();
            }
            FieldKind::Velocity => {
                let (current, previous) = buffers.velocity.split_mut();
                self.backend.advect(&ctx, current, current, previous);
                buffers.velocity.swap();
            }
        }
    }

    /// Removes the divergent part of the velocity field. Returns whether it ran.
    pub fn project(&mut self, frame: &FrameParams) -> bool {
        if !frame.projection {
            return false;
        }
        let Some(buffers) = self.fields.buffers_mut() else {
            return false;
        };
        let ctx = frame.context();

        self.backend
            .divergence(&ctx, buffers.velocity.current(), &mut buffers.divergence);

        for iteration in 0..frame.pressure_iterations.max(1) {
            let (current, previous) = buffers.pressure.split_mut();
            self.backend.relax(
                &ctx,
                &buffers.divergence,
                current,
                previous,
                Relaxation::pressure(iteration == 0),
            );
            buffers.pressure.swap();
        }

        let (current, previous) = buffers.velocity.split_mut();
        self.backend
            .subtract_gradient(&ctx, current, buffers.pressure.current(), previous);
        buffers.velocity.swap();
        true
    }

    /// Writes the visualization buffer from the current density and velocity.
    pub fn draw(&mut self, frame: &FrameParams) {
        let Some(buffers) = self.fields.buffers_mut() else {
            return;
        };
        self.backend.draw(
            &frame.context(),
            buffers.density.current(),
            buffers.velocity.current(),
            &mut buffers.visualization,
            &frame.palette,
        );
    }

    /// The latest composited frame, valid until the next draw.
    pub fn visualization(&self) -> Option<&B::Texture> {
        self.buffer(BufferRole::Visualization)
    }

    pub fn buffer(&self, role: BufferRole) -> Option<&B::Texture> {
        self.fields.buffers().map(|buffers| buffers.role(role))
    }

    /// Copies a buffer back to host memory.
    pub fn read_buffer(&mut self, role: BufferRole) -> Result<HostTexture> {
        let buffers = self.fields.buffers().ok_or_else(not_allocated)?;
        self.backend.download(buffers.role(role))
    }

    /// Overwrites the current contents of a field.
    pub fn write_field(&mut self, field: FieldKind, data: &HostTexture) -> Result<()> {
        let buffers = self.fields.buffers_mut().ok_or_else(not_allocated)?;
        let target = buffers.pair_mut(field).current_mut();
        if target.size() != data.size() {
            return Err(FluidError::Readback(format!(
                "field is {}x{}, data is {}x{}",
                target.size().width,
                target.size().height,
                data.size().width,
                data.size().height
            )));
        }
        self.backend.upload(target, data)
    }
}

fn not_allocated() -> FluidError {
    FluidError::Readback("solver fields are not allocated yet".into())
}
