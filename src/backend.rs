//! The kernel seam between the pipeline and an executor (host or GPU)

use glam::Vec4;

use crate::config::Palette;
use crate::error::Result;
use crate::grid::{Dispatch, GridSize};
use crate::texture::{HostTexture, SampleFormat, TextureFactory};

/// Per-stage launch context.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageContext {
    pub dispatch: Dispatch,
    pub dt: f32,
}

impl StageContext {
    pub fn grid(&self) -> GridSize {
        self.dispatch.grid
    }
}

/// A radial injection around `center`, pre-scaled by gain and time step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceTerm {
    pub center: (u32, u32),
    pub radius: f32,
    pub amount: Vec4,
}

impl SourceTerm {
    /// `1 - d²/r²` inside the radius, zero outside.
    pub fn falloff(&self, x: u32, y: u32) -> f32 {
        let dx = x as f32 - self.center.0 as f32;
        let dy = y as f32 - self.center.1 as f32;
        let d2 = dx * dx + dy * dy;
        let r2 = self.radius * self.radius;
        if d2 < r2 { 1.0 - d2 / r2 } else { 0.0 }
    }
}

/// Coefficients of one Jacobi pass: `(b * x0 + a * Σ₄ x) * inv`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Relaxation {
    pub a: f32,
    pub b: f32,
    pub inv: f32,
}

impl Relaxation {
    /// Implicit diffusion with weight `a = dt * rate * W * H`.
    pub fn diffusion(a: f32) -> Self {
        Self {
            a,
            b: 1.0,
            inv: 1.0 / (1.0 + 4.0 * a),
        }
    }

    /// Pressure Poisson pass against the divergence. The first pass starts from
    /// zero pressure, so neighbours are ignored.
    pub fn pressure(first: bool) -> Self {
        Self {
            a: if first { 0.0 } else { 1.0 },
            b: -1.0,
            inv: 0.25,
        }
    }
}

/// Every compute entry point the solver dispatches, by output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    AddSourceScalar,
    AddSourceVector,
    RelaxScalar,
    RelaxVector,
    AdvectScalar,
    AdvectVector,
    Divergence,
    SubtractGradient,
    Draw,
}

impl Kernel {
    pub const ALL: [Kernel; 9] = [
        Kernel::AddSourceScalar,
        Kernel::AddSourceVector,
        Kernel::RelaxScalar,
        Kernel::RelaxVector,
        Kernel::AdvectScalar,
        Kernel::AdvectVector,
        Kernel::Divergence,
        Kernel::SubtractGradient,
        Kernel::Draw,
    ];

    pub fn entry_point(self) -> &'static str {
        match self {
            Kernel::AddSourceScalar | Kernel::AddSourceVector => "add_source",
            Kernel::RelaxScalar | Kernel::RelaxVector => "relax",
            Kernel::AdvectScalar | Kernel::AdvectVector => "advect",
            Kernel::Divergence => "divergence",
            Kernel::SubtractGradient => "subtract_gradient",
            Kernel::Draw => "draw",
        }
    }

    pub fn output_format(self) -> SampleFormat {
        match self {
            Kernel::AddSourceScalar
            | Kernel::RelaxScalar
            | Kernel::AdvectScalar
            | Kernel::Divergence => SampleFormat::R32Float,
            Kernel::AddSourceVector
            | Kernel::RelaxVector
            | Kernel::AdvectVector
            | Kernel::SubtractGradient => SampleFormat::Rg32Float,
            Kernel::Draw => SampleFormat::Rgba32Float,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Kernel::AddSourceScalar => "add_source/scalar",
            Kernel::AddSourceVector => "add_source/vector",
            Kernel::RelaxScalar => "relax/scalar",
            Kernel::RelaxVector => "relax/vector",
            Kernel::AdvectScalar => "advect/scalar",
            Kernel::AdvectVector => "advect/vector",
            Kernel::Divergence => "divergence",
            Kernel::SubtractGradient => "subtract_gradient",
            Kernel::Draw => "draw",
        }
    }

    pub fn add_source(format: SampleFormat) -> Self {
        match format {
            SampleFormat::R32Float => Kernel::AddSourceScalar,
            _ => Kernel::AddSourceVector,
        }
    }

    pub fn relax(format: SampleFormat) -> Self {
        match format {
            SampleFormat::R32Float => Kernel::RelaxScalar,
            _ => Kernel::RelaxVector,
        }
    }

    pub fn advect(format: SampleFormat) -> Self {
        match format {
            SampleFormat::R32Float => Kernel::AdvectScalar,
            _ => Kernel::AdvectVector,
        }
    }
}

/// Executes the solver's stage kernels.
///
/// Every kernel writes only to `out`, one cell per invocation, and reads only
/// its inputs. `out` must never alias an input. Calls are ordered: a kernel
/// observes every write of the kernels issued before it.
pub trait FluidBackend: TextureFactory {
    fn name(&self) -> &'static str;

    fn workgroup_size(&self) -> [u32; 2];

    fn add_source(
        &mut self,
        ctx: &StageContext,
        field: &Self::Texture,
        out: &mut Self::Texture,
        source: &SourceTerm,
    );

    fn relax(
        &mut self,
        ctx: &StageContext,
        x0: &Self::Texture,
        iterate: &Self::Texture,
        out: &mut Self::Texture,
        coefficients: Relaxation,
    );

    fn advect(
        &mut self,
        ctx: &StageContext,
        field: &Self::Texture,
        velocity: &Self::Texture,
        out: &mut Self::Texture,
    );

    fn divergence(&mut self, ctx: &StageContext, velocity: &Self::Texture, out: &mut Self::Texture);

    fn subtract_gradient(
        &mut self,
        ctx: &StageContext,
        velocity: &Self::Texture,
        pressure: &Self::Texture,
        out: &mut Self::Texture,
    );

    fn draw(
        &mut self,
        ctx: &StageContext,
        density: &Self::Texture,
        velocity: &Self::Texture,
        out: &mut Self::Texture,
        palette: &Palette,
    );

    fn upload(&mut self, dst: &mut Self::Texture, src: &HostTexture) -> Result<()>;

    fn download(&mut self, src: &Self::Texture) -> Result<HostTexture>;
}
