//! Host executor for the stage kernels
//!
//! Each kernel is evaluated per cell with rayon, reading only its input
//! textures and writing only its output, the same contract the compute
//! shaders follow.

use glam::{Vec2, Vec4};
use log::trace;
use rayon::prelude::*;

use crate::backend::{FluidBackend, Kernel, Relaxation, SourceTerm, StageContext};
use crate::config::Palette;
use crate::error::{FluidError, Result};
use crate::grid::WORKGROUP_SIZE;
use crate::texture::{GridTexture, HostTexture, TextureDesc, TextureFactory};

#[derive(Debug, Clone)]
pub struct CpuBackend {
    workgroup: [u32; 2],
    allocations: usize,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::with_workgroup(WORKGROUP_SIZE)
    }

    pub fn with_workgroup(workgroup: [u32; 2]) -> Self {
        Self {
            workgroup,
            allocations: 0,
        }
    }

    /// Buffers allocated so far, including reallocations.
    pub fn allocations(&self) -> usize {
        self.allocations
    }
}

/// Evaluates `kernel` for every cell of `out`.
fn run<F>(kernel: Kernel, ctx: &StageContext, out: &mut HostTexture, cell: F)
where
    F: Fn(i64, i64) -> Vec4 + Sync,
{
    let size = out.size();
    if size.is_empty() {
        return;
    }
    debug_assert_eq!(size, ctx.grid());
    trace!(
        "{} over {}x{} ({} groups)",
        kernel.label(),
        size.width,
        size.height,
        ctx.dispatch.groups[0] * ctx.dispatch.groups[1]
    );

    let format = out.format();
    let width = size.width as usize;
    out.texels_mut()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, texel) in row.iter_mut().enumerate() {
                *texel = format.mask(cell(x as i64, y as i64));
            }
        });
}

fn neighbours(texture: &HostTexture, x: i64, y: i64) -> Vec4 {
    texture.load(x - 1, y) + texture.load(x + 1, y) + texture.load(x, y - 1) + texture.load(x, y + 1)
}

impl TextureFactory for CpuBackend {
    type Texture = HostTexture;

    fn ensure(&mut self, desc: &TextureDesc, existing: Option<HostTexture>) -> Result<HostTexture> {
        if let Some(texture) = existing {
            if desc.matches(&texture) {
                return Ok(texture);
            }
            drop(texture);
        }
        if desc.size.is_empty() {
            return Err(FluidError::Allocation {
                label: desc.label,
                width: desc.size.width,
                height: desc.size.height,
                reason: "zero-sized buffer".into(),
            });
        }
        let texture = HostTexture::zeroed(desc.size, desc.format).map_err(|err| match err {
            FluidError::Allocation {
                width,
                height,
                reason,
                ..
            } => FluidError::Allocation {
                label: desc.label,
                width,
                height,
                reason,
            },
            other => other,
        })?;
        self.allocations += 1;
        Ok(texture)
    }
}

impl FluidBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn workgroup_size(&self) -> [u32; 2] {
        self.workgroup
    }

    fn add_source(
        &mut self,
        ctx: &StageContext,
        field: &HostTexture,
        out: &mut HostTexture,
        source: &SourceTerm,
    ) {
        let kernel = Kernel::add_source(out.format());
        run(kernel, ctx, out, |x, y| {
            field.load(x, y) + source.amount * source.falloff(x as u32, y as u32)
        });
    }

    fn relax(
        &mut self,
        ctx: &StageContext,
        x0: &HostTexture,
        iterate: &HostTexture,
        out: &mut HostTexture,
        coefficients: Relaxation,
    ) {
        let Relaxation { a, b, inv } = coefficients;
        let kernel = Kernel::relax(out.format());
        run(kernel, ctx, out, |x, y| {
            (x0.load(x, y) * b + neighbours(iterate, x, y) * a) * inv
        });
    }

    fn advect(
        &mut self,
        ctx: &StageContext,
        field: &HostTexture,
        velocity: &HostTexture,
        out: &mut HostTexture,
    ) {
        let dt = ctx.dt;
        let kernel = Kernel::advect(out.format());
        run(kernel, ctx, out, |x, y| {
            let flow = velocity.load(x, y).truncate().truncate();
            let source = Vec2::new(x as f32, y as f32) - flow * dt;
            field.sample_bilinear(source)
        });
    }

    fn divergence(&mut self, ctx: &StageContext, velocity: &HostTexture, out: &mut HostTexture) {
        run(Kernel::Divergence, ctx, out, |x, y| {
            let du = velocity.load(x + 1, y).x - velocity.load(x - 1, y).x;
            let dv = velocity.load(x, y + 1).y - velocity.load(x, y - 1).y;
            Vec4::new(0.5 * (du + dv), 0.0, 0.0, 1.0)
        });
    }

    fn subtract_gradient(
        &mut self,
        ctx: &StageContext,
        velocity: &HostTexture,
        pressure: &HostTexture,
        out: &mut HostTexture,
    ) {
        run(Kernel::SubtractGradient, ctx, out, |x, y| {
            let gradient = Vec2::new(
                pressure.load(x + 1, y).x - pressure.load(x - 1, y).x,
                pressure.load(x, y + 1).x - pressure.load(x, y - 1).x,
            );
            let flow = velocity.load(x, y).truncate().truncate() - gradient * 0.5;
            Vec4::new(flow.x, flow.y, 0.0, 1.0)
        });
    }

    fn draw(
        &mut self,
        ctx: &StageContext,
        density: &HostTexture,
        velocity: &HostTexture,
        out: &mut HostTexture,
        palette: &Palette,
    ) {
        run(Kernel::Draw, ctx, out, |x, y| {
            let ink = density.load(x, y).x.clamp(0.0, 1.0);
            let speed = velocity.load(x, y).truncate().truncate().length();
            let mix = (speed * palette.flow_scale).clamp(0.0, 1.0);
            let colour = palette.ink.lerp(palette.flow, mix) * ink;
            colour.extend(ink)
        });
    }

    fn upload(&mut self, dst: &mut HostTexture, src: &HostTexture) -> Result<()> {
        if dst.size() != src.size() || dst.format() != src.format() {
            return Err(FluidError::Readback(format!(
                "cannot upload {:?} {}x{} into {:?} {}x{}",
                src.format(),
                src.size().width,
                src.size().height,
                dst.format(),
                dst.size().width,
                dst.size().height
            )));
        }
        dst.texels_mut().copy_from_slice(src.texels());
        Ok(())
    }

    fn download(&mut self, src: &HostTexture) -> Result<HostTexture> {
        Ok(src.clone())
    }
}
