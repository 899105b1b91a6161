//! 2D field buffers: descriptors, the allocation seam and the host-side texture

use glam::{Vec2, Vec4};

use crate::error::{FluidError, Result};
use crate::grid::GridSize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    /// Scalar fields: density, divergence, pressure.
    R32Float,
    /// Velocity.
    Rg32Float,
    /// Visualization output.
    Rgba32Float,
}

impl SampleFormat {
    pub fn channels(self) -> usize {
        match self {
            SampleFormat::R32Float => 1,
            SampleFormat::Rg32Float => 2,
            SampleFormat::Rgba32Float => 4,
        }
    }

    pub fn bytes_per_texel(self) -> u32 {
        self.channels() as u32 * std::mem::size_of::<f32>() as u32
    }

    /// What a texel load returns after a store of `value` to a texture of this format.
    pub fn mask(self, value: Vec4) -> Vec4 {
        match self {
            SampleFormat::R32Float => Vec4::new(value.x, 0.0, 0.0, 1.0),
            SampleFormat::Rg32Float => Vec4::new(value.x, value.y, 0.0, 1.0),
            SampleFormat::Rgba32Float => value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WrapMode {
    Clamp,
    Repeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Point,
    Bilinear,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureDesc {
    pub label: &'static str,
    pub size: GridSize,
    pub format: SampleFormat,
    pub wrap: WrapMode,
    pub filter: FilterMode,
}

impl TextureDesc {
    /// Clamp-wrapped, point-filtered solver field.
    pub fn field(label: &'static str, size: GridSize, format: SampleFormat) -> Self {
        Self {
            label,
            size,
            format,
            wrap: WrapMode::Clamp,
            filter: FilterMode::Point,
        }
    }

    pub fn matches(&self, texture: &impl GridTexture) -> bool {
        texture.size() == self.size && texture.format() == self.format
    }
}

/// Anything the backends can hand out as a field buffer.
pub trait GridTexture {
    fn size(&self) -> GridSize;
    fn format(&self) -> SampleFormat;
}

/// Allocates and clears field buffers.
pub trait TextureFactory {
    type Texture: GridTexture;

    /// Returns `existing` untouched if it already matches `desc`.
    ///
    /// Otherwise `existing` is released first, then a new zero-cleared buffer is
    /// allocated.
    fn ensure(&mut self, desc: &TextureDesc, existing: Option<Self::Texture>) -> Result<Self::Texture>;
}

/// A field buffer living in host memory. Every texel is stored as a `Vec4`,
/// masked to the channels of its format.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTexture {
    size: GridSize,
    format: SampleFormat,
    texels: Vec<Vec4>,
}

impl HostTexture {
    pub fn zeroed(size: GridSize, format: SampleFormat) -> Result<Self> {
        let allocation_error = |reason: String| FluidError::Allocation {
            label: "host texture",
            width: size.width,
            height: size.height,
            reason,
        };
        let cells = (size.width as usize)
            .checked_mul(size.height as usize)
            .ok_or_else(|| allocation_error("cell count overflows".into()))?;
        let mut texels = Vec::new();
        texels
            .try_reserve_exact(cells)
            .map_err(|err| allocation_error(err.to_string()))?;
        texels.resize(cells, format.mask(Vec4::ZERO));
        Ok(Self {
            size,
            format,
            texels,
        })
    }

    pub fn from_fn(
        size: GridSize,
        format: SampleFormat,
        mut f: impl FnMut(u32, u32) -> Vec4,
    ) -> Result<Self> {
        let mut texture = Self::zeroed(size, format)?;
        for y in 0..size.height {
            for x in 0..size.width {
                texture.set(x, y, f(x, y));
            }
        }
        Ok(texture)
    }

    /// Rebuilds a texture from tightly packed channel data.
    pub fn from_packed(size: GridSize, format: SampleFormat, data: &[f32]) -> Result<Self> {
        let channels = format.channels();
        if data.len() != size.cells() * channels {
            return Err(FluidError::Readback(format!(
                "expected {} floats for {}x{} {:?}, got {}",
                size.cells() * channels,
                size.width,
                size.height,
                format,
                data.len()
            )));
        }
        let texels = data
            .chunks_exact(channels)
            .map(|texel| {
                let mut value = Vec4::ZERO;
                for (channel, component) in texel.iter().enumerate() {
                    value[channel] = *component;
                }
                format.mask(value)
            })
            .collect();
        Ok(Self {
            size,
            format,
            texels,
        })
    }

    pub fn packed(&self) -> Vec<f32> {
        let channels = self.format.channels();
        self.texels
            .iter()
            .flat_map(|texel| texel.to_array().into_iter().take(channels))
            .collect()
    }

    pub fn texels(&self) -> &[Vec4] {
        &self.texels
    }

    pub fn texels_mut(&mut self) -> &mut [Vec4] {
        &mut self.texels
    }

    pub fn get(&self, x: u32, y: u32) -> Vec4 {
        self.texels[self.size.index(x, y)]
    }

    pub fn set(&mut self, x: u32, y: u32, value: Vec4) {
        let index = self.size.index(x, y);
        self.texels[index] = self.format.mask(value);
    }

    pub fn scalar(&self, x: u32, y: u32) -> f32 {
        self.get(x, y).x
    }

    pub fn vector(&self, x: u32, y: u32) -> Vec2 {
        self.get(x, y).truncate().truncate()
    }

    /// Texel fetch with out-of-grid coordinates clamped to the nearest edge cell.
    pub fn load(&self, x: i64, y: i64) -> Vec4 {
        let (x, y) = self.size.clamp_cell(x, y);
        self.get(x, y)
    }

    /// Bilinear sample at a cell-space position, clamped to the grid.
    pub fn sample_bilinear(&self, position: Vec2) -> Vec4 {
        let max = Vec2::new(
            self.size.width.saturating_sub(1) as f32,
            self.size.height.saturating_sub(1) as f32,
        );
        let position = position.clamp(Vec2::ZERO, max);
        let base = position.floor();
        let t = position - base;
        let (x0, y0) = (base.x as i64, base.y as i64);

        let bottom = mix(self.load(x0, y0), self.load(x0 + 1, y0), t.x);
        let top = mix(self.load(x0, y0 + 1), self.load(x0 + 1, y0 + 1), t.x);
        mix(bottom, top, t.y)
    }

    pub fn sum(&self) -> Vec4 {
        self.texels.iter().copied().sum()
    }
}

impl GridTexture for HostTexture {
    fn size(&self) -> GridSize {
        self.size
    }

    fn format(&self) -> SampleFormat {
        self.format
    }
}

fn mix(a: Vec4, b: Vec4, t: f32) -> Vec4 {
    a + (b - a) * t
}
