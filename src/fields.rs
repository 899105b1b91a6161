//! Double-buffered solver fields and their lifecycle

use log::info;

use crate::error::Result;
use crate::grid::GridSize;
use crate::texture::{GridTexture, SampleFormat, TextureDesc, TextureFactory};

/// Current/previous storage for one field.
///
/// Swapping flips which slot is current. Buffer contents are never copied.
#[derive(Debug)]
pub struct BufferPair<T> {
    slots: [T; 2],
    current: usize,
}

impl<T> BufferPair<T> {
    pub fn new(first: T, second: T) -> Self {
        Self {
            slots: [first, second],
            current: 0,
        }
    }

    pub fn current(&self) -> &T {
        &self.slots[self.current]
    }

    pub fn previous(&self) -> &T {
        &self.slots[1 - self.current]
    }

    pub fn current_mut(&mut self) -> &mut T {
        &mut self.slots[self.current]
    }

    /// Index of the slot currently holding the field (0 or 1).
    pub fn current_slot(&self) -> usize {
        self.current
    }

    /// The current buffer to read from and the previous one to write into.
    pub fn split_mut(&mut self) -> (&T, &mut T) {
        let [first, second] = &mut self.slots;
        if self.current == 0 {
            (first, second)
        } else {
            (second, first)
        }
    }

    pub fn swap(&mut self) {
        self.current = 1 - self.current;
    }

    /// Moves `other` into the previous slot and hands the displaced buffer back.
    pub fn exchange_previous(&mut self, other: &mut T) {
        std::mem::swap(&mut self.slots[1 - self.current], other);
    }

    fn into_slots(self) -> [T; 2] {
        self.slots
    }
}

/// Every buffer the solver owns for one grid size.
#[derive(Debug)]
pub struct FieldBuffers<T> {
    pub density: BufferPair<T>,
    pub density_scratch: T,
    pub velocity: BufferPair<T>,
    pub velocity_scratch: T,
    pub divergence: T,
    pub pressure: BufferPair<T>,
    pub visualization: T,
}

/// Allocation order of [`FieldBuffers`].
const LAYOUT: [(&str, SampleFormat); 10] = [
    ("density", SampleFormat::R32Float),
    ("density (previous)", SampleFormat::R32Float),
    ("density (scratch)", SampleFormat::R32Float),
    ("velocity", SampleFormat::Rg32Float),
    ("velocity (previous)", SampleFormat::Rg32Float),
    ("velocity (scratch)", SampleFormat::Rg32Float),
    ("divergence", SampleFormat::R32Float),
    ("pressure", SampleFormat::R32Float),
    ("pressure (previous)", SampleFormat::R32Float),
    ("visualization", SampleFormat::Rgba32Float),
];

impl<T> FieldBuffers<T> {
    fn into_vec(self) -> Vec<T> {
        let [density, density_previous] = self.density.into_slots();
        let [velocity, velocity_previous] = self.velocity.into_slots();
        let [pressure, pressure_previous] = self.pressure.into_slots();
        vec![
            density,
            density_previous,
            self.density_scratch,
            velocity,
            velocity_previous,
            self.velocity_scratch,
            self.divergence,
            pressure,
            pressure_previous,
            self.visualization,
        ]
    }

    fn from_vec(buffers: Vec<T>) -> Option<Self> {
        let mut buffers = buffers.into_iter();
        let mut next = || buffers.next();
        Some(Self {
            density: BufferPair::new(next()?, next()?),
            density_scratch: next()?,
            velocity: BufferPair::new(next()?, next()?),
            velocity_scratch: next()?,
            divergence: next()?,
            pressure: BufferPair::new(next()?, next()?),
            visualization: next()?,
        })
    }
}

/// Owns the solver's buffers and keeps them at one shared resolution.
#[derive(Debug)]
pub struct FieldSet<T> {
    size: GridSize,
    buffers: Option<FieldBuffers<T>>,
    generation: u64,
}

impl<T> Default for FieldSet<T> {
    fn default() -> Self {
        Self {
            size: GridSize::default(),
            buffers: None,
            generation: 0,
        }
    }
}

impl<T: GridTexture> FieldSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> GridSize {
        self.size
    }

    /// Number of times the buffers have been (re)allocated.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn buffers(&self) -> Option<&FieldBuffers<T>> {
        self.buffers.as_ref()
    }

    pub fn buffers_mut(&mut self) -> Option<&mut FieldBuffers<T>> {
        self.buffers.as_mut()
    }

    /// Reallocates every buffer at `size` unless they already have it.
    ///
    /// Returns whether an allocation happened. On failure the set is left empty.
    pub fn ensure_size<F>(&mut self, factory: &mut F, size: GridSize) -> Result<bool>
    where
        F: TextureFactory<Texture = T>,
    {
        if self.buffers.is_some() && self.size == size {
            return Ok(false);
        }

        let mut old = self
            .buffers
            .take()
            .map(FieldBuffers::into_vec)
            .unwrap_or_default()
            .into_iter();
        self.size = GridSize::default();

        let mut allocated = Vec::with_capacity(LAYOUT.len());
        for (label, format) in LAYOUT {
            let desc = TextureDesc::field(label, size, format);
            allocated.push(factory.ensure(&desc, old.next())?);
        }

        self.buffers = FieldBuffers::from_vec(allocated);
        self.size = size;
        self.generation += 1;
        info!(
            "allocated solver fields at {}x{} (generation {})",
            size.width, size.height, self.generation
        );
        Ok(true)
    }
}
