//! Pointer-driven 2D stable-fluid solver

pub mod analysis;
pub mod backend;
pub mod config;
pub mod error;
pub mod export;
pub mod fields;
pub mod grid;
pub mod impulse;
pub mod pipeline;
pub mod render;
pub mod texture;

#[cfg(feature = "cpu")]
pub mod cpu;

#[cfg(feature = "gpu")]
pub mod gpu;

#[cfg(not(any(feature = "cpu", feature = "gpu")))]
compile_error!("enable the `cpu` or `gpu` feature");

// Feature-based backend selection
#[cfg(feature = "cpu")]
pub type DefaultBackend = cpu::CpuBackend;

#[cfg(all(feature = "gpu", not(feature = "cpu")))]
pub type DefaultBackend = gpu::GpuBackend;

pub use analysis::{AnalysisRecorder, FieldMetrics};
pub use backend::{FluidBackend, Kernel};
pub use config::{Palette, SolverConfig, SolverParams};
pub use error::{FluidError, Result};
pub use export::ImageExporter;
pub use fields::{BufferPair, FieldSet};
pub use grid::{Dispatch, GridSize};
pub use impulse::{Impulse, OneShot, PointerSource, SourceProvider};
pub use pipeline::{
    BufferRole, FieldKind, FrameClock, FrameOutcome, FrameParams, FramePlan, SkipReason,
    SolverPipeline,
};
pub use render::Renderer;
pub use texture::{GridTexture, HostTexture, SampleFormat, TextureDesc, TextureFactory};

#[cfg(feature = "cpu")]
pub use cpu::CpuBackend;

#[cfg(feature = "gpu")]
pub use gpu::GpuBackend;
