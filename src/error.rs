//! Error type shared by the field set, the backends and the pipeline

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FluidError {
    /// A field buffer could not be allocated. The pipeline cannot run without it.
    #[error("failed to allocate {label} ({width}x{height}): {reason}")]
    Allocation {
        label: &'static str,
        width: u32,
        height: u32,
        reason: String,
    },

    #[error("compute kernel `{kernel}` could not be resolved: {reason}")]
    KernelResolution { kernel: &'static str, reason: String },

    #[error("no GPU adapter found")]
    Adapter,

    #[cfg(feature = "gpu")]
    #[error("GPU device request failed: {0}")]
    Device(#[from] wgpu::RequestDeviceError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("buffer transfer failed: {0}")]
    Readback(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, FluidError>;
