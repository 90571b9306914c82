//! # lumen-core
//!
//! Core abstractions for the Lumen image-denoising runtime.
//!
//! Provides the building blocks the operation graph is assembled from:
//! - Tensor descriptors with planar (`Chw`) and channel-blocked
//!   (`Chw8c`/`Chw16c`) layouts
//! - Reference-counted byte buffers that transient tensors view at
//!   planner-assigned offsets
//! - Image descriptors for external pixel buffers (f32/f16, 1-4 channels)
//! - The `Engine` trait behind which compute backends live, with a
//!   rayon-based CPU implementation
//! - Tone-mapping transfer functions (linear, sRGB, PU)

pub mod buffer;
pub mod desc;
pub mod dtype;
pub mod engine;
pub mod error;
pub mod image;
pub mod tensor;
pub mod transfer;

pub use buffer::{Buffer, Storage};
pub use desc::{round_up, TensorDesc, TensorDims, TensorLayout};
pub use dtype::DataType;
pub use engine::{CpuEngine, Engine};
pub use error::LumenError;
pub use image::{Image, ImageAccessor, ImageDesc, PixelFormat, Tile};
pub use tensor::{Tensor, TensorAccessor, TensorMap};
pub use transfer::{TransferCurve, TransferFunction};

pub type Result<T> = std::result::Result<T, LumenError>;
