//! # lumen-kernels
//!
//! CPU compute kernels for the Lumen denoising runtime.
//!
//! Each kernel is a small struct bundling accessor views plus parameters,
//! with a `run(i0, i1)` method computing one output position. Ops submit
//! them through `Engine::submit_kernel_2d`, which fans the index range out
//! across rows; a kernel invocation only writes state owned by its own
//! index, so row-parallel execution is race-free.

pub mod conv;
pub mod pack;
pub mod pool;
pub mod reorder;
pub mod upsample;

pub use conv::{BiasAccessor, Conv3x3, WeightAccessor};
pub use pack::{pack_bias, pack_weight};
pub use pool::MaxPool2x2;
pub use reorder::{ChannelConcat, InputReorder, OutputReorder};
pub use upsample::UpsampleNearest2x;
