use std::sync::Arc;

use rayon::prelude::*;

use crate::buffer::{Buffer, Storage};
use crate::dtype::DataType;

/// Compute backend behind which kernel execution and memory allocation
/// live.
///
/// The graph is backend-agnostic: it only asks the engine for its tensor
/// block size and preferred element type, allocates buffers through it,
/// and submits 2-D kernel ranges. Submissions are in-order with respect to
/// each other; `wait` drains any asynchronous work.
pub trait Engine: Send + Sync {
    /// Channel block size of the engine's preferred activation layout
    /// (1, 8 or 16).
    fn tensor_block_size(&self) -> usize;

    /// Preferred activation element type.
    fn tensor_data_type(&self) -> DataType;

    /// Allocate a buffer of the given size and storage kind.
    fn new_buffer(&self, byte_size: usize, storage: Storage) -> Arc<Buffer>;

    /// Extra per-kernel workspace the engine reserves ahead of the tensor
    /// arena in the scratch buffer.
    fn scratch_byte_size(&self) -> usize {
        0
    }

    /// Fan a kernel out over a `dim0 x dim1` index range. The kernel must
    /// only write state owned by its own `(i0, i1)` index.
    fn submit_kernel_2d(&self, dim0: usize, dim1: usize, kernel: &(dyn Fn(usize, usize) + Sync));

    /// Drain pending asynchronous work. No-op for synchronous engines.
    fn wait(&self) {}
}

/// CPU engine: rayon row fan-out, host memory, f32 activations.
pub struct CpuEngine {
    block_size: usize,
}

impl CpuEngine {
    /// Engine with the default 8-channel block (SIMD width).
    pub fn new() -> Self {
        Self::with_block_size(8)
    }

    /// Engine with an explicit channel block size (1, 8 or 16).
    pub fn with_block_size(block_size: usize) -> Self {
        assert!(
            matches!(block_size, 1 | 8 | 16),
            "unsupported tensor block size: {block_size}"
        );
        Self { block_size }
    }
}

impl Default for CpuEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for CpuEngine {
    fn tensor_block_size(&self) -> usize {
        self.block_size
    }

    fn tensor_data_type(&self) -> DataType {
        DataType::F32
    }

    fn new_buffer(&self, byte_size: usize, storage: Storage) -> Arc<Buffer> {
        Arc::new(Buffer::new(byte_size, storage))
    }

    fn submit_kernel_2d(&self, dim0: usize, dim1: usize, kernel: &(dyn Fn(usize, usize) + Sync)) {
        (0..dim0).into_par_iter().for_each(|i0| {
            for i1 in 0..dim1 {
                kernel(i0, i1);
            }
        });
    }
}
