use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use half::f16;

use crate::buffer::{Buffer, Storage};
use crate::desc::TensorDesc;
use crate::dtype::DataType;
use crate::error::LumenError;
use crate::Result;

/// Named constant tensors (weights, biases) shared across graphs.
pub type TensorMap = HashMap<String, Arc<Tensor>>;

/// A tensor descriptor bound to a memory region.
///
/// Transient tensors view the graph's scratch buffer at planner-assigned
/// offsets; private tensors (constants, packed weights) own a buffer of
/// their own. Cloning is cheap: the backing buffer is reference-counted.
#[derive(Clone)]
pub struct Tensor {
    desc: TensorDesc,
    buffer: Arc<Buffer>,
    byte_offset: usize,
}

impl Tensor {
    /// Allocate a private zero-filled tensor.
    pub fn new(desc: TensorDesc) -> Self {
        let buffer = Arc::new(Buffer::new(desc.byte_size(), Storage::Host));
        Self {
            desc,
            buffer,
            byte_offset: 0,
        }
    }

    /// Allocate a private tensor initialized from f32 data, converting to
    /// the descriptor's element type.
    pub fn from_f32(desc: TensorDesc, data: &[f32]) -> Result<Self> {
        if data.len() != desc.num_elements() {
            return Err(LumenError::ShapeMismatch {
                expected: vec![desc.num_elements()],
                got: vec![data.len()],
            });
        }
        let tensor = Self::new(desc);
        tensor.write_f32(data)?;
        Ok(tensor)
    }

    /// Create a view over `buffer` at `byte_offset`.
    ///
    /// The tensor's byte span must fit inside the buffer.
    pub fn view(buffer: Arc<Buffer>, desc: TensorDesc, byte_offset: usize) -> Result<Self> {
        let len = desc.byte_size();
        if byte_offset
            .checked_add(len)
            .map_or(true, |end| end > buffer.byte_size())
        {
            return Err(LumenError::OutOfBounds {
                offset: byte_offset,
                len,
                size: buffer.byte_size(),
            });
        }
        Ok(Self {
            desc,
            buffer,
            byte_offset,
        })
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn dims(&self) -> &[usize] {
        &self.desc.dims
    }

    pub fn data_type(&self) -> DataType {
        self.desc.data_type
    }

    pub fn num_elements(&self) -> usize {
        self.desc.num_elements()
    }

    pub fn byte_size(&self) -> usize {
        self.desc.byte_size()
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    /// Whether two tensors view the same buffer.
    pub fn same_buffer(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }

    /// Overwrite the tensor's elements from f32 data.
    pub fn write_f32(&self, data: &[f32]) -> Result<()> {
        if data.len() != self.num_elements() {
            return Err(LumenError::ShapeMismatch {
                expected: vec![self.num_elements()],
                got: vec![data.len()],
            });
        }
        match self.data_type() {
            DataType::F32 => self.buffer.write(self.byte_offset, bytemuck::cast_slice(data)),
            DataType::F16 => {
                let half: Vec<f16> = data.iter().map(|&v| f16::from_f32(v)).collect();
                self.buffer.write(self.byte_offset, bytemuck::cast_slice(&half))
            }
        }
    }

    /// Copy the tensor's elements out as f32.
    pub fn read_f32(&self) -> Vec<f32> {
        let mut bytes = vec![0u8; self.byte_size()];
        self.buffer
            .read(self.byte_offset, &mut bytes)
            .expect("tensor span validated at construction");
        match self.data_type() {
            DataType::F32 => bytemuck::cast_slice::<u8, f32>(&bytes).to_vec(),
            DataType::F16 => bytemuck::cast_slice::<u8, f16>(&bytes)
                .iter()
                .map(|v| v.to_f32())
                .collect(),
        }
    }

    /// Zero the tensor's byte span.
    pub fn zero(&self) {
        let zeros = vec![0u8; self.byte_size()];
        self.buffer
            .write(self.byte_offset, &zeros)
            .expect("tensor span validated at construction");
    }

    /// Blocked-layout-aware element accessor for 3-D activation tensors.
    ///
    /// Panics on non-activation tensors; that is a programmer error.
    pub fn accessor(&self) -> TensorAccessor {
        assert_eq!(self.desc.ndim(), 3, "accessor requires a CHW tensor");
        TensorAccessor {
            ptr: unsafe { self.buffer.as_ptr().add(self.byte_offset) },
            data_type: self.data_type(),
            c: self.desc.num_channels(),
            h: self.desc.height(),
            w: self.desc.width(),
            block: self.desc.block_size(),
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor({} @ {})", self.desc, self.byte_offset)
    }
}

/// Raw element access into a CHW activation tensor.
///
/// Handles planar and channel-blocked layouts and converts f16 storage to
/// f32 on the fly. Writes from concurrent kernel invocations must target
/// disjoint elements; the engine's row fan-out guarantees this.
#[derive(Clone, Copy)]
pub struct TensorAccessor {
    ptr: *mut u8,
    data_type: DataType,
    c: usize,
    h: usize,
    w: usize,
    block: usize,
}

unsafe impl Send for TensorAccessor {}
unsafe impl Sync for TensorAccessor {}

impl TensorAccessor {
    pub fn num_channels(&self) -> usize {
        self.c
    }

    pub fn height(&self) -> usize {
        self.h
    }

    pub fn width(&self) -> usize {
        self.w
    }

    #[inline]
    fn element_index(&self, c: usize, h: usize, w: usize) -> usize {
        debug_assert!(c < self.c && h < self.h && w < self.w);
        let b = self.block;
        ((c / b) * self.h * self.w + h * self.w + w) * b + c % b
    }

    #[inline]
    pub fn get(&self, c: usize, h: usize, w: usize) -> f32 {
        let idx = self.element_index(c, h, w);
        unsafe {
            match self.data_type {
                DataType::F32 => (self.ptr as *const f32).add(idx).read_unaligned(),
                DataType::F16 => (self.ptr as *const f16).add(idx).read_unaligned().to_f32(),
            }
        }
    }

    #[inline]
    pub fn set(&self, c: usize, h: usize, w: usize, value: f32) {
        let idx = self.element_index(c, h, w);
        unsafe {
            match self.data_type {
                DataType::F32 => (self.ptr as *mut f32).add(idx).write_unaligned(value),
                DataType::F16 => (self.ptr as *mut f16)
                    .add(idx)
                    .write_unaligned(f16::from_f32(value)),
            }
        }
    }

    /// Read three consecutive channels starting at `c0`.
    #[inline]
    pub fn get3(&self, c0: usize, h: usize, w: usize) -> [f32; 3] {
        [
            self.get(c0, h, w),
            self.get(c0 + 1, h, w),
            self.get(c0 + 2, h, w),
        ]
    }

    /// Write three consecutive channels starting at `c0`.
    #[inline]
    pub fn set3(&self, c0: usize, h: usize, w: usize, value: [f32; 3]) {
        self.set(c0, h, w, value[0]);
        self.set(c0 + 1, h, w, value[1]);
        self.set(c0 + 2, h, w, value[2]);
    }
}
