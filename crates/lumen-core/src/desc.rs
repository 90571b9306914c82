use std::fmt;

use smallvec::SmallVec;

use crate::dtype::DataType;

/// Dimension sizes with stack-allocated storage for ≤4 dimensions.
///
/// Tensors here are 1-D (bias), 3-D CHW (activations) or 4-D OIHW
/// (convolution weights), so the inline capacity covers every case.
pub type TensorDims = SmallVec<[usize; 4]>;

/// Memory layout of a tensor.
///
/// Activations are either planar (`Chw`) or channel-blocked
/// (`Chw8c`/`Chw16c`), where the channel axis is split into an outer group
/// axis and an inner block of 8 or 16 contiguous channels matching the
/// engine's SIMD/subgroup width. Weights are plain `Oihw` or packed into
/// the matching blocked form for the convolution kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorLayout {
    /// 1-D contiguous (bias vectors)
    X,
    /// Planar activations: channel, height, width
    Chw,
    /// Channel-blocked activations, blocks of 8
    Chw8c,
    /// Channel-blocked activations, blocks of 16
    Chw16c,
    /// Plain convolution weights: output, input, kernel height, kernel width
    Oihw,
    /// Packed convolution weights, 8-channel blocks on both axes
    OIhw8i8o,
    /// Packed convolution weights, 16-channel blocks on both axes
    OIhw16i16o,
}

impl TensorLayout {
    /// Channel block size of this layout (1 for non-blocked layouts).
    pub fn block_size(&self) -> usize {
        match self {
            TensorLayout::Chw8c | TensorLayout::OIhw8i8o => 8,
            TensorLayout::Chw16c | TensorLayout::OIhw16i16o => 16,
            _ => 1,
        }
    }

    /// Whether the channel axis is tiled into blocks.
    pub fn is_blocked(&self) -> bool {
        self.block_size() > 1
    }

    /// Activation layout for a given channel block size.
    pub fn activation(block_size: usize) -> TensorLayout {
        match block_size {
            1 => TensorLayout::Chw,
            8 => TensorLayout::Chw8c,
            16 => TensorLayout::Chw16c,
            _ => panic!("unsupported tensor block size: {block_size}"),
        }
    }

    /// Packed weight layout for a given channel block size.
    pub fn packed_weight(block_size: usize) -> TensorLayout {
        match block_size {
            1 => TensorLayout::Oihw,
            8 => TensorLayout::OIhw8i8o,
            16 => TensorLayout::OIhw16i16o,
            _ => panic!("unsupported tensor block size: {block_size}"),
        }
    }
}

/// Round `n` up to the next multiple of `multiple`.
pub fn round_up(n: usize, multiple: usize) -> usize {
    (n + multiple - 1) / multiple * multiple
}

/// Shape, element type and layout of a tensor.
///
/// For blocked layouts the channel dimension stores the physical (padded)
/// channel count, which must be a multiple of the block size; ops keep
/// track of the logical channel count themselves where it matters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDesc {
    pub dims: TensorDims,
    pub layout: TensorLayout,
    pub data_type: DataType,
}

impl TensorDesc {
    pub fn new(dims: &[usize], layout: TensorLayout, data_type: DataType) -> Self {
        let desc = Self {
            dims: TensorDims::from_slice(dims),
            layout,
            data_type,
        };
        debug_assert!(desc.channels_valid(), "channels not a multiple of the block size: {desc:?}");
        desc
    }

    fn channels_valid(&self) -> bool {
        match self.ndim() {
            3 => self.dims[0] % self.layout.block_size() == 0,
            4 => {
                self.dims[0] % self.layout.block_size() == 0
                    && self.dims[1] % self.layout.block_size() == 0
            }
            _ => true,
        }
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Channel count: C for CHW activations, O for OIHW weights, length
    /// for 1-D tensors.
    pub fn num_channels(&self) -> usize {
        self.dims[0]
    }

    /// Height (second-to-last dimension).
    pub fn height(&self) -> usize {
        self.dims[self.ndim() - 2]
    }

    /// Width (last dimension).
    pub fn width(&self) -> usize {
        self.dims[self.ndim() - 1]
    }

    /// Channel block size of the layout.
    pub fn block_size(&self) -> usize {
        self.layout.block_size()
    }

    /// Total number of stored elements (the physical channel count already
    /// includes block padding).
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Total storage size in bytes.
    pub fn byte_size(&self) -> usize {
        self.num_elements() * self.data_type.element_byte_size()
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{:?}:{}", self.dims.as_slice(), self.layout, self.data_type)
    }
}
