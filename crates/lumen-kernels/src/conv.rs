//! Direct 3x3 convolution, stride 1, padding 1, with optional fused ReLU
//! and 2x2 max-pool post-op.

use lumen_core::{DataType, Tensor, TensorAccessor};

use crate::pack::packed_index;

/// Read access into a packed `OIhw{B}i{B}o` weight tensor.
#[derive(Clone, Copy)]
pub struct WeightAccessor {
    ptr: *const f32,
    in_channels: usize,
    block: usize,
}

unsafe impl Send for WeightAccessor {}
unsafe impl Sync for WeightAccessor {}

impl WeightAccessor {
    /// Wrap a packed weight tensor produced by [`crate::pack::pack_weight`].
    pub fn new(weight: &Tensor) -> Self {
        assert_eq!(weight.data_type(), DataType::F32, "packed weights are f32");
        assert_eq!(weight.desc().ndim(), 4);
        Self {
            ptr: unsafe { weight.buffer().as_ptr().add(weight.byte_offset()) } as *const f32,
            in_channels: weight.dims()[1],
            block: weight.desc().block_size(),
        }
    }

    #[inline]
    pub fn get(&self, o: usize, i: usize, kh: usize, kw: usize) -> f32 {
        let idx = packed_index(o, i, kh, kw, self.in_channels, self.block);
        unsafe { self.ptr.add(idx).read_unaligned() }
    }
}

/// Read access into a packed 1-D bias tensor.
#[derive(Clone, Copy)]
pub struct BiasAccessor {
    ptr: *const f32,
    len: usize,
}

unsafe impl Send for BiasAccessor {}
unsafe impl Sync for BiasAccessor {}

impl BiasAccessor {
    pub fn new(bias: &Tensor) -> Self {
        assert_eq!(bias.data_type(), DataType::F32, "packed bias is f32");
        assert_eq!(bias.desc().ndim(), 1);
        Self {
            ptr: unsafe { bias.buffer().as_ptr().add(bias.byte_offset()) } as *const f32,
            len: bias.dims()[0],
        }
    }

    #[inline]
    pub fn get(&self, o: usize) -> f32 {
        debug_assert!(o < self.len);
        unsafe { self.ptr.add(o).read_unaligned() }
    }
}

/// One output pixel of a 3x3 convolution across all output channels.
///
/// `pool` fuses a 2x2 max-pool with stride 2: the destination is half the
/// source resolution and each output takes the max of the four convolution
/// results it covers.
pub struct Conv3x3 {
    pub src: TensorAccessor,
    pub weight: WeightAccessor,
    pub bias: BiasAccessor,
    pub dst: TensorAccessor,
    pub relu: bool,
    pub pool: bool,
}

impl Conv3x3 {
    pub fn run(&self, h: usize, w: usize) {
        for oc in 0..self.dst.num_channels() {
            let mut v = if self.pool {
                let mut m = f32::NEG_INFINITY;
                for dh in 0..2 {
                    for dw in 0..2 {
                        let sh = 2 * h + dh;
                        let sw = 2 * w + dw;
                        if sh < self.src.height() && sw < self.src.width() {
                            m = m.max(self.conv_at(oc, sh, sw));
                        }
                    }
                }
                m
            } else {
                self.conv_at(oc, h, w)
            };
            if self.relu {
                v = v.max(0.0);
            }
            self.dst.set(oc, h, w, v);
        }
    }

    #[inline]
    fn conv_at(&self, oc: usize, h: usize, w: usize) -> f32 {
        let mut acc = self.bias.get(oc);
        for ic in 0..self.src.num_channels() {
            for kh in 0..3 {
                let ih = h + kh;
                if ih < 1 || ih > self.src.height() {
                    continue;
                }
                for kw in 0..3 {
                    let iw = w + kw;
                    if iw < 1 || iw > self.src.width() {
                        continue;
                    }
                    acc += self.src.get(ic, ih - 1, iw - 1) * self.weight.get(oc, ic, kh, kw);
                }
            }
        }
        acc
    }
}
