//! Nearest-neighbor 2x upsampling.

use lumen_core::TensorAccessor;

/// One output pixel of a nearest-neighbor 2x upsample across all channels.
pub struct UpsampleNearest2x {
    pub src: TensorAccessor,
    pub dst: TensorAccessor,
}

impl UpsampleNearest2x {
    pub fn run(&self, h: usize, w: usize) {
        for c in 0..self.dst.num_channels() {
            self.dst.set(c, h, w, self.src.get(c, h / 2, w / 2));
        }
    }
}
