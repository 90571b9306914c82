//! 2x2 max pooling, stride 2.

use lumen_core::TensorAccessor;

/// One output pixel of a 2x2 max pool across all channels.
///
/// Output dims are `floor(H/2) x floor(W/2)`; a trailing odd row/column of
/// the source is dropped.
pub struct MaxPool2x2 {
    pub src: TensorAccessor,
    pub dst: TensorAccessor,
}

impl MaxPool2x2 {
    pub fn run(&self, h: usize, w: usize) {
        for c in 0..self.dst.num_channels() {
            let mut m = f32::NEG_INFINITY;
            for dh in 0..2 {
                for dw in 0..2 {
                    m = m.max(self.src.get(c, 2 * h + dh, 2 * w + dw));
                }
            }
            self.dst.set(c, h, w, m);
        }
    }
}
