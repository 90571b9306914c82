//! Tile-aware reordering between external images and network tensors.
//!
//! The input direction maps a rectangular source region into the padded,
//! layout-transformed destination tensor, sanitizing values and applying
//! the tone curve on the way; channels are written in fixed
//! [color | albedo | normal] order and everything outside the tile (or
//! beyond the present channels) reads as zero. The output direction undoes
//! the color transform for the first three channels only.

use lumen_core::{ImageAccessor, TensorAccessor, Tile, TransferFunction};

#[inline]
fn nan_to_zero(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v
    }
}

#[inline]
fn sanitize3(v: [f32; 3], lo: f32, hi: f32) -> [f32; 3] {
    [
        nan_to_zero(v[0]).clamp(lo, hi),
        nan_to_zero(v[1]).clamp(lo, hi),
        nan_to_zero(v[2]).clamp(lo, hi),
    ]
}

#[inline]
fn scale3(v: [f32; 3], s: f32) -> [f32; 3] {
    [v[0] * s, v[1] * s, v[2] * s]
}

/// One destination pixel of the input reorder.
pub struct InputReorder {
    pub color: Option<ImageAccessor>,
    pub albedo: Option<ImageAccessor>,
    pub normal: Option<ImageAccessor>,
    pub dst: TensorAccessor,
    pub tile: Tile,
    pub transfer: TransferFunction,
    pub hdr: bool,
    pub snorm: bool,
}

impl InputReorder {
    pub fn run(&self, h_dst: usize, w_dst: usize) {
        let h = h_dst as isize - self.tile.h_dst_begin as isize;
        let w = w_dst as isize - self.tile.w_dst_begin as isize;

        if h < 0 || h >= self.tile.h as isize || w < 0 || w >= self.tile.w as isize {
            // Zero pad
            for c in 0..self.dst.num_channels() {
                self.dst.set(c, h_dst, w_dst, 0.0);
            }
            return;
        }

        let h_src = h as usize + self.tile.h_src_begin;
        let w_src = w as usize + self.tile.w_src_begin;

        let mut c = 0;
        if let Some(color) = &self.color {
            self.store_color(c, h_dst, w_dst, color.get3(h_src, w_src));
            c += 3;
        }
        if let Some(albedo) = &self.albedo {
            self.store_albedo(c, h_dst, w_dst, albedo.get3(h_src, w_src));
            c += 3;
        }
        if let Some(normal) = &self.normal {
            self.store_normal(c, h_dst, w_dst, normal.get3(h_src, w_src));
            c += 3;
        }
        for c in c..self.dst.num_channels() {
            self.dst.set(c, h_dst, w_dst, 0.0);
        }
    }

    fn store_color(&self, c: usize, h: usize, w: usize, value: [f32; 3]) {
        let mut value = scale3(value, self.transfer.input_scale());
        let lo = if self.snorm { -1.0 } else { 0.0 };
        let hi = if self.hdr { f32::MAX } else { 1.0 };
        value = sanitize3(value, lo, hi);
        if self.snorm {
            // Transform to [0..1]
            value = [
                value[0] * 0.5 + 0.5,
                value[1] * 0.5 + 0.5,
                value[2] * 0.5 + 0.5,
            ];
        }
        value = self.transfer.forward3(value);
        self.dst.set3(c, h, w, value);
    }

    fn store_albedo(&self, c: usize, h: usize, w: usize, value: [f32; 3]) {
        // Albedo rides on the color transform when color is present;
        // standalone it gets the full treatment.
        let mut value = if self.color.is_none() {
            scale3(value, self.transfer.input_scale())
        } else {
            value
        };
        value = sanitize3(value, 0.0, 1.0);
        if self.color.is_none() {
            value = self.transfer.forward3(value);
        }
        self.dst.set3(c, h, w, value);
    }

    fn store_normal(&self, c: usize, h: usize, w: usize, value: [f32; 3]) {
        let mut value = if self.color.is_none() {
            scale3(value, self.transfer.input_scale())
        } else {
            value
        };
        value = sanitize3(value, -1.0, 1.0);
        // Transform to [0..1]
        value = [
            value[0] * 0.5 + 0.5,
            value[1] * 0.5 + 0.5,
            value[2] * 0.5 + 0.5,
        ];
        self.dst.set3(c, h, w, value);
    }
}

/// One tile pixel of the output reorder: the inverse of the color path.
///
/// Reads channels [0..3) of the source tensor at the tile's source
/// position and writes the restored pixel to the output image at the
/// tile's destination position.
pub struct OutputReorder {
    pub src: TensorAccessor,
    pub output: ImageAccessor,
    pub tile: Tile,
    pub transfer: TransferFunction,
    pub hdr: bool,
    pub snorm: bool,
}

impl OutputReorder {
    pub fn run(&self, h: usize, w: usize) {
        let h_src = h + self.tile.h_src_begin;
        let w_src = w + self.tile.w_src_begin;
        let h_dst = h + self.tile.h_dst_begin;
        let w_dst = w + self.tile.w_dst_begin;

        // The network may produce negative values or NaNs.
        let mut value = sanitize3(
            self.src.get3(0, h_src, w_src),
            0.0,
            if self.hdr { f32::MAX } else { 1.0 },
        );
        value = self.transfer.inverse3(value);
        if self.snorm {
            // Transform back to [-1..1]
            value = [
                (value[0] * 2.0 - 1.0).max(-1.0),
                (value[1] * 2.0 - 1.0).max(-1.0),
                (value[2] * 2.0 - 1.0).max(-1.0),
            ];
        }
        if !self.hdr {
            value = [value[0].min(1.0), value[1].min(1.0), value[2].min(1.0)];
        }
        value = scale3(value, self.transfer.output_scale());
        self.output.set3(h_dst, w_dst, value);
    }
}

/// Materialized channel concatenation, used when the planner could not
/// place the two convolution sources adjacently.
pub struct ChannelConcat {
    pub src1: TensorAccessor,
    pub src2: TensorAccessor,
    pub dst: TensorAccessor,
}

impl ChannelConcat {
    pub fn run(&self, h: usize, w: usize) {
        for c in 0..self.src1.num_channels() {
            self.dst.set(c, h, w, self.src1.get(c, h, w));
        }
        let base = self.src1.num_channels();
        for c in 0..self.src2.num_channels() {
            self.dst.set(base + c, h, w, self.src2.get(c, h, w));
        }
    }
}
