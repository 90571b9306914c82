use std::fmt;
use std::sync::Arc;

use half::f16;

use crate::buffer::{Buffer, Storage};
use crate::dtype::DataType;
use crate::error::LumenError;
use crate::Result;

/// Pixel format of an external image: element type plus channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Float,
    Float2,
    Float3,
    Float4,
    Half,
    Half2,
    Half3,
    Half4,
}

impl PixelFormat {
    pub fn num_channels(&self) -> usize {
        match self {
            PixelFormat::Float | PixelFormat::Half => 1,
            PixelFormat::Float2 | PixelFormat::Half2 => 2,
            PixelFormat::Float3 | PixelFormat::Half3 => 3,
            PixelFormat::Float4 | PixelFormat::Half4 => 4,
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            PixelFormat::Float | PixelFormat::Float2 | PixelFormat::Float3 | PixelFormat::Float4 => {
                DataType::F32
            }
            _ => DataType::F16,
        }
    }

    /// Size in bytes of one densely packed pixel.
    pub fn pixel_byte_size(&self) -> usize {
        self.num_channels() * self.data_type().element_byte_size()
    }
}

/// Geometry of an external pixel buffer.
///
/// Strides are in bytes and default to dense packing but may be larger,
/// e.g. for images embedded in a bigger framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub format: PixelFormat,
    pub height: usize,
    pub width: usize,
    pub pixel_byte_stride: usize,
    pub row_byte_stride: usize,
}

impl ImageDesc {
    /// Densely packed image geometry.
    pub fn new(format: PixelFormat, height: usize, width: usize) -> Self {
        let pixel_byte_stride = format.pixel_byte_size();
        Self {
            format,
            height,
            width,
            pixel_byte_stride,
            row_byte_stride: width * pixel_byte_stride,
        }
    }

    pub fn with_strides(mut self, pixel_byte_stride: usize, row_byte_stride: usize) -> Self {
        self.pixel_byte_stride = pixel_byte_stride;
        self.row_byte_stride = row_byte_stride;
        self
    }

    pub fn num_channels(&self) -> usize {
        self.format.num_channels()
    }

    /// Total byte span covered by the image.
    pub fn byte_size(&self) -> usize {
        if self.height == 0 {
            return 0;
        }
        (self.height - 1) * self.row_byte_stride
            + (self.width - 1) * self.pixel_byte_stride
            + self.format.pixel_byte_size()
    }
}

/// An external input/output pixel buffer. Not owned by the graph.
#[derive(Clone)]
pub struct Image {
    desc: ImageDesc,
    buffer: Arc<Buffer>,
    byte_offset: usize,
}

impl Image {
    /// Allocate a zero-filled host image.
    pub fn new(desc: ImageDesc) -> Self {
        let buffer = Arc::new(Buffer::new(desc.byte_size(), Storage::Host));
        Self {
            desc,
            buffer,
            byte_offset: 0,
        }
    }

    /// Allocate a host image initialized from interleaved f32 pixel data
    /// (`height * width * channels` values, row-major).
    pub fn from_f32(desc: ImageDesc, data: &[f32]) -> Result<Self> {
        let expected = desc.height * desc.width * desc.num_channels();
        if data.len() != expected {
            return Err(LumenError::ShapeMismatch {
                expected: vec![expected],
                got: vec![data.len()],
            });
        }
        let image = Self::new(desc);
        let a = image.accessor();
        let ch = desc.num_channels();
        for hy in 0..desc.height {
            for wx in 0..desc.width {
                let base = (hy * desc.width + wx) * ch;
                for c in 0..ch {
                    a.set(hy, wx, c, data[base + c]);
                }
            }
        }
        Ok(image)
    }

    /// View an image embedded in an existing buffer.
    pub fn view(buffer: Arc<Buffer>, desc: ImageDesc, byte_offset: usize) -> Result<Self> {
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

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn height(&self) -> usize {
        self.desc.height
    }

    pub fn width(&self) -> usize {
        self.desc.width
    }

    pub fn num_channels(&self) -> usize {
        self.desc.num_channels()
    }

    pub fn accessor(&self) -> ImageAccessor {
        ImageAccessor {
            ptr: unsafe { self.buffer.as_ptr().add(self.byte_offset) },
            data_type: self.desc.format.data_type(),
            channels: self.desc.num_channels(),
            h: self.desc.height,
            w: self.desc.width,
            pixel_byte_stride: self.desc.pixel_byte_stride,
            row_byte_stride: self.desc.row_byte_stride,
        }
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Image({}x{} {:?})",
            self.desc.height, self.desc.width, self.desc.format
        )
    }
}

/// Raw pixel access into an image.
///
/// Concurrent writes must target disjoint rows, which the engine's 2-D
/// fan-out guarantees.
#[derive(Clone, Copy)]
pub struct ImageAccessor {
    ptr: *mut u8,
    data_type: DataType,
    channels: usize,
    h: usize,
    w: usize,
    pixel_byte_stride: usize,
    row_byte_stride: usize,
}

unsafe impl Send for ImageAccessor {}
unsafe impl Sync for ImageAccessor {}

impl ImageAccessor {
    pub fn height(&self) -> usize {
        self.h
    }

    pub fn width(&self) -> usize {
        self.w
    }

    pub fn num_channels(&self) -> usize {
        self.channels
    }

    #[inline]
    fn channel_ptr(&self, h: usize, w: usize, c: usize) -> *mut u8 {
        debug_assert!(h < self.h && w < self.w && c < self.channels);
        let byte = h * self.row_byte_stride
            + w * self.pixel_byte_stride
            + c * self.data_type.element_byte_size();
        unsafe { self.ptr.add(byte) }
    }

    #[inline]
    pub fn get(&self, h: usize, w: usize, c: usize) -> f32 {
        let p = self.channel_ptr(h, w, c);
        unsafe {
            match self.data_type {
                DataType::F32 => (p as *const f32).read_unaligned(),
                DataType::F16 => (p as *const f16).read_unaligned().to_f32(),
            }
        }
    }

    #[inline]
    pub fn set(&self, h: usize, w: usize, c: usize, value: f32) {
        let p = self.channel_ptr(h, w, c);
        unsafe {
            match self.data_type {
                DataType::F32 => (p as *mut f32).write_unaligned(value),
                DataType::F16 => (p as *mut f16).write_unaligned(f16::from_f32(value)),
            }
        }
    }

    /// Read the first three channels of a pixel; missing channels read 0.
    #[inline]
    pub fn get3(&self, h: usize, w: usize) -> [f32; 3] {
        let mut out = [0.0f32; 3];
        for (c, v) in out.iter_mut().enumerate().take(self.channels.min(3)) {
            *v = self.get(h, w, c);
        }
        out
    }

    /// Write the first three channels of a pixel; extra components are
    /// dropped on narrower formats.
    #[inline]
    pub fn set3(&self, h: usize, w: usize, value: [f32; 3]) {
        for (c, v) in value.iter().enumerate().take(self.channels.min(3)) {
            self.set(h, w, c, *v);
        }
    }
}

/// A rectangular source region and its placement in the padded destination.
///
/// `h`/`w` are the region extents; `*_src_begin` addresses the source
/// image (or tensor, for the output direction), `*_dst_begin` the
/// destination. Enables processing images larger than the network's
/// working set by overlapping subregions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tile {
    pub h_src_begin: usize,
    pub w_src_begin: usize,
    pub h_dst_begin: usize,
    pub w_dst_begin: usize,
    pub h: usize,
    pub w: usize,
}
