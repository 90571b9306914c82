//! Weight and bias packing into the engine-preferred blocked layout.
//!
//! Convolution weights arrive as plain `Oihw` constants. The kernels read
//! them through a blocked `OIhw{B}i{B}o` arrangement so that the inner
//! accumulation walks contiguous memory. Packing also absorbs channel
//! padding: physical channels beyond the logical count get zero weights
//! and zero bias, which keeps padded output channels identically zero.

use lumen_core::{DataType, LumenError, Result, Tensor, TensorDesc, TensorLayout};

/// Pack an `Oihw` weight tensor for a convolution whose input is the
/// channel-concatenation of one or more sources.
///
/// `src_channels` lists `(logical, physical)` channel counts per source in
/// concatenation order; the logical counts must sum to the weight's input
/// dimension, and each physical count is the source tensor's (padded)
/// channel dimension. `dst_channels` is the physical output channel count.
///
/// Returns a private tensor in the blocked layout for `block_size`, with
/// zeros in every padded input and output slot.
pub fn pack_weight(
    weight: &Tensor,
    src_channels: &[(usize, usize)],
    dst_channels: usize,
    block_size: usize,
) -> Result<Tensor> {
    let desc = weight.desc();
    if desc.ndim() != 4 || desc.height() != 3 || desc.width() != 3 {
        return Err(LumenError::ShapeMismatch {
            expected: vec![0, 0, 3, 3],
            got: desc.dims.to_vec(),
        });
    }
    if desc.data_type != DataType::F32 {
        return Err(LumenError::UnsupportedDType(desc.data_type));
    }

    let out_logical = desc.dims[0];
    let in_logical = desc.dims[1];
    let logical_sum: usize = src_channels.iter().map(|&(l, _)| l).sum();
    if logical_sum != in_logical {
        return Err(LumenError::ShapeMismatch {
            expected: vec![in_logical],
            got: vec![logical_sum],
        });
    }
    let in_physical: usize = src_channels.iter().map(|&(_, p)| p).sum();
    debug_assert!(dst_channels >= out_logical && dst_channels % block_size == 0);
    debug_assert!(src_channels.iter().all(|&(l, p)| p >= l && p % block_size == 0));

    let src = weight.read_f32();
    let mut packed = vec![0.0f32; dst_channels * in_physical * 9];

    // Walk physical input channels, mapping each back to its source's
    // weight row (or zero for channel padding).
    let mut phys_base = 0;
    let mut logical_base = 0;
    for &(logical, physical) in src_channels {
        for local in 0..logical {
            let ci = phys_base + local;
            let wi = logical_base + local;
            for o in 0..out_logical {
                for kh in 0..3 {
                    for kw in 0..3 {
                        let v = src[((o * in_logical + wi) * 3 + kh) * 3 + kw];
                        packed[packed_index(o, ci, kh, kw, in_physical, block_size)] = v;
                    }
                }
            }
        }
        phys_base += physical;
        logical_base += logical;
    }

    Tensor::from_f32(
        TensorDesc::new(
            &[dst_channels, in_physical, 3, 3],
            TensorLayout::packed_weight(block_size),
            DataType::F32,
        ),
        &packed,
    )
}

/// Pack a 1-D bias vector, zero-padding it to the physical output channel
/// count.
pub fn pack_bias(bias: &Tensor, dst_channels: usize) -> Result<Tensor> {
    let desc = bias.desc();
    if desc.ndim() != 1 {
        return Err(LumenError::ShapeMismatch {
            expected: vec![0],
            got: desc.dims.to_vec(),
        });
    }
    if desc.data_type != DataType::F32 {
        return Err(LumenError::UnsupportedDType(desc.data_type));
    }
    let logical = desc.dims[0];
    debug_assert!(dst_channels >= logical);

    let mut packed = vec![0.0f32; dst_channels];
    packed[..logical].copy_from_slice(&bias.read_f32());
    Tensor::from_f32(
        TensorDesc::new(&[dst_channels], TensorLayout::X, DataType::F32),
        &packed,
    )
}

#[inline]
pub(crate) fn packed_index(
    o: usize,
    i: usize,
    kh: usize,
    kw: usize,
    in_channels: usize,
    block: usize,
) -> usize {
    let in_blocks = in_channels / block;
    (((((o / block) * in_blocks + i / block) * 3 + kh) * 3 + kw) * block + i % block) * block
        + o % block
}
