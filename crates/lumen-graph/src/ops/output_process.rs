use std::sync::Arc;

use parking_lot::RwLock;

use lumen_core::{Engine, Image, LumenError, Result, Tensor, TensorDesc, Tile, TransferFunction};
use lumen_kernels::OutputReorder;

use crate::op::{next_op_id, Op, OpId};

struct State {
    output: Option<Image>,
    tile: Tile,
}

/// Inverse of [`crate::InputProcess`] for the primary color channels:
/// reads channels [0..3) of its source op's tensor and writes the restored
/// pixels to an external output image at the tile position.
pub struct OutputProcess {
    id: OpId,
    name: String,
    src: Arc<dyn Op>,
    src_h: usize,
    src_w: usize,
    transfer: TransferFunction,
    hdr: bool,
    snorm: bool,
    state: RwLock<State>,
}

impl OutputProcess {
    pub(crate) fn new(
        name: &str,
        src: Arc<dyn Op>,
        transfer: TransferFunction,
        hdr: bool,
        snorm: bool,
    ) -> Result<Self> {
        let src_desc = src.dst_desc().ok_or_else(|| {
            LumenError::InvalidState(format!("{name}: source op has no destination tensor"))
        })?;
        if src_desc.num_channels() < 3 {
            return Err(LumenError::ShapeMismatch {
                expected: vec![3],
                got: vec![src_desc.num_channels()],
            });
        }
        let (src_h, src_w) = (src_desc.height(), src_desc.width());
        Ok(Self {
            id: next_op_id(),
            name: name.to_string(),
            src,
            src_h,
            src_w,
            transfer,
            hdr,
            snorm,
            state: RwLock::new(State {
                output: None,
                tile: Tile::default(),
            }),
        })
    }

    /// Set the output image for the next run.
    pub fn set_output(&self, output: &Image) -> Result<()> {
        if output.num_channels() < 3 {
            return Err(LumenError::ShapeMismatch {
                expected: vec![3],
                got: vec![output.num_channels()],
            });
        }
        self.state.write().output = Some(output.clone());
        Ok(())
    }

    /// Set the tile: source coordinates address the tensor, destination
    /// coordinates the output image.
    pub fn set_tile(&self, tile: Tile) {
        self.state.write().tile = tile;
    }
}

impl Op for OutputProcess {
    fn id(&self) -> OpId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn dst_desc(&self) -> Option<&TensorDesc> {
        None
    }

    fn set_dst(&self, _dst: Tensor) {
        unreachable!("output process writes to an external image")
    }

    fn dst(&self) -> Option<Tensor> {
        None
    }

    fn work_amount(&self) -> f64 {
        (self.src_h * self.src_w * 3) as f64
    }

    fn execute(&self, engine: &dyn Engine) -> Result<()> {
        let state = self.state.read();
        let src = self.src.dst().ok_or_else(|| {
            LumenError::InvalidState(format!("{}: source tensor not bound", self.name))
        })?;
        let output = state
            .output
            .as_ref()
            .ok_or_else(|| LumenError::InvalidState(format!("{}: no output image set", self.name)))?;
        let tile = state.tile;

        if tile.h + tile.h_src_begin > self.src_h || tile.w + tile.w_src_begin > self.src_w {
            return Err(LumenError::InvalidState(format!(
                "{}: tile exceeds source tensor bounds",
                self.name
            )));
        }
        if tile.h + tile.h_dst_begin > output.height() || tile.w + tile.w_dst_begin > output.width()
        {
            return Err(LumenError::InvalidState(format!(
                "{}: tile exceeds output image bounds",
                self.name
            )));
        }

        let kernel = OutputReorder {
            src: src.accessor(),
            output: output.accessor(),
            tile,
            transfer: self.transfer,
            hdr: self.hdr,
            snorm: self.snorm,
        };
        engine.submit_kernel_2d(tile.h, tile.w, &|h, w| kernel.run(h, w));
        Ok(())
    }
}
