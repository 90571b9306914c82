use parking_lot::RwLock;

use lumen_core::{
    round_up, Engine, Image, LumenError, Result, Tensor, TensorDesc, TensorLayout, Tile,
    TransferFunction,
};
use lumen_kernels::InputReorder;

use crate::op::{next_op_id, Op, OpId};

struct State {
    dst: Option<Tensor>,
    color: Option<Image>,
    albedo: Option<Image>,
    normal: Option<Image>,
    tile: Tile,
}

/// Tile-aware reorder from up to three source images (color, albedo,
/// normal) into the network's input tensor.
///
/// The destination is padded to the engine's channel block and to the tile
/// alignment; pixels outside the tile and channels beyond the present
/// sources read as zero. Source images and the tile are set per run.
pub struct InputProcess {
    id: OpId,
    name: String,
    channels: usize,
    dst_desc: TensorDesc,
    transfer: TransferFunction,
    hdr: bool,
    snorm: bool,
    state: RwLock<State>,
}

impl InputProcess {
    pub(crate) fn new(
        engine: &dyn Engine,
        name: &str,
        src_dims: &[usize],
        tile_alignment: usize,
        transfer: TransferFunction,
        hdr: bool,
        snorm: bool,
    ) -> Result<Self> {
        if src_dims.len() != 3 || src_dims[1] == 0 || src_dims[2] == 0 {
            return Err(LumenError::ShapeMismatch {
                expected: vec![0, 0, 0],
                got: src_dims.to_vec(),
            });
        }
        let block = engine.tensor_block_size();
        let dst_desc = TensorDesc::new(
            &[
                round_up(src_dims[0], block),
                round_up(src_dims[1], tile_alignment.max(1)),
                round_up(src_dims[2], tile_alignment.max(1)),
            ],
            TensorLayout::activation(block),
            engine.tensor_data_type(),
        );
        Ok(Self {
            id: next_op_id(),
            name: name.to_string(),
            channels: src_dims[0],
            dst_desc,
            transfer,
            hdr,
            snorm,
            state: RwLock::new(State {
                dst: None,
                color: None,
                albedo: None,
                normal: None,
                tile: Tile::default(),
            }),
        })
    }

    /// Set the source images for the next run. Present images must share
    /// one size and together fit the destination's channels.
    pub fn set_src(
        &self,
        color: Option<&Image>,
        albedo: Option<&Image>,
        normal: Option<&Image>,
    ) -> Result<()> {
        let present: Vec<&Image> = [color, albedo, normal].into_iter().flatten().collect();
        let total: usize = present.iter().map(|i| i.num_channels()).sum();
        if total > self.dst_desc.num_channels() {
            return Err(LumenError::ShapeMismatch {
                expected: vec![self.dst_desc.num_channels()],
                got: vec![total],
            });
        }
        if let Some(first) = present.first() {
            for img in &present[1..] {
                if img.height() != first.height() || img.width() != first.width() {
                    return Err(LumenError::ShapeMismatch {
                        expected: vec![first.height(), first.width()],
                        got: vec![img.height(), img.width()],
                    });
                }
            }
        }
        let mut state = self.state.write();
        state.color = color.cloned();
        state.albedo = albedo.cloned();
        state.normal = normal.cloned();
        Ok(())
    }

    /// Set the source region and its placement in the destination tensor.
    pub fn set_tile(&self, tile: Tile) {
        self.state.write().tile = tile;
    }
}

impl Op for InputProcess {
    fn id(&self) -> OpId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn dst_desc(&self) -> Option<&TensorDesc> {
        Some(&self.dst_desc)
    }

    fn set_dst(&self, dst: Tensor) {
        self.state.write().dst = Some(dst);
    }

    fn dst(&self) -> Option<Tensor> {
        self.state.read().dst.clone()
    }

    fn num_channels(&self) -> usize {
        self.channels
    }

    fn work_amount(&self) -> f64 {
        self.dst_desc.num_elements() as f64
    }

    fn execute(&self, engine: &dyn Engine) -> Result<()> {
        let state = self.state.read();
        let dst = state
            .dst
            .as_ref()
            .ok_or_else(|| LumenError::InvalidState(format!("{}: destination not bound", self.name)))?;
        let tile = state.tile;

        let input = state
            .color
            .as_ref()
            .or(state.albedo.as_ref())
            .or(state.normal.as_ref())
            .ok_or_else(|| LumenError::InvalidState(format!("{}: no source image set", self.name)))?;
        if tile.h + tile.h_src_begin > input.height() || tile.w + tile.w_src_begin > input.width() {
            return Err(LumenError::InvalidState(format!(
                "{}: tile exceeds source image bounds",
                self.name
            )));
        }
        if tile.h + tile.h_dst_begin > self.dst_desc.height()
            || tile.w + tile.w_dst_begin > self.dst_desc.width()
        {
            return Err(LumenError::InvalidState(format!(
                "{}: tile exceeds destination bounds",
                self.name
            )));
        }

        let kernel = InputReorder {
            color: state.color.as_ref().map(|i| i.accessor()),
            albedo: state.albedo.as_ref().map(|i| i.accessor()),
            normal: state.normal.as_ref().map(|i| i.accessor()),
            dst: dst.accessor(),
            tile,
            transfer: self.transfer,
            hdr: self.hdr,
            snorm: self.snorm,
        };
        engine.submit_kernel_2d(self.dst_desc.height(), self.dst_desc.width(), &|h, w| {
            kernel.run(h, w)
        });
        Ok(())
    }
}
