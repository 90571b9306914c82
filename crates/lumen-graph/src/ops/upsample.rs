use std::sync::Arc;

use parking_lot::RwLock;

use lumen_core::{Engine, LumenError, Result, Tensor, TensorDesc};
use lumen_kernels::UpsampleNearest2x;

use crate::op::{next_op_id, Op, OpId};

/// Nearest-neighbor 2x upsampling. Output dims are `2H x 2W`; channels are
/// unchanged.
pub struct Upsample {
    id: OpId,
    name: String,
    src: Arc<dyn Op>,
    channels: usize,
    dst_desc: TensorDesc,
    dst: RwLock<Option<Tensor>>,
}

impl Upsample {
    pub(crate) fn new(name: &str, src: Arc<dyn Op>) -> Result<Self> {
        let src_desc = src
            .dst_desc()
            .ok_or_else(|| {
                LumenError::InvalidState(format!("{name}: source op has no destination tensor"))
            })?
            .clone();
        let dst_desc = TensorDesc::new(
            &[
                src_desc.num_channels(),
                src_desc.height() * 2,
                src_desc.width() * 2,
            ],
            src_desc.layout,
            src_desc.data_type,
        );
        Ok(Self {
            id: next_op_id(),
            name: name.to_string(),
            channels: src.num_channels(),
            src,
            dst_desc,
            dst: RwLock::new(None),
        })
    }
}

impl Op for Upsample {
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
        *self.dst.write() = Some(dst);
    }

    fn dst(&self) -> Option<Tensor> {
        self.dst.read().clone()
    }

    fn num_channels(&self) -> usize {
        self.channels
    }

    fn work_amount(&self) -> f64 {
        self.dst_desc.num_elements() as f64
    }

    fn execute(&self, engine: &dyn Engine) -> Result<()> {
        let dst = self.dst().ok_or_else(|| {
            LumenError::InvalidState(format!("{}: destination not bound", self.name))
        })?;
        let src = self.src.dst().ok_or_else(|| {
            LumenError::InvalidState(format!("{}: source tensor not bound", self.name))
        })?;
        let kernel = UpsampleNearest2x {
            src: src.accessor(),
            dst: dst.accessor(),
        };
        engine.submit_kernel_2d(self.dst_desc.height(), self.dst_desc.width(), &|h, w| {
            kernel.run(h, w)
        });
        Ok(())
    }
}
