use std::sync::Arc;

use parking_lot::RwLock;

use lumen_core::{Engine, LumenError, Result, Tensor, TensorDesc};
use lumen_kernels::MaxPool2x2;

use crate::op::{next_op_id, Op, OpId};

/// 2x2 max pooling, stride 2. Output dims are `floor(H/2) x floor(W/2)`;
/// channels are unchanged.
pub struct Pool {
    id: OpId,
    name: String,
    src: Arc<dyn Op>,
    channels: usize,
    dst_desc: TensorDesc,
    dst: RwLock<Option<Tensor>>,
}

impl Pool {
    pub(crate) fn new(name: &str, src: Arc<dyn Op>) -> Result<Self> {
        let src_desc = src
            .dst_desc()
            .ok_or_else(|| {
                LumenError::InvalidState(format!("{name}: source op has no destination tensor"))
            })?
            .clone();
        let (h, w) = (src_desc.height() / 2, src_desc.width() / 2);
        if h == 0 || w == 0 {
            return Err(LumenError::ShapeMismatch {
                expected: vec![2, 2],
                got: vec![src_desc.height(), src_desc.width()],
            });
        }
        let dst_desc = TensorDesc::new(
            &[src_desc.num_channels(), h, w],
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

impl Op for Pool {
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
        let kernel = MaxPool2x2 {
            src: src.accessor(),
            dst: dst.accessor(),
        };
        engine.submit_kernel_2d(self.dst_desc.height(), self.dst_desc.width(), &|h, w| {
            kernel.run(h, w)
        });
        Ok(())
    }
}
