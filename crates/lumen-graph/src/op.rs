use std::sync::atomic::{AtomicUsize, Ordering};

use lumen_core::{Engine, Result, Tensor, TensorDesc};

/// Unique identifier for an op, assigned at construction.
///
/// The graph uses ids to verify that a source op was added to the same
/// graph before being referenced.
pub type OpId = usize;

static NEXT_OP_ID: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn next_op_id() -> OpId {
    NEXT_OP_ID.fetch_add(1, Ordering::Relaxed)
}

/// Activation fused into a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    None,
    Relu,
}

/// Post-op fused into a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOp {
    None,
    /// 2x2 max pool, stride 2; halves the destination dims.
    Pool,
}

/// A node of the operation graph.
///
/// Ops are created by the graph's `add_*` methods and execute in insertion
/// order, which is topological because sources must already belong to the
/// graph. The destination tensor is bound once after planning; `finalize`
/// runs once after binding (weight packing lands here) and returns the
/// private bytes it allocated.
pub trait Op: Send + Sync {
    fn id(&self) -> OpId;

    fn name(&self) -> &str;

    /// Output shape/layout, known at construction. `None` for ops that
    /// write to an external image instead of a tensor.
    fn dst_desc(&self) -> Option<&TensorDesc>;

    /// Bind the destination tensor. Called once by the graph after
    /// planning.
    fn set_dst(&self, dst: Tensor);

    /// The bound destination tensor, if any.
    fn dst(&self) -> Option<Tensor>;

    /// Logical channel count of the destination, before block padding.
    /// Consumers use it to line convolution weights up with the physical
    /// channels of their sources.
    fn num_channels(&self) -> usize {
        self.dst_desc().map_or(0, |d| d.num_channels())
    }

    /// Whether the engine can execute this op with these shapes/types.
    fn support(&self, _engine: &dyn Engine) -> bool {
        true
    }

    /// Relative cost estimate used as the progress weight. Monotone,
    /// non-negative.
    fn work_amount(&self) -> f64;

    /// One-time setup after tensors are bound. Returns the number of
    /// private (non-scratch) bytes allocated.
    fn finalize(&self, _engine: &dyn Engine) -> Result<usize> {
        Ok(0)
    }

    /// Issue the kernel. In-order relative to other ops.
    fn execute(&self, engine: &dyn Engine) -> Result<()>;
}
