use std::collections::HashMap;
use std::sync::Arc;

use lumen_core::{
    round_up, Buffer, Engine, LumenError, Result, Tensor, TensorDesc, TensorMap, TransferFunction,
};

use crate::op::{Activation, Op, OpId, PostOp};
use crate::ops::{ConcatConv, Conv, InputProcess, OutputProcess, Pool, Upsample};
use crate::planner::{AllocId, ArenaPlanner};
use crate::progress::Progress;

/// Byte alignment of every transient tensor in the scratch arena.
const TENSOR_ALIGNMENT: usize = 64;

/// Transient destination registered while building.
struct TensorAlloc {
    desc: TensorDesc,
    alloc_id: AllocId,
    /// Bound after planning.
    tensor: Option<Tensor>,
}

/// The operation graph: ops are added in topological order (sources must
/// already belong to the graph), the arena planner packs their transient
/// destinations into one scratch buffer, and `run` executes them in
/// insertion order with progress reporting and cancellation.
///
/// Lifecycle: `add_*` while building, then `scratch_byte_size` →
/// `set_scratch` → `finalize` → `run`. `clear` returns to the fresh state.
pub struct Graph {
    engine: Arc<dyn Engine>,
    const_tensors: Arc<TensorMap>,
    fast_math: bool,
    ops: Vec<Arc<dyn Op>>,
    op_index: HashMap<OpId, usize>,
    tensor_allocs: HashMap<OpId, TensorAlloc>,
    /// Concat convolutions plus whether the planner colocated their
    /// sources (a no-copy view) or the op must materialize a copy.
    concat_convs: Vec<(Arc<ConcatConv>, bool)>,
    planner: ArenaPlanner,
    scratch: Option<Arc<Buffer>>,
    tensor_scratch_byte_offset: usize,
    scratch_byte_size: usize,
    private_byte_size: usize,
    dirty: bool,
    finalized: bool,
}

impl Graph {
    pub fn new(engine: Arc<dyn Engine>, const_tensors: Arc<TensorMap>, fast_math: bool) -> Self {
        Self {
            engine,
            const_tensors,
            fast_math,
            ops: Vec::new(),
            op_index: HashMap::new(),
            tensor_allocs: HashMap::new(),
            concat_convs: Vec::new(),
            planner: ArenaPlanner::new(),
            scratch: None,
            tensor_scratch_byte_offset: 0,
            scratch_byte_size: 0,
            private_byte_size: 0,
            dirty: false,
            finalized: false,
        }
    }

    /// Add a tile-aware input reorder from source images of `src_dims`
    /// (logical C, H, W). The destination is padded to the engine's channel
    /// block and to `tile_alignment`.
    pub fn add_input_process(
        &mut self,
        name: &str,
        src_dims: &[usize],
        tile_alignment: usize,
        transfer: TransferFunction,
        hdr: bool,
        snorm: bool,
    ) -> Result<Arc<InputProcess>> {
        self.check_not_finalized()?;
        let op = Arc::new(InputProcess::new(
            self.engine.as_ref(),
            name,
            src_dims,
            tile_alignment,
            transfer,
            hdr,
            snorm,
        )?);
        self.register(op.clone(), &[])?;
        Ok(op)
    }

    /// Add the inverse reorder writing the primary color channels of
    /// `src`'s output to an external image.
    pub fn add_output_process(
        &mut self,
        name: &str,
        src: &Arc<dyn Op>,
        transfer: TransferFunction,
        hdr: bool,
        snorm: bool,
    ) -> Result<Arc<OutputProcess>> {
        self.check_not_finalized()?;
        self.check_source(src)?;
        let op = Arc::new(OutputProcess::new(name, src.clone(), transfer, hdr, snorm)?);
        self.register(op.clone(), &[src.clone()])?;
        Ok(op)
    }

    /// Add a 3x3 convolution. Weights come from
    /// `const_tensors["<name>.weight"]` and `["<name>.bias"]`; a fused
    /// `PostOp::Pool` halves the destination dims.
    pub fn add_conv(
        &mut self,
        name: &str,
        src: &Arc<dyn Op>,
        activation: Activation,
        post_op: PostOp,
    ) -> Result<Arc<dyn Op>> {
        self.check_not_finalized()?;
        self.check_source(src)?;
        let weight = self.const_tensor(&format!("{name}.weight"))?;
        let bias = self.const_tensor(&format!("{name}.bias"))?;
        let const_bytes = weight.byte_size() + bias.byte_size();
        let op: Arc<dyn Op> = Arc::new(Conv::new(
            self.engine.as_ref(),
            name,
            src.clone(),
            weight,
            bias,
            activation,
            post_op,
        )?);
        self.register(op.clone(), &[src.clone()])?;
        self.private_byte_size += const_bytes;
        Ok(op)
    }

    /// Add a convolution over the channel concatenation of two sources
    /// (U-Net skip connections). The planner colocates the sources so the
    /// concatenation is a no-copy view wherever possible.
    pub fn add_concat_conv(
        &mut self,
        name: &str,
        src1: &Arc<dyn Op>,
        src2: &Arc<dyn Op>,
        activation: Activation,
    ) -> Result<Arc<dyn Op>> {
        self.check_not_finalized()?;
        self.check_source(src1)?;
        self.check_source(src2)?;
        let weight = self.const_tensor(&format!("{name}.weight"))?;
        let bias = self.const_tensor(&format!("{name}.bias"))?;
        let const_bytes = weight.byte_size() + bias.byte_size();
        let op = Arc::new(ConcatConv::new(
            self.engine.as_ref(),
            name,
            src1.clone(),
            src2.clone(),
            weight,
            bias,
            activation,
        )?);
        self.register(op.clone(), &[src1.clone(), src2.clone()])?;

        // Colocation needs identical element sizes, which the op's shape
        // checks already enforce; the planner can still refuse when a
        // source is chained into another concatenation.
        let a = self.tensor_allocs[&src1.id()].alloc_id;
        let b = self.tensor_allocs[&src2.id()].alloc_id;
        let colocated = self.planner.concat_allocs(a, b);
        self.concat_convs.push((op.clone(), colocated));
        self.private_byte_size += const_bytes;
        Ok(op)
    }

    /// Add a 2x2 max pool, stride 2.
    pub fn add_pool(&mut self, name: &str, src: &Arc<dyn Op>) -> Result<Arc<dyn Op>> {
        self.check_not_finalized()?;
        self.check_source(src)?;
        let op: Arc<dyn Op> = Arc::new(Pool::new(name, src.clone())?);
        self.register(op.clone(), &[src.clone()])?;
        Ok(op)
    }

    /// Add a nearest-neighbor 2x upsample.
    pub fn add_upsample(&mut self, name: &str, src: &Arc<dyn Op>) -> Result<Arc<dyn Op>> {
        self.check_not_finalized()?;
        self.check_source(src)?;
        let op: Arc<dyn Op> = Arc::new(Upsample::new(name, src.clone())?);
        self.register(op.clone(), &[src.clone()])?;
        Ok(op)
    }

    /// Whether the engine can execute every op in the graph.
    pub fn is_supported(&self) -> bool {
        self.ops.iter().all(|op| op.support(self.engine.as_ref()))
    }

    /// Total scratch requirement: engine workspace followed by the tensor
    /// arena. Re-plans when the topology changed; monotone non-decreasing
    /// until `clear`.
    pub fn scratch_byte_size(&mut self) -> Result<usize> {
        if self.dirty {
            self.plan_allocs()?;
        }
        Ok(self.scratch_byte_size)
    }

    /// Assign the scratch buffer and bind every transient tensor at its
    /// planned offset.
    pub fn set_scratch(&mut self, buffer: Arc<Buffer>) -> Result<()> {
        let required = self.scratch_byte_size()?;
        if buffer.byte_size() < required {
            return Err(LumenError::ScratchTooSmall {
                required,
                actual: buffer.byte_size(),
            });
        }

        for op in &self.ops {
            if let Some(alloc) = self.tensor_allocs.get_mut(&op.id()) {
                let byte_offset =
                    self.tensor_scratch_byte_offset + self.planner.byte_offset(alloc.alloc_id);
                let tensor = Tensor::view(Arc::clone(&buffer), alloc.desc.clone(), byte_offset)?;
                alloc.tensor = Some(tensor.clone());
                op.set_dst(tensor);
            }
        }

        // Colocated concat inputs become one wider view starting at the
        // first source's offset.
        for (op, colocated) in &self.concat_convs {
            if !*colocated {
                continue;
            }
            let (src1, src2) = op.src_ids();
            let first = self.tensor_allocs[&src1]
                .tensor
                .as_ref()
                .expect("sources bound above");
            debug_assert_eq!(
                self.tensor_allocs[&src2]
                    .tensor
                    .as_ref()
                    .expect("sources bound above")
                    .byte_offset(),
                first.byte_offset() + first.byte_size()
            );
            let view = Tensor::view(
                Arc::clone(&buffer),
                op.concat_desc().clone(),
                first.byte_offset(),
            )?;
            op.set_concat(view);
        }

        self.scratch = Some(buffer);
        Ok(())
    }

    /// Total size of private allocations: constant tensors plus packed
    /// weights (populated by `finalize`).
    pub fn private_byte_size(&self) -> usize {
        self.private_byte_size
    }

    /// Sum of the ops' work estimates; the unit of progress reporting.
    pub fn work_amount(&self) -> f64 {
        self.ops.iter().map(|op| op.work_amount()).sum()
    }

    /// Run the per-op finalizers (weight packing) in insertion order.
    /// Requires the scratch to be bound; idempotent.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        if self.scratch.is_none() {
            return Err(LumenError::InvalidState("scratch buffer not set".into()));
        }
        if self.dirty {
            return Err(LumenError::InvalidState(
                "graph modified after scratch was bound".into(),
            ));
        }
        if !self.is_supported() {
            return Err(LumenError::Unsupported(
                "graph contains ops the engine cannot execute".into(),
            ));
        }
        for op in &self.ops {
            self.private_byte_size += op.finalize(self.engine.as_ref())?;
        }
        self.finalized = true;
        Ok(())
    }

    /// Execute ops in insertion order, reporting cumulative progress after
    /// each and stopping before the next op when the sink cancels.
    pub fn run(&self, progress: &mut dyn Progress) -> Result<()> {
        if !self.finalized {
            return Err(LumenError::InvalidState("graph not finalized".into()));
        }
        let total = self.work_amount();
        let mut done = 0.0;
        if !progress.update(0.0) {
            return Err(LumenError::Cancelled);
        }
        for op in &self.ops {
            op.execute(self.engine.as_ref())?;
            done += op.work_amount();
            let fraction = if total > 0.0 { (done / total).min(1.0) } else { 1.0 };
            if !progress.update(fraction) {
                self.engine.wait();
                return Err(LumenError::Cancelled);
            }
        }
        self.engine.wait();
        Ok(())
    }

    /// Drop all ops and allocations and return to the fresh state.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.op_index.clear();
        self.tensor_allocs.clear();
        self.concat_convs.clear();
        self.planner.clear();
        self.scratch = None;
        self.tensor_scratch_byte_offset = 0;
        self.scratch_byte_size = 0;
        self.private_byte_size = 0;
        self.dirty = false;
        self.finalized = false;
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn fast_math(&self) -> bool {
        self.fast_math
    }

    /// Re-run the planner and refresh the scratch layout:
    /// `[engine workspace | tensor arena]`.
    fn plan_allocs(&mut self) -> Result<()> {
        self.planner.plan()?;
        self.tensor_scratch_byte_offset =
            round_up(self.engine.scratch_byte_size(), TENSOR_ALIGNMENT);
        self.scratch_byte_size = self.tensor_scratch_byte_offset + self.planner.arena_byte_size();
        self.dirty = false;
        Ok(())
    }

    fn const_tensor(&self, name: &str) -> Result<Arc<Tensor>> {
        self.const_tensors
            .get(name)
            .cloned()
            .ok_or_else(|| LumenError::MissingConstant(name.to_string()))
    }

    fn check_not_finalized(&self) -> Result<()> {
        if self.finalized {
            return Err(LumenError::InvalidState(
                "cannot add ops to a finalized graph".into(),
            ));
        }
        Ok(())
    }

    fn check_source(&self, src: &Arc<dyn Op>) -> Result<()> {
        if !self.op_index.contains_key(&src.id()) {
            return Err(LumenError::InvalidState(format!(
                "source op '{}' does not belong to this graph",
                src.name()
            )));
        }
        Ok(())
    }

    /// Append an op: extend source lifetimes to this position and register
    /// a transient allocation for tensor destinations.
    fn register(&mut self, op: Arc<dyn Op>, srcs: &[Arc<dyn Op>]) -> Result<()> {
        let index = self.ops.len();
        for src in srcs {
            if let Some(alloc) = self.tensor_allocs.get(&src.id()) {
                self.planner.extend_death(alloc.alloc_id, index);
            }
        }
        if let Some(desc) = op.dst_desc() {
            let alloc_id = self
                .planner
                .add_alloc(desc.byte_size(), TENSOR_ALIGNMENT, index);
            self.tensor_allocs.insert(
                op.id(),
                TensorAlloc {
                    desc: desc.clone(),
                    alloc_id,
                    tensor: None,
                },
            );
        }
        self.op_index.insert(op.id(), index);
        self.ops.push(op);
        self.dirty = true;
        Ok(())
    }
}
