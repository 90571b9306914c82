use std::sync::Arc;

use parking_lot::RwLock;

use lumen_core::{
    round_up, DataType, Engine, LumenError, Result, Tensor, TensorDesc, TensorLayout,
};
use lumen_kernels::{pack_bias, pack_weight, BiasAccessor, ChannelConcat, Conv3x3, WeightAccessor};

use crate::op::{next_op_id, Activation, Op, OpId, PostOp};

fn check_weight(name: &str, weight: &Tensor, bias: &Tensor, in_channels: usize) -> Result<()> {
    let wd = weight.desc();
    if wd.ndim() != 4 || wd.height() != 3 || wd.width() != 3 {
        return Err(LumenError::ShapeMismatch {
            expected: vec![0, 0, 3, 3],
            got: wd.dims.to_vec(),
        });
    }
    if wd.dims[1] != in_channels {
        return Err(LumenError::ShapeMismatch {
            expected: vec![in_channels],
            got: vec![wd.dims[1]],
        });
    }
    if bias.desc().ndim() != 1 || bias.dims()[0] != wd.dims[0] {
        return Err(LumenError::ShapeMismatch {
            expected: vec![wd.dims[0]],
            got: bias.dims().to_vec(),
        });
    }
    if wd.data_type != DataType::F32 {
        return Err(LumenError::InvalidState(format!(
            "{name}: constant weights must be f32"
        )));
    }
    Ok(())
}

struct ConvState {
    dst: Option<Tensor>,
    packed_weight: Option<Tensor>,
    packed_bias: Option<Tensor>,
}

/// 3x3 convolution, stride 1, padding 1, with optional fused ReLU and 2x2
/// max-pool post-op (which halves the destination dims).
///
/// Weights and bias come from the graph's constant tensor map; `finalize`
/// packs them into the engine-preferred blocked layout as private tensors.
pub struct Conv {
    id: OpId,
    name: String,
    src: Arc<dyn Op>,
    weight: Arc<Tensor>,
    bias: Arc<Tensor>,
    activation: Activation,
    post_op: PostOp,
    channels: usize,
    dst_desc: TensorDesc,
    state: RwLock<ConvState>,
}

impl Conv {
    pub(crate) fn new(
        engine: &dyn Engine,
        name: &str,
        src: Arc<dyn Op>,
        weight: Arc<Tensor>,
        bias: Arc<Tensor>,
        activation: Activation,
        post_op: PostOp,
    ) -> Result<Self> {
        let src_desc = src
            .dst_desc()
            .ok_or_else(|| {
                LumenError::InvalidState(format!("{name}: source op has no destination tensor"))
            })?
            .clone();
        check_weight(name, &weight, &bias, src.num_channels())?;

        let out_logical = weight.dims()[0];
        let block = engine.tensor_block_size();
        let (h, w) = match post_op {
            PostOp::None => (src_desc.height(), src_desc.width()),
            PostOp::Pool => (src_desc.height() / 2, src_desc.width() / 2),
        };
        if h == 0 || w == 0 {
            return Err(LumenError::ShapeMismatch {
                expected: vec![2, 2],
                got: vec![src_desc.height(), src_desc.width()],
            });
        }
        let dst_desc = TensorDesc::new(
            &[round_up(out_logical, block), h, w],
            TensorLayout::activation(block),
            engine.tensor_data_type(),
        );
        Ok(Self {
            id: next_op_id(),
            name: name.to_string(),
            src,
            weight,
            bias,
            activation,
            post_op,
            channels: out_logical,
            dst_desc,
            state: RwLock::new(ConvState {
                dst: None,
                packed_weight: None,
                packed_bias: None,
            }),
        })
    }
}

impl Op for Conv {
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

    fn support(&self, engine: &dyn Engine) -> bool {
        self.dst_desc.block_size() == engine.tensor_block_size()
            && self.weight.dims()[1] <= self.src.dst_desc().map_or(0, |d| d.num_channels())
    }

    fn work_amount(&self) -> f64 {
        // Two flops per weight tap, per output element.
        let src_c = self.src.dst_desc().map_or(0, |d| d.num_channels());
        self.dst_desc.num_elements() as f64 * (src_c * 9 * 2) as f64
    }

    fn finalize(&self, engine: &dyn Engine) -> Result<usize> {
        let mut state = self.state.write();
        if state.packed_weight.is_some() {
            return Ok(0);
        }
        let src_physical = self.src.dst_desc().map_or(0, |d| d.num_channels());
        let block = engine.tensor_block_size();
        let packed_weight = pack_weight(
            &self.weight,
            &[(self.weight.dims()[1], src_physical)],
            self.dst_desc.num_channels(),
            block,
        )?;
        let packed_bias = pack_bias(&self.bias, self.dst_desc.num_channels())?;
        let bytes = packed_weight.byte_size() + packed_bias.byte_size();
        state.packed_weight = Some(packed_weight);
        state.packed_bias = Some(packed_bias);
        Ok(bytes)
    }

    fn execute(&self, engine: &dyn Engine) -> Result<()> {
        let state = self.state.read();
        let dst = state
            .dst
            .as_ref()
            .ok_or_else(|| LumenError::InvalidState(format!("{}: destination not bound", self.name)))?;
        let src = self.src.dst().ok_or_else(|| {
            LumenError::InvalidState(format!("{}: source tensor not bound", self.name))
        })?;
        let (packed_weight, packed_bias) = match (&state.packed_weight, &state.packed_bias) {
            (Some(w), Some(b)) => (w, b),
            _ => {
                return Err(LumenError::InvalidState(format!(
                    "{}: not finalized",
                    self.name
                )))
            }
        };

        let kernel = Conv3x3 {
            src: src.accessor(),
            weight: WeightAccessor::new(packed_weight),
            bias: BiasAccessor::new(packed_bias),
            dst: dst.accessor(),
            relu: self.activation == Activation::Relu,
            pool: self.post_op == PostOp::Pool,
        };
        engine.submit_kernel_2d(self.dst_desc.height(), self.dst_desc.width(), &|h, w| {
            kernel.run(h, w)
        });
        Ok(())
    }
}

struct ConcatConvState {
    dst: Option<Tensor>,
    /// No-copy view over the two adjacently placed sources.
    concat: Option<Tensor>,
    /// Private fallback when the planner refused colocation.
    materialized: Option<Tensor>,
    packed_weight: Option<Tensor>,
    packed_bias: Option<Tensor>,
}

/// Channel concatenation of two sources followed by a 3x3 convolution.
///
/// The planner places the sources adjacently in the scratch arena so the
/// concatenation is a view; when it cannot (mismatched element sizes),
/// the op materializes the concatenated input into a private tensor
/// instead. Weight packing maps each physical source channel to its weight
/// row across the concatenated space.
pub struct ConcatConv {
    id: OpId,
    name: String,
    src1: Arc<dyn Op>,
    src2: Arc<dyn Op>,
    weight: Arc<Tensor>,
    bias: Arc<Tensor>,
    activation: Activation,
    channels: usize,
    concat_desc: TensorDesc,
    dst_desc: TensorDesc,
    state: RwLock<ConcatConvState>,
}

impl ConcatConv {
    pub(crate) fn new(
        engine: &dyn Engine,
        name: &str,
        src1: Arc<dyn Op>,
        src2: Arc<dyn Op>,
        weight: Arc<Tensor>,
        bias: Arc<Tensor>,
        activation: Activation,
    ) -> Result<Self> {
        let d1 = src1
            .dst_desc()
            .ok_or_else(|| {
                LumenError::InvalidState(format!("{name}: source op has no destination tensor"))
            })?
            .clone();
        let d2 = src2
            .dst_desc()
            .ok_or_else(|| {
                LumenError::InvalidState(format!("{name}: source op has no destination tensor"))
            })?
            .clone();
        if d1.height() != d2.height() || d1.width() != d2.width() {
            return Err(LumenError::ShapeMismatch {
                expected: vec![d1.height(), d1.width()],
                got: vec![d2.height(), d2.width()],
            });
        }
        if d1.layout != d2.layout || d1.data_type != d2.data_type {
            return Err(LumenError::InvalidState(format!(
                "{name}: concat sources must share layout and element type"
            )));
        }
        check_weight(name, &weight, &bias, src1.num_channels() + src2.num_channels())?;

        let out_logical = weight.dims()[0];
        let block = engine.tensor_block_size();
        let concat_desc = TensorDesc::new(
            &[d1.num_channels() + d2.num_channels(), d1.height(), d1.width()],
            d1.layout,
            d1.data_type,
        );
        let dst_desc = TensorDesc::new(
            &[round_up(out_logical, block), d1.height(), d1.width()],
            TensorLayout::activation(block),
            engine.tensor_data_type(),
        );
        Ok(Self {
            id: next_op_id(),
            name: name.to_string(),
            src1,
            src2,
            weight,
            bias,
            activation,
            channels: out_logical,
            concat_desc,
            dst_desc,
            state: RwLock::new(ConcatConvState {
                dst: None,
                concat: None,
                materialized: None,
                packed_weight: None,
                packed_bias: None,
            }),
        })
    }

    /// Descriptor of the concatenated input view.
    pub(crate) fn concat_desc(&self) -> &TensorDesc {
        &self.concat_desc
    }

    /// Ids of the two concatenation sources, in channel order.
    pub(crate) fn src_ids(&self) -> (OpId, OpId) {
        (self.src1.id(), self.src2.id())
    }

    /// Bind the no-copy concatenated view built by the graph after
    /// planning.
    pub(crate) fn set_concat(&self, concat: Tensor) {
        self.state.write().concat = Some(concat);
    }

    /// Whether the op runs through the materialized fallback.
    pub fn is_materialized(&self) -> bool {
        self.state.read().materialized.is_some()
    }
}

impl Op for ConcatConv {
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

    fn support(&self, engine: &dyn Engine) -> bool {
        self.dst_desc.block_size() == engine.tensor_block_size()
    }

    fn work_amount(&self) -> f64 {
        self.dst_desc.num_elements() as f64 * (self.concat_desc.num_channels() * 9 * 2) as f64
    }

    fn finalize(&self, engine: &dyn Engine) -> Result<usize> {
        let mut state = self.state.write();
        if state.packed_weight.is_some() {
            return Ok(0);
        }
        let mut bytes = 0;
        if state.concat.is_none() {
            // Colocation was refused: fall back to a private concat copy.
            let materialized = Tensor::new(self.concat_desc.clone());
            bytes += materialized.byte_size();
            state.materialized = Some(materialized);
        }

        let block = engine.tensor_block_size();
        let c1 = (
            self.src1.num_channels(),
            self.src1.dst_desc().map_or(0, |d| d.num_channels()),
        );
        let c2 = (
            self.src2.num_channels(),
            self.src2.dst_desc().map_or(0, |d| d.num_channels()),
        );
        let packed_weight =
            pack_weight(&self.weight, &[c1, c2], self.dst_desc.num_channels(), block)?;
        let packed_bias = pack_bias(&self.bias, self.dst_desc.num_channels())?;
        bytes += packed_weight.byte_size() + packed_bias.byte_size();
        state.packed_weight = Some(packed_weight);
        state.packed_bias = Some(packed_bias);
        Ok(bytes)
    }

    fn execute(&self, engine: &dyn Engine) -> Result<()> {
        let state = self.state.read();
        let dst = state
            .dst
            .as_ref()
            .ok_or_else(|| LumenError::InvalidState(format!("{}: destination not bound", self.name)))?;
        let (packed_weight, packed_bias) = match (&state.packed_weight, &state.packed_bias) {
            (Some(w), Some(b)) => (w, b),
            _ => {
                return Err(LumenError::InvalidState(format!(
                    "{}: not finalized",
                    self.name
                )))
            }
        };

        let concat = if let Some(view) = &state.concat {
            view
        } else {
            let materialized = state.materialized.as_ref().ok_or_else(|| {
                LumenError::InvalidState(format!("{}: concat input not bound", self.name))
            })?;
            let src1 = self.src1.dst().ok_or_else(|| {
                LumenError::InvalidState(format!("{}: source tensor not bound", self.name))
            })?;
            let src2 = self.src2.dst().ok_or_else(|| {
                LumenError::InvalidState(format!("{}: source tensor not bound", self.name))
            })?;
            let copy = ChannelConcat {
                src1: src1.accessor(),
                src2: src2.accessor(),
                dst: materialized.accessor(),
            };
            engine.submit_kernel_2d(self.concat_desc.height(), self.concat_desc.width(), &|h, w| {
                copy.run(h, w)
            });
            materialized
        };

        let kernel = Conv3x3 {
            src: concat.accessor(),
            weight: WeightAccessor::new(packed_weight),
            bias: BiasAccessor::new(packed_bias),
            dst: dst.accessor(),
            relu: self.activation == Activation::Relu,
            pool: false,
        };
        engine.submit_kernel_2d(self.dst_desc.height(), self.dst_desc.width(), &|h, w| {
            kernel.run(h, w)
        });
        Ok(())
    }
}
