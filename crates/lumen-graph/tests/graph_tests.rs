//! End-to-end tests for the operation graph: build, plan, finalize, run.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use lumen_core::{
    CpuEngine, DataType, Engine, Image, ImageDesc, LumenError, PixelFormat, Storage, Tensor,
    TensorDesc, TensorLayout, TensorMap, Tile, TransferCurve, TransferFunction,
};
use lumen_graph::{
    Activation, Graph, InputProcess, NullProgress, Op, OutputProcess, PostOp, ProgressFn,
};

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch: {} vs {}", a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!(
            (x - y).abs() <= tol * y.abs().max(1.0),
            "element {} differs: {} vs {} (tol={})",
            i,
            x,
            y,
            tol
        );
    }
}

fn insert_conv_consts(map: &mut TensorMap, name: &str, out_c: usize, in_c: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let weight: Vec<f32> = (0..out_c * in_c * 9).map(|_| rng.gen_range(-0.2..0.2)).collect();
    let bias: Vec<f32> = (0..out_c).map(|_| rng.gen_range(-0.05..0.05)).collect();
    map.insert(
        format!("{name}.weight"),
        Arc::new(
            Tensor::from_f32(
                TensorDesc::new(&[out_c, in_c, 3, 3], TensorLayout::Oihw, DataType::F32),
                &weight,
            )
            .unwrap(),
        ),
    );
    map.insert(
        format!("{name}.bias"),
        Arc::new(
            Tensor::from_f32(
                TensorDesc::new(&[out_c], TensorLayout::X, DataType::F32),
                &bias,
            )
            .unwrap(),
        ),
    );
}

fn color_image(h: usize, w: usize, seed: u64) -> Image {
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f32> = (0..h * w * 3).map(|_| rng.gen_range(0.0..1.0)).collect();
    Image::from_f32(ImageDesc::new(PixelFormat::Float3, h, w), &data).unwrap()
}

fn full_tile(h: usize, w: usize) -> Tile {
    Tile {
        h,
        w,
        ..Tile::default()
    }
}

fn linear() -> TransferFunction {
    TransferFunction::new(TransferCurve::Linear)
}

// ============================================================================
// U-Net shaped graph used by several tests
// ============================================================================

fn unet_consts() -> Arc<TensorMap> {
    let mut map = TensorMap::new();
    insert_conv_consts(&mut map, "enc1", 12, 9, 100);
    insert_conv_consts(&mut map, "enc2", 16, 12, 101);
    insert_conv_consts(&mut map, "dec1", 3, 16, 102);
    Arc::new(map)
}

struct Unet {
    input: Arc<InputProcess>,
    output: Arc<OutputProcess>,
    ops: Vec<Arc<dyn Op>>,
}

/// InputProcess -> Conv(enc1, ReLU) -> Pool -> Conv(enc2, ReLU) ->
/// Upsample -> Conv(dec1, ReLU) -> OutputProcess over a 16x16 tile.
fn add_unet(graph: &mut Graph) -> Unet {
    let input = graph
        .add_input_process("input", &[9, 16, 16], 1, linear(), false, false)
        .unwrap();
    let input_op: Arc<dyn Op> = input.clone();
    let e1 = graph
        .add_conv("enc1", &input_op, Activation::Relu, PostOp::None)
        .unwrap();
    let p1 = graph.add_pool("pool1", &e1).unwrap();
    let e2 = graph
        .add_conv("enc2", &p1, Activation::Relu, PostOp::None)
        .unwrap();
    let u1 = graph.add_upsample("up1", &e2).unwrap();
    let d1 = graph
        .add_conv("dec1", &u1, Activation::Relu, PostOp::None)
        .unwrap();
    let output = graph
        .add_output_process("output", &d1, linear(), false, false)
        .unwrap();
    let output_op: Arc<dyn Op> = output.clone();
    Unet {
        input,
        output,
        ops: vec![input_op, e1, p1, e2, u1, d1, output_op],
    }
}

fn prepare(graph: &mut Graph, engine: &Arc<CpuEngine>) -> usize {
    let size = graph.scratch_byte_size().unwrap();
    graph
        .set_scratch(engine.new_buffer(size, Storage::Host))
        .unwrap();
    graph.finalize().unwrap();
    size
}

// ============================================================================
// End-to-end runs
// ============================================================================

#[test]
fn test_unet_runs_end_to_end() {
    let engine = Arc::new(CpuEngine::new());
    let mut graph = Graph::new(engine.clone(), unet_consts(), false);
    let unet = add_unet(&mut graph);

    assert!(graph.is_supported());
    let size = graph.scratch_byte_size().unwrap();
    assert!(size > 0);
    graph
        .set_scratch(engine.new_buffer(size, Storage::Host))
        .unwrap();
    graph.finalize().unwrap();
    assert!(graph.private_byte_size() > 0);

    let color = color_image(16, 16, 1);
    let out = Image::new(ImageDesc::new(PixelFormat::Float3, 16, 16));
    unet.input.set_src(Some(&color), None, None).unwrap();
    unet.input.set_tile(full_tile(16, 16));
    unet.output.set_output(&out).unwrap();
    unet.output.set_tile(full_tile(16, 16));

    graph.run(&mut NullProgress).unwrap();

    assert_eq!(out.height(), color.height());
    assert_eq!(out.width(), color.width());
    let a = out.accessor();
    for h in 0..16 {
        for w in 0..16 {
            for v in a.get3(h, w) {
                assert!(v.is_finite());
            }
        }
    }
}

#[test]
fn test_unet_blocked_matches_planar() {
    // The same network through block-1 and block-8 engines must agree.
    let run_with = |block: usize| {
        let engine = Arc::new(CpuEngine::with_block_size(block));
        let mut graph = Graph::new(engine.clone(), unet_consts(), false);
        let unet = add_unet(&mut graph);
        prepare(&mut graph, &engine);

        let color = color_image(16, 16, 1);
        let out = Image::new(ImageDesc::new(PixelFormat::Float3, 16, 16));
        unet.input.set_src(Some(&color), None, None).unwrap();
        unet.input.set_tile(full_tile(16, 16));
        unet.output.set_output(&out).unwrap();
        unet.output.set_tile(full_tile(16, 16));
        graph.run(&mut NullProgress).unwrap();

        let a = out.accessor();
        let mut pixels = Vec::new();
        for h in 0..16 {
            for w in 0..16 {
                pixels.extend(a.get3(h, w));
            }
        }
        pixels
    };
    assert_close(&run_with(8), &run_with(1), 1e-5);
}

// ============================================================================
// Scratch planning
// ============================================================================

#[test]
fn test_scratch_size_monotone() {
    let engine = Arc::new(CpuEngine::new());
    let mut consts = TensorMap::new();
    insert_conv_consts(&mut consts, "enc1", 12, 9, 100);
    insert_conv_consts(&mut consts, "enc2", 16, 12, 101);
    insert_conv_consts(&mut consts, "dec1", 3, 16, 102);
    insert_conv_consts(&mut consts, "extra", 4, 3, 103);
    let mut graph = Graph::new(engine, Arc::new(consts), false);

    let input = graph
        .add_input_process("input", &[9, 16, 16], 1, linear(), false, false)
        .unwrap();
    let input_op: Arc<dyn Op> = input;
    let mut prev = 0;
    let e1 = graph
        .add_conv("enc1", &input_op, Activation::Relu, PostOp::None)
        .unwrap();
    let size = graph.scratch_byte_size().unwrap();
    assert!(size >= prev);
    prev = size;

    let e2 = graph
        .add_conv("enc2", &e1, Activation::Relu, PostOp::None)
        .unwrap();
    let size = graph.scratch_byte_size().unwrap();
    assert!(size >= prev);
    prev = size;

    let d1 = graph
        .add_conv("dec1", &e2, Activation::Relu, PostOp::None)
        .unwrap();
    let size = graph.scratch_byte_size().unwrap();
    assert!(size >= prev);
    prev = size;

    graph
        .add_conv("extra", &d1, Activation::None, PostOp::None)
        .unwrap();
    assert!(graph.scratch_byte_size().unwrap() >= prev);
}

#[test]
fn test_rebuild_is_deterministic() {
    let engine = Arc::new(CpuEngine::new());
    let mut graph = Graph::new(engine.clone(), unet_consts(), false);

    let unet = add_unet(&mut graph);
    let size = prepare(&mut graph, &engine);
    let offsets: Vec<usize> = unet
        .ops
        .iter()
        .filter_map(|op| op.dst())
        .map(|t| t.byte_offset())
        .collect();

    let color = color_image(16, 16, 3);
    let out = Image::new(ImageDesc::new(PixelFormat::Float3, 16, 16));
    unet.input.set_src(Some(&color), None, None).unwrap();
    unet.input.set_tile(full_tile(16, 16));
    unet.output.set_output(&out).unwrap();
    unet.output.set_tile(full_tile(16, 16));
    graph.run(&mut NullProgress).unwrap();

    // Rebuild the identical graph after clear: same size, same offsets.
    graph.clear();
    assert_eq!(graph.num_ops(), 0);
    let unet2 = add_unet(&mut graph);
    let size2 = graph.scratch_byte_size().unwrap();
    assert_eq!(size2, size);
    graph
        .set_scratch(engine.new_buffer(size2, Storage::Host))
        .unwrap();
    graph.finalize().unwrap();
    let offsets2: Vec<usize> = unet2
        .ops
        .iter()
        .filter_map(|op| op.dst())
        .map(|t| t.byte_offset())
        .collect();
    assert_eq!(offsets, offsets2);
}

#[test]
fn test_bound_tensors_fit_scratch() {
    let engine = Arc::new(CpuEngine::new());
    let mut graph = Graph::new(engine.clone(), unet_consts(), false);
    let unet = add_unet(&mut graph);
    let size = prepare(&mut graph, &engine);

    for op in &unet.ops {
        if let Some(t) = op.dst() {
            assert!(t.byte_offset() + t.byte_size() <= size);
        }
    }
}

// ============================================================================
// Concat convolution: no-copy view vs materialized fallback
// ============================================================================

#[test]
fn test_concat_conv_view_matches_materialized() {
    let engine = Arc::new(CpuEngine::new());
    let mut map = TensorMap::new();
    insert_conv_consts(&mut map, "a", 4, 9, 200);
    insert_conv_consts(&mut map, "b", 6, 4, 201);
    insert_conv_consts(&mut map, "dec", 5, 10, 202);
    // Identical weights under a second name: the same convolution through
    // the materialized-concat path.
    map.insert("dec2.weight".into(), map["dec.weight"].clone());
    map.insert("dec2.bias".into(), map["dec.bias"].clone());
    insert_conv_consts(&mut map, "keep", 1, 10, 203);

    let mut graph = Graph::new(engine.clone(), Arc::new(map), false);
    let input = graph
        .add_input_process("input", &[9, 8, 8], 1, linear(), false, false)
        .unwrap();
    let input_op: Arc<dyn Op> = input.clone();
    let a = graph
        .add_conv("a", &input_op, Activation::Relu, PostOp::None)
        .unwrap();
    let b = graph
        .add_conv("b", &a, Activation::Relu, PostOp::None)
        .unwrap();
    // First concat gets the colocated view; the second finds `a` already
    // chained and must materialize.
    let cc1 = graph
        .add_concat_conv("dec", &a, &b, Activation::Relu)
        .unwrap();
    let cc2 = graph
        .add_concat_conv("dec2", &a, &b, Activation::Relu)
        .unwrap();
    // Final consumer keeps both results live to the end of the run.
    let _keep = graph
        .add_concat_conv("keep", &cc1, &cc2, Activation::None)
        .unwrap();

    assert!(graph.is_supported());
    prepare(&mut graph, &engine);

    // Colocation: b starts exactly where a ends.
    let (at, bt) = (a.dst().unwrap(), b.dst().unwrap());
    assert_eq!(at.byte_offset() + at.byte_size(), bt.byte_offset());

    let color = color_image(8, 8, 5);
    input.set_src(Some(&color), None, None).unwrap();
    input.set_tile(full_tile(8, 8));
    graph.run(&mut NullProgress).unwrap();

    // Bitwise equality between the view path and the copy path.
    let v1 = cc1.dst().unwrap().read_f32();
    let v2 = cc2.dst().unwrap().read_f32();
    assert_eq!(v1, v2);
    assert!(v1.iter().any(|&v| v != 0.0));
}

#[test]
fn test_concat_conv_matches_reference() {
    // The colocated concat conv must equal a conv computed by hand over
    // the concatenated channels.
    let engine = Arc::new(CpuEngine::with_block_size(1));
    let mut map = TensorMap::new();
    insert_conv_consts(&mut map, "a", 2, 3, 300);
    insert_conv_consts(&mut map, "b", 3, 2, 301);
    insert_conv_consts(&mut map, "dec", 2, 5, 302);
    let map = Arc::new(map);

    let mut graph = Graph::new(engine.clone(), map.clone(), false);
    let input = graph
        .add_input_process("input", &[3, 6, 6], 1, linear(), false, false)
        .unwrap();
    let input_op: Arc<dyn Op> = input.clone();
    let a = graph
        .add_conv("a", &input_op, Activation::Relu, PostOp::None)
        .unwrap();
    let b = graph
        .add_conv("b", &a, Activation::Relu, PostOp::None)
        .unwrap();
    let cc = graph
        .add_concat_conv("dec", &a, &b, Activation::None)
        .unwrap();
    prepare(&mut graph, &engine);

    let color = color_image(6, 6, 6);
    input.set_src(Some(&color), None, None).unwrap();
    input.set_tile(full_tile(6, 6));
    graph.run(&mut NullProgress).unwrap();

    // With block size 1 nothing is padded: concatenate a|b and convolve.
    let av = a.dst().unwrap().read_f32();
    let bv = b.dst().unwrap().read_f32();
    let mut concat = av.clone();
    concat.extend_from_slice(&bv);

    let weight = map["dec.weight"].read_f32();
    let bias = map["dec.bias"].read_f32();
    let (ci, co, h, w) = (5usize, 2usize, 6usize, 6usize);
    let mut want = vec![0.0f32; co * h * w];
    for oc in 0..co {
        for oh in 0..h {
            for ow in 0..w {
                let mut acc = bias[oc];
                for ic in 0..ci {
                    for kh in 0..3usize {
                        for kw in 0..3usize {
                            let ih = oh as isize + kh as isize - 1;
                            let iw = ow as isize + kw as isize - 1;
                            if ih < 0 || iw < 0 || ih >= h as isize || iw >= w as isize {
                                continue;
                            }
                            acc += concat[(ic * h + ih as usize) * w + iw as usize]
                                * weight[((oc * ci + ic) * 3 + kh) * 3 + kw];
                        }
                    }
                }
                want[(oc * h + oh) * w + ow] = acc;
            }
        }
    }
    assert_close(&cc.dst().unwrap().read_f32(), &want, 1e-5);
}

// ============================================================================
// Progress and cancellation
// ============================================================================

#[test]
fn test_progress_law() {
    let engine = Arc::new(CpuEngine::new());
    let mut graph = Graph::new(engine.clone(), unet_consts(), false);
    let unet = add_unet(&mut graph);
    prepare(&mut graph, &engine);

    let color = color_image(16, 16, 7);
    let out = Image::new(ImageDesc::new(PixelFormat::Float3, 16, 16));
    unet.input.set_src(Some(&color), None, None).unwrap();
    unet.input.set_tile(full_tile(16, 16));
    unet.output.set_output(&out).unwrap();
    unet.output.set_tile(full_tile(16, 16));

    let mut fractions = Vec::new();
    let mut sink = ProgressFn(|f| {
        fractions.push(f);
        true
    });
    graph.run(&mut sink).unwrap();

    assert_eq!(fractions.len(), unet.ops.len() + 1);
    assert_eq!(fractions[0], 0.0);
    for pair in fractions.windows(2) {
        assert!(pair[1] >= pair[0], "progress decreased: {pair:?}");
    }
    assert!((fractions.last().unwrap() - 1.0).abs() < 1e-9);
}

#[test]
fn test_cancellation_stops_prefix() {
    let engine = Arc::new(CpuEngine::new());
    let mut graph = Graph::new(engine.clone(), unet_consts(), false);
    let unet = add_unet(&mut graph);
    prepare(&mut graph, &engine);

    let color = color_image(16, 16, 9);
    let out = Image::new(ImageDesc::new(PixelFormat::Float3, 16, 16));
    unet.input.set_src(Some(&color), None, None).unwrap();
    unet.input.set_tile(full_tile(16, 16));
    unet.output.set_output(&out).unwrap();
    unet.output.set_tile(full_tile(16, 16));

    // The first op whose cumulative fraction reaches 0.5 is the last one
    // allowed to execute.
    let total: f64 = unet.ops.iter().map(|op| op.work_amount()).sum();
    let mut cumulative = 0.0;
    let mut expected_executed = 0;
    for op in &unet.ops {
        cumulative += op.work_amount();
        expected_executed += 1;
        if cumulative / total >= 0.5 {
            break;
        }
    }

    let mut updates = 0usize;
    let mut sink = ProgressFn(|f: f64| {
        updates += 1;
        f < 0.5
    });
    let err = graph.run(&mut sink).unwrap_err();
    assert!(matches!(err, LumenError::Cancelled));
    // One initial update plus one per executed op.
    assert_eq!(updates - 1, expected_executed);
    assert!(expected_executed < unet.ops.len());
}

// ============================================================================
// Misconfiguration fails fast
// ============================================================================

#[test]
fn test_run_before_finalize_fails() {
    let engine = Arc::new(CpuEngine::new());
    let mut graph = Graph::new(engine, unet_consts(), false);
    add_unet(&mut graph);
    let err = graph.run(&mut NullProgress).unwrap_err();
    assert!(matches!(err, LumenError::InvalidState(_)));
}

#[test]
fn test_add_after_finalize_fails() {
    let engine = Arc::new(CpuEngine::new());
    let mut graph = Graph::new(engine.clone(), unet_consts(), false);
    let unet = add_unet(&mut graph);
    prepare(&mut graph, &engine);

    let last: Arc<dyn Op> = unet.ops[5].clone();
    let err = graph
        .add_pool("late", &last)
        .err()
        .expect("expected error");
    assert!(matches!(err, LumenError::InvalidState(_)));
}

#[test]
fn test_scratch_too_small_fails() {
    let engine = Arc::new(CpuEngine::new());
    let mut graph = Graph::new(engine.clone(), unet_consts(), false);
    add_unet(&mut graph);
    let size = graph.scratch_byte_size().unwrap();
    let err = graph
        .set_scratch(engine.new_buffer(size - 1, Storage::Host))
        .unwrap_err();
    assert!(matches!(err, LumenError::ScratchTooSmall { .. }));
}

#[test]
fn test_foreign_source_fails() {
    let engine = Arc::new(CpuEngine::new());
    let mut graph_a = Graph::new(engine.clone(), unet_consts(), false);
    let foreign = graph_a
        .add_input_process("input", &[9, 16, 16], 1, linear(), false, false)
        .unwrap();
    let foreign_op: Arc<dyn Op> = foreign;

    let mut graph_b = Graph::new(engine, unet_consts(), false);
    let err = graph_b
        .add_conv("enc1", &foreign_op, Activation::Relu, PostOp::None)
        .err()
        .expect("expected error");
    assert!(matches!(err, LumenError::InvalidState(_)));
}

#[test]
fn test_missing_constant_fails() {
    let engine = Arc::new(CpuEngine::new());
    let mut graph = Graph::new(engine, Arc::new(TensorMap::new()), false);
    let input = graph
        .add_input_process("input", &[9, 16, 16], 1, linear(), false, false)
        .unwrap();
    let input_op: Arc<dyn Op> = input;
    let err = graph
        .add_conv("enc1", &input_op, Activation::Relu, PostOp::None)
        .err()
        .expect("expected error");
    assert!(matches!(err, LumenError::MissingConstant(_)));
}

#[test]
fn test_finalize_before_scratch_fails() {
    let engine = Arc::new(CpuEngine::new());
    let mut graph = Graph::new(engine, unet_consts(), false);
    add_unet(&mut graph);
    let err = graph.finalize().unwrap_err();
    assert!(matches!(err, LumenError::InvalidState(_)));
}

// ============================================================================
// Finalize idempotence and dirty recompute
// ============================================================================

#[test]
fn test_finalize_idempotent() {
    let engine = Arc::new(CpuEngine::new());
    let mut graph = Graph::new(engine.clone(), unet_consts(), false);
    let unet = add_unet(&mut graph);
    prepare(&mut graph, &engine);

    let private = graph.private_byte_size();
    let offsets: Vec<usize> = unet
        .ops
        .iter()
        .filter_map(|op| op.dst())
        .map(|t| t.byte_offset())
        .collect();

    graph.finalize().unwrap();
    assert_eq!(graph.private_byte_size(), private);
    let offsets2: Vec<usize> = unet
        .ops
        .iter()
        .filter_map(|op| op.dst())
        .map(|t| t.byte_offset())
        .collect();
    assert_eq!(offsets, offsets2);
}

#[test]
fn test_clear_then_rebuild_recomputes() {
    let engine = Arc::new(CpuEngine::new());
    let mut graph = Graph::new(engine.clone(), unet_consts(), false);
    add_unet(&mut graph);
    let size_full = prepare(&mut graph, &engine);

    graph.clear();
    assert_eq!(graph.scratch_byte_size().unwrap(), 0);
    assert_eq!(graph.private_byte_size(), 0);

    // A smaller topology after clear must report its own (smaller) size.
    let input = graph
        .add_input_process("input", &[9, 8, 8], 1, linear(), false, false)
        .unwrap();
    let input_op: Arc<dyn Op> = input;
    graph
        .add_conv("enc1", &input_op, Activation::Relu, PostOp::None)
        .unwrap();
    let size_small = graph.scratch_byte_size().unwrap();
    assert!(size_small > 0);
    assert!(size_small < size_full);
}

#[test]
fn test_work_amount_positive() {
    let engine = Arc::new(CpuEngine::new());
    let mut graph = Graph::new(engine, unet_consts(), false);
    let unet = add_unet(&mut graph);
    assert!(graph.work_amount() > 0.0);
    for op in &unet.ops {
        assert!(op.work_amount() >= 0.0);
    }
}
