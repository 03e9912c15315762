use float_cmp::assert_approx_eq;
use oscen_live::render::render;
use oscen_live::{CodegenError, NodeKey, NodeKind, PortRef, Runtime, RuntimeConfig};

fn port(node: NodeKey, name: &str) -> PortRef {
    PortRef::new(node, name)
}

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::default()).unwrap()
}

fn constant(rt: &mut Runtime, value: f32) -> NodeKey {
    let root = rt.root();
    rt.add_node(root, NodeKind::custom(format!("out:num = {}", value)))
        .unwrap()
}

#[test]
fn unconnected_output_is_silent() {
    let mut rt = runtime();
    rt.compile().unwrap();
    let samples = render(&mut rt.processor(), 64);
    assert!(samples.iter().all(|s| *s == 0.0));
}

#[test]
fn several_sources_are_summed() {
    let mut rt = runtime();
    let output = rt.output().unwrap();
    let a = constant(&mut rt, 0.25);
    let b = constant(&mut rt, 0.5);
    let c = constant(&mut rt, -0.125);
    for node in [a, b, c] {
        rt.connect(port(node, "out"), port(output, "value")).unwrap();
    }
    rt.compile().unwrap();
    assert_approx_eq!(f32, rt.processor().generate(), 0.625);

    assert!(rt.disconnect(&port(b, "out"), &port(output, "value")).unwrap());
    rt.compile().unwrap();
    assert_approx_eq!(f32, rt.processor().generate(), 0.125);
}

#[test]
fn connected_inputs_share_one_slot() {
    let mut rt = runtime();
    let root = rt.root();
    let output = rt.output().unwrap();
    let source = constant(&mut rt, 3.0);
    let square = rt.add_node(root, NodeKind::custom("y:num = x:num * x:num")).unwrap();
    let negate = rt.add_node(root, NodeKind::custom("y:num = -x:num")).unwrap();
    rt.connect(port(source, "out"), port(square, "x")).unwrap();
    rt.connect(port(source, "out"), port(negate, "x")).unwrap();
    rt.connect(port(square, "y"), port(output, "value")).unwrap();
    rt.connect(port(negate, "y"), port(output, "value")).unwrap();
    rt.compile().unwrap();

    assert_eq!(
        rt.group_of(&port(square, "x")).unwrap(),
        rt.group_of(&port(negate, "x")).unwrap()
    );
    assert_approx_eq!(f32, rt.processor().generate(), 6.0);
}

#[test]
fn history_closes_a_feedback_loop() {
    let mut rt = runtime();
    let root = rt.root();
    let output = rt.output().unwrap();
    let history = rt.add_node(root, NodeKind::History).unwrap();
    let count = rt.add_node(root, NodeKind::custom("y:num = x:num + 1")).unwrap();
    rt.connect(port(history, "out"), port(count, "x")).unwrap();
    rt.connect(port(count, "y"), port(history, "in")).unwrap();
    rt.connect(port(count, "y"), port(output, "value")).unwrap();
    rt.compile().unwrap();

    let samples = render(&mut rt.processor(), 4);
    assert_eq!(samples, vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn history_delays_by_one_sample() {
    let mut rt = runtime();
    let root = rt.root();
    let output = rt.output().unwrap();
    let source = constant(&mut rt, 1.0);
    let history = rt.add_node(root, NodeKind::History).unwrap();
    let scale = rt.add_node(root, NodeKind::custom("y:num = x:num * 10")).unwrap();
    rt.connect(port(source, "out"), port(history, "in")).unwrap();
    rt.connect(port(history, "out"), port(scale, "x")).unwrap();
    rt.connect(port(scale, "y"), port(output, "value")).unwrap();
    rt.compile().unwrap();

    let samples = render(&mut rt.processor(), 3);
    assert_eq!(samples, vec![0.0, 10.0, 10.0]);
}

#[test]
fn history_wired_to_the_main_output_delays() {
    let mut rt = runtime();
    let root = rt.root();
    let output = rt.output().unwrap();
    let level = rt.add_node(root, NodeKind::automation("level")).unwrap();
    let history = rt.add_node(root, NodeKind::History).unwrap();
    rt.connect(port(level, "value"), port(history, "in")).unwrap();
    rt.connect(port(history, "out"), port(output, "value")).unwrap();
    rt.compile().unwrap();

    let mut processor = rt.processor();
    let mut samples = Vec::new();
    for value in [1.0, 2.0, 3.0] {
        rt.write_num(&port(level, "value"), value).unwrap();
        samples.push(processor.generate());
    }
    assert_eq!(samples, vec![0.0, 1.0, 2.0]);
    assert_approx_eq!(f32, rt.read_num(&port(history, "out")).unwrap(), 2.0);
}

#[test]
fn chained_histories_add_their_delays() {
    let mut rt = runtime();
    let root = rt.root();
    let output = rt.output().unwrap();
    let level = rt.add_node(root, NodeKind::automation("level")).unwrap();
    let first = rt.add_node(root, NodeKind::History).unwrap();
    let second = rt.add_node(root, NodeKind::History).unwrap();
    rt.connect(port(level, "value"), port(first, "in")).unwrap();
    rt.connect(port(first, "out"), port(second, "in")).unwrap();
    rt.connect(port(second, "out"), port(output, "value")).unwrap();
    rt.compile().unwrap();

    let mut processor = rt.processor();
    let mut samples = Vec::new();
    for value in [1.0, 2.0, 3.0, 4.0] {
        rt.write_num(&port(level, "value"), value).unwrap();
        samples.push(processor.generate());
    }
    assert_eq!(samples, vec![0.0, 0.0, 1.0, 2.0]);
}

#[test]
fn cycle_without_history_is_reported() {
    let mut rt = runtime();
    let root = rt.root();
    let a = rt.add_node(root, NodeKind::Lowpass).unwrap();
    let b = rt.add_node(root, NodeKind::Lowpass).unwrap();
    rt.connect(port(a, "out"), port(b, "in")).unwrap();
    rt.connect(port(b, "out"), port(a, "in")).unwrap();

    let error = rt.compile().unwrap_err();
    let report = error.report().unwrap();
    match &report.errors[0] {
        CodegenError::Cycle { path, .. } => {
            assert_eq!(path.len(), 2);
            assert!(path.contains(&a) && path.contains(&b));
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
    assert!(!rt.is_compiled());
}

#[test]
fn external_port_cannot_be_driven_by_a_node() {
    let mut rt = runtime();
    let root = rt.root();
    let auto = rt.add_node(root, NodeKind::automation("gain")).unwrap();
    let source = constant(&mut rt, 1.0);
    rt.connect(port(source, "out"), port(auto, "value")).unwrap();

    let error = rt.compile().unwrap_err();
    assert!(matches!(
        error.report().unwrap().errors[0],
        CodegenError::ConflictingDrivers { .. }
    ));
}

#[test]
fn unknown_port_is_reported() {
    let mut rt = runtime();
    let root = rt.root();
    let output = rt.output().unwrap();
    let lowpass = rt.add_node(root, NodeKind::Lowpass).unwrap();
    rt.connect(port(lowpass, "resonance"), port(output, "value")).unwrap();

    let error = rt.compile().unwrap_err();
    assert!(matches!(
        error.report().unwrap().errors[0],
        CodegenError::UnresolvedConnection { .. }
    ));
}

#[test]
fn midi_into_num_port_is_a_kind_mismatch() {
    let mut rt = runtime();
    let root = rt.root();
    let input = rt.input().unwrap();
    let lowpass = rt.add_node(root, NodeKind::Lowpass).unwrap();
    rt.connect(port(input, "value"), port(lowpass, "in")).unwrap();

    let error = rt.compile().unwrap_err();
    assert!(matches!(
        error.report().unwrap().errors[0],
        CodegenError::KindMismatch { .. }
    ));
}
