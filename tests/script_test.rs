use float_cmp::assert_approx_eq;
use oscen_live::{CodegenError, NodeKey, NodeKind, PortRef, Runtime, RuntimeConfig};

fn custom(source: &str) -> (Runtime, NodeKey) {
    let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let root = rt.root();
    let output = rt.output().unwrap();
    let node = rt.add_node(root, NodeKind::custom(source)).unwrap();
    rt.connect(PortRef::new(node, "out"), PortRef::new(output, "value"))
        .unwrap();
    (rt, node)
}

#[test]
fn errors_carry_the_span_of_the_expression() {
    let (mut rt, node) = custom("out:num = sin(1, 2)");
    let error = rt.compile().unwrap_err();
    let report = error.report().unwrap();
    assert_eq!(report.len(), 1);
    let first = &report.errors[0];
    assert!(matches!(first, CodegenError::Arity { found: 2, expected: 1, .. }));
    assert_eq!(first.pos().span, Some(10..19));
    assert_eq!(first.pos().node, Some(node));
    assert!(first.to_string().contains("bytes 10..19"));
}

#[test]
fn every_error_of_a_script_is_reported() {
    let (mut rt, node) = custom("a = nope(1)\nout:num = a + missing");
    let error = rt.compile().unwrap_err();
    let errors: Vec<_> = rt.last_errors().for_node(node).cloned().collect();
    assert_eq!(errors.len(), 2);
    assert_eq!(error.report().unwrap().errors, errors);
    assert!(matches!(errors[0], CodegenError::UnknownFunction { .. }));
    assert!(matches!(errors[1], CodegenError::UnknownName { .. }));
    assert_eq!(errors[0].pos().span, Some(4..8));
    assert_eq!(errors[1].pos().span, Some(26..33));
}

#[test]
fn fixed_script_recovers() {
    let (mut rt, node) = custom("out:num = 2 *");
    assert!(rt.compile().is_err());
    rt.set_node_kind(node, NodeKind::custom("out:num = 2 * pi")).unwrap();
    rt.compile().unwrap();
    assert!(rt.last_errors().is_empty());
    assert_approx_eq!(f32, rt.processor().generate(), std::f32::consts::TAU);
}

#[test]
fn locals_and_constants() {
    let (mut rt, _) = custom("# half the sample rate\nhalf = samplerate / 2; out:num = max(half, 0)");
    rt.compile().unwrap();
    assert_approx_eq!(f32, rt.processor().generate(), 22050.0);
}

#[test]
fn deeply_nested_script_is_a_compile_error() {
    let (mut rt, node) = custom("out:num = 0.5");
    rt.compile().unwrap();

    let depth = 50_000;
    let source = format!("out:num = {}1{}", "(".repeat(depth), ")".repeat(depth));
    rt.set_node_kind(node, NodeKind::custom(source)).unwrap();
    let error = rt.compile().unwrap_err();
    let report = error.report().unwrap();
    assert!(matches!(report.errors[0], CodegenError::Parse { .. }));
    assert_eq!(report.errors[0].pos().node, Some(node));

    // the last good program keeps running
    assert_approx_eq!(f32, rt.processor().generate(), 0.5);
}
