use float_cmp::assert_approx_eq;
use oscen_live::render::render;
use oscen_live::{NodeKey, NodeKind, PortRef, Runtime, RuntimeConfig, Waveform};

fn port(node: NodeKey, name: &str) -> PortRef {
    PortRef::new(node, name)
}

/// A counter `history -> count -> history` wired to the output, preceded by
/// an unrelated lowpass so that removing it moves every slot.
fn counter() -> (Runtime, NodeKey, NodeKey, NodeKey) {
    let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let root = rt.root();
    let output = rt.output().unwrap();
    let spare = rt.add_node(root, NodeKind::Lowpass).unwrap();
    let history = rt.add_node(root, NodeKind::History).unwrap();
    let count = rt.add_node(root, NodeKind::custom("y:num = x:num + 1")).unwrap();
    rt.connect(port(history, "out"), port(count, "x")).unwrap();
    rt.connect(port(count, "y"), port(history, "in")).unwrap();
    rt.connect(port(count, "y"), port(output, "value")).unwrap();
    rt.compile().unwrap();
    (rt, spare, history, count)
}

#[test]
fn state_follows_its_key_to_a_new_offset() {
    let (mut rt, spare, history, _) = counter();
    let mut processor = rt.processor();
    assert_eq!(render(&mut processor, 5).last(), Some(&5.0));

    let (before, _) = rt.slot(&port(history, "out")).unwrap();
    rt.remove_node(spare).unwrap();
    let summary = rt.compile().unwrap();
    let (after, _) = rt.slot(&port(history, "out")).unwrap();

    assert!(after < before);
    assert_eq!(summary.migration.reset, 0);
    // the history output lags the count by one sample
    assert_approx_eq!(f32, rt.read_num(&port(history, "out")).unwrap(), 4.0);
    assert_eq!(render(&mut processor, 2), vec![6.0, 7.0]);
}

#[test]
fn changing_code_keeps_connected_state() {
    let (mut rt, _, _, count) = counter();
    let mut processor = rt.processor();
    render(&mut processor, 3);

    rt.set_node_kind(count, NodeKind::custom("y:num = x:num + 10")).unwrap();
    let summary = rt.compile().unwrap();
    assert_eq!(summary.regenerated_nodes, 1);
    assert_eq!(render(&mut processor, 2), vec![13.0, 23.0]);
}

#[test]
fn replaced_state_starts_from_defaults() {
    let (mut rt, spare, _, _) = counter();
    let root = rt.root();
    let cutoff = rt.add_node(root, NodeKind::custom("hz:num = 1000")).unwrap();
    let source = rt.add_node(root, NodeKind::custom("v:num = 1")).unwrap();
    rt.connect(port(cutoff, "hz"), port(spare, "cutoff")).unwrap();
    rt.connect(port(source, "v"), port(spare, "in")).unwrap();
    rt.compile().unwrap();
    render(&mut rt.processor(), 64);
    assert!(rt.read_num(&port(spare, "out")).unwrap() > 0.5);

    // the lowpass state `y` disappears, the oscillator `phase` is new
    rt.set_node_kind(spare, NodeKind::oscillator(Waveform::Saw)).unwrap();
    rt.disconnect(&port(source, "v"), &port(spare, "in")).unwrap();
    rt.disconnect(&port(cutoff, "hz"), &port(spare, "cutoff")).unwrap();
    rt.connect(port(cutoff, "hz"), port(spare, "freq")).unwrap();
    let summary = rt.compile().unwrap();
    assert!(summary.migration.reset >= 1);
    assert!(summary.migration.preserved >= 3);
}

#[test]
fn snapshots_are_stable_without_edits() {
    let (mut rt, _, _, _) = counter();
    render(&mut rt.processor(), 7);
    let first = rt.snapshot_storage().unwrap();

    rt.schedule_full_compile();
    let summary = rt.compile().unwrap();
    assert_eq!(summary.migration.reset, 0);
    assert_eq!(rt.snapshot_storage().unwrap(), first);
}
