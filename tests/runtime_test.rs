use float_cmp::assert_approx_eq;
use oscen_live::render::render;
use oscen_live::{
    CodegenError, MidiEvent, NodeKey, NodeKind, NodeState, PortRef, Runtime, RuntimeConfig,
    ValueKind, Waveform,
};

fn port(node: NodeKey, name: &str) -> PortRef {
    PortRef::new(node, name)
}

/// Automation `freq` driving an oscillator wired to the main output.
fn oscillator_runtime(waveform: Waveform, freq: f32) -> (Runtime, NodeKey, NodeKey) {
    let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let root = rt.root();
    let output = rt.output().unwrap();
    let auto = rt.add_node(root, NodeKind::automation("freq")).unwrap();
    let osc = rt.add_node(root, NodeKind::oscillator(waveform)).unwrap();
    rt.connect(port(auto, "value"), port(osc, "freq")).unwrap();
    rt.connect(port(osc, "out"), port(output, "value")).unwrap();
    rt.compile().unwrap();
    rt.write_num(&port(auto, "value"), freq).unwrap();
    (rt, auto, osc)
}

fn rising_crossings(samples: &[f32]) -> Vec<f32> {
    samples
        .windows(2)
        .enumerate()
        .filter(|(_, w)| w[0] < 0.0 && w[1] >= 0.0)
        .map(|(i, w)| i as f32 + (-w[0]) / (w[1] - w[0]))
        .collect()
}

#[test]
fn sine_period_matches_frequency() {
    let (rt, _, _) = oscillator_runtime(Waveform::Sine, 440.0);
    let samples = render(&mut rt.processor(), 4410);
    let crossings = rising_crossings(&samples);
    assert!(crossings.len() >= 40);

    let first = crossings[0];
    let last = crossings[crossings.len() - 1];
    let period = (last - first) / (crossings.len() - 1) as f32;
    assert_approx_eq!(f32, period, 44100.0 / 440.0, epsilon = 0.05);
    assert!(samples.iter().all(|s| s.abs() <= 1.001));
}

#[test]
fn identical_graphs_render_identical_streams() {
    let build = || {
        let (mut rt, auto, osc) = oscillator_runtime(Waveform::Saw, 220.0);
        let root = rt.root();
        let output = rt.output().unwrap();
        let lowpass = rt.add_node(root, NodeKind::Lowpass).unwrap();
        let cutoff = rt.add_node(root, NodeKind::custom("hz:num = 800")).unwrap();
        rt.disconnect(&port(osc, "out"), &port(output, "value")).unwrap();
        rt.connect(port(osc, "out"), port(lowpass, "in")).unwrap();
        rt.connect(port(cutoff, "hz"), port(lowpass, "cutoff")).unwrap();
        rt.connect(port(lowpass, "out"), port(output, "value")).unwrap();
        rt.schedule_graph_update(root).unwrap();
        rt.compile().unwrap();
        rt.write_num(&port(auto, "value"), 220.0).unwrap();
        rt
    };
    let a = build();
    let b = build();
    let first = render(&mut a.processor(), 2048);
    let second = render(&mut b.processor(), 2048);
    assert_eq!(first, second);
    assert!(first.iter().any(|s| *s != 0.0));
}

#[test]
fn unrelated_edit_preserves_running_state() {
    let (mut edited, _, _) = oscillator_runtime(Waveform::Saw, 330.0);
    let (reference, _, _) = oscillator_runtime(Waveform::Saw, 330.0);
    let expected = render(&mut reference.processor(), 300);

    let mut processor = edited.processor();
    let mut actual = render(&mut processor, 137);

    let root = edited.root();
    edited.add_node(root, NodeKind::Lowpass).unwrap();
    let summary = edited.compile().unwrap();
    assert_eq!(summary.generation, 2);
    assert!(!summary.first_block);
    assert!(summary.migration.preserved >= 2);
    assert!(summary.migration.reset >= 1);

    actual.extend(render(&mut processor, 163));
    assert_eq!(actual, expected);
}

#[test]
fn clean_nodes_keep_their_code() {
    let (mut rt, _, osc) = oscillator_runtime(Waveform::Square, 100.0);
    let root = rt.root();
    let extra = rt.add_node(root, NodeKind::Lowpass).unwrap();
    let summary = rt.compile().unwrap();
    assert_eq!(summary.rebuilt_surfaces, 1);
    assert_eq!(summary.regenerated_nodes, 1);
    assert_eq!(rt.node_state(osc), Ok(NodeState::Clean));
    assert_eq!(rt.node_state(extra), Ok(NodeState::Clean));

    rt.schedule_compile(osc).unwrap();
    assert_eq!(rt.node_state(osc), Ok(NodeState::Dirty));
    let summary = rt.compile().unwrap();
    assert_eq!(summary.regenerated_nodes, 1);
}

#[test]
fn failed_compile_keeps_previous_program() {
    let (mut rt, _, _) = oscillator_runtime(Waveform::Saw, 440.0);
    let (reference, _, _) = oscillator_runtime(Waveform::Saw, 440.0);
    let expected = render(&mut reference.processor(), 200);

    let root = rt.root();
    let mut processor = rt.processor();
    let mut actual = render(&mut processor, 100);
    let generation = rt.generation();
    let ptr = rt.current_ptr(root).unwrap();

    let bad = rt.add_node(root, NodeKind::custom("out:num = 1 +")).unwrap();
    let error = rt.compile().unwrap_err();
    let report = error.report().unwrap();
    assert_eq!(report.len(), 1);
    assert!(matches!(report.errors[0], CodegenError::Parse { .. }));
    assert_eq!(report.errors[0].pos().node, Some(bad));
    assert_eq!(report.errors[0].pos().surface, Some(root));

    assert_eq!(rt.generation(), generation);
    assert_eq!(rt.current_ptr(root).unwrap(), ptr);
    assert_eq!(rt.node_state(bad), Ok(NodeState::Dirty));
    actual.extend(render(&mut processor, 100));
    assert_eq!(actual, expected);

    rt.remove_node(bad).unwrap();
    rt.compile().unwrap();
    assert!(rt.last_errors().is_empty());
    assert_eq!(rt.generation(), generation + 1);
}

#[test]
fn group_runs_its_child_surface() {
    let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let root = rt.root();
    let output = rt.output().unwrap();
    let (group, child) = rt.add_group(root).unwrap();

    let child_in = rt.add_node(child, NodeKind::input("in", ValueKind::Num)).unwrap();
    let child_out = rt.add_node(child, NodeKind::output("out", ValueKind::Num)).unwrap();
    let double = rt.add_node(child, NodeKind::custom("y:num = x:num * 2")).unwrap();
    rt.connect(port(child_in, "value"), port(double, "x")).unwrap();
    rt.connect(port(double, "y"), port(child_out, "value")).unwrap();

    let level = rt.add_node(root, NodeKind::automation("level")).unwrap();
    rt.connect(port(level, "value"), port(group, "in")).unwrap();
    rt.connect(port(group, "out"), port(output, "value")).unwrap();
    rt.compile().unwrap();

    rt.write_num(&port(level, "value"), 0.25).unwrap();
    let mut processor = rt.processor();
    assert_approx_eq!(f32, processor.generate(), 0.5);
    assert_approx_eq!(f32, rt.read_num(&port(double, "y")).unwrap(), 0.5);
    assert!(rt.storage_offset(child).unwrap() > 0);

    // editing only the child rebuilds the child and its parent
    rt.set_node_kind(double, NodeKind::custom("y:num = x:num * 3")).unwrap();
    rt.schedule_child_update(child).unwrap();
    let summary = rt.compile().unwrap();
    assert_eq!(summary.rebuilt_surfaces, 2);
    assert_approx_eq!(f32, processor.generate(), 0.75);
}

#[test]
fn note_tracker_follows_midi_input() {
    let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let root = rt.root();
    let input = rt.input().unwrap();
    let output = rt.output().unwrap();
    let tracker = rt.add_node(root, NodeKind::NoteTracker).unwrap();
    rt.connect(port(input, "value"), port(tracker, "midi")).unwrap();
    rt.connect(port(tracker, "freq"), port(output, "value")).unwrap();
    rt.compile().unwrap();

    let mut processor = rt.processor();
    assert_approx_eq!(f32, processor.generate(), 440.0, epsilon = 0.01);

    assert!(processor.push_midi(MidiEvent::note_on(0, 57, 100)));
    assert_approx_eq!(f32, processor.generate(), 220.0, epsilon = 0.01);
    // the note is held after the queue is cleared
    assert_approx_eq!(f32, processor.generate(), 220.0, epsilon = 0.01);
    assert!(rt.read_midi(&port(input, "value")).unwrap().is_empty());
}

#[test]
fn midi_slots_can_be_inspected() {
    let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let input = rt.input().unwrap();
    rt.compile().unwrap();

    let event = MidiEvent::note_on(1, 64, 90);
    let slot = port(input, "value");
    assert!(rt.push_midi(&slot, event).unwrap());
    assert_eq!(rt.read_midi(&slot).unwrap(), vec![event]);
    assert!(rt.read_num(&slot).is_err());
}

#[test]
fn processor_is_silent_before_first_compile() {
    let rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let mut processor = rt.processor();
    assert!(!processor.is_ready());
    assert_eq!(processor.generate(), 0.0);
}

#[test]
fn consumer_thread_only_sees_whole_programs() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
    let root = rt.root();
    let output = rt.output().unwrap();
    let base = rt.add_node(root, NodeKind::custom("out:num = 0.5")).unwrap();
    rt.connect(port(base, "out"), port(output, "value")).unwrap();
    rt.compile().unwrap();

    let mut processor = rt.processor();
    let stop = AtomicBool::new(false);
    let consumed = std::thread::scope(|scope| {
        let consumer = scope.spawn(|| {
            let mut block = [0.0f32; 64];
            let mut consumed = 0usize;
            loop {
                processor.process_block(&mut block);
                for sample in block {
                    assert!(
                        sample == 0.5 || sample == 1.5,
                        "sample {sample} belongs to no published program"
                    );
                }
                consumed += block.len();
                if stop.load(Ordering::Acquire) {
                    break;
                }
            }
            consumed
        });

        for _ in 0..300 {
            let extra = rt.add_node(root, NodeKind::custom("out:num = 1")).unwrap();
            rt.connect(port(extra, "out"), port(output, "value")).unwrap();
            rt.compile().unwrap();
            rt.remove_node(extra).unwrap();
            rt.compile().unwrap();
        }
        stop.store(true, Ordering::Release);
        consumer.join().unwrap()
    });

    assert!(consumed > 0);
    assert_approx_eq!(f32, rt.processor().generate(), 0.5);
}
