use std::f32::consts::{LN_2, TAU};
use std::sync::Arc;

use crate::codegen::common::{TRACKER_GATE, TRACKER_VELOCITY};
use crate::codegen::function::{mixdown_into, Function};
use crate::codegen::ir::{
    Address, Arg, BinaryOp, Compare, Fragment, Helper, MethodBuilder, Method, Reg, UnaryOp,
};
use crate::codegen::layout::{DataLayout, Field, FieldKey, StructLayout};
use crate::codegen::value::{Value, ValueKind};
use crate::error::{CodegenError, SourcePos};
use crate::script;

use super::surface::SurfaceClass;
use super::types::{
    NodeKey, NodeState, PortDescriptor, PortDirection, PortList, SurfaceKey, MAX_NODE_PORTS,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Saw,
    Square,
    Triangle,
}

/// A node whose behaviour is written in the expression language, see
/// [`crate::script`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CustomNode {
    source: String,
}

impl CustomNode {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IoNode {
    /// Driven from outside the surface.
    Input { name: String, kind: ValueKind },
    /// Read from outside the surface.
    Output { name: String, kind: ValueKind },
    /// Numeric control value driven from outside the surface.
    Automation { name: String },
}

impl IoNode {
    pub fn name(&self) -> &str {
        match self {
            IoNode::Input { name, .. } | IoNode::Output { name, .. } | IoNode::Automation { name } => {
                name
            }
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            IoNode::Input { kind, .. } | IoNode::Output { kind, .. } => kind.clone(),
            IoNode::Automation { .. } => ValueKind::Num,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    Custom(CustomNode),
    Oscillator { waveform: Waveform },
    Lowpass,
    History,
    NoteTracker,
    Group(SurfaceKey),
    Io(IoNode),
}

impl NodeKind {
    pub fn custom(source: impl Into<String>) -> Self {
        NodeKind::Custom(CustomNode::new(source))
    }

    pub fn oscillator(waveform: Waveform) -> Self {
        NodeKind::Oscillator { waveform }
    }

    pub fn automation(name: impl Into<String>) -> Self {
        NodeKind::Io(IoNode::Automation { name: name.into() })
    }

    pub fn input(name: impl Into<String>, kind: ValueKind) -> Self {
        NodeKind::Io(IoNode::Input {
            name: name.into(),
            kind,
        })
    }

    pub fn output(name: impl Into<String>, kind: ValueKind) -> Self {
        NodeKind::Io(IoNode::Output {
            name: name.into(),
            kind,
        })
    }

    /// Output of the node does not depend on its current input, so it may
    /// close a feedback loop.
    pub fn allows_feedback(&self) -> bool {
        matches!(self, NodeKind::History)
    }
}

/// Layout independent code of one node, cached while the node stays clean.
#[derive(Clone, Debug, Default)]
pub struct NodeCode {
    pub ports: PortList,
    /// State fields, addressed in fragments as `Base::State(i)`.
    pub state: Vec<Field>,
    pub constructor: Fragment,
    pub generate: Fragment,
    /// Appended to the surface's generate after every node has run.
    pub deferred: Fragment,
    pub destructor: Fragment,
    /// Values of output ports, by port index, in the register space of
    /// `generate`.
    pub outputs: Vec<(usize, Value)>,
}

impl NodeCode {
    pub fn port_index(&self, name: &str) -> Option<usize> {
        self.ports.iter().position(|port| &*port.name == name)
    }
}

/// What a node needs to know about its surroundings to generate code.
pub(crate) struct NodeContext<'a> {
    pub sample_rate: f32,
    pub data: &'a DataLayout,
    pub child: Option<&'a SurfaceClass>,
}

pub(crate) fn generate_code(
    key: NodeKey,
    kind: &NodeKind,
    cx: &NodeContext<'_>,
) -> Result<NodeCode, Vec<CodegenError>> {
    let code = match kind {
        NodeKind::Custom(custom) => custom_code(custom, cx)?,
        NodeKind::Oscillator { waveform } => oscillator_code(key, *waveform, cx),
        NodeKind::Lowpass => lowpass_code(key, cx),
        NodeKind::History => history_code(key, cx),
        NodeKind::NoteTracker => note_tracker_code(key, cx).map_err(|e| vec![e])?,
        NodeKind::Group(_) => group_code(key, cx).map_err(|e| vec![e])?,
        NodeKind::Io(io) => io_code(io),
    };
    Ok(code)
}

fn ports(list: impl IntoIterator<Item = PortDescriptor>) -> Result<PortList, CodegenError> {
    let mut ports = PortList::new();
    for port in list {
        ports.try_push(port).map_err(|_| CodegenError::TooManyPorts {
            limit: MAX_NODE_PORTS,
            pos: SourcePos::default(),
        })?;
    }
    Ok(ports)
}

fn fixed_ports<const N: usize>(list: [PortDescriptor; N]) -> PortList {
    list.into_iter().collect()
}

fn custom_code(custom: &CustomNode, cx: &NodeContext<'_>) -> Result<NodeCode, Vec<CodegenError>> {
    let compiled = script::compile(custom.source(), cx.sample_rate)?;
    Ok(NodeCode {
        ports: ports(compiled.ports).map_err(|e| vec![e])?,
        generate: compiled.fragment,
        outputs: compiled.outputs,
        ..NodeCode::default()
    })
}

fn oscillator_code(key: NodeKey, waveform: Waveform, cx: &NodeContext<'_>) -> NodeCode {
    let mut m = MethodBuilder::new(cx.sample_rate);
    let freq = m.load(Address::port(0));
    let phase = m.load(Address::state(0));
    let out = shape(&mut m, waveform, phase);

    let period = m.constant(1.0 / cx.sample_rate);
    let step = m.binary(BinaryOp::Mul, freq, period);
    let advanced = m.binary(BinaryOp::Add, phase, step);
    let whole = m.unary(UnaryOp::Floor, advanced);
    let wrapped = m.binary(BinaryOp::Sub, advanced, whole);
    m.store(Address::state(0), wrapped);

    NodeCode {
        ports: fixed_ports([PortDescriptor::input("freq"), PortDescriptor::output("out")]),
        state: vec![Field::num(FieldKey::State(key, "phase"), 0.0)],
        generate: m.finish(),
        outputs: vec![(1, Value::Num(out))],
        ..NodeCode::default()
    }
}

/// Maps a phase in [0, 1) to a bipolar waveform.
fn shape(m: &mut MethodBuilder, waveform: Waveform, phase: Reg) -> Reg {
    match waveform {
        Waveform::Sine => {
            let tau = m.constant(TAU);
            let angle = m.binary(BinaryOp::Mul, phase, tau);
            m.call(Helper::Sin, vec![Arg::Num(angle)])
        }
        Waveform::Saw => {
            let two = m.constant(2.0);
            let one = m.constant(1.0);
            let doubled = m.binary(BinaryOp::Mul, phase, two);
            m.binary(BinaryOp::Sub, doubled, one)
        }
        Waveform::Square => {
            let half = m.constant(0.5);
            let high = m.constant(1.0);
            let low = m.constant(-1.0);
            let first_half = m.compare(Compare::Less, phase, half);
            m.select(first_half, high, low)
        }
        Waveform::Triangle => {
            let half = m.constant(0.5);
            let four = m.constant(4.0);
            let one = m.constant(1.0);
            let centered = m.binary(BinaryOp::Sub, phase, half);
            let distance = m.unary(UnaryOp::Abs, centered);
            let scaled = m.binary(BinaryOp::Mul, distance, four);
            m.binary(BinaryOp::Sub, scaled, one)
        }
    }
}

fn lowpass_code(key: NodeKey, cx: &NodeContext<'_>) -> NodeCode {
    let mut m = MethodBuilder::new(cx.sample_rate);
    let input = m.load(Address::port(0));
    let cutoff = m.load(Address::port(1));
    let y = m.load(Address::state(0));

    // a = e^(-2 pi fc / sr), written as a power of two
    let k = m.constant(-TAU / cx.sample_rate / LN_2);
    let exponent = m.binary(BinaryOp::Mul, cutoff, k);
    let a = m.call(Helper::Exp2, vec![Arg::Num(exponent)]);
    let one = m.constant(1.0);
    let gain = m.binary(BinaryOp::Sub, one, a);
    let error = m.binary(BinaryOp::Sub, input, y);
    let step = m.binary(BinaryOp::Mul, gain, error);
    let next = m.binary(BinaryOp::Add, y, step);
    m.store(Address::state(0), next);

    NodeCode {
        ports: fixed_ports([
            PortDescriptor::input("in"),
            PortDescriptor::input("cutoff"),
            PortDescriptor::output("out"),
        ]),
        state: vec![Field::num(FieldKey::State(key, "y"), 0.0)],
        generate: m.finish(),
        outputs: vec![(2, Value::Num(next))],
        ..NodeCode::default()
    }
}

/// Outputs `prev` and stores the input into it once every node of the
/// surface has run, so the output is the previous sample's input.
fn history_code(key: NodeKey, cx: &NodeContext<'_>) -> NodeCode {
    let mut m = MethodBuilder::new(cx.sample_rate);
    let prev = m.load(Address::state(0));

    let mut deferred = MethodBuilder::new(cx.sample_rate);
    let input = deferred.load(Address::port(0));
    deferred.store(Address::state(0), input);

    NodeCode {
        ports: fixed_ports([PortDescriptor::input("in"), PortDescriptor::output("out")]),
        state: vec![Field::num(FieldKey::State(key, "prev"), 0.0)],
        generate: m.finish(),
        deferred: deferred.finish(),
        outputs: vec![(1, Value::Num(prev))],
        ..NodeCode::default()
    }
}

fn note_tracker_code(key: NodeKey, cx: &NodeContext<'_>) -> Result<NodeCode, CodegenError> {
    let tracker = StructLayout::build(
        cx.data,
        vec![
            Field::num(FieldKey::State(key, "note"), 69.0),
            Field::num(FieldKey::State(key, "gate"), 0.0),
            Field::num(FieldKey::State(key, "velocity"), 0.0),
        ],
    );

    let mut m = MethodBuilder::new(cx.sample_rate);
    m.call_void(
        Helper::MidiTrackNote,
        vec![Arg::Addr(Address::port(0)), Arg::Addr(Address::state(0))],
    );
    let note = m.load(Address::state(0));
    let freq = Function::NoteToFreq.generate(&mut m, vec![Value::Num(note)], None)?;
    let gate = m.load(Address::state(0).at(TRACKER_GATE as u32));
    let velocity = m.load(Address::state(0).at(TRACKER_VELOCITY as u32));

    Ok(NodeCode {
        ports: fixed_ports([
            PortDescriptor::new("midi", ValueKind::Midi, PortDirection::Input),
            PortDescriptor::output("freq"),
            PortDescriptor::output("gate"),
            PortDescriptor::output("velocity"),
        ]),
        state: vec![Field::child(FieldKey::State(key, "tracker"), Arc::new(tracker))],
        generate: m.finish(),
        outputs: vec![
            (1, freq),
            (2, Value::Num(gate)),
            (3, Value::Num(velocity)),
        ],
        ..NodeCode::default()
    })
}

/// A group copies its inputs into the child's IO slots, runs the child and
/// reads the child's outputs back.
fn group_code(key: NodeKey, cx: &NodeContext<'_>) -> Result<NodeCode, CodegenError> {
    let child = cx.child.ok_or_else(|| CodegenError::UnresolvedConnection {
        port: "<child surface>".into(),
        pos: SourcePos::node(key),
    })?;
    let this = Address::state(0);

    let mut m = MethodBuilder::new(cx.sample_rate);
    let mut outputs = Vec::new();
    for (i, io) in child.io.iter().enumerate() {
        let slot = this.at(io.offset);
        if io.direction == PortDirection::Input {
            match io.kind {
                ValueKind::Midi => mixdown_into(
                    &mut m,
                    &ValueKind::Midi,
                    slot,
                    vec![Value::Midi(Address::port(i as u16))],
                )?,
                _ => {
                    let value = m.load(Address::port(i as u16));
                    m.store(slot, value);
                }
            }
        }
    }
    m.call_class(child.id, Method::Generate, this);
    for (i, io) in child.io.iter().enumerate() {
        if io.direction == PortDirection::Output {
            let value = match io.kind {
                ValueKind::Midi => Value::Midi(this.at(io.offset)),
                _ => Value::Num(m.load(this.at(io.offset))),
            };
            outputs.push((i, value));
        }
    }

    let mut constructor = MethodBuilder::new(cx.sample_rate);
    constructor.call_class(child.id, Method::Constructor, this);
    let mut destructor = MethodBuilder::new(cx.sample_rate);
    destructor.call_class(child.id, Method::Destructor, this);

    Ok(NodeCode {
        ports: ports(
            child
                .io
                .iter()
                .map(|io| PortDescriptor::new(&io.name, io.kind.clone(), io.direction)),
        )?,
        state: vec![Field::child(FieldKey::Child(key), child.layout.clone())],
        constructor: constructor.finish(),
        generate: m.finish(),
        deferred: Fragment::default(),
        destructor: destructor.finish(),
        outputs,
    })
}

fn io_code(io: &IoNode) -> NodeCode {
    let direction = match io {
        IoNode::Output { .. } => PortDirection::Input,
        IoNode::Input { .. } | IoNode::Automation { .. } => PortDirection::External,
    };
    NodeCode {
        ports: fixed_ports([PortDescriptor::new("value", io.kind(), direction)]),
        ..NodeCode::default()
    }
}

/// One compilation unit of a surface.
#[derive(Debug)]
pub struct Node {
    kind: NodeKind,
    state: NodeState,
    code: Option<Arc<NodeCode>>,
}

impl Node {
    pub(crate) fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            state: NodeState::Dirty,
            code: None,
        }
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn code(&self) -> Option<&Arc<NodeCode>> {
        self.code.as_ref()
    }

    pub(crate) fn set_kind(&mut self, kind: NodeKind) {
        self.kind = kind;
        self.mark_dirty();
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.state = NodeState::Dirty;
    }

    /// Dirty -> Compiling. Returns whether the node needs new code.
    pub(crate) fn begin_compile(&mut self) -> bool {
        if self.state == NodeState::Dirty {
            self.state = NodeState::Compiling;
        }
        self.state == NodeState::Compiling
    }

    pub(crate) fn finish_compile(&mut self, code: Arc<NodeCode>) {
        self.code = Some(code);
        self.state = NodeState::Clean;
    }

    /// A failed pass leaves the node dirty so the next pass retries it.
    pub(crate) fn abort_compile(&mut self) {
        if self.state == NodeState::Compiling {
            self.state = NodeState::Dirty;
        }
    }

    /// Cached code that is still valid. Group code depends on the child
    /// class and is never reused.
    pub(crate) fn reusable_code(&self) -> Option<Arc<NodeCode>> {
        match (&self.kind, self.state) {
            (NodeKind::Group(_), _) => None,
            (_, NodeState::Clean) => self.code.clone(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn key() -> NodeKey {
        let mut map: SlotMap<NodeKey, ()> = SlotMap::with_key();
        map.insert(())
    }

    fn cx(data: &DataLayout) -> NodeContext<'_> {
        NodeContext {
            sample_rate: 48000.0,
            data,
            child: None,
        }
    }

    #[test]
    fn state_machine() {
        let mut node = Node::new(NodeKind::Lowpass);
        assert_eq!(node.state(), NodeState::Dirty);
        assert!(node.begin_compile());
        assert_eq!(node.state(), NodeState::Compiling);
        node.abort_compile();
        assert_eq!(node.state(), NodeState::Dirty);

        assert!(node.begin_compile());
        node.finish_compile(Arc::new(NodeCode::default()));
        assert_eq!(node.state(), NodeState::Clean);
        assert!(!node.begin_compile());
        assert!(node.reusable_code().is_some());

        node.set_kind(NodeKind::History);
        assert_eq!(node.state(), NodeState::Dirty);
        assert!(node.reusable_code().is_none());
    }

    #[test]
    fn oscillator_ports_and_state() {
        let data = DataLayout::new(8, true);
        let node = key();
        let code = generate_code(node, &NodeKind::oscillator(Waveform::Saw), &cx(&data)).unwrap();
        assert_eq!(code.port_index("freq"), Some(0));
        assert_eq!(code.port_index("out"), Some(1));
        assert_eq!(code.state, vec![Field::num(FieldKey::State(node, "phase"), 0.0)]);
        assert!(code.generate.validate().is_ok());
    }

    #[test]
    fn io_nodes_have_one_value_port() {
        let data = DataLayout::new(8, true);
        let code = generate_code(key(), &NodeKind::automation("cutoff"), &cx(&data)).unwrap();
        assert_eq!(code.ports.len(), 1);
        assert_eq!(code.ports[0].direction, PortDirection::External);
        let code =
            generate_code(key(), &NodeKind::output("out", ValueKind::Midi), &cx(&data)).unwrap();
        assert_eq!(code.ports[0].direction, PortDirection::Input);
        assert_eq!(code.ports[0].kind, ValueKind::Midi);
    }

    #[test]
    fn group_without_child_class_fails() {
        let data = DataLayout::new(8, true);
        let mut surfaces: SlotMap<SurfaceKey, ()> = SlotMap::with_key();
        let child = surfaces.insert(());
        let result = generate_code(key(), &NodeKind::Group(child), &cx(&data));
        assert!(result.is_err());
    }
}
