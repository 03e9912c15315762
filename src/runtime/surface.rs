use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use slotmap::{Key, SecondaryMap};

use crate::codegen::function::mixdown_into;
use crate::codegen::ir::{Address, Arg, Base, ClassId, Fragment, Helper, MethodBuilder};
use crate::codegen::layout::{DataLayout, Field, FieldKey, StructLayout};
use crate::codegen::optimize::optimize;
use crate::codegen::value::{Value, ValueKind};
use crate::config::FloatMode;
use crate::error::{CodegenError, SourcePos};

use super::node::{generate_code, IoNode, Node, NodeCode, NodeContext, NodeKind};
use super::topology::{topological_sort, TopologyError};
use super::types::{GroupId, NodeKey, NodeState, PortDirection, PortRef, SurfaceKey};

/// One IO node of a surface as seen from the group node that embeds it.
#[derive(Debug, Clone, PartialEq)]
pub struct IoPort {
    pub name: Arc<str>,
    pub kind: ValueKind,
    pub node: NodeKey,
    /// `Input` when the embedding surface drives the slot, `Output` when it
    /// reads it.
    pub direction: PortDirection,
    /// Offset of the slot inside the surface's storage struct.
    pub offset: u32,
}

/// The generated class of one surface: its storage layout and its three
/// methods.
#[derive(Debug)]
pub struct SurfaceClass {
    pub id: ClassId,
    pub layout: Arc<StructLayout>,
    pub constructor: Fragment,
    pub generate: Fragment,
    pub destructor: Fragment,
    pub group_ptr_indexes: BTreeMap<GroupId, u32>,
    pub groups: HashMap<PortRef, GroupId>,
    pub group_kinds: HashMap<GroupId, ValueKind>,
    /// Offsets of embedded child structs, by group node.
    pub child_offsets: BTreeMap<NodeKey, u32>,
    pub children: Vec<(NodeKey, SurfaceKey)>,
    /// IO nodes sorted by name.
    pub io: Vec<IoPort>,
}

impl SurfaceClass {
    pub fn class_id(surface: SurfaceKey) -> ClassId {
        ClassId(surface.data().as_ffi())
    }

    pub fn group_of(&self, port: &PortRef) -> Option<&GroupId> {
        self.groups.get(port)
    }

    pub fn offset_of(&self, port: &PortRef) -> Option<u32> {
        self.group_of(port)
            .and_then(|group| self.group_ptr_indexes.get(group))
            .copied()
    }

    pub fn kind_of(&self, port: &PortRef) -> Option<&ValueKind> {
        self.group_of(port).and_then(|group| self.group_kinds.get(group))
    }
}

/// Everything a surface needs from the runtime to build its class.
pub(crate) struct BuildContext<'a> {
    pub surface: SurfaceKey,
    pub sample_rate: f32,
    pub float_mode: FloatMode,
    pub data: &'a DataLayout,
    pub classes: &'a HashMap<SurfaceKey, Arc<SurfaceClass>>,
}

/// A class built by a compile pass together with the node code it
/// generated. Nothing is committed until the whole pass succeeds.
#[derive(Debug)]
pub(crate) struct Built {
    pub class: Arc<SurfaceClass>,
    pub codes: Vec<(NodeKey, Arc<NodeCode>)>,
}

#[derive(Debug, Default)]
pub struct Surface {
    nodes: SecondaryMap<NodeKey, Node>,
    connections: Vec<(PortRef, PortRef)>,
    parent: Option<(SurfaceKey, NodeKey)>,
    needs_update: bool,
    input: Option<NodeKey>,
    output: Option<NodeKey>,
    class: Option<Arc<SurfaceClass>>,
}

impl Surface {
    pub(crate) fn new(parent: Option<(SurfaceKey, NodeKey)>) -> Self {
        Self {
            parent,
            needs_update: true,
            ..Self::default()
        }
    }

    pub fn parent(&self) -> Option<(SurfaceKey, NodeKey)> {
        self.parent
    }

    pub fn input(&self) -> Option<NodeKey> {
        self.input
    }

    pub fn output(&self) -> Option<NodeKey> {
        self.output
    }

    pub(crate) fn set_main_io(&mut self, input: NodeKey, output: NodeKey) {
        self.input = Some(input);
        self.output = Some(output);
    }

    pub fn is_main_io(&self, key: NodeKey) -> bool {
        self.input == Some(key) || self.output == Some(key)
    }

    /// Automation IO nodes, ordered by name.
    pub fn automation_nodes(&self) -> Vec<NodeKey> {
        let mut nodes: Vec<(&str, NodeKey)> = self
            .nodes
            .iter()
            .filter_map(|(key, node)| match node.kind() {
                NodeKind::Io(IoNode::Automation { name }) => Some((name.as_str(), key)),
                _ => None,
            })
            .collect();
        nodes.sort();
        nodes.into_iter().map(|(_, key)| key).collect()
    }

    pub fn node(&self, key: NodeKey) -> Option<&Node> {
        self.nodes.get(key)
    }

    pub(crate) fn node_mut(&mut self, key: NodeKey) -> Option<&mut Node> {
        self.nodes.get_mut(key)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeKey, &Node)> {
        self.nodes.iter()
    }

    pub fn connections(&self) -> &[(PortRef, PortRef)] {
        &self.connections
    }

    pub(crate) fn insert(&mut self, key: NodeKey, node: Node) {
        self.nodes.insert(key, node);
        self.needs_update = true;
    }

    /// Removes a node and every connection touching it.
    pub(crate) fn remove(&mut self, key: NodeKey) -> Option<Node> {
        let node = self.nodes.remove(key)?;
        self.connections
            .retain(|(a, b)| a.node != key && b.node != key);
        self.needs_update = true;
        Some(node)
    }

    /// Returns false if the connection already exists.
    pub(crate) fn connect(&mut self, from: PortRef, to: PortRef) -> bool {
        let exists = self
            .connections
            .iter()
            .any(|(a, b)| (*a == from && *b == to) || (*a == to && *b == from));
        if exists {
            return false;
        }
        self.connections.push((from, to));
        self.needs_update = true;
        true
    }

    pub(crate) fn disconnect(&mut self, from: &PortRef, to: &PortRef) -> bool {
        let before = self.connections.len();
        self.connections
            .retain(|(a, b)| !((a == from && b == to) || (a == to && b == from)));
        let removed = self.connections.len() != before;
        self.needs_update |= removed;
        removed
    }

    pub fn schedule_graph_update(&mut self) {
        self.needs_update = true;
    }

    /// Whether the next compile pass has to rebuild this surface's class.
    pub fn needs_rebuild(&self) -> bool {
        self.needs_update
            || self.class.is_none()
            || self
                .nodes
                .values()
                .any(|node| node.state() != NodeState::Clean)
    }

    pub fn class(&self) -> Option<&Arc<SurfaceClass>> {
        self.class.as_ref()
    }

    /// Child surfaces of group nodes, in node order.
    pub fn children(&self) -> Vec<(NodeKey, SurfaceKey)> {
        self.nodes
            .iter()
            .filter_map(|(key, node)| match node.kind() {
                NodeKind::Group(child) => Some((key, *child)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn begin_compile(&mut self) {
        for node in self.nodes.values_mut() {
            node.begin_compile();
        }
    }

    pub(crate) fn abort_compile(&mut self) {
        for node in self.nodes.values_mut() {
            node.abort_compile();
        }
    }

    pub(crate) fn commit(&mut self, built: Built) {
        for (key, code) in built.codes {
            if let Some(node) = self.nodes.get_mut(key) {
                node.finish_compile(code);
            }
        }
        self.class = Some(built.class);
        self.needs_update = false;
    }

    pub(crate) fn build_class(&self, cx: &BuildContext<'_>) -> Result<Built, Vec<CodegenError>> {
        self.assemble(cx)
            .map_err(|errors| errors.into_iter().map(|e| e.with_surface(cx.surface)).collect())
    }

    fn assemble(&self, cx: &BuildContext<'_>) -> Result<Built, Vec<CodegenError>> {
        let order: Vec<NodeKey> = self.nodes.keys().collect();
        let (codes, fresh) = self.node_codes(cx)?;
        let groups = Groups::resolve(&order, &codes, &self.connections)?;

        let feedback = |key: &NodeKey| {
            self.nodes
                .get(*key)
                .is_some_and(|node| node.kind().allows_feedback())
        };
        let mut deps: HashMap<NodeKey, Vec<NodeKey>> = HashMap::new();
        for group in &groups.list {
            for source in &group.sources {
                for &reader in &group.readers {
                    // reads its input in the deferred pass
                    if feedback(&reader) {
                        continue;
                    }
                    let list = deps.entry(reader).or_default();
                    if !list.contains(&source.node) {
                        list.push(source.node);
                    }
                }
            }
        }
        let sorted = topological_sort(order.iter().copied(), |key| {
            deps.get(key).cloned().unwrap_or_default()
        })
        .map_err(|TopologyError::CycleDetected { path }| {
            let pos = SourcePos {
                node: path.first().copied(),
                ..SourcePos::default()
            };
            vec![CodegenError::Cycle { path, pos }]
        })?;

        // groups first, then node state in node order
        let mut fields: Vec<Field> = groups
            .list
            .iter()
            .map(|group| match group.kind {
                ValueKind::Midi => Field::midi(FieldKey::Group(group.id.clone())),
                _ => Field::num(FieldKey::Group(group.id.clone()), 0.0),
            })
            .collect();
        for key in &order {
            fields.extend(codes[key].state.iter().cloned());
        }
        let layout = StructLayout::build(cx.data, fields);

        let mut offsets = layout.fields().iter().map(|field| field.offset);
        let group_offsets: Vec<u32> = offsets.by_ref().take(groups.list.len()).collect();
        let mut state_offsets: HashMap<NodeKey, Vec<u32>> = HashMap::new();
        for key in &order {
            let count = codes[key].state.len();
            state_offsets.insert(*key, offsets.by_ref().take(count).collect());
        }
        let port_offsets: HashMap<NodeKey, Vec<u32>> = order
            .iter()
            .map(|key| {
                let offsets = (0..codes[key].ports.len())
                    .map(|port| {
                        groups
                            .index
                            .get(&(*key, port))
                            .map_or(0, |&g| group_offsets[g])
                    })
                    .collect();
                (*key, offsets)
            })
            .collect();
        let bind = |key: NodeKey| binder(&port_offsets[&key], &state_offsets[&key]);

        let mut errors = Vec::new();

        let mut generate = MethodBuilder::new(cx.sample_rate);
        for (g, group) in groups.list.iter().enumerate() {
            if group.sources.is_empty() && !group.external {
                let slot = Address::storage(group_offsets[g]);
                if let Err(error) = mixdown_into(&mut generate, &group.kind, slot, Vec::new()) {
                    errors.push(error);
                }
            }
        }

        let position: HashMap<NodeKey, usize> =
            sorted.iter().enumerate().map(|(i, key)| (*key, i)).collect();
        let mut values: HashMap<(NodeKey, usize), Value> = HashMap::new();
        for (at, key) in sorted.iter().enumerate() {
            let code = &codes[key];
            let inlined = generate.inline(&code.generate, bind(*key));
            for (port, value) in &code.outputs {
                values.insert((*key, *port), inlined.value(value));
            }

            for (g, group) in groups.list.iter().enumerate() {
                let last = group.sources.iter().map(|s| position[&s.node]).max();
                if group.external || last != Some(at) {
                    continue;
                }
                let sources = group
                    .sources
                    .iter()
                    .filter_map(|s| values.get(&(s.node, s.port)).cloned())
                    .collect();
                let slot = Address::storage(group_offsets[g]);
                if let Err(error) = mixdown_into(&mut generate, &group.kind, slot, sources) {
                    errors.push(error.with_node(*key));
                }
            }
        }

        for key in &sorted {
            let code = &codes[key];
            if !code.deferred.is_empty() {
                generate.inline(&code.deferred, bind(*key));
            }
        }

        let mut constructor = MethodBuilder::new(cx.sample_rate);
        for (g, group) in groups.list.iter().enumerate() {
            if group.kind == ValueKind::Midi {
                constructor.call_void(
                    Helper::MidiClear,
                    vec![Arg::Addr(Address::storage(group_offsets[g]))],
                );
            }
        }
        for key in &sorted {
            constructor.inline(&codes[key].constructor, bind(*key));
        }

        let mut destructor = MethodBuilder::new(cx.sample_rate);
        for key in sorted.iter().rev() {
            destructor.inline(&codes[key].destructor, bind(*key));
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        let group_ptr_indexes: BTreeMap<GroupId, u32> = groups
            .list
            .iter()
            .zip(&group_offsets)
            .map(|(group, offset)| (group.id.clone(), *offset))
            .collect();
        let group_kinds = groups
            .list
            .iter()
            .map(|group| (group.id.clone(), group.kind.clone()))
            .collect();

        let children = self.children();
        let child_offsets = children
            .iter()
            .filter_map(|(key, _)| {
                let offset = layout.offset_of(&FieldKey::Child(*key))?;
                Some((*key, offset))
            })
            .collect();

        let mut io: Vec<IoPort> = self
            .nodes
            .iter()
            .filter_map(|(key, node)| {
                let NodeKind::Io(io) = node.kind() else {
                    return None;
                };
                let direction = match io {
                    IoNode::Output { .. } => PortDirection::Output,
                    IoNode::Input { .. } | IoNode::Automation { .. } => PortDirection::Input,
                };
                let group = groups.port_group.get(&PortRef::new(key, "value"))?;
                Some(IoPort {
                    name: Arc::from(io.name()),
                    kind: io.kind(),
                    node: key,
                    direction,
                    offset: group_ptr_indexes.get(group).copied()?,
                })
            })
            .collect();
        io.sort_by(|a, b| a.name.cmp(&b.name).then(a.node.cmp(&b.node)));

        let class = SurfaceClass {
            id: SurfaceClass::class_id(cx.surface),
            layout: Arc::new(layout),
            constructor: optimize(&constructor.finish(), cx.float_mode),
            generate: optimize(&generate.finish(), cx.float_mode),
            destructor: optimize(&destructor.finish(), cx.float_mode),
            group_ptr_indexes,
            groups: groups.port_group,
            group_kinds,
            child_offsets,
            children,
            io,
        };
        Ok(Built {
            class: Arc::new(class),
            codes: fresh,
        })
    }

    /// Cached code of clean nodes and fresh code for everything else.
    #[allow(clippy::type_complexity)]
    fn node_codes(
        &self,
        cx: &BuildContext<'_>,
    ) -> Result<(HashMap<NodeKey, Arc<NodeCode>>, Vec<(NodeKey, Arc<NodeCode>)>), Vec<CodegenError>>
    {
        let mut codes = HashMap::new();
        let mut fresh = Vec::new();
        let mut errors = Vec::new();

        for (key, node) in self.nodes.iter() {
            if let Some(code) = node.reusable_code() {
                codes.insert(key, code);
                continue;
            }
            let child = match node.kind() {
                NodeKind::Group(child) => cx.classes.get(child).map(Arc::as_ref),
                _ => None,
            };
            let ncx = NodeContext {
                sample_rate: cx.sample_rate,
                data: cx.data,
                child,
            };
            match generate_code(key, node.kind(), &ncx) {
                Ok(code) => {
                    let code = Arc::new(code);
                    codes.insert(key, code.clone());
                    fresh.push((key, code));
                }
                Err(node_errors) => {
                    errors.extend(node_errors.into_iter().map(|e| e.with_node(key)));
                }
            }
        }

        if errors.is_empty() {
            Ok((codes, fresh))
        } else {
            Err(errors)
        }
    }
}

fn binder<'a>(ports: &'a [u32], state: &'a [u32]) -> impl Fn(Base) -> Address + 'a {
    move |base| match base {
        Base::Storage => Address::storage(0),
        Base::State(i) => Address::storage(state.get(i as usize).copied().unwrap_or(0)),
        Base::Port(i) => Address::storage(ports.get(i as usize).copied().unwrap_or(0)),
    }
}

#[derive(Debug, Clone, Copy)]
struct Source {
    node: NodeKey,
    port: usize,
}

#[derive(Debug)]
struct Group {
    id: GroupId,
    kind: ValueKind,
    /// In order of their first connection.
    sources: Vec<Source>,
    readers: Vec<NodeKey>,
    external: bool,
}

/// Connection groups of a surface, sorted by id.
struct Groups {
    list: Vec<Group>,
    index: HashMap<(NodeKey, usize), usize>,
    port_group: HashMap<PortRef, GroupId>,
}

impl Groups {
    fn resolve(
        order: &[NodeKey],
        codes: &HashMap<NodeKey, Arc<NodeCode>>,
        connections: &[(PortRef, PortRef)],
    ) -> Result<Groups, Vec<CodegenError>> {
        let mut ports: Vec<(NodeKey, usize)> = Vec::new();
        let mut lookup: HashMap<PortRef, usize> = HashMap::new();
        for key in order {
            for (i, port) in codes[key].ports.iter().enumerate() {
                lookup.insert(PortRef::new(*key, &port.name), ports.len());
                ports.push((*key, i));
            }
        }

        let mut parent: Vec<usize> = (0..ports.len()).collect();
        fn find(parent: &mut [usize], mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }

        let mut errors = Vec::new();
        let mut first_connection: HashMap<usize, usize> = HashMap::new();
        for (c, (a, b)) in connections.iter().enumerate() {
            let mut resolve = |port: &PortRef| {
                let found = lookup.get(port).copied();
                if found.is_none() {
                    errors.push(CodegenError::UnresolvedConnection {
                        port: port.to_string(),
                        pos: SourcePos::node(port.node),
                    });
                }
                found
            };
            let (Some(a), Some(b)) = (resolve(a), resolve(b)) else {
                continue;
            };
            first_connection.entry(a).or_insert(c);
            first_connection.entry(b).or_insert(c);
            let (ra, rb) = (find(&mut parent, a), find(&mut parent, b));
            parent[ra] = rb;
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..ports.len() {
            let root = find(&mut parent, i);
            members.entry(root).or_default().push(i);
        }

        let descriptor = |i: usize| {
            let (node, port) = ports[i];
            (node, &codes[&node].ports[port])
        };

        let mut list: Vec<(Group, &Vec<usize>)> = Vec::new();
        for group in members.values() {
            let id = group
                .iter()
                .map(|&i| {
                    let (node, port) = descriptor(i);
                    PortRef::new(node, &port.name)
                })
                .min()
                .map(GroupId);
            let Some(id) = id else { continue };

            let (_, first) = descriptor(group[0]);
            let kind = first.kind.clone();
            let mut sources = Vec::new();
            let mut readers = Vec::new();
            let mut external = 0;
            for &i in group {
                let (node, port) = descriptor(i);
                if port.kind != kind {
                    errors.push(CodegenError::KindMismatch {
                        expected: kind.clone(),
                        found: port.kind.clone(),
                        pos: SourcePos::node(node),
                    });
                    continue;
                }
                match port.direction {
                    PortDirection::Input => {
                        if !readers.contains(&node) {
                            readers.push(node);
                        }
                    }
                    PortDirection::Output => sources.push((
                        first_connection.get(&i).copied().unwrap_or(usize::MAX),
                        Source {
                            node,
                            port: ports[i].1,
                        },
                    )),
                    PortDirection::External => external += 1,
                }
            }
            if external > 1 || (external == 1 && !sources.is_empty()) {
                errors.push(CodegenError::ConflictingDrivers {
                    port: id.0.to_string(),
                    pos: SourcePos::node(id.0.node),
                });
            }
            sources.sort_by_key(|(connection, _)| *connection);

            let group_entry = Group {
                id,
                kind,
                sources: sources.into_iter().map(|(_, source)| source).collect(),
                readers,
                external: external > 0,
            };
            list.push((group_entry, group));
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        list.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        let mut index = HashMap::new();
        let mut port_group = HashMap::new();
        for (g, (group, group_members)) in list.iter().enumerate() {
            for &i in group_members.iter() {
                let (node, port) = descriptor(i);
                index.insert(ports[i], g);
                port_group.insert(PortRef::new(node, &port.name), group.id.clone());
            }
        }
        let list = list.into_iter().map(|(group, _)| group).collect();

        Ok(Groups {
            list,
            index,
            port_group,
        })
    }
}
