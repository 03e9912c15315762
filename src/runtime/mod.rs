//! Graph editing, incremental compilation and publication.

pub mod exporter;
pub mod jit;
pub mod node;
pub mod processor;
pub mod storage;
pub mod surface;
pub mod topology;
pub mod types;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use slotmap::SlotMap;
use tracing::{debug, info, warn};

use crate::codegen::layout::{migrate, DataLayout, MigrationStats};
use crate::codegen::lower::ClassCode;
use crate::codegen::midi::{MidiEvent, MidiQueue};
use crate::codegen::value::ValueKind;
use crate::config::RuntimeConfig;
use crate::error::{BackendError, CodegenError, CompileError, CompileReport, RuntimeError};

use self::jit::Jit;
use self::node::{Node, NodeKind};
use self::processor::{Instance, Processor, Shared};
use self::storage::StorageBlock;
use self::surface::{BuildContext, Built, Surface, SurfaceClass};
use self::types::{GroupId, NodeKey, NodeState, PortRef, SurfaceKey};

/// Configuration and backend of one runtime, passed by reference to
/// everything that generates code.
pub struct Session {
    pub config: RuntimeConfig,
    pub jit: Jit,
}

/// Outcome of a successful [`Runtime::compile`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileSummary {
    pub generation: u64,
    pub rebuilt_surfaces: usize,
    pub regenerated_nodes: usize,
    pub migration: MigrationStats,
    /// The pass created the first storage block and ran the constructor.
    pub first_block: bool,
}

pub struct Runtime {
    session: Session,
    surfaces: SlotMap<SurfaceKey, Surface>,
    /// Allocates node keys and records the surface owning each node.
    owners: SlotMap<NodeKey, SurfaceKey>,
    removed: HashSet<NodeKey>,
    root: SurfaceKey,
    shared: Shared,
    current: Option<Arc<Instance>>,
    last_errors: CompileReport,
    generation: u64,
}

impl Runtime {
    /// Creates a runtime whose root surface has a MIDI input named `input`
    /// and a numeric output named `output`. Nothing is published until the
    /// first [`compile`](Self::compile).
    pub fn new(config: RuntimeConfig) -> Result<Self, BackendError> {
        let jit = Jit::new(&config)?;
        info!(sample_rate = config.sample_rate, "runtime created");
        let mut surfaces = SlotMap::with_key();
        let root = surfaces.insert(Surface::new(None));

        let mut runtime = Self {
            session: Session { config, jit },
            surfaces,
            owners: SlotMap::with_key(),
            removed: HashSet::new(),
            root,
            shared: Arc::new(ArcSwapOption::empty()),
            current: None,
            last_errors: CompileReport::default(),
            generation: 0,
        };
        let input = runtime.spawn(root, NodeKind::input("input", ValueKind::Midi));
        let output = runtime.spawn(root, NodeKind::output("output", ValueKind::Num));
        if let Some(surface) = runtime.surfaces.get_mut(root) {
            surface.set_main_io(input, output);
        }
        Ok(runtime)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.session.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn data_layout(&self) -> DataLayout {
        self.session.jit.data_layout()
    }

    pub fn root(&self) -> SurfaceKey {
        self.root
    }

    pub fn surface(&self, key: SurfaceKey) -> Result<&Surface, RuntimeError> {
        self.surfaces.get(key).ok_or(RuntimeError::NoSuchSurface(key))
    }

    fn surface_mut(&mut self, key: SurfaceKey) -> Result<&mut Surface, RuntimeError> {
        self.surfaces
            .get_mut(key)
            .ok_or(RuntimeError::NoSuchSurface(key))
    }

    /// Main input of the root surface.
    pub fn input(&self) -> Option<NodeKey> {
        self.surfaces.get(self.root).and_then(Surface::input)
    }

    /// Main output of the root surface.
    pub fn output(&self) -> Option<NodeKey> {
        self.surfaces.get(self.root).and_then(Surface::output)
    }

    pub fn automation_nodes(&self, surface: SurfaceKey) -> Result<Vec<NodeKey>, RuntimeError> {
        Ok(self.surface(surface)?.automation_nodes())
    }

    pub fn surface_of(&self, node: NodeKey) -> Result<SurfaceKey, RuntimeError> {
        match self.owners.get(node) {
            Some(surface) => Ok(*surface),
            None if self.removed.contains(&node) => Err(RuntimeError::NodeRemoved(node)),
            None => Err(RuntimeError::NoSuchNode(node)),
        }
    }

    fn node(&self, key: NodeKey) -> Result<&Node, RuntimeError> {
        let surface = self.surface_of(key)?;
        self.surface(surface)?
            .node(key)
            .ok_or(RuntimeError::NoSuchNode(key))
    }

    fn node_mut(&mut self, key: NodeKey) -> Result<&mut Node, RuntimeError> {
        let surface = self.surface_of(key)?;
        self.surface_mut(surface)?
            .node_mut(key)
            .ok_or(RuntimeError::NoSuchNode(key))
    }

    pub fn node_kind(&self, node: NodeKey) -> Result<&NodeKind, RuntimeError> {
        Ok(self.node(node)?.kind())
    }

    pub fn node_state(&self, node: NodeKey) -> Result<NodeState, RuntimeError> {
        Ok(self.node(node)?.state())
    }

    /// The child surface embedded by a group node.
    pub fn group_surface(&self, node: NodeKey) -> Result<SurfaceKey, RuntimeError> {
        match self.node(node)?.kind() {
            NodeKind::Group(child) => Ok(*child),
            _ => Err(RuntimeError::NotAGroup(node)),
        }
    }

    fn spawn(&mut self, surface: SurfaceKey, kind: NodeKind) -> NodeKey {
        let key = self.owners.insert(surface);
        if let Some(surface) = self.surfaces.get_mut(surface) {
            surface.insert(key, Node::new(kind));
        }
        key
    }

    pub fn add_node(&mut self, surface: SurfaceKey, kind: NodeKind) -> Result<NodeKey, RuntimeError> {
        if matches!(kind, NodeKind::Group(_)) {
            return Err(RuntimeError::GroupKind);
        }
        self.surface(surface)?;
        let key = self.spawn(surface, kind);
        debug!(node = ?key, surface = ?surface, "node added");
        Ok(key)
    }

    /// Adds a group node to `surface` together with the empty child surface
    /// it runs.
    pub fn add_group(&mut self, surface: SurfaceKey) -> Result<(NodeKey, SurfaceKey), RuntimeError> {
        self.surface(surface)?;
        let key = self.owners.insert(surface);
        let child = self.surfaces.insert(Surface::new(Some((surface, key))));
        self.surface_mut(surface)?
            .insert(key, Node::new(NodeKind::Group(child)));
        debug!(node = ?key, child = ?child, "group added");
        Ok((key, child))
    }

    /// Removes a node. Removing a group node removes its child surface and
    /// everything in it. Removed keys stay invalid forever.
    pub fn remove_node(&mut self, node: NodeKey) -> Result<(), RuntimeError> {
        let surface = self.surface_of(node)?;
        if self.surface(surface)?.is_main_io(node) {
            return Err(RuntimeError::ProtectedNode(node));
        }
        let removed = self
            .surface_mut(surface)?
            .remove(node)
            .ok_or(RuntimeError::NoSuchNode(node))?;
        self.owners.remove(node);
        self.removed.insert(node);
        if let NodeKind::Group(child) = removed.kind() {
            self.remove_surface(*child);
        }
        debug!(node = ?node, "node removed");
        Ok(())
    }

    fn remove_surface(&mut self, key: SurfaceKey) {
        let Some(surface) = self.surfaces.remove(key) else {
            return;
        };
        for (node, _) in surface.nodes() {
            self.owners.remove(node);
            self.removed.insert(node);
        }
        for (_, child) in surface.children() {
            self.remove_surface(child);
        }
    }

    /// Replaces the kind of a node and marks it dirty. Group nodes can
    /// neither be created nor changed this way.
    pub fn set_node_kind(&mut self, node: NodeKey, kind: NodeKind) -> Result<(), RuntimeError> {
        if matches!(kind, NodeKind::Group(_)) {
            return Err(RuntimeError::GroupKind);
        }
        let surface = self.surface_of(node)?;
        if self.surface(surface)?.is_main_io(node) {
            return Err(RuntimeError::ProtectedNode(node));
        }
        let target = self.node_mut(node)?;
        if matches!(target.kind(), NodeKind::Group(_)) {
            return Err(RuntimeError::GroupKind);
        }
        target.set_kind(kind);
        Ok(())
    }

    /// Connects two ports of the same surface. Returns false if they were
    /// already connected. Ports are resolved at the next compile.
    pub fn connect(&mut self, from: PortRef, to: PortRef) -> Result<bool, RuntimeError> {
        let surface = self.shared_surface(&from, &to)?;
        Ok(self.surface_mut(surface)?.connect(from, to))
    }

    pub fn disconnect(&mut self, from: &PortRef, to: &PortRef) -> Result<bool, RuntimeError> {
        let surface = self.shared_surface(from, to)?;
        Ok(self.surface_mut(surface)?.disconnect(from, to))
    }

    fn shared_surface(&self, from: &PortRef, to: &PortRef) -> Result<SurfaceKey, RuntimeError> {
        let a = self.surface_of(from.node)?;
        let b = self.surface_of(to.node)?;
        if a != b {
            return Err(RuntimeError::CrossSurface {
                from: from.node,
                to: to.node,
            });
        }
        Ok(a)
    }

    /// Requests new code for one node at the next compile.
    pub fn schedule_compile(&mut self, node: NodeKey) -> Result<(), RuntimeError> {
        self.node_mut(node)?.mark_dirty();
        Ok(())
    }

    /// Requests a rebuild of a surface's class at the next compile.
    pub fn schedule_graph_update(&mut self, surface: SurfaceKey) -> Result<(), RuntimeError> {
        self.surface_mut(surface)?.schedule_graph_update();
        Ok(())
    }

    /// Signals that a child surface changed. The surface and every surface
    /// embedding it are rebuilt at the next compile.
    pub fn schedule_child_update(&mut self, surface: SurfaceKey) -> Result<(), RuntimeError> {
        let mut current = Some(surface);
        while let Some(key) = current {
            let surface = self.surface_mut(key)?;
            surface.schedule_graph_update();
            current = surface.parent().map(|(parent, _)| parent);
        }
        Ok(())
    }

    /// Marks every node of every surface dirty.
    pub fn schedule_full_compile(&mut self) {
        for surface in self.surfaces.values_mut() {
            surface.schedule_graph_update();
            let keys: Vec<NodeKey> = surface.nodes().map(|(key, _)| key).collect();
            for key in keys {
                if let Some(node) = surface.node_mut(key) {
                    node.mark_dirty();
                }
            }
        }
    }

    pub fn last_errors(&self) -> &CompileReport {
        &self.last_errors
    }

    /// Number of successful publications so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_compiled(&self) -> bool {
        self.current.is_some()
    }

    pub fn processor(&self) -> Processor {
        Processor::new(self.shared.clone())
    }

    /// Surfaces reachable from the root, children before parents.
    fn post_order(&self) -> Vec<SurfaceKey> {
        fn visit(runtime: &Runtime, key: SurfaceKey, out: &mut Vec<SurfaceKey>) {
            if let Some(surface) = runtime.surfaces.get(key) {
                for (_, child) in surface.children() {
                    visit(runtime, child, out);
                }
                out.push(key);
            }
        }
        let mut out = Vec::new();
        visit(self, self.root, &mut out);
        out
    }

    /// Rebuilds what changed, links a new program and publishes it with
    /// migrated storage. On any error the previously published program,
    /// its storage and every cache are left untouched.
    pub fn compile(&mut self) -> Result<CompileSummary, CompileError> {
        let order = self.post_order();
        let mut rebuild: HashSet<SurfaceKey> = HashSet::new();
        for key in &order {
            let Some(surface) = self.surfaces.get(*key) else {
                continue;
            };
            let child_rebuilt = surface
                .children()
                .iter()
                .any(|(_, child)| rebuild.contains(child));
            if surface.needs_rebuild() || child_rebuilt {
                rebuild.insert(*key);
            }
        }

        if rebuild.is_empty() && self.current.is_some() {
            debug!("compile requested without changes");
            return Ok(CompileSummary {
                generation: self.generation,
                ..CompileSummary::default()
            });
        }
        info!(surfaces = rebuild.len(), "compile pass started");

        for key in &rebuild {
            if let Some(surface) = self.surfaces.get_mut(*key) {
                surface.begin_compile();
            }
        }

        let result = self.build_and_link(&order, &rebuild);
        let (built, classes, program) = match result {
            Ok(parts) => parts,
            Err(error) => {
                for key in &rebuild {
                    if let Some(surface) = self.surfaces.get_mut(*key) {
                        surface.abort_compile();
                    }
                }
                if let CompileError::Codegen(report) = &error {
                    warn!(errors = report.len(), "compile pass failed, keeping previous program");
                    self.last_errors = report.clone();
                } else {
                    warn!(%error, "backend failure, keeping previous program");
                }
                return Err(error);
            }
        };

        let Some(root_class) = classes.get(&self.root).cloned() else {
            for key in &rebuild {
                if let Some(surface) = self.surfaces.get_mut(*key) {
                    surface.abort_compile();
                }
            }
            return Err(BackendError::UnknownClass(SurfaceClass::class_id(self.root)).into());
        };
        let rebuilt_surfaces = built.len();
        let regenerated_nodes: usize = built.iter().map(|(_, b)| b.codes.len()).sum();
        for (key, built) in built {
            if let Some(surface) = self.surfaces.get_mut(key) {
                surface.commit(built);
            }
        }
        self.last_errors = CompileReport::default();

        let (migration, first_block) = self.publish(program, &root_class);
        self.generation += 1;

        info!(
            generation = self.generation,
            rebuilt_surfaces,
            regenerated_nodes,
            preserved = migration.preserved,
            reset = migration.reset,
            "program published"
        );
        Ok(CompileSummary {
            generation: self.generation,
            rebuilt_surfaces,
            regenerated_nodes,
            migration,
            first_block,
        })
    }

    #[allow(clippy::type_complexity)]
    fn build_and_link(
        &self,
        order: &[SurfaceKey],
        rebuild: &HashSet<SurfaceKey>,
    ) -> Result<
        (
            Vec<(SurfaceKey, Built)>,
            HashMap<SurfaceKey, Arc<SurfaceClass>>,
            jit::Program,
        ),
        CompileError,
    > {
        let data = self.data_layout();
        let config = &self.session.config;
        let mut classes: HashMap<SurfaceKey, Arc<SurfaceClass>> = HashMap::new();
        let mut built = Vec::new();
        let mut failed: HashSet<SurfaceKey> = HashSet::new();
        let mut errors: Vec<CodegenError> = Vec::new();

        for key in order {
            let Some(surface) = self.surfaces.get(*key) else {
                continue;
            };
            if !rebuild.contains(key) {
                if let Some(class) = surface.class() {
                    classes.insert(*key, class.clone());
                }
                continue;
            }
            if surface
                .children()
                .iter()
                .any(|(_, child)| failed.contains(child))
            {
                failed.insert(*key);
                continue;
            }

            let cx = BuildContext {
                surface: *key,
                sample_rate: config.sample_rate,
                float_mode: config.float_mode,
                data: &data,
                classes: &classes,
            };
            match surface.build_class(&cx) {
                Ok(result) => {
                    debug!(surface = ?key, size = result.class.layout.size(), "class built");
                    classes.insert(*key, result.class.clone());
                    built.push((*key, result));
                }
                Err(surface_errors) => {
                    errors.extend(surface_errors);
                    failed.insert(*key);
                }
            }
        }

        if !errors.is_empty() {
            return Err(CompileError::Codegen(CompileReport { errors }));
        }

        let root = classes
            .get(&self.root)
            .ok_or(BackendError::UnknownClass(SurfaceClass::class_id(self.root)))?;
        let codes: Vec<ClassCode<'_>> = order
            .iter()
            .filter_map(|key| classes.get(key))
            .map(|class| ClassCode {
                id: class.id,
                constructor: &class.constructor,
                generate: &class.generate,
                destructor: &class.destructor,
            })
            .collect();
        let program = self.session.jit.link(&codes, root.id)?;
        drop(codes);
        Ok((built, classes, program))
    }

    /// Installs `program` with storage migrated from the current instance.
    fn publish(&mut self, program: jit::Program, root: &SurfaceClass) -> (MigrationStats, bool) {
        let layout = root.layout.clone();
        let mut block = StorageBlock::new(layout.size(), layout.align());
        let input = self
            .input()
            .and_then(|node| root.offset_of(&PortRef::new(node, "value")));
        let output = self
            .output()
            .and_then(|node| root.offset_of(&PortRef::new(node, "value")));
        let program = Arc::new(program);

        match self.current.take() {
            Some(old) => {
                let guard = old.storage().lock();
                let stats = migrate(old.layout(), guard.as_slice(), &layout, block.as_mut_slice());
                let instance = Arc::new(Instance::new(program, block, layout, input, output));
                self.shared.store(Some(instance.clone()));
                old.retire();
                drop(guard);
                debug!(preserved = stats.preserved, reset = stats.reset, "storage migrated");
                self.current = Some(instance);
                (stats, false)
            }
            None => {
                layout.write_defaults(block.as_mut_slice());
                // SAFETY: the block was laid out for this program's root class
                // and is not shared yet.
                unsafe { program.call(crate::codegen::ir::Method::Constructor, block.as_ptr()) };
                let instance = Arc::new(Instance::new(program, block, layout, input, output));
                self.shared.store(Some(instance.clone()));
                self.current = Some(instance);
                (MigrationStats::default(), true)
            }
        }
    }

    /// Published class of a surface.
    pub fn class(&self, surface: SurfaceKey) -> Result<&Arc<SurfaceClass>, RuntimeError> {
        self.surface(surface)?
            .class()
            .ok_or(RuntimeError::NotCompiled)
    }

    /// Published classes of every surface reachable from the root, children
    /// first.
    pub fn compiled_classes(&self) -> Vec<Arc<SurfaceClass>> {
        self.post_order()
            .into_iter()
            .filter_map(|key| self.surfaces.get(key).and_then(Surface::class).cloned())
            .collect()
    }

    pub fn group_ptr_indexes(&self, surface: SurfaceKey) -> Result<&BTreeMap<GroupId, u32>, RuntimeError> {
        Ok(&self.class(surface)?.group_ptr_indexes)
    }

    pub fn group_of(&self, port: &PortRef) -> Result<GroupId, RuntimeError> {
        let surface = self.surface_of(port.node)?;
        self.class(surface)?
            .group_of(port)
            .cloned()
            .ok_or(RuntimeError::UnknownGroup)
    }

    /// Offset of a surface's struct inside the root storage block.
    pub fn storage_offset(&self, surface: SurfaceKey) -> Result<u32, RuntimeError> {
        let mut offset = 0;
        let mut current = surface;
        while let Some((parent, node)) = self.surface(current)?.parent() {
            offset += self
                .class(parent)?
                .child_offsets
                .get(&node)
                .copied()
                .ok_or(RuntimeError::NotCompiled)?;
            current = parent;
        }
        Ok(offset)
    }

    /// Live storage of a surface. Valid until the next successful compile.
    pub fn current_ptr(&self, surface: SurfaceKey) -> Result<*mut u8, RuntimeError> {
        let instance = self.current.as_ref().ok_or(RuntimeError::NotCompiled)?;
        let offset = self.storage_offset(surface)?;
        let base = instance.storage().lock().as_ptr();
        // SAFETY: the offset lies inside the block, see `storage_offset`.
        Ok(unsafe { base.add(offset as usize) })
    }

    /// Copy of the whole root storage block.
    pub fn snapshot_storage(&self) -> Result<Vec<u8>, RuntimeError> {
        let instance = self.current.as_ref().ok_or(RuntimeError::NotCompiled)?;
        let storage = instance.storage().lock();
        Ok(storage.as_slice().to_vec())
    }

    /// Absolute storage offset and kind of the slot a port is connected to.
    pub fn slot(&self, port: &PortRef) -> Result<(u32, ValueKind), RuntimeError> {
        let surface = self.surface_of(port.node)?;
        let class = self.class(surface)?;
        let offset = class.offset_of(port).ok_or(RuntimeError::UnknownGroup)?;
        let kind = class
            .kind_of(port)
            .cloned()
            .ok_or(RuntimeError::UnknownGroup)?;
        Ok((self.storage_offset(surface)? + offset, kind))
    }

    fn checked_slot(&self, port: &PortRef, expected: ValueKind) -> Result<(&Instance, u32), RuntimeError> {
        let (offset, kind) = self.slot(port)?;
        if kind != expected {
            return Err(RuntimeError::WrongKind {
                expected,
                found: kind,
            });
        }
        let instance = self.current.as_deref().ok_or(RuntimeError::NotCompiled)?;
        Ok((instance, offset))
    }

    pub fn read_num(&self, port: &PortRef) -> Result<f32, RuntimeError> {
        let (instance, offset) = self.checked_slot(port, ValueKind::Num)?;
        let storage = instance.storage().lock();
        storage.read_f32(offset).ok_or(RuntimeError::UnknownGroup)
    }

    /// Sets a numeric slot without recompiling. Slots driven by node outputs
    /// are overwritten by the next generate call.
    pub fn write_num(&self, port: &PortRef, value: f32) -> Result<(), RuntimeError> {
        let (instance, offset) = self.checked_slot(port, ValueKind::Num)?;
        let mut storage = instance.storage().lock();
        if storage.write_f32(offset, value) {
            Ok(())
        } else {
            Err(RuntimeError::UnknownGroup)
        }
    }

    pub fn read_midi(&self, port: &PortRef) -> Result<Vec<MidiEvent>, RuntimeError> {
        let (instance, offset) = self.checked_slot(port, ValueKind::Midi)?;
        let storage = instance.storage().lock();
        // SAFETY: `offset` is a MIDI slot inside the block.
        let queue = unsafe {
            std::ptr::read_unaligned(storage.as_ptr().add(offset as usize) as *const MidiQueue)
        };
        Ok(queue.events().to_vec())
    }

    /// Appends an event to a MIDI slot. Returns false when the queue is full.
    pub fn push_midi(&self, port: &PortRef, event: MidiEvent) -> Result<bool, RuntimeError> {
        let (instance, offset) = self.checked_slot(port, ValueKind::Midi)?;
        let storage = instance.storage().lock();
        // SAFETY: `offset` is a 4-aligned MIDI slot inside the block and the
        // lock is held.
        let queue = unsafe { &mut *(storage.as_ptr().add(offset as usize) as *mut MidiQueue) };
        Ok(queue.push(event))
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("root", &self.root)
            .field("surfaces", &self.surfaces.len())
            .field("nodes", &self.owners.len())
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::node::Waveform;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn root_has_protected_main_io() {
        let mut rt = runtime();
        let input = rt.input().unwrap();
        let output = rt.output().unwrap();
        assert_eq!(rt.remove_node(input), Err(RuntimeError::ProtectedNode(input)));
        assert_eq!(
            rt.set_node_kind(output, NodeKind::Lowpass),
            Err(RuntimeError::ProtectedNode(output))
        );
    }

    #[test]
    fn removed_keys_stay_invalid() {
        let mut rt = runtime();
        let root = rt.root();
        let osc = rt.add_node(root, NodeKind::oscillator(Waveform::Sine)).unwrap();
        rt.remove_node(osc).unwrap();
        assert_eq!(rt.node_state(osc), Err(RuntimeError::NodeRemoved(osc)));
        assert_eq!(rt.schedule_compile(osc), Err(RuntimeError::NodeRemoved(osc)));
    }

    #[test]
    fn removing_a_group_removes_its_surface() {
        let mut rt = runtime();
        let root = rt.root();
        let (group, child) = rt.add_group(root).unwrap();
        let inner = rt.add_node(child, NodeKind::Lowpass).unwrap();
        assert_eq!(rt.group_surface(group), Ok(child));
        assert_eq!(rt.group_surface(inner), Err(RuntimeError::NotAGroup(inner)));
        rt.remove_node(group).unwrap();
        assert!(rt.surface(child).is_err());
        assert_eq!(rt.node_state(inner), Err(RuntimeError::NodeRemoved(inner)));
    }

    #[test]
    fn group_kind_is_rejected() {
        let mut rt = runtime();
        let root = rt.root();
        let (_, child) = rt.add_group(root).unwrap();
        assert_eq!(
            rt.add_node(root, NodeKind::Group(child)),
            Err(RuntimeError::GroupKind)
        );
    }

    #[test]
    fn connections_stay_inside_one_surface() {
        let mut rt = runtime();
        let root = rt.root();
        let (_, child) = rt.add_group(root).unwrap();
        let a = rt.add_node(root, NodeKind::Lowpass).unwrap();
        let b = rt.add_node(child, NodeKind::Lowpass).unwrap();
        assert_eq!(
            rt.connect(PortRef::new(a, "out"), PortRef::new(b, "in")),
            Err(RuntimeError::CrossSurface { from: a, to: b })
        );
    }

    #[test]
    fn nodes_are_clean_after_compile() {
        let mut rt = runtime();
        let root = rt.root();
        let osc = rt.add_node(root, NodeKind::oscillator(Waveform::Saw)).unwrap();
        assert_eq!(rt.node_state(osc), Ok(NodeState::Dirty));
        let summary = rt.compile().unwrap();
        assert!(summary.first_block);
        assert_eq!(summary.generation, 1);
        assert_eq!(rt.node_state(osc), Ok(NodeState::Clean));

        let again = rt.compile().unwrap();
        assert_eq!(again.generation, 1);
        assert_eq!(again.rebuilt_surfaces, 0);
    }

    #[test]
    fn failed_compile_leaves_nodes_dirty() {
        let mut rt = runtime();
        let root = rt.root();
        let bad = rt.add_node(root, NodeKind::custom("out:num = nope")).unwrap();
        let error = rt.compile().unwrap_err();
        assert_eq!(error.report().map(CompileReport::len), Some(1));
        assert_eq!(rt.node_state(bad), Ok(NodeState::Dirty));
        assert_eq!(rt.last_errors().for_node(bad).count(), 1);
        assert!(!rt.is_compiled());
    }
}
