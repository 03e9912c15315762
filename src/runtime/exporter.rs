//! Ahead-of-time export of compiled runtimes.
//!
//! An export module contains the common support functions, the nine ABI
//! functions below and, per added runtime, every surface class plus an
//! exported `ExportDefinition` object named after the export:
//!
//! ```text
//! oscen_create_instrument(definition*) -> instrument*
//! oscen_get_input(instrument*, u32) -> u8*
//! oscen_get_output(instrument*, u32) -> u8*
//! oscen_generate(instrument*)
//! oscen_destroy_instrument(instrument*)
//! oscen_midi_push(midi_queue*, u64)
//! oscen_midi_clear(midi_queue*)
//! oscen_num_write(num*, f32)
//! oscen_num_read(num*) -> f32
//! ```
//!
//! Every other symbol has local linkage. The only imports are `malloc`,
//! `free` and the `memcpy` libcall.

use std::alloc::{alloc, dealloc, Layout};
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::mem;

use cranelift::prelude::*;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, DataDescription, DataId, FuncId, Linkage, Module};
use cranelift_object::{ObjectBuilder, ObjectModule};
use target_lexicon::Triple;
use tracing::{debug, error, info};

use super::jit::{build_isa, data_layout};
use super::types::PortRef;
use super::Runtime;
use crate::codegen::common::{define_common, CommonFunctions};
use crate::codegen::ir::Method;
use crate::codegen::layout::DataLayout;
use crate::codegen::lower::{define_function, link_classes, method_signature, ClassCode};
use crate::codegen::midi::MidiEvent;
use crate::config::RuntimeConfig;
use crate::error::{BackendError, ExportError};

/// Names of the exported ABI functions.
pub const ABI_FUNCTIONS: [&str; 9] = [
    "oscen_create_instrument",
    "oscen_get_input",
    "oscen_get_output",
    "oscen_generate",
    "oscen_destroy_instrument",
    "oscen_midi_push",
    "oscen_midi_clear",
    "oscen_num_write",
    "oscen_num_read",
];

/// Bytes in front of the storage of an instrument. Holds the
/// `ExportInstrument` header `{ data*, definition* }` and keeps the storage
/// 16 byte aligned.
pub const INSTRUMENT_HEADER: u32 = 16;

/// Field indexes of an `ExportDefinition`, each one pointer wide:
/// storage size, snapshot, input table, output table, constructor,
/// generate, destructor.
mod fields {
    pub const SIZE: u32 = 0;
    pub const SNAPSHOT: u32 = 1;
    pub const INPUTS: u32 = 2;
    pub const OUTPUTS: u32 = 3;
    pub const CONSTRUCTOR: u32 = 4;
    pub const GENERATE: u32 = 5;
    pub const DESTRUCTOR: u32 = 6;
    pub const FIELDS: u32 = 7;
}

const IMPORTS: [&str; 2] = ["malloc", "free"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// A relocatable object file for the target.
    Object,
    /// Unoptimized Cranelift IR of every function followed by a manifest of
    /// the data objects.
    Clif,
}

#[derive(Debug, Clone, Copy)]
struct AbiFunctions {
    create: FuncId,
    get_input: FuncId,
    get_output: FuncId,
    generate: FuncId,
    destroy: FuncId,
    midi_push: FuncId,
    midi_clear: FuncId,
    num_write: FuncId,
    num_read: FuncId,
}

pub struct Exporter<M: Module> {
    module: M,
    config: RuntimeConfig,
    data: DataLayout,
    common: CommonFunctions,
    abi: AbiFunctions,
    definitions: Vec<(String, DataId)>,
    /// Every declared symbol with its linkage.
    symbols: Vec<(String, Linkage)>,
    clif: Option<String>,
}

impl Exporter<ObjectModule> {
    /// An exporter writing an object file for `triple`, or for the host when
    /// `triple` is `None`.
    pub fn object(config: RuntimeConfig, triple: Option<Triple>) -> Result<Self, ExportError> {
        let isa = build_isa(&config, triple, true)?;
        let data = data_layout(&*isa);
        let builder = ObjectBuilder::new(isa, "oscen_export", default_libcall_names())?;
        Self::with_module(ObjectModule::new(builder), config, data, Some(String::new()))
    }

    /// Checks symbol linkage and emits the module.
    pub fn finish(self, format: ExportFormat) -> Result<Vec<u8>, ExportError> {
        self.check_linkage()?;
        let exports = self.definitions.len();
        let bytes = match format {
            ExportFormat::Object => {
                let product = self.module.finish();
                product.emit().map_err(|e| ExportError::Emit(e.to_string()))?
            }
            ExportFormat::Clif => self.clif.unwrap_or_default().into_bytes(),
        };
        info!(exports, bytes = bytes.len(), ?format, "export finished");
        Ok(bytes)
    }
}

impl Exporter<JITModule> {
    /// An exporter that builds the export module in executable memory of
    /// this process. Allocations of instruments go through counting shims,
    /// see [`live_export_allocations`].
    pub fn in_process(config: RuntimeConfig) -> Result<Self, ExportError> {
        let isa = build_isa(&config, None, false)?;
        let data = data_layout(&*isa);
        let mut builder = JITBuilder::with_isa(isa, default_libcall_names());
        builder.symbol("malloc", export_malloc as *const u8);
        builder.symbol("free", export_free as *const u8);
        Self::with_module(JITModule::new(builder), config, data, None)
    }

    pub fn finish_in_process(mut self) -> Result<LoadedExport, ExportError> {
        self.check_linkage()?;
        self.module.finalize_definitions()?;

        let resolve = |id: FuncId| self.module.get_finalized_function(id);
        let abi = self.abi;
        // SAFETY: each pointer is the finalized code of the ABI function with
        // the matching signature, defined in `define_abi`.
        let functions = unsafe {
            LoadedAbi {
                create: mem::transmute::<*const u8, CreateFn>(resolve(abi.create)),
                get_input: mem::transmute::<*const u8, PortFn>(resolve(abi.get_input)),
                get_output: mem::transmute::<*const u8, PortFn>(resolve(abi.get_output)),
                generate: mem::transmute::<*const u8, InstrumentFn>(resolve(abi.generate)),
                destroy: mem::transmute::<*const u8, InstrumentFn>(resolve(abi.destroy)),
                midi_push: mem::transmute::<*const u8, MidiPushFn>(resolve(abi.midi_push)),
                midi_clear: mem::transmute::<*const u8, QueueFn>(resolve(abi.midi_clear)),
                num_write: mem::transmute::<*const u8, NumWriteFn>(resolve(abi.num_write)),
                num_read: mem::transmute::<*const u8, NumReadFn>(resolve(abi.num_read)),
            }
        };
        let definitions = self
            .definitions
            .iter()
            .map(|(name, id)| (name.clone(), self.module.get_finalized_data(*id).0))
            .collect();
        debug!(exports = self.definitions.len(), "export loaded in process");

        Ok(LoadedExport {
            module: Some(self.module),
            abi: functions,
            definitions,
        })
    }
}

impl<M: Module> Exporter<M> {
    fn with_module(
        mut module: M,
        config: RuntimeConfig,
        data: DataLayout,
        mut clif: Option<String>,
    ) -> Result<Self, ExportError> {
        let common = define_common(&mut module, Linkage::Local, &mut clif)?;
        let mut symbols: Vec<(String, Linkage)> = CommonFunctions::symbols()
            .into_iter()
            .map(|name| (name, Linkage::Local))
            .collect();
        let abi = define_abi(&mut module, &common, &mut symbols, &mut clif)?;
        debug!(pointer_bytes = data.pointer_bytes(), "export module prepared");
        Ok(Self {
            module,
            config,
            data,
            common,
            abi,
            definitions: Vec::new(),
            symbols,
            clif,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn common(&self) -> &CommonFunctions {
        &self.common
    }

    /// Names of the definitions added so far.
    pub fn exports(&self) -> impl Iterator<Item = &str> {
        self.definitions.iter().map(|(name, _)| name.as_str())
    }

    /// Compiles `runtime` from scratch and adds it under `name`. The live
    /// storage at that moment becomes the initial state of every instrument
    /// created from the export.
    pub fn add_runtime(&mut self, runtime: &mut Runtime, name: &str) -> Result<(), ExportError> {
        if self.definitions.iter().any(|(existing, _)| existing == name) {
            return Err(ExportError::DuplicateName(name.to_string()));
        }
        if runtime.data_layout().is_little_endian() != self.data.is_little_endian() {
            return Err(BackendError::UnsupportedTarget(
                "target byte order differs from the host".into(),
            )
            .into());
        }
        info!(export = name, "adding runtime to export");

        runtime.schedule_full_compile();
        runtime.compile()?;

        let unresolved = |port: &str| {
            error!(export = name, port, "export port has no storage slot");
            ExportError::UnresolvedGroup {
                export: name.to_string(),
                port: port.to_string(),
            }
        };
        let root = runtime.root();
        let root_class = runtime.class(root).map_err(|_| unresolved("root"))?.clone();
        let classes = runtime.compiled_classes();
        let snapshot = runtime.snapshot_storage().map_err(|_| unresolved("storage"))?;

        let mut inputs = Vec::new();
        let mut input_nodes = runtime.input().into_iter().collect::<Vec<_>>();
        input_nodes.extend(runtime.automation_nodes(root).unwrap_or_default());
        for node in input_nodes {
            let port = PortRef::new(node, "value");
            let offset = root_class
                .offset_of(&port)
                .ok_or_else(|| unresolved(&port.to_string()))?;
            inputs.push(offset);
        }
        let mut outputs = Vec::new();
        if let Some(node) = runtime.output() {
            let port = PortRef::new(node, "value");
            let offset = root_class
                .offset_of(&port)
                .ok_or_else(|| unresolved(&port.to_string()))?;
            outputs.push(offset);
        }

        let prefix = format!("{}.", name);
        let codes: Vec<ClassCode<'_>> = classes
            .iter()
            .map(|class| ClassCode {
                id: class.id,
                constructor: &class.constructor,
                generate: &class.generate,
                destructor: &class.destructor,
            })
            .collect();
        let linked = link_classes(
            &mut self.module,
            &self.common,
            &prefix,
            Linkage::Local,
            &codes,
            &mut self.clif,
        )?;
        self.symbols
            .extend(linked.symbols.iter().map(|symbol| (symbol.clone(), Linkage::Local)));
        let functions = linked
            .classes
            .get(&root_class.id)
            .copied()
            .ok_or(BackendError::UnknownClass(root_class.id))?;

        let snapshot_id = self.define_bytes(&format!("{}snapshot", prefix), snapshot)?;
        let inputs_id = self.define_table(&format!("{}inputs", prefix), &inputs)?;
        let outputs_id = self.define_table(&format!("{}outputs", prefix), &outputs)?;

        let pointer = self.data.pointer_bytes();
        let mut bytes = Vec::with_capacity((pointer * fields::FIELDS) as usize);
        self.data.encode_usize(u64::from(root_class.layout.size()), &mut bytes);
        bytes.resize((pointer * fields::FIELDS) as usize, 0);

        let mut desc = DataDescription::new();
        desc.define(bytes.into_boxed_slice());
        desc.set_align(u64::from(pointer));
        for (field, data) in [
            (fields::SNAPSHOT, snapshot_id),
            (fields::INPUTS, inputs_id),
            (fields::OUTPUTS, outputs_id),
        ] {
            let gv = self.module.declare_data_in_data(data, &mut desc);
            desc.write_data_addr(field * pointer, gv, 0);
        }
        for (field, method) in [
            (fields::CONSTRUCTOR, Method::Constructor),
            (fields::GENERATE, Method::Generate),
            (fields::DESTRUCTOR, Method::Destructor),
        ] {
            let func = self.module.declare_func_in_data(functions.get(method), &mut desc);
            desc.write_function_addr(field * pointer, func);
        }
        let id = self.module.declare_data(name, Linkage::Export, false, false)?;
        self.module.define_data(id, &desc)?;
        self.symbols.push((name.to_string(), Linkage::Export));
        self.definitions.push((name.to_string(), id));

        if let Some(text) = self.clif.as_mut() {
            let _ = writeln!(
                text,
                "; definition {}: size {}, inputs {:?}, outputs {:?}, root {}",
                name,
                root_class.layout.size(),
                inputs,
                outputs,
                crate::codegen::lower::class_symbol(&prefix, root_class.id, Method::Generate),
            );
        }
        info!(
            export = name,
            classes = classes.len(),
            size = root_class.layout.size(),
            inputs = inputs.len(),
            outputs = outputs.len(),
            "runtime exported"
        );
        Ok(())
    }

    fn define_bytes(&mut self, name: &str, bytes: Vec<u8>) -> Result<DataId, ExportError> {
        let len = bytes.len();
        let id = self.module.declare_data(name, Linkage::Local, false, false)?;
        let mut desc = DataDescription::new();
        desc.define(bytes.into_boxed_slice());
        desc.set_align(16);
        self.module.define_data(id, &desc)?;
        self.symbols.push((name.to_string(), Linkage::Local));
        if let Some(text) = self.clif.as_mut() {
            let _ = writeln!(text, "; data {}: {} bytes", name, len);
        }
        Ok(id)
    }

    /// A table of offsets prefixed with its length, every entry pointer wide.
    fn define_table(&mut self, name: &str, offsets: &[u32]) -> Result<DataId, ExportError> {
        let mut bytes = Vec::new();
        self.data.encode_usize(offsets.len() as u64, &mut bytes);
        for offset in offsets {
            self.data.encode_usize(u64::from(*offset), &mut bytes);
        }
        self.define_bytes(name, bytes)
    }

    fn check_linkage(&self) -> Result<(), ExportError> {
        for (name, linkage) in &self.symbols {
            let public = ABI_FUNCTIONS.contains(&name.as_str())
                || self.definitions.iter().any(|(export, _)| export == name);
            let allowed = match linkage {
                Linkage::Local => true,
                Linkage::Export => public,
                Linkage::Import => IMPORTS.contains(&name.as_str()),
                _ => false,
            };
            if !allowed {
                error!(symbol = name.as_str(), ?linkage, "symbol escapes the export");
                return Err(ExportError::LinkageViolation(name.clone()));
            }
        }
        Ok(())
    }
}

fn define_abi<M: Module>(
    module: &mut M,
    common: &CommonFunctions,
    symbols: &mut Vec<(String, Linkage)>,
    clif: &mut Option<String>,
) -> Result<AbiFunctions, BackendError> {
    let ptr = module.target_config().pointer_type();
    let pointer = i32::from(module.target_config().pointer_bytes());
    let method = method_signature(module);

    let signature = |module: &M, params: &[Type], returns: &[Type]| {
        let mut sig = module.make_signature();
        sig.params.extend(params.iter().map(|ty| AbiParam::new(*ty)));
        sig.returns.extend(returns.iter().map(|ty| AbiParam::new(*ty)));
        sig
    };
    let malloc_sig = signature(&*module, &[ptr], &[ptr]);
    let free_sig = signature(&*module, &[ptr], &[]);
    let malloc = module.declare_function("malloc", Linkage::Import, &malloc_sig)?;
    let free = module.declare_function("free", Linkage::Import, &free_sig)?;
    symbols.push(("malloc".into(), Linkage::Import));
    symbols.push(("free".into(), Linkage::Import));

    let create_sig = signature(&*module, &[ptr], &[ptr]);
    let port_sig = signature(&*module, &[ptr, types::I32], &[ptr]);
    let instrument_sig = signature(&*module, &[ptr], &[]);
    let push_sig = signature(&*module, &[ptr, types::I64], &[]);
    let write_sig = signature(&*module, &[ptr, types::F32], &[]);
    let read_sig = signature(&*module, &[ptr], &[types::F32]);

    let mut declare = |module: &mut M, name: &str, sig: &Signature| {
        symbols.push((name.to_string(), Linkage::Export));
        module.declare_function(name, Linkage::Export, sig)
    };
    let abi = AbiFunctions {
        create: declare(module, "oscen_create_instrument", &create_sig)?,
        get_input: declare(module, "oscen_get_input", &port_sig)?,
        get_output: declare(module, "oscen_get_output", &port_sig)?,
        generate: declare(module, "oscen_generate", &instrument_sig)?,
        destroy: declare(module, "oscen_destroy_instrument", &instrument_sig)?,
        midi_push: declare(module, "oscen_midi_push", &push_sig)?,
        midi_clear: declare(module, "oscen_midi_clear", &instrument_sig)?,
        num_write: declare(module, "oscen_num_write", &write_sig)?,
        num_read: declare(module, "oscen_num_read", &read_sig)?,
    };

    let field = |index: u32| pointer * index as i32;
    let flags = MemFlags::trusted();

    define_function(module, abi.create, &create_sig, "oscen_create_instrument", clif, |module, b, params| {
        let definition = params[0];
        let malloc = module.declare_func_in_func(malloc, b.func);
        let size = b.ins().load(ptr, flags, definition, field(fields::SIZE));
        let total = b.ins().iadd_imm(size, i64::from(INSTRUMENT_HEADER));
        let call = b.ins().call(malloc, &[total]);
        let instrument = b.inst_results(call)[0];

        let ok = b.create_block();
        let failed = b.create_block();
        b.ins().brif(instrument, ok, &[], failed, &[]);

        b.switch_to_block(failed);
        b.ins().return_(&[instrument]);

        b.switch_to_block(ok);
        let data = b.ins().iadd_imm(instrument, i64::from(INSTRUMENT_HEADER));
        b.ins().store(flags, data, instrument, 0);
        b.ins().store(flags, definition, instrument, pointer);
        let snapshot = b.ins().load(ptr, flags, definition, field(fields::SNAPSHOT));
        b.call_memcpy(module.target_config(), data, snapshot, size);
        let constructor = b.ins().load(ptr, flags, definition, field(fields::CONSTRUCTOR));
        let sig = b.import_signature(method.clone());
        b.ins().call_indirect(sig, constructor, &[data]);
        b.ins().return_(&[instrument]);
        Ok(())
    })?;

    for (id, name, table) in [
        (abi.get_input, "oscen_get_input", fields::INPUTS),
        (abi.get_output, "oscen_get_output", fields::OUTPUTS),
    ] {
        define_function(module, id, &port_sig, name, clif, |_, b, params| {
            let (instrument, index) = (params[0], params[1]);
            let index = if ptr == types::I32 {
                index
            } else {
                b.ins().uextend(ptr, index)
            };
            let definition = b.ins().load(ptr, flags, instrument, pointer);
            let table = b.ins().load(ptr, flags, definition, field(table));
            let count = b.ins().load(ptr, flags, table, 0);

            let found = b.create_block();
            let missing = b.create_block();
            let in_range = b.ins().icmp(IntCC::UnsignedLessThan, index, count);
            b.ins().brif(in_range, found, &[], missing, &[]);

            b.switch_to_block(missing);
            let null = b.ins().iconst(ptr, 0);
            b.ins().return_(&[null]);

            b.switch_to_block(found);
            let scaled = b.ins().imul_imm(index, i64::from(pointer));
            let entry = b.ins().iadd(table, scaled);
            let offset = b.ins().load(ptr, flags, entry, pointer);
            let data = b.ins().load(ptr, flags, instrument, 0);
            let slot = b.ins().iadd(data, offset);
            b.ins().return_(&[slot]);
            Ok(())
        })?;
    }

    define_function(module, abi.generate, &instrument_sig, "oscen_generate", clif, |_, b, params| {
        let data = b.ins().load(ptr, flags, params[0], 0);
        let definition = b.ins().load(ptr, flags, params[0], pointer);
        let generate = b.ins().load(ptr, flags, definition, field(fields::GENERATE));
        let sig = b.import_signature(method.clone());
        b.ins().call_indirect(sig, generate, &[data]);
        b.ins().return_(&[]);
        Ok(())
    })?;

    define_function(module, abi.destroy, &instrument_sig, "oscen_destroy_instrument", clif, |module, b, params| {
        let instrument = params[0];
        let free = module.declare_func_in_func(free, b.func);
        let data = b.ins().load(ptr, flags, instrument, 0);
        let definition = b.ins().load(ptr, flags, instrument, pointer);
        let destructor = b.ins().load(ptr, flags, definition, field(fields::DESTRUCTOR));
        let sig = b.import_signature(method.clone());
        b.ins().call_indirect(sig, destructor, &[data]);
        b.ins().call(free, &[instrument]);
        b.ins().return_(&[]);
        Ok(())
    })?;

    define_function(module, abi.midi_push, &push_sig, "oscen_midi_push", clif, |module, b, params| {
        let push = module.declare_func_in_func(common.midi_push, b.func);
        b.ins().call(push, &[params[0], params[1]]);
        b.ins().return_(&[]);
        Ok(())
    })?;

    define_function(module, abi.midi_clear, &instrument_sig, "oscen_midi_clear", clif, |module, b, params| {
        let clear = module.declare_func_in_func(common.midi_clear, b.func);
        b.ins().call(clear, &[params[0]]);
        b.ins().return_(&[]);
        Ok(())
    })?;

    define_function(module, abi.num_write, &write_sig, "oscen_num_write", clif, |_, b, params| {
        b.ins().store(flags, params[1], params[0], 0);
        b.ins().return_(&[]);
        Ok(())
    })?;

    define_function(module, abi.num_read, &read_sig, "oscen_num_read", clif, |_, b, params| {
        let value = b.ins().load(types::F32, flags, params[0], 0);
        b.ins().return_(&[value]);
        Ok(())
    })?;

    Ok(abi)
}

type CreateFn = unsafe extern "C" fn(*const u8) -> *mut u8;
type PortFn = unsafe extern "C" fn(*mut u8, u32) -> *mut u8;
type InstrumentFn = unsafe extern "C" fn(*mut u8);
type QueueFn = unsafe extern "C" fn(*mut u8);
type MidiPushFn = unsafe extern "C" fn(*mut u8, u64);
type NumWriteFn = unsafe extern "C" fn(*mut u8, f32);
type NumReadFn = unsafe extern "C" fn(*mut u8) -> f32;

struct LoadedAbi {
    create: CreateFn,
    get_input: PortFn,
    get_output: PortFn,
    generate: InstrumentFn,
    destroy: InstrumentFn,
    midi_push: MidiPushFn,
    midi_clear: QueueFn,
    num_write: NumWriteFn,
    num_read: NumReadFn,
}

/// An export module finalized in this process.
pub struct LoadedExport {
    module: Option<JITModule>,
    abi: LoadedAbi,
    definitions: HashMap<String, *const u8>,
}

impl LoadedExport {
    pub fn definition(&self, name: &str) -> Option<DefinitionView<'_>> {
        self.definitions.get(name).map(|ptr| DefinitionView {
            ptr: ptr.cast(),
            _export: self,
        })
    }

    /// Creates an instrument through `oscen_create_instrument`. Returns
    /// `None` for an unknown name or a failed allocation.
    pub fn instantiate(&self, name: &str) -> Option<Instrument<'_>> {
        let definition = *self.definitions.get(name)?;
        // SAFETY: `definition` is a finalized `ExportDefinition` of this module.
        let ptr = unsafe { (self.abi.create)(definition) };
        if ptr.is_null() {
            return None;
        }
        Some(Instrument { export: self, ptr })
    }
}

impl Drop for LoadedExport {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // SAFETY: instruments borrow the export, so none is alive here.
            unsafe { module.free_memory() };
        }
    }
}

impl std::fmt::Debug for LoadedExport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedExport")
            .field("definitions", &self.definitions.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Read access to an `ExportDefinition` in memory.
pub struct DefinitionView<'a> {
    ptr: *const usize,
    _export: &'a LoadedExport,
}

impl DefinitionView<'_> {
    fn field(&self, index: u32) -> usize {
        // SAFETY: the definition has `fields::FIELDS` pointer sized fields.
        unsafe { self.ptr.add(index as usize).read() }
    }

    fn table(&self, index: u32) -> Vec<usize> {
        let table = self.field(index) as *const usize;
        // SAFETY: tables start with their length, see `define_table`.
        unsafe {
            let len = table.read();
            (1..=len).map(|i| table.add(i).read()).collect()
        }
    }

    pub fn storage_size(&self) -> usize {
        self.field(fields::SIZE)
    }

    pub fn snapshot(&self) -> &[u8] {
        let ptr = self.field(fields::SNAPSHOT) as *const u8;
        // SAFETY: the snapshot object holds `storage_size` bytes.
        unsafe { std::slice::from_raw_parts(ptr, self.storage_size()) }
    }

    pub fn input_offsets(&self) -> Vec<usize> {
        self.table(fields::INPUTS)
    }

    pub fn output_offsets(&self) -> Vec<usize> {
        self.table(fields::OUTPUTS)
    }
}

/// An instrument created from a [`LoadedExport`]. Destroyed on drop.
pub struct Instrument<'a> {
    export: &'a LoadedExport,
    ptr: *mut u8,
}

impl Instrument<'_> {
    pub fn generate(&mut self) {
        // SAFETY: `ptr` came from `oscen_create_instrument` and is alive.
        unsafe { (self.export.abi.generate)(self.ptr) }
    }

    pub fn input(&self, index: u32) -> Option<*mut u8> {
        // SAFETY: as above; out of range indexes return null.
        let slot = unsafe { (self.export.abi.get_input)(self.ptr, index) };
        (!slot.is_null()).then_some(slot)
    }

    pub fn output(&self, index: u32) -> Option<*mut u8> {
        // SAFETY: as above.
        let slot = unsafe { (self.export.abi.get_output)(self.ptr, index) };
        (!slot.is_null()).then_some(slot)
    }

    /// Reads a numeric output slot.
    pub fn read_output(&self, index: u32) -> Option<f32> {
        let slot = self.output(index)?;
        // SAFETY: output slots of an export are numeric.
        Some(unsafe { (self.export.abi.num_read)(slot) })
    }

    /// Writes a numeric input slot, such as an automation input.
    pub fn write_input(&mut self, index: u32, value: f32) -> bool {
        match self.input(index) {
            Some(slot) => {
                // SAFETY: the caller picks a numeric input.
                unsafe { (self.export.abi.num_write)(slot, value) };
                true
            }
            None => false,
        }
    }

    /// Pushes an event into a MIDI input. Events stay queued until
    /// [`clear_midi`](Self::clear_midi).
    pub fn push_midi(&mut self, index: u32, event: MidiEvent) -> bool {
        match self.input(index) {
            Some(slot) => {
                // SAFETY: the caller picks a MIDI input.
                unsafe { (self.export.abi.midi_push)(slot, event.to_bits()) };
                true
            }
            None => false,
        }
    }

    pub fn clear_midi(&mut self, index: u32) -> bool {
        match self.input(index) {
            Some(slot) => {
                // SAFETY: as in `push_midi`.
                unsafe { (self.export.abi.midi_clear)(slot) };
                true
            }
            None => false,
        }
    }
}

impl Drop for Instrument<'_> {
    fn drop(&mut self) {
        // SAFETY: `ptr` is alive and dropped exactly once.
        unsafe { (self.export.abi.destroy)(self.ptr) }
    }
}

thread_local! {
    static LIVE_ALLOCATIONS: Cell<isize> = const { Cell::new(0) };
}

const SHIM_HEADER: usize = 16;

/// Allocations made by in-process exports on this thread that have not been
/// freed yet.
pub fn live_export_allocations() -> isize {
    LIVE_ALLOCATIONS.with(Cell::get)
}

extern "C" fn export_malloc(size: usize) -> *mut u8 {
    let Ok(layout) = Layout::from_size_align(size + SHIM_HEADER, SHIM_HEADER) else {
        return std::ptr::null_mut();
    };
    // SAFETY: `layout` is at least `SHIM_HEADER` bytes.
    unsafe {
        let base = alloc(layout);
        if base.is_null() {
            return base;
        }
        base.cast::<usize>().write(size);
        LIVE_ALLOCATIONS.with(|live| live.set(live.get() + 1));
        base.add(SHIM_HEADER)
    }
}

extern "C" fn export_free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    // SAFETY: `ptr` was returned by `export_malloc`, which stored the size
    // in front of it.
    unsafe {
        let base = ptr.sub(SHIM_HEADER);
        let size = base.cast::<usize>().read();
        dealloc(base, Layout::from_size_align_unchecked(size + SHIM_HEADER, SHIM_HEADER));
    }
    LIVE_ALLOCATIONS.with(|live| live.set(live.get() - 1));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_names_are_exported_and_unique() {
        let mut names = ABI_FUNCTIONS.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 9);
    }

    #[test]
    fn shim_allocations_balance() {
        let before = live_export_allocations();
        let ptr = export_malloc(40);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % SHIM_HEADER, 0);
        assert_eq!(live_export_allocations(), before + 1);
        export_free(ptr);
        assert_eq!(live_export_allocations(), before);
    }

    #[test]
    fn local_symbols_pass_the_linkage_check() {
        let exporter = Exporter::object(RuntimeConfig::default(), None).unwrap();
        exporter.check_linkage().unwrap();
        let clif = exporter.finish(ExportFormat::Clif).unwrap();
        let text = String::from_utf8(clif).unwrap();
        assert!(text.contains("; oscen_create_instrument"));
        assert!(text.contains("; oscen.midi_push"));
    }
}
