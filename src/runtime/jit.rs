use std::mem;

use cranelift::codegen::ir::Endianness;
use cranelift::codegen::isa::{self, OwnedTargetIsa, TargetIsa};
use cranelift::codegen::settings::{self, Configurable};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, Linkage, Module};
use target_lexicon::Triple;
use tracing::debug;

use crate::codegen::common::define_common;
use crate::codegen::ir::{ClassId, Method};
use crate::codegen::layout::DataLayout;
use crate::codegen::lower::{link_classes, ClassCode};
use crate::config::RuntimeConfig;
use crate::error::BackendError;

/// Signature of every generated class method.
pub type MethodFn = unsafe extern "C" fn(*mut u8);

/// Builds the target ISA. `None` selects the host.
pub fn build_isa(
    config: &RuntimeConfig,
    triple: Option<Triple>,
    pic: bool,
) -> Result<OwnedTargetIsa, BackendError> {
    let mut flags = settings::builder();
    let setting = |e: settings::SetError| BackendError::Settings(e.to_string());
    flags.set("opt_level", config.opt_level.as_setting()).map_err(setting)?;
    flags.set("is_pic", if pic { "true" } else { "false" }).map_err(setting)?;
    flags.set("use_colocated_libcalls", "false").map_err(setting)?;

    let builder = match triple {
        None => cranelift_native::builder().map_err(BackendError::NoNativeTarget)?,
        Some(triple) => {
            isa::lookup(triple).map_err(|e| BackendError::UnsupportedTarget(e.to_string()))?
        }
    };
    let isa = builder.finish(settings::Flags::new(flags))?;
    debug!(triple = %isa.triple(), opt_level = config.opt_level.as_setting(), "target isa ready");
    Ok(isa)
}

pub fn data_layout(isa: &dyn TargetIsa) -> DataLayout {
    DataLayout::new(isa.pointer_bytes(), isa.endianness() == Endianness::Little)
}

/// The live backend. Every link produces a fresh [`Program`] in its own JIT
/// module, so code of a published program is never patched in place.
pub struct Jit {
    isa: OwnedTargetIsa,
}

impl Jit {
    pub fn new(config: &RuntimeConfig) -> Result<Self, BackendError> {
        Ok(Self {
            isa: build_isa(config, None, false)?,
        })
    }

    pub fn data_layout(&self) -> DataLayout {
        data_layout(&*self.isa)
    }

    pub fn link(&self, classes: &[ClassCode<'_>], root: ClassId) -> Result<Program, BackendError> {
        let builder = JITBuilder::with_isa(self.isa.clone(), default_libcall_names());
        let mut module = JITModule::new(builder);

        let mut clif = None;
        let common = define_common(&mut module, Linkage::Local, &mut clif)?;
        let linked = link_classes(&mut module, &common, "", Linkage::Local, classes, &mut clif)?;
        module.finalize_definitions()?;

        let functions = linked
            .classes
            .get(&root)
            .copied()
            .ok_or(BackendError::UnknownClass(root))?;
        let resolve = |method: Method| {
            let code = module.get_finalized_function(functions.get(method));
            // SAFETY: every class method is defined with `method_signature`.
            unsafe { mem::transmute::<*const u8, MethodFn>(code) }
        };
        let constructor = resolve(Method::Constructor);
        let generate = resolve(Method::Generate);
        let destructor = resolve(Method::Destructor);
        debug!(classes = classes.len(), symbols = linked.symbols.len(), "linked program");

        Ok(Program {
            module: Some(module),
            constructor,
            generate,
            destructor,
        })
    }
}

/// Finalized native code of one root class. The code stays mapped until the
/// program is dropped.
pub struct Program {
    module: Option<JITModule>,
    constructor: MethodFn,
    generate: MethodFn,
    destructor: MethodFn,
}

// SAFETY: the module is only touched again in `drop`; the finalized code is
// immutable and the methods only access the storage they are given.
unsafe impl Send for Program {}
unsafe impl Sync for Program {}

impl Program {
    pub fn method(&self, method: Method) -> MethodFn {
        match method {
            Method::Constructor => self.constructor,
            Method::Generate => self.generate,
            Method::Destructor => self.destructor,
        }
    }

    /// # Safety
    ///
    /// `storage` must point to a live block laid out for this program's root
    /// class, and nothing else may access it during the call.
    pub unsafe fn call(&self, method: Method, storage: *mut u8) {
        (self.method(method))(storage)
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // SAFETY: no function pointer of this program outlives it.
            unsafe { module.free_memory() };
        }
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program").finish_non_exhaustive()
    }
}
