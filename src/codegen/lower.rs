//! Lowering of IR fragments into Cranelift functions.
//!
//! Everything here is generic over [`Module`], so the same code feeds a
//! `JITModule` for live playback and an `ObjectModule` for export.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Write as _;

use cranelift::codegen::ir::{FuncRef, UserFuncName};
use cranelift::prelude::*;
use cranelift_module::{FuncId, Linkage, Module};

use super::common::CommonFunctions;
use super::ir::{Address, Arg, Base, BinaryOp, ClassId, Compare, Fragment, Inst, Method, Reg, UnaryOp};
use crate::error::BackendError;

/// The three methods of one surface class, ready to be lowered.
#[derive(Debug, Clone, Copy)]
pub struct ClassCode<'a> {
    pub id: ClassId,
    pub constructor: &'a Fragment,
    pub generate: &'a Fragment,
    pub destructor: &'a Fragment,
}

impl ClassCode<'_> {
    fn method(&self, method: Method) -> &Fragment {
        match method {
            Method::Constructor => self.constructor,
            Method::Generate => self.generate,
            Method::Destructor => self.destructor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassFunctions {
    pub constructor: FuncId,
    pub generate: FuncId,
    pub destructor: FuncId,
}

impl ClassFunctions {
    pub fn get(&self, method: Method) -> FuncId {
        match method {
            Method::Constructor => self.constructor,
            Method::Generate => self.generate,
            Method::Destructor => self.destructor,
        }
    }
}

/// Result of [`link_classes`].
#[derive(Debug, Default)]
pub struct Linked {
    pub classes: HashMap<ClassId, ClassFunctions>,
    /// Every symbol declared while linking, in declaration order.
    pub symbols: Vec<String>,
}

pub fn class_symbol(prefix: &str, id: ClassId, method: Method) -> String {
    format!("{}s{:x}.{}", prefix, id.0, method.name())
}

/// `fn(storage: *mut u8)`, the signature of every class method.
pub fn method_signature<M: Module>(module: &M) -> Signature {
    let mut sig = module.make_signature();
    sig.params
        .push(AbiParam::new(module.target_config().pointer_type()));
    sig
}

/// Declares and defines all methods of `classes`. Classes may call each
/// other's methods regardless of order.
pub fn link_classes<M: Module>(
    module: &mut M,
    common: &CommonFunctions,
    prefix: &str,
    linkage: Linkage,
    classes: &[ClassCode<'_>],
    clif: &mut Option<String>,
) -> Result<Linked, BackendError> {
    let sig = method_signature(module);
    let mut linked = Linked::default();

    for class in classes {
        let mut ids = [None; 3];
        for (slot, method) in ids.iter_mut().zip(Method::ALL) {
            let name = class_symbol(prefix, class.id, method);
            *slot = Some(module.declare_function(&name, linkage, &sig)?);
            linked.symbols.push(name);
        }
        if let [Some(constructor), Some(generate), Some(destructor)] = ids {
            linked.classes.insert(
                class.id,
                ClassFunctions {
                    constructor,
                    generate,
                    destructor,
                },
            );
        }
    }

    for class in classes {
        let functions = linked
            .classes
            .get(&class.id)
            .copied()
            .ok_or(BackendError::UnknownClass(class.id))?;
        for method in Method::ALL {
            let name = class_symbol(prefix, class.id, method);
            let fragment = class.method(method);
            define_function(module, functions.get(method), &sig, &name, clif, |module, builder, params| {
                lower_fragment(module, builder, params[0], fragment, common, &linked.classes)
            })?;
        }
    }

    Ok(linked)
}

/// Builds and defines one function. `body` receives the entry block
/// parameters and must terminate the function.
pub(crate) fn define_function<M, F>(
    module: &mut M,
    id: FuncId,
    sig: &Signature,
    name: &str,
    clif: &mut Option<String>,
    body: F,
) -> Result<(), BackendError>
where
    M: Module,
    F: FnOnce(&mut M, &mut FunctionBuilder<'_>, &[Value]) -> Result<(), BackendError>,
{
    let mut ctx = module.make_context();
    ctx.func.signature = sig.clone();
    ctx.func.name = UserFuncName::user(0, id.as_u32());

    let mut builder_context = FunctionBuilderContext::new();
    {
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_context);
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        let params = builder.block_params(entry).to_vec();
        body(module, &mut builder, &params)?;
        builder.seal_all_blocks();
        builder.finalize();
    }

    if let Some(text) = clif.as_mut() {
        let _ = writeln!(text, "; {}\n{}", name, ctx.func.display());
    }

    module.define_function(id, &mut ctx)?;
    module.clear_context(&mut ctx);
    Ok(())
}

fn lower_fragment<M: Module>(
    module: &mut M,
    builder: &mut FunctionBuilder<'_>,
    storage: Value,
    fragment: &Fragment,
    common: &CommonFunctions,
    classes: &HashMap<ClassId, ClassFunctions>,
) -> Result<(), BackendError> {
    let mut regs: Vec<Option<Value>> = vec![None; fragment.next_reg as usize];
    let mut refs: HashMap<FuncId, FuncRef> = HashMap::new();
    let flags = MemFlags::trusted();

    let mut func_ref = |module: &mut M, builder: &mut FunctionBuilder<'_>, id: FuncId| match refs.entry(id) {
        Entry::Occupied(entry) => *entry.get(),
        Entry::Vacant(entry) => *entry.insert(module.declare_func_in_func(id, builder.func)),
    };

    for inst in &fragment.insts {
        match inst {
            Inst::Const { dst, value } => {
                let v = builder.ins().f32const(*value);
                set(&mut regs, *dst, v)?;
            }
            Inst::Unary { dst, op, arg } => {
                let x = get(&regs, *arg)?;
                let v = match op {
                    UnaryOp::Neg => builder.ins().fneg(x),
                    UnaryOp::Abs => builder.ins().fabs(x),
                    UnaryOp::Floor => builder.ins().floor(x),
                    UnaryOp::Sqrt => builder.ins().sqrt(x),
                    UnaryOp::Nearest => builder.ins().nearest(x),
                };
                set(&mut regs, *dst, v)?;
            }
            Inst::Binary { dst, op, lhs, rhs } => {
                let a = get(&regs, *lhs)?;
                let b = get(&regs, *rhs)?;
                let v = match op {
                    BinaryOp::Add => builder.ins().fadd(a, b),
                    BinaryOp::Sub => builder.ins().fsub(a, b),
                    BinaryOp::Mul => builder.ins().fmul(a, b),
                    BinaryOp::Div => builder.ins().fdiv(a, b),
                    BinaryOp::Min => builder.ins().fmin(a, b),
                    BinaryOp::Max => builder.ins().fmax(a, b),
                };
                set(&mut regs, *dst, v)?;
            }
            Inst::Compare {
                dst,
                cond,
                lhs,
                rhs,
            } => {
                let a = get(&regs, *lhs)?;
                let b = get(&regs, *rhs)?;
                let cc = match cond {
                    Compare::Less => FloatCC::LessThan,
                    Compare::Greater => FloatCC::GreaterThan,
                    Compare::LessEq => FloatCC::LessThanOrEqual,
                    Compare::GreaterEq => FloatCC::GreaterThanOrEqual,
                    Compare::Equal => FloatCC::Equal,
                    Compare::NotEqual => FloatCC::NotEqual,
                };
                let test = builder.ins().fcmp(cc, a, b);
                let one = builder.ins().f32const(1.0);
                let zero = builder.ins().f32const(0.0);
                let v = builder.ins().select(test, one, zero);
                set(&mut regs, *dst, v)?;
            }
            Inst::Select {
                dst,
                cond,
                if_true,
                if_false,
            } => {
                let c = get(&regs, *cond)?;
                let t = get(&regs, *if_true)?;
                let f = get(&regs, *if_false)?;
                let zero = builder.ins().f32const(0.0);
                let test = builder.ins().fcmp(FloatCC::NotEqual, c, zero);
                let v = builder.ins().select(test, t, f);
                set(&mut regs, *dst, v)?;
            }
            Inst::Load { dst, addr } => {
                let offset = storage_offset(*addr)?;
                let v = builder.ins().load(types::F32, flags, storage, offset);
                set(&mut regs, *dst, v)?;
            }
            Inst::Store { addr, src } => {
                let offset = storage_offset(*addr)?;
                let v = get(&regs, *src)?;
                builder.ins().store(flags, v, storage, offset);
            }
            Inst::Call { dst, helper, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(match arg {
                        Arg::Num(reg) => get(&regs, *reg)?,
                        Arg::Addr(addr) => pointer(builder, storage, *addr)?,
                    });
                }
                let callee = func_ref(module, builder, common.helper(*helper));
                let call = builder.ins().call(callee, &values);
                if let Some(dst) = dst {
                    let v = builder.inst_results(call)[0];
                    set(&mut regs, *dst, v)?;
                }
            }
            Inst::CallClass {
                class,
                method,
                addr,
            } => {
                let functions = classes
                    .get(class)
                    .ok_or(BackendError::UnknownClass(*class))?;
                let ptr = pointer(builder, storage, *addr)?;
                let callee = func_ref(module, builder, functions.get(*method));
                builder.ins().call(callee, &[ptr]);
            }
        }
    }

    builder.ins().return_(&[]);
    Ok(())
}

fn get(regs: &[Option<Value>], reg: Reg) -> Result<Value, BackendError> {
    regs.get(reg.0 as usize)
        .copied()
        .flatten()
        .ok_or(BackendError::UndefinedRegister(reg.0))
}

fn set(regs: &mut [Option<Value>], reg: Reg, value: Value) -> Result<(), BackendError> {
    let slot = regs
        .get_mut(reg.0 as usize)
        .ok_or(BackendError::UndefinedRegister(reg.0))?;
    *slot = Some(value);
    Ok(())
}

fn storage_offset(addr: Address) -> Result<i32, BackendError> {
    match addr.base {
        Base::Storage => Ok(addr.offset as i32),
        other => Err(BackendError::Unbound(other)),
    }
}

fn pointer(builder: &mut FunctionBuilder<'_>, storage: Value, addr: Address) -> Result<Value, BackendError> {
    let offset = storage_offset(addr)?;
    Ok(if offset == 0 {
        storage
    } else {
        builder.ins().iadd_imm(storage, i64::from(offset))
    })
}
