//! Layout independent code generation.
//!
//! Nodes emit [`ir::Fragment`]s through the [`function::Function`] layer.
//! Fragments only become machine code in [`lower`], which works against any
//! `cranelift_module::Module`, so the JIT and the exporter share one path.

pub mod common;
pub mod function;
pub mod ir;
pub mod layout;
pub mod lower;
pub mod midi;
pub mod optimize;
pub mod value;
