//! The expression language custom nodes are written in.
//!
//! A script is a list of assignments separated by newlines or `;`:
//!
//! ```text
//! # one pole smoother
//! k = exp2(-cutoff:num / samplerate)
//! out:num = mix(in:num, prev:num, k)
//! ```
//!
//! `name:num` and `name:midi` are controls. A control that is assigned
//! anywhere in the script becomes an output port of the node, every other
//! control becomes an input port. Bare names are locals or one of the
//! constants `pi` and `samplerate`. Calls resolve through
//! [`Function::from_name`](crate::codegen::function::Function::from_name).

mod compile;
mod lexer;
mod parser;

pub use compile::{compile, CompiledScript};
pub use parser::{parse, Expr, ExprKind, Program, Statement, Target};
