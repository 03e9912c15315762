use std::collections::HashMap;
use std::f32::consts::PI;
use std::ops::Range;

use super::parser::{parse, Expr, ExprKind, Program, Target};
use crate::codegen::function::Function;
use crate::codegen::ir::{Address, Fragment, MethodBuilder};
use crate::codegen::value::{Value, ValueKind};
use crate::error::{CodegenError, SourcePos};
use crate::runtime::types::{PortDescriptor, PortDirection};

/// Code of one custom node.
#[derive(Debug, Clone)]
pub struct CompiledScript {
    /// Inputs in order of first appearance, then outputs in order of first
    /// assignment.
    pub ports: Vec<PortDescriptor>,
    pub fragment: Fragment,
    /// Values assigned to each output port, by port index.
    pub outputs: Vec<(usize, Value)>,
}

/// Compiles node source. Parse errors stop at the first one, errors in
/// statements are collected across the whole source.
pub fn compile(source: &str, sample_rate: f32) -> Result<CompiledScript, Vec<CodegenError>> {
    let program = parse(source).map_err(|e| vec![e])?;
    let mut errors = Vec::new();
    let ports = collect_ports(&program, &mut errors);

    let mut cx = Context {
        method: MethodBuilder::new(sample_rate),
        ports: &ports,
        locals: HashMap::new(),
        assigned: HashMap::new(),
        loaded: HashMap::new(),
    };

    for statement in &program.statements {
        let value = match cx.eval(&statement.value) {
            Ok(value) => value,
            Err(error) => {
                errors.push(error);
                // keeps later statements from reporting the same problem
                if let Target::Local(name) = &statement.target {
                    let zero = cx.method.constant(0.0);
                    cx.locals.insert(name.clone(), Value::Num(zero));
                }
                continue;
            }
        };

        match &statement.target {
            Target::Local(name) => {
                cx.locals.insert(name.clone(), value);
            }
            Target::Control { name, kind } => {
                match cx.coerce(kind, value, statement.value.span.clone()) {
                    Ok(value) => {
                        cx.assigned.insert(name.clone(), value);
                    }
                    Err(error) => errors.push(error),
                }
            }
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    let outputs = ports
        .iter()
        .enumerate()
        .filter(|(_, port)| port.direction == PortDirection::Output)
        .filter_map(|(i, port)| cx.assigned.get(&*port.name).map(|value| (i, value.clone())))
        .collect();

    Ok(CompiledScript {
        fragment: cx.method.finish(),
        ports,
        outputs,
    })
}

/// Controls that are assigned anywhere are outputs, every other control is
/// an input. A control used with two different kinds is an error.
fn collect_ports(program: &Program, errors: &mut Vec<CodegenError>) -> Vec<PortDescriptor> {
    let mut kinds: HashMap<&str, &ValueKind> = HashMap::new();
    let mut outputs: Vec<(&str, &ValueKind)> = Vec::new();
    let mut reads: Vec<(&str, &ValueKind)> = Vec::new();

    for statement in &program.statements {
        let mut controls = Vec::new();
        controls_in(&statement.value, &mut controls);
        for (name, kind, span) in controls {
            if register_kind(&mut kinds, name, kind, span, errors) {
                reads.push((name, kind));
            }
        }
        if let Target::Control { name, kind } = &statement.target {
            if register_kind(&mut kinds, name, kind, statement.target_span.clone(), errors)
                && !outputs.iter().any(|(n, _)| *n == name.as_str())
            {
                outputs.push((name.as_str(), kind));
            }
        }
    }

    let mut ports: Vec<PortDescriptor> = Vec::new();
    for (name, kind) in reads {
        let is_output = outputs.iter().any(|(n, _)| *n == name);
        if !is_output && !ports.iter().any(|p| &*p.name == name) {
            ports.push(PortDescriptor::new(name, kind.clone(), PortDirection::Input));
        }
    }
    for (name, kind) in outputs {
        ports.push(PortDescriptor::new(name, kind.clone(), PortDirection::Output));
    }
    ports
}

/// Records the kind of a control. Returns false on a conflicting use.
fn register_kind<'a>(
    kinds: &mut HashMap<&'a str, &'a ValueKind>,
    name: &'a str,
    kind: &'a ValueKind,
    span: Range<usize>,
    errors: &mut Vec<CodegenError>,
) -> bool {
    match kinds.get(name) {
        Some(known) if *known != kind => {
            errors.push(CodegenError::KindMismatch {
                expected: (*known).clone(),
                found: kind.clone(),
                pos: SourcePos::span(span),
            });
            false
        }
        Some(_) => true,
        None => {
            kinds.insert(name, kind);
            true
        }
    }
}

fn controls_in<'a>(expr: &'a Expr, out: &mut Vec<(&'a str, &'a ValueKind, Range<usize>)>) {
    match &expr.kind {
        ExprKind::Control { name, kind } => out.push((name.as_str(), kind, expr.span.clone())),
        ExprKind::Unary { operand, .. } => controls_in(operand, out),
        ExprKind::Binary { lhs, rhs, .. } => {
            controls_in(lhs, out);
            controls_in(rhs, out);
        }
        ExprKind::Call { args, .. } | ExprKind::Tuple(args) => {
            for arg in args {
                controls_in(arg, out);
            }
        }
        ExprKind::Number(_) | ExprKind::Name(_) => {}
    }
}

struct Context<'a> {
    method: MethodBuilder,
    ports: &'a [PortDescriptor],
    locals: HashMap<String, Value>,
    assigned: HashMap<String, Value>,
    /// Numeric inputs already loaded in this method.
    loaded: HashMap<String, Value>,
}

impl Context<'_> {
    fn eval(&mut self, expr: &Expr) -> Result<Value, CodegenError> {
        let span = expr.span.clone();
        match &expr.kind {
            ExprKind::Number(value) => Ok(Value::Num(self.method.constant(*value))),
            ExprKind::Name(name) => self.name(name, span),
            ExprKind::Control { name, .. } => self.control(name, span),
            ExprKind::Unary { op, operand } => {
                let operand = self.eval(operand)?;
                op.generate(&mut self.method, vec![operand], None)
                    .map_err(|e| e.with_span(span))
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                op.generate(&mut self.method, vec![lhs, rhs], None)
                    .map_err(|e| e.with_span(span))
            }
            ExprKind::Call {
                name,
                name_span,
                args,
            } => {
                let function = Function::from_name(name).ok_or_else(|| CodegenError::UnknownFunction {
                    name: name.clone(),
                    pos: SourcePos::span(name_span.clone()),
                })?;
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                let result = if function.signature().variadic.is_some() {
                    function.generate(&mut self.method, Vec::new(), Some(args))
                } else {
                    function.generate(&mut self.method, args, None)
                };
                result.map_err(|e| e.with_span(span))
            }
            ExprKind::Tuple(items) => {
                let items = items
                    .iter()
                    .map(|item| self.eval(item))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Tuple(items))
            }
        }
    }

    fn name(&mut self, name: &str, span: Range<usize>) -> Result<Value, CodegenError> {
        if let Some(value) = self.locals.get(name) {
            return Ok(value.clone());
        }
        let constant = match name {
            "pi" => PI,
            "samplerate" => self.method.sample_rate(),
            _ => {
                return Err(CodegenError::UnknownName {
                    name: name.to_string(),
                    pos: SourcePos::span(span),
                })
            }
        };
        Ok(Value::Num(self.method.constant(constant)))
    }

    fn control(&mut self, name: &str, span: Range<usize>) -> Result<Value, CodegenError> {
        let (index, port) = self
            .ports
            .iter()
            .enumerate()
            .find(|(_, port)| &*port.name == name)
            .ok_or_else(|| CodegenError::UnknownName {
                name: name.to_string(),
                pos: SourcePos::span(span.clone()),
            })?;

        if port.direction == PortDirection::Output {
            return self.assigned.get(name).cloned().ok_or_else(|| {
                CodegenError::OutputReadBeforeWrite {
                    name: name.to_string(),
                    pos: SourcePos::span(span),
                }
            });
        }

        if let Some(value) = self.loaded.get(name) {
            return Ok(value.clone());
        }
        let address = Address::port(index as u16);
        let value = match port.kind {
            ValueKind::Midi => Value::Midi(address),
            _ => Value::Num(self.method.load(address)),
        };
        self.loaded.insert(name.to_string(), value.clone());
        Ok(value)
    }

    /// Fits a value to an output control. Tuples assigned to a numeric
    /// output are mixed down.
    fn coerce(&mut self, kind: &ValueKind, value: Value, span: Range<usize>) -> Result<Value, CodegenError> {
        match (kind, value) {
            (ValueKind::Num, value @ Value::Num(_)) | (ValueKind::Midi, value @ Value::Midi(_)) => {
                Ok(value)
            }
            (ValueKind::Num, value @ Value::Tuple(_)) => Function::Mixdown
                .generate(&mut self.method, Vec::new(), Some(vec![value]))
                .map_err(|e| e.with_span(span)),
            (expected, value) => Err(CodegenError::KindMismatch {
                expected: expected.clone(),
                found: value.kind(),
                pos: SourcePos::span(span),
            }),
        }
    }
}
