use std::f32::consts::FRAC_PI_2;

use super::ir::{Address, Arg, BinaryOp, Compare, Helper, MethodBuilder, Reg, UnaryOp};
use super::value::{Value, ValueKind};
use crate::error::{CodegenError, SourcePos};

/// The closed set of operations available to node code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Less,
    Greater,
    LessEq,
    GreaterEq,
    Equal,
    NotEqual,
    Min,
    Max,
    Clamp,
    Abs,
    Floor,
    Sqrt,
    Sin,
    Cos,
    Exp2,
    NoteToFreq,
    Mix,
    Select,
    Mixdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<ValueKind>,
    pub variadic: Option<ValueKind>,
}

impl Function {
    /// Looks up a function by the name it has in node code. Operators are not
    /// callable by name.
    pub fn from_name(name: &str) -> Option<Function> {
        Some(match name {
            "min" => Function::Min,
            "max" => Function::Max,
            "clamp" => Function::Clamp,
            "abs" => Function::Abs,
            "floor" => Function::Floor,
            "sqrt" => Function::Sqrt,
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "exp2" => Function::Exp2,
            "noteFreq" => Function::NoteToFreq,
            "mix" => Function::Mix,
            "select" => Function::Select,
            "mixdown" => Function::Mixdown,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Function::Add => "+",
            Function::Sub => "-",
            Function::Mul => "*",
            Function::Div => "/",
            Function::Mod => "%",
            Function::Neg => "negate",
            Function::Less => "<",
            Function::Greater => ">",
            Function::LessEq => "<=",
            Function::GreaterEq => ">=",
            Function::Equal => "==",
            Function::NotEqual => "!=",
            Function::Min => "min",
            Function::Max => "max",
            Function::Clamp => "clamp",
            Function::Abs => "abs",
            Function::Floor => "floor",
            Function::Sqrt => "sqrt",
            Function::Sin => "sin",
            Function::Cos => "cos",
            Function::Exp2 => "exp2",
            Function::NoteToFreq => "noteFreq",
            Function::Mix => "mix",
            Function::Select => "select",
            Function::Mixdown => "mixdown",
        }
    }

    pub fn signature(self) -> Signature {
        let arity = match self {
            Function::Mixdown => 0,
            Function::Neg
            | Function::Abs
            | Function::Floor
            | Function::Sqrt
            | Function::Sin
            | Function::Cos
            | Function::Exp2
            | Function::NoteToFreq => 1,
            Function::Clamp | Function::Mix | Function::Select => 3,
            _ => 2,
        };
        Signature {
            params: vec![ValueKind::Num; arity],
            variadic: (self == Function::Mixdown).then_some(ValueKind::Num),
        }
    }

    pub fn generate(
        self,
        method: &mut MethodBuilder,
        params: Vec<Value>,
        vararg: Option<Vec<Value>>,
    ) -> Result<Value, CodegenError> {
        let signature = self.signature();
        let extra = vararg.as_ref().map_or(0, Vec::len);
        if params.len() != signature.params.len() || (signature.variadic.is_none() && extra > 0) {
            return Err(CodegenError::Arity {
                function: self.name(),
                expected: signature.params.len(),
                found: params.len() + extra,
                pos: SourcePos::default(),
            });
        }

        match self {
            Function::Mixdown => mixdown(method, vararg.unwrap_or_default()),
            _ => self.broadcast(method, &params),
        }
    }

    /// Applies a numeric function element-wise over tuple operands.
    fn broadcast(self, method: &mut MethodBuilder, params: &[Value]) -> Result<Value, CodegenError> {
        let mut width = None;
        for param in params {
            match param {
                Value::Num(_) => {}
                Value::Midi(_) => {
                    return Err(CodegenError::KindMismatch {
                        expected: ValueKind::Num,
                        found: ValueKind::Midi,
                        pos: SourcePos::default(),
                    })
                }
                Value::Tuple(items) => match width {
                    None => width = Some(items.len()),
                    Some(w) if w == items.len() => {}
                    Some(w) => {
                        return Err(CodegenError::KindMismatch {
                            expected: ValueKind::Tuple(vec![ValueKind::Num; w]),
                            found: param.kind(),
                            pos: SourcePos::default(),
                        })
                    }
                },
            }
        }

        match width {
            None => {
                let regs: Vec<Reg> = params
                    .iter()
                    .filter_map(|p| match p {
                        Value::Num(reg) => Some(*reg),
                        _ => None,
                    })
                    .collect();
                Ok(Value::Num(self.scalar(method, &regs)))
            }
            Some(width) => {
                let mut items = Vec::with_capacity(width);
                for i in 0..width {
                    let element: Vec<Value> = params
                        .iter()
                        .map(|p| match p {
                            Value::Tuple(items) => items[i].clone(),
                            other => other.clone(),
                        })
                        .collect();
                    items.push(self.broadcast(method, &element)?);
                }
                Ok(Value::Tuple(items))
            }
        }
    }

    fn scalar(self, method: &mut MethodBuilder, args: &[Reg]) -> Reg {
        let a = args[0];
        match self {
            Function::Add => method.binary(BinaryOp::Add, a, args[1]),
            Function::Sub => method.binary(BinaryOp::Sub, a, args[1]),
            Function::Mul => method.binary(BinaryOp::Mul, a, args[1]),
            Function::Div => method.binary(BinaryOp::Div, a, args[1]),
            Function::Mod => {
                // Floored modulo, the result takes the sign of the divisor.
                let b = args[1];
                let quotient = method.binary(BinaryOp::Div, a, b);
                let whole = method.unary(UnaryOp::Floor, quotient);
                let scaled = method.binary(BinaryOp::Mul, b, whole);
                method.binary(BinaryOp::Sub, a, scaled)
            }
            Function::Neg => method.unary(UnaryOp::Neg, a),
            Function::Less => method.compare(Compare::Less, a, args[1]),
            Function::Greater => method.compare(Compare::Greater, a, args[1]),
            Function::LessEq => method.compare(Compare::LessEq, a, args[1]),
            Function::GreaterEq => method.compare(Compare::GreaterEq, a, args[1]),
            Function::Equal => method.compare(Compare::Equal, a, args[1]),
            Function::NotEqual => method.compare(Compare::NotEqual, a, args[1]),
            Function::Min => method.binary(BinaryOp::Min, a, args[1]),
            Function::Max => method.binary(BinaryOp::Max, a, args[1]),
            Function::Clamp => {
                let upper = method.binary(BinaryOp::Min, a, args[2]);
                method.binary(BinaryOp::Max, upper, args[1])
            }
            Function::Abs => method.unary(UnaryOp::Abs, a),
            Function::Floor => method.unary(UnaryOp::Floor, a),
            Function::Sqrt => method.unary(UnaryOp::Sqrt, a),
            Function::Sin => method.call(Helper::Sin, vec![Arg::Num(a)]),
            Function::Cos => {
                let quarter = method.constant(FRAC_PI_2);
                let shifted = method.binary(BinaryOp::Add, a, quarter);
                method.call(Helper::Sin, vec![Arg::Num(shifted)])
            }
            Function::Exp2 => method.call(Helper::Exp2, vec![Arg::Num(a)]),
            Function::NoteToFreq => {
                let a4 = method.constant(69.0);
                let semitones = method.binary(BinaryOp::Sub, a, a4);
                let twelfth = method.constant(1.0 / 12.0);
                let octaves = method.binary(BinaryOp::Mul, semitones, twelfth);
                let ratio = method.call(Helper::Exp2, vec![Arg::Num(octaves)]);
                let pitch = method.constant(440.0);
                method.binary(BinaryOp::Mul, ratio, pitch)
            }
            Function::Mix => {
                let span = method.binary(BinaryOp::Sub, args[1], a);
                let scaled = method.binary(BinaryOp::Mul, span, args[2]);
                method.binary(BinaryOp::Add, a, scaled)
            }
            Function::Select => method.select(a, args[1], args[2]),
            // handled by `generate`
            Function::Mixdown => a,
        }
    }
}

/// Sums numeric inputs left to right, flattening tuples. No inputs gives 0.
fn mixdown(method: &mut MethodBuilder, inputs: Vec<Value>) -> Result<Value, CodegenError> {
    let mut flat = Vec::new();
    for input in inputs {
        input.flatten(&mut flat);
    }

    let mut sum = None;
    for value in flat {
        let reg = match value {
            Value::Num(reg) => reg,
            other => {
                return Err(CodegenError::KindMismatch {
                    expected: ValueKind::Num,
                    found: other.kind(),
                    pos: SourcePos::default(),
                })
            }
        };
        sum = Some(match sum {
            None => reg,
            Some(acc) => method.binary(BinaryOp::Add, acc, reg),
        });
    }
    Ok(Value::Num(sum.unwrap_or_else(|| method.constant(0.0))))
}

/// Writes the mixdown of `sources` into the slot at `dst`. MIDI slots are
/// cleared and then receive every source queue in order.
pub fn mixdown_into(
    method: &mut MethodBuilder,
    kind: &ValueKind,
    dst: Address,
    sources: Vec<Value>,
) -> Result<(), CodegenError> {
    match kind {
        ValueKind::Midi => {
            method.call_void(Helper::MidiClear, vec![Arg::Addr(dst)]);
            for source in sources {
                match source {
                    Value::Midi(src) => {
                        method.call_void(Helper::MidiMerge, vec![Arg::Addr(dst), Arg::Addr(src)])
                    }
                    other => {
                        return Err(CodegenError::KindMismatch {
                            expected: ValueKind::Midi,
                            found: other.kind(),
                            pos: SourcePos::default(),
                        })
                    }
                }
            }
            Ok(())
        }
        _ => match Function::Mixdown.generate(method, Vec::new(), Some(sources))? {
            Value::Num(sum) => {
                method.store(dst, sum);
                Ok(())
            }
            other => Err(CodegenError::KindMismatch {
                expected: ValueKind::Num,
                found: other.kind(),
                pos: SourcePos::default(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::ir::Inst;

    fn num(method: &mut MethodBuilder, value: f32) -> Value {
        Value::Num(method.constant(value))
    }

    #[test]
    fn arity_is_checked() {
        let mut method = MethodBuilder::new(44100.0);
        let a = num(&mut method, 1.0);
        let err = Function::Add.generate(&mut method, vec![a], None).unwrap_err();
        assert!(matches!(
            err,
            CodegenError::Arity {
                function: "+",
                expected: 2,
                found: 1,
                ..
            }
        ));
    }

    #[test]
    fn midi_is_not_a_number() {
        let mut method = MethodBuilder::new(44100.0);
        let err = Function::Abs
            .generate(&mut method, vec![Value::Midi(Address::port(0))], None)
            .unwrap_err();
        assert!(matches!(err, CodegenError::KindMismatch { .. }));
    }

    #[test]
    fn broadcasts_scalars_over_tuples() {
        let mut method = MethodBuilder::new(44100.0);
        let a = num(&mut method, 1.0);
        let b = num(&mut method, 2.0);
        let s = num(&mut method, 10.0);
        let result = Function::Mul
            .generate(&mut method, vec![Value::Tuple(vec![a, b]), s], None)
            .unwrap();
        assert_eq!(result.kind(), ValueKind::Tuple(vec![ValueKind::Num, ValueKind::Num]));
    }

    #[test]
    fn mismatched_tuple_widths_fail() {
        let mut method = MethodBuilder::new(44100.0);
        let a = num(&mut method, 1.0);
        let err = Function::Add
            .generate(
                &mut method,
                vec![Value::Tuple(vec![a.clone()]), Value::Tuple(vec![a.clone(), a])],
                None,
            )
            .unwrap_err();
        assert!(matches!(err, CodegenError::KindMismatch { .. }));
    }

    #[test]
    fn mixdown_of_nothing_is_zero() {
        let mut method = MethodBuilder::new(44100.0);
        let result = Function::Mixdown
            .generate(&mut method, Vec::new(), Some(Vec::new()))
            .unwrap();
        let fragment = method.finish();
        assert_eq!(result, Value::Num(Reg(0)));
        assert_eq!(
            fragment.insts,
            vec![Inst::Const {
                dst: Reg(0),
                value: 0.0
            }]
        );
    }

    #[test]
    fn mixdown_sums_left_to_right() {
        let mut method = MethodBuilder::new(44100.0);
        let a = num(&mut method, 1.0);
        let b = num(&mut method, 2.0);
        let c = num(&mut method, 3.0);
        Function::Mixdown
            .generate(&mut method, Vec::new(), Some(vec![a, Value::Tuple(vec![b, c])]))
            .unwrap();
        let fragment = method.finish();
        let adds: Vec<_> = fragment
            .insts
            .iter()
            .filter_map(|inst| match inst {
                Inst::Binary {
                    op: BinaryOp::Add,
                    lhs,
                    rhs,
                    ..
                } => Some((lhs.0, rhs.0)),
                _ => None,
            })
            .collect();
        assert_eq!(adds, vec![(0, 1), (3, 2)]);
    }

    #[test]
    fn midi_mixdown_clears_then_merges() {
        let mut method = MethodBuilder::new(44100.0);
        let dst = Address::storage(0);
        let sources = vec![
            Value::Midi(Address::storage(132)),
            Value::Midi(Address::storage(264)),
        ];
        mixdown_into(&mut method, &ValueKind::Midi, dst, sources).unwrap();
        let helpers: Vec<_> = method
            .finish()
            .insts
            .into_iter()
            .filter_map(|inst| match inst {
                Inst::Call { helper, .. } => Some(helper),
                _ => None,
            })
            .collect();
        assert_eq!(
            helpers,
            vec![Helper::MidiClear, Helper::MidiMerge, Helper::MidiMerge]
        );
    }
}
