use std::fmt;

use super::ir::{Address, Reg};

/// Kind of a value flowing through the graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Num,
    Midi,
    Tuple(Vec<ValueKind>),
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Num => f.write_str("num"),
            ValueKind::Midi => f.write_str("midi"),
            ValueKind::Tuple(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
        }
    }
}

/// A value during code generation. Numbers live in registers, MIDI queues
/// stay in storage and are passed by address.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Num(Reg),
    Midi(Address),
    Tuple(Vec<Value>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Num(_) => ValueKind::Num,
            Value::Midi(_) => ValueKind::Midi,
            Value::Tuple(items) => ValueKind::Tuple(items.iter().map(Value::kind).collect()),
        }
    }

    /// Flattens nested tuples, left to right.
    pub fn flatten(self, out: &mut Vec<Value>) {
        match self {
            Value::Tuple(items) => {
                for item in items {
                    item.flatten(out);
                }
            }
            other => out.push(other),
        }
    }

    pub fn map_regs(&self, f: &impl Fn(Reg) -> Reg, g: &impl Fn(Address) -> Address) -> Value {
        match self {
            Value::Num(reg) => Value::Num(f(*reg)),
            Value::Midi(addr) => Value::Midi(g(*addr)),
            Value::Tuple(items) => Value::Tuple(items.iter().map(|v| v.map_regs(f, g)).collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_nests_tuples() {
        let kind = ValueKind::Tuple(vec![ValueKind::Num, ValueKind::Tuple(vec![ValueKind::Midi])]);
        assert_eq!(kind.to_string(), "[num, [midi]]");
    }

    #[test]
    fn flatten_is_left_to_right() {
        let value = Value::Tuple(vec![
            Value::Num(Reg(0)),
            Value::Tuple(vec![Value::Num(Reg(1)), Value::Num(Reg(2))]),
            Value::Num(Reg(3)),
        ]);
        let mut flat = Vec::new();
        value.flatten(&mut flat);
        let regs: Vec<_> = flat
            .into_iter()
            .map(|v| match v {
                Value::Num(r) => r.0,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(regs, vec![0, 1, 2, 3]);
    }
}
