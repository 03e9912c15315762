//! Straight-line intermediate representation for node and surface code.
//!
//! A fragment never knows absolute storage offsets. Nodes address their
//! ports and state symbolically through [`Base`]; the surface binds those
//! bases to storage offsets when it inlines the fragment into its class.

use std::fmt;

use super::value::Value;

/// Virtual register holding one `f32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u32);

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// What an [`Address`] is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Base {
    /// The storage pointer the method was called with.
    Storage,
    /// The i-th state field of the node that emitted the fragment.
    State(u16),
    /// The connection group slot of the node's i-th port.
    Port(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub base: Base,
    pub offset: u32,
}

impl Address {
    pub const fn storage(offset: u32) -> Self {
        Self {
            base: Base::Storage,
            offset,
        }
    }

    pub const fn state(field: u16) -> Self {
        Self {
            base: Base::State(field),
            offset: 0,
        }
    }

    pub const fn port(port: u16) -> Self {
        Self {
            base: Base::Port(port),
            offset: 0,
        }
    }

    pub const fn at(self, offset: u32) -> Self {
        Self {
            base: self.base,
            offset: self.offset + offset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Abs,
    Floor,
    Sqrt,
    /// Round to nearest, ties to even.
    Nearest,
}

impl UnaryOp {
    pub fn eval(self, x: f32) -> f32 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Abs => x.abs(),
            UnaryOp::Floor => x.floor(),
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Nearest => x.round_ties_even(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
}

impl BinaryOp {
    pub fn eval(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Min => a.min(b),
            BinaryOp::Max => a.max(b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compare {
    Less,
    Greater,
    LessEq,
    GreaterEq,
    Equal,
    NotEqual,
}

impl Compare {
    pub fn eval(self, a: f32, b: f32) -> bool {
        match self {
            Compare::Less => a < b,
            Compare::Greater => a > b,
            Compare::LessEq => a <= b,
            Compare::GreaterEq => a >= b,
            Compare::Equal => a == b,
            Compare::NotEqual => a != b,
        }
    }
}

/// Functions of the common support module callable from fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Helper {
    /// `fn(f32) -> f32`
    Sin,
    /// `fn(f32) -> f32`
    Exp2,
    /// `fn(queue)`
    MidiClear,
    /// `fn(dst queue, src queue)`, appends `src` to `dst`.
    MidiMerge,
    /// `fn(queue, tracker state)`
    MidiTrackNote,
}

impl Helper {
    pub fn symbol(self) -> &'static str {
        match self {
            Helper::Sin => "sin",
            Helper::Exp2 => "exp2",
            Helper::MidiClear => "midi_clear",
            Helper::MidiMerge => "midi_merge",
            Helper::MidiTrackNote => "midi_track_note",
        }
    }

    /// Pure helpers only read their arguments and may be folded or removed.
    pub fn is_pure(self) -> bool {
        matches!(self, Helper::Sin | Helper::Exp2)
    }

    pub fn returns_num(self) -> bool {
        self.is_pure()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg {
    Num(Reg),
    Addr(Address),
}

/// Identity of a generated surface class inside one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Constructor,
    Generate,
    Destructor,
}

impl Method {
    pub const ALL: [Method; 3] = [Method::Constructor, Method::Generate, Method::Destructor];

    pub fn name(self) -> &'static str {
        match self {
            Method::Constructor => "constructor",
            Method::Generate => "generate",
            Method::Destructor => "destructor",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    Const {
        dst: Reg,
        value: f32,
    },
    Unary {
        dst: Reg,
        op: UnaryOp,
        arg: Reg,
    },
    Binary {
        dst: Reg,
        op: BinaryOp,
        lhs: Reg,
        rhs: Reg,
    },
    /// Produces 1.0 when the comparison holds and 0.0 otherwise.
    Compare {
        dst: Reg,
        cond: Compare,
        lhs: Reg,
        rhs: Reg,
    },
    /// `cond != 0 ? if_true : if_false`
    Select {
        dst: Reg,
        cond: Reg,
        if_true: Reg,
        if_false: Reg,
    },
    Load {
        dst: Reg,
        addr: Address,
    },
    Store {
        addr: Address,
        src: Reg,
    },
    Call {
        dst: Option<Reg>,
        helper: Helper,
        args: Vec<Arg>,
    },
    CallClass {
        class: ClassId,
        method: Method,
        addr: Address,
    },
}

impl Inst {
    pub fn dst(&self) -> Option<Reg> {
        match self {
            Inst::Const { dst, .. }
            | Inst::Unary { dst, .. }
            | Inst::Binary { dst, .. }
            | Inst::Compare { dst, .. }
            | Inst::Select { dst, .. }
            | Inst::Load { dst, .. } => Some(*dst),
            Inst::Call { dst, .. } => *dst,
            Inst::Store { .. } | Inst::CallClass { .. } => None,
        }
    }

    pub fn uses(&self) -> Vec<Reg> {
        match self {
            Inst::Const { .. } | Inst::Load { .. } | Inst::CallClass { .. } => Vec::new(),
            Inst::Unary { arg, .. } => vec![*arg],
            Inst::Binary { lhs, rhs, .. } | Inst::Compare { lhs, rhs, .. } => vec![*lhs, *rhs],
            Inst::Select {
                cond,
                if_true,
                if_false,
                ..
            } => vec![*cond, *if_true, *if_false],
            Inst::Store { src, .. } => vec![*src],
            Inst::Call { args, .. } => args
                .iter()
                .filter_map(|arg| match arg {
                    Arg::Num(reg) => Some(*reg),
                    Arg::Addr(_) => None,
                })
                .collect(),
        }
    }

    /// Instructions that write memory or call out cannot be removed even
    /// when their result is unused.
    pub fn has_side_effects(&self) -> bool {
        match self {
            Inst::Store { .. } | Inst::CallClass { .. } => true,
            Inst::Call { helper, .. } => !helper.is_pure(),
            _ => false,
        }
    }

    fn remap(&self, reg: &impl Fn(Reg) -> Reg, addr: &impl Fn(Address) -> Address) -> Inst {
        match self {
            Inst::Const { dst, value } => Inst::Const {
                dst: reg(*dst),
                value: *value,
            },
            Inst::Unary { dst, op, arg } => Inst::Unary {
                dst: reg(*dst),
                op: *op,
                arg: reg(*arg),
            },
            Inst::Binary { dst, op, lhs, rhs } => Inst::Binary {
                dst: reg(*dst),
                op: *op,
                lhs: reg(*lhs),
                rhs: reg(*rhs),
            },
            Inst::Compare {
                dst,
                cond,
                lhs,
                rhs,
            } => Inst::Compare {
                dst: reg(*dst),
                cond: *cond,
                lhs: reg(*lhs),
                rhs: reg(*rhs),
            },
            Inst::Select {
                dst,
                cond,
                if_true,
                if_false,
            } => Inst::Select {
                dst: reg(*dst),
                cond: reg(*cond),
                if_true: reg(*if_true),
                if_false: reg(*if_false),
            },
            Inst::Load { dst, addr: a } => Inst::Load {
                dst: reg(*dst),
                addr: addr(*a),
            },
            Inst::Store { addr: a, src } => Inst::Store {
                addr: addr(*a),
                src: reg(*src),
            },
            Inst::Call { dst, helper, args } => Inst::Call {
                dst: dst.map(reg),
                helper: *helper,
                args: args
                    .iter()
                    .map(|arg| match arg {
                        Arg::Num(r) => Arg::Num(reg(*r)),
                        Arg::Addr(a) => Arg::Addr(addr(*a)),
                    })
                    .collect(),
            },
            Inst::CallClass {
                class,
                method,
                addr: a,
            } => Inst::CallClass {
                class: *class,
                method: *method,
                addr: addr(*a),
            },
        }
    }
}

/// A straight-line instruction sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    pub insts: Vec<Inst>,
    /// One past the highest register number in use.
    pub next_reg: u32,
}

impl Fragment {
    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// Checks that every register is defined exactly once before use.
    pub fn validate(&self) -> Result<(), String> {
        let mut defined = vec![false; self.next_reg as usize];
        for (i, inst) in self.insts.iter().enumerate() {
            for reg in inst.uses() {
                if !defined.get(reg.0 as usize).copied().unwrap_or(false) {
                    return Err(format!("instruction {} uses undefined register {}", i, reg));
                }
            }
            if let Some(dst) = inst.dst() {
                match defined.get_mut(dst.0 as usize) {
                    Some(slot) if !*slot => *slot = true,
                    Some(_) => return Err(format!("register {} defined twice", dst)),
                    None => return Err(format!("register {} out of range", dst)),
                }
            }
        }
        Ok(())
    }
}

/// Builds one method body. Handed to [`super::function::Function::generate`]
/// and to every node code generator.
#[derive(Debug)]
pub struct MethodBuilder {
    fragment: Fragment,
    sample_rate: f32,
}

impl MethodBuilder {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            fragment: Fragment::default(),
            sample_rate,
        }
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn fresh(&mut self) -> Reg {
        let reg = Reg(self.fragment.next_reg);
        self.fragment.next_reg += 1;
        reg
    }

    pub fn constant(&mut self, value: f32) -> Reg {
        let dst = self.fresh();
        self.fragment.insts.push(Inst::Const { dst, value });
        dst
    }

    pub fn unary(&mut self, op: UnaryOp, arg: Reg) -> Reg {
        let dst = self.fresh();
        self.fragment.insts.push(Inst::Unary { dst, op, arg });
        dst
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: Reg, rhs: Reg) -> Reg {
        let dst = self.fresh();
        self.fragment.insts.push(Inst::Binary { dst, op, lhs, rhs });
        dst
    }

    pub fn compare(&mut self, cond: Compare, lhs: Reg, rhs: Reg) -> Reg {
        let dst = self.fresh();
        self.fragment.insts.push(Inst::Compare {
            dst,
            cond,
            lhs,
            rhs,
        });
        dst
    }

    pub fn select(&mut self, cond: Reg, if_true: Reg, if_false: Reg) -> Reg {
        let dst = self.fresh();
        self.fragment.insts.push(Inst::Select {
            dst,
            cond,
            if_true,
            if_false,
        });
        dst
    }

    pub fn load(&mut self, addr: Address) -> Reg {
        let dst = self.fresh();
        self.fragment.insts.push(Inst::Load { dst, addr });
        dst
    }

    pub fn store(&mut self, addr: Address, src: Reg) {
        self.fragment.insts.push(Inst::Store { addr, src });
    }

    /// Calls a helper returning a number.
    pub fn call(&mut self, helper: Helper, args: Vec<Arg>) -> Reg {
        let dst = self.fresh();
        self.fragment.insts.push(Inst::Call {
            dst: Some(dst),
            helper,
            args,
        });
        dst
    }

    pub fn call_void(&mut self, helper: Helper, args: Vec<Arg>) {
        self.fragment.insts.push(Inst::Call {
            dst: None,
            helper,
            args,
        });
    }

    pub fn call_class(&mut self, class: ClassId, method: Method, addr: Address) {
        self.fragment
            .insts
            .push(Inst::CallClass { class, method, addr });
    }

    /// Appends `fragment`, renumbering its registers past the ones in use and
    /// rebasing every address through `bind`. Returns the mapping so values
    /// produced by the fragment can be translated too.
    pub fn inline<B>(&mut self, fragment: &Fragment, bind: B) -> Inlined<B>
    where
        B: Fn(Base) -> Address,
    {
        let inlined = Inlined {
            reg_offset: self.fragment.next_reg,
            bind,
        };
        self.fragment.insts.extend(
            fragment
                .insts
                .iter()
                .map(|inst| inst.remap(&|r| inlined.reg(r), &|a| inlined.addr(a))),
        );
        self.fragment.next_reg += fragment.next_reg;
        inlined
    }

    pub fn finish(self) -> Fragment {
        self.fragment
    }
}

/// Register and address translation of one inlined fragment.
pub struct Inlined<B> {
    reg_offset: u32,
    bind: B,
}

impl<B: Fn(Base) -> Address> Inlined<B> {
    pub fn reg(&self, reg: Reg) -> Reg {
        Reg(reg.0 + self.reg_offset)
    }

    pub fn addr(&self, addr: Address) -> Address {
        (self.bind)(addr.base).at(addr.offset)
    }

    pub fn value(&self, value: &Value) -> Value {
        value.map_regs(&|r| self.reg(r), &|a| self.addr(a))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_renumbers_and_rebases() {
        let mut node = MethodBuilder::new(44100.0);
        let x = node.load(Address::port(0));
        let y = node.binary(BinaryOp::Mul, x, x);
        node.store(Address::state(1).at(4), y);
        let node = node.finish();

        let mut surface = MethodBuilder::new(44100.0);
        surface.constant(1.0);
        let inlined = surface.inline(&node, |base| match base {
            Base::Port(i) => Address::storage(100 + 4 * i as u32),
            Base::State(i) => Address::storage(200 + 8 * i as u32),
            Base::Storage => Address::storage(0),
        });
        assert_eq!(inlined.reg(y), Reg(2));
        let fragment = surface.finish();
        assert_eq!(fragment.next_reg, 3);
        assert_eq!(
            fragment.insts[1],
            Inst::Load {
                dst: Reg(1),
                addr: Address::storage(100)
            }
        );
        assert_eq!(
            fragment.insts[3],
            Inst::Store {
                addr: Address::storage(212),
                src: Reg(2)
            }
        );
        assert!(fragment.validate().is_ok());
    }

    #[test]
    fn validate_rejects_use_before_definition() {
        let fragment = Fragment {
            insts: vec![Inst::Unary {
                dst: Reg(1),
                op: UnaryOp::Neg,
                arg: Reg(0),
            }],
            next_reg: 2,
        };
        assert!(fragment.validate().is_err());
    }
}
