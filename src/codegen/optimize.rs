//! IR passes run on every class method before lowering. The JIT and the
//! exporter both go through [`optimize`], so exported instruments compute
//! the same samples as the live runtime.

use std::collections::HashMap;

use super::ir::{Address, Arg, BinaryOp, Fragment, Helper, Inst, Reg};
use crate::config::FloatMode;

pub fn optimize(fragment: &Fragment, mode: FloatMode) -> Fragment {
    let folded = fold(fragment, mode);
    eliminate_dead_code(&folded)
}

enum Folded {
    Keep(Inst),
    Const(f32),
    Alias(Reg),
}

/// Constant folding and load forwarding plus, in [`FloatMode::Fast`],
/// algebraic identities.
fn fold(fragment: &Fragment, mode: FloatMode) -> Fragment {
    let mut consts: HashMap<Reg, f32> = HashMap::new();
    let mut aliases: HashMap<Reg, Reg> = HashMap::new();
    // slots whose current value is held in a register
    let mut memory: HashMap<Address, Reg> = HashMap::new();
    let mut insts = Vec::with_capacity(fragment.insts.len());

    for inst in &fragment.insts {
        let inst = substitute(inst, &aliases);
        let constant = |reg: &Reg| consts.get(reg).copied();

        let folded = match &inst {
            Inst::Const { value, .. } => Folded::Const(*value),
            Inst::Load { addr, .. } => match memory.get(addr) {
                Some(reg) => Folded::Alias(*reg),
                None => Folded::Keep(inst.clone()),
            },
            Inst::Unary { op, arg, .. } => match constant(arg) {
                Some(x) => Folded::Const(op.eval(x)),
                None => Folded::Keep(inst.clone()),
            },
            Inst::Binary { op, lhs, rhs, .. } => match (constant(lhs), constant(rhs)) {
                (Some(a), Some(b)) => Folded::Const(op.eval(a, b)),
                (a, b) if mode == FloatMode::Fast => simplify(*op, *lhs, a, *rhs, b)
                    .unwrap_or_else(|| Folded::Keep(inst.clone())),
                _ => Folded::Keep(inst.clone()),
            },
            Inst::Compare { cond, lhs, rhs, .. } => match (constant(lhs), constant(rhs)) {
                (Some(a), Some(b)) => Folded::Const(if cond.eval(a, b) { 1.0 } else { 0.0 }),
                _ => Folded::Keep(inst.clone()),
            },
            Inst::Select {
                cond,
                if_true,
                if_false,
                ..
            } => match constant(cond) {
                Some(c) if c != 0.0 => Folded::Alias(*if_true),
                Some(_) => Folded::Alias(*if_false),
                None if if_true == if_false => Folded::Alias(*if_true),
                None => Folded::Keep(inst.clone()),
            },
            Inst::Call {
                dst: Some(_),
                helper,
                args,
            } if helper.is_pure() => match args.as_slice() {
                [Arg::Num(x)] => match (helper, constant(x)) {
                    (Helper::Sin, Some(x)) => Folded::Const(x.sin()),
                    (Helper::Exp2, Some(x)) => Folded::Const(x.exp2()),
                    _ => Folded::Keep(inst.clone()),
                },
                _ => Folded::Keep(inst.clone()),
            },
            _ => Folded::Keep(inst.clone()),
        };

        remember(&mut memory, &inst, &folded);

        match (folded, inst.dst()) {
            (Folded::Const(value), Some(dst)) => {
                consts.insert(dst, value);
                insts.push(Inst::Const { dst, value });
            }
            (Folded::Alias(src), Some(dst)) => {
                if let Some(value) = consts.get(&src).copied() {
                    consts.insert(dst, value);
                }
                aliases.insert(dst, src);
            }
            (Folded::Keep(inst), _) => insts.push(inst),
            (_, None) => insts.push(inst),
        }
    }

    Fragment {
        insts,
        next_reg: fragment.next_reg,
    }
}

fn remember(memory: &mut HashMap<Address, Reg>, inst: &Inst, folded: &Folded) {
    match inst {
        Inst::Load { dst, addr } => {
            if matches!(folded, Folded::Keep(_)) {
                memory.insert(*addr, *dst);
            }
        }
        Inst::Store { addr, src } => {
            memory.retain(|known, _| !overlaps(known, addr));
            memory.insert(*addr, *src);
        }
        // helpers taking an address may write through it
        Inst::Call { args, .. } => {
            if args.iter().any(|arg| matches!(arg, Arg::Addr(_))) {
                memory.clear();
            }
        }
        Inst::CallClass { .. } => memory.clear(),
        _ => {}
    }
}

/// Addresses with different bases may alias until they are bound.
fn overlaps(a: &Address, b: &Address) -> bool {
    a.base != b.base || a.offset.abs_diff(b.offset) < 4
}

fn simplify(op: BinaryOp, lhs: Reg, a: Option<f32>, rhs: Reg, b: Option<f32>) -> Option<Folded> {
    match (op, a, b) {
        (BinaryOp::Add, Some(x), _) if x == 0.0 => Some(Folded::Alias(rhs)),
        (BinaryOp::Add, _, Some(x)) if x == 0.0 => Some(Folded::Alias(lhs)),
        (BinaryOp::Sub, _, Some(x)) if x == 0.0 => Some(Folded::Alias(lhs)),
        (BinaryOp::Mul, Some(x), _) if x == 1.0 => Some(Folded::Alias(rhs)),
        (BinaryOp::Mul, _, Some(x)) if x == 1.0 => Some(Folded::Alias(lhs)),
        (BinaryOp::Mul, Some(x), _) | (BinaryOp::Mul, _, Some(x)) if x == 0.0 => {
            Some(Folded::Const(0.0))
        }
        (BinaryOp::Div, _, Some(x)) if x == 1.0 => Some(Folded::Alias(lhs)),
        _ => None,
    }
}

fn substitute(inst: &Inst, aliases: &HashMap<Reg, Reg>) -> Inst {
    if aliases.is_empty() {
        return inst.clone();
    }
    let resolve = |reg: Reg| {
        let mut reg = reg;
        while let Some(next) = aliases.get(&reg) {
            reg = *next;
        }
        reg
    };
    let mut inst = inst.clone();
    match &mut inst {
        Inst::Const { .. } | Inst::Load { .. } | Inst::CallClass { .. } => {}
        Inst::Unary { arg, .. } => *arg = resolve(*arg),
        Inst::Binary { lhs, rhs, .. } | Inst::Compare { lhs, rhs, .. } => {
            *lhs = resolve(*lhs);
            *rhs = resolve(*rhs);
        }
        Inst::Select {
            cond,
            if_true,
            if_false,
            ..
        } => {
            *cond = resolve(*cond);
            *if_true = resolve(*if_true);
            *if_false = resolve(*if_false);
        }
        Inst::Store { src, .. } => *src = resolve(*src),
        Inst::Call { args, .. } => {
            for arg in args.iter_mut() {
                if let Arg::Num(reg) = arg {
                    *reg = resolve(*reg);
                }
            }
        }
    }
    inst
}

fn eliminate_dead_code(fragment: &Fragment) -> Fragment {
    let mut live = vec![false; fragment.next_reg as usize];
    let mut keep = vec![false; fragment.insts.len()];

    for (i, inst) in fragment.insts.iter().enumerate().rev() {
        let needed = inst.has_side_effects()
            || inst
                .dst()
                .is_some_and(|dst| live.get(dst.0 as usize).copied().unwrap_or(false));
        if needed {
            keep[i] = true;
            for reg in inst.uses() {
                if let Some(slot) = live.get_mut(reg.0 as usize) {
                    *slot = true;
                }
            }
        }
    }

    Fragment {
        insts: fragment
            .insts
            .iter()
            .zip(keep)
            .filter_map(|(inst, keep)| keep.then(|| inst.clone()))
            .collect(),
        next_reg: fragment.next_reg,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::ir::{Address, MethodBuilder};

    #[test]
    fn folds_constant_arithmetic() {
        let mut method = MethodBuilder::new(44100.0);
        let a = method.constant(2.0);
        let b = method.constant(3.0);
        let sum = method.binary(BinaryOp::Mul, a, b);
        method.store(Address::storage(0), sum);
        let fragment = optimize(&method.finish(), FloatMode::Strict);
        assert_eq!(
            fragment.insts,
            vec![
                Inst::Const {
                    dst: Reg(2),
                    value: 6.0
                },
                Inst::Store {
                    addr: Address::storage(0),
                    src: Reg(2)
                },
            ]
        );
    }

    #[test]
    fn fast_mode_drops_identities() {
        let mut method = MethodBuilder::new(44100.0);
        let x = method.load(Address::storage(4));
        let one = method.constant(1.0);
        let zero = method.constant(0.0);
        let scaled = method.binary(BinaryOp::Mul, x, one);
        let shifted = method.binary(BinaryOp::Add, scaled, zero);
        method.store(Address::storage(0), shifted);
        let fragment = method.finish();

        let fast = optimize(&fragment, FloatMode::Fast);
        assert_eq!(
            fast.insts,
            vec![
                Inst::Load {
                    dst: x,
                    addr: Address::storage(4)
                },
                Inst::Store {
                    addr: Address::storage(0),
                    src: x
                },
            ]
        );

        let strict = optimize(&fragment, FloatMode::Strict);
        assert_eq!(strict.insts.len(), fragment.insts.len());
    }

    #[test]
    fn multiply_by_zero_is_fast_only() {
        let mut method = MethodBuilder::new(44100.0);
        let x = method.load(Address::storage(4));
        let zero = method.constant(0.0);
        let product = method.binary(BinaryOp::Mul, x, zero);
        method.store(Address::storage(0), product);
        let fragment = method.finish();

        let fast = optimize(&fragment, FloatMode::Fast);
        assert!(!fast.insts.iter().any(|inst| matches!(inst, Inst::Load { .. })));
        let strict = optimize(&fragment, FloatMode::Strict);
        assert!(strict.insts.iter().any(|inst| matches!(inst, Inst::Load { .. })));
    }

    #[test]
    fn forwards_stored_values_to_loads() {
        let mut method = MethodBuilder::new(44100.0);
        let x = method.load(Address::storage(4));
        method.store(Address::storage(8), x);
        let again = method.load(Address::storage(8));
        let twice = method.load(Address::storage(4));
        let sum = method.binary(BinaryOp::Add, again, twice);
        method.store(Address::storage(0), sum);
        let fragment = optimize(&method.finish(), FloatMode::Strict);

        let loads = fragment
            .insts
            .iter()
            .filter(|inst| matches!(inst, Inst::Load { .. }))
            .count();
        assert_eq!(loads, 1);
        assert!(fragment.insts.contains(&Inst::Binary {
            dst: sum,
            op: BinaryOp::Add,
            lhs: x,
            rhs: x,
        }));
    }

    #[test]
    fn calls_with_addresses_forget_memory() {
        let mut method = MethodBuilder::new(44100.0);
        let x = method.load(Address::storage(4));
        method.store(Address::storage(0), x);
        method.call_void(Helper::MidiClear, vec![Arg::Addr(Address::storage(8))]);
        let y = method.load(Address::storage(4));
        method.store(Address::storage(0), y);
        let fragment = optimize(&method.finish(), FloatMode::Fast);

        let loads = fragment
            .insts
            .iter()
            .filter(|inst| matches!(inst, Inst::Load { .. }))
            .count();
        assert_eq!(loads, 2);
    }

    #[test]
    fn keeps_side_effects() {
        let mut method = MethodBuilder::new(44100.0);
        let unused = method.load(Address::storage(0));
        method.call(Helper::Sin, vec![Arg::Num(unused)]);
        method.call_void(Helper::MidiClear, vec![Arg::Addr(Address::storage(8))]);
        let fragment = optimize(&method.finish(), FloatMode::Fast);
        assert_eq!(fragment.insts.len(), 1);
        assert!(matches!(
            fragment.insts[0],
            Inst::Call {
                helper: Helper::MidiClear,
                ..
            }
        ));
    }
}
