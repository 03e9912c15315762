//! The common support module: math and MIDI helpers called by generated
//! code. It is emitted into every module, live or exported, so exported
//! instruments carry no dependency on this crate.

use std::f32::consts::{FRAC_1_PI, PI};

use cranelift::codegen::ir::Endianness;
use cranelift::prelude::*;
use cranelift_module::{FuncId, Linkage, Module};

use super::ir::Helper;
use super::lower::define_function;
use super::midi::{
    MidiStatus, MIDI_EVENTS_OFFSET, MIDI_EVENT_SIZE, MIDI_NOTE_OFFSET, MIDI_PARAM_OFFSET,
    MIDI_QUEUE_CAPACITY, MIDI_STATUS_OFFSET,
};
use crate::error::BackendError;

pub const COMMON_PREFIX: &str = "oscen.";

// Taylor coefficients of sin(x)/x in x^2, valid on [-pi/2, pi/2].
const SIN_COEFFS: [f32; 4] = [
    2.755_731_9e-6,
    -1.984_127e-4,
    8.333_333e-3,
    -1.666_666_7e-1,
];

// ln(2)^n / n!, 2^f = e^(f ln 2) on [0, 1).
const EXP2_COEFFS: [f32; 6] = [
    1.540_353e-4,
    1.333_355_8e-3,
    9.618_129e-3,
    5.550_411e-2,
    2.402_265e-1,
    6.931_472e-1,
];

/// Offsets inside the note tracker's state struct.
pub const TRACKER_NOTE: i32 = 0;
pub const TRACKER_GATE: i32 = 4;
pub const TRACKER_VELOCITY: i32 = 8;

#[derive(Debug, Clone, Copy)]
pub struct CommonFunctions {
    pub sin: FuncId,
    pub exp2: FuncId,
    pub midi_clear: FuncId,
    pub midi_push: FuncId,
    pub midi_merge: FuncId,
    pub midi_track_note: FuncId,
}

impl CommonFunctions {
    pub fn helper(&self, helper: Helper) -> FuncId {
        match helper {
            Helper::Sin => self.sin,
            Helper::Exp2 => self.exp2,
            Helper::MidiClear => self.midi_clear,
            Helper::MidiMerge => self.midi_merge,
            Helper::MidiTrackNote => self.midi_track_note,
        }
    }

    pub fn symbols() -> Vec<String> {
        ["sin", "exp2", "midi_clear", "midi_push", "midi_merge", "midi_track_note"]
            .iter()
            .map(|name| format!("{}{}", COMMON_PREFIX, name))
            .collect()
    }
}

pub fn define_common<M: Module>(
    module: &mut M,
    linkage: Linkage,
    clif: &mut Option<String>,
) -> Result<CommonFunctions, BackendError> {
    let ptr = module.target_config().pointer_type();

    let mut unary = module.make_signature();
    unary.params.push(AbiParam::new(types::F32));
    unary.returns.push(AbiParam::new(types::F32));

    let mut queue = module.make_signature();
    queue.params.push(AbiParam::new(ptr));

    let mut push = module.make_signature();
    push.params.push(AbiParam::new(ptr));
    push.params.push(AbiParam::new(types::I64));

    let mut pair = module.make_signature();
    pair.params.push(AbiParam::new(ptr));
    pair.params.push(AbiParam::new(ptr));

    let declare = |module: &mut M, name: &str, sig: &Signature| {
        module.declare_function(&format!("{}{}", COMMON_PREFIX, name), linkage, sig)
    };
    let functions = CommonFunctions {
        sin: declare(module, "sin", &unary)?,
        exp2: declare(module, "exp2", &unary)?,
        midi_clear: declare(module, "midi_clear", &queue)?,
        midi_push: declare(module, "midi_push", &push)?,
        midi_merge: declare(module, "midi_merge", &pair)?,
        midi_track_note: declare(module, "midi_track_note", &pair)?,
    };

    define_function(module, functions.sin, &unary, "oscen.sin", clif, |_, b, params| {
        let v = sin(b, params[0]);
        b.ins().return_(&[v]);
        Ok(())
    })?;

    define_function(module, functions.exp2, &unary, "oscen.exp2", clif, |_, b, params| {
        let v = exp2(b, params[0]);
        b.ins().return_(&[v]);
        Ok(())
    })?;

    define_function(module, functions.midi_clear, &queue, "oscen.midi_clear", clif, |_, b, params| {
        let zero = b.ins().iconst(types::I32, 0);
        b.ins().store(MemFlags::trusted(), zero, params[0], 0);
        b.ins().return_(&[]);
        Ok(())
    })?;

    define_function(module, functions.midi_push, &push, "oscen.midi_push", clif, |_, b, params| {
        midi_push(b, ptr, params[0], params[1]);
        Ok(())
    })?;

    define_function(module, functions.midi_merge, &pair, "oscen.midi_merge", clif, |module, b, params| {
        let push = module.declare_func_in_func(functions.midi_push, b.func);
        let (dst, src) = (params[0], params[1]);
        for_each_event(b, ptr, src, |b, event| {
            let bits = b.ins().load(types::I64, event_flags(), event, 0);
            b.ins().call(push, &[dst, bits]);
        });
        b.ins().return_(&[]);
        Ok(())
    })?;

    define_function(
        module,
        functions.midi_track_note,
        &pair,
        "oscen.midi_track_note",
        clif,
        |_, b, params| {
            let (queue, state) = (params[0], params[1]);
            for_each_event(b, ptr, queue, |b, event| track_note(b, event, state));
            b.ins().return_(&[]);
            Ok(())
        },
    )?;

    Ok(functions)
}

fn event_flags() -> MemFlags {
    MemFlags::new()
        .with_notrap()
        .with_endianness(Endianness::Little)
}

/// Range reduction to [-pi/2, pi/2] around the nearest multiple of pi, then
/// an odd polynomial. The sign flips for odd multiples.
fn sin(b: &mut FunctionBuilder<'_>, x: Value) -> Value {
    let inv_pi = b.ins().f32const(FRAC_1_PI);
    let turns = b.ins().fmul(x, inv_pi);
    let k = b.ins().nearest(turns);
    let pi = b.ins().f32const(PI);
    let offset = b.ins().fmul(k, pi);
    let r = b.ins().fsub(x, offset);

    let whole = b.ins().fcvt_to_sint_sat(types::I32, k);
    let parity = b.ins().band_imm(whole, 1);
    let odd = b.ins().icmp_imm(IntCC::NotEqual, parity, 0);
    let minus = b.ins().f32const(-1.0);
    let plus = b.ins().f32const(1.0);
    let sign = b.ins().select(odd, minus, plus);

    let r2 = b.ins().fmul(r, r);
    let mut acc = b.ins().f32const(SIN_COEFFS[0]);
    for c in &SIN_COEFFS[1..] {
        let scaled = b.ins().fmul(acc, r2);
        let c = b.ins().f32const(*c);
        acc = b.ins().fadd(scaled, c);
    }
    let scaled = b.ins().fmul(acc, r2);
    let one = b.ins().f32const(1.0);
    let poly = b.ins().fadd(scaled, one);
    let v = b.ins().fmul(poly, r);
    b.ins().fmul(v, sign)
}

/// Splits x into integer and fractional parts; the integer part goes
/// straight into the exponent bits.
fn exp2(b: &mut FunctionBuilder<'_>, x: Value) -> Value {
    let hi = b.ins().f32const(126.0);
    let lo = b.ins().f32const(-126.0);
    let x = b.ins().fmin(x, hi);
    let x = b.ins().fmax(x, lo);

    let whole = b.ins().floor(x);
    let f = b.ins().fsub(x, whole);
    let i = b.ins().fcvt_to_sint_sat(types::I32, whole);
    let biased = b.ins().iadd_imm(i, 127);
    let bits = b.ins().ishl_imm(biased, 23);
    let scale = b.ins().bitcast(types::F32, MemFlags::new(), bits);

    let mut acc = b.ins().f32const(EXP2_COEFFS[0]);
    for c in EXP2_COEFFS[1..].iter().chain(std::iter::once(&1.0)) {
        let scaled = b.ins().fmul(acc, f);
        let c = b.ins().f32const(*c);
        acc = b.ins().fadd(scaled, c);
    }
    b.ins().fmul(acc, scale)
}

/// `base + index * stride` for a 32-bit index.
fn element(b: &mut FunctionBuilder<'_>, ptr: Type, base: Value, index: Value, stride: i64) -> Value {
    let index = if ptr == types::I32 {
        index
    } else {
        b.ins().uextend(ptr, index)
    };
    let offset = b.ins().imul_imm(index, stride);
    b.ins().iadd(base, offset)
}

fn midi_push(b: &mut FunctionBuilder<'_>, ptr: Type, queue: Value, event: Value) {
    let count = b.ins().load(types::I32, MemFlags::trusted(), queue, 0);
    let store = b.create_block();
    let done = b.create_block();
    let full = b.ins().icmp_imm(
        IntCC::UnsignedGreaterThanOrEqual,
        count,
        MIDI_QUEUE_CAPACITY as i64,
    );
    b.ins().brif(full, done, &[], store, &[]);

    b.switch_to_block(store);
    let slot = element(b, ptr, queue, count, i64::from(MIDI_EVENT_SIZE));
    b.ins()
        .store(event_flags(), event, slot, MIDI_EVENTS_OFFSET as i32);
    let next = b.ins().iadd_imm(count, 1);
    b.ins().store(MemFlags::trusted(), next, queue, 0);
    b.ins().jump(done, &[]);

    b.switch_to_block(done);
    b.ins().return_(&[]);
}

/// Emits a loop over the events of `queue`. `body` receives the address of
/// the current event. Leaves the builder in the exit block.
fn for_each_event(
    b: &mut FunctionBuilder<'_>,
    ptr: Type,
    queue: Value,
    body: impl FnOnce(&mut FunctionBuilder<'_>, Value),
) {
    let header = b.create_block();
    let step = b.create_block();
    let exit = b.create_block();
    b.append_block_param(header, types::I32);

    let stored = b.ins().load(types::I32, MemFlags::trusted(), queue, 0);
    let capacity = b.ins().iconst(types::I32, MIDI_QUEUE_CAPACITY as i64);
    let count = b.ins().umin(stored, capacity);
    let zero = b.ins().iconst(types::I32, 0);
    b.ins().jump(header, &[zero]);

    b.switch_to_block(header);
    let index = b.block_params(header)[0];
    let more = b.ins().icmp(IntCC::UnsignedLessThan, index, count);
    let visit = b.create_block();
    b.ins().brif(more, visit, &[], exit, &[]);

    b.switch_to_block(visit);
    let slot = element(b, ptr, queue, index, i64::from(MIDI_EVENT_SIZE));
    let event = b.ins().iadd_imm(slot, i64::from(MIDI_EVENTS_OFFSET));
    body(b, event);
    b.ins().jump(step, &[]);

    b.switch_to_block(step);
    let next = b.ins().iadd_imm(index, 1);
    b.ins().jump(header, &[next]);

    b.switch_to_block(exit);
}

/// Note on with a non-zero velocity takes over the tracker. A note off, or a
/// note on with zero velocity, for the held note closes the gate.
fn track_note(b: &mut FunctionBuilder<'_>, event: Value, state: Value) {
    let flags = MemFlags::trusted();
    let status = b.ins().uload8(types::I32, event_flags(), event, MIDI_STATUS_OFFSET);
    let status = b.ins().ushr_imm(status, 4);
    let note = b.ins().uload8(types::I32, event_flags(), event, MIDI_NOTE_OFFSET);
    let velocity = b.ins().uload8(types::I32, event_flags(), event, MIDI_PARAM_OFFSET);

    let is_on = b.ins().icmp_imm(IntCC::Equal, status, MidiStatus::NoteOn as i64);
    let is_off = b.ins().icmp_imm(IntCC::Equal, status, MidiStatus::NoteOff as i64);
    let silent = b.ins().icmp_imm(IntCC::Equal, velocity, 0);
    let audible = b.ins().icmp_imm(IntCC::NotEqual, velocity, 0);
    let start = b.ins().band(is_on, audible);
    let quiet_on = b.ins().band(is_on, silent);
    let release = b.ins().bor(is_off, quiet_on);
    let note_value = b.ins().fcvt_from_uint(types::F32, note);

    let on_block = b.create_block();
    let off_check = b.create_block();
    let off_block = b.create_block();
    let done = b.create_block();
    b.ins().brif(start, on_block, &[], off_check, &[]);

    b.switch_to_block(on_block);
    b.ins().store(flags, note_value, state, TRACKER_NOTE);
    let one = b.ins().f32const(1.0);
    b.ins().store(flags, one, state, TRACKER_GATE);
    let level = b.ins().fcvt_from_uint(types::F32, velocity);
    let scale = b.ins().f32const(1.0 / 127.0);
    let level = b.ins().fmul(level, scale);
    b.ins().store(flags, level, state, TRACKER_VELOCITY);
    b.ins().jump(done, &[]);

    b.switch_to_block(off_check);
    let held = b.ins().load(types::F32, flags, state, TRACKER_NOTE);
    let same = b.ins().fcmp(FloatCC::Equal, held, note_value);
    let close = b.ins().band(release, same);
    b.ins().brif(close, off_block, &[], done, &[]);

    b.switch_to_block(off_block);
    let zero = b.ins().f32const(0.0);
    b.ins().store(flags, zero, state, TRACKER_GATE);
    b.ins().jump(done, &[]);

    b.switch_to_block(done);
}
