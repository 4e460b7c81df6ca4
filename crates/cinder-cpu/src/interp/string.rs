//! String instructions (MOVS/STOS/LODS/CMPS/SCAS) with REP handling.
//!
//! A repeated string instruction executes exactly one iteration per scheduler
//! step: after the iteration, if CX is still nonzero and the termination
//! condition has not hit, IP is rewound to the first prefix byte. The
//! scheduler's pause flag and pending interrupts are therefore observed
//! between iterations for free, and resuming after a pause re-enters the
//! instruction transparently.

use crate::interp::alu::{self, Width};
use crate::interp::decode::{PrefixState, RepPrefix};
use crate::mem::{linear, Bus};
use crate::state::{CpuState, Segment, FLAG_DF, FLAG_ZF};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringOp {
    Movs,
    Stos,
    Lods,
    Cmps,
    Scas,
}

/// Execute one string instruction (one iteration when repeated).
///
/// `rewind_ip` is the address of the first prefix byte; the caller has
/// already advanced IP past the whole instruction.
pub fn exec_string(
    cpu: &mut CpuState,
    bus: &mut impl Bus,
    op: StringOp,
    w: Width,
    prefixes: &PrefixState,
    rewind_ip: u16,
) {
    let repeated = prefixes.rep != RepPrefix::None;
    if repeated && cpu.cx() == 0 {
        return;
    }

    run_iteration(cpu, bus, op, w, prefixes);

    if !repeated {
        return;
    }
    cpu.set_cx(cpu.cx().wrapping_sub(1));

    // REPE/REPNE only condition CMPS and SCAS.
    let zf_terminates = matches!(op, StringOp::Cmps | StringOp::Scas)
        && match prefixes.rep {
            RepPrefix::Rep => !cpu.flag(FLAG_ZF),
            RepPrefix::Repne => cpu.flag(FLAG_ZF),
            RepPrefix::None => false,
        };

    if cpu.cx() != 0 && !zf_terminates {
        cpu.set_ip(rewind_ip);
    }
}

fn run_iteration(
    cpu: &mut CpuState,
    bus: &mut impl Bus,
    op: StringOp,
    w: Width,
    prefixes: &PrefixState,
) {
    let size = (w.bits() / 8) as u16;
    let delta = if cpu.flag(FLAG_DF) {
        size.wrapping_neg()
    } else {
        size
    };

    // The source segment honors an override; the ES:DI destination does not.
    let src_seg = cpu.segment(prefixes.segment_override.unwrap_or(Segment::DS));
    let es = cpu.segment(Segment::ES);

    match op {
        StringOp::Movs => {
            let v = read_mem(bus, w, linear(src_seg, cpu.si()));
            write_mem(bus, w, linear(es, cpu.di()), v);
            cpu.set_si(cpu.si().wrapping_add(delta));
            cpu.set_di(cpu.di().wrapping_add(delta));
        }
        StringOp::Stos => {
            write_mem(bus, w, linear(es, cpu.di()), acc(cpu, w));
            cpu.set_di(cpu.di().wrapping_add(delta));
        }
        StringOp::Lods => {
            let v = read_mem(bus, w, linear(src_seg, cpu.si()));
            set_acc(cpu, w, v);
            cpu.set_si(cpu.si().wrapping_add(delta));
        }
        StringOp::Cmps => {
            let a = read_mem(bus, w, linear(src_seg, cpu.si()));
            let b = read_mem(bus, w, linear(es, cpu.di()));
            alu::cmp(cpu, w, a as u64, b as u64);
            cpu.set_si(cpu.si().wrapping_add(delta));
            cpu.set_di(cpu.di().wrapping_add(delta));
        }
        StringOp::Scas => {
            let a = acc(cpu, w);
            let b = read_mem(bus, w, linear(es, cpu.di()));
            alu::cmp(cpu, w, a as u64, b as u64);
            cpu.set_di(cpu.di().wrapping_add(delta));
        }
    }
}

fn read_mem(bus: &mut impl Bus, w: Width, addr: u32) -> u16 {
    match w {
        Width::Byte => bus.read_u8(addr) as u16,
        _ => bus.read_u16(addr),
    }
}

fn write_mem(bus: &mut impl Bus, w: Width, addr: u32, value: u16) {
    match w {
        Width::Byte => bus.write_u8(addr, value as u8),
        _ => bus.write_u16(addr, value),
    }
}

fn acc(cpu: &CpuState, w: Width) -> u16 {
    match w {
        Width::Byte => cpu.al() as u16,
        _ => cpu.ax(),
    }
}

fn set_acc(cpu: &mut CpuState, w: Width, value: u16) {
    match w {
        Width::Byte => cpu.set_al(value as u8),
        _ => cpu.set_ax(value),
    }
}
