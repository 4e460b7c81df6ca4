//! Fetch/decode/execute for one instruction.
//!
//! The dispatch is a dense match over the primary opcode byte; group opcodes
//! (80-83, C0/C1, D0-D3, F6/F7, FE, FF) chain on the ModR/M reg field and
//! `0F` escapes to the two-byte table. Operand bytes are consumed through the
//! fetch cursor, so by the time an arm performs its side effects the cursor
//! holds the architectural next-instruction address; branches, calls and
//! interrupt frames all use that post-advance IP.

use crate::exception::Exception;
use crate::interp::alu::{self, ShiftKind, Width};
use crate::interp::decode::{self, Fetch, ModRm, Operand, PrefixState};
use crate::interp::string::{exec_string, StringOp};
use crate::interrupts::{iret, pop16, push16};
use crate::mem::{linear, Bus};
use crate::state::{
    CpuState, Register, Segment, FLAG_AF, FLAG_CF, FLAG_DF, FLAG_IF, FLAG_OF, FLAG_PF, FLAG_SF,
    FLAG_ZF,
};

/// Why a step returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuExit {
    /// The instruction completed; execution may continue.
    Continue,
    /// HLT executed; the CPU stays halted until an external wake.
    Halted,
    /// A software interrupt or fault wants delivery. IP already points at the
    /// return location; the caller consults its device registry before
    /// falling back to IVT delivery.
    Interrupt(u8),
}

enum Flow {
    Next,
    /// The arm wrote CS and/or IP itself.
    Jump,
    Halt,
    /// IP already advanced by the arm.
    Int(u8),
}

#[derive(Debug, Clone, Copy)]
enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    fn from_family(idx: u8) -> AluOp {
        match idx & 7 {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            _ => AluOp::Cmp,
        }
    }
}

/// Execute exactly one instruction.
///
/// Architectural faults come back as `Err`; the vector they must be raised
/// through is `Exception::vector`. IP has been advanced past the faulting
/// instruction, matching the 8086's push-next-IP behavior for INT 0.
pub fn step(cpu: &mut CpuState, bus: &mut impl Bus) -> Result<CpuExit, Exception> {
    if cpu.halted {
        return Ok(CpuExit::Halted);
    }

    let mut fetch = Fetch::new(cpu.segment(Segment::CS), cpu.ip());
    let prefixes = decode::parse_prefixes(&mut fetch, bus);
    let opcode = fetch.u8(bus);

    if prefixes.address_size {
        cpu.set_ip(fetch.ip);
        return Err(Exception::InvalidOpcode(opcode));
    }
    if prefixes.operand_size && !matches!(opcode, 0x09 | 0x0B | 0x21 | 0x23 | 0x31 | 0x33) {
        cpu.set_ip(fetch.ip);
        return Err(Exception::InvalidOpcode(opcode));
    }

    let flow = match exec_opcode(cpu, bus, &mut fetch, &prefixes, opcode) {
        Ok(flow) => flow,
        Err(e) => {
            // Faults return to the instruction after the faulting one.
            cpu.set_ip(fetch.ip);
            return Err(e);
        }
    };

    match flow {
        Flow::Next => {
            cpu.set_ip(fetch.ip);
            Ok(CpuExit::Continue)
        }
        Flow::Jump => Ok(CpuExit::Continue),
        Flow::Halt => {
            cpu.set_ip(fetch.ip);
            cpu.halted = true;
            Ok(CpuExit::Halted)
        }
        Flow::Int(vector) => Ok(CpuExit::Interrupt(vector)),
    }
}

fn exec_opcode(
    cpu: &mut CpuState,
    bus: &mut impl Bus,
    fetch: &mut Fetch,
    prefixes: &PrefixState,
    opcode: u8,
) -> Result<Flow, Exception> {
    match opcode {
        // ALU families: ADD OR ADC SBB AND SUB XOR CMP, six encodings each.
        0x00..=0x05
        | 0x08..=0x0D
        | 0x10..=0x15
        | 0x18..=0x1D
        | 0x20..=0x25
        | 0x28..=0x2D
        | 0x30..=0x35
        | 0x38..=0x3D => {
            let op = AluOp::from_family(opcode >> 3);
            alu_family(cpu, bus, fetch, prefixes, op, opcode)?;
            Ok(Flow::Next)
        }

        // PUSH/POP segment registers.
        0x06 => {
            let v = cpu.segment(Segment::ES);
            push16(cpu, bus, v);
            Ok(Flow::Next)
        }
        0x07 => {
            let v = pop16(cpu, bus);
            cpu.set_segment(Segment::ES, v);
            Ok(Flow::Next)
        }
        0x0E => {
            let v = cpu.segment(Segment::CS);
            push16(cpu, bus, v);
            Ok(Flow::Next)
        }
        0x16 => {
            let v = cpu.segment(Segment::SS);
            push16(cpu, bus, v);
            Ok(Flow::Next)
        }
        0x17 => {
            let v = pop16(cpu, bus);
            cpu.set_segment(Segment::SS, v);
            Ok(Flow::Next)
        }
        0x1E => {
            let v = cpu.segment(Segment::DS);
            push16(cpu, bus, v);
            Ok(Flow::Next)
        }
        0x1F => {
            let v = pop16(cpu, bus);
            cpu.set_segment(Segment::DS, v);
            Ok(Flow::Next)
        }

        0x0F => exec_0f(cpu, bus, fetch),

        0x27 => {
            daa(cpu);
            Ok(Flow::Next)
        }
        0x2F => {
            das(cpu);
            Ok(Flow::Next)
        }
        0x37 => {
            aaa(cpu);
            Ok(Flow::Next)
        }
        0x3F => {
            aas(cpu);
            Ok(Flow::Next)
        }

        // INC/DEC r16.
        0x40..=0x47 => {
            let reg = Register::word(opcode & 7);
            let a = cpu.reg16(reg) as u64;
            let v = alu::inc(cpu, Width::Word, a);
            cpu.write_reg(reg, v as u32);
            Ok(Flow::Next)
        }
        0x48..=0x4F => {
            let reg = Register::word(opcode & 7);
            let a = cpu.reg16(reg) as u64;
            let v = alu::dec(cpu, Width::Word, a);
            cpu.write_reg(reg, v as u32);
            Ok(Flow::Next)
        }

        // PUSH/POP r16.
        0x50..=0x57 => {
            let v = cpu.reg16(Register::word(opcode & 7));
            push16(cpu, bus, v);
            Ok(Flow::Next)
        }
        0x58..=0x5F => {
            let v = pop16(cpu, bus);
            cpu.write_reg(Register::word(opcode & 7), v as u32);
            Ok(Flow::Next)
        }

        0x60 => {
            pusha(cpu, bus);
            Ok(Flow::Next)
        }
        0x61 => {
            popa(cpu, bus);
            Ok(Flow::Next)
        }

        // PUSH imm16 / imm8, IMUL three-operand forms.
        0x68 => {
            let imm = fetch.u16(bus);
            push16(cpu, bus, imm);
            Ok(Flow::Next)
        }
        0x69 => {
            let modrm = ModRm::fetch(fetch, bus);
            let rm = decode::resolve_rm(cpu, bus, fetch, modrm, prefixes, Width::Word);
            let imm = fetch.u16(bus);
            let src = read_op(cpu, bus, rm, Width::Word);
            let product = alu::imul(cpu, Width::Word, src, imm as u64);
            cpu.write_reg(decode::reg_operand(modrm, Width::Word), product as u32 & 0xFFFF);
            Ok(Flow::Next)
        }
        0x6A => {
            let imm = fetch.i8(bus) as i16 as u16;
            push16(cpu, bus, imm);
            Ok(Flow::Next)
        }
        0x6B => {
            let modrm = ModRm::fetch(fetch, bus);
            let rm = decode::resolve_rm(cpu, bus, fetch, modrm, prefixes, Width::Word);
            let imm = fetch.i8(bus) as i16 as u16;
            let src = read_op(cpu, bus, rm, Width::Word);
            let product = alu::imul(cpu, Width::Word, src, imm as u64);
            cpu.write_reg(decode::reg_operand(modrm, Width::Word), product as u32 & 0xFFFF);
            Ok(Flow::Next)
        }

        // Jcc rel8.
        0x70..=0x7F => {
            let disp = fetch.i8(bus);
            if condition(cpu, opcode & 0xF) {
                cpu.set_ip(fetch.ip.wrapping_add(disp as u16));
                Ok(Flow::Jump)
            } else {
                Ok(Flow::Next)
            }
        }

        // GRP1: ALU with immediate.
        0x80 | 0x82 => {
            let modrm = ModRm::fetch(fetch, bus);
            let rm = decode::resolve_rm(cpu, bus, fetch, modrm, prefixes, Width::Byte);
            let imm = fetch.u8(bus) as u64;
            let op = AluOp::from_family(modrm.reg);
            let a = read_op(cpu, bus, rm, Width::Byte);
            if let Some(v) = alu_apply(cpu, op, Width::Byte, a, imm) {
                write_op(cpu, bus, rm, Width::Byte, v);
            }
            Ok(Flow::Next)
        }
        0x81 => {
            let modrm = ModRm::fetch(fetch, bus);
            let rm = decode::resolve_rm(cpu, bus, fetch, modrm, prefixes, Width::Word);
            let imm = fetch.u16(bus) as u64;
            let op = AluOp::from_family(modrm.reg);
            let a = read_op(cpu, bus, rm, Width::Word);
            if let Some(v) = alu_apply(cpu, op, Width::Word, a, imm) {
                write_op(cpu, bus, rm, Width::Word, v);
            }
            Ok(Flow::Next)
        }
        0x83 => {
            let modrm = ModRm::fetch(fetch, bus);
            let rm = decode::resolve_rm(cpu, bus, fetch, modrm, prefixes, Width::Word);
            let imm = fetch.i8(bus) as i16 as u16 as u64;
            let op = AluOp::from_family(modrm.reg);
            let a = read_op(cpu, bus, rm, Width::Word);
            if let Some(v) = alu_apply(cpu, op, Width::Word, a, imm) {
                write_op(cpu, bus, rm, Width::Word, v);
            }
            Ok(Flow::Next)
        }

        // TEST r/m,r.
        0x84 => {
            let (rm, reg) = rm_reg(cpu, bus, fetch, prefixes, Width::Byte);
            let a = read_op(cpu, bus, rm, Width::Byte);
            let b = cpu.read_reg(reg) as u64;
            alu::test(cpu, Width::Byte, a, b);
            Ok(Flow::Next)
        }
        0x85 => {
            let (rm, reg) = rm_reg(cpu, bus, fetch, prefixes, Width::Word);
            let a = read_op(cpu, bus, rm, Width::Word);
            let b = cpu.read_reg(reg) as u64;
            alu::test(cpu, Width::Word, a, b);
            Ok(Flow::Next)
        }

        // XCHG r/m,r.
        0x86 => {
            let (rm, reg) = rm_reg(cpu, bus, fetch, prefixes, Width::Byte);
            let a = read_op(cpu, bus, rm, Width::Byte);
            let b = cpu.read_reg(reg) as u64;
            write_op(cpu, bus, rm, Width::Byte, b);
            cpu.write_reg(reg, a as u32);
            Ok(Flow::Next)
        }
        0x87 => {
            let (rm, reg) = rm_reg(cpu, bus, fetch, prefixes, Width::Word);
            let a = read_op(cpu, bus, rm, Width::Word);
            let b = cpu.read_reg(reg) as u64;
            write_op(cpu, bus, rm, Width::Word, b);
            cpu.write_reg(reg, a as u32);
            Ok(Flow::Next)
        }

        // MOV r/m,r and MOV r,r/m.
        0x88 => {
            let (rm, reg) = rm_reg(cpu, bus, fetch, prefixes, Width::Byte);
            let v = cpu.read_reg(reg) as u64;
            write_op(cpu, bus, rm, Width::Byte, v);
            Ok(Flow::Next)
        }
        0x89 => {
            let (rm, reg) = rm_reg(cpu, bus, fetch, prefixes, Width::Word);
            let v = cpu.read_reg(reg) as u64;
            write_op(cpu, bus, rm, Width::Word, v);
            Ok(Flow::Next)
        }
        0x8A => {
            let (rm, reg) = rm_reg(cpu, bus, fetch, prefixes, Width::Byte);
            let v = read_op(cpu, bus, rm, Width::Byte);
            cpu.write_reg(reg, v as u32);
            Ok(Flow::Next)
        }
        0x8B => {
            let (rm, reg) = rm_reg(cpu, bus, fetch, prefixes, Width::Word);
            let v = read_op(cpu, bus, rm, Width::Word);
            cpu.write_reg(reg, v as u32);
            Ok(Flow::Next)
        }

        // MOV r/m16,Sreg and MOV Sreg,r/m16.
        0x8C => {
            let modrm = ModRm::fetch(fetch, bus);
            let rm = decode::resolve_rm(cpu, bus, fetch, modrm, prefixes, Width::Word);
            let seg = segment_from_reg(modrm.reg);
            let v = cpu.segment(seg) as u64;
            write_op(cpu, bus, rm, Width::Word, v);
            Ok(Flow::Next)
        }
        0x8E => {
            let modrm = ModRm::fetch(fetch, bus);
            let rm = decode::resolve_rm(cpu, bus, fetch, modrm, prefixes, Width::Word);
            let seg = segment_from_reg(modrm.reg);
            let v = read_op(cpu, bus, rm, Width::Word);
            cpu.set_segment(seg, v as u16);
            Ok(Flow::Next)
        }

        0x8D => {
            let modrm = ModRm::fetch(fetch, bus);
            if modrm.is_register() {
                return Err(Exception::InvalidOpcode(opcode));
            }
            let (offset, _) = decode::effective_offset(cpu, bus, fetch, modrm);
            cpu.write_reg(decode::reg_operand(modrm, Width::Word), offset as u32);
            Ok(Flow::Next)
        }

        0x8F => {
            let modrm = ModRm::fetch(fetch, bus);
            let rm = decode::resolve_rm(cpu, bus, fetch, modrm, prefixes, Width::Word);
            let v = pop16(cpu, bus);
            write_op(cpu, bus, rm, Width::Word, v as u64);
            Ok(Flow::Next)
        }

        0x90 => Ok(Flow::Next), // NOP (XCHG AX,AX)

        0x91..=0x97 => {
            let reg = Register::word(opcode & 7);
            let ax = cpu.ax();
            cpu.set_ax(cpu.reg16(reg));
            cpu.write_reg(reg, ax as u32);
            Ok(Flow::Next)
        }

        0x98 => {
            // CBW
            cpu.set_ax(cpu.al() as i8 as i16 as u16);
            Ok(Flow::Next)
        }
        0x99 => {
            // CWD
            let dx = if cpu.ax() & 0x8000 != 0 { 0xFFFF } else { 0 };
            cpu.set_dx(dx);
            Ok(Flow::Next)
        }

        0x9A => {
            // CALL far ptr16:16.
            let offset = fetch.u16(bus);
            let segment = fetch.u16(bus);
            let cs = cpu.segment(Segment::CS);
            push16(cpu, bus, cs);
            push16(cpu, bus, fetch.ip);
            cpu.set_segment(Segment::CS, segment);
            cpu.set_ip(offset);
            Ok(Flow::Jump)
        }

        0x9B => Ok(Flow::Next), // WAIT: no FPU to wait for

        0x9C => {
            let flags = cpu.flags();
            push16(cpu, bus, flags);
            Ok(Flow::Next)
        }
        0x9D => {
            let v = pop16(cpu, bus);
            cpu.set_flags(v);
            Ok(Flow::Next)
        }
        0x9E => {
            // SAHF: SF ZF AF PF CF from AH.
            const LOW_MASK: u16 = FLAG_SF | FLAG_ZF | FLAG_AF | FLAG_PF | FLAG_CF;
            let flags = (cpu.flags() & !LOW_MASK) | (cpu.ah() as u16 & LOW_MASK);
            cpu.set_flags(flags);
            Ok(Flow::Next)
        }
        0x9F => {
            // LAHF: AH = low flags byte (bit 1 reads 1, bits 3/5 read 0).
            cpu.set_ah(cpu.flags() as u8);
            Ok(Flow::Next)
        }

        // MOV accumulator <-> direct address.
        0xA0 => {
            let off = fetch.u16(bus);
            let addr = moffs(cpu, prefixes, off);
            let v = bus.read_u8(addr);
            cpu.set_al(v);
            Ok(Flow::Next)
        }
        0xA1 => {
            let off = fetch.u16(bus);
            let addr = moffs(cpu, prefixes, off);
            let v = bus.read_u16(addr);
            cpu.set_ax(v);
            Ok(Flow::Next)
        }
        0xA2 => {
            let off = fetch.u16(bus);
            let addr = moffs(cpu, prefixes, off);
            bus.write_u8(addr, cpu.al());
            Ok(Flow::Next)
        }
        0xA3 => {
            let off = fetch.u16(bus);
            let addr = moffs(cpu, prefixes, off);
            bus.write_u16(addr, cpu.ax());
            Ok(Flow::Next)
        }

        // String ops. One REP iteration per step; the rewind target is the
        // first prefix byte.
        0xA4 | 0xA5 | 0xA6 | 0xA7 | 0xAA | 0xAB | 0xAC | 0xAD | 0xAE | 0xAF => {
            let (op, w) = match opcode {
                0xA4 => (StringOp::Movs, Width::Byte),
                0xA5 => (StringOp::Movs, Width::Word),
                0xA6 => (StringOp::Cmps, Width::Byte),
                0xA7 => (StringOp::Cmps, Width::Word),
                0xAA => (StringOp::Stos, Width::Byte),
                0xAB => (StringOp::Stos, Width::Word),
                0xAC => (StringOp::Lods, Width::Byte),
                0xAD => (StringOp::Lods, Width::Word),
                0xAE => (StringOp::Scas, Width::Byte),
                _ => (StringOp::Scas, Width::Word),
            };
            cpu.set_ip(fetch.ip);
            exec_string(cpu, bus, op, w, prefixes, fetch.start_ip);
            Ok(Flow::Jump)
        }

        0xA8 => {
            let imm = fetch.u8(bus) as u64;
            let a = cpu.al() as u64;
            alu::test(cpu, Width::Byte, a, imm);
            Ok(Flow::Next)
        }
        0xA9 => {
            let imm = fetch.u16(bus) as u64;
            let a = cpu.ax() as u64;
            alu::test(cpu, Width::Word, a, imm);
            Ok(Flow::Next)
        }

        // MOV r,imm.
        0xB0..=0xB7 => {
            let imm = fetch.u8(bus);
            cpu.write_reg(Register::byte(opcode & 7), imm as u32);
            Ok(Flow::Next)
        }
        0xB8..=0xBF => {
            let imm = fetch.u16(bus);
            cpu.write_reg(Register::word(opcode & 7), imm as u32);
            Ok(Flow::Next)
        }

        // GRP2 shift/rotate.
        0xC0 => {
            let modrm = ModRm::fetch(fetch, bus);
            let rm = decode::resolve_rm(cpu, bus, fetch, modrm, prefixes, Width::Byte);
            let count = fetch.u8(bus);
            shift_group(cpu, bus, rm, Width::Byte, modrm.reg, count)?;
            Ok(Flow::Next)
        }
        0xC1 => {
            let modrm = ModRm::fetch(fetch, bus);
            let rm = decode::resolve_rm(cpu, bus, fetch, modrm, prefixes, Width::Word);
            let count = fetch.u8(bus);
            shift_group(cpu, bus, rm, Width::Word, modrm.reg, count)?;
            Ok(Flow::Next)
        }
        0xD0 | 0xD1 | 0xD2 | 0xD3 => {
            let w = if opcode & 1 == 0 {
                Width::Byte
            } else {
                Width::Word
            };
            let modrm = ModRm::fetch(fetch, bus);
            let rm = decode::resolve_rm(cpu, bus, fetch, modrm, prefixes, w);
            let count = if opcode & 2 == 0 { 1 } else { cpu.cl() };
            shift_group(cpu, bus, rm, w, modrm.reg, count)?;
            Ok(Flow::Next)
        }

        // RET near.
        0xC2 => {
            let imm = fetch.u16(bus);
            let ip = pop16(cpu, bus);
            cpu.set_sp(cpu.sp().wrapping_add(imm));
            cpu.set_ip(ip);
            Ok(Flow::Jump)
        }
        0xC3 => {
            let ip = pop16(cpu, bus);
            cpu.set_ip(ip);
            Ok(Flow::Jump)
        }

        // LES/LDS r16,m16:16.
        0xC4 | 0xC5 => {
            let modrm = ModRm::fetch(fetch, bus);
            let Operand::Mem(addr) =
                decode::resolve_rm(cpu, bus, fetch, modrm, prefixes, Width::Word)
            else {
                return Err(Exception::InvalidOpcode(opcode));
            };
            let offset = bus.read_u16(addr);
            let segment = bus.read_u16(addr.wrapping_add(2));
            cpu.write_reg(decode::reg_operand(modrm, Width::Word), offset as u32);
            let seg = if opcode == 0xC4 {
                Segment::ES
            } else {
                Segment::DS
            };
            cpu.set_segment(seg, segment);
            Ok(Flow::Next)
        }

        // MOV r/m,imm.
        0xC6 => {
            let modrm = ModRm::fetch(fetch, bus);
            let rm = decode::resolve_rm(cpu, bus, fetch, modrm, prefixes, Width::Byte);
            let imm = fetch.u8(bus);
            write_op(cpu, bus, rm, Width::Byte, imm as u64);
            Ok(Flow::Next)
        }
        0xC7 => {
            let modrm = ModRm::fetch(fetch, bus);
            let rm = decode::resolve_rm(cpu, bus, fetch, modrm, prefixes, Width::Word);
            let imm = fetch.u16(bus);
            write_op(cpu, bus, rm, Width::Word, imm as u64);
            Ok(Flow::Next)
        }

        // RET far.
        0xCA => {
            let imm = fetch.u16(bus);
            let ip = pop16(cpu, bus);
            let cs = pop16(cpu, bus);
            cpu.set_sp(cpu.sp().wrapping_add(imm));
            cpu.set_ip(ip);
            cpu.set_segment(Segment::CS, cs);
            Ok(Flow::Jump)
        }
        0xCB => {
            let ip = pop16(cpu, bus);
            let cs = pop16(cpu, bus);
            cpu.set_ip(ip);
            cpu.set_segment(Segment::CS, cs);
            Ok(Flow::Jump)
        }

        // Software interrupts.
        0xCC => {
            cpu.set_ip(fetch.ip);
            Ok(Flow::Int(3))
        }
        0xCD => {
            let vector = fetch.u8(bus);
            cpu.set_ip(fetch.ip);
            Ok(Flow::Int(vector))
        }
        0xCE => {
            cpu.set_ip(fetch.ip);
            if cpu.flag(FLAG_OF) {
                Ok(Flow::Int(4))
            } else {
                Ok(Flow::Jump)
            }
        }
        0xCF => {
            iret(cpu, bus);
            Ok(Flow::Jump)
        }

        0xD4 => {
            // AAM: AH = AL / imm, AL = AL % imm.
            let imm = fetch.u8(bus);
            if imm == 0 {
                return Err(Exception::DivideError);
            }
            let al = cpu.al();
            cpu.set_ah(al / imm);
            cpu.set_al(al % imm);
            let al = cpu.al();
            set_szp8(cpu, al);
            Ok(Flow::Next)
        }
        0xD5 => {
            // AAD: AL = AL + AH * imm, AH = 0.
            let imm = fetch.u8(bus);
            let al = cpu
                .al()
                .wrapping_add(cpu.ah().wrapping_mul(imm));
            cpu.set_al(al);
            cpu.set_ah(0);
            set_szp8(cpu, al);
            Ok(Flow::Next)
        }

        0xD7 => {
            // XLAT: AL = [seg:BX+AL].
            let seg = prefixes.segment_override.unwrap_or(Segment::DS);
            let addr = linear(cpu.segment(seg), cpu.bx().wrapping_add(cpu.al() as u16));
            let v = bus.read_u8(addr);
            cpu.set_al(v);
            Ok(Flow::Next)
        }

        // LOOPNE/LOOPE/LOOP/JCXZ rel8.
        0xE0 => loop_op(cpu, bus, fetch, |cpu| !cpu.flag(FLAG_ZF)),
        0xE1 => loop_op(cpu, bus, fetch, |cpu| cpu.flag(FLAG_ZF)),
        0xE2 => loop_op(cpu, bus, fetch, |_| true),
        0xE3 => {
            let disp = fetch.i8(bus);
            if cpu.cx() == 0 {
                cpu.set_ip(fetch.ip.wrapping_add(disp as u16));
                Ok(Flow::Jump)
            } else {
                Ok(Flow::Next)
            }
        }

        // Port I/O: no port devices are modeled; reads float high.
        0xE4 => {
            let _port = fetch.u8(bus);
            cpu.set_al(0xFF);
            Ok(Flow::Next)
        }
        0xE5 => {
            let _port = fetch.u8(bus);
            cpu.set_ax(0xFFFF);
            Ok(Flow::Next)
        }
        0xE6 | 0xE7 => {
            let _port = fetch.u8(bus);
            Ok(Flow::Next)
        }
        0xEC => {
            cpu.set_al(0xFF);
            Ok(Flow::Next)
        }
        0xED => {
            cpu.set_ax(0xFFFF);
            Ok(Flow::Next)
        }
        0xEE | 0xEF => Ok(Flow::Next),

        0xE8 => {
            let disp = fetch.u16(bus);
            push16(cpu, bus, fetch.ip);
            cpu.set_ip(fetch.ip.wrapping_add(disp));
            Ok(Flow::Jump)
        }
        0xE9 => {
            let disp = fetch.u16(bus);
            cpu.set_ip(fetch.ip.wrapping_add(disp));
            Ok(Flow::Jump)
        }
        0xEA => {
            let offset = fetch.u16(bus);
            let segment = fetch.u16(bus);
            cpu.set_segment(Segment::CS, segment);
            cpu.set_ip(offset);
            Ok(Flow::Jump)
        }
        0xEB => {
            let disp = fetch.i8(bus);
            cpu.set_ip(fetch.ip.wrapping_add(disp as u16));
            Ok(Flow::Jump)
        }

        0xF4 => Ok(Flow::Halt),

        0xF5 => {
            let cf = cpu.cf();
            cpu.set_cf(!cf);
            Ok(Flow::Next)
        }

        // GRP3: TEST/NOT/NEG/MUL/IMUL/DIV/IDIV.
        0xF6 => grp3(cpu, bus, fetch, prefixes, Width::Byte),
        0xF7 => grp3(cpu, bus, fetch, prefixes, Width::Word),

        0xF8 => {
            cpu.set_cf(false);
            Ok(Flow::Next)
        }
        0xF9 => {
            cpu.set_cf(true);
            Ok(Flow::Next)
        }
        0xFA => {
            cpu.set_flag(FLAG_IF, false);
            Ok(Flow::Next)
        }
        0xFB => {
            cpu.set_flag(FLAG_IF, true);
            Ok(Flow::Next)
        }
        0xFC => {
            cpu.set_flag(FLAG_DF, false);
            Ok(Flow::Next)
        }
        0xFD => {
            cpu.set_flag(FLAG_DF, true);
            Ok(Flow::Next)
        }

        // GRP4: INC/DEC r/m8.
        0xFE => {
            let modrm = ModRm::fetch(fetch, bus);
            let rm = decode::resolve_rm(cpu, bus, fetch, modrm, prefixes, Width::Byte);
            let a = read_op(cpu, bus, rm, Width::Byte);
            let v = match modrm.reg {
                0 => alu::inc(cpu, Width::Byte, a),
                1 => alu::dec(cpu, Width::Byte, a),
                _ => return Err(Exception::InvalidOpcode(opcode)),
            };
            write_op(cpu, bus, rm, Width::Byte, v);
            Ok(Flow::Next)
        }

        // GRP5: INC/DEC/CALL/JMP/PUSH on r/m16.
        0xFF => grp5(cpu, bus, fetch, prefixes),

        _ => Err(Exception::InvalidOpcode(opcode)),
    }
}

/// Two-byte opcodes: only the 16-bit-displacement Jcc forms exist here.
fn exec_0f(cpu: &mut CpuState, bus: &mut impl Bus, fetch: &mut Fetch) -> Result<Flow, Exception> {
    let second = fetch.u8(bus);
    match second {
        0x80..=0x8F => {
            let disp = fetch.u16(bus);
            if condition(cpu, second & 0xF) {
                cpu.set_ip(fetch.ip.wrapping_add(disp));
                Ok(Flow::Jump)
            } else {
                Ok(Flow::Next)
            }
        }
        _ => Err(Exception::InvalidOpcode(second)),
    }
}

fn loop_op(
    cpu: &mut CpuState,
    bus: &mut impl Bus,
    fetch: &mut Fetch,
    cond: impl Fn(&CpuState) -> bool,
) -> Result<Flow, Exception> {
    let disp = fetch.i8(bus);
    let cx = cpu.cx().wrapping_sub(1);
    cpu.set_cx(cx);
    if cx != 0 && cond(cpu) {
        cpu.set_ip(fetch.ip.wrapping_add(disp as u16));
        Ok(Flow::Jump)
    } else {
        Ok(Flow::Next)
    }
}

fn grp3(
    cpu: &mut CpuState,
    bus: &mut impl Bus,
    fetch: &mut Fetch,
    prefixes: &PrefixState,
    w: Width,
) -> Result<Flow, Exception> {
    let modrm = ModRm::fetch(fetch, bus);
    let rm = decode::resolve_rm(cpu, bus, fetch, modrm, prefixes, w);
    let a = read_op(cpu, bus, rm, w);

    match modrm.reg {
        0 | 1 => {
            let imm = match w {
                Width::Byte => fetch.u8(bus) as u64,
                _ => fetch.u16(bus) as u64,
            };
            alu::test(cpu, w, a, imm);
        }
        2 => {
            write_op(cpu, bus, rm, w, !a & w.mask());
        }
        3 => {
            let v = alu::neg(cpu, w, a);
            write_op(cpu, bus, rm, w, v);
        }
        4 => {
            // MUL: AX = AL * r/m8, or DX:AX = AX * r/m16.
            let m = acc(cpu, w);
            let product = alu::mul(cpu, w, m, a);
            write_product(cpu, w, product);
        }
        5 => {
            let m = acc(cpu, w);
            let product = alu::imul(cpu, w, m, a);
            write_product(cpu, w, product);
        }
        6 => {
            let (q, r) = alu::div(w, dividend(cpu, w), a)?;
            write_quotient(cpu, w, q, r);
        }
        7 => {
            let (q, r) = alu::idiv(w, dividend(cpu, w), a)?;
            write_quotient(cpu, w, q, r);
        }
        _ => unreachable!(),
    }
    Ok(Flow::Next)
}

fn grp5(
    cpu: &mut CpuState,
    bus: &mut impl Bus,
    fetch: &mut Fetch,
    prefixes: &PrefixState,
) -> Result<Flow, Exception> {
    let modrm = ModRm::fetch(fetch, bus);
    match modrm.reg {
        0 => {
            let rm = decode::resolve_rm(cpu, bus, fetch, modrm, prefixes, Width::Word);
            let a = read_op(cpu, bus, rm, Width::Word);
            let v = alu::inc(cpu, Width::Word, a);
            write_op(cpu, bus, rm, Width::Word, v);
            Ok(Flow::Next)
        }
        1 => {
            let rm = decode::resolve_rm(cpu, bus, fetch, modrm, prefixes, Width::Word);
            let a = read_op(cpu, bus, rm, Width::Word);
            let v = alu::dec(cpu, Width::Word, a);
            write_op(cpu, bus, rm, Width::Word, v);
            Ok(Flow::Next)
        }
        2 => {
            // CALL r/m16.
            let rm = decode::resolve_rm(cpu, bus, fetch, modrm, prefixes, Width::Word);
            let target = read_op(cpu, bus, rm, Width::Word) as u16;
            push16(cpu, bus, fetch.ip);
            cpu.set_ip(target);
            Ok(Flow::Jump)
        }
        3 => {
            // CALL FAR m16:16.
            let Operand::Mem(addr) =
                decode::resolve_rm(cpu, bus, fetch, modrm, prefixes, Width::Word)
            else {
                return Err(Exception::InvalidOpcode(0xFF));
            };
            let offset = bus.read_u16(addr);
            let segment = bus.read_u16(addr.wrapping_add(2));
            let cs = cpu.segment(Segment::CS);
            push16(cpu, bus, cs);
            push16(cpu, bus, fetch.ip);
            cpu.set_segment(Segment::CS, segment);
            cpu.set_ip(offset);
            Ok(Flow::Jump)
        }
        4 => {
            let rm = decode::resolve_rm(cpu, bus, fetch, modrm, prefixes, Width::Word);
            let target = read_op(cpu, bus, rm, Width::Word) as u16;
            cpu.set_ip(target);
            Ok(Flow::Jump)
        }
        5 => {
            let Operand::Mem(addr) =
                decode::resolve_rm(cpu, bus, fetch, modrm, prefixes, Width::Word)
            else {
                return Err(Exception::InvalidOpcode(0xFF));
            };
            let offset = bus.read_u16(addr);
            let segment = bus.read_u16(addr.wrapping_add(2));
            cpu.set_segment(Segment::CS, segment);
            cpu.set_ip(offset);
            Ok(Flow::Jump)
        }
        6 => {
            let rm = decode::resolve_rm(cpu, bus, fetch, modrm, prefixes, Width::Word);
            let v = read_op(cpu, bus, rm, Width::Word) as u16;
            push16(cpu, bus, v);
            Ok(Flow::Next)
        }
        _ => Err(Exception::InvalidOpcode(0xFF)),
    }
}

fn shift_group(
    cpu: &mut CpuState,
    bus: &mut impl Bus,
    rm: Operand,
    w: Width,
    reg_field: u8,
    count: u8,
) -> Result<(), Exception> {
    let kind = match reg_field {
        0 => ShiftKind::Rol,
        1 => ShiftKind::Ror,
        2 => ShiftKind::Rcl,
        3 => ShiftKind::Rcr,
        4 | 6 => ShiftKind::Shl,
        5 => ShiftKind::Shr,
        7 => ShiftKind::Sar,
        _ => unreachable!(),
    };
    let a = read_op(cpu, bus, rm, w);
    let v = alu::shift(cpu, w, kind, a, count);
    write_op(cpu, bus, rm, w, v);
    Ok(())
}

fn alu_family(
    cpu: &mut CpuState,
    bus: &mut impl Bus,
    fetch: &mut Fetch,
    prefixes: &PrefixState,
    op: AluOp,
    opcode: u8,
) -> Result<(), Exception> {
    let variant = opcode & 7;
    match variant {
        // r/m,r and r,r/m forms.
        0..=3 => {
            let byte = variant & 1 == 0;
            let w = if byte {
                Width::Byte
            } else if prefixes.operand_size {
                Width::Dword
            } else {
                Width::Word
            };
            let modrm = ModRm::fetch(fetch, bus);
            if w == Width::Dword && !modrm.is_register() {
                // Dword forms exist only for the register-aliasing logical ops.
                return Err(Exception::InvalidOpcode(opcode));
            }
            let rm = decode::resolve_rm(cpu, bus, fetch, modrm, prefixes, w);
            let reg = decode::reg_operand(modrm, w);

            if variant < 2 {
                let a = read_op(cpu, bus, rm, w);
                let b = cpu.read_reg(reg) as u64;
                if let Some(v) = alu_apply(cpu, op, w, a, b) {
                    write_op(cpu, bus, rm, w, v);
                }
            } else {
                let a = cpu.read_reg(reg) as u64;
                let b = read_op(cpu, bus, rm, w);
                if let Some(v) = alu_apply(cpu, op, w, a, b) {
                    cpu.write_reg(reg, v as u32);
                }
            }
            Ok(())
        }
        // AL,imm8.
        4 => {
            let imm = fetch.u8(bus) as u64;
            let a = cpu.al() as u64;
            if let Some(v) = alu_apply(cpu, op, Width::Byte, a, imm) {
                cpu.set_al(v as u8);
            }
            Ok(())
        }
        // AX,imm16.
        _ => {
            let imm = fetch.u16(bus) as u64;
            let a = cpu.ax() as u64;
            if let Some(v) = alu_apply(cpu, op, Width::Word, a, imm) {
                cpu.set_ax(v as u16);
            }
            Ok(())
        }
    }
}

/// Apply a binary ALU op; `None` means no writeback (CMP).
fn alu_apply(cpu: &mut CpuState, op: AluOp, w: Width, a: u64, b: u64) -> Option<u64> {
    match op {
        AluOp::Add => Some(alu::add(cpu, w, a, b)),
        AluOp::Or => Some(alu::or(cpu, w, a, b)),
        AluOp::Adc => Some(alu::adc(cpu, w, a, b)),
        AluOp::Sbb => Some(alu::sbb(cpu, w, a, b)),
        AluOp::And => Some(alu::and(cpu, w, a, b)),
        AluOp::Sub => Some(alu::sub(cpu, w, a, b)),
        AluOp::Xor => Some(alu::xor(cpu, w, a, b)),
        AluOp::Cmp => {
            alu::cmp(cpu, w, a, b);
            None
        }
    }
}

fn rm_reg(
    cpu: &mut CpuState,
    bus: &mut impl Bus,
    fetch: &mut Fetch,
    prefixes: &PrefixState,
    w: Width,
) -> (Operand, Register) {
    let modrm = ModRm::fetch(fetch, bus);
    let rm = decode::resolve_rm(cpu, bus, fetch, modrm, prefixes, w);
    (rm, decode::reg_operand(modrm, w))
}

fn read_op(cpu: &CpuState, bus: &mut impl Bus, op: Operand, w: Width) -> u64 {
    match op {
        Operand::Reg(r) => cpu.read_reg(r) as u64,
        Operand::Mem(addr) => match w {
            Width::Byte => bus.read_u8(addr) as u64,
            Width::Word => bus.read_u16(addr) as u64,
            Width::Dword => bus.read_u32(addr) as u64,
        },
    }
}

fn write_op(cpu: &mut CpuState, bus: &mut impl Bus, op: Operand, w: Width, value: u64) {
    match op {
        Operand::Reg(r) => cpu.write_reg(r, value as u32),
        Operand::Mem(addr) => match w {
            Width::Byte => bus.write_u8(addr, value as u8),
            Width::Word => bus.write_u16(addr, value as u16),
            Width::Dword => bus.write_u32(addr, value as u32),
        },
    }
}

fn moffs(cpu: &CpuState, prefixes: &PrefixState, offset: u16) -> u32 {
    let seg = prefixes.segment_override.unwrap_or(Segment::DS);
    linear(cpu.segment(seg), offset)
}

fn segment_from_reg(reg_field: u8) -> Segment {
    match reg_field & 3 {
        0 => Segment::ES,
        1 => Segment::CS,
        2 => Segment::SS,
        _ => Segment::DS,
    }
}

fn acc(cpu: &CpuState, w: Width) -> u64 {
    match w {
        Width::Byte => cpu.al() as u64,
        _ => cpu.ax() as u64,
    }
}

/// The double-width dividend: AX for byte ops, DX:AX for word ops.
fn dividend(cpu: &CpuState, w: Width) -> u64 {
    match w {
        Width::Byte => cpu.ax() as u64,
        _ => ((cpu.dx() as u64) << 16) | cpu.ax() as u64,
    }
}

fn write_product(cpu: &mut CpuState, w: Width, product: u64) {
    match w {
        Width::Byte => cpu.set_ax(product as u16),
        _ => {
            cpu.set_ax(product as u16);
            cpu.set_dx((product >> 16) as u16);
        }
    }
}

fn write_quotient(cpu: &mut CpuState, w: Width, quotient: u64, remainder: u64) {
    match w {
        Width::Byte => {
            cpu.set_al(quotient as u8);
            cpu.set_ah(remainder as u8);
        }
        _ => {
            cpu.set_ax(quotient as u16);
            cpu.set_dx(remainder as u16);
        }
    }
}

fn pusha(cpu: &mut CpuState, bus: &mut impl Bus) {
    let (ax, cx, dx, bx) = (cpu.ax(), cpu.cx(), cpu.dx(), cpu.bx());
    let (sp, bp, si, di) = (cpu.sp(), cpu.reg16(Register::BP), cpu.si(), cpu.di());
    push16(cpu, bus, ax);
    push16(cpu, bus, cx);
    push16(cpu, bus, dx);
    push16(cpu, bus, bx);
    push16(cpu, bus, sp);
    push16(cpu, bus, bp);
    push16(cpu, bus, si);
    push16(cpu, bus, di);
}

fn popa(cpu: &mut CpuState, bus: &mut impl Bus) {
    let di = pop16(cpu, bus);
    let si = pop16(cpu, bus);
    let bp = pop16(cpu, bus);
    let _sp = pop16(cpu, bus);
    let bx = pop16(cpu, bus);
    let dx = pop16(cpu, bus);
    let cx = pop16(cpu, bus);
    let ax = pop16(cpu, bus);
    cpu.set_di(di);
    cpu.set_si(si);
    cpu.write_reg(Register::BP, bp as u32);
    cpu.set_bx(bx);
    cpu.set_dx(dx);
    cpu.set_cx(cx);
    cpu.set_ax(ax);
}

fn condition(cpu: &CpuState, cc: u8) -> bool {
    let cf = cpu.flag(FLAG_CF);
    let zf = cpu.flag(FLAG_ZF);
    let sf = cpu.flag(FLAG_SF);
    let of = cpu.flag(FLAG_OF);
    let pf = cpu.flag(FLAG_PF);
    match cc & 0xF {
        0x0 => of,
        0x1 => !of,
        0x2 => cf,
        0x3 => !cf,
        0x4 => zf,
        0x5 => !zf,
        0x6 => cf || zf,
        0x7 => !cf && !zf,
        0x8 => sf,
        0x9 => !sf,
        0xA => pf,
        0xB => !pf,
        0xC => sf != of,
        0xD => sf == of,
        0xE => zf || sf != of,
        _ => !zf && sf == of,
    }
}

fn set_szp8(cpu: &mut CpuState, value: u8) {
    cpu.set_flag(FLAG_ZF, value == 0);
    cpu.set_flag(FLAG_SF, value & 0x80 != 0);
    cpu.set_flag(FLAG_PF, value.count_ones() % 2 == 0);
}

fn daa(cpu: &mut CpuState) {
    let old_al = cpu.al();
    let old_cf = cpu.cf();
    let mut al = old_al;
    let mut cf = false;
    if old_al & 0x0F > 9 || cpu.flag(FLAG_AF) {
        al = al.wrapping_add(6);
        cpu.set_flag(FLAG_AF, true);
    } else {
        cpu.set_flag(FLAG_AF, false);
    }
    if old_al > 0x99 || old_cf {
        al = al.wrapping_add(0x60);
        cf = true;
    }
    cpu.set_al(al);
    cpu.set_cf(cf);
    set_szp8(cpu, al);
}

fn das(cpu: &mut CpuState) {
    let old_al = cpu.al();
    let old_cf = cpu.cf();
    let mut al = old_al;
    let mut cf = false;
    if old_al & 0x0F > 9 || cpu.flag(FLAG_AF) {
        al = al.wrapping_sub(6);
        cpu.set_flag(FLAG_AF, true);
    } else {
        cpu.set_flag(FLAG_AF, false);
    }
    if old_al > 0x99 || old_cf {
        al = al.wrapping_sub(0x60);
        cf = true;
    }
    cpu.set_al(al);
    cpu.set_cf(cf);
    set_szp8(cpu, al);
}

fn aaa(cpu: &mut CpuState) {
    if cpu.al() & 0x0F > 9 || cpu.flag(FLAG_AF) {
        cpu.set_ax(cpu.ax().wrapping_add(0x106));
        cpu.set_flag(FLAG_AF, true);
        cpu.set_cf(true);
    } else {
        cpu.set_flag(FLAG_AF, false);
        cpu.set_cf(false);
    }
    cpu.set_al(cpu.al() & 0x0F);
}

fn aas(cpu: &mut CpuState) {
    if cpu.al() & 0x0F > 9 || cpu.flag(FLAG_AF) {
        cpu.set_ax(cpu.ax().wrapping_sub(6));
        cpu.set_ah(cpu.ah().wrapping_sub(1));
        cpu.set_flag(FLAG_AF, true);
        cpu.set_cf(true);
    } else {
        cpu.set_flag(FLAG_AF, false);
        cpu.set_cf(false);
    }
    cpu.set_al(cpu.al() & 0x0F);
}

