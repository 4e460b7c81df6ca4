//! Flag-derivation properties checked against an independent reference over
//! full byte-width operand grids.

use cinder_cpu::interp::alu::{self, Width};
use cinder_cpu::state::{FLAG_CF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF};
use cinder_cpu::CpuState;

fn ref_parity_even(v: u8) -> bool {
    let mut bits = 0;
    for i in 0..8 {
        bits += (v >> i) & 1;
    }
    bits % 2 == 0
}

fn check_szp(cpu: &CpuState, result: u8) {
    assert_eq!(cpu.flag(FLAG_ZF), result == 0, "ZF for result {result:#04x}");
    assert_eq!(
        cpu.flag(FLAG_SF),
        result >> 7 == 1,
        "SF for result {result:#04x}"
    );
    assert_eq!(
        cpu.flag(FLAG_PF),
        ref_parity_even(result),
        "PF for result {result:#04x}"
    );
}

#[test]
fn add_matches_reference_over_full_byte_grid() {
    let mut cpu = CpuState::new();
    for a in 0..=255u16 {
        for b in 0..=255u16 {
            let r = alu::add(&mut cpu, Width::Byte, a as u64, b as u64) as u8;
            let wide = a + b;
            assert_eq!(r, wide as u8);
            assert_eq!(cpu.flag(FLAG_CF), wide > 0xFF, "CF for {a:#04x}+{b:#04x}");
            let sa = a as u8 as i8 as i16;
            let sb = b as u8 as i8 as i16;
            let signed = sa + sb;
            assert_eq!(
                cpu.flag(FLAG_OF),
                signed < -128 || signed > 127,
                "OF for {a:#04x}+{b:#04x}"
            );
            check_szp(&cpu, r);
        }
    }
}

#[test]
fn sub_matches_reference_over_full_byte_grid() {
    let mut cpu = CpuState::new();
    for a in 0..=255i16 {
        for b in 0..=255i16 {
            let r = alu::sub(&mut cpu, Width::Byte, a as u64, b as u64) as u8;
            assert_eq!(r, (a - b) as u8);
            assert_eq!(cpu.flag(FLAG_CF), b > a, "CF for {a:#04x}-{b:#04x}");
            let signed = (a as u8 as i8 as i16) - (b as u8 as i8 as i16);
            assert_eq!(
                cpu.flag(FLAG_OF),
                signed < -128 || signed > 127,
                "OF for {a:#04x}-{b:#04x}"
            );
            check_szp(&cpu, r);
        }
    }
}

#[test]
fn logic_ops_match_reference_over_full_byte_grid() {
    let mut cpu = CpuState::new();
    for a in 0..=255u8 {
        for b in [0x00, 0x01, 0x0F, 0x55, 0x80, 0xAA, 0xF0, 0xFF] {
            let r = alu::and(&mut cpu, Width::Byte, a as u64, b as u64) as u8;
            assert_eq!(r, a & b);
            assert!(!cpu.flag(FLAG_CF) && !cpu.flag(FLAG_OF));
            check_szp(&cpu, r);

            let r = alu::or(&mut cpu, Width::Byte, a as u64, b as u64) as u8;
            assert_eq!(r, a | b);
            check_szp(&cpu, r);

            let r = alu::xor(&mut cpu, Width::Byte, a as u64, b as u64) as u8;
            assert_eq!(r, a ^ b);
            check_szp(&cpu, r);
        }
    }
}

#[test]
fn adc_sbb_chain_carries_exactly() {
    // 32-bit addition decomposed into four byte-wide ADCs must match u32 math.
    let pairs = [
        (0x0000_0001u32, 0xFFFF_FFFFu32),
        (0x1234_5678, 0x9ABC_DEF0),
        (0x8000_0000, 0x80000000),
        (0x00FF_00FF, 0x0101_0101),
    ];
    for (x, y) in pairs {
        let mut cpu = CpuState::new();
        cpu.set_cf(false);
        let mut result = 0u32;
        for byte in 0..4 {
            let a = (x >> (8 * byte)) & 0xFF;
            let b = (y >> (8 * byte)) & 0xFF;
            let r = alu::adc(&mut cpu, Width::Byte, a as u64, b as u64);
            result |= (r as u32) << (8 * byte);
        }
        let (expect, carry) = x.overflowing_add(y);
        assert_eq!(result, expect);
        assert_eq!(cpu.cf(), carry);
    }
}

#[test]
fn cmp_is_sub_without_writeback() {
    let mut cpu = CpuState::new();
    for (a, b) in [(5u64, 5u64), (0, 1), (0x80, 0x7F), (0xFF, 0x00)] {
        alu::cmp(&mut cpu, Width::Byte, a, b);
        let cf_cmp = cpu.cf();
        let zf_cmp = cpu.zf();
        let _ = alu::sub(&mut cpu, Width::Byte, a, b);
        assert_eq!(cpu.cf(), cf_cmp);
        assert_eq!(cpu.zf(), zf_cmp);
    }
}
