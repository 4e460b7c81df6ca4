use cinder_cpu::state::{FLAG_CF, FLAG_OF, FLAG_SF, FLAG_ZF};
use cinder_cpu::{interrupts, step, Bus, CpuExit, CpuState, FlatMemory, Register, Segment};

fn boot(code: &[u8]) -> (CpuState, FlatMemory) {
    let mut mem = FlatMemory::new();
    assert!(mem.load(0x7C00, code));
    let mut cpu = CpuState::new();
    cpu.set_sp(0x7C00);
    (cpu, mem)
}

fn run_to_halt(cpu: &mut CpuState, mem: &mut FlatMemory) {
    for _ in 0..10_000 {
        match step(cpu, mem) {
            Ok(CpuExit::Continue) => {}
            Ok(CpuExit::Halted) => return,
            Ok(CpuExit::Interrupt(v)) => interrupts::deliver(cpu, mem, v),
            Err(e) => panic!("unexpected fault: {e}"),
        }
    }
    panic!("program did not halt");
}

#[test]
fn accumulator_arithmetic_and_byte_carry() {
    let code = [
        0x31, 0xC0, // xor ax,ax
        0xB0, 0x00, // mov al,0
        0x04, 0x03, // add al,3
        0x2C, 0x01, // sub al,1
        0x31, 0xDB, // xor bx,bx
        0x88, 0xC3, // mov bl,al
        0x81, 0xC3, 0x03, 0x00, // add bx,3
        0x89, 0xDA, // mov dx,bx
        0x80, 0xC2, 0xFF, // add dl,0xFF
        0x80, 0xC2, 0x01, // add dl,1
        0xF4, // hlt
    ];
    let (mut cpu, mut mem) = boot(&code);

    // Step to just after `add bx,3`: no carry anywhere yet.
    for _ in 0..7 {
        assert!(matches!(step(&mut cpu, &mut mem), Ok(CpuExit::Continue)));
    }
    assert_eq!(cpu.al(), 2);
    assert_eq!(cpu.bx(), 5);
    assert!(!cpu.cf());

    // `add dl,0xFF` carries out of the byte (5 + 255 = 0x104).
    step(&mut cpu, &mut mem).unwrap();
    step(&mut cpu, &mut mem).unwrap();
    assert_eq!(cpu.dl(), 0x04);
    assert!(cpu.cf());

    run_to_halt(&mut cpu, &mut mem);
    assert_eq!(cpu.dl(), 0x05);
}

#[test]
fn word_add_sets_carry_overflow_zero() {
    let code = [
        0xB8, 0x00, 0x80, // mov ax,0x8000
        0x05, 0x00, 0x80, // add ax,0x8000
        0xF4, // hlt
    ];
    let (mut cpu, mut mem) = boot(&code);
    run_to_halt(&mut cpu, &mut mem);

    assert_eq!(cpu.ax(), 0);
    assert!(cpu.flag(FLAG_CF));
    assert!(cpu.flag(FLAG_OF));
    assert!(cpu.flag(FLAG_ZF));
}

#[test]
fn inc_preserves_carry_dec_sets_sign() {
    let code = [
        0xB8, 0xFF, 0xFF, // mov ax,0xFFFF
        0x05, 0x01, 0x00, // add ax,1       ; CF=1, AX=0
        0x40, // inc ax                      ; CF preserved
        0x48, // dec ax
        0x48, // dec ax                      ; AX=0xFFFF
        0xF4, // hlt
    ];
    let (mut cpu, mut mem) = boot(&code);
    run_to_halt(&mut cpu, &mut mem);

    assert_eq!(cpu.ax(), 0xFFFF);
    assert!(cpu.cf());
    assert!(cpu.flag(FLAG_SF));
}

#[test]
fn group1_immediate_forms() {
    let code = [
        0xB8, 0x34, 0x12, // mov ax,0x1234
        0x83, 0xC8, 0x0F, // or ax,0x0F (sign-extended imm8)
        0x81, 0xE0, 0xFF, 0x00, // and ax,0x00FF
        0x3D, 0x3F, 0x00, // cmp ax,0x3F
        0xF4, // hlt
    ];
    let (mut cpu, mut mem) = boot(&code);
    run_to_halt(&mut cpu, &mut mem);

    assert_eq!(cpu.ax(), 0x3F);
    assert!(cpu.flag(FLAG_ZF));
    assert!(!cpu.cf());
}

#[test]
fn mul_div_round_trip() {
    let code = [
        0xB8, 0x39, 0x05, // mov ax,1337
        0xBB, 0x07, 0x00, // mov bx,7
        0xF7, 0xE3, // mul bx        ; DX:AX = 9359
        0xF7, 0xF3, // div bx        ; AX = 1337, DX = 0
        0xF4, // hlt
    ];
    let (mut cpu, mut mem) = boot(&code);
    run_to_halt(&mut cpu, &mut mem);

    assert_eq!(cpu.ax(), 1337);
    assert_eq!(cpu.dx(), 0);
}

#[test]
fn divide_by_zero_faults_with_advanced_ip() {
    let code = [
        0x31, 0xDB, // xor bx,bx
        0xF7, 0xF3, // div bx
        0xF4, // hlt
    ];
    let (mut cpu, mut mem) = boot(&code);
    assert!(matches!(step(&mut cpu, &mut mem), Ok(CpuExit::Continue)));
    let err = step(&mut cpu, &mut mem).unwrap_err();
    assert_eq!(err.vector(), 0);
    // The return IP is the instruction after the DIV.
    assert_eq!(cpu.ip(), 0x7C04);
}

#[test]
fn push_pop_is_balanced() {
    let code = [
        0xB8, 0xEF, 0xBE, // mov ax,0xBEEF
        0x50, // push ax
        0xBB, 0x11, 0x22, // mov bx,0x2211
        0x53, // push bx
        0x59, // pop cx
        0x5A, // pop dx
        0xF4, // hlt
    ];
    let (mut cpu, mut mem) = boot(&code);
    let sp_before = cpu.sp();
    run_to_halt(&mut cpu, &mut mem);

    assert_eq!(cpu.cx(), 0x2211);
    assert_eq!(cpu.dx(), 0xBEEF);
    assert_eq!(cpu.sp(), sp_before);
}

#[test]
fn pusha_popa_ordering() {
    let code = [
        0xB8, 0x01, 0x00, // mov ax,1
        0xB9, 0x02, 0x00, // mov cx,2
        0x60, // pusha
        0xB8, 0x00, 0x00, // mov ax,0
        0xB9, 0x00, 0x00, // mov cx,0
        0x61, // popa
        0xF4, // hlt
    ];
    let (mut cpu, mut mem) = boot(&code);
    let sp_before = cpu.sp();
    run_to_halt(&mut cpu, &mut mem);

    assert_eq!(cpu.ax(), 1);
    assert_eq!(cpu.cx(), 2);
    assert_eq!(cpu.sp(), sp_before);
}

#[test]
fn shifts_and_rotates() {
    let code = [
        0xB0, 0x81, // mov al,0x81
        0xD0, 0xC0, // rol al,1      ; AL=0x03, CF=1
        0xB3, 0x01, // mov bl,1
        0xB1, 0x04, // mov cl,4
        0xD2, 0xE3, // shl bl,cl     ; BL=0x10
        0xF4, // hlt
    ];
    let (mut cpu, mut mem) = boot(&code);
    run_to_halt(&mut cpu, &mut mem);

    assert_eq!(cpu.al(), 0x03);
    assert_eq!(cpu.bl(), 0x10);
}

#[test]
fn dword_logical_ops_on_register_aliases() {
    // The operand-size prefix promotes the register-aliasing logical ops to
    // 32 bits; everything else under 0x66 is an invalid opcode.
    let code = [
        0x66, 0x31, 0xC0, // xor eax,eax
        0xB8, 0xFF, 0xFF, // mov ax,0xFFFF
        0x66, 0x21, 0xC8, // and eax,ecx (ecx = 0)
        0xF4, // hlt
    ];
    let (mut cpu, mut mem) = boot(&code);
    run_to_halt(&mut cpu, &mut mem);
    assert_eq!(cpu.read_reg(Register::EAX), 0);
    assert!(cpu.zf());
}

#[test]
fn operand_size_prefix_on_arithmetic_is_invalid() {
    let code = [
        0x66, 0x01, 0xC0, // add eax,eax -- not part of the supported subset
    ];
    let (mut cpu, mut mem) = boot(&code);
    let err = step(&mut cpu, &mut mem).unwrap_err();
    assert_eq!(err.vector(), 6);
}

#[test]
fn xchg_and_xlat() {
    let code = [
        0xBB, 0x00, 0x02, // mov bx,0x200
        0xB0, 0x02, // mov al,2
        0xD7, // xlat          ; AL = [DS:BX+2]
        0x93, // xchg ax,bx
        0xF4, // hlt
    ];
    let (mut cpu, mut mem) = boot(&code);
    mem.write_u8(0x202, 0x77);
    run_to_halt(&mut cpu, &mut mem);

    assert_eq!(cpu.bx(), 0x0077);
    assert_eq!(cpu.ax(), 0x0200);
}

#[test]
fn segment_override_reads_through_es() {
    let code = [
        0xB8, 0x00, 0x10, // mov ax,0x1000
        0x8E, 0xC0, // mov es,ax
        0xBB, 0x10, 0x00, // mov bx,0x10
        0x26, 0x8A, 0x07, // mov al,es:[bx]
        0xF4, // hlt
    ];
    let (mut cpu, mut mem) = boot(&code);
    mem.write_u8(0x10010, 0x5A);
    run_to_halt(&mut cpu, &mut mem);
    assert_eq!(cpu.al(), 0x5A);
    assert_eq!(cpu.segment(Segment::ES), 0x1000);
}
