//! Black-box scenarios: assemble a short eBPF program, JIT it, run it,
//! and check the 64-bit value returned in R0.

mod common;

use common::*;
use ebpf_jit::{JitConfig, JitProgram};

fn run(insts: Vec<ebpf_core::Insn>) -> u64 {
    let _ = env_logger::try_init();
    let vm = TestVm::new(insts);
    let program = JitProgram::compile(&vm, &JitConfig::default()).expect("compile");
    unsafe { (program.entry())(std::ptr::null_mut(), 0) }
}

#[test]
fn mov_and_exit() {
    let insts = vec![mov64_imm(0, 42), exit()];
    assert_eq!(run(insts), 42);
}

#[test]
fn add_two_registers() {
    let insts = vec![mov64_imm(0, 10), mov64_imm(1, 20), add64_reg(0, 1), exit()];
    assert_eq!(run(insts), 30);
}

#[test]
fn div_by_zero_register_traps_at_runtime() {
    let before = div_zero_call_count();
    let insts = vec![
        mov64_imm(0, 100),
        mov64_imm(1, 0),
        div64_reg(0, 1),
        exit(),
    ];
    assert_eq!(run(insts), u64::MAX);
    assert!(div_zero_call_count() > before);
}

#[test]
fn div_by_zero_immediate_traps_at_translate_time() {
    let before = div_zero_call_count();
    let insts = vec![mov64_imm(0, 7), mov64_imm(1, 0), div64_imm(0, 0), exit()];
    assert_eq!(run(insts), u64::MAX);
    assert!(div_zero_call_count() > before);
}

#[test]
fn lddw_loads_a_full_64_bit_immediate() {
    let mut insts = lddw(0, 0x1122_3344_5566_7788).to_vec();
    insts.push(exit());
    assert_eq!(run(insts), 0x1122_3344_5566_7788);
}

#[test]
fn backward_branch_loop() {
    // R0 = 0; R1 = 5; loop: R0 += 1; R1 -= 1; if R1 != 0 goto loop; exit.
    let insts = vec![
        mov64_imm(0, 0),
        mov64_imm(1, 5),
        add64_imm(0, 1),
        sub64_imm(1, 1),
        jne_imm(1, 0, -3),
        exit(),
    ];
    assert_eq!(run(insts), 5);
}

#[test]
fn be16_byte_swap() {
    let insts = vec![mov64_imm(0, 0x1234), be(0, 16), exit()];
    assert_eq!(run(insts), 0x3412);
}

#[test]
fn be32_byte_swap() {
    let insts = vec![mov64_imm(0, 0x1122_3344u32 as i32), be(0, 32), exit()];
    assert_eq!(run(insts), 0x4433_2211);
}

#[test]
fn le_is_a_no_op_on_this_host() {
    let insts = vec![mov64_imm(0, 0x1234), le(0, 32), exit()];
    assert_eq!(run(insts), 0x1234);
}

#[test]
fn mod_uses_rdx_not_rax() {
    let insts = vec![mov64_imm(0, 17), mov64_imm(1, 5), mod64_reg(0, 1), exit()];
    assert_eq!(run(insts), 2);
}

#[test]
fn mul_discards_high_half() {
    let insts = vec![mov64_imm(0, 1_000_000), mov64_imm(1, 1_000_000), mul64_reg(0, 1), exit()];
    assert_eq!(run(insts), 1_000_000_000_000);
}

#[test]
fn div_reg_survives_rcx_resident_dst() {
    // R4 always maps to RCX under System V, the same register DIV/MOD
    // stage the divisor through; `dst` must be read out before that
    // staging happens.
    let insts = vec![
        mov64_imm(4, 100),
        mov64_imm(1, 5),
        div64_reg(4, 1),
        mov64_reg(0, 4),
        exit(),
    ];
    assert_eq!(run(insts), 20);
}

#[test]
fn div_reg_survives_rcx_resident_src() {
    // The divisor register itself is R4 (RCX) this time.
    let insts = vec![mov64_imm(0, 100), mov64_imm(4, 5), div64_reg(0, 4), exit()];
    assert_eq!(run(insts), 20);
}

#[test]
fn mod_reg_survives_rcx_resident_dst() {
    let insts = vec![
        mov64_imm(4, 17),
        mov64_imm(1, 5),
        mod64_reg(4, 1),
        mov64_reg(0, 4),
        exit(),
    ];
    assert_eq!(run(insts), 2);
}

#[test]
fn mul_reg_survives_rcx_resident_dst() {
    let insts = vec![
        mov64_imm(4, 1_000_000),
        mov64_imm(1, 1_000_000),
        mul64_reg(4, 1),
        mov64_reg(0, 4),
        exit(),
    ];
    assert_eq!(run(insts), 1_000_000_000_000);
}

#[test]
fn mul_does_not_clobber_an_rcx_resident_register_neither_operand_touches() {
    // Neither MUL operand is R4, but R4 (RCX under System V) must still
    // come out the other side unharmed: MUL stages RCX as scratch for the
    // multiplier regardless of which eBPF registers are actually involved.
    let insts = vec![
        mov64_imm(4, 777),
        mov64_imm(0, 6),
        mov64_imm(1, 2),
        mul64_reg(0, 1),
        mov64_reg(2, 4),
        mov64_reg(0, 2),
        exit(),
    ];
    assert_eq!(run(insts), 777);
}

#[test]
fn div_does_not_clobber_an_rcx_resident_register_neither_operand_touches() {
    let insts = vec![
        mov64_imm(4, 777),
        mov64_imm(0, 20),
        mov64_imm(1, 5),
        div64_reg(0, 1),
        mov64_reg(2, 4),
        mov64_reg(0, 2),
        exit(),
    ];
    assert_eq!(run(insts), 777);
}

#[test]
fn mod_does_not_clobber_an_rcx_resident_register_neither_operand_touches() {
    let insts = vec![
        mov64_imm(4, 777),
        mov64_imm(0, 17),
        mov64_imm(1, 5),
        mod64_reg(0, 1),
        mov64_reg(2, 4),
        mov64_reg(0, 2),
        exit(),
    ];
    assert_eq!(run(insts), 777);
}

#[test]
fn div_by_zero_register_traps_even_when_divisor_is_rcx_resident() {
    // The divisor (R4/RCX) being zero must still be caught by the
    // runtime TEST, not masked by the PC staged through some register.
    let before = div_zero_call_count();
    let insts = vec![mov64_imm(0, 100), mov64_imm(4, 0), div64_reg(0, 4), exit()];
    assert_eq!(run(insts), u64::MAX);
    assert!(div_zero_call_count() > before);
}

#[test]
fn neg_and_and_or_xor() {
    let insts = vec![
        mov64_imm(0, 5),
        neg64(0),
        and64_imm(0, 0xFF),
        or64_imm(0, 0x100),
        exit(),
    ];
    // -5 as u64 low byte is 0xFB; OR 0x100 sets bit 8.
    assert_eq!(run(insts), 0x1FB);
}

#[test]
fn shift_by_register_preserves_rcx_resident_value() {
    // R4 always maps to RCX under System V; use it as both the shift
    // amount source and a value that must survive the shift untouched.
    let insts = vec![
        mov64_imm(0, 1),
        mov64_imm(4, 3),
        lsh64_imm(0, 0), // no-op, just exercises the imm path first
        rsh64_reg(0, 4),
        mov64_reg(1, 4),
        add64_reg(0, 1),
        exit(),
    ];
    // R0 starts at 1, shifted right by 3 (R4) -> 0; plus R4 (3) -> 3.
    assert_eq!(run(insts), 3);
}

#[test]
fn shift_of_the_rcx_resident_register_itself() {
    // R4 (RCX) is the thing being shifted this time, by a count held in
    // R0 (RAX) -- the scratch-register save/restore path.
    let insts = vec![
        mov64_imm(4, 8),
        mov64_imm(0, 1),
        rsh64_reg(4, 0),
        mov64_reg(0, 4),
        exit(),
    ];
    assert_eq!(run(insts), 4);
}

#[test]
fn call_into_an_external_function() {
    unsafe extern "C" fn double_it(x: u64) -> u64 {
        x * 2
    }

    let insts = vec![mov64_imm(1, 21), call(0), exit()];
    let vm = TestVm::new(insts).with_ext_func(0, double_it as *const std::ffi::c_void);
    let program = JitProgram::compile(&vm, &JitConfig::default()).expect("compile");
    let result = unsafe { (program.entry())(std::ptr::null_mut(), 0) };
    assert_eq!(result, 42);
}

#[test]
fn jset_branches_on_bitwise_and() {
    let insts = vec![
        mov64_imm(0, 0),
        mov64_imm(1, 0b0110),
        jset_imm(1, 0b0010, 1),
        mov64_imm(0, 99),
        exit(),
    ];
    // bit 1 is set in R1, so the branch is taken and R0 stays 0.
    assert_eq!(run(insts), 0);
}

#[test]
fn jgt_register_comparison() {
    let insts = vec![
        mov64_imm(0, 10),
        mov64_imm(1, 3),
        mov64_imm(2, 5),
        jgt_reg(1, 2, 1),
        mov64_imm(0, 20),
        exit(),
    ];
    // R1 (3) is not > R2 (5), so the branch is not taken: R0 becomes 20.
    assert_eq!(run(insts), 20);
}
