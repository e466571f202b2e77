//! The instruction translator: one pass over a verified eBPF instruction
//! stream that emits the equivalent x86-64 machine code.

use crate::error::TranslateError;
use crate::state::{JitState, JumpTarget};
use crate::x86_64::emitter::*;
use crate::x86_64::regs::{AbiDialect, Reg, RegisterMap};
use ebpf_core::{AluOp, Class, Insn, JmpOp, MemSize, Mode, Source, Vm};

/// Diagnostic format string for the division-by-zero trampoline. A
/// `'static` byte string lives in the binary's rodata for the process's
/// whole lifetime, so taking its address here is sound to bake into
/// generated code as an immediate.
static DIV_ZERO_FMT: &[u8] = b"jit: division by zero at pc %d\n\0";

/// Translate `vm.insts()` into x86-64 machine code written into
/// `state.buf`, using `map` to assign eBPF registers to host registers
/// and `abi`/`stack_size` to shape the prologue and epilogue.
///
/// On success, `state.exit_loc` and `state.div_by_zero_loc` are set and
/// every entry in `state.jumps` has a valid `offset_loc`; the caller is
/// expected to run [`crate::resolver::resolve`] next.
pub fn translate(
    state: &mut JitState,
    vm: &dyn Vm,
    map: &RegisterMap,
    abi: AbiDialect,
    stack_size: usize,
) -> Result<(), TranslateError> {
    emit_prologue(state, map, abi, stack_size);

    let insts = vm.insts();
    let num_insts = insts.len();
    let mut i = 0usize;
    while i < num_insts {
        let inst = insts[i];
        state.pc_locs[i] = state.buf.offset();
        log::trace!("ebpf-jit: pc {i} -> buffer offset {}", state.pc_locs[i]);

        let class = Class::from_opcode(inst.opcode).ok_or(TranslateError::UnknownOpcode {
            pc: i as u32,
            opcode: inst.opcode,
        })?;

        match class {
            Class::Alu | Class::Alu64 => {
                translate_alu(state, map, class, inst, i as u32)?;
            }
            Class::Jmp | Class::Jmp32 => {
                translate_jmp(state, map, vm, class, inst, i as u32, num_insts)?;
            }
            Class::Ld => {
                let mode = Mode::from_opcode(inst.opcode).ok_or(TranslateError::UnknownOpcode {
                    pc: i as u32,
                    opcode: inst.opcode,
                })?;
                if mode != Mode::Imm || i + 1 >= num_insts {
                    return Err(TranslateError::UnknownOpcode {
                        pc: i as u32,
                        opcode: inst.opcode,
                    });
                }
                // LDDW: combine this slot's imm (low 32) with the next
                // slot's imm (high 32) into one 64-bit immediate.
                let lo = inst.imm as u32 as u64;
                let hi = insts[i + 1].imm as u32 as u64;
                let imm64 = lo | (hi << 32);
                emit_load_imm(state.buf, map.get(inst.dst), imm64);
                state.pc_locs[i + 1] = state.pc_locs[i];
                i += 2;
                continue;
            }
            Class::Ldx => {
                let size = MemSize::from_opcode(inst.opcode);
                emit_load(
                    state.buf,
                    size,
                    map.get(inst.dst),
                    map.get(inst.src),
                    inst.offset as i32,
                );
            }
            Class::St => {
                let size = MemSize::from_opcode(inst.opcode);
                emit_store_imm32(
                    state.buf,
                    size,
                    map.get(inst.dst),
                    inst.offset as i32,
                    inst.imm,
                );
            }
            Class::Stx => {
                let size = MemSize::from_opcode(inst.opcode);
                emit_store(
                    state.buf,
                    size,
                    map.get(inst.src),
                    map.get(inst.dst),
                    inst.offset as i32,
                );
            }
        }

        i += 1;
    }

    emit_epilogue(state, map, abi, stack_size);
    emit_div_by_zero_trampoline(state, map, vm, abi);

    Ok(())
}

fn emit_prologue(state: &mut JitState, map: &RegisterMap, abi: AbiDialect, stack_size: usize) {
    for &reg in abi.callee_saved() {
        emit_push(state.buf, reg);
    }

    let r1 = map.get(1);
    let param0 = abi.first_param();
    if r1 != param0 {
        emit_mov_rr(state.buf, true, r1, param0);
    }

    let r10 = map.get(10);
    emit_mov_rr(state.buf, true, r10, Reg::Rsp);
    emit_arith_ri(state.buf, ArithOp::Sub, true, Reg::Rsp, stack_size as i32);
}

fn emit_epilogue(state: &mut JitState, map: &RegisterMap, abi: AbiDialect, stack_size: usize) {
    state.exit_loc = Some(state.buf.offset());

    let r0 = map.get(0);
    if r0 != Reg::Rax {
        emit_mov_rr(state.buf, true, Reg::Rax, r0);
    }
    emit_arith_ri(state.buf, ArithOp::Add, true, Reg::Rsp, stack_size as i32);

    for &reg in abi.callee_saved().iter().rev() {
        emit_pop(state.buf, reg);
    }
    emit_ret(state.buf);
}

fn emit_div_by_zero_trampoline(state: &mut JitState, map: &RegisterMap, vm: &dyn Vm, abi: AbiDialect) {
    state.div_by_zero_loc = Some(state.buf.offset());

    let args = abi.call_arg_regs();
    // R11 holds the faulting eBPF PC, loaded by emit_muldivmod just
    // before the jump that gets us here. Not RCX: RCX holds the real
    // divisor/multiplier right up to the trap, and both the register-form
    // and immediate-form zero checks may need `dst`/`src` registers that
    // alias RCX under either ABI dialect.
    if args[2] != Reg::R11 {
        emit_mov_rr(state.buf, true, args[2], Reg::R11);
    }

    emit_load_imm(state.buf, args[0], vm.error_sink() as u64);
    emit_load_imm(state.buf, args[1], DIV_ZERO_FMT.as_ptr() as u64);
    emit_call(state.buf, vm.error_printf() as usize as u64);

    let r0 = map.get(0);
    emit_load_imm(state.buf, r0, u64::MAX);

    let loc = emit_jmp(state.buf);
    state.add_jump(loc, JumpTarget::Exit);
}

fn translate_alu(
    state: &mut JitState,
    map: &RegisterMap,
    class: Class,
    inst: Insn,
    pc: u32,
) -> Result<(), TranslateError> {
    let rexw = class == Class::Alu64;
    let source = Source::from_opcode(inst.opcode);
    let op = AluOp::from_opcode(inst.opcode).ok_or(TranslateError::UnknownOpcode {
        pc,
        opcode: inst.opcode,
    })?;
    let dst = map.get(inst.dst);

    match op {
        AluOp::Add | AluOp::Sub | AluOp::Or | AluOp::And | AluOp::Xor => {
            let arith = match op {
                AluOp::Add => ArithOp::Add,
                AluOp::Sub => ArithOp::Sub,
                AluOp::Or => ArithOp::Or,
                AluOp::And => ArithOp::And,
                AluOp::Xor => ArithOp::Xor,
                _ => unreachable!(),
            };
            match source {
                Source::Reg => emit_arith_rr(state.buf, arith, rexw, dst, map.get(inst.src)),
                Source::Imm => emit_arith_ri(state.buf, arith, rexw, dst, inst.imm),
            }
        }
        AluOp::Mov => match source {
            Source::Reg => emit_mov_rr(state.buf, rexw, dst, map.get(inst.src)),
            Source::Imm => emit_mov_ri(state.buf, rexw, dst, inst.imm),
        },
        AluOp::Neg => emit_neg(state.buf, rexw, dst),
        AluOp::Mul | AluOp::Div | AluOp::Mod => {
            emit_muldivmod(state, map, op, rexw, source, inst, pc);
        }
        AluOp::Lsh | AluOp::Rsh | AluOp::Arsh => {
            let shift = match op {
                AluOp::Lsh => ShiftOp::Shl,
                AluOp::Rsh => ShiftOp::Shr,
                AluOp::Arsh => ShiftOp::Sar,
                _ => unreachable!(),
            };
            match source {
                Source::Imm => emit_shift_ri(state.buf, shift, rexw, dst, inst.imm as u8),
                Source::Reg => emit_shift_by_reg(state.buf, shift, rexw, dst, map.get(inst.src)),
            }
        }
        AluOp::End => translate_endian(state, source, inst, dst),
    }

    Ok(())
}

/// `LSH/RSH/ARSH dst, src`: the shift count must sit in CL. R11 is used
/// as a scratch slot when `dst` itself is RCX, since clobbering RCX
/// with the count would otherwise destroy the value being shifted
/// before the shift executes.
fn emit_shift_by_reg(buf: &mut crate::code_buffer::CodeBuffer, op: ShiftOp, rexw: bool, dst: Reg, count: Reg) {
    if count == Reg::Rcx {
        emit_shift_cl(buf, op, rexw, dst);
        return;
    }

    if dst == Reg::Rcx {
        emit_push(buf, Reg::R11);
        emit_mov_rr(buf, true, Reg::R11, Reg::Rcx);
        emit_mov_rr(buf, true, Reg::Rcx, count);
        emit_shift_cl(buf, op, rexw, Reg::R11);
        emit_mov_rr(buf, true, Reg::Rcx, Reg::R11);
        emit_pop(buf, Reg::R11);
        return;
    }

    emit_push(buf, Reg::Rcx);
    emit_mov_rr(buf, true, Reg::Rcx, count);
    emit_shift_cl(buf, op, rexw, dst);
    emit_pop(buf, Reg::Rcx);
}

fn translate_endian(state: &mut JitState, source: Source, inst: Insn, dst: Reg) {
    // `Source::Imm` (LE) carries the eBPF opcode's to-little-endian bit;
    // on a little-endian host this is always a no-op. `Source::Reg`
    // (BE) requires an actual byte-order flip.
    if source == Source::Imm {
        return;
    }
    match inst.imm {
        16 => {
            emit_bswap(state.buf, false, dst);
            emit_shift_ri(state.buf, ShiftOp::Shr, false, dst, 16);
        }
        32 => emit_bswap(state.buf, false, dst),
        64 => emit_bswap(state.buf, true, dst),
        _ => {}
    }
}

/// DIV/MUL/MOD: x86-64 forces the dividend/multiplicand through RAX and
/// the remainder/high-half through RDX, independent of the eBPF `dst`.
fn emit_muldivmod(
    state: &mut JitState,
    map: &RegisterMap,
    op: AluOp,
    rexw: bool,
    source: Source,
    inst: Insn,
    pc: u32,
) {
    let dst = map.get(inst.dst);
    let is_div_or_mod = matches!(op, AluOp::Div | AluOp::Mod);

    if is_div_or_mod {
        match source {
            Source::Imm if inst.imm == 0 => {
                // Translate-time zero check: the immediate divisor is
                // known to be zero, so there is nothing to TEST at
                // runtime. Jump straight to the trap, deliberately not
                // replicating the reference JIT's runtime TEST against
                // an unrelated register for this case. The trampoline
                // still needs the faulting PC, so stash it in R11 rather
                // than RCX: `dst` may be RCX-resident (SystemV's R4,
                // Win64's R1) and this jump is unconditional.
                emit_load_imm(state.buf, Reg::R11, pc as u64);
                let loc = emit_jmp(state.buf);
                state.add_jump(loc, JumpTarget::DivByZero);
                return;
            }
            Source::Imm => {}
            Source::Reg => {
                let src = map.get(inst.src);
                // PC goes in R11, never RCX: `src` itself may be
                // RCX-resident (SystemV's R4, Win64's R1). Loading the PC
                // into RCX before the TEST would both test the PC instead
                // of the real divisor and, on the fall-through path,
                // leave RCX holding the PC instead of `src`'s value.
                emit_load_imm(state.buf, Reg::R11, pc as u64);
                emit_test_rr(state.buf, rexw, src, src);
                let loc = emit_jcc(state.buf, X86Cond::Je);
                state.add_jump(loc, JumpTarget::DivByZero);
            }
        }
    }

    let save_rax = dst != Reg::Rax;
    let save_rdx = dst != Reg::Rdx;
    // RCX is clobbered below regardless of `source` (loaded with `imm`, or
    // moved from `src` when `src` isn't already RCX) even when neither `dst`
    // nor `src` is the eBPF register resident there (SystemV's R4, Win64's
    // R1). Unless `dst` itself is RCX -- in which case the writeback below
    // overwrites it with the result on purpose -- its prior value must
    // survive this instruction the same way `save_rax`/`save_rdx` do.
    let save_rcx = dst != Reg::Rcx;
    if save_rax {
        emit_push(state.buf, Reg::Rax);
    }
    if save_rdx {
        emit_push(state.buf, Reg::Rdx);
    }
    if save_rcx {
        emit_push(state.buf, Reg::Rcx);
    }

    // Read `dst` into RAX before RCX is loaded with the divisor/multiplier
    // below: `dst` may itself be RCX-resident (SystemV's R4, Win64's R1),
    // and loading RCX first would clobber its value before it's read.
    emit_mov_rr(state.buf, true, Reg::Rax, dst);

    match source {
        Source::Imm => emit_load_imm(state.buf, Reg::Rcx, inst.imm as i64 as u64),
        Source::Reg => {
            let src = map.get(inst.src);
            if src != Reg::Rcx {
                emit_mov_rr(state.buf, true, Reg::Rcx, src);
            }
        }
    }

    if is_div_or_mod {
        emit_arith_rr(state.buf, ArithOp::Xor, false, Reg::Rdx, Reg::Rdx);
    }

    match op {
        AluOp::Mul => emit_mul(state.buf, rexw, Reg::Rcx),
        AluOp::Div | AluOp::Mod => emit_div(state.buf, rexw, Reg::Rcx),
        _ => unreachable!(),
    }

    match op {
        AluOp::Mod => {
            if dst != Reg::Rdx {
                emit_mov_rr(state.buf, true, dst, Reg::Rdx);
            }
        }
        AluOp::Mul | AluOp::Div => {
            if dst != Reg::Rax {
                emit_mov_rr(state.buf, true, dst, Reg::Rax);
            }
        }
        _ => unreachable!(),
    }

    if save_rcx {
        emit_pop(state.buf, Reg::Rcx);
    }
    if save_rdx {
        emit_pop(state.buf, Reg::Rdx);
    }
    if save_rax {
        emit_pop(state.buf, Reg::Rax);
    }
}

fn translate_jmp(
    state: &mut JitState,
    map: &RegisterMap,
    vm: &dyn Vm,
    class: Class,
    inst: Insn,
    pc: u32,
    num_insts: usize,
) -> Result<(), TranslateError> {
    let op = JmpOp::from_opcode(inst.opcode).ok_or(TranslateError::UnknownOpcode {
        pc,
        opcode: inst.opcode,
    })?;

    match op {
        JmpOp::Exit => {
            if pc as usize + 1 != num_insts {
                let loc = emit_jmp(state.buf);
                state.add_jump(loc, JumpTarget::Exit);
            }
            // Otherwise: fall through directly into the epilogue.
        }
        JmpOp::Call => translate_call(state, map, vm, inst, pc)?,
        JmpOp::Ja => {
            let target = inst.branch_target(pc);
            let loc = emit_jmp(state.buf);
            state.add_jump(loc, JumpTarget::Pc(target));
        }
        _ => translate_conditional(state, map, class, op, inst, pc),
    }

    Ok(())
}

fn translate_call(
    state: &mut JitState,
    map: &RegisterMap,
    vm: &dyn Vm,
    inst: Insn,
    pc: u32,
) -> Result<(), TranslateError> {
    let index = inst.imm as u8;
    let func = vm
        .ext_funcs()
        .get(index as usize)
        .copied()
        .flatten()
        .ok_or(TranslateError::UnknownExtFunc { pc, index })?;

    emit_call(state.buf, func.0 as u64);

    if vm.unwind_stack_extension_index() == Some(index) {
        let r0 = map.get(0);
        emit_test_rr(state.buf, true, r0, r0);
        let loc = emit_jcc(state.buf, X86Cond::Je);
        state.add_jump(loc, JumpTarget::Exit);
    }

    Ok(())
}

fn translate_conditional(
    state: &mut JitState,
    map: &RegisterMap,
    class: Class,
    op: JmpOp,
    inst: Insn,
    pc: u32,
) {
    // JMP operates on the full 64-bit registers; JMP32 compares only
    // the low 32 bits, per the eBPF class split.
    let rexw = class == Class::Jmp;
    let dst = map.get(inst.dst);
    let source = Source::from_opcode(inst.opcode);

    if op == JmpOp::Jset {
        match source {
            Source::Reg => emit_test_rr(state.buf, rexw, dst, map.get(inst.src)),
            Source::Imm => emit_test_ri(state.buf, rexw, dst, inst.imm),
        }
    } else {
        match source {
            Source::Reg => emit_arith_rr(state.buf, ArithOp::Cmp, rexw, dst, map.get(inst.src)),
            Source::Imm => emit_arith_ri(state.buf, ArithOp::Cmp, rexw, dst, inst.imm),
        }
    }

    let cond = condition_code(op);
    let target = inst.branch_target(pc);
    let loc = emit_jcc(state.buf, cond);
    state.add_jump(loc, JumpTarget::Pc(target));
}

fn condition_code(op: JmpOp) -> X86Cond {
    match op {
        JmpOp::Jeq => X86Cond::Je,
        JmpOp::Jne => X86Cond::Jne,
        JmpOp::Jgt => X86Cond::Ja,
        JmpOp::Jge => X86Cond::Jae,
        JmpOp::Jlt => X86Cond::Jb,
        JmpOp::Jle => X86Cond::Jbe,
        JmpOp::Jset => X86Cond::Jne,
        JmpOp::Jsgt => X86Cond::Jg,
        JmpOp::Jsge => X86Cond::Jge,
        JmpOp::Jslt => X86Cond::Jl,
        JmpOp::Jsle => X86Cond::Jle,
        JmpOp::Ja | JmpOp::Call | JmpOp::Exit => unreachable!("handled by translate_jmp"),
    }
}
