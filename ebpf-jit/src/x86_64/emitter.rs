#![allow(non_upper_case_globals)]

use crate::code_buffer::CodeBuffer;
use crate::x86_64::regs::Reg;
use ebpf_core::MemSize;

// -- Prefix flags --

pub const P_EXT: u32 = 0x100; // 0x0F prefix
pub const P_DATA16: u32 = 0x400; // 0x66 prefix
pub const P_REXW: u32 = 0x1000; // REX.W = 1
pub const P_REXB_R: u32 = 0x2000; // REG field as byte register
pub const P_REXB_RM: u32 = 0x4000; // R/M field as byte register

// -- Opcode constants --

pub const OPC_ARITH_EvIb: u32 = 0x83;
pub const OPC_ARITH_EvIz: u32 = 0x81;
pub const OPC_ARITH_GvEv: u32 = 0x03;

pub const OPC_SHIFT_1: u32 = 0xD1;
pub const OPC_SHIFT_Ib: u32 = 0xC1;
pub const OPC_SHIFT_cl: u32 = 0xD3;

pub const OPC_MOVB_EvGv: u32 = 0x88;
pub const OPC_MOVL_EvGv: u32 = 0x89;
pub const OPC_MOVL_GvEv: u32 = 0x8B;
pub const OPC_MOVB_EvIz: u32 = 0xC6;
pub const OPC_MOVL_EvIz: u32 = 0xC7;
pub const OPC_MOVL_Iv: u32 = 0xB8;

pub const OPC_MOVZBL: u32 = 0xB6 | P_EXT;
pub const OPC_MOVZWL: u32 = 0xB7 | P_EXT;

pub const OPC_JCC_long: u32 = 0x80 | P_EXT;
pub const OPC_JMP_long: u32 = 0xE9;
pub const OPC_CALL_Jz: u32 = 0xE8;

pub const OPC_BSWAP: u32 = 0xC8 | P_EXT;

pub const OPC_TESTL: u32 = 0x85;

pub const OPC_GRP3_Ev: u32 = 0xF7;
pub const OPC_GRP5: u32 = 0xFF;

pub const OPC_PUSH_r32: u32 = 0x50;
pub const OPC_POP_r32: u32 = 0x58;
pub const OPC_RET: u32 = 0xC3;

// -- Sub-operation enums --

/// Arithmetic sub-opcodes (the /r field of 0x81/0x83/0x01/0x03).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ArithOp {
    Add = 0,
    Or = 1,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

/// Shift sub-opcodes (the /r field of 0xC1/0xD1/0xD3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShiftOp {
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

/// Group 3 extension codes (the /r field of 0xF6/0xF7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Ext3Op {
    Neg = 3,
    Mul = 4,
    Div = 6,
}

/// Group 5 extension codes (the /r field of 0xFF).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Ext5Op {
    CallN = 2,
    JmpN = 4,
}

/// x86 condition codes for `Jcc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum X86Cond {
    Jb = 0x2,
    Jae = 0x3,
    Je = 0x4,
    Jne = 0x5,
    Jbe = 0x6,
    Ja = 0x7,
    Jl = 0xC,
    Jge = 0xD,
    Jle = 0xE,
    Jg = 0xF,
}

#[inline]
fn rexw_flag(rexw: bool) -> u32 {
    if rexw {
        P_REXW
    } else {
        0
    }
}

/// Emit opcode with REX prefix. `r` is the reg field, `rm` is the r/m
/// field; both are raw register numbers (0-15), 0 when unused.
pub fn emit_opc(buf: &mut CodeBuffer, opc: u32, r: u8, rm: u8) {
    let mut rex: u8 = 0;
    if opc & P_REXW != 0 {
        rex |= 0x08;
    }
    if r >= 8 {
        rex |= 0x04;
    }
    if rm >= 8 {
        rex |= 0x01;
    }
    if rex == 0 && ((opc & P_REXB_R != 0 && r >= 4) || (opc & P_REXB_RM != 0 && rm >= 4)) {
        rex = 0x40;
    }

    if opc & P_DATA16 != 0 {
        buf.emit_u8(0x66);
    }
    if rex != 0 {
        buf.emit_u8(0x40 | rex);
    }
    if opc & P_EXT != 0 {
        buf.emit_u8(0x0F);
    }
    buf.emit_u8(opc as u8);
}

/// Emit opcode + ModR/M for a register-register operation.
pub fn emit_modrm(buf: &mut CodeBuffer, opc: u32, r: Reg, rm: Reg) {
    emit_opc(buf, opc, r as u8, rm as u8);
    buf.emit_u8(0xC0 | (r.low3() << 3) | rm.low3());
}

/// Emit opcode + ModR/M with a `/r` group extension in place of a register.
pub fn emit_modrm_ext(buf: &mut CodeBuffer, opc: u32, ext: u8, rm: Reg) {
    emit_opc(buf, opc, ext, rm as u8);
    buf.emit_u8(0xC0 | (ext << 3) | rm.low3());
}

/// Emit opcode + ModR/M + displacement for `[base + offset]`.
///
/// RBP/R13 always need an explicit disp8 even for offset 0 (mod=00 with
/// that r/m encoding means RIP-relative instead); RSP/R12 always need a
/// SIB byte since r/m=100 is the SIB escape, not a plain base register.
pub fn emit_modrm_offset(buf: &mut CodeBuffer, opc: u32, r: Reg, base: Reg, offset: i32) {
    emit_opc(buf, opc, r as u8, base as u8);

    let r3 = r.low3();
    let b3 = base.low3();

    if offset == 0 && b3 != 5 {
        if b3 == 4 {
            buf.emit_u8((r3 << 3) | 0x04);
            buf.emit_u8(0x24);
        } else {
            buf.emit_u8((r3 << 3) | b3);
        }
    } else if (-128..=127).contains(&offset) {
        if b3 == 4 {
            buf.emit_u8(0x44 | (r3 << 3));
            buf.emit_u8(0x24);
        } else {
            buf.emit_u8(0x40 | (r3 << 3) | b3);
        }
        buf.emit_u8(offset as u8);
    } else {
        if b3 == 4 {
            buf.emit_u8(0x84 | (r3 << 3));
            buf.emit_u8(0x24);
        } else {
            buf.emit_u8(0x80 | (r3 << 3) | b3);
        }
        buf.emit_u32(offset as u32);
    }
}

/// Same as [`emit_modrm_offset`] but the reg field is a `/r` group extension.
pub fn emit_modrm_ext_offset(buf: &mut CodeBuffer, opc: u32, ext: u8, base: Reg, offset: i32) {
    emit_opc(buf, opc, ext, base as u8);
    let b3 = base.low3();

    if offset == 0 && b3 != 5 {
        if b3 == 4 {
            buf.emit_u8((ext << 3) | 0x04);
            buf.emit_u8(0x24);
        } else {
            buf.emit_u8((ext << 3) | b3);
        }
    } else if (-128..=127).contains(&offset) {
        if b3 == 4 {
            buf.emit_u8(0x44 | (ext << 3));
            buf.emit_u8(0x24);
        } else {
            buf.emit_u8(0x40 | (ext << 3) | b3);
        }
        buf.emit_u8(offset as u8);
    } else {
        if b3 == 4 {
            buf.emit_u8(0x84 | (ext << 3));
            buf.emit_u8(0x24);
        } else {
            buf.emit_u8(0x80 | (ext << 3) | b3);
        }
        buf.emit_u32(offset as u32);
    }
}

// -- Arithmetic --

/// Emit `ADD/OR/AND/SUB/XOR/CMP dst, src` (register-register).
pub fn emit_arith_rr(buf: &mut CodeBuffer, op: ArithOp, rexw: bool, dst: Reg, src: Reg) {
    let opc = OPC_ARITH_GvEv | (((op as u32) << 3) & 0x38) | rexw_flag(rexw);
    emit_modrm(buf, opc, dst, src);
}

/// Emit `ADD/OR/AND/SUB/XOR/CMP dst, imm` (auto-selects imm8 vs imm32).
pub fn emit_arith_ri(buf: &mut CodeBuffer, op: ArithOp, rexw: bool, dst: Reg, imm: i32) {
    let w = rexw_flag(rexw);
    if (-128..=127).contains(&imm) {
        emit_modrm_ext(buf, OPC_ARITH_EvIb | w, op as u8, dst);
        buf.emit_u8(imm as u8);
    } else {
        emit_modrm_ext(buf, OPC_ARITH_EvIz | w, op as u8, dst);
        buf.emit_u32(imm as u32);
    }
}

/// Emit `TEST r1, r2`.
pub fn emit_test_rr(buf: &mut CodeBuffer, rexw: bool, r1: Reg, r2: Reg) {
    emit_modrm(buf, OPC_TESTL | rexw_flag(rexw), r1, r2);
}

/// Emit `TEST reg, imm32`.
pub fn emit_test_ri(buf: &mut CodeBuffer, rexw: bool, reg: Reg, imm: i32) {
    emit_modrm_ext(buf, OPC_GRP3_Ev | rexw_flag(rexw), 0, reg);
    buf.emit_u32(imm as u32);
}

/// Emit `NEG reg`.
pub fn emit_neg(buf: &mut CodeBuffer, rexw: bool, reg: Reg) {
    emit_modrm_ext(buf, OPC_GRP3_Ev | rexw_flag(rexw), Ext3Op::Neg as u8, reg);
}

// -- Shifts --

/// Emit `SHL/SHR/SAR dst, imm8`.
pub fn emit_shift_ri(buf: &mut CodeBuffer, op: ShiftOp, rexw: bool, dst: Reg, imm: u8) {
    let w = rexw_flag(rexw);
    if imm == 1 {
        emit_modrm_ext(buf, OPC_SHIFT_1 | w, op as u8, dst);
    } else {
        emit_modrm_ext(buf, OPC_SHIFT_Ib | w, op as u8, dst);
        buf.emit_u8(imm);
    }
}

/// Emit `SHL/SHR/SAR dst, CL`.
pub fn emit_shift_cl(buf: &mut CodeBuffer, op: ShiftOp, rexw: bool, dst: Reg) {
    emit_modrm_ext(buf, OPC_SHIFT_cl | rexw_flag(rexw), op as u8, dst);
}

// -- Data movement --

/// Emit `MOV dst, src` (32- or 64-bit register-register move).
pub fn emit_mov_rr(buf: &mut CodeBuffer, rexw: bool, dst: Reg, src: Reg) {
    if dst == src {
        return;
    }
    emit_modrm(buf, OPC_MOVL_EvGv | rexw_flag(rexw), src, dst);
}

/// Emit `MOV dst, imm32`: zero-extending for the 32-bit form, sign-extending
/// to 64 bits for the REX.W form. This is the regular `MOV`/`MOV64` opcode
/// encoding, distinct from the 10-byte `MOVABS` used for full 64-bit
/// immediates (see [`emit_load_imm`]).
pub fn emit_mov_ri(buf: &mut CodeBuffer, rexw: bool, dst: Reg, imm: i32) {
    emit_modrm_ext(buf, OPC_MOVL_EvIz | rexw_flag(rexw), 0, dst);
    buf.emit_u32(imm as u32);
}

/// Emit a 64-bit absolute immediate load (`MOVABS reg, imm64`), or the
/// smaller `XOR reg, reg` when the immediate is zero.
pub fn emit_load_imm(buf: &mut CodeBuffer, reg: Reg, val: u64) {
    if val == 0 {
        emit_modrm(buf, 0x31, reg, reg);
    } else {
        emit_opc(buf, (OPC_MOVL_Iv + reg.low3() as u32) | P_REXW, 0, reg as u8);
        buf.emit_u64(val);
    }
}

/// Emit `BSWAP reg` (32- or 64-bit).
pub fn emit_bswap(buf: &mut CodeBuffer, rexw: bool, reg: Reg) {
    emit_opc(buf, (OPC_BSWAP + reg.low3() as u32) | rexw_flag(rexw), 0, reg as u8);
}

// -- Memory --

/// Emit a zero-extending load `dst <- [base + offset]` of the given width.
pub fn emit_load(buf: &mut CodeBuffer, size: MemSize, dst: Reg, base: Reg, offset: i32) {
    match size {
        MemSize::B => emit_modrm_offset(buf, OPC_MOVZBL, dst, base, offset),
        MemSize::H => emit_modrm_offset(buf, OPC_MOVZWL, dst, base, offset),
        MemSize::W => emit_modrm_offset(buf, OPC_MOVL_GvEv, dst, base, offset),
        MemSize::Dw => emit_modrm_offset(buf, OPC_MOVL_GvEv | P_REXW, dst, base, offset),
    }
}

/// Emit a store `[base + offset] <- src` of the given width.
pub fn emit_store(buf: &mut CodeBuffer, size: MemSize, src: Reg, base: Reg, offset: i32) {
    match size {
        MemSize::B => emit_modrm_offset(buf, OPC_MOVB_EvGv | P_REXB_R, src, base, offset),
        MemSize::H => emit_modrm_offset(buf, OPC_MOVL_EvGv | P_DATA16, src, base, offset),
        MemSize::W => emit_modrm_offset(buf, OPC_MOVL_EvGv, src, base, offset),
        MemSize::Dw => emit_modrm_offset(buf, OPC_MOVL_EvGv | P_REXW, src, base, offset),
    }
}

/// Emit a store-immediate `[base + offset] <- imm32` (sign-extended for
/// the 64-bit width) of the given width.
pub fn emit_store_imm32(buf: &mut CodeBuffer, size: MemSize, base: Reg, offset: i32, imm: i32) {
    match size {
        MemSize::B => {
            emit_modrm_ext_offset(buf, OPC_MOVB_EvIz, 0, base, offset);
            buf.emit_u8(imm as u8);
        }
        MemSize::H => {
            emit_modrm_ext_offset(buf, OPC_MOVL_EvIz | P_DATA16, 0, base, offset);
            buf.emit_u32((imm as u16) as u32);
        }
        MemSize::W => {
            emit_modrm_ext_offset(buf, OPC_MOVL_EvIz, 0, base, offset);
            buf.emit_u32(imm as u32);
        }
        MemSize::Dw => {
            emit_modrm_ext_offset(buf, OPC_MOVL_EvIz | P_REXW, 0, base, offset);
            buf.emit_u32(imm as u32);
        }
    }
}

// -- Multiply / divide --

/// Emit single-operand unsigned `MUL reg`: `RDX:RAX = RAX * reg`.
pub fn emit_mul(buf: &mut CodeBuffer, rexw: bool, reg: Reg) {
    emit_modrm_ext(buf, OPC_GRP3_Ev | rexw_flag(rexw), Ext3Op::Mul as u8, reg);
}

/// Emit unsigned `DIV reg`: `RAX = RDX:RAX / reg`, `RDX = RDX:RAX % reg`.
pub fn emit_div(buf: &mut CodeBuffer, rexw: bool, reg: Reg) {
    emit_modrm_ext(buf, OPC_GRP3_Ev | rexw_flag(rexw), Ext3Op::Div as u8, reg);
}

// -- Branches and calls --

/// Emit `Jcc rel32` with a placeholder zero displacement; returns the
/// buffer offset of the 4-byte displacement field for later patching.
pub fn emit_jcc(buf: &mut CodeBuffer, cond: X86Cond) -> usize {
    emit_opc(buf, OPC_JCC_long + (cond as u32), 0, 0);
    let loc = buf.offset();
    buf.emit_u32(0);
    loc
}

/// Emit `JMP rel32` with a placeholder zero displacement; returns the
/// buffer offset of the displacement field.
pub fn emit_jmp(buf: &mut CodeBuffer) -> usize {
    buf.emit_u8(OPC_JMP_long as u8);
    let loc = buf.offset();
    buf.emit_u32(0);
    loc
}

/// Emit a call to a known absolute host address: a direct `CALL rel32`
/// when the displacement fits in 32 bits, otherwise a scratch-register
/// load (R11) followed by an indirect call. Unlike `emit_jmp`/`emit_jcc`,
/// the target is already known (an `ext_funcs[]` entry or a helper
/// function's address), so the displacement is computed and written
/// immediately rather than deferred to the resolver.
pub fn emit_call(buf: &mut CodeBuffer, target_addr: u64) {
    let after = buf.offset() as i64 + 5;
    let rel = target_addr as i64 - (buf.base_ptr() as i64 + after);
    if (i32::MIN as i64..=i32::MAX as i64).contains(&rel) {
        buf.emit_u8(OPC_CALL_Jz as u8);
        buf.emit_u32(rel as u32);
    } else {
        emit_load_imm(buf, Reg::R11, target_addr);
        emit_call_reg(buf, Reg::R11);
    }
}

/// Emit indirect `CALL reg`.
pub fn emit_call_reg(buf: &mut CodeBuffer, reg: Reg) {
    emit_modrm_ext(buf, OPC_GRP5, Ext5Op::CallN as u8, reg);
}

/// Emit indirect `JMP reg`.
pub fn emit_jmp_reg(buf: &mut CodeBuffer, reg: Reg) {
    emit_modrm_ext(buf, OPC_GRP5, Ext5Op::JmpN as u8, reg);
}

/// Emit `PUSH reg`.
pub fn emit_push(buf: &mut CodeBuffer, reg: Reg) {
    emit_opc(buf, OPC_PUSH_r32 + reg.low3() as u32, 0, reg as u8);
}

/// Emit `POP reg`.
pub fn emit_pop(buf: &mut CodeBuffer, reg: Reg) {
    emit_opc(buf, OPC_POP_r32 + reg.low3() as u32, 0, reg as u8);
}

/// Emit `RET`.
pub fn emit_ret(buf: &mut CodeBuffer) {
    buf.emit_u8(OPC_RET as u8);
}
