//! A minimal eBPF assembler and test `Vm` used by the integration
//! tests. Not a real loader: tests build instruction streams directly
//! with the helpers below instead of decoding a byte stream.
#![allow(dead_code)]

use ebpf_core::{ExtFunc, Insn, Vm};
use ebpf_jit::x86_64::regs::{AbiDialect, RegisterMap, UBPF_STACK_SIZE};
use ebpf_jit::{CodeBuffer, JitState};
use std::os::raw::{c_char, c_void};
use std::sync::atomic::{AtomicU32, Ordering};

// -- Opcode field constants, matching the classic eBPF encoding --

const ALU: u8 = 0x04;
const ALU64: u8 = 0x07;
const JMP: u8 = 0x05;
const LD: u8 = 0x00;

const K: u8 = 0x00; // source = immediate
const X: u8 = 0x08; // source = register

const ADD: u8 = 0x00 << 4;
const SUB: u8 = 0x01 << 4;
const MUL: u8 = 0x02 << 4;
const DIV: u8 = 0x03 << 4;
const OR: u8 = 0x04 << 4;
const AND: u8 = 0x05 << 4;
const LSH: u8 = 0x06 << 4;
const RSH: u8 = 0x07 << 4;
const NEG: u8 = 0x08 << 4;
const MOD: u8 = 0x09 << 4;
const XOR: u8 = 0x0A << 4;
const MOV: u8 = 0x0B << 4;
const ARSH: u8 = 0x0C << 4;
const END: u8 = 0x0D << 4;

const JEQ: u8 = 0x01 << 4;
const JGT: u8 = 0x02 << 4;
const JSET: u8 = 0x04 << 4;
const JNE: u8 = 0x05 << 4;
const CALL: u8 = 0x08 << 4;
const EXIT: u8 = 0x09 << 4;

const DW: u8 = 0x03 << 3; // size field, LDDW only
const IMM_MODE: u8 = 0x00 << 5;

fn insn(opcode: u8, dst: u8, src: u8, offset: i16, imm: i32) -> Insn {
    Insn {
        opcode,
        dst,
        src,
        offset,
        imm,
    }
}

pub fn mov64_imm(dst: u8, imm: i32) -> Insn {
    insn(ALU64 | MOV | K, dst, 0, 0, imm)
}

pub fn mov64_reg(dst: u8, src: u8) -> Insn {
    insn(ALU64 | MOV | X, dst, src, 0, 0)
}

pub fn add64_reg(dst: u8, src: u8) -> Insn {
    insn(ALU64 | ADD | X, dst, src, 0, 0)
}

pub fn add64_imm(dst: u8, imm: i32) -> Insn {
    insn(ALU64 | ADD | K, dst, 0, 0, imm)
}

pub fn sub64_imm(dst: u8, imm: i32) -> Insn {
    insn(ALU64 | SUB | K, dst, 0, 0, imm)
}

pub fn sub64_reg(dst: u8, src: u8) -> Insn {
    insn(ALU64 | SUB | X, dst, src, 0, 0)
}

pub fn mul64_reg(dst: u8, src: u8) -> Insn {
    insn(ALU64 | MUL | X, dst, src, 0, 0)
}

pub fn and64_imm(dst: u8, imm: i32) -> Insn {
    insn(ALU64 | AND | K, dst, 0, 0, imm)
}

pub fn or64_imm(dst: u8, imm: i32) -> Insn {
    insn(ALU64 | OR | K, dst, 0, 0, imm)
}

pub fn xor64_reg(dst: u8, src: u8) -> Insn {
    insn(ALU64 | XOR | X, dst, src, 0, 0)
}

pub fn neg64(dst: u8) -> Insn {
    insn(ALU64 | NEG | K, dst, 0, 0, 0)
}

pub fn div64_reg(dst: u8, src: u8) -> Insn {
    insn(ALU64 | DIV | X, dst, src, 0, 0)
}

pub fn div64_imm(dst: u8, imm: i32) -> Insn {
    insn(ALU64 | DIV | K, dst, 0, 0, imm)
}

pub fn mod64_reg(dst: u8, src: u8) -> Insn {
    insn(ALU64 | MOD | X, dst, src, 0, 0)
}

pub fn lsh64_imm(dst: u8, imm: i32) -> Insn {
    insn(ALU64 | LSH | K, dst, 0, 0, imm)
}

pub fn rsh64_reg(dst: u8, src: u8) -> Insn {
    insn(ALU64 | RSH | X, dst, src, 0, 0)
}

/// `BE dst, width` — byte-swap (real hardware is little-endian, so this
/// is the only `END` form that emits anything).
pub fn be(dst: u8, width: i32) -> Insn {
    insn(ALU | END | X, dst, 0, 0, width)
}

/// `LE dst, width` — no-op on a little-endian host.
pub fn le(dst: u8, width: i32) -> Insn {
    insn(ALU | END | K, dst, 0, 0, width)
}

pub fn jne_imm(dst: u8, imm: i32, offset: i16) -> Insn {
    insn(JMP | JNE | K, dst, 0, offset, imm)
}

pub fn jeq_imm(dst: u8, imm: i32, offset: i16) -> Insn {
    insn(JMP | JEQ | K, dst, 0, offset, imm)
}

pub fn jgt_reg(dst: u8, src: u8, offset: i16) -> Insn {
    insn(JMP | JGT | X, dst, src, offset, 0)
}

pub fn jset_imm(dst: u8, imm: i32, offset: i16) -> Insn {
    insn(JMP | JSET | K, dst, 0, offset, imm)
}

pub fn call(imm: i32) -> Insn {
    insn(JMP | CALL | K, 0, 0, 0, imm)
}

pub fn exit() -> Insn {
    insn(JMP | EXIT | K, 0, 0, 0, 0)
}

/// `LDDW dst, imm64` — the only two-slot instruction; both records must
/// be pushed into the instruction stream.
pub fn lddw(dst: u8, imm64: u64) -> [Insn; 2] {
    [
        insn(LD | DW | IMM_MODE, dst, 0, 0, (imm64 & 0xFFFF_FFFF) as u32 as i32),
        insn(0, 0, 0, 0, (imm64 >> 32) as u32 as i32),
    ]
}

static DIV_ZERO_CALLS: AtomicU32 = AtomicU32::new(0);

/// Number of times the division-by-zero trampoline has called
/// `error_printf` across the whole test binary. Monotonic, so callers
/// should only compare a before/after delta.
pub fn div_zero_call_count() -> u32 {
    DIV_ZERO_CALLS.load(Ordering::SeqCst)
}

unsafe extern "C" fn record_div_zero(_sink: *mut c_void, _fmt: *const c_char, _pc: i32) -> i32 {
    DIV_ZERO_CALLS.fetch_add(1, Ordering::SeqCst);
    0
}

pub struct TestVm {
    insts: Vec<Insn>,
    ext_funcs: [Option<ExtFunc>; 256],
    unwind_index: Option<u8>,
}

impl TestVm {
    pub fn new(insts: Vec<Insn>) -> Self {
        Self {
            insts,
            ext_funcs: [None; 256],
            unwind_index: None,
        }
    }

    pub fn with_ext_func(mut self, index: u8, func: *const c_void) -> Self {
        self.ext_funcs[index as usize] = Some(ExtFunc(func));
        self
    }

    pub fn with_unwind_index(mut self, index: u8) -> Self {
        self.unwind_index = Some(index);
        self
    }
}

impl Vm for TestVm {
    fn insts(&self) -> &[Insn] {
        &self.insts
    }

    fn ext_funcs(&self) -> &[Option<ExtFunc>; 256] {
        &self.ext_funcs
    }

    fn error_printf(&self) -> ebpf_core::ErrorPrintfFn {
        // SAFETY: `record_div_zero`'s three fixed integer arguments occupy
        // the same registers the System V ABI would assign a variadic
        // call with one trailing `i32`, so this transmute is call-site
        // compatible with `ErrorPrintfFn` even though the declared arity
        // differs.
        unsafe { std::mem::transmute::<usize, ebpf_core::ErrorPrintfFn>(record_div_zero as usize) }
    }

    fn unwind_stack_extension_index(&self) -> Option<u8> {
        self.unwind_index
    }

    fn error_sink(&self) -> *mut c_void {
        std::ptr::null_mut()
    }
}

/// Translate and run `insts` under an explicit register map, independent
/// of [`ebpf_jit::JitConfig`]'s normal map/ABI pairing. Used by the
/// property tests that hold the map fixed to something other than the
/// System V default while keeping System V's prologue/epilogue shape.
///
/// Translates directly into the mapping it will execute from, rather
/// than into a scratch buffer copied into place afterwards: a direct
/// `CALL`'s displacement is baked in relative to the address it's
/// emitted at, so moving the bytes after the fact would corrupt any
/// call to an external function or to the division-by-zero trampoline.
pub fn run_with_map(insts: Vec<Insn>, map: &RegisterMap) -> u64 {
    let vm = TestVm::new(insts);
    let mut exec = CodeBuffer::new(64 * 1024).expect("mmap");
    let mut state = JitState::new(&mut exec, vm.insts().len());

    ebpf_jit::x86_64::translate::translate(&mut state, &vm, map, AbiDialect::SystemV, UBPF_STACK_SIZE)
        .expect("translate");
    ebpf_jit::resolver::resolve(&mut state).expect("resolve");

    exec.set_executable().expect("mprotect");

    let entry: unsafe extern "C" fn(*mut c_void, usize) -> u64 = unsafe { std::mem::transmute(exec.base_ptr()) };
    unsafe { entry(std::ptr::null_mut(), 0) }
}

pub fn run(insts: Vec<Insn>) -> u64 {
    run_with_map(insts, &RegisterMap::SYSTEM_V)
}
