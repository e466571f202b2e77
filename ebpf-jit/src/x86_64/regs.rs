/// x86-64 general-purpose register indices, matching the ModR/M and REX
/// register numbering used throughout the emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Low 3 bits of the register encoding, used in ModR/M and opcode+rd forms.
    #[inline]
    pub const fn low3(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Whether this register needs a REX prefix to be addressable (R8-R15).
    #[inline]
    pub const fn needs_rex(self) -> bool {
        (self as u8) >= 8
    }
}

/// Host ABI dialect the JIT targets. Selects the register map, the
/// callee-saved set the prologue/epilogue must preserve, and the
/// parameter-passing convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiDialect {
    SystemV,
    Win64,
}

impl AbiDialect {
    pub const fn register_map(self) -> RegisterMap {
        match self {
            Self::SystemV => RegisterMap::SYSTEM_V,
            Self::Win64 => RegisterMap::WIN64,
        }
    }

    /// Registers the prologue pushes and the epilogue pops, in push order.
    pub const fn callee_saved(self) -> &'static [Reg] {
        match self {
            Self::SystemV => &[Reg::Rbx, Reg::Rbp, Reg::R13, Reg::R14, Reg::R15],
            Self::Win64 => &[Reg::Rbx, Reg::Rbp, Reg::Rsi, Reg::Rdi, Reg::R13, Reg::R14, Reg::R15],
        }
    }

    /// First platform parameter register (the eBPF context pointer).
    pub const fn first_param(self) -> Reg {
        match self {
            Self::SystemV => Reg::Rdi,
            Self::Win64 => Reg::Rcx,
        }
    }

    /// Integer parameter-passing registers, in argument order.
    pub const fn call_arg_regs(self) -> &'static [Reg] {
        match self {
            Self::SystemV => &[Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9],
            Self::Win64 => &[Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9],
        }
    }

}

/// A fixed bijection from the 11 eBPF registers (R0-R10) to host GPRs.
///
/// Deliberately avoids R12 everywhere: `emit_modrm_offset`/`emit_modrm_ext_offset`
/// encode base registers without a SIB byte, and R12 (like RSP) always
/// requires one. RSP itself is reserved for the native stack pointer and
/// never appears in the table either.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap {
    table: [Reg; 11],
}

impl RegisterMap {
    /// System V AMD64 mapping: eBPF volatiles (R0-R5) land on host
    /// caller-saved registers and eBPF non-volatiles (R6-R10) land on
    /// host callee-saved registers.
    pub const SYSTEM_V: RegisterMap = RegisterMap {
        table: [
            Reg::Rax,  // R0: return value
            Reg::Rdi,  // R1: arg0 / context pointer
            Reg::Rsi,  // R2
            Reg::Rdx,  // R3
            Reg::Rcx,  // R4
            Reg::R8,   // R5
            Reg::Rbx,  // R6
            Reg::R13,  // R7
            Reg::R14,  // R8
            Reg::R15,  // R9
            Reg::Rbp,  // R10: stack-frame pointer
        ],
    };

    /// Microsoft x64 mapping, built the same way from that ABI's
    /// caller-saved and callee-saved sets.
    pub const WIN64: RegisterMap = RegisterMap {
        table: [
            Reg::Rax,  // R0
            Reg::Rcx,  // R1: arg0 / context pointer
            Reg::Rdx,  // R2
            Reg::R8,   // R3
            Reg::R9,   // R4
            Reg::R10,  // R5
            Reg::Rbx,  // R6
            Reg::Rsi,  // R7
            Reg::Rdi,  // R8
            Reg::R13,  // R9
            Reg::R14,  // R10: stack-frame pointer
        ],
    };

    #[inline]
    pub fn get(&self, ebpf_reg: u8) -> Reg {
        self.table[ebpf_reg as usize % 11]
    }

    /// Build a permuted map for the property test that checks output is
    /// independent of the particular register assignment. Not used by
    /// `compile`/`translate`.
    pub fn permuted(seed: u64) -> RegisterMap {
        let base = Self::SYSTEM_V.table;
        let mut table = base;
        let n = table.len();
        for i in (1..n).rev() {
            let j = (seed.wrapping_mul(2654435761).wrapping_add(i as u64) as usize) % (i + 1);
            table.swap(i, j);
        }
        RegisterMap { table }
    }
}

/// eBPF-defined stack size reserved below the frame-pointer copy of RSP.
pub const UBPF_STACK_SIZE: usize = 512;
