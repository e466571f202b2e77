use std::io;
use thiserror::Error;

/// Failures that can occur while translating an eBPF program to x86-64.
#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("unknown instruction at pc {pc}: opcode {opcode:#04x}")]
    UnknownOpcode { pc: u32, opcode: u8 },

    #[error("generated code exceeded the {capacity}-byte output buffer")]
    BufferOverflow { capacity: usize },

    #[error("program has {count} instruction(s), exceeding the configured limit of {max}")]
    TooManyInstructions { count: usize, max: usize },

    #[error("branch displacement at buffer offset {offset_loc} does not fit in 32 bits")]
    DisplacementOverflow { offset_loc: usize },

    #[error("call at pc {pc} references unregistered external function {index}")]
    UnknownExtFunc { pc: u32, index: u8 },

    /// Reserved for a future strict mode that rejects a statically-known
    /// `DIV`/`MOD`-by-zero immediate outright instead of compiling it down
    /// to an unconditional trap. Not raised by the current translator.
    #[error("division by immediate zero at pc {pc}")]
    InvalidImmediateDivisor { pc: u32 },
}

/// Failures that can occur while compiling an eBPF program to an
/// executable native function.
#[derive(Debug, Error)]
pub enum JitError {
    #[error(transparent)]
    Translate(#[from] TranslateError),

    #[error("failed to map executable memory: {0}")]
    Mmap(#[source] io::Error),

    #[error("failed to change memory protection: {0}")]
    Mprotect(#[source] io::Error),
}
