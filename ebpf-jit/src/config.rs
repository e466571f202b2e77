use crate::x86_64::regs::{AbiDialect, UBPF_STACK_SIZE};

/// Tunables for a single `compile`/`translate` call. Not persisted
/// anywhere; constructed fresh by the embedder each time.
#[derive(Debug, Clone, Copy)]
pub struct JitConfig {
    pub abi: AbiDialect,
    /// Bytes of eBPF stack space reserved below the copy of RSP that
    /// becomes eBPF R10.
    pub stack_size: usize,
    /// Size of the working buffer `compile` allocates before it knows
    /// the final code size.
    pub working_buffer_size: usize,
    /// Upper bound on the number of instructions `translate` will walk;
    /// exceeding it is a caller error, not a translation failure, since
    /// it indicates the verifier let through an unbounded program.
    pub max_insts: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            abi: AbiDialect::SystemV,
            stack_size: UBPF_STACK_SIZE,
            working_buffer_size: 64 * 1024,
            max_insts: 4096,
        }
    }
}
