//! x86-64 JIT code generator for an eBPF virtual machine.
//!
//! [`translate`] lowers a verified eBPF instruction stream into a
//! caller-supplied buffer; [`compile`] wraps that with the mmap/mprotect
//! dance needed to turn the result into a callable native function.

pub mod code_buffer;
pub mod config;
pub mod error;
pub mod resolver;
pub mod state;
pub mod x86_64;

use std::os::raw::c_void;

pub use code_buffer::CodeBuffer;
pub use config::JitConfig;
pub use error::{JitError, TranslateError};
pub use state::{JitState, JumpFixup, JumpTarget};
pub use x86_64::regs::{AbiDialect, RegisterMap};

use ebpf_core::Vm;

/// Conservative worst-case native bytes a single eBPF instruction can
/// expand to (the `DIV`/`MOD` save-RAX/RDX-and-restore sequence is the
/// longest single-instruction emission). Used only to reject an
/// obviously undersized caller buffer before translation starts.
const MAX_BYTES_PER_INST: usize = 64;

/// Conservative worst-case native bytes for the prologue, epilogue, and
/// division-by-zero trampoline combined (each pushes/pops up to seven
/// callee-saved registers under the Win64 dialect, plus the trampoline's
/// two `MOVABS` loads and a call).
const TRAMPOLINE_OVERHEAD: usize = 256;

/// Translate `vm.insts()` into x86-64 machine code written starting at
/// `buffer[0]`, using `config` to select the ABI dialect and stack
/// layout. Returns the number of bytes written.
///
/// `buffer`'s length is its capacity on entry. A buffer too small to
/// possibly hold the worst-case expansion of `vm.insts()` is rejected
/// up front with [`TranslateError::BufferOverflow`] rather than letting
/// `CodeBuffer`'s internal bounds assertions fire mid-emission — this
/// buffer's size is the caller's choice, not a translator invariant. A
/// program longer than `config.max_insts` is rejected separately with
/// [`TranslateError::TooManyInstructions`], before `buffer`'s size is
/// even considered — that failure is about the program, not the buffer.
///
/// `buffer` must already be mapped at the address the generated code
/// will run from. Direct `CALL`s to `ext_funcs` and to the
/// division-by-zero trampoline's `error_printf` call bake in a
/// displacement relative to the address each `CALL` is emitted at (see
/// `x86_64::emitter::emit_call`); translating into a scratch buffer and
/// relocating the bytes afterwards is not supported and will silently
/// misdirect those calls. [`JitProgram::compile`] honors this by
/// translating straight into the final executable mapping.
pub fn translate(vm: &dyn Vm, buffer: &mut [u8], config: &JitConfig) -> Result<usize, TranslateError> {
    let num_insts = vm.insts().len();
    if num_insts > config.max_insts {
        return Err(TranslateError::TooManyInstructions {
            count: num_insts,
            max: config.max_insts,
        });
    }

    let worst_case = TRAMPOLINE_OVERHEAD + num_insts * MAX_BYTES_PER_INST;
    if buffer.len() < worst_case {
        return Err(TranslateError::BufferOverflow {
            capacity: buffer.len(),
        });
    }

    let mut buf = CodeBuffer::from_slice(buffer);
    let mut state = JitState::new(&mut buf, num_insts);
    let map = config.abi.register_map();

    x86_64::translate::translate(&mut state, vm, &map, config.abi, config.stack_size)?;
    resolver::resolve(&mut state)?;
    Ok(state.buf.offset())
}

/// A compiled eBPF program installed into an executable memory mapping.
///
/// Owns the mapping; `Drop` releases it via `munmap`. `Send` because the
/// mapping is exclusively owned by this handle, but deliberately not
/// `Sync` — sharing one `JitProgram` across threads without external
/// synchronization is outside this crate's contract.
pub struct JitProgram {
    buf: CodeBuffer,
}

// SAFETY: the mapping is exclusively owned by this handle.
unsafe impl Send for JitProgram {}

impl JitProgram {
    /// Compile `vm`'s instruction stream and install it into a fresh
    /// executable mapping.
    ///
    /// Allocates a read-write mapping of `config.working_buffer_size`
    /// and translates directly into it — not into a separate scratch
    /// buffer later copied into place. A direct `CALL`'s displacement is
    /// baked in relative to the address it's emitted at (see
    /// `x86_64::emitter::emit_call`), so the mapping code is emitted
    /// into must already be the address it will run at; translating
    /// into a temporary buffer and `memcpy`-ing the result to a
    /// different mapping would silently corrupt every direct call.
    /// Once translation succeeds the mapping is transitioned to
    /// read-execute in place. Calling this twice on the same `vm` runs
    /// two independent, byte-identical translations (see
    /// [`translate`]'s determinism property) rather than caching;
    /// embedders that want single-compile semantics should cache the
    /// returned handle themselves.
    pub fn compile(vm: &dyn Vm, config: &JitConfig) -> Result<Self, JitError> {
        let mut buf = CodeBuffer::new(config.working_buffer_size).map_err(JitError::Mmap)?;
        let len = translate(vm, buf.as_full_mut_slice(), config)?;
        buf.set_len(len);
        buf.set_executable().map_err(JitError::Mprotect)?;

        log::debug!(
            "ebpf-jit: compiled {} instruction(s) under {:?} (working buffer {} byte(s)) into {} byte(s)",
            vm.insts().len(),
            config.abi,
            config.working_buffer_size,
            len,
        );

        Ok(Self { buf })
    }

    /// The generated function's entry point.
    ///
    /// # Safety
    /// `ctx` must be valid for whatever the embedder's `ext_funcs` and
    /// the compiled eBPF program expect to read through it, for the
    /// duration of the call. `ctx_len` is passed through untouched in
    /// the second platform parameter register; its meaning is defined
    /// entirely by the embedder.
    pub unsafe fn entry(&self) -> unsafe extern "C" fn(*mut c_void, usize) -> u64 {
        std::mem::transmute(self.buf.base_ptr())
    }

    /// The generated code, for disassembly or golden-output tests.
    pub fn code(&self) -> &[u8] {
        self.buf.as_slice()
    }
}

/// Compile and immediately invoke the generated function on the default
/// configuration. Convenience wrapper over [`JitProgram::compile`] for
/// call sites (and tests) that don't need to hold the program past one
/// call.
///
/// # Safety
/// See [`JitProgram::entry`].
pub unsafe fn compile_and_run(vm: &dyn Vm, ctx: *mut c_void, ctx_len: usize) -> Result<u64, JitError> {
    let program = JitProgram::compile(vm, &JitConfig::default())?;
    Ok((program.entry())(ctx, ctx_len))
}
