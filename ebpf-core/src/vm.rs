use crate::insn::Insn;
use std::os::raw::{c_char, c_void};

/// A host function an eBPF program can `CALL` into.
///
/// The raw pointer's actual signature is agreed between the embedder and
/// the eBPF program being compiled; the JIT only ever loads it into a
/// register and emits a `call`, it never inspects or invokes it directly.
#[derive(Clone, Copy)]
pub struct ExtFunc(pub *const c_void);

// SAFETY: the pointer is to position-independent executable code or a
// process-lifetime static; it is never dereferenced by this crate.
unsafe impl Send for ExtFunc {}
unsafe impl Sync for ExtFunc {}

pub type ErrorPrintfFn = unsafe extern "C" fn(*mut c_void, *const c_char, ...) -> i32;

/// The collaborator the translator reads the program and its external
/// call table from. Implemented by the embedding VM; this crate never
/// constructs one itself.
pub trait Vm {
    /// The verified instruction stream to translate.
    fn insts(&self) -> &[Insn];

    /// Host functions reachable via `CALL imm`, indexed by `imm`.
    fn ext_funcs(&self) -> &[Option<ExtFunc>; 256];

    /// Sink for the runtime division-by-zero diagnostic.
    fn error_printf(&self) -> ErrorPrintfFn;

    /// `imm` value of the `CALL` that extends the eBPF stack, if the
    /// embedder supports one. Compiled code branches to `Exit` with
    /// `R0 == 0` after this specific call returns zero.
    fn unwind_stack_extension_index(&self) -> Option<u8> {
        None
    }

    /// The sink descriptor (a `FILE*` or equivalent) the generated
    /// division-by-zero trampoline passes as `error_printf`'s first
    /// argument. Defaults to the process's `stderr`.
    fn error_sink(&self) -> *mut c_void {
        // SAFETY: sysconf-free libc accessor, always safe to call.
        unsafe { libc::stderr() as *mut c_void }
    }
}
