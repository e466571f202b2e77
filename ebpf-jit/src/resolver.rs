use crate::error::TranslateError;
use crate::state::{JitState, JumpTarget};

/// Patch every pending branch/call displacement now that all PCs and
/// trampolines have a final buffer offset.
pub fn resolve(state: &mut JitState) -> Result<(), TranslateError> {
    let exit_loc = state
        .exit_loc
        .expect("translate must emit the epilogue before resolving jumps");
    let div_by_zero_loc = state
        .div_by_zero_loc
        .expect("translate must emit the div-by-zero trampoline before resolving jumps");

    for fixup in &state.jumps {
        let target_loc = match fixup.target {
            JumpTarget::Pc(pc) => state.pc_locs[pc as usize],
            JumpTarget::Exit => exit_loc,
            JumpTarget::DivByZero => div_by_zero_loc,
        };

        let rel = target_loc as i64 - (fixup.offset_loc as i64 + 4);
        if rel < i32::MIN as i64 || rel > i32::MAX as i64 {
            return Err(TranslateError::DisplacementOverflow {
                offset_loc: fixup.offset_loc,
            });
        }
        state.buf.patch_u32(fixup.offset_loc, rel as u32);
    }

    Ok(())
}
