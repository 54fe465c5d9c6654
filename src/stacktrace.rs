//! Native stack walking from the trap site.
//!
//! The compiler emits frame pointers in every guest function, so the walk is
//! a plain frame-pointer-chain traversal seeded from the registers the
//! SIGSEGV handler captured. Guest frames are contiguous and innermost on
//! the stack at a poll-site trap; the walk stops at the first frame that is
//! not a compiler-emitted `func_<index>` symbol.

use log::trace;

use crate::arch::{self, RegSnapshot, TrapContext};
use crate::elf::ElfImage;

/// Symbol prefix the compiler gives every guest function.
pub const GUEST_FUNCTION_PREFIX: &str = "func_";

/// One native frame of the trapped guest.
#[derive(Clone, Debug)]
pub struct NativeFrame {
    pub function_name: String,
    /// Runtime pc: the faulting address for the innermost frame, a return
    /// address for every other frame.
    pub pc: u64,
    /// Offset of `pc` from the function's code start.
    pub pc_offset: u64,
    pub sp: u64,
    pub fp: u64,
}

/// Walk the guest frames, innermost first, together with the callee-saved
/// register snapshot captured at the trap site.
pub fn trace(ctx: &TrapContext, image: &ElfImage) -> (Vec<NativeFrame>, RegSnapshot) {
    let mut frames = Vec::new();
    let mut pc = ctx.pc;
    let mut sp = ctx.sp;
    let mut fp = ctx.fp;

    loop {
        let Some((name, pc_offset)) = image.resolve_symbol(pc) else {
            break;
        };
        if !name.starts_with(GUEST_FUNCTION_PREFIX) {
            break;
        }
        trace!("native frame: {name} + {pc_offset:#x} (fp={fp:#x})");
        frames.push(NativeFrame {
            function_name: name.to_string(),
            pc,
            pc_offset,
            sp,
            fp,
        });

        if fp == 0 {
            break;
        }
        let next_pc = unsafe { arch::next_older_pc_from_fp(fp) };
        let next_fp = unsafe { arch::next_older_fp_from_fp(fp) };
        // Frame pointers grow strictly upward; anything else means the
        // chain left guest territory.
        if next_pc == 0 || next_fp <= fp {
            break;
        }
        sp = arch::next_older_sp_from_fp(fp);
        pc = next_pc;
        fp = next_fp;
    }

    (frames, ctx.regs)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without an AOT module linked in there are no `func_*` symbols, so a
    // walk seeded at one of our own functions must stop immediately instead
    // of chasing a frame-pointer chain it does not understand.
    #[test]
    fn walk_stops_outside_guest_code() {
        let image = ElfImage::open_self().unwrap();
        let ctx = TrapContext {
            pc: crate::api::memory_grow as usize as u64,
            sp: 0,
            fp: 0,
            regs: RegSnapshot::default(),
        };
        let (frames, _) = trace(&ctx, &image);
        assert!(frames.is_empty());
    }
}
