//! x86-64 System V definitions.

use super::TrapContext;

/// DWARF register number of `rbp`, the frame base register.
pub const FRAME_BASE_REG: u16 = 6;

/// Callee-saved integer registers (minus `rbp`, which the stack walker
/// recovers per frame). Stackmap locations refer to these by their DWARF
/// numbers.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegSnapshot {
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl RegSnapshot {
    /// Register contents by DWARF number; `None` for anything the compiler
    /// would never keep a wasm value in across a safepoint.
    pub fn get(&self, dwarf_regnum: u16) -> Option<u64> {
        match dwarf_regnum {
            3 => Some(self.rbx),
            12 => Some(self.r12),
            13 => Some(self.r13),
            14 => Some(self.r14),
            15 => Some(self.r15),
            _ => None,
        }
    }
}

/// Extract the trap-site context out of the `ucontext_t` passed to the
/// signal handler.
///
/// # Safety
///
/// `ucontext` must be the third argument of a `SA_SIGINFO` signal handler.
pub unsafe fn trap_context(ucontext: *mut libc::c_void) -> TrapContext {
    let uc = &*(ucontext as *const libc::ucontext_t);
    let gregs = &uc.uc_mcontext.gregs;
    TrapContext {
        pc: gregs[libc::REG_RIP as usize] as u64,
        sp: gregs[libc::REG_RSP as usize] as u64,
        fp: gregs[libc::REG_RBP as usize] as u64,
        regs: RegSnapshot {
            rbx: gregs[libc::REG_RBX as usize] as u64,
            r12: gregs[libc::REG_R12 as usize] as u64,
            r13: gregs[libc::REG_R13 as usize] as u64,
            r14: gregs[libc::REG_R14 as usize] as u64,
            r15: gregs[libc::REG_R15 as usize] as u64,
        },
    }
}

/// The calling convention pushes the return address just above the saved
/// frame pointer.
pub unsafe fn next_older_pc_from_fp(fp: u64) -> u64 {
    *(fp as *const u64).add(1)
}

/// The saved frame pointer sits at `[fp]`.
pub unsafe fn next_older_fp_from_fp(fp: u64) -> u64 {
    *(fp as *const u64)
}

/// Stack pointer of the next older frame, just past the saved fp/return
/// address pair.
pub fn next_older_sp_from_fp(fp: u64) -> u64 {
    fp + 16
}
