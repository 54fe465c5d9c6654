//! AArch64 AAPCS64 definitions.

use super::TrapContext;

/// DWARF register number of `x29`, the frame base register.
pub const FRAME_BASE_REG: u16 = 29;

/// Callee-saved registers the compiler may pin wasm values into across
/// safepoints, keyed by their DWARF numbers.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegSnapshot {
    pub x19: u64,
    pub x20: u64,
    pub x21: u64,
    pub x22: u64,
    pub x23: u64,
    pub x24: u64,
    pub x25: u64,
    pub x26: u64,
}

impl RegSnapshot {
    pub fn get(&self, dwarf_regnum: u16) -> Option<u64> {
        match dwarf_regnum {
            19 => Some(self.x19),
            20 => Some(self.x20),
            21 => Some(self.x21),
            22 => Some(self.x22),
            23 => Some(self.x23),
            24 => Some(self.x24),
            25 => Some(self.x25),
            26 => Some(self.x26),
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
    let mc = &uc.uc_mcontext;
    TrapContext {
        pc: mc.pc,
        sp: mc.sp,
        fp: mc.regs[29],
        regs: RegSnapshot {
            x19: mc.regs[19],
            x20: mc.regs[20],
            x21: mc.regs[21],
            x22: mc.regs[22],
            x23: mc.regs[23],
            x24: mc.regs[24],
            x25: mc.regs[25],
            x26: mc.regs[26],
        },
    }
}

/// The frame record is `[x29, x30]`: saved fp at `[fp]`, return address
/// just above it.
pub unsafe fn next_older_pc_from_fp(fp: u64) -> u64 {
    *(fp as *const u64).add(1)
}

pub unsafe fn next_older_fp_from_fp(fp: u64) -> u64 {
    *(fp as *const u64)
}

/// Stack pointer of the next older frame, just past the frame record.
pub fn next_older_sp_from_fp(fp: u64) -> u64 {
    fp + 16
}
