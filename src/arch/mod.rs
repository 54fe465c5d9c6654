//! Architecture-specific register definitions.
//!
//! Each platform module supplies the DWARF numbering of the frame base
//! register, the snapshot of callee-saved registers the compiler pins wasm
//! locals into across safepoints, and the frame-pointer-chain accessors the
//! stack walker uses.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::*;
    } else {
        compile_error!("unsupported architecture for the wanco runtime");
    }
}

/// The guest registers captured by the SIGSEGV handler at the trap site.
///
/// Plain `u64` copies of the fields the checkpoint needs, so storing one
/// from signal context is async-signal-safe.
#[derive(Clone, Copy, Debug)]
pub struct TrapContext {
    pub pc: u64,
    pub sp: u64,
    pub fp: u64,
    pub regs: RegSnapshot,
}
