//! The process-wide guest execution environment.
//!
//! Compiled code receives a pointer to the one `ExecEnv` as the first
//! argument of every function; the runtime owns the instance itself. The
//! struct layout is ABI: the compiler hard-codes the field offsets.

use std::ptr;

/// Phase of the checkpoint/restore lifecycle, stored in `ExecEnv` where
/// generated code can branch on it.
///
/// The only legal transitions are
/// `None -> CheckpointStart -> CheckpointContinue -> exit` and
/// `Restore -> None`; they are driven by the supervisor and by the last
/// `pop_front_frame` respectively.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum MigrationState {
    None = 0,
    CheckpointStart = 1,
    CheckpointContinue = 2,
    Restore = 3,
}

/// Guest execution context shared between compiled code and the runtime.
///
/// Exactly one instance exists per process. Only the memory manager and the
/// supervisor mutate `memory_base`/`memory_size`/`migration_state`; compiled
/// code reads them through its `ExecEnv*` argument.
#[repr(C)]
#[derive(Debug)]
pub struct ExecEnv {
    /// Base of the guest linear memory.
    pub memory_base: *mut u8,
    /// Current size of the linear memory in 64 KiB wasm pages.
    pub memory_size: u32,
    pub migration_state: MigrationState,
    pub argc: i32,
    pub argv: *mut *mut u8,
}

impl ExecEnv {
    const fn empty() -> ExecEnv {
        ExecEnv {
            memory_base: ptr::null_mut(),
            memory_size: 0,
            migration_state: MigrationState::None,
            argc: 0,
            argv: ptr::null_mut(),
        }
    }
}

// The one instance. A plain static rather than anything fancier: the guest
// thread and the supervisor touch it in strictly disjoint phases, and the
// SIGSEGV handler only stores a single i32 field.
static mut EXEC_ENV: ExecEnv = ExecEnv::empty();

/// Pointer to the process-wide `ExecEnv`. This is the pointer handed to
/// `aot_main` and the one expected back in every runtime API call.
pub fn exec_env_ptr() -> *mut ExecEnv {
    unsafe { ptr::addr_of_mut!(EXEC_ENV) }
}

/// Read the current migration state through any `ExecEnv` pointer.
///
/// # Safety
///
/// `env` must be the pointer obtained from [`exec_env_ptr`].
pub unsafe fn migration_state(env: *const ExecEnv) -> MigrationState {
    (*env).migration_state
}

/// Set the migration state.
///
/// # Safety
///
/// Same contract as [`migration_state`]; callers are the supervisor, the
/// driver, and the restore-completion path only.
pub unsafe fn set_migration_state(env: *mut ExecEnv, state: MigrationState) {
    (*env).migration_state = state;
}
