//! Runtime library for `wanco` AOT-compiled WebAssembly executables.
//!
//! Every native executable produced by the companion compiler links this
//! crate. Its job is transparent checkpoint/restore of the running guest at
//! the WebAssembly level: on a checkpoint request the supervisor traps the
//! guest at the next compiled poll site, walks the native call stack,
//! rebuilds the wasm frames from LLVM stackmap records, and serializes the
//! full guest state; on restore the driver reloads that state and re-enters
//! `aot_main`, whose compiled restore prologues pop values back out through
//! the runtime API.

mod arch;
mod checkpoint;
mod elf;
mod entry;
mod exec_env;
mod memory;
mod module;
mod osr;
mod snapshot;
mod stackmap;
mod stacktrace;
mod supervisor;
mod value;

pub mod api;

pub use crate::checkpoint::{checkpoint_state, Checkpoint, Frame};
pub use crate::elf::{ElfImage, WasmLocation};
pub use crate::entry::{run, wanco_main};
pub use crate::exec_env::{exec_env_ptr, ExecEnv, MigrationState};
pub use crate::memory::{PAGE_SIZE, POLLING_PAGE_ADDR};
pub use crate::value::{ValType, Value};
