//! Process entry and mode selection.
//!
//! The driver decides between a cold start and a restore, initializes the
//! memory manager and the supervisor, and hands control to the module's
//! `aot_main`. If the guest comes back with the migration state still in
//! CHECKPOINT_CONTINUE it ran the cooperative checkpoint path, and the
//! driver finalizes the snapshot the generated code recorded.

use std::ffi::{CStr, CString, OsString};
use std::os::unix::ffi::OsStringExt;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use crate::checkpoint::checkpoint_state;
use crate::exec_env::{self, exec_env_ptr, MigrationState};
use crate::memory::{self, PAGE_SIZE};
use crate::module::{self, AotModule};
use crate::snapshot::{self, SNAPSHOT_FILE};
use crate::supervisor;

#[derive(Parser, Debug)]
#[command(
    about = "WebAssembly AOT executable",
    disable_version_flag = true,
    arg_required_else_help = false
)]
struct Args {
    /// Restore an execution from a checkpoint file
    #[arg(long, value_name = "FILE")]
    restore: Option<String>,

    /// Arguments passed to the WebAssembly module
    #[arg(last = true, value_name = "ARGS")]
    guest_args: Vec<String>,
}

/// C-style entry point. The compiler's link step emits a `main` that tail
/// calls this with the process arguments.
///
/// # Safety
///
/// `argv` must be the `argc`-element argument vector `main` received.
#[no_mangle]
pub unsafe extern "C" fn wanco_main(
    argc: libc::c_int,
    argv: *const *const libc::c_char,
) -> libc::c_int {
    let args: Vec<OsString> = (0..argc as usize)
        .map(|i| OsString::from_vec(CStr::from_ptr(*argv.add(i)).to_bytes().to_vec()))
        .collect();
    match run(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            1
        }
    }
}

/// Run the module with the given process arguments. Returns the process
/// exit code.
pub fn run(raw_args: Vec<OsString>) -> Result<i32> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init()
        .ok();

    let program = raw_args
        .first()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "wanco-module".to_string());
    let args = Args::parse_from(&raw_args);

    let module = AotModule::resolve()?;
    module::install(module);
    memory::map_polling_page()?;
    supervisor::install()?;

    let env = exec_env_ptr();
    let (argc, argv) = build_guest_argv(&program, &args.guest_args)?;

    match &args.restore {
        None => {
            let base = memory::allocate(module.init_memory_pages)?;
            unsafe {
                (*env).memory_base = base;
                (*env).memory_size = module.init_memory_pages;
                (*env).migration_state = MigrationState::None;
                (*env).argc = argc;
                (*env).argv = argv;
            }
        }
        Some(path) => {
            if !path.ends_with(".pb") {
                warn!("{path} does not have a .pb extension; attempting to parse anyway");
            }
            let (mut chkpt, base) = snapshot::read_file(path)?;
            chkpt.prepare_restore();
            info!(
                "checkpoint loaded: {} frames on the call stack, {} operand values",
                chkpt.frames.len(),
                chkpt.restore_stack.len()
            );
            let pages = chkpt.memory_pages;
            *checkpoint_state() = chkpt;
            unsafe {
                (*env).memory_base = base;
                (*env).memory_size = pages;
                (*env).migration_state = MigrationState::Restore;
                (*env).argc = argc;
                (*env).argv = argv;
            }
        }
    }

    unsafe {
        module.aot_main(env);
    }

    // The guest unwound out of aot_main while recording a cooperative
    // checkpoint; everything but the memory payload is already in place.
    if unsafe { exec_env::migration_state(env) } == MigrationState::CheckpointContinue {
        finalize_cooperative_checkpoint()?;
    }
    Ok(0)
}

fn finalize_cooperative_checkpoint() -> Result<()> {
    let env = exec_env_ptr();
    let (base, pages) = unsafe { ((*env).memory_base, (*env).memory_size) };
    let memory = unsafe { std::slice::from_raw_parts(base, pages as usize * PAGE_SIZE) };
    let mut state = checkpoint_state();
    state.memory_pages = pages;
    snapshot::write_file(SNAPSHOT_FILE, &state, memory)?;
    info!("Snapshot has been saved to {SNAPSHOT_FILE}");
    Ok(())
}

/// Build the NULL-terminated argv the guest sees: the program name followed
/// by everything after `--`. The strings live for the rest of the process.
fn build_guest_argv(program: &str, guest_args: &[String]) -> Result<(i32, *mut *mut u8)> {
    let mut ptrs: Vec<*mut u8> = Vec::with_capacity(guest_args.len() + 2);
    for arg in std::iter::once(program).chain(guest_args.iter().map(String::as_str)) {
        let arg = CString::new(arg).context("guest argument contains a NUL byte")?;
        ptrs.push(arg.into_raw().cast());
    }
    ptrs.push(std::ptr::null_mut());
    let argc = ptrs.len() as i32 - 1;
    Ok((argc, Box::leak(ptrs.into_boxed_slice()).as_mut_ptr()))
}
