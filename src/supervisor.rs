//! The two-phase asynchronous checkpoint supervisor.
//!
//! A checkpoint can be requested from any signal or thread without the
//! guest checking flags on hot paths. Phase 1: on the first wake the
//! supervisor thread flips the polling page to `PROT_NONE`; the next
//! compiled poll site faults. Phase 2: the SIGSEGV handler stores the
//! trap-site registers, wakes the supervisor again and parks the guest;
//! the supervisor then walks the stack, performs OSR exit, serializes the
//! snapshot and exits the process.
//!
//! The signal handlers are async-signal-safe: they store plain words and
//! write to an eventfd, nothing else.

use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{BorrowedFd, IntoRawFd};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use anyhow::{bail, Context, Result};
use log::{debug, error, info};
use rustix::event::{eventfd, EventfdFlags};

use crate::arch::{self, TrapContext};
use crate::checkpoint::{checkpoint_state, Frame};
use crate::elf::ElfImage;
use crate::exec_env::{self, exec_env_ptr, MigrationState};
use crate::memory::{self, PAGE_SIZE};
use crate::module;
use crate::osr;
use crate::snapshot::{self, SNAPSHOT_FILE};
use crate::stackmap::{self, StackmapTable};
use crate::stacktrace;

/// Voluntary checkpoint request signal; 10 is SIGUSR1 on every platform we
/// run on.
pub const SIGCHKPT: libc::c_int = 10;

static WAKE_FD: AtomicI32 = AtomicI32::new(-1);
static CONTEXT_SAVED: AtomicBool = AtomicBool::new(false);
static mut TRAP_CONTEXT: MaybeUninit<TrapContext> = MaybeUninit::uninit();

/// Create the wake object, install both signal handlers and spawn the
/// supervisor worker. Called once at process start, before the guest runs.
pub fn install() -> Result<()> {
    let efd = eventfd(0, EventfdFlags::empty()).context("failed to create the wake eventfd")?;
    WAKE_FD.store(efd.into_raw_fd(), Ordering::SeqCst);

    unsafe {
        install_signal_handlers()?;
    }

    std::thread::Builder::new()
        .name("chkpt-supervisor".to_string())
        .spawn(supervisor_main)
        .context("failed to spawn the supervisor thread")?;
    Ok(())
}

unsafe fn install_signal_handlers() -> Result<()> {
    // SA_SIGINFO for the faulting address and register context; SA_ONSTACK
    // so the handler runs on the sigaltstack the Rust runtime installs.
    let mut handler: libc::sigaction = std::mem::zeroed();
    handler.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
    handler.sa_sigaction = segv_handler as usize;
    libc::sigemptyset(&mut handler.sa_mask);
    if libc::sigaction(libc::SIGSEGV, &handler, ptr::null_mut()) != 0 {
        bail!(
            "failed to install the SIGSEGV handler: {}",
            io::Error::last_os_error()
        );
    }

    let mut handler: libc::sigaction = std::mem::zeroed();
    handler.sa_flags = libc::SA_ONSTACK;
    handler.sa_sigaction = chkpt_handler as usize;
    libc::sigemptyset(&mut handler.sa_mask);
    if libc::sigaction(SIGCHKPT, &handler, ptr::null_mut()) != 0 {
        bail!(
            "failed to install the SIGCHKPT handler: {}",
            io::Error::last_os_error()
        );
    }
    Ok(())
}

/// Notify the supervisor. Only `write(2)` on the eventfd, which is
/// async-signal-safe.
fn notify_wake() {
    let fd = WAKE_FD.load(Ordering::SeqCst);
    let buf = 1u64.to_ne_bytes();
    unsafe {
        libc::write(fd, buf.as_ptr().cast(), buf.len());
    }
}

unsafe extern "C" fn chkpt_handler(_signum: libc::c_int) {
    notify_wake();
}

unsafe extern "C" fn segv_handler(
    _signum: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let addr = (*info).si_addr() as usize;
    if !memory::polling_page_contains(addr) {
        // A genuine crash, not our poll-site trap. Restore the default
        // disposition and return; the faulting instruction re-executes and
        // the process dies the normal way.
        let mut dfl: libc::sigaction = std::mem::zeroed();
        dfl.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut dfl.sa_mask);
        libc::sigaction(libc::SIGSEGV, &dfl, ptr::null_mut());
        return;
    }

    ptr::addr_of_mut!(TRAP_CONTEXT).write(MaybeUninit::new(arch::trap_context(context)));
    CONTEXT_SAVED.store(true, Ordering::Release);
    notify_wake();

    // Pin the guest at the trap site. The supervisor owns the process from
    // here on and exits it once the snapshot is written.
    loop {
        libc::pause();
    }
}

fn wait_wake() {
    let fd = WAKE_FD.load(Ordering::SeqCst);
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut buf = [0u8; 8];
    loop {
        match rustix::io::read(fd, &mut buf) {
            Ok(8) => return,
            Err(err) if err == rustix::io::Errno::INTR => continue,
            Ok(n) => {
                error!("short eventfd read of {n} bytes");
                std::process::exit(1);
            }
            Err(err) => {
                error!("failed to read the wake eventfd: {err}");
                std::process::exit(1);
            }
        }
    }
}

fn supervisor_main() {
    // Phase 1: a checkpoint was requested. Arm the polling page so the
    // guest traps at its next poll site.
    wait_wake();
    info!("checkpoint requested; arming the polling page");
    unsafe {
        exec_env::set_migration_state(exec_env_ptr(), MigrationState::CheckpointStart);
    }
    if let Err(err) = memory::arm_polling_page() {
        error!("checkpoint failed: {err:#}");
        std::process::exit(1);
    }

    // Phase 2: the guest is pinned inside the signal handler.
    wait_wake();
    debug!("guest trapped; taking the checkpoint");
    match try_checkpoint() {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            error!("checkpoint failed: {err:#}");
            std::process::exit(1);
        }
    }
}

/// Drive stack walk, OSR exit and serialization. Any error aborts the
/// checkpoint; no partial snapshot is ever written.
fn try_checkpoint() -> Result<()> {
    let env = exec_env_ptr();
    unsafe {
        exec_env::set_migration_state(env, MigrationState::CheckpointContinue);
    }

    let image = ElfImage::open_self()?;
    let section = image
        .section(".llvm_stackmaps")
        .context("the executable has no .llvm_stackmaps section")?;
    let stackmap = stackmap::parse(section).context("failed to parse the stackmap section")?;
    info!("parsed stackmap: {} records", stackmap.records.len());
    let table = StackmapTable::build(stackmap);

    assert!(
        CONTEXT_SAVED.load(Ordering::Acquire),
        "supervisor woke for phase 2 without a saved trap context"
    );
    let ctx = unsafe { ptr::addr_of!(TRAP_CONTEXT).read().assume_init() };
    if let Some((_, loc)) = image.wasm_location_at(ctx.pc, false) {
        info!("guest trapped at {loc}");
    }

    let (native_frames, regs) = stacktrace::trace(&ctx, &image);
    for (i, frame) in native_frames.iter().enumerate() {
        // Every pc but the innermost is a return address and sits one past
        // the site of interest for the line-table lookup.
        match image.wasm_location_at(frame.pc, i > 0) {
            Some((_, loc)) => debug!(
                "native frame {i}: {} + {:#x} ({loc})",
                frame.function_name, frame.pc_offset
            ),
            None => debug!(
                "native frame {i}: {} + {:#x}",
                frame.function_name, frame.pc_offset
            ),
        }
    }
    let wasm_trace = osr::osr_exit(&regs, &native_frames, &table)?;

    {
        let mut state = checkpoint_state();
        state.clear();
        for frame in &wasm_trace {
            state.frames.push_back(Frame {
                fn_index: frame.loc.function,
                pc: frame.loc.insn_offset,
                locals: frame.locals.iter().copied().collect(),
                stack: frame.stack.clone(),
            });
        }
    }

    // The module pushes globals and table entries through the API itself;
    // the checkpoint lock must be free while it runs.
    let module = module::module()?;
    unsafe {
        module.store_globals(env);
        module.store_table(env);
    }

    let (memory_base, memory_pages) = unsafe { ((*env).memory_base, (*env).memory_size) };
    let memory =
        unsafe { std::slice::from_raw_parts(memory_base, memory_pages as usize * PAGE_SIZE) };
    let mut state = checkpoint_state();
    state.memory_pages = memory_pages;
    snapshot::write_file(SNAPSHOT_FILE, &state, memory)?;
    info!("Snapshot has been saved to {SNAPSHOT_FILE}");
    Ok(())
}
