//! Guest linear-memory management.
//!
//! The linear memory lives at a fixed virtual address so that pointers into
//! it reconstruct deterministically across a checkpoint/restore pair, even
//! on a different host. The whole 4 GiB wasm address range plus one guard
//! page on each side is reserved `PROT_NONE` up front; `allocate` makes the
//! initial pages accessible and `extend` makes more pages accessible in
//! place. The base therefore never moves and out-of-bounds accesses fault
//! on `PROT_NONE` pages.
//!
//! A separate fixed page, the polling page, is mapped read-write at startup.
//! Compiled code performs a load from it at every poll site; flipping it to
//! `PROT_NONE` is how the supervisor stops the guest.

use anyhow::{Context, Result};
use log::{debug, info};
use more_asserts::assert_le;
use rustix::mm::{mmap_anonymous, mprotect, MapFlags, MprotectFlags, ProtFlags};

use crate::exec_env::ExecEnv;

/// One wasm page.
pub const PAGE_SIZE: usize = 65536;

/// Upper bound of a 32-bit wasm linear memory, in pages.
pub const MAX_MEMORY_PAGES: u32 = 65536;

/// Fixed base of the guest linear memory. The compiler constant-folds the
/// same address into generated memory accesses.
pub const LINEAR_MEMORY_BASE: usize = 0x1000_0000_0000;

/// Fixed address of the polling page; distinct from the linear-memory
/// reservation and likewise known to the compiler.
pub const POLLING_PAGE_ADDR: usize = 0x0fff_0000_0000;

const POLLING_PAGE_SIZE: usize = PAGE_SIZE;

const GUARD_SIZE: usize = PAGE_SIZE;
const RESERVATION_BASE: usize = LINEAR_MEMORY_BASE - GUARD_SIZE;
const RESERVATION_SIZE: usize =
    GUARD_SIZE + MAX_MEMORY_PAGES as usize * PAGE_SIZE + GUARD_SIZE;

/// Reserve the linear-memory region and make the first `pages` pages
/// accessible. Returns the fixed base address.
///
/// Called once per process, either with the module's `INIT_MEMORY_PAGES` on
/// a cold start or with the snapshot's page count on restore.
pub fn allocate(pages: u32) -> Result<*mut u8> {
    assert_le!(pages, MAX_MEMORY_PAGES);

    // One PROT_NONE reservation covers both guard regions and all pages the
    // memory could ever grow to.
    unsafe {
        mmap_anonymous(
            RESERVATION_BASE as *mut _,
            RESERVATION_SIZE,
            ProtFlags::empty(),
            MapFlags::PRIVATE | MapFlags::FIXED,
        )
        .with_context(|| {
            format!("mmap failed to reserve {RESERVATION_SIZE:#x} bytes for linear memory")
        })?;
    }

    if pages > 0 {
        unsafe {
            mprotect(
                LINEAR_MEMORY_BASE as *mut _,
                pages as usize * PAGE_SIZE,
                MprotectFlags::READ | MprotectFlags::WRITE,
            )
            .with_context(|| format!("mprotect failed to commit {pages} initial pages"))?;
        }
    }

    info!(
        "allocated linear memory: {} pages at {:#x}",
        pages, LINEAR_MEMORY_BASE
    );
    Ok(LINEAR_MEMORY_BASE as *mut u8)
}

/// Grow the linear memory by `inc_pages`, returning the old size in pages,
/// or -1 if the request cannot be satisfied (wasm `memory.grow` semantics).
///
/// Growth never moves the base: the new pages are already reserved and only
/// need their protection flipped. An `mprotect` failure here is an OS-level
/// error, not a guest-visible one, and aborts.
pub fn extend(env: *mut ExecEnv, inc_pages: i32) -> i32 {
    let env = unsafe { &mut *env };
    let old_pages = env.memory_size;

    // Wasm spec: growing by zero pages reports the current size and must
    // not touch the mapping.
    if inc_pages == 0 {
        return old_pages as i32;
    }

    let new_pages = match u32::try_from(inc_pages)
        .ok()
        .and_then(|inc| old_pages.checked_add(inc))
    {
        Some(n) if n <= MAX_MEMORY_PAGES => n,
        _ => return -1,
    };

    unsafe {
        mprotect(
            env.memory_base.add(old_pages as usize * PAGE_SIZE).cast(),
            (new_pages - old_pages) as usize * PAGE_SIZE,
            MprotectFlags::READ | MprotectFlags::WRITE,
        )
        .expect("mprotect failed while growing linear memory");
    }

    debug!("memory grown from {old_pages} to {new_pages} pages");
    env.memory_size = new_pages;
    old_pages as i32
}

/// Map the polling page read-write. Compiled poll sites load from it; it
/// stays benign until the supervisor arms it.
pub fn map_polling_page() -> Result<()> {
    unsafe {
        mmap_anonymous(
            POLLING_PAGE_ADDR as *mut _,
            POLLING_PAGE_SIZE,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::PRIVATE | MapFlags::FIXED,
        )
        .context("mmap failed to map the polling page")?;
    }
    Ok(())
}

/// Flip the polling page to `PROT_NONE` so the next compiled poll faults.
pub fn arm_polling_page() -> Result<()> {
    unsafe {
        mprotect(
            POLLING_PAGE_ADDR as *mut _,
            POLLING_PAGE_SIZE,
            MprotectFlags::empty(),
        )
        .context("mprotect failed to arm the polling page")?;
    }
    Ok(())
}

/// Whether a faulting address lies inside the polling page.
pub fn polling_page_contains(addr: usize) -> bool {
    (POLLING_PAGE_ADDR..POLLING_PAGE_ADDR + POLLING_PAGE_SIZE).contains(&addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec_env::exec_env_ptr;

    // A single test exercises the whole lifecycle: the linear memory has one
    // fixed address per process, so allocating from two tests would race.
    #[test]
    fn allocate_extend_and_touch() {
        let base = allocate(2).unwrap();
        assert_eq!(base as usize, LINEAR_MEMORY_BASE);

        unsafe {
            base.write(0xa5);
            base.add(2 * PAGE_SIZE - 1).write(0x5a);
            assert_eq!(base.read(), 0xa5);
        }

        let env = exec_env_ptr();
        unsafe {
            (*env).memory_base = base;
            (*env).memory_size = 2;
        }

        // Growing by zero pages reports the current size.
        assert_eq!(extend(env, 0), 2);
        assert_eq!(unsafe { (*env).memory_size }, 2);

        assert_eq!(extend(env, 3), 2);
        assert_eq!(unsafe { (*env).memory_size }, 5);
        unsafe {
            // The freshly grown page is accessible and zeroed.
            assert_eq!(base.add(4 * PAGE_SIZE).read(), 0);
        }

        // Requests past the wasm maximum fail with -1 and change nothing.
        assert_eq!(extend(env, i32::MAX), -1);
        assert_eq!(extend(env, -1), -1);
        assert_eq!(unsafe { (*env).memory_size }, 5);
    }

    #[test]
    fn polling_page_range() {
        assert!(polling_page_contains(POLLING_PAGE_ADDR));
        assert!(polling_page_contains(POLLING_PAGE_ADDR + 0x100));
        assert!(!polling_page_contains(POLLING_PAGE_ADDR + POLLING_PAGE_SIZE));
        assert!(!polling_page_contains(LINEAR_MEMORY_BASE));
    }
}
