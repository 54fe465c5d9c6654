//! Binding to the symbols the AOT module provides.
//!
//! The runtime is a library linked into the module's executable, so the
//! module's entry point and checkpoint callbacks already live in the
//! process image. They are resolved once at startup with `dlsym` rather
//! than referenced at link time, which keeps the runtime linkable (and its
//! test suite runnable) without a module present; the compiler's link step
//! exports the module symbols dynamically.

use std::ffi::{c_void, CStr};
use std::mem;
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};

use crate::exec_env::ExecEnv;

type ModuleFn = unsafe extern "C" fn(*mut ExecEnv);

/// Entry points and link-time constants of the AOT module.
#[derive(Debug, Clone, Copy)]
pub struct AotModule {
    aot_main: ModuleFn,
    store_globals: ModuleFn,
    store_table: ModuleFn,
    /// The module's `INIT_MEMORY_PAGES` constant.
    pub init_memory_pages: u32,
}

impl AotModule {
    /// Look up the module symbols in the running process.
    pub fn resolve() -> Result<AotModule> {
        unsafe {
            Ok(AotModule {
                aot_main: mem::transmute::<*mut c_void, ModuleFn>(lookup(c"aot_main")?),
                store_globals: mem::transmute::<*mut c_void, ModuleFn>(lookup(
                    c"store_globals",
                )?),
                store_table: mem::transmute::<*mut c_void, ModuleFn>(lookup(c"store_table")?),
                init_memory_pages: (lookup(c"INIT_MEMORY_PAGES")? as *const u32).read(),
            })
        }
    }

    /// Run the guest entry point.
    ///
    /// # Safety
    ///
    /// `env` must be the process-wide [`ExecEnv`], fully initialized for
    /// the current migration state.
    pub unsafe fn aot_main(&self, env: *mut ExecEnv) {
        (self.aot_main)(env);
    }

    /// Have the module push its globals through the checkpoint API.
    ///
    /// # Safety
    ///
    /// Only legal in migration state CHECKPOINT_CONTINUE.
    pub unsafe fn store_globals(&self, env: *mut ExecEnv) {
        (self.store_globals)(env);
    }

    /// Have the module push its indirect-call table through the checkpoint
    /// API.
    ///
    /// # Safety
    ///
    /// Only legal in migration state CHECKPOINT_CONTINUE.
    pub unsafe fn store_table(&self, env: *mut ExecEnv) {
        (self.store_table)(env);
    }
}

unsafe fn lookup(name: &CStr) -> Result<*mut c_void> {
    let sym = libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr());
    if sym.is_null() {
        return Err(anyhow!(
            "AOT module symbol {name:?} is not exported from the executable; \
             was the module linked with --export-dynamic?"
        ));
    }
    Ok(sym)
}

static MODULE: OnceLock<AotModule> = OnceLock::new();

/// Record the resolved module for the supervisor.
pub fn install(module: AotModule) {
    let _ = MODULE.set(module);
}

/// The resolved module, if the driver has installed one.
pub fn module() -> Result<&'static AotModule> {
    MODULE.get().context("AOT module has not been resolved")
}

#[cfg(test)]
mod tests {
    use super::*;

    // The test binary carries no AOT module, so resolution must fail with a
    // diagnostic naming the missing symbol.
    #[test]
    fn resolve_without_a_module_fails() {
        let err = AotModule::resolve().unwrap_err();
        assert!(err.to_string().contains("aot_main"), "{err}");
    }
}
