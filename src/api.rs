//! The extern "C" surface the compiler emits calls against.
//!
//! Two consumers: host helpers used by ordinary guest code (`memory_grow`,
//! `print`, ...) and the checkpoint push/pop family used by generated code
//! during the CHECKPOINT_CONTINUE and RESTORE phases. The symbol names are
//! ABI; the compiler's emission depends on every one of them.
//!
//! State mismatches, type mismatches and pops from empty state are
//! programming errors (compiler/runtime version skew): the asserts below
//! panic, and a panic unwinding out of an `extern "C"` function aborts the
//! process after printing the location.

use std::io::Write;

use log::debug;

use crate::checkpoint::{checkpoint_state, Frame};
use crate::exec_env::{self, ExecEnv, MigrationState};
use crate::memory::{self, PAGE_SIZE};
use crate::value::Value;

fn assert_state(env: *mut ExecEnv, expected: MigrationState, op: &str) {
    let state = unsafe { exec_env::migration_state(env) };
    assert_eq!(state, expected, "{op} called in migration state {state:?}");
}

/* Host helpers */

/// Grow the linear memory, returning the old size in pages or -1.
#[no_mangle]
pub extern "C" fn memory_grow(env: *mut ExecEnv, inc_pages: i32) -> i32 {
    memory::extend(env, inc_pages)
}

/// Write `len` bytes of linear memory starting at `offset` to stdout.
#[no_mangle]
pub extern "C" fn print(env: *mut ExecEnv, offset: i32, len: i32) {
    let env = unsafe { &*env };
    let (offset, len) = (offset as u32 as usize, len as u32 as usize);
    let memory_len = env.memory_size as usize * PAGE_SIZE;
    assert!(
        offset.checked_add(len).is_some_and(|end| end <= memory_len),
        "print range {offset:#x}+{len:#x} is outside linear memory"
    );
    let bytes = unsafe { std::slice::from_raw_parts(env.memory_base.add(offset), len) };
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(bytes).expect("failed to write to stdout");
    stdout.flush().expect("failed to flush stdout");
}

#[no_mangle]
pub extern "C" fn print_i32(_env: *mut ExecEnv, value: i32) {
    println!("{value}");
}

#[no_mangle]
pub extern "C" fn sleep_msec(_env: *mut ExecEnv, ms: i32) {
    std::thread::sleep(std::time::Duration::from_millis(ms.max(0) as u64));
}

/* Checkpoint: push side (CHECKPOINT_CONTINUE) */

/// Enter the cooperative checkpoint phase. Generated code calls this when a
/// poll site observes CHECKPOINT_START; it then records its own state
/// through the push API while unwinding out of `aot_main`, and the driver
/// finalizes the snapshot.
#[no_mangle]
pub extern "C" fn start_checkpoint(env: *mut ExecEnv) {
    assert_state(env, MigrationState::CheckpointStart, "start_checkpoint");
    debug!("entering cooperative checkpoint");
    unsafe { exec_env::set_migration_state(env, MigrationState::CheckpointContinue) };
}

#[no_mangle]
pub extern "C" fn push_frame(env: *mut ExecEnv) {
    assert_state(env, MigrationState::CheckpointContinue, "push_frame");
    checkpoint_state().frames.push_back(Frame::new());
}

#[no_mangle]
pub extern "C" fn set_pc_to_frame(env: *mut ExecEnv, fn_index: u32, pc: u32) {
    assert_state(env, MigrationState::CheckpointContinue, "set_pc_to_frame");
    let mut state = checkpoint_state();
    let frame = state.frames.back_mut().expect("no frame to set pc on");
    frame.fn_index = fn_index;
    frame.pc = pc;
}

fn push_local(env: *mut ExecEnv, value: Value) {
    assert_state(env, MigrationState::CheckpointContinue, "push_local");
    let mut state = checkpoint_state();
    let frame = state.frames.back_mut().expect("no frame to push a local to");
    frame.locals.push_back(value);
}

fn push_stack(env: *mut ExecEnv, value: Value) {
    assert_state(env, MigrationState::CheckpointContinue, "push");
    let mut state = checkpoint_state();
    let frame = state.frames.back_mut().expect("no frame to push to");
    frame.stack.push(value);
}

fn push_global(env: *mut ExecEnv, value: Value) {
    assert_state(env, MigrationState::CheckpointContinue, "push_global");
    checkpoint_state().globals.push_back(value);
}

#[no_mangle]
pub extern "C" fn push_local_i32(env: *mut ExecEnv, value: i32) {
    push_local(env, Value::I32(value));
}

#[no_mangle]
pub extern "C" fn push_local_i64(env: *mut ExecEnv, value: i64) {
    push_local(env, Value::I64(value));
}

#[no_mangle]
pub extern "C" fn push_local_f32(env: *mut ExecEnv, value: f32) {
    push_local(env, Value::F32(value));
}

#[no_mangle]
pub extern "C" fn push_local_f64(env: *mut ExecEnv, value: f64) {
    push_local(env, Value::F64(value));
}

#[no_mangle]
pub extern "C" fn push_i32(env: *mut ExecEnv, value: i32) {
    push_stack(env, Value::I32(value));
}

#[no_mangle]
pub extern "C" fn push_i64(env: *mut ExecEnv, value: i64) {
    push_stack(env, Value::I64(value));
}

#[no_mangle]
pub extern "C" fn push_f32(env: *mut ExecEnv, value: f32) {
    push_stack(env, Value::F32(value));
}

#[no_mangle]
pub extern "C" fn push_f64(env: *mut ExecEnv, value: f64) {
    push_stack(env, Value::F64(value));
}

#[no_mangle]
pub extern "C" fn push_global_i32(env: *mut ExecEnv, value: i32) {
    push_global(env, Value::I32(value));
}

#[no_mangle]
pub extern "C" fn push_global_i64(env: *mut ExecEnv, value: i64) {
    push_global(env, Value::I64(value));
}

#[no_mangle]
pub extern "C" fn push_global_f32(env: *mut ExecEnv, value: f32) {
    push_global(env, Value::F32(value));
}

#[no_mangle]
pub extern "C" fn push_global_f64(env: *mut ExecEnv, value: f64) {
    push_global(env, Value::F64(value));
}

#[no_mangle]
pub extern "C" fn push_table_index(env: *mut ExecEnv, index: u32) {
    assert_state(env, MigrationState::CheckpointContinue, "push_table_index");
    checkpoint_state().table.push_back(index);
}

/* Checkpoint: pop side (RESTORE) */

/// Drop the outermost remaining frame. Its locals must already have been
/// popped. Popping the last frame completes the restore and transitions the
/// migration state back to NONE.
#[no_mangle]
pub extern "C" fn pop_front_frame(env: *mut ExecEnv) {
    assert_state(env, MigrationState::Restore, "pop_front_frame");
    let mut state = checkpoint_state();
    let frame = state.frames.pop_front().expect("no frame to restore");
    assert!(
        frame.locals.is_empty(),
        "frame popped with {} locals still queued",
        frame.locals.len()
    );
    debug!("popped frame of func_{}, {} remaining", frame.fn_index, state.frames.len());

    if state.frames.is_empty() {
        assert!(
            state.restore_stack.is_empty(),
            "restore finished with {} operand values left",
            state.restore_stack.len()
        );
        unsafe { exec_env::set_migration_state(env, MigrationState::None) };
        debug!("restore complete");
    }
}

/// Whether any frames remain to restore. Unlike the rest of the pop API
/// this is also legal after the restore completed, where generated code
/// uses it to fall through into normal execution.
#[no_mangle]
pub extern "C" fn frame_is_empty(_env: *mut ExecEnv) -> bool {
    checkpoint_state().frames.is_empty()
}

#[no_mangle]
pub extern "C" fn get_pc_from_frame(env: *mut ExecEnv) -> u32 {
    assert_state(env, MigrationState::Restore, "get_pc_from_frame");
    checkpoint_state()
        .frames
        .front()
        .expect("no frame to restore")
        .pc
}

fn pop_front_local(env: *mut ExecEnv) -> Value {
    assert_state(env, MigrationState::Restore, "pop_front_local");
    checkpoint_state()
        .frames
        .front_mut()
        .expect("no frame to restore")
        .locals
        .pop_front()
        .expect("no local to pop")
}

fn pop_operand(env: *mut ExecEnv) -> Value {
    assert_state(env, MigrationState::Restore, "pop");
    checkpoint_state()
        .restore_stack
        .pop_front()
        .expect("restore stack is empty")
}

fn pop_front_global(env: *mut ExecEnv) -> Value {
    assert_state(env, MigrationState::Restore, "pop_front_global");
    checkpoint_state()
        .globals
        .pop_front()
        .expect("no global to pop")
}

#[no_mangle]
pub extern "C" fn pop_front_local_i32(env: *mut ExecEnv) -> i32 {
    pop_front_local(env).unwrap_i32()
}

#[no_mangle]
pub extern "C" fn pop_front_local_i64(env: *mut ExecEnv) -> i64 {
    pop_front_local(env).unwrap_i64()
}

#[no_mangle]
pub extern "C" fn pop_front_local_f32(env: *mut ExecEnv) -> f32 {
    pop_front_local(env).unwrap_f32()
}

#[no_mangle]
pub extern "C" fn pop_front_local_f64(env: *mut ExecEnv) -> f64 {
    pop_front_local(env).unwrap_f64()
}

#[no_mangle]
pub extern "C" fn pop_i32(env: *mut ExecEnv) -> i32 {
    pop_operand(env).unwrap_i32()
}

#[no_mangle]
pub extern "C" fn pop_i64(env: *mut ExecEnv) -> i64 {
    pop_operand(env).unwrap_i64()
}

#[no_mangle]
pub extern "C" fn pop_f32(env: *mut ExecEnv) -> f32 {
    pop_operand(env).unwrap_f32()
}

#[no_mangle]
pub extern "C" fn pop_f64(env: *mut ExecEnv) -> f64 {
    pop_operand(env).unwrap_f64()
}

#[no_mangle]
pub extern "C" fn pop_front_global_i32(env: *mut ExecEnv) -> i32 {
    pop_front_global(env).unwrap_i32()
}

#[no_mangle]
pub extern "C" fn pop_front_global_i64(env: *mut ExecEnv) -> i64 {
    pop_front_global(env).unwrap_i64()
}

#[no_mangle]
pub extern "C" fn pop_front_global_f32(env: *mut ExecEnv) -> f32 {
    pop_front_global(env).unwrap_f32()
}

#[no_mangle]
pub extern "C" fn pop_front_global_f64(env: *mut ExecEnv) -> f64 {
    pop_front_global(env).unwrap_f64()
}

#[no_mangle]
pub extern "C" fn pop_front_table_index(env: *mut ExecEnv) -> u32 {
    assert_state(env, MigrationState::Restore, "pop_front_table_index");
    checkpoint_state()
        .table
        .pop_front()
        .expect("indirect-call table is empty")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec_env::exec_env_ptr;

    // The push/pop API runs against process-wide state, so a single test
    // drives one full checkpoint-continue/restore cycle through the exact
    // call sequence generated code performs.
    #[test]
    fn push_then_pop_full_cycle() {
        let env = exec_env_ptr();
        unsafe { exec_env::set_migration_state(env, MigrationState::CheckpointContinue) };

        // Outermost frame first, the order the continue path records them.
        push_frame(env);
        set_pc_to_frame(env, 3, 7);
        push_local_i32(env, 1);
        push_local_f64(env, 2.5);
        push_i64(env, 9);

        push_frame(env);
        set_pc_to_frame(env, 4, 11);
        push_local_i64(env, -8);
        push_f32(env, 0.25);

        push_global_i32(env, 42);
        push_table_index(env, 5);

        // What the driver does between decode and aot_main.
        checkpoint_state().prepare_restore();
        unsafe { exec_env::set_migration_state(env, MigrationState::Restore) };

        // Outer frame restores first.
        assert!(!frame_is_empty(env));
        assert_eq!(get_pc_from_frame(env), 7);
        assert_eq!(pop_front_local_i32(env), 1);
        assert_eq!(pop_front_local_f64(env), 2.5);
        assert_eq!(pop_i64(env), 9);
        assert_eq!(pop_front_global_i32(env), 42);
        assert_eq!(pop_front_table_index(env), 5);
        pop_front_frame(env);

        assert!(!frame_is_empty(env));
        assert_eq!(get_pc_from_frame(env), 11);
        assert_eq!(pop_front_local_i64(env), -8);
        assert_eq!(pop_f32(env), 0.25);
        pop_front_frame(env);

        // Last frame popped: restore is complete.
        assert!(frame_is_empty(env));
        assert_eq!(
            unsafe { exec_env::migration_state(env) },
            MigrationState::None
        );
    }
}
