//! In-memory representation of frozen guest state.
//!
//! One `Checkpoint` exists per process and lives for the duration of a
//! single checkpoint or restore session. During a checkpoint it is filled
//! by the OSR engine (or by generated code through the push API); during a
//! restore it is drained front-to-back by generated restore prologues.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::value::Value;

/// Sentinel for a frame whose location has not been recorded yet.
pub const UNSET_INDEX: u32 = u32::MAX;

/// A single frozen wasm frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub fn_index: u32,
    /// Wasm instruction offset from the start of the function.
    pub pc: u32,
    pub locals: VecDeque<Value>,
    pub stack: Vec<Value>,
}

impl Frame {
    pub fn new() -> Frame {
        Frame {
            fn_index: UNSET_INDEX,
            pc: UNSET_INDEX,
            locals: VecDeque::new(),
            stack: Vec::new(),
        }
    }
}

impl Default for Frame {
    fn default() -> Frame {
        Frame::new()
    }
}

/// The frozen guest state: call stack (outermost caller first), globals,
/// indirect-call table, and the linear-memory page count.
#[derive(Debug, PartialEq)]
pub struct Checkpoint {
    pub frames: VecDeque<Frame>,
    pub globals: VecDeque<Value>,
    pub table: VecDeque<u32>,
    pub memory_pages: u32,
    /// Operand values queued for restore. Generated code pops operand
    /// values *before* the corresponding frame pop, so at restore time they
    /// must be reachable independently of frame granularity; see
    /// [`Checkpoint::prepare_restore`].
    pub restore_stack: VecDeque<Value>,
}

impl Checkpoint {
    pub const fn new() -> Checkpoint {
        Checkpoint {
            frames: VecDeque::new(),
            globals: VecDeque::new(),
            table: VecDeque::new(),
            memory_pages: 0,
            restore_stack: VecDeque::new(),
        }
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.globals.clear();
        self.table.clear();
        self.memory_pages = 0;
        self.restore_stack.clear();
    }

    /// Move every frame's operand stack, in frame order, onto the single
    /// restore queue. After this each frame's `stack` is empty.
    pub fn prepare_restore(&mut self) {
        self.restore_stack.clear();
        for frame in &mut self.frames {
            self.restore_stack.extend(frame.stack.drain(..));
        }
    }
}

static STATE: Mutex<Checkpoint> = Mutex::new(Checkpoint::new());

/// Lock the process-wide checkpoint state.
///
/// The guest thread and the supervisor only ever touch this in disjoint
/// phases, so the lock is uncontended; it exists to keep the accessors
/// safe.
pub fn checkpoint_state() -> MutexGuard<'static, Checkpoint> {
    STATE.lock().unwrap_or_else(PoisonError::into_inner)
}
