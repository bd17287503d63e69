// Thread (coroutine) state.
//
// A thread is an independent value stack plus a CallInfo chain. Exactly
// one thread executes at a time: its ExecContext is moved out of the pool
// object into the VM while it runs, and moved back on yield/return. That
// move is what makes resume/yield a context switch with no copying of
// individual values between live stacks.

use crate::gc::UpvalueId;
use crate::lua_value::LuaValue;
use crate::lua_vm::{CallInfo, ThreadStatus, lua_limits};

/// Coroutine lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineStatus {
    /// Created or yielded; can be resumed.
    Suspended,
    /// Currently executing.
    Running,
    /// Resumed another coroutine and is waiting for it.
    Normal,
    /// Finished, errored, or closed.
    Dead,
}

impl CoroutineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoroutineStatus::Suspended => "suspended",
            CoroutineStatus::Running => "running",
            CoroutineStatus::Normal => "normal",
            CoroutineStatus::Dead => "dead",
        }
    }
}

/// The execution state of one thread: everything resume/yield swaps.
pub struct ExecContext {
    /// Value stack. Grows on demand; every reference into it anywhere in
    /// the VM is an index, so growth never invalidates anything.
    pub stack: Vec<LuaValue>,
    /// First free slot.
    pub top: usize,
    /// Active call frames, innermost last.
    pub frames: Vec<CallInfo>,
    /// Open upvalue cells pointing into this stack, sorted by slot
    /// descending (innermost scopes first).
    pub open_upvalues: Vec<UpvalueId>,
    /// Stack slots marked to-be-closed, ascending.
    pub tbc: Vec<usize>,
    /// Last status code of this thread.
    pub status: ThreadStatus,
    /// Error payload when status is an error.
    pub error_value: LuaValue,
    /// Values passed out by an in-flight yield.
    pub yield_values: Vec<LuaValue>,
    /// Rust-frame re-entry depth for this thread.
    pub native_depth: usize,
    /// Frame index of the native function that originated an in-flight
    /// yield, used to tell a legal immediate-return yield from a yield
    /// that would cross a native frame without a continuation.
    pub yield_origin: Option<usize>,
}

impl ExecContext {
    pub fn new() -> Self {
        let mut stack = Vec::with_capacity(lua_limits::BASIC_STACK_SIZE);
        stack.resize(lua_limits::BASIC_STACK_SIZE, LuaValue::Nil);
        ExecContext {
            stack,
            top: 0,
            frames: Vec::with_capacity(8),
            open_upvalues: Vec::new(),
            tbc: Vec::new(),
            status: ThreadStatus::Ok,
            error_value: LuaValue::Nil,
            yield_values: Vec::new(),
            native_depth: 0,
            yield_origin: None,
        }
    }

    /// Everything the GC must treat as reachable through this context.
    /// The whole stack vector is scanned, not just up to `top`: stale
    /// slots above it can only hold values that were live a moment ago,
    /// and scanning them is cheaper than clearing on every pop.
    pub fn reachable_values(&self) -> Vec<LuaValue> {
        let mut out = Vec::with_capacity(self.stack.len() + self.yield_values.len() + 1);
        out.extend_from_slice(&self.stack);
        out.extend_from_slice(&self.yield_values);
        out.push(self.error_value);
        out
    }
}

impl Default for ExecContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A thread object in the GC pool. While the thread runs, its context is
/// moved into the VM and `ctx` is None.
pub struct LuaThread {
    pub status: CoroutineStatus,
    pub ctx: Option<ExecContext>,
}

impl LuaThread {
    /// A fresh coroutine: suspended with the body function at slot 0.
    pub fn new_suspended(func: LuaValue) -> Self {
        let mut ctx = ExecContext::new();
        ctx.stack[0] = func;
        ctx.top = 1;
        LuaThread {
            status: CoroutineStatus::Suspended,
            ctx: Some(ctx),
        }
    }

    /// Shell for the currently running thread (context lives in the VM).
    pub fn running_shell() -> Self {
        LuaThread {
            status: CoroutineStatus::Running,
            ctx: None,
        }
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.status, CoroutineStatus::Dead)
    }

    pub fn can_resume(&self) -> bool {
        matches!(self.status, CoroutineStatus::Suspended)
    }

    /// Read a stack slot of a parked context (open-upvalue access and GC
    /// traversal of suspended threads).
    pub fn saved_stack_value(&self, slot: usize) -> Option<LuaValue> {
        self.ctx.as_ref()?.stack.get(slot).copied()
    }

    pub fn reachable_values(&self) -> Vec<LuaValue> {
        match &self.ctx {
            Some(ctx) => ctx.reachable_values(),
            None => Vec::new(),
        }
    }

    pub fn open_upvalue_ids(&self) -> Vec<UpvalueId> {
        match &self.ctx {
            Some(ctx) => ctx.open_upvalues.clone(),
            None => Vec::new(),
        }
    }
}
