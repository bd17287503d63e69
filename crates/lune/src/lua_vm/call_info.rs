// CallInfo - one record per active invocation on a thread.
//
// Everything that refers into the value stack is an offset from the stack
// base, never a pointer: the stack reallocates on growth.

use crate::lua_vm::{LuaResult, LuaVM, ThreadStatus};

/// Continuation invoked when a native call that yielded is resumed.
/// Receives the status the protected body finished with and the opaque
/// context word the native function registered. Returns the number of
/// results it left on the stack, like a native function body.
pub type Continuation = fn(&mut LuaVM, ThreadStatus, i64) -> LuaResult<i32>;

/// Call status flags.
pub mod call_status {
    /// Interpreted function.
    pub const CIST_LUA: u32 = 1 << 0;
    /// Native function.
    pub const CIST_NATIVE: u32 = 1 << 1;
    /// Frame was reused by a tail call at least once.
    pub const CIST_TAIL: u32 = 1 << 2;
    /// Frame is a protected-call boundary with continuation support.
    pub const CIST_YPCALL: u32 = 1 << 3;
    /// Frame is closing to-be-closed variables during return.
    pub const CIST_CLSRET: u32 = 1 << 4;
}

/// One active call frame.
#[derive(Clone)]
pub struct CallInfo {
    /// Stack slot holding the function being called.
    pub func: usize,

    /// First register of the frame (func + 1 for native calls; after the
    /// fixed parameters for interpreted calls).
    pub base: usize,

    /// Frame top: first stack slot this frame may not touch without a
    /// `check_stack` reservation.
    pub top: usize,

    /// Next instruction to execute (interpreted frames).
    pub pc: usize,

    /// Results expected by the caller; MULTRET for "all of them".
    pub nresults: i32,

    /// CIST_* flags.
    pub call_status: u32,

    /// Extra arguments received beyond the declared parameters (vararg
    /// functions); they sit between `func` and `base`.
    pub nextraargs: usize,

    /// Continuation for a yieldable native call, with its context word.
    pub continuation: Option<Continuation>,
    pub continuation_ctx: i64,

    /// Where the results of an interrupted call land on resume: the stack
    /// slot of the callee that yielded, or usize::MAX when nothing is
    /// pending.
    pub pending_result_slot: usize,
    /// Expected result count for the interrupted call.
    pub pending_nresults: i32,
}

impl CallInfo {
    pub fn new_lua(func: usize, base: usize, top: usize, nresults: i32) -> Self {
        Self {
            func,
            base,
            top,
            pc: 0,
            nresults,
            call_status: call_status::CIST_LUA,
            nextraargs: 0,
            continuation: None,
            continuation_ctx: 0,
            pending_result_slot: usize::MAX,
            pending_nresults: 0,
        }
    }

    pub fn new_native(func: usize, base: usize, top: usize, nresults: i32) -> Self {
        Self {
            func,
            base,
            top,
            pc: 0,
            nresults,
            call_status: call_status::CIST_NATIVE,
            nextraargs: 0,
            continuation: None,
            continuation_ctx: 0,
            pending_result_slot: usize::MAX,
            pending_nresults: 0,
        }
    }

    #[inline(always)]
    pub fn is_lua(&self) -> bool {
        self.call_status & call_status::CIST_LUA != 0
    }

    #[inline(always)]
    pub fn is_native(&self) -> bool {
        self.call_status & call_status::CIST_NATIVE != 0
    }

    #[inline(always)]
    pub fn is_tail(&self) -> bool {
        self.call_status & call_status::CIST_TAIL != 0
    }

    #[inline(always)]
    pub fn set_tail(&mut self) {
        self.call_status |= call_status::CIST_TAIL;
    }

    #[inline(always)]
    pub fn has_pending_call(&self) -> bool {
        self.pending_result_slot != usize::MAX
    }
}

impl Default for CallInfo {
    fn default() -> Self {
        Self::new_lua(0, 0, 0, -1)
    }
}
