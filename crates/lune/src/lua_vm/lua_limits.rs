//! Centralized limits and configuration constants.

// ===== Stack =====

/// Extra slots above a frame's top for metamethod calls and temporaries.
pub const EXTRA_STACK: usize = 5;

/// Minimum guaranteed stack slots available to a native function.
pub const MIN_STACK: usize = 20;

/// Initial stack capacity for a new thread.
pub const BASIC_STACK_SIZE: usize = 2 * MIN_STACK;

/// Hard ceiling on the value stack (number of slots).
pub const MAX_STACK: usize = 1_000_000;

/// Default maximum call nesting depth (CallInfo chain).
pub const MAX_CALL_DEPTH: usize = 200;

/// Extra call-depth allowance while an error is being handled, so error
/// handlers and `__close` can still run after an overflow.
pub const EXTRA_CALLS: usize = 30;

/// Native (Rust) re-entry depth; bounds real OS-stack usage from
/// native->interpreted->native recursion.
pub const MAX_NATIVE_DEPTH: usize = 120;

// ===== Functions =====

/// Maximum upvalues per closure.
pub const MAX_UPVALUES: usize = 255;

/// Multiple-results sentinel for call/return counts.
pub const MULTRET: i32 = -1;

// ===== Pseudo-indices =====

/// Pseudo-index addressing the registry table.
pub const REGISTRY_INDEX: i32 = -1_001_000;

/// Pseudo-index for upvalue `i` (1-based) of the running native closure.
pub const fn upvalue_index(i: i32) -> i32 {
    REGISTRY_INDEX - i
}

// ===== Metamethods =====

/// Maximum `__index` / `__newindex` chain length before the lookup is
/// declared cyclic.
pub const MAX_TAG_LOOP: usize = 100;

// ===== Registry =====

/// Registry slot holding the globals table.
pub const RIDX_GLOBALS: i64 = 1;
/// Registry slot holding the main thread.
pub const RIDX_MAIN_THREAD: i64 = 2;
/// First registry slot available to the reference system.
pub const RIDX_FIRST_FREE: i64 = 3;
