// Lightweight error codes.
//
// The enum is a status code only; the error *payload* (an arbitrary value,
// not necessarily a string) lives on the faulting thread context so a
// Result stays one machine word. `Yield` is an internal control signal
// that unwinds native frames on a coroutine switch; it never reaches the
// embedder as an error.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LuaError {
    /// Runtime error; error value stored on the thread.
    #[error("runtime error")]
    Runtime,
    /// Malformed chunk handed to `load`.
    #[error("syntax error")]
    Syntax,
    /// Allocation refused by the configured memory limit.
    #[error("not enough memory")]
    Memory,
    /// Error raised while handling another error.
    #[error("error in error handling")]
    ErrInErr,
    /// Call or value stack exhausted.
    #[error("stack overflow")]
    StackOverflow,
    /// Internal: coroutine yield in flight.
    #[error("attempt to yield")]
    Yield,
}

pub type LuaResult<T> = Result<T, LuaError>;

/// Thread status as reported to the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Ok,
    Yield,
    ErrRun,
    ErrSyntax,
    ErrMem,
    ErrErr,
}

impl ThreadStatus {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            ThreadStatus::ErrRun | ThreadStatus::ErrSyntax | ThreadStatus::ErrMem | ThreadStatus::ErrErr
        )
    }
}

impl From<LuaError> for ThreadStatus {
    fn from(e: LuaError) -> Self {
        match e {
            LuaError::Runtime | LuaError::StackOverflow => ThreadStatus::ErrRun,
            LuaError::Syntax => ThreadStatus::ErrSyntax,
            LuaError::Memory => ThreadStatus::ErrMem,
            LuaError::ErrInErr => ThreadStatus::ErrErr,
            LuaError::Yield => ThreadStatus::Yield,
        }
    }
}
