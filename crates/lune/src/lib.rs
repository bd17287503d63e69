// Lune - an embeddable Lua-style runtime core.
//
// Object model, string interning, hybrid tables, an incremental and
// generational garbage collector, and a call/coroutine engine behind a
// stack-oriented embedding API. The compiler front end and standard
// library are external collaborators: prototypes arrive through
// `ProtoBuilder` or the chunk loader.

#[cfg(test)]
mod test;

pub mod gc;
pub mod lua_value;
pub mod lua_vm;

pub use gc::{FunctionId, GcId, StringId, TableId, ThreadId, UpvalueId, UserdataId};
pub use lua_value::{LuaString, LuaTable, LuaUserdata, LuaValue, LuaValueKind};
pub use lua_vm::{
    ArithOp, CmpOp, CoroutineStatus, Instruction, LuaBuffer, LuaError, LuaResult, LuaVM, NativeFn,
    Proto, ProtoBuilder, Reader, RefId, SafeOption, SliceReader, ThreadStatus, UnaryOp, UpvalDesc,
    VecWriter, Writer, lua_limits, upvalue_index, MULTRET, REGISTRY_INDEX,
};
