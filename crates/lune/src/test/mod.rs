// Integration-style tests, one file per subsystem. The compiler front
// end is an external collaborator, so interpreted functions are built
// directly with ProtoBuilder.

mod test_api;
mod test_calls;
mod test_closures;
mod test_coroutine;
mod test_gc;
mod test_string;
mod test_table;

use crate::lua_vm::{LuaVM, SafeOption};

pub(crate) fn new_vm() -> LuaVM {
    LuaVM::new(SafeOption::default())
}
