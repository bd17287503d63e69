// Value model: tagged values, strings, tables, userdata, coercions.

mod lua_convert;
mod lua_table;
mod lua_userdata;
mod lua_value;

pub use lua_convert::{float_to_integer, float_to_str, number_to_str, str_to_number, to_integer};
pub use lua_table::LuaTable;
pub use lua_userdata::LuaUserdata;
pub use lua_value::{LuaString, LuaValue, LuaValueKind, TableKey};
