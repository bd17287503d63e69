// Traceback assembly.
//
// Built lazily, only when someone asks: the non-error path never pays for
// it. Frames reused by tail calls show the marker instead of a chain of
// phantom callers.

use crate::gc::FunctionBody;
use crate::lua_vm::LuaVM;

impl LuaVM {
    /// Render the current call chain, innermost frame first.
    pub fn traceback(&self) -> String {
        let mut out = String::from("stack traceback:");
        for ci in self.ctx.frames.iter().rev() {
            let fv = self.ctx.stack.get(ci.func).copied();
            let line = match fv.and_then(|v| v.as_function_id()) {
                Some(fid) => match self.gc.pool.get_function(fid) {
                    Some(FunctionBody::Lua { proto, .. }) => {
                        let line = proto
                            .line_at(ci.pc.saturating_sub(1))
                            .unwrap_or(proto.line_defined);
                        format!("\n\t{}:{}: in function", proto.source, line)
                    }
                    Some(FunctionBody::Native { .. }) => "\n\t[native]: in function".to_string(),
                    None => "\n\t?: in function".to_string(),
                },
                None => match fv {
                    Some(v) if matches!(v, crate::lua_value::LuaValue::NativeFunction(_)) => {
                        "\n\t[native]: in function".to_string()
                    }
                    _ => "\n\t?: in ?".to_string(),
                },
            };
            out.push_str(&line);
            if ci.is_tail() {
                out.push_str("\n\t(...tail calls...)");
            }
        }
        out
    }

    /// Current source position (innermost interpreted frame), for error
    /// message prefixes.
    pub fn where_am_i(&self) -> String {
        for ci in self.ctx.frames.iter().rev() {
            if !ci.is_lua() {
                continue;
            }
            let fv = self.ctx.stack.get(ci.func).copied();
            if let Some(fid) = fv.and_then(|v| v.as_function_id()) {
                if let Some(FunctionBody::Lua { proto, .. }) = self.gc.pool.get_function(fid) {
                    let line = proto
                        .line_at(ci.pc.saturating_sub(1))
                        .unwrap_or(proto.line_defined);
                    return format!("{}:{}: ", proto.source, line);
                }
            }
        }
        String::new()
    }
}
