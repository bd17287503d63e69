// Embedding API: the stack-oriented surface native code programs against.
//
// Indices follow the classic convention: positive indices are 1-based
// from the running native frame's base, negative indices count back from
// the top, and pseudo-indices reach the registry and the running native
// closure's upvalues without occupying stack slots. Every operation that
// may push verifies capacity first; `check_stack` is the explicit
// reservation hosts use before bulk pushes.

use crate::gc::FunctionBody;
use crate::lua_value::{LuaValue, LuaValueKind, to_integer};
use crate::lua_vm::call_status::CIST_YPCALL;
use crate::lua_vm::{
    Continuation, LuaError, LuaResult, LuaVM, NativeFn, ThreadStatus, lua_limits,
};

/// Resolution of an API index.
enum Resolved {
    Stack(usize),
    Registry,
    Upvalue(usize),
    Invalid,
}

impl LuaVM {
    /// Base slot of the running frame (0 when the host drives the VM with
    /// no active call).
    fn api_base(&self) -> usize {
        match self.ctx.frames.last() {
            Some(ci) => ci.base,
            None => 0,
        }
    }

    fn resolve(&self, idx: i32) -> Resolved {
        if idx > 0 {
            let abs = self.api_base() + idx as usize - 1;
            if abs < self.ctx.top {
                Resolved::Stack(abs)
            } else {
                Resolved::Invalid
            }
        } else if idx == lua_limits::REGISTRY_INDEX {
            Resolved::Registry
        } else if idx < lua_limits::REGISTRY_INDEX {
            Resolved::Upvalue((lua_limits::REGISTRY_INDEX - idx) as usize - 1)
        } else if idx < 0 {
            let back = (-idx) as usize;
            if back <= self.ctx.top - self.api_base() {
                Resolved::Stack(self.ctx.top - back)
            } else {
                Resolved::Invalid
            }
        } else {
            Resolved::Invalid
        }
    }

    /// Value at an index; nil for an empty/invalid slot (checked fatally
    /// in debug builds).
    pub fn value_at(&self, idx: i32) -> LuaValue {
        match self.resolve(idx) {
            Resolved::Stack(abs) => self.ctx.stack.get(abs).copied().unwrap_or(LuaValue::Nil),
            Resolved::Registry => LuaValue::Table(self.registry_id()),
            Resolved::Upvalue(n) => self.native_upvalue(n),
            Resolved::Invalid => {
                debug_assert!(false, "index {idx} outside the frame window");
                LuaValue::Nil
            }
        }
    }

    fn native_upvalue(&self, n: usize) -> LuaValue {
        let Some(ci) = self.ctx.frames.last() else {
            return LuaValue::Nil;
        };
        let fv = self.ctx.stack.get(ci.func).copied().unwrap_or(LuaValue::Nil);
        match fv.as_function_id() {
            Some(fid) => match self.gc.pool.get_function(fid) {
                Some(FunctionBody::Native { upvalues, .. }) => {
                    upvalues.get(n).copied().unwrap_or(LuaValue::Nil)
                }
                _ => LuaValue::Nil,
            },
            None => LuaValue::Nil,
        }
    }

    /// Replace the value at an index (the `replace` primitive, by value).
    pub fn set_value_at(&mut self, idx: i32, v: LuaValue) -> LuaResult<()> {
        match self.resolve(idx) {
            Resolved::Stack(abs) => {
                self.ctx.stack[abs] = v;
                Ok(())
            }
            Resolved::Upvalue(n) => {
                let Some(ci) = self.ctx.frames.last() else {
                    return Err(self.rt_error("no running native closure"));
                };
                let func_slot = ci.func;
                let fv = self.ctx.stack[func_slot];
                let Some(fid) = fv.as_function_id() else {
                    return Err(self.rt_error("no running native closure"));
                };
                match self.gc.pool.get_function_mut(fid) {
                    Some(FunctionBody::Native { upvalues, .. }) => {
                        if n < upvalues.len() {
                            upvalues[n] = v;
                        } else {
                            return Err(self.rt_error("upvalue index out of range"));
                        }
                    }
                    _ => return Err(self.rt_error("no running native closure")),
                }
                self.gc
                    .barrier_forward(crate::gc::GcId::Function(fid), &v);
                Ok(())
            }
            Resolved::Registry => Err(self.rt_error("cannot replace the registry")),
            Resolved::Invalid => Err(self.rt_error("invalid stack index")),
        }
    }

    // ===== top manipulation =====

    /// Number of values on the current frame's stack window.
    pub fn get_top(&self) -> usize {
        self.ctx.top - self.api_base()
    }

    /// Grow (nil-filling) or shrink the window to exactly `n` values.
    pub fn set_top(&mut self, n: usize) -> LuaResult<()> {
        let base = self.api_base();
        let new_top = base + n;
        self.ensure_stack(new_top)?;
        for i in self.ctx.top..new_top {
            self.ctx.stack[i] = LuaValue::Nil;
        }
        self.ctx.top = new_top;
        Ok(())
    }

    pub fn pop(&mut self, n: usize) {
        let base = self.api_base();
        self.ctx.top = self.ctx.top.saturating_sub(n).max(base);
    }

    /// Reserve space for `n` more pushes, growing the stack or failing
    /// with a stack-overflow error.
    pub fn check_stack(&mut self, n: usize) -> LuaResult<()> {
        self.ensure_stack(self.ctx.top + n)
    }

    // ===== push family =====

    pub(crate) fn push_value_raw(&mut self, v: LuaValue) -> LuaResult<()> {
        self.ensure_stack(self.ctx.top + 1)?;
        self.ctx.stack[self.ctx.top] = v;
        self.ctx.top += 1;
        Ok(())
    }

    pub fn push_nil(&mut self) -> LuaResult<()> {
        self.push_value_raw(LuaValue::Nil)
    }

    pub fn push_boolean(&mut self, b: bool) -> LuaResult<()> {
        self.push_value_raw(LuaValue::Boolean(b))
    }

    pub fn push_integer(&mut self, i: i64) -> LuaResult<()> {
        self.push_value_raw(LuaValue::Integer(i))
    }

    pub fn push_number(&mut self, n: f64) -> LuaResult<()> {
        self.push_value_raw(LuaValue::Float(n))
    }

    pub fn push_string(&mut self, s: &str) -> LuaResult<()> {
        let v = self.create_string(s)?;
        self.push_value_raw(v)
    }

    pub fn push_light_userdata(&mut self, p: usize) -> LuaResult<()> {
        self.push_value_raw(LuaValue::LightUserData(p))
    }

    pub fn push_native_function(&mut self, f: NativeFn) -> LuaResult<()> {
        self.push_value_raw(LuaValue::NativeFunction(f))
    }

    /// Pop `nupvalues` values and push a native closure capturing them.
    pub fn push_native_closure(&mut self, f: NativeFn, nupvalues: usize) -> LuaResult<()> {
        if nupvalues > lua_limits::MAX_UPVALUES {
            return Err(self.rt_error("too many upvalues"));
        }
        let base = self.ctx.top - nupvalues;
        let ups: Vec<LuaValue> = self.ctx.stack[base..self.ctx.top].to_vec();
        self.ctx.top = base;
        let v = self.create_native_closure(f, ups)?;
        self.push_value_raw(v)
    }

    /// Push a copy of the value at `idx`.
    pub fn push_value(&mut self, idx: i32) -> LuaResult<()> {
        let v = self.value_at(idx);
        self.push_value_raw(v)
    }

    pub fn push_lua_value(&mut self, v: LuaValue) -> LuaResult<()> {
        self.push_value_raw(v)
    }

    // ===== shuffling =====

    /// Move the top value into `idx`, shifting values up.
    pub fn insert(&mut self, idx: i32) -> LuaResult<()> {
        self.rotate(idx, 1)
    }

    /// Remove the value at `idx`, shifting values down.
    pub fn remove(&mut self, idx: i32) -> LuaResult<()> {
        self.rotate(idx, -1)?;
        self.pop(1);
        Ok(())
    }

    /// Pop the top value and write it over `idx`.
    pub fn replace(&mut self, idx: i32) -> LuaResult<()> {
        let v = self.value_at(-1);
        self.pop(1);
        self.set_value_at(idx, v)
    }

    /// Copy a value between indices without disturbing the top.
    pub fn copy_value(&mut self, from: i32, to: i32) -> LuaResult<()> {
        let v = self.value_at(from);
        self.set_value_at(to, v)
    }

    /// Rotate the window [idx, top] by `n` positions (positive: toward
    /// the top). The classic triple-reverse.
    pub fn rotate(&mut self, idx: i32, n: i32) -> LuaResult<()> {
        let Resolved::Stack(abs) = self.resolve(idx) else {
            return Err(self.rt_error("invalid index to rotate"));
        };
        let top = self.ctx.top;
        let len = top - abs;
        if len == 0 {
            return Ok(());
        }
        let n = ((n % len as i32) + len as i32) as usize % len;
        let seg = &mut self.ctx.stack[abs..top];
        seg.reverse();
        seg[..n].reverse();
        seg[n..].reverse();
        Ok(())
    }

    // ===== introspection =====

    pub fn type_of(&self, idx: i32) -> LuaValueKind {
        self.value_at(idx).kind()
    }

    pub fn type_name_at(&self, idx: i32) -> &'static str {
        self.value_at(idx).type_name()
    }

    pub fn is_nil(&self, idx: i32) -> bool {
        self.value_at(idx).is_nil()
    }

    pub fn is_boolean(&self, idx: i32) -> bool {
        matches!(self.value_at(idx), LuaValue::Boolean(_))
    }

    pub fn is_number(&self, idx: i32) -> bool {
        self.value_at(idx).is_number()
    }

    pub fn is_string(&self, idx: i32) -> bool {
        self.value_at(idx).is_string()
    }

    pub fn is_table(&self, idx: i32) -> bool {
        self.value_at(idx).is_table()
    }

    pub fn is_function(&self, idx: i32) -> bool {
        self.value_at(idx).is_function()
    }

    pub fn is_thread(&self, idx: i32) -> bool {
        self.value_at(idx).is_thread()
    }

    // ===== extraction (to_*: sentinel, check_*: argument error) =====

    /// Truthiness of the value (never fails).
    pub fn to_boolean(&self, idx: i32) -> bool {
        self.value_at(idx).is_truthy()
    }

    /// Integer with coercion from integral floats and numeric strings.
    pub fn to_integer(&self, idx: i32) -> Option<i64> {
        let v = self.value_at(idx);
        if let Some(i) = to_integer(&v) {
            return Some(i);
        }
        self.string_content(&v)
            .and_then(crate::lua_value::str_to_number)
            .as_ref()
            .and_then(to_integer)
    }

    /// Float with coercion from numeric strings.
    pub fn to_number(&self, idx: i32) -> Option<f64> {
        let v = self.value_at(idx);
        if let Some(n) = v.as_number() {
            return Some(n);
        }
        self.string_content(&v)
            .and_then(crate::lua_value::str_to_number)
            .and_then(|x| x.as_number())
    }

    /// String content without coercion.
    pub fn to_str(&self, idx: i32) -> Option<&str> {
        let v = self.value_at(idx);
        let sid = v.as_string_id()?;
        self.gc.pool.get_string(sid).map(|s| s.as_str())
    }

    /// String with number-to-string coercion.
    pub fn to_string_coerce(&self, idx: i32) -> Option<String> {
        let v = self.value_at(idx);
        match v {
            LuaValue::String(_) => self.to_str(idx).map(|s| s.to_string()),
            LuaValue::Integer(_) | LuaValue::Float(_) => crate::lua_value::number_to_str(&v),
            _ => None,
        }
    }

    fn arg_error(&mut self, arg: i32, expected: &str) -> LuaError {
        let got = self.type_name_at(arg);
        self.rt_error(format!("bad argument #{arg} ({expected} expected, got {got})"))
    }

    pub fn check_integer(&mut self, arg: i32) -> LuaResult<i64> {
        match self.to_integer(arg) {
            Some(i) => Ok(i),
            None => Err(self.arg_error(arg, "integer")),
        }
    }

    pub fn check_number(&mut self, arg: i32) -> LuaResult<f64> {
        match self.to_number(arg) {
            Some(n) => Ok(n),
            None => Err(self.arg_error(arg, "number")),
        }
    }

    pub fn check_string(&mut self, arg: i32) -> LuaResult<String> {
        match self.to_string_coerce(arg) {
            Some(s) => Ok(s),
            None => Err(self.arg_error(arg, "string")),
        }
    }

    pub fn check_table(&mut self, arg: i32) -> LuaResult<LuaValue> {
        let v = self.value_at(arg);
        if v.is_table() {
            Ok(v)
        } else {
            Err(self.arg_error(arg, "table"))
        }
    }

    pub fn check_function(&mut self, arg: i32) -> LuaResult<LuaValue> {
        let v = self.value_at(arg);
        if v.is_function() {
            Ok(v)
        } else {
            Err(self.arg_error(arg, "function"))
        }
    }

    /// Optional argument with a caller default instead of an error.
    pub fn opt_integer(&mut self, arg: i32, default: i64) -> LuaResult<i64> {
        if self.value_at(arg).is_nil() {
            return Ok(default);
        }
        self.check_integer(arg)
    }

    pub fn opt_number(&mut self, arg: i32, default: f64) -> LuaResult<f64> {
        if self.value_at(arg).is_nil() {
            return Ok(default);
        }
        self.check_number(arg)
    }

    pub fn opt_string(&mut self, arg: i32, default: &str) -> LuaResult<String> {
        if self.value_at(arg).is_nil() {
            return Ok(default.to_string());
        }
        self.check_string(arg)
    }

    // ===== table access via the stack =====

    /// Push a fresh table.
    pub fn new_table(&mut self, array_hint: usize, hash_hint: usize) -> LuaResult<()> {
        let t = self.create_table(array_hint, hash_hint)?;
        self.push_value_raw(t)
    }

    /// t[k] with metamethods: table at `idx`, key on top, replaced by the
    /// result.
    pub fn get_index(&mut self, idx: i32) -> LuaResult<()> {
        let t = self.value_at(idx);
        let k = self.value_at(-1);
        self.pop(1);
        let v = self.table_get(t, k)?;
        self.push_value_raw(v)
    }

    /// t[k] = v with metamethods: table at `idx`, key below value on top;
    /// both popped.
    pub fn set_index(&mut self, idx: i32) -> LuaResult<()> {
        let t = self.value_at(idx);
        let k = self.value_at(-2);
        let v = self.value_at(-1);
        self.pop(2);
        self.table_set(t, k, v)
    }

    /// t.name with metamethods; result pushed.
    pub fn get_field(&mut self, idx: i32, name: &str) -> LuaResult<()> {
        let t = self.value_at(idx);
        let k = self.create_string(name)?;
        let v = self.table_get(t, k)?;
        self.push_value_raw(v)
    }

    /// t.name = top-of-stack (popped), with metamethods.
    pub fn set_field(&mut self, idx: i32, name: &str) -> LuaResult<()> {
        let t = self.value_at(idx);
        let k = self.create_string(name)?;
        let v = self.value_at(-1);
        self.pop(1);
        self.table_set(t, k, v)
    }

    /// Raw t[i]; result pushed.
    pub fn raw_geti(&mut self, idx: i32, i: i64) -> LuaResult<()> {
        let t = self.value_at(idx);
        let Some(tid) = t.as_table_id() else {
            return Err(self.type_error("index", &t));
        };
        let v = self
            .gc
            .pool
            .get_table(tid)
            .map(|table| table.raw_geti(i))
            .unwrap_or(LuaValue::Nil);
        self.push_value_raw(v)
    }

    /// Raw t[i] = top-of-stack (popped).
    pub fn raw_seti(&mut self, idx: i32, i: i64) -> LuaResult<()> {
        let t = self.value_at(idx);
        let Some(tid) = t.as_table_id() else {
            return Err(self.type_error("index", &t));
        };
        let v = self.value_at(-1);
        self.pop(1);
        self.raw_set_checked(tid, &LuaValue::Integer(i), v)
    }

    /// Raw get: table at `idx`, key on top replaced by the value.
    pub fn raw_get_index(&mut self, idx: i32) -> LuaResult<()> {
        let t = self.value_at(idx);
        let k = self.value_at(-1);
        self.pop(1);
        let v = self.raw_get(&t, &k);
        self.push_value_raw(v)
    }

    /// Raw set: table at `idx`, key below value on top, both popped.
    pub fn raw_set_index(&mut self, idx: i32) -> LuaResult<()> {
        let t = self.value_at(idx);
        let Some(tid) = t.as_table_id() else {
            return Err(self.type_error("index", &t));
        };
        let k = self.value_at(-2);
        let v = self.value_at(-1);
        self.pop(2);
        self.raw_set_checked(tid, &k, v)
    }

    // ===== invocation =====

    /// Unprotected call: function and `nargs` arguments on top of the
    /// stack. An error with no enclosing protected boundary reaches the
    /// panic handler.
    pub fn call(&mut self, nargs: usize, nresults: i32) -> LuaResult<()> {
        let func_slot = self.ctx.top - nargs - 1;
        match self.do_call(func_slot, nargs, nresults) {
            Ok(()) => Ok(()),
            Err(LuaError::Yield) => Err(LuaError::Yield),
            Err(e) => Err(self.unprotected_error(e)),
        }
    }

    /// Protected call: on error the stack is unwound to the boundary, the
    /// error value is pushed, and the status is returned. Yield still
    /// propagates (a plain pcall is not a yield barrier for its caller).
    pub fn pcall(&mut self, nargs: usize, nresults: i32) -> LuaResult<ThreadStatus> {
        let func_slot = self.ctx.top - nargs - 1;
        let status = self.do_protected_call(func_slot, nargs, nresults)?;
        if status.is_error() {
            let ev = self.ctx.error_value;
            self.push_value_raw(ev)?;
        }
        Ok(status)
    }

    /// Yieldable call: like `call`, but when the callee yields, `cont`
    /// finishes this native function's work at resume time.
    pub fn callk(&mut self, nargs: usize, nresults: i32, cont: Continuation, kctx: i64) -> LuaResult<()> {
        if let Some(ci) = self.ctx.frames.last_mut() {
            if ci.is_native() {
                ci.continuation = Some(cont);
                ci.continuation_ctx = kctx;
            }
        }
        let func_slot = self.ctx.top - nargs - 1;
        let r = self.do_call(func_slot, nargs, nresults);
        if r.is_ok() {
            if let Some(ci) = self.ctx.frames.last_mut() {
                if ci.is_native() {
                    ci.continuation = None;
                }
            }
        }
        r
    }

    /// Yieldable protected call: the continuation also receives control
    /// when the protected body fails after a yield.
    pub fn pcallk(
        &mut self,
        nargs: usize,
        nresults: i32,
        cont: Continuation,
        kctx: i64,
    ) -> LuaResult<ThreadStatus> {
        let func_slot = self.ctx.top - nargs - 1;
        if let Some(ci) = self.ctx.frames.last_mut() {
            if ci.is_native() {
                ci.continuation = Some(cont);
                ci.continuation_ctx = kctx;
                ci.call_status |= CIST_YPCALL;
                ci.pending_result_slot = func_slot;
            }
        }
        let r = self.do_protected_call(func_slot, nargs, nresults);
        if !matches!(r, Err(LuaError::Yield)) {
            if let Some(ci) = self.ctx.frames.last_mut() {
                if ci.is_native() {
                    ci.continuation = None;
                    ci.call_status &= !CIST_YPCALL;
                    ci.pending_result_slot = usize::MAX;
                }
            }
        }
        let status = r?;
        if status.is_error() {
            let ev = self.ctx.error_value;
            self.push_value_raw(ev)?;
        }
        Ok(status)
    }

    // ===== metatable access via the stack =====

    /// Push the metatable of the value at `idx`; false (nothing pushed)
    /// when it has none.
    pub fn get_metatable(&mut self, idx: i32) -> LuaResult<bool> {
        let v = self.value_at(idx);
        match self.get_metatable_of(&v) {
            Some(mt) => {
                self.push_value_raw(LuaValue::Table(mt))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Pop a table (or nil) and install it as the metatable of the value
    /// at `idx`.
    pub fn set_metatable(&mut self, idx: i32) -> LuaResult<()> {
        let v = self.value_at(idx);
        let mt = self.value_at(-1);
        self.pop(1);
        match mt {
            LuaValue::Nil => self.set_metatable_of(&v, None),
            LuaValue::Table(mtid) => self.set_metatable_of(&v, Some(mtid)),
            _ => Err(self.type_error("use as a metatable", &mt)),
        }
    }
}
