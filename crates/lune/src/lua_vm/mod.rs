// The runtime instance.
//
// LuaVM is the global state: GC + object pool, string interner, registry,
// globals, the active thread context and the resume chain. Everything is
// instance-scoped - two LuaVMs share nothing, so independent instances
// can live on different OS threads.

mod api;
mod arith;
mod call_info;
mod chunk_io;
mod coroutine;
mod debug_info;
mod execute;
mod lua_buffer;
mod lua_error;
pub mod lua_limits;
mod lua_ref;
mod metamethod;
mod opcode;
mod proto;
mod safe_option;
mod thread;

pub use arith::{raw_arith, raw_bnot, raw_compare, raw_negate};
pub use call_info::{CallInfo, Continuation, call_status};
pub use chunk_io::{Reader, SliceReader, VecWriter, Writer};
pub use lua_buffer::LuaBuffer;
pub use lua_error::{LuaError, LuaResult, ThreadStatus};
pub use lua_limits::{MULTRET, REGISTRY_INDEX, upvalue_index};
pub use lua_ref::{RefId, RefManager, NO_REF, REF_NIL};
pub use metamethod::{Tm, TmCache, TM_COUNT, TM_NAMES};
pub use opcode::{ArithOp, CmpOp, Instruction, UnaryOp};
pub use proto::{Proto, ProtoBuilder, UpvalDesc};
pub use safe_option::SafeOption;
pub use thread::{CoroutineStatus, ExecContext, LuaThread};

use std::rc::Rc;

use crate::gc::{
    FunctionBody, GC, GcData, GcId, GcObject, SHORT_STRING_LIMIT, StringId, TableId, ThreadId,
    Upvalue, UpvalueId, UserdataId,
};
use crate::lua_value::{LuaString, LuaTable, LuaUserdata, LuaValue, number_to_str};

/// Native function convention: arguments are on the stack (index 1..nargs),
/// the function pushes its results and returns how many.
pub type NativeFn = fn(&mut LuaVM) -> LuaResult<i32>;

/// Host warning sink.
pub type WarnFn = Box<dyn FnMut(&str)>;

/// Host panic handler, called on an error with no protected boundary; the
/// error value is on the stack top. By contract it should not return - if
/// it does, the runtime aborts via panic.
pub type PanicFn = fn(&mut LuaVM);

pub struct LuaVM {
    pub(crate) gc: GC,

    registry: TableId,
    globals: TableId,
    main_thread: ThreadId,

    /// The running thread and its live execution state.
    pub(crate) current_thread: ThreadId,
    pub(crate) ctx: ExecContext,
    /// Threads waiting on a resume they issued, outermost first.
    resume_stack: Vec<ThreadId>,

    pub(crate) tm_cache: TmCache,
    /// Preallocated message for memory errors: building a message at
    /// memory-error time would itself allocate.
    memerr_msg: StringId,

    pub(crate) refs: RefManager,
    pub(crate) options: SafeOption,

    warn_fn: Option<WarnFn>,
    panic_fn: Option<PanicFn>,
}

impl LuaVM {
    pub fn new(options: SafeOption) -> Self {
        let mut gc = GC::new();

        // Bootstrap objects are created by hand so ordinary allocation
        // paths can assume a fully built VM.
        let registry_id = {
            let id = gc.pool.alloc(GcObject::with_white(
                GcData::Table(Box::new(LuaTable::new(4, 8))),
                gc.current_white,
                128,
            ));
            gc.track(id, 128);
            TableId(id)
        };
        let globals_id = {
            let id = gc.pool.alloc(GcObject::with_white(
                GcData::Table(Box::new(LuaTable::new(0, 32))),
                gc.current_white,
                128,
            ));
            gc.track(id, 128);
            TableId(id)
        };
        let main_id = {
            let id = gc.pool.alloc(GcObject::with_white(
                GcData::Thread(Box::new(LuaThread::running_shell())),
                gc.current_white,
                256,
            ));
            gc.track(id, 256);
            ThreadId(id)
        };
        for id in [registry_id.0, globals_id.0, main_id.0] {
            if let Some(obj) = gc.pool.get_mut(id) {
                obj.header.set_fixed();
            }
        }

        // Intern the metamethod names and the static memory-error message.
        let mut intern_fixed = |gc: &mut GC, s: &str| -> StringId {
            let hash = gc.interner.hash_str(s);
            let size = std::mem::size_of::<LuaString>() + s.len();
            let id = gc.pool.alloc(GcObject::with_white(
                GcData::String(Box::new(LuaString::new(s.to_string(), hash))),
                gc.current_white,
                size as u32,
            ));
            gc.track(id, size);
            if let Some(obj) = gc.pool.get_mut(id) {
                obj.header.set_fixed();
            }
            gc.interner.insert(hash, StringId(id));
            StringId(id)
        };
        let names = std::array::from_fn(|i| intern_fixed(&mut gc, TM_NAMES[i]));
        let memerr_msg = intern_fixed(&mut gc, "not enough memory");

        let mut vm = LuaVM {
            gc,
            registry: registry_id,
            globals: globals_id,
            main_thread: main_id,
            current_thread: main_id,
            ctx: ExecContext::new(),
            resume_stack: Vec::new(),
            tm_cache: TmCache { names },
            memerr_msg,
            refs: RefManager::new(),
            options,
            warn_fn: None,
            panic_fn: None,
        };

        // Wire the registry like the reference layout: globals and the
        // main thread live at fixed integer slots.
        if let Some(reg) = vm.gc.pool.get_table_mut(registry_id) {
            reg.raw_seti(lua_limits::RIDX_GLOBALS, LuaValue::Table(globals_id));
            reg.raw_seti(lua_limits::RIDX_MAIN_THREAD, LuaValue::Thread(main_id));
        }

        // Setup allocations should not count toward the first cycle.
        vm.gc.debt = -(2 * vm.gc.params.step_size);
        vm
    }

    // ===== identity accessors =====

    #[inline(always)]
    pub fn registry_id(&self) -> TableId {
        self.registry
    }

    #[inline(always)]
    pub fn globals_id(&self) -> TableId {
        self.globals
    }

    #[inline(always)]
    pub fn main_thread_id(&self) -> ThreadId {
        self.main_thread
    }

    #[inline(always)]
    pub fn current_thread_id(&self) -> ThreadId {
        self.current_thread
    }

    pub(crate) fn resume_chain(&self) -> &[ThreadId] {
        &self.resume_stack
    }

    pub(crate) fn resume_chain_mut(&mut self) -> &mut Vec<ThreadId> {
        &mut self.resume_stack
    }

    /// Split-borrow helper for the GC driver.
    pub(crate) fn gc_and_ctx(&mut self) -> (&mut GC, &ExecContext) {
        (&mut self.gc, &self.ctx)
    }

    // ===== allocation =====

    /// Allocate a GC object, running a collection step and enforcing the
    /// memory limit first.
    pub(crate) fn alloc_object(&mut self, data: GcData, size: usize) -> LuaResult<u32> {
        self.maybe_gc();
        if self.gc.count_bytes() + size > self.options.max_memory {
            // Emergency collection; if the heap still does not fit, fail
            // with the preallocated message.
            self.gc_collect();
            if self.gc.count_bytes() + size > self.options.max_memory {
                self.ctx.error_value = LuaValue::String(self.memerr_msg);
                return Err(LuaError::Memory);
            }
        }
        let id = self.gc.pool.alloc(GcObject::with_white(
            data,
            self.gc.current_white,
            size as u32,
        ));
        self.gc.track(id, size);
        Ok(id)
    }

    /// Create (or reuse) a string value. Short strings are interned.
    pub fn create_string(&mut self, s: &str) -> LuaResult<LuaValue> {
        let hash = self.gc.interner.hash_str(s);
        if s.len() <= SHORT_STRING_LIMIT {
            if let Some(id) = self.gc.find_interned(hash, s) {
                self.gc.resurrect_string(id);
                return Ok(LuaValue::String(id));
            }
            let size = std::mem::size_of::<LuaString>() + s.len();
            let id = self.alloc_object(
                GcData::String(Box::new(LuaString::new(s.to_string(), hash))),
                size,
            )?;
            self.gc.interner.insert(hash, StringId(id));
            return Ok(LuaValue::String(StringId(id)));
        }
        let size = std::mem::size_of::<LuaString>() + s.len();
        let id = self.alloc_object(
            GcData::String(Box::new(LuaString::new(s.to_string(), hash))),
            size,
        )?;
        Ok(LuaValue::String(StringId(id)))
    }

    pub fn create_table(&mut self, array_hint: usize, hash_hint: usize) -> LuaResult<LuaValue> {
        let size = std::mem::size_of::<LuaTable>() + array_hint * 16 + hash_hint * 32 + 64;
        let id = self.alloc_object(
            GcData::Table(Box::new(LuaTable::new(array_hint, hash_hint))),
            size,
        )?;
        Ok(LuaValue::Table(TableId(id)))
    }

    pub(crate) fn create_closure(
        &mut self,
        proto: Rc<Proto>,
        upvalues: Vec<UpvalueId>,
    ) -> LuaResult<LuaValue> {
        let size = 64 + upvalues.len() * 8;
        let id = self.alloc_object(
            GcData::Function(Box::new(FunctionBody::Lua { proto, upvalues })),
            size,
        )?;
        Ok(LuaValue::Function(crate::gc::FunctionId(id)))
    }

    pub(crate) fn create_native_closure(
        &mut self,
        func: NativeFn,
        upvalues: Vec<LuaValue>,
    ) -> LuaResult<LuaValue> {
        let size = 64 + upvalues.len() * 16;
        let id = self.alloc_object(
            GcData::Function(Box::new(FunctionBody::Native { func, upvalues })),
            size,
        )?;
        Ok(LuaValue::Function(crate::gc::FunctionId(id)))
    }

    pub(crate) fn create_upvalue(&mut self, uv: Upvalue) -> LuaResult<UpvalueId> {
        let id = self.alloc_object(GcData::Upvalue(Box::new(uv)), 48)?;
        Ok(UpvalueId(id))
    }

    /// Create a full userdata with `nuvalue` user-value slots.
    pub fn create_userdata<T: std::any::Any>(
        &mut self,
        data: T,
        nuvalue: usize,
    ) -> LuaResult<LuaValue> {
        let size = std::mem::size_of::<T>() + 64 + nuvalue * 16;
        let id = self.alloc_object(
            GcData::Userdata(Box::new(LuaUserdata::new(data, nuvalue))),
            size,
        )?;
        Ok(LuaValue::UserData(UserdataId(id)))
    }

    // ===== errors =====

    /// Raise a runtime error with a string message.
    pub fn rt_error(&mut self, msg: impl Into<String>) -> LuaError {
        match self.create_string(&msg.into()) {
            Ok(v) => {
                self.ctx.error_value = v;
                LuaError::Runtime
            }
            Err(e) => e,
        }
    }

    /// Raise a runtime error carrying an arbitrary value.
    pub fn throw_value(&mut self, v: LuaValue) -> LuaError {
        self.ctx.error_value = v;
        LuaError::Runtime
    }

    pub fn type_error(&mut self, what: &str, v: &LuaValue) -> LuaError {
        let msg = format!("attempt to {what} a {} value", v.type_name());
        self.rt_error(msg)
    }

    /// The error payload of the most recent failure on this thread.
    pub fn error_value(&self) -> LuaValue {
        self.ctx.error_value
    }

    pub(crate) fn take_error_value(&mut self) -> LuaValue {
        std::mem::take(&mut self.ctx.error_value)
    }

    /// Textual form of the current error value, for hosts and warnings.
    pub fn error_message(&self) -> String {
        self.display_value(&self.ctx.error_value)
    }

    // ===== warnings / panic =====

    pub fn set_warn_fn(&mut self, f: WarnFn) {
        self.warn_fn = Some(f);
    }

    pub fn set_panic_handler(&mut self, f: PanicFn) {
        self.panic_fn = Some(f);
    }

    pub(crate) fn warn(&mut self, msg: &str) {
        let mut f = self.warn_fn.take();
        match &mut f {
            Some(wf) => wf(msg),
            None => tracing::warn!(target: "lune", "{msg}"),
        }
        self.warn_fn = f;
    }

    /// An error escaped every protected boundary. Hand it to the host's
    /// panic handler; by contract the handler does not return.
    pub(crate) fn unprotected_error(&mut self, e: LuaError) -> LuaError {
        if let Some(p) = self.panic_fn {
            let ev = self.ctx.error_value;
            let _ = self.push_value_raw(ev);
            p(self);
            panic!("panic handler returned (unprotected error: {e})");
        }
        e
    }

    // ===== metatables / metamethods =====

    pub fn get_metatable_of(&self, v: &LuaValue) -> Option<TableId> {
        match v {
            LuaValue::Table(tid) => self.gc.pool.get_table(*tid)?.metatable(),
            LuaValue::UserData(uid) => self.gc.pool.get_userdata(*uid)?.metatable(),
            _ => None,
        }
    }

    /// Install or clear the metatable of a table or userdata. Reads
    /// `__mode` for weak flags and `__gc` to register the finalizer.
    pub fn set_metatable_of(&mut self, v: &LuaValue, mt: Option<TableId>) -> LuaResult<()> {
        let has_gc = match mt {
            Some(mtid) => {
                let gc_key = LuaValue::String(self.tm_cache.names[Tm::Gc as usize]);
                let mode_key = LuaValue::String(self.tm_cache.names[Tm::Mode as usize]);
                let mt_table = self
                    .gc
                    .pool
                    .get_table(mtid)
                    .ok_or_else(|| LuaError::Runtime)?;
                let has_gc = !mt_table.raw_get(&gc_key).is_nil();
                let mode = mt_table.raw_get(&mode_key);
                let (wk, wv) = match mode.as_string_id() {
                    Some(sid) => {
                        let s = self
                            .gc
                            .pool
                            .get_string(sid)
                            .map(|x| x.as_str().to_string())
                            .unwrap_or_default();
                        (s.contains('k'), s.contains('v'))
                    }
                    None => (false, false),
                };
                match v {
                    LuaValue::Table(tid) => {
                        if let Some(t) = self.gc.pool.get_table_mut(*tid) {
                            t.set_metatable(Some(mtid));
                            t.weak_keys = wk;
                            t.weak_values = wv;
                        }
                        self.gc
                            .barrier_forward(GcId::Table(*tid), &LuaValue::Table(mtid));
                    }
                    LuaValue::UserData(uid) => {
                        if let Some(u) = self.gc.pool.get_userdata_mut(*uid) {
                            u.set_metatable(Some(mtid));
                        }
                        self.gc
                            .barrier_forward(GcId::Userdata(*uid), &LuaValue::Table(mtid));
                    }
                    _ => return Err(self.type_error("set a metatable on", v)),
                }
                has_gc
            }
            None => {
                match v {
                    LuaValue::Table(tid) => {
                        if let Some(t) = self.gc.pool.get_table_mut(*tid) {
                            t.set_metatable(None);
                        }
                    }
                    LuaValue::UserData(uid) => {
                        if let Some(u) = self.gc.pool.get_userdata_mut(*uid) {
                            u.set_metatable(None);
                        }
                    }
                    _ => return Err(self.type_error("set a metatable on", v)),
                }
                false
            }
        };
        if has_gc {
            // Register for finalization exactly once.
            if let Some(id) = v.as_gc_id() {
                if let Some(obj) = self.gc.pool.get_mut(id.index()) {
                    if !obj.header.is_finalized() {
                        obj.header.set_finalized();
                    }
                }
            }
        }
        Ok(())
    }

    /// Metamethod lookup: nil when absent.
    pub(crate) fn get_metamethod(&self, v: &LuaValue, tm: Tm) -> LuaValue {
        let Some(mtid) = self.get_metatable_of(v) else {
            return LuaValue::Nil;
        };
        let key = LuaValue::String(self.tm_cache.names[tm as usize]);
        match self.gc.pool.get_table(mtid) {
            Some(mt) => mt.raw_get(&key),
            None => LuaValue::Nil,
        }
    }

    /// Run a `__gc` finalizer for an object, protected. Errors are
    /// stringified for the warning sink.
    pub(crate) fn call_finalizer(&mut self, value: LuaValue) -> Result<(), String> {
        let mm = self.get_metamethod(&value, Tm::Gc);
        if mm.is_nil() {
            return Ok(());
        }
        match self.call_values(mm, &[value], 0) {
            Ok(_) => Ok(()),
            Err(_) => Err(self.error_message()),
        }
    }

    // ===== table access (metamethod-aware) =====

    /// `t[k]` honoring `__index` chains.
    pub fn table_get(&mut self, t: LuaValue, k: LuaValue) -> LuaResult<LuaValue> {
        let mut cur = t;
        for _ in 0..lua_limits::MAX_TAG_LOOP {
            if let LuaValue::Table(tid) = cur {
                let raw = match self.gc.pool.get_table(tid) {
                    Some(table) => table.raw_get(&k),
                    None => LuaValue::Nil,
                };
                if !raw.is_nil() {
                    return Ok(raw);
                }
                let mm = self.get_metamethod(&cur, Tm::Index);
                match mm {
                    LuaValue::Nil => return Ok(LuaValue::Nil),
                    LuaValue::Table(_) => {
                        cur = mm;
                        continue;
                    }
                    _ => {
                        let results = self.call_values(mm, &[cur, k], 1)?;
                        return Ok(results.first().copied().unwrap_or(LuaValue::Nil));
                    }
                }
            } else {
                let mm = self.get_metamethod(&cur, Tm::Index);
                match mm {
                    LuaValue::Nil => return Err(self.type_error("index", &cur)),
                    LuaValue::Table(_) => {
                        cur = mm;
                        continue;
                    }
                    _ => {
                        let results = self.call_values(mm, &[cur, k], 1)?;
                        return Ok(results.first().copied().unwrap_or(LuaValue::Nil));
                    }
                }
            }
        }
        Err(self.rt_error("'__index' chain too long; possible loop"))
    }

    /// `t[k] = v` honoring `__newindex` chains.
    pub fn table_set(&mut self, t: LuaValue, k: LuaValue, v: LuaValue) -> LuaResult<()> {
        let mut cur = t;
        for _ in 0..lua_limits::MAX_TAG_LOOP {
            if let LuaValue::Table(tid) = cur {
                let existing = match self.gc.pool.get_table(tid) {
                    Some(table) => table.raw_get(&k),
                    None => LuaValue::Nil,
                };
                if !existing.is_nil() {
                    return self.raw_set_checked(tid, &k, v);
                }
                let mm = self.get_metamethod(&cur, Tm::NewIndex);
                match mm {
                    LuaValue::Nil => return self.raw_set_checked(tid, &k, v),
                    LuaValue::Table(_) => {
                        cur = mm;
                        continue;
                    }
                    _ => {
                        self.call_values(mm, &[cur, k, v], 0)?;
                        return Ok(());
                    }
                }
            } else {
                let mm = self.get_metamethod(&cur, Tm::NewIndex);
                match mm {
                    LuaValue::Nil => return Err(self.type_error("index", &cur)),
                    LuaValue::Table(_) => {
                        cur = mm;
                        continue;
                    }
                    _ => {
                        self.call_values(mm, &[cur, k, v], 0)?;
                        return Ok(());
                    }
                }
            }
        }
        Err(self.rt_error("'__newindex' chain too long; possible loop"))
    }

    /// Raw set with key validation and the back barrier.
    pub(crate) fn raw_set_checked(
        &mut self,
        tid: TableId,
        k: &LuaValue,
        v: LuaValue,
    ) -> LuaResult<()> {
        if k.is_nil() {
            return Err(self.rt_error("table index is nil"));
        }
        if let LuaValue::Float(f) = k {
            if f.is_nan() {
                return Err(self.rt_error("table index is NaN"));
            }
        }
        if let Some(t) = self.gc.pool.get_table_mut(tid) {
            t.raw_set(k, v);
        }
        if v.is_collectable() || k.is_collectable() {
            self.gc.barrier_back(GcId::Table(tid));
        }
        Ok(())
    }

    /// Raw get (no metamethods), by value.
    pub fn raw_get(&self, t: &LuaValue, k: &LuaValue) -> LuaValue {
        match t.as_table_id() {
            Some(tid) => match self.gc.pool.get_table(tid) {
                Some(table) => table.raw_get(k),
                None => LuaValue::Nil,
            },
            None => LuaValue::Nil,
        }
    }

    // ===== globals =====

    pub fn get_global(&mut self, name: &str) -> LuaResult<LuaValue> {
        let key = self.create_string(name)?;
        Ok(self.raw_get(&LuaValue::Table(self.globals), &key))
    }

    pub fn set_global(&mut self, name: &str, value: LuaValue) -> LuaResult<()> {
        let key = self.create_string(name)?;
        self.raw_set_checked(self.globals, &key, value)
    }

    /// Install a native function under a global name.
    pub fn register(&mut self, name: &str, func: NativeFn) -> LuaResult<()> {
        self.set_global(name, LuaValue::NativeFunction(func))
    }

    // ===== misc value operations =====

    /// The `#` operator: string length, `__len`, or a table border.
    pub fn length_of(&mut self, v: &LuaValue) -> LuaResult<LuaValue> {
        match v {
            LuaValue::String(sid) => {
                let len = self.gc.pool.get_string(*sid).map(|s| s.len()).unwrap_or(0);
                Ok(LuaValue::Integer(len as i64))
            }
            LuaValue::Table(tid) => {
                let mm = self.get_metamethod(v, Tm::Len);
                if !mm.is_nil() {
                    let r = self.call_values(mm, &[*v], 1)?;
                    return Ok(r.first().copied().unwrap_or(LuaValue::Nil));
                }
                let len = self.gc.pool.get_table(*tid).map(|t| t.length()).unwrap_or(0);
                Ok(LuaValue::Integer(len))
            }
            _ => {
                let mm = self.get_metamethod(v, Tm::Len);
                if mm.is_nil() {
                    return Err(self.type_error("get length of", v));
                }
                let r = self.call_values(mm, &[*v], 1)?;
                Ok(r.first().copied().unwrap_or(LuaValue::Nil))
            }
        }
    }

    /// Equality with `__eq` fallback for tables/userdata of distinct
    /// identity. Absent metamethod falls back to raw inequality.
    pub fn values_equal(&mut self, a: &LuaValue, b: &LuaValue) -> LuaResult<bool> {
        if a.raw_equal(b) {
            return Ok(true);
        }
        let same_kind = matches!(
            (a, b),
            (LuaValue::Table(_), LuaValue::Table(_))
                | (LuaValue::UserData(_), LuaValue::UserData(_))
        );
        if !same_kind {
            return Ok(false);
        }
        let mut mm = self.get_metamethod(a, Tm::Eq);
        if mm.is_nil() {
            mm = self.get_metamethod(b, Tm::Eq);
        }
        if mm.is_nil() {
            return Ok(false);
        }
        let r = self.call_values(mm, &[*a, *b], 1)?;
        Ok(r.first().map(|v| v.is_truthy()).unwrap_or(false))
    }

    /// String content by id (None for non-strings).
    pub fn string_content(&self, v: &LuaValue) -> Option<&str> {
        let sid = v.as_string_id()?;
        self.gc.pool.get_string(sid).map(|s| s.as_str())
    }

    /// Human-readable rendering used by tracebacks and `tostring`-style
    /// conversion (without `__tostring` dispatch).
    pub fn display_value(&self, v: &LuaValue) -> String {
        match v {
            LuaValue::Nil => "nil".to_string(),
            LuaValue::Boolean(b) => b.to_string(),
            LuaValue::Integer(_) | LuaValue::Float(_) => number_to_str(v).unwrap_or_default(),
            LuaValue::String(_) => self
                .string_content(v)
                .map(|s| s.to_string())
                .unwrap_or_default(),
            LuaValue::Table(tid) => format!("table: 0x{:08x}", tid.0),
            LuaValue::Function(fid) => format!("function: 0x{:08x}", fid.0),
            LuaValue::NativeFunction(f) => format!("function: builtin 0x{:012x}", *f as usize),
            LuaValue::UserData(uid) => format!("userdata: 0x{:08x}", uid.0),
            LuaValue::Thread(tid) => format!("thread: 0x{:08x}", tid.0),
            LuaValue::LightUserData(p) => format!("userdata: 0x{:012x}", p),
        }
    }

    /// Concatenation of a value run, with `__concat` fallback, folding
    /// right-to-left like the reference semantics.
    pub fn concat_values(&mut self, values: &[LuaValue]) -> LuaResult<LuaValue> {
        if values.is_empty() {
            return self.create_string("");
        }
        let mut acc = *values.last().unwrap();
        for v in values.iter().rev().skip(1) {
            acc = self.concat_pair(*v, acc)?;
        }
        Ok(acc)
    }

    fn concat_pair(&mut self, a: LuaValue, b: LuaValue) -> LuaResult<LuaValue> {
        let a_ok = a.is_string() || a.is_number();
        let b_ok = b.is_string() || b.is_number();
        if a_ok && b_ok {
            let mut s = String::new();
            match self.string_content(&a) {
                Some(x) => s.push_str(x),
                None => s.push_str(&number_to_str(&a).unwrap_or_default()),
            }
            match self.string_content(&b) {
                Some(x) => s.push_str(x),
                None => s.push_str(&number_to_str(&b).unwrap_or_default()),
            }
            return self.create_string(&s);
        }
        let mut mm = self.get_metamethod(&a, Tm::Concat);
        if mm.is_nil() {
            mm = self.get_metamethod(&b, Tm::Concat);
        }
        if mm.is_nil() {
            let bad = if a_ok { b } else { a };
            return Err(self.type_error("concatenate", &bad));
        }
        let r = self.call_values(mm, &[a, b], 1)?;
        Ok(r.first().copied().unwrap_or(LuaValue::Nil))
    }

    /// Pre-size a table's parts (the `resize` optimization hint).
    pub fn table_resize(
        &mut self,
        t: &LuaValue,
        array_hint: usize,
        hash_hint: usize,
    ) -> LuaResult<()> {
        let Some(tid) = t.as_table_id() else {
            return Err(self.type_error("resize", t));
        };
        if let Some(table) = self.gc.pool.get_table_mut(tid) {
            table.resize(array_hint, hash_hint);
        }
        Ok(())
    }

    /// `next` over a table, erroring on an invalid resume key.
    pub fn table_next(
        &mut self,
        t: &LuaValue,
        key: &LuaValue,
    ) -> LuaResult<Option<(LuaValue, LuaValue)>> {
        let Some(tid) = t.as_table_id() else {
            return Err(self.type_error("iterate", t));
        };
        match self.gc.pool.get_table(tid) {
            Some(table) => match table.next(key) {
                Ok(pair) => Ok(pair),
                Err(()) => Err(self.rt_error("invalid key to 'next'")),
            },
            None => Ok(None),
        }
    }

    // ===== GC control surface =====

    pub fn gc_stop(&mut self) {
        self.gc.stop();
    }

    pub fn gc_restart(&mut self) {
        self.gc.restart();
    }

    pub fn gc_is_running(&self) -> bool {
        self.gc.is_running()
    }

    /// Heap bytes currently accounted.
    pub fn gc_count_bytes(&self) -> usize {
        self.gc.count_bytes()
    }

    pub fn gc_object_count(&self) -> usize {
        self.gc.object_count()
    }

    pub fn gc_set_pause(&mut self, pause: i32) {
        self.gc.params.pause = pause.max(10);
    }

    pub fn gc_set_step_mul(&mut self, mul: i32) {
        self.gc.params.step_mul = mul.max(10);
    }

    pub fn gc_incremental(&mut self) {
        self.gc.set_incremental();
    }

    pub fn gc_generational(&mut self) {
        self.gc.set_generational();
    }

    /// Tear down the instance: close pending to-be-closed variables, run
    /// every pending finalizer, release the heap.
    pub fn close(&mut self) {
        let _ = self.close_tbc_from(0, LuaValue::Nil);
        // Finalize everything still registered.
        self.gc_collect();
        self.gc_collect();
        self.run_pending_finalizers(usize::MAX);
        self.gc.pool.clear();
        self.gc.interner.clear();
        tracing::debug!("vm closed");
    }
}

impl Drop for LuaVM {
    fn drop(&mut self) {
        if self.gc.pool.len() > 0 {
            self.close();
        }
    }
}

impl GC {
    /// Interner lookup resolving candidate ids through the pool.
    pub(crate) fn find_interned(&self, hash: u64, s: &str) -> Option<StringId> {
        self.interner
            .find(hash, s, |id| self.pool.get_string(id).map(|x| x.as_str()))
    }

    /// A found interned string may be sitting in the condemned set of an
    /// in-flight cycle; pull it back before handing its id out.
    pub(crate) fn resurrect_string(&mut self, id: StringId) {
        if let Some(obj) = self.pool.get_mut(id.0) {
            if obj.header.is_white() {
                if self.state.keep_invariant() {
                    obj.header.make_black();
                } else {
                    obj.header.make_white(self.current_white);
                }
            }
        }
    }
}
