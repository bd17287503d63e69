// Call engine and bytecode dispatcher.
//
// Interpreted-to-interpreted calls never recurse on the Rust stack: CALL
// pushes a CallInfo and the dispatcher loop reloads the callee, RETURN
// pops it. Only native functions re-enter the interpreter recursively,
// bounded by `max_native_depth`. A coroutine yield travels as
// `Err(LuaError::Yield)` through the Rust frames while the CallInfo chain
// stays parked in the thread context, ready to be unrolled by resume.

use std::rc::Rc;

use crate::gc::{FunctionBody, GcId, Upvalue, UpvalueId};
use crate::lua_value::{LuaValue, str_to_number};
use crate::lua_vm::{
    ArithOp, CallInfo, CmpOp, Instruction, LuaError, LuaResult, LuaVM, NativeFn, Proto, Tm,
    UnaryOp, lua_limits,
};

impl LuaVM {
    // ===== stack discipline =====

    /// Ensure the stack vector covers `needed_top` slots, growing it (and
    /// nil-filling) if required. Indices stay valid across growth.
    pub(crate) fn ensure_stack(&mut self, needed_top: usize) -> LuaResult<()> {
        if needed_top <= self.ctx.stack.len() {
            return Ok(());
        }
        let limit = self.options.max_stack_size + lua_limits::EXTRA_STACK;
        if needed_top > limit {
            return Err(self.overflow_error());
        }
        let new_len = (self.ctx.stack.len() * 2).max(needed_top).min(limit);
        tracing::trace!(from = self.ctx.stack.len(), to = new_len, "stack grow");
        self.ctx.stack.resize(new_len, LuaValue::Nil);
        Ok(())
    }

    fn overflow_error(&mut self) -> LuaError {
        // The message allocation is small and the stack limit is not the
        // heap limit, so building it here is fine.
        let _ = self
            .create_string("stack overflow")
            .map(|v| self.ctx.error_value = v);
        LuaError::StackOverflow
    }

    fn check_call_depth(&mut self) -> LuaResult<()> {
        let depth = self.ctx.frames.len();
        if depth >= self.options.max_call_depth + lua_limits::EXTRA_CALLS {
            let _ = self
                .create_string("error in error handling")
                .map(|v| self.ctx.error_value = v);
            return Err(LuaError::ErrInErr);
        }
        if depth >= self.options.max_call_depth {
            return Err(self.overflow_error());
        }
        Ok(())
    }

    // ===== upvalues =====

    /// Search-or-create the canonical open upvalue for a stack slot: all
    /// closures capturing one local share one cell.
    pub(crate) fn find_or_create_upvalue(&mut self, slot: usize) -> LuaResult<UpvalueId> {
        let current = self.current_thread;
        for &uid in &self.ctx.open_upvalues {
            if let Some(Upvalue::Open { owner, slot: s }) = self.gc.pool.get_upvalue(uid) {
                if *owner == current && *s == slot {
                    return Ok(uid);
                }
            }
        }
        let uid = self.create_upvalue(Upvalue::Open {
            owner: current,
            slot,
        })?;
        self.ctx.open_upvalues.push(uid);
        Ok(uid)
    }

    pub(crate) fn upvalue_get(&self, uid: UpvalueId) -> LuaValue {
        match self.gc.pool.get_upvalue(uid) {
            Some(Upvalue::Closed(v)) => *v,
            Some(Upvalue::Open { owner, slot }) => {
                if *owner == self.current_thread {
                    self.ctx.stack.get(*slot).copied().unwrap_or(LuaValue::Nil)
                } else {
                    self.gc
                        .pool
                        .get_thread(*owner)
                        .and_then(|t| t.saved_stack_value(*slot))
                        .unwrap_or(LuaValue::Nil)
                }
            }
            None => LuaValue::Nil,
        }
    }

    pub(crate) fn upvalue_set(&mut self, uid: UpvalueId, value: LuaValue) {
        let target = match self.gc.pool.get_upvalue_mut(uid) {
            Some(uv) => match uv {
                Upvalue::Closed(v) => {
                    *v = value;
                    None
                }
                Upvalue::Open { owner, slot } => Some((*owner, *slot)),
            },
            None => None,
        };
        if let Some((owner, slot)) = target {
            if owner == self.current_thread {
                if slot < self.ctx.stack.len() {
                    self.ctx.stack[slot] = value;
                }
            } else if let Some(t) = self.gc.pool.get_thread_mut(owner) {
                if let Some(ctx) = t.ctx.as_mut() {
                    if slot < ctx.stack.len() {
                        ctx.stack[slot] = value;
                    }
                }
            }
            // Open cell: the value lives in a thread stack, which the GC
            // rescans anyway. Closed cell: forward barrier.
        } else {
            self.gc.barrier_upvalue(uid, &value);
        }
    }

    /// Close every open upvalue at or above `level`: the transition from
    /// shared-stack-slot to private storage, exactly once per cell.
    pub(crate) fn close_upvalues_from(&mut self, level: usize) {
        let current = self.current_thread;
        let mut i = 0;
        while i < self.ctx.open_upvalues.len() {
            let uid = self.ctx.open_upvalues[i];
            let close_at = match self.gc.pool.get_upvalue(uid) {
                Some(Upvalue::Open { owner, slot }) if *owner == current && *slot >= level => {
                    Some(*slot)
                }
                _ => None,
            };
            match close_at {
                Some(slot) => {
                    let value = self.ctx.stack.get(slot).copied().unwrap_or(LuaValue::Nil);
                    if let Some(uv) = self.gc.pool.get_upvalue_mut(uid) {
                        uv.close(value);
                    }
                    self.gc.barrier_upvalue(uid, &value);
                    self.ctx.open_upvalues.swap_remove(i);
                }
                None => i += 1,
            }
        }
    }

    // ===== to-be-closed variables =====

    /// Mark a stack slot as to-be-closed. The value must be nil/false
    /// (ignored) or carry a `__close` metamethod.
    pub fn mark_to_be_closed(&mut self, slot: usize) -> LuaResult<()> {
        let v = self.ctx.stack.get(slot).copied().unwrap_or(LuaValue::Nil);
        if matches!(v, LuaValue::Nil | LuaValue::Boolean(false)) {
            return Ok(());
        }
        if self.get_metamethod(&v, Tm::Close).is_nil() {
            let msg = format!(
                "variable of type {} does not have a '__close' metamethod",
                v.type_name()
            );
            return Err(self.rt_error(msg));
        }
        self.ctx.tbc.push(slot);
        Ok(())
    }

    /// Close to-be-closed slots at or above `level`, innermost first,
    /// passing `errval` to each `__close`. An error raised by a closer
    /// replaces the error in flight.
    pub(crate) fn close_tbc_from(&mut self, level: usize, errval: LuaValue) -> LuaResult<()> {
        while let Some(&slot) = self.ctx.tbc.last() {
            if slot < level {
                break;
            }
            self.ctx.tbc.pop();
            let v = self.ctx.stack.get(slot).copied().unwrap_or(LuaValue::Nil);
            if matches!(v, LuaValue::Nil | LuaValue::Boolean(false)) {
                continue;
            }
            let mm = self.get_metamethod(&v, Tm::Close);
            if mm.is_nil() {
                continue;
            }
            self.call_values(mm, &[v, errval], 0)?;
        }
        Ok(())
    }

    /// Unwind variant: every closer runs; a closer that fails is reported
    /// to the warning sink so the original error keeps propagating.
    pub(crate) fn close_tbc_unwind(&mut self, level: usize, errval: LuaValue) {
        while let Some(&slot) = self.ctx.tbc.last() {
            if slot < level {
                break;
            }
            self.ctx.tbc.pop();
            let v = self.ctx.stack.get(slot).copied().unwrap_or(LuaValue::Nil);
            if matches!(v, LuaValue::Nil | LuaValue::Boolean(false)) {
                continue;
            }
            let mm = self.get_metamethod(&v, Tm::Close);
            if mm.is_nil() {
                continue;
            }
            if self.call_values(mm, &[v, errval], 0).is_err() {
                let msg = self.error_message();
                self.warn(&format!("error in __close metamethod: {msg}"));
            }
        }
    }

    // ===== calls =====

    /// Full call from native/host context: runs the callee to completion.
    /// `func_slot` holds the function, arguments directly above it.
    pub(crate) fn do_call(
        &mut self,
        func_slot: usize,
        nargs: usize,
        nresults: i32,
    ) -> LuaResult<()> {
        self.ctx.top = func_slot + 1 + nargs;
        let callee = self.resolve_callable(func_slot)?;
        let nargs = self.ctx.top - func_slot - 1;
        match callee {
            Callee::Native(f) => self.do_native_call(f, func_slot, nargs, nresults),
            Callee::Lua => {
                let entry = self.ctx.frames.len();
                self.precall_lua(func_slot, nargs, nresults)?;
                self.run_interpreter(entry + 1)
            }
        }
    }

    /// Convenience used by metamethods, finalizers and hosts: call `func`
    /// with `args`, collecting up to `nresults` results (MULTRET for all).
    pub fn call_values(
        &mut self,
        func: LuaValue,
        args: &[LuaValue],
        nresults: i32,
    ) -> LuaResult<Vec<LuaValue>> {
        let base = self.ctx.top;
        self.ensure_stack(base + args.len() + 1 + lua_limits::EXTRA_STACK)?;
        self.ctx.stack[base] = func;
        for (i, a) in args.iter().enumerate() {
            self.ctx.stack[base + 1 + i] = *a;
        }
        self.ctx.top = base + 1 + args.len();
        self.do_call(base, args.len(), nresults)?;
        let mut out = Vec::with_capacity((self.ctx.top - base).min(8));
        for i in base..self.ctx.top {
            out.push(self.ctx.stack[i]);
        }
        self.ctx.top = base;
        Ok(out)
    }

    /// Protected call core: establish an unwind boundary at `func_slot`.
    /// On failure the stack, frames, upvalues and to-be-closed list are
    /// restored to the boundary and the error value is left in
    /// `error_value`; the status (never Yield) is returned.
    pub(crate) fn do_protected_call(
        &mut self,
        func_slot: usize,
        nargs: usize,
        nresults: i32,
    ) -> LuaResult<crate::lua_vm::ThreadStatus> {
        let saved_frames = self.ctx.frames.len();
        match self.do_call(func_slot, nargs, nresults) {
            Ok(()) => Ok(crate::lua_vm::ThreadStatus::Ok),
            Err(LuaError::Yield) => Err(LuaError::Yield),
            Err(e) => {
                let errval = self.take_error_value();
                // Unwind: close the scopes the failure jumped over, then
                // restore frame depth and stack window to the boundary.
                self.close_upvalues_from(func_slot);
                self.close_tbc_unwind(func_slot, errval);
                self.ctx.frames.truncate(saved_frames);
                self.ctx.top = func_slot;
                self.ctx.error_value = errval;
                Ok(e.into())
            }
        }
    }

    fn resolve_callable(&mut self, func_slot: usize) -> LuaResult<Callee> {
        // A non-function value may be callable through `__call`; the
        // value itself becomes the first argument.
        for _ in 0..lua_limits::MAX_TAG_LOOP {
            let v = self.ctx.stack[func_slot];
            match v {
                LuaValue::NativeFunction(f) => return Ok(Callee::Native(f)),
                LuaValue::Function(fid) => {
                    return match self.gc.pool.get_function(fid) {
                        Some(FunctionBody::Native { func, .. }) => Ok(Callee::Native(*func)),
                        Some(FunctionBody::Lua { .. }) => Ok(Callee::Lua),
                        None => Err(self.rt_error("attempt to call a stale function")),
                    };
                }
                _ => {
                    let mm = self.get_metamethod(&v, Tm::Call);
                    if mm.is_nil() {
                        return Err(self.type_error("call", &v));
                    }
                    self.ensure_stack(self.ctx.top + 1)?;
                    let top = self.ctx.top;
                    for i in (func_slot..top).rev() {
                        self.ctx.stack[i + 1] = self.ctx.stack[i];
                    }
                    self.ctx.stack[func_slot] = mm;
                    self.ctx.top = top + 1;
                }
            }
        }
        let v = self.ctx.stack[func_slot];
        Err(self.type_error("call", &v))
    }

    /// Push an interpreted frame (the precall step). Handles parameter
    /// adjustment and the vararg layout: extra arguments stay between the
    /// function slot and the frame base.
    pub(crate) fn precall_lua(
        &mut self,
        func_slot: usize,
        nargs: usize,
        nresults: i32,
    ) -> LuaResult<()> {
        self.check_call_depth()?;
        let ci = self.build_lua_frame(func_slot, nargs, nresults)?;
        self.ctx.top = ci.top;
        self.ctx.frames.push(ci);
        Ok(())
    }

    /// Stack adjustment shared by plain calls (frame pushed) and tail
    /// calls (frame replaced in place).
    fn build_lua_frame(
        &mut self,
        func_slot: usize,
        nargs: usize,
        nresults: i32,
    ) -> LuaResult<CallInfo> {
        let proto = self.proto_of(func_slot)?;
        let nparams = proto.nparams as usize;
        let max_stack = proto.max_stack as usize;

        let base;
        let nextra;
        if proto.is_vararg {
            nextra = nargs.saturating_sub(nparams);
            base = func_slot + 1 + nargs;
            self.ensure_stack(base + max_stack + lua_limits::EXTRA_STACK)?;
            // Fixed parameters move above the varargs; their old slots
            // are cleared so stale values cannot leak into varargs.
            for i in 0..nparams {
                let src = func_slot + 1 + i;
                let v = if i < nargs {
                    std::mem::take(&mut self.ctx.stack[src])
                } else {
                    LuaValue::Nil
                };
                self.ctx.stack[base + i] = v;
            }
            for i in nparams..max_stack {
                self.ctx.stack[base + i] = LuaValue::Nil;
            }
        } else {
            nextra = 0;
            base = func_slot + 1;
            self.ensure_stack(base + max_stack + lua_limits::EXTRA_STACK)?;
            for i in nargs..max_stack {
                self.ctx.stack[base + i] = LuaValue::Nil;
            }
        }

        let mut ci = CallInfo::new_lua(func_slot, base, base + max_stack, nresults);
        ci.nextraargs = nextra;
        Ok(ci)
    }

    fn proto_of(&mut self, func_slot: usize) -> LuaResult<Rc<Proto>> {
        let v = self.ctx.stack[func_slot];
        let Some(fid) = v.as_function_id() else {
            return Err(self.type_error("call", &v));
        };
        match self.gc.pool.get_function(fid) {
            Some(FunctionBody::Lua { proto, .. }) => Ok(proto.clone()),
            _ => Err(self.rt_error("expected an interpreted function")),
        }
    }

    /// Native call: push the frame, run the function, move its results
    /// into place. Yield handling distinguishes the originator (legal,
    /// frame popped) from a frame merely crossed (needs a continuation).
    fn do_native_call(
        &mut self,
        f: NativeFn,
        func_slot: usize,
        nargs: usize,
        nresults: i32,
    ) -> LuaResult<()> {
        self.check_call_depth()?;
        if self.ctx.native_depth >= self.options.max_native_depth {
            return Err(self.overflow_error());
        }
        let base = func_slot + 1;
        self.ensure_stack(base + nargs + lua_limits::MIN_STACK)?;
        let ci = CallInfo::new_native(func_slot, base, base + nargs + lua_limits::MIN_STACK, nresults);
        self.ctx.frames.push(ci);
        self.ctx.top = base + nargs;

        self.ctx.native_depth += 1;
        let r = f(self);
        self.ctx.native_depth -= 1;

        match r {
            Ok(n) => {
                self.poscall(n as usize)?;
                Ok(())
            }
            Err(LuaError::Yield) => {
                let my_idx = self.ctx.frames.len() - 1;
                if self.ctx.yield_origin == Some(my_idx) {
                    // The yielding function returns immediately; on resume
                    // the resume arguments become this call's results.
                    self.ctx.yield_origin = None;
                    self.ctx.frames.pop();
                    Err(LuaError::Yield)
                } else if self.ctx.frames[my_idx].continuation.is_some() {
                    // Parked: resume re-enters through the continuation.
                    Err(LuaError::Yield)
                } else {
                    self.ctx.frames.pop();
                    self.ctx.yield_origin = None;
                    Err(self.rt_error("attempt to yield across a native call boundary"))
                }
            }
            Err(e) => {
                self.ctx.frames.pop();
                Err(e)
            }
        }
    }

    /// Finish the current (topmost) frame: move `nres` results from the
    /// stack top down to the function slot, adjust to the caller's
    /// expectation, pop the frame.
    pub(crate) fn poscall(&mut self, nres: usize) -> LuaResult<()> {
        let Some(ci) = self.ctx.frames.last().cloned() else {
            return Err(self.rt_error("no frame to finish"));
        };
        // A native function cannot return more values than it pushed.
        let nres = nres.min(self.ctx.top);
        let src = self.ctx.top - nres;
        let dst = ci.func;
        let wanted = if ci.nresults == lua_limits::MULTRET {
            nres
        } else {
            ci.nresults as usize
        };
        self.ensure_stack(dst + wanted.max(nres))?;
        for i in 0..nres {
            self.ctx.stack[dst + i] = self.ctx.stack[src + i];
        }
        for i in nres..wanted {
            self.ctx.stack[dst + i] = LuaValue::Nil;
        }
        self.ctx.top = dst + wanted;
        self.ctx.frames.pop();
        Ok(())
    }

    // ===== the dispatcher =====

    /// Run interpreted frames until the frame chain drops below
    /// `floor_depth`. Native callees execute inline; interpreted callees
    /// swap the loop onto their prototype without Rust recursion.
    pub(crate) fn run_interpreter(&mut self, floor_depth: usize) -> LuaResult<()> {
        macro_rules! vmtry {
            ($self:ident, $ci:expr, $pc:expr, $e:expr) => {
                match $e {
                    Ok(v) => v,
                    Err(err) => {
                        $self.ctx.frames[$ci].pc = $pc;
                        return Err(err);
                    }
                }
            };
        }

        'reload: loop {
            if self.ctx.frames.len() < floor_depth {
                return Ok(());
            }
            let ci_idx = self.ctx.frames.len() - 1;
            if !self.ctx.frames[ci_idx].is_lua() {
                // A parked native continuation frame surfaced (resume
                // unroll); hand control back to the unroller.
                return Ok(());
            }
            let (func_slot, base, frame_top) = {
                let ci = &self.ctx.frames[ci_idx];
                (ci.func, ci.base, ci.top)
            };
            let mut pc = self.ctx.frames[ci_idx].pc;
            let proto = match self.proto_of(func_slot) {
                Ok(p) => p,
                Err(e) => return Err(e),
            };

            // Re-entry after a callee finished: a fixed-result call gets
            // the frame window back; a MULTRET call keeps the callee's
            // result top for the next consumer.
            if pc > 0 {
                if let Some(Instruction::Call { nresults, .. }) = proto.code.get(pc - 1) {
                    if *nresults != lua_limits::MULTRET {
                        self.ctx.top = frame_top;
                    }
                }
            }

            loop {
                let inst = proto.code[pc];
                pc += 1;
                match inst {
                    Instruction::LoadConst { dst, k } => {
                        self.ctx.stack[base + dst as usize] = proto.constants[k as usize];
                    }
                    Instruction::LoadNil { dst, count } => {
                        for i in 0..count as usize {
                            self.ctx.stack[base + dst as usize + i] = LuaValue::Nil;
                        }
                    }
                    Instruction::LoadBool { dst, value } => {
                        self.ctx.stack[base + dst as usize] = LuaValue::Boolean(value);
                    }
                    Instruction::LoadInt { dst, value } => {
                        self.ctx.stack[base + dst as usize] = LuaValue::Integer(value as i64);
                    }
                    Instruction::Move { dst, src } => {
                        self.ctx.stack[base + dst as usize] = self.ctx.stack[base + src as usize];
                    }
                    Instruction::GetGlobal { dst, name_k } => {
                        let key = proto.constants[name_k as usize];
                        let g = LuaValue::Table(self.globals_id());
                        let v = vmtry!(self, ci_idx, pc, self.table_get(g, key));
                        self.ctx.stack[base + dst as usize] = v;
                    }
                    Instruction::SetGlobal { name_k, src } => {
                        let key = proto.constants[name_k as usize];
                        let v = self.ctx.stack[base + src as usize];
                        let g = LuaValue::Table(self.globals_id());
                        vmtry!(self, ci_idx, pc, self.table_set(g, key, v));
                    }
                    Instruction::GetUpval { dst, n } => {
                        let uid = vmtry!(self, ci_idx, pc, self.closure_upvalue(func_slot, n));
                        self.ctx.stack[base + dst as usize] = self.upvalue_get(uid);
                    }
                    Instruction::SetUpval { n, src } => {
                        let uid = vmtry!(self, ci_idx, pc, self.closure_upvalue(func_slot, n));
                        let v = self.ctx.stack[base + src as usize];
                        self.upvalue_set(uid, v);
                    }
                    Instruction::NewTable {
                        dst,
                        array_hint,
                        hash_hint,
                    } => {
                        let t = vmtry!(
                            self,
                            ci_idx,
                            pc,
                            self.create_table(array_hint as usize, hash_hint as usize)
                        );
                        self.ctx.stack[base + dst as usize] = t;
                    }
                    Instruction::GetTable { dst, table, key } => {
                        let t = self.ctx.stack[base + table as usize];
                        let k = self.ctx.stack[base + key as usize];
                        let v = vmtry!(self, ci_idx, pc, self.table_get(t, k));
                        self.ctx.stack[base + dst as usize] = v;
                    }
                    Instruction::SetTable { table, key, value } => {
                        let t = self.ctx.stack[base + table as usize];
                        let k = self.ctx.stack[base + key as usize];
                        let v = self.ctx.stack[base + value as usize];
                        vmtry!(self, ci_idx, pc, self.table_set(t, k, v));
                    }
                    Instruction::GetField { dst, table, name_k } => {
                        let t = self.ctx.stack[base + table as usize];
                        let k = proto.constants[name_k as usize];
                        let v = vmtry!(self, ci_idx, pc, self.table_get(t, k));
                        self.ctx.stack[base + dst as usize] = v;
                    }
                    Instruction::SetField { table, name_k, value } => {
                        let t = self.ctx.stack[base + table as usize];
                        let k = proto.constants[name_k as usize];
                        let v = self.ctx.stack[base + value as usize];
                        vmtry!(self, ci_idx, pc, self.table_set(t, k, v));
                    }
                    Instruction::GetIndex { dst, table, imm } => {
                        let t = self.ctx.stack[base + table as usize];
                        let v = vmtry!(
                            self,
                            ci_idx,
                            pc,
                            self.table_get(t, LuaValue::Integer(imm as i64))
                        );
                        self.ctx.stack[base + dst as usize] = v;
                    }
                    Instruction::SetIndex { table, imm, value } => {
                        let t = self.ctx.stack[base + table as usize];
                        let v = self.ctx.stack[base + value as usize];
                        vmtry!(
                            self,
                            ci_idx,
                            pc,
                            self.table_set(t, LuaValue::Integer(imm as i64), v)
                        );
                    }
                    Instruction::Arith { op, dst, lhs, rhs } => {
                        let a = self.ctx.stack[base + lhs as usize];
                        let b = self.ctx.stack[base + rhs as usize];
                        let v = vmtry!(self, ci_idx, pc, self.arith(op, a, b));
                        self.ctx.stack[base + dst as usize] = v;
                    }
                    Instruction::Unary { op, dst, src } => {
                        let a = self.ctx.stack[base + src as usize];
                        let v = vmtry!(self, ci_idx, pc, self.unary(op, a));
                        self.ctx.stack[base + dst as usize] = v;
                    }
                    Instruction::Compare { op, dst, lhs, rhs } => {
                        let a = self.ctx.stack[base + lhs as usize];
                        let b = self.ctx.stack[base + rhs as usize];
                        let v = vmtry!(self, ci_idx, pc, self.compare(op, a, b));
                        self.ctx.stack[base + dst as usize] = LuaValue::Boolean(v);
                    }
                    Instruction::Concat { dst, first, count } => {
                        let start = base + first as usize;
                        let vals: Vec<LuaValue> =
                            self.ctx.stack[start..start + count as usize].to_vec();
                        let v = vmtry!(self, ci_idx, pc, self.concat_values(&vals));
                        self.ctx.stack[base + dst as usize] = v;
                    }
                    Instruction::Test { src, expect } => {
                        if self.ctx.stack[base + src as usize].is_truthy() != expect {
                            pc += 1;
                        }
                    }
                    Instruction::Jump { offset } => {
                        pc = (pc as i64 + offset as i64) as usize;
                    }
                    Instruction::Closure { dst, proto: pidx } => {
                        let child = proto.protos[pidx as usize].clone();
                        let v =
                            vmtry!(self, ci_idx, pc, self.instantiate(child, func_slot, base));
                        self.ctx.stack[base + dst as usize] = v;
                    }
                    Instruction::Vararg { dst, count } => {
                        let nextra = self.ctx.frames[ci_idx].nextraargs;
                        let src = func_slot + 1;
                        let dst_abs = base + dst as usize;
                        let n = if count == lua_limits::MULTRET {
                            nextra
                        } else {
                            count as usize
                        };
                        vmtry!(self, ci_idx, pc, self.ensure_stack(dst_abs + n));
                        for i in 0..n {
                            self.ctx.stack[dst_abs + i] = if i < nextra {
                                self.ctx.stack[src + i]
                            } else {
                                LuaValue::Nil
                            };
                        }
                        if count == lua_limits::MULTRET {
                            self.ctx.top = dst_abs + n;
                        }
                    }
                    Instruction::Close { from } => {
                        let level = base + from as usize;
                        self.close_upvalues_from(level);
                        vmtry!(self, ci_idx, pc, self.close_tbc_from(level, LuaValue::Nil));
                    }
                    Instruction::Tbc { slot } => {
                        let abs = base + slot as usize;
                        vmtry!(self, ci_idx, pc, self.mark_to_be_closed(abs));
                    }
                    Instruction::Call {
                        func,
                        nargs,
                        nresults,
                    } => {
                        let abs_func = base + func as usize;
                        let nargs = if nargs == lua_limits::MULTRET {
                            self.ctx.top - abs_func - 1
                        } else {
                            self.ctx.top = abs_func + 1 + nargs as usize;
                            nargs as usize
                        };
                        let callee = vmtry!(self, ci_idx, pc, self.resolve_callable(abs_func));
                        let nargs = self.ctx.top - abs_func - 1;
                        match callee {
                            Callee::Lua => {
                                self.ctx.frames[ci_idx].pc = pc;
                                vmtry!(
                                    self,
                                    ci_idx,
                                    pc,
                                    self.precall_lua(abs_func, nargs, nresults)
                                );
                                continue 'reload;
                            }
                            Callee::Native(f) => {
                                match self.do_native_call(f, abs_func, nargs, nresults) {
                                    Ok(()) => {
                                        if nresults != lua_limits::MULTRET {
                                            self.ctx.top = frame_top;
                                        }
                                    }
                                    Err(LuaError::Yield) => {
                                        let ci = &mut self.ctx.frames[ci_idx];
                                        ci.pc = pc;
                                        ci.pending_result_slot = abs_func;
                                        ci.pending_nresults = nresults;
                                        return Err(LuaError::Yield);
                                    }
                                    Err(e) => {
                                        self.ctx.frames[ci_idx].pc = pc;
                                        return Err(e);
                                    }
                                }
                            }
                        }
                    }
                    Instruction::TailCall { func, nargs } => {
                        let abs_func = base + func as usize;
                        let nargs = if nargs == lua_limits::MULTRET {
                            self.ctx.top - abs_func - 1
                        } else {
                            self.ctx.top = abs_func + 1 + nargs as usize;
                            nargs as usize
                        };
                        // The frame's scope ends here.
                        self.close_upvalues_from(base);
                        vmtry!(self, ci_idx, pc, self.close_tbc_from(base, LuaValue::Nil));

                        let callee = vmtry!(self, ci_idx, pc, self.resolve_callable(abs_func));
                        let nargs = self.ctx.top - abs_func - 1;
                        // Slide callee and arguments down over the current
                        // frame; the CallInfo is reused, not re-pushed, so
                        // self-tail-recursion runs in O(1) frames.
                        for i in 0..=nargs {
                            self.ctx.stack[func_slot + i] = self.ctx.stack[abs_func + i];
                        }
                        self.ctx.top = func_slot + 1 + nargs;
                        let nres = self.ctx.frames[ci_idx].nresults;
                        // Observable in tracebacks: this frame was reused.
                        self.ctx.frames[ci_idx].set_tail();
                        match callee {
                            Callee::Lua => {
                                let mut new_ci = vmtry!(
                                    self,
                                    ci_idx,
                                    pc,
                                    self.build_lua_frame(func_slot, nargs, nres)
                                );
                                new_ci.set_tail();
                                self.ctx.top = new_ci.top;
                                self.ctx.frames[ci_idx] = new_ci;
                                continue 'reload;
                            }
                            Callee::Native(f) => {
                                match self.do_native_call(f, func_slot, nargs, nres) {
                                    Ok(()) => {
                                        // Results already sit at func_slot,
                                        // adjusted by poscall; the current
                                        // frame is done with them.
                                        self.ctx.frames.pop();
                                        continue 'reload;
                                    }
                                    Err(LuaError::Yield) => {
                                        // The tail frame is gone; the call
                                        // below inherits the pending site.
                                        self.ctx.frames.pop();
                                        if let Some(below) = self.ctx.frames.last_mut() {
                                            if below.is_lua() && !below.has_pending_call() {
                                                below.pending_result_slot = func_slot;
                                                below.pending_nresults = nres;
                                            }
                                        }
                                        return Err(LuaError::Yield);
                                    }
                                    Err(e) => {
                                        self.ctx.frames[ci_idx].pc = pc;
                                        return Err(e);
                                    }
                                }
                            }
                        }
                    }
                    Instruction::Return { first, count } => {
                        let src = base + first as usize;
                        let nres = if count == lua_limits::MULTRET {
                            self.ctx.top.saturating_sub(src)
                        } else {
                            count as usize
                        };
                        self.close_upvalues_from(base);
                        vmtry!(self, ci_idx, pc, self.close_tbc_from(base, LuaValue::Nil));
                        // poscall moves from the current top downward.
                        self.ctx.top = src + nres;
                        vmtry!(self, ci_idx, pc, self.poscall(nres));
                        continue 'reload;
                    }
                }
            }
        }
    }

    /// Fetch upvalue `n` of the closure at `slot`.
    fn closure_upvalue(&mut self, slot: usize, n: u8) -> LuaResult<UpvalueId> {
        let v = self.ctx.stack[slot];
        let uid = match v.as_function_id() {
            Some(fid) => match self.gc.pool.get_function(fid) {
                Some(FunctionBody::Lua { upvalues, .. }) => upvalues.get(n as usize).copied(),
                _ => None,
            },
            None => None,
        };
        match uid {
            Some(u) => Ok(u),
            None => Err(self.rt_error("upvalue index out of range")),
        }
    }

    /// Build a closure from a child prototype, capturing upvalues per its
    /// descriptors: registers of the enclosing frame share the canonical
    /// open upvalue; outer upvalues are shared directly.
    pub(crate) fn instantiate(
        &mut self,
        proto: Rc<Proto>,
        enclosing_func: usize,
        enclosing_base: usize,
    ) -> LuaResult<LuaValue> {
        let mut upvalues = Vec::with_capacity(proto.upvals.len());
        for desc in proto.upvals.clone() {
            let uid = if desc.in_stack {
                self.find_or_create_upvalue(enclosing_base + desc.index as usize)?
            } else {
                self.closure_upvalue(enclosing_func, desc.index)?
            };
            upvalues.push(uid);
        }
        let closure = self.create_closure(proto, upvalues)?;
        // New closure referencing existing upvalues: the closure is white,
        // no barrier needed; joins go through upvalue_join.
        Ok(closure)
    }

    /// Alias upvalue `n2` of `f2` into slot `n1` of `f1` (the
    /// `upvaluejoin` debug/metaprogramming primitive).
    pub fn upvalue_join(
        &mut self,
        f1: LuaValue,
        n1: usize,
        f2: LuaValue,
        n2: usize,
    ) -> LuaResult<()> {
        let (Some(id1), Some(id2)) = (f1.as_function_id(), f2.as_function_id()) else {
            return Err(self.rt_error("'upvalue_join' requires two interpreted closures"));
        };
        let target = match self.gc.pool.get_function(id2) {
            Some(FunctionBody::Lua { upvalues, .. }) => upvalues.get(n2).copied(),
            _ => None,
        };
        let Some(target) = target else {
            return Err(self.rt_error("upvalue index out of range"));
        };
        match self.gc.pool.get_function_mut(id1) {
            Some(FunctionBody::Lua { upvalues, .. }) => {
                let Some(slot) = upvalues.get_mut(n1) else {
                    return Err(self.rt_error("upvalue index out of range"));
                };
                *slot = target;
            }
            _ => return Err(self.rt_error("'upvalue_join' requires two interpreted closures")),
        }
        // The closure now references a cell it was not scanned with; same
        // discipline as any other reference store.
        self.gc.barrier_back(GcId::Function(id1));
        Ok(())
    }

    // ===== arithmetic / comparison with metamethod fallback =====

    pub(crate) fn arith(&mut self, op: ArithOp, a: LuaValue, b: LuaValue) -> LuaResult<LuaValue> {
        if let Some(v) = crate::lua_vm::raw_arith(op, &a, &b) {
            return Ok(v);
        }
        // String operands coerce to numbers before metamethods get a say.
        let ca = self.coerce_operand(&a);
        let cb = self.coerce_operand(&b);
        if let (Some(x), Some(y)) = (ca, cb) {
            if let Some(v) = crate::lua_vm::raw_arith(op, &x, &y) {
                return Ok(v);
            }
        }
        let tm = match op {
            ArithOp::Add => Tm::Add,
            ArithOp::Sub => Tm::Sub,
            ArithOp::Mul => Tm::Mul,
            ArithOp::Div => Tm::Div,
            ArithOp::IDiv => Tm::IDiv,
            ArithOp::Mod => Tm::Mod,
            ArithOp::Pow => Tm::Pow,
            ArithOp::BAnd => Tm::BAnd,
            ArithOp::BOr => Tm::BOr,
            ArithOp::BXor => Tm::BXor,
            ArithOp::Shl => Tm::Shl,
            ArithOp::Shr => Tm::Shr,
        };
        let mut mm = self.get_metamethod(&a, tm);
        if mm.is_nil() {
            mm = self.get_metamethod(&b, tm);
        }
        if mm.is_nil() {
            let bad = if a.is_number() { b } else { a };
            return Err(self.type_error("perform arithmetic on", &bad));
        }
        let r = self.call_values(mm, &[a, b], 1)?;
        Ok(r.first().copied().unwrap_or(LuaValue::Nil))
    }

    fn coerce_operand(&self, v: &LuaValue) -> Option<LuaValue> {
        match v {
            LuaValue::Integer(_) | LuaValue::Float(_) => Some(*v),
            LuaValue::String(_) => self.string_content(v).and_then(str_to_number),
            _ => None,
        }
    }

    pub(crate) fn unary(&mut self, op: UnaryOp, a: LuaValue) -> LuaResult<LuaValue> {
        match op {
            UnaryOp::Not => Ok(LuaValue::Boolean(!a.is_truthy())),
            UnaryOp::Len => self.length_of(&a),
            UnaryOp::Neg => {
                if let Some(v) = crate::lua_vm::raw_negate(&a) {
                    return Ok(v);
                }
                if let Some(x) = self.coerce_operand(&a) {
                    if let Some(v) = crate::lua_vm::raw_negate(&x) {
                        return Ok(v);
                    }
                }
                let mm = self.get_metamethod(&a, Tm::Unm);
                if mm.is_nil() {
                    return Err(self.type_error("perform arithmetic on", &a));
                }
                let r = self.call_values(mm, &[a, a], 1)?;
                Ok(r.first().copied().unwrap_or(LuaValue::Nil))
            }
            UnaryOp::BNot => {
                if let Some(v) = crate::lua_vm::raw_bnot(&a) {
                    return Ok(v);
                }
                let mm = self.get_metamethod(&a, Tm::BNot);
                if mm.is_nil() {
                    return Err(self.type_error("perform bitwise operation on", &a));
                }
                let r = self.call_values(mm, &[a, a], 1)?;
                Ok(r.first().copied().unwrap_or(LuaValue::Nil))
            }
        }
    }

    pub(crate) fn compare(&mut self, op: CmpOp, a: LuaValue, b: LuaValue) -> LuaResult<bool> {
        if matches!(op, CmpOp::Eq | CmpOp::Ne) {
            let eq = self.values_equal(&a, &b)?;
            return Ok(if op == CmpOp::Eq { eq } else { !eq });
        }
        let str_cmp = match (self.string_content(&a), self.string_content(&b)) {
            (Some(x), Some(y)) => Some(x.cmp(y)),
            _ => None,
        };
        if let Some(r) = crate::lua_vm::raw_compare(op, &a, &b, str_cmp) {
            return Ok(r);
        }
        // Order metamethods; Gt/Ge swap their operands onto __lt/__le.
        let (tm, x, y) = match op {
            CmpOp::Lt => (Tm::Lt, a, b),
            CmpOp::Le => (Tm::Le, a, b),
            CmpOp::Gt => (Tm::Lt, b, a),
            CmpOp::Ge => (Tm::Le, b, a),
            CmpOp::Eq | CmpOp::Ne => unreachable!(),
        };
        let mut mm = self.get_metamethod(&x, tm);
        if mm.is_nil() {
            mm = self.get_metamethod(&y, tm);
        }
        if mm.is_nil() {
            let msg = format!(
                "attempt to compare {} with {}",
                a.type_name(),
                b.type_name()
            );
            return Err(self.rt_error(msg));
        }
        let r = self.call_values(mm, &[x, y], 1)?;
        Ok(r.first().map(|v| v.is_truthy()).unwrap_or(false))
    }
}

enum Callee {
    Native(NativeFn),
    Lua,
}
