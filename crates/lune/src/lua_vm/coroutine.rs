// Coroutine engine: resume, yield, close.
//
// A resume is a synchronous transfer of control. The resumer's execution
// context is parked in its thread object (status Normal) and the target's
// context is moved into the VM; values travel by move between the two
// stacks. A yield unwinds the Rust frames as Err(LuaError::Yield) while
// the CallInfo chain stays parked in the suspended context; the next
// resume unrolls it - interpreted frames re-enter the dispatcher at their
// saved pc, native frames re-enter through their registered continuation.

use crate::gc::{GcData, ThreadId};
use crate::lua_value::LuaValue;
use crate::lua_vm::call_status::CIST_YPCALL;
use crate::lua_vm::{
    CoroutineStatus, LuaError, LuaResult, LuaThread, LuaVM, ThreadStatus, lua_limits,
};

impl LuaVM {
    /// Create a suspended coroutine around a function value.
    pub fn create_coroutine(&mut self, func: LuaValue) -> LuaResult<LuaValue> {
        if !func.is_function() {
            return Err(self.type_error("create a coroutine from", &func));
        }
        let size = 256 + lua_limits::BASIC_STACK_SIZE * 16;
        let id = self.alloc_object(
            GcData::Thread(Box::new(LuaThread::new_suspended(func))),
            size,
        )?;
        Ok(LuaValue::Thread(ThreadId(id)))
    }

    /// Status of a coroutine value from the resumer's point of view.
    pub fn thread_status(&self, co: &LuaValue) -> CoroutineStatus {
        match co.as_thread_id() {
            Some(tid) if tid == self.current_thread => CoroutineStatus::Running,
            Some(tid) => self
                .gc
                .pool
                .get_thread(tid)
                .map(|t| t.status)
                .unwrap_or(CoroutineStatus::Dead),
            None => CoroutineStatus::Dead,
        }
    }

    /// Resume a suspended coroutine, transferring `args` to it. Returns
    /// the status plus the values it yielded/returned; on error the
    /// error value is the single element and the resumer's own stack is
    /// untouched.
    pub fn resume(
        &mut self,
        co: LuaValue,
        args: &[LuaValue],
    ) -> LuaResult<(ThreadStatus, Vec<LuaValue>)> {
        let Some(tid) = co.as_thread_id() else {
            return Err(self.type_error("resume", &co));
        };
        let resumable = tid != self.current_thread
            && self
                .gc
                .pool
                .get_thread(tid)
                .map(|t| t.can_resume())
                .unwrap_or(false);
        if !resumable {
            let which = match self.thread_status(&co) {
                CoroutineStatus::Dead => "dead",
                _ => "non-suspended",
            };
            let msg = self.create_string(&format!("cannot resume {which} coroutine"))?;
            return Ok((ThreadStatus::ErrRun, vec![msg]));
        }

        tracing::trace!(co = tid.0, "coroutine resume");
        self.switch_to(tid);

        // A fresh coroutine starts its body; a yielded one is unrolled.
        let first_time = self.ctx.status != ThreadStatus::Yield;
        let mut result: LuaResult<()> = if first_time {
            let nargs = args.len();
            match self.ensure_stack(1 + nargs + lua_limits::EXTRA_STACK) {
                Ok(()) => {
                    for (i, a) in args.iter().enumerate() {
                        self.ctx.stack[1 + i] = *a;
                    }
                    self.ctx.top = 1 + nargs;
                    self.do_call(0, nargs, lua_limits::MULTRET)
                }
                Err(e) => Err(e),
            }
        } else {
            self.unroll(args)
        };

        // A failure below a yieldable protected boundary is recovered
        // into its continuation instead of killing the coroutine.
        loop {
            match result {
                Err(e) if !matches!(e, LuaError::Yield) => match self.try_recover(e) {
                    Some(next) => result = next,
                    None => break,
                },
                _ => break,
            }
        }

        match result {
            Ok(()) => {
                let vals: Vec<LuaValue> = self.ctx.stack[0..self.ctx.top].to_vec();
                self.ctx.status = ThreadStatus::Ok;
                self.switch_back(tid, CoroutineStatus::Dead);
                Ok((ThreadStatus::Ok, vals))
            }
            Err(LuaError::Yield) => {
                let vals = std::mem::take(&mut self.ctx.yield_values);
                self.ctx.status = ThreadStatus::Yield;
                self.switch_back(tid, CoroutineStatus::Suspended);
                Ok((ThreadStatus::Yield, vals))
            }
            Err(e) => {
                let errval = self.take_error_value();
                // The dead coroutine's scopes still get their closers.
                self.close_upvalues_from(0);
                self.close_tbc_unwind(0, errval);
                self.ctx.frames.clear();
                self.ctx.top = 0;
                self.ctx.status = e.into();
                self.ctx.error_value = errval;
                self.switch_back(tid, CoroutineStatus::Dead);
                Ok((e.into(), vec![errval]))
            }
        }
    }

    /// Yield from the running coroutine. Returns the error-shaped control
    /// signal the caller must propagate:
    /// `return Err(vm.yield_values(&[...]))`.
    pub fn yield_values(&mut self, vals: &[LuaValue]) -> LuaError {
        if self.resume_chain().is_empty() || self.current_thread == self.main_thread_id() {
            return self.rt_error("attempt to yield from outside a coroutine");
        }
        self.ctx.yield_values = vals.to_vec();
        self.ctx.yield_origin = self.ctx.frames.len().checked_sub(1);
        tracing::trace!(n = vals.len(), "coroutine yield");
        LuaError::Yield
    }

    /// Close a suspended or dead coroutine: run its pending to-be-closed
    /// finalizers and make it terminally dead. Closing the running thread
    /// or a thread in the resume chain is an error.
    pub fn close_thread(&mut self, co: LuaValue) -> LuaResult<()> {
        let Some(tid) = co.as_thread_id() else {
            return Err(self.type_error("close", &co));
        };
        if tid == self.current_thread || self.resume_chain().contains(&tid) {
            return Err(self.rt_error("cannot close a running coroutine"));
        }
        match self.gc.pool.get_thread(tid).map(|t| t.status) {
            Some(CoroutineStatus::Suspended) | Some(CoroutineStatus::Dead) => {}
            Some(CoroutineStatus::Normal) => {
                return Err(self.rt_error("cannot close a normal coroutine"));
            }
            Some(CoroutineStatus::Running) | None => {
                return Err(self.rt_error("cannot close a running coroutine"));
            }
        }

        // Run the closers on the thread's own stack.
        self.switch_to(tid);
        let r = self.close_tbc_from(0, LuaValue::Nil);
        self.close_upvalues_from(0);
        self.ctx.frames.clear();
        self.ctx.top = 0;
        self.switch_back(tid, CoroutineStatus::Dead);
        r
    }

    // ===== context switching =====

    /// Park the running thread (it becomes Normal in the resume chain)
    /// and activate `tid`.
    fn switch_to(&mut self, tid: ThreadId) {
        let old = self.current_thread;
        let old_ctx = std::mem::take(&mut self.ctx);
        if let Some(t) = self.gc.pool.get_thread_mut(old) {
            t.ctx = Some(old_ctx);
            t.status = CoroutineStatus::Normal;
        }
        self.resume_chain_mut().push(old);

        let new_ctx = self
            .gc
            .pool
            .get_thread_mut(tid)
            .and_then(|t| {
                t.status = CoroutineStatus::Running;
                t.ctx.take()
            })
            .unwrap_or_default();
        self.ctx = new_ctx;
        self.current_thread = tid;
    }

    /// Park the finished/suspended coroutine with `status` and reactivate
    /// the resumer on top of the chain.
    fn switch_back(&mut self, tid: ThreadId, status: CoroutineStatus) {
        debug_assert!(tid == self.current_thread);
        let mut parked = std::mem::take(&mut self.ctx);
        if status == CoroutineStatus::Dead {
            // A dead thread keeps its status and error value, not its
            // stack.
            parked.stack = Vec::new();
            parked.frames = Vec::new();
            parked.open_upvalues.clear();
            parked.tbc.clear();
        }
        if let Some(t) = self.gc.pool.get_thread_mut(tid) {
            t.ctx = Some(parked);
            t.status = status;
        }

        let back = self
            .resume_chain_mut()
            .pop()
            .unwrap_or(self.main_thread_id());
        let back_ctx = self
            .gc
            .pool
            .get_thread_mut(back)
            .and_then(|t| {
                t.status = CoroutineStatus::Running;
                t.ctx.take()
            })
            .unwrap_or_default();
        self.ctx = back_ctx;
        self.current_thread = back;
    }

    // ===== resume unrolling =====

    /// Continue a yielded frame chain: deliver the resume values to the
    /// innermost pending site, then finish frames until the chain runs
    /// dry - interpreted frames via the dispatcher, native frames via
    /// their continuations.
    fn unroll(&mut self, args: &[LuaValue]) -> LuaResult<()> {
        let mut deliver: Option<Vec<LuaValue>> = Some(args.to_vec());

        // The body itself was the yield origin and is already gone: the
        // resume values become the coroutine's results.
        if self.ctx.frames.is_empty() {
            let vals = deliver.take().unwrap_or_default();
            self.ensure_stack(vals.len())?;
            for (i, v) in vals.iter().enumerate() {
                self.ctx.stack[i] = *v;
            }
            self.ctx.top = vals.len();
            return Ok(());
        }

        // Interpreted top frame: resume values become the results of the
        // call that yielded.
        if let Some(ci) = self.ctx.frames.last() {
            if ci.is_lua() && ci.has_pending_call() {
                let dst = ci.pending_result_slot;
                let want = ci.pending_nresults;
                let frame_top = ci.top;
                let vals = deliver.take().unwrap_or_default();
                let n = vals.len();
                if want == lua_limits::MULTRET {
                    self.ensure_stack(dst + n)?;
                    for (i, v) in vals.into_iter().enumerate() {
                        self.ctx.stack[dst + i] = v;
                    }
                    self.ctx.top = dst + n;
                } else {
                    let want = want as usize;
                    self.ensure_stack(dst + want)?;
                    for i in 0..want {
                        self.ctx.stack[dst + i] =
                            vals.get(i).copied().unwrap_or(LuaValue::Nil);
                    }
                    self.ctx.top = frame_top;
                }
                let ci = self.ctx.frames.last_mut().unwrap();
                ci.pending_result_slot = usize::MAX;
                ci.pending_nresults = 0;
            }
        }

        loop {
            let Some(ci) = self.ctx.frames.last() else {
                return Ok(());
            };
            if ci.is_lua() {
                self.run_interpreter(1)?;
                // Either everything finished or a native continuation
                // frame surfaced; loop to find out.
                if self.ctx.frames.is_empty() {
                    return Ok(());
                }
                continue;
            }
            // Native frame: only continuation-carrying frames can be in a
            // suspended chain.
            let Some(k) = ci.continuation else {
                return Err(self.rt_error("cannot resume a native frame without continuation"));
            };
            let kctx = ci.continuation_ctx;
            // First delivery: resume values are pushed for the
            // continuation to consume, like results of the yielded call.
            if let Some(vals) = deliver.take() {
                let top = self.ctx.top;
                self.ensure_stack(top + vals.len())?;
                for (i, v) in vals.into_iter().enumerate() {
                    self.ctx.stack[top + i] = v;
                    self.ctx.top = top + i + 1;
                }
            }
            self.ctx.native_depth += 1;
            let r = k(self, ThreadStatus::Yield, kctx);
            self.ctx.native_depth -= 1;
            match r {
                Ok(n) => {
                    self.poscall(n as usize)?;
                    // The caller's results are in place; drop any stale
                    // pending marker left from the original yield.
                    if let Some(below) = self.ctx.frames.last_mut() {
                        if below.is_lua() {
                            below.pending_result_slot = usize::MAX;
                            below.pending_nresults = 0;
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Recovery across a yieldable protected call: unwind to the topmost
    /// CIST_YPCALL frame and hand the error to its continuation.
    fn try_recover(&mut self, e: LuaError) -> Option<LuaResult<()>> {
        let idx = self
            .ctx
            .frames
            .iter()
            .rposition(|ci| ci.call_status & CIST_YPCALL != 0)?;
        let ci = self.ctx.frames[idx].clone();
        let boundary = ci.pending_result_slot;
        let k = ci.continuation?;
        let errval = self.take_error_value();

        self.close_upvalues_from(boundary);
        self.close_tbc_unwind(boundary, errval);
        self.ctx.frames.truncate(idx + 1);
        // Disarm so a second failure does not loop back here.
        {
            let ci = self.ctx.frames.last_mut().unwrap();
            ci.call_status &= !CIST_YPCALL;
            ci.pending_result_slot = usize::MAX;
        }
        self.ctx.top = boundary;
        self.ctx.error_value = errval;

        let status: ThreadStatus = e.into();
        self.ctx.native_depth += 1;
        let r = k(self, status, ci.continuation_ctx);
        self.ctx.native_depth -= 1;
        Some(match r {
            Ok(n) => match self.poscall(n as usize) {
                Ok(()) => {
                    if let Some(below) = self.ctx.frames.last_mut() {
                        if below.is_lua() {
                            below.pending_result_slot = usize::MAX;
                            below.pending_nresults = 0;
                        }
                    }
                    self.unroll(&[])
                }
                Err(e2) => Err(e2),
            },
            Err(e2) => Err(e2),
        })
    }
}
