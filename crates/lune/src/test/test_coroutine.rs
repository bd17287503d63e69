use crate::lua_value::LuaValue;
use crate::lua_vm::{
    CoroutineStatus, Instruction, LuaResult, LuaVM, ProtoBuilder, ThreadStatus,
};
use crate::test::new_vm;

fn lua_yield(vm: &mut LuaVM) -> LuaResult<i32> {
    let n = vm.get_top();
    let vals: Vec<LuaValue> = (1..=n).map(|i| vm.value_at(i as i32)).collect();
    Err(vm.yield_values(&vals))
}

fn register_yield(vm: &mut LuaVM) {
    vm.register("yield", lua_yield).unwrap();
}

/// function() yield(11); return 22 end
fn build_yield_then_return(vm: &mut LuaVM) -> LuaValue {
    let mut b = ProtoBuilder::new("co_body").max_stack(3);
    let k_yield = b.constant(vm.create_string("yield").unwrap());
    b.emit(Instruction::GetGlobal {
        dst: 0,
        name_k: k_yield,
    });
    b.emit(Instruction::LoadInt { dst: 1, value: 11 });
    b.emit(Instruction::Call {
        func: 0,
        nargs: 1,
        nresults: 0,
    });
    b.emit(Instruction::LoadInt { dst: 0, value: 22 });
    b.emit(Instruction::Return { first: 0, count: 1 });
    vm.instantiate_root(b.build()).unwrap()
}

#[test]
fn resume_yield_round_trip() {
    let mut vm = new_vm();
    register_yield(&mut vm);
    let body = build_yield_then_return(&mut vm);
    let co = vm.create_coroutine(body).unwrap();

    let (st, vals) = vm.resume(co, &[]).unwrap();
    assert_eq!(st, ThreadStatus::Yield);
    assert_eq!(vals, vec![LuaValue::Integer(11)]);
    assert_eq!(vm.thread_status(&co), CoroutineStatus::Suspended);

    let (st, vals) = vm.resume(co, &[]).unwrap();
    assert_eq!(st, ThreadStatus::Ok);
    assert_eq!(vals, vec![LuaValue::Integer(22)]);
    assert_eq!(vm.thread_status(&co), CoroutineStatus::Dead);
}

#[test]
fn resuming_a_dead_coroutine_reports_an_error() {
    let mut vm = new_vm();
    register_yield(&mut vm);
    let body = build_yield_then_return(&mut vm);
    let co = vm.create_coroutine(body).unwrap();
    vm.resume(co, &[]).unwrap();
    vm.resume(co, &[]).unwrap();

    // Put a sentinel on the resumer's stack to check it is preserved.
    vm.push_integer(777).unwrap();
    let (st, vals) = vm.resume(co, &[]).unwrap();
    assert_eq!(st, ThreadStatus::ErrRun);
    assert!(vm.string_content(&vals[0]).unwrap().contains("dead"));
    assert_eq!(vm.to_integer(-1), Some(777));
    vm.pop(1);
}

#[test]
fn resume_arguments_become_yield_results() {
    let mut vm = new_vm();
    register_yield(&mut vm);

    // function(a) local b = yield(a + 1); return b * 2 end
    let mut b = ProtoBuilder::new("co_args").params(1).max_stack(4);
    let k_yield = b.constant(vm.create_string("yield").unwrap());
    b.emit(Instruction::GetGlobal {
        dst: 1,
        name_k: k_yield,
    });
    b.emit(Instruction::LoadInt { dst: 2, value: 1 });
    b.emit(Instruction::Arith {
        op: crate::lua_vm::ArithOp::Add,
        dst: 2,
        lhs: 0,
        rhs: 2,
    });
    b.emit(Instruction::Call {
        func: 1,
        nargs: 1,
        nresults: 1,
    });
    b.emit(Instruction::LoadInt { dst: 2, value: 2 });
    b.emit(Instruction::Arith {
        op: crate::lua_vm::ArithOp::Mul,
        dst: 1,
        lhs: 1,
        rhs: 2,
    });
    b.emit(Instruction::Return { first: 1, count: 1 });
    let body = vm.instantiate_root(b.build()).unwrap();
    let co = vm.create_coroutine(body).unwrap();

    let (st, vals) = vm.resume(co, &[LuaValue::Integer(10)]).unwrap();
    assert_eq!(st, ThreadStatus::Yield);
    assert_eq!(vals, vec![LuaValue::Integer(11)]);

    let (st, vals) = vm.resume(co, &[LuaValue::Integer(30)]).unwrap();
    assert_eq!(st, ThreadStatus::Ok);
    assert_eq!(vals, vec![LuaValue::Integer(60)]);
}

#[test]
fn values_move_between_stacks() {
    let mut vm = new_vm();
    register_yield(&mut vm);

    // The coroutine yields a freshly built table; the resumer can read
    // it even while the coroutine stays suspended.
    fn make_and_yield(vm: &mut LuaVM) -> LuaResult<i32> {
        let t = vm.create_table(0, 1)?;
        let k = vm.create_string("tag")?;
        vm.raw_set_checked(t.as_table_id().unwrap(), &k, LuaValue::Integer(5))?;
        Err(vm.yield_values(&[t]))
    }
    let co = vm
        .create_coroutine(LuaValue::NativeFunction(make_and_yield))
        .unwrap();
    let (st, vals) = vm.resume(co, &[]).unwrap();
    assert_eq!(st, ThreadStatus::Yield);
    let k = vm.create_string("tag").unwrap();
    assert_eq!(vm.raw_get(&vals[0], &k), LuaValue::Integer(5));
}

#[test]
fn yield_from_the_main_thread_is_an_error() {
    let mut vm = new_vm();
    let e = vm.yield_values(&[]);
    assert_eq!(e, crate::lua_vm::LuaError::Runtime);
    assert!(vm.error_message().contains("outside a coroutine"));
}

#[test]
fn coroutine_error_kills_it_and_reports() {
    let mut vm = new_vm();
    fn blow_up(vm: &mut LuaVM) -> LuaResult<i32> {
        Err(vm.rt_error("inner failure"))
    }
    let co = vm
        .create_coroutine(LuaValue::NativeFunction(blow_up))
        .unwrap();
    let (st, vals) = vm.resume(co, &[]).unwrap();
    assert_eq!(st, ThreadStatus::ErrRun);
    assert_eq!(vm.string_content(&vals[0]), Some("inner failure"));
    assert_eq!(vm.thread_status(&co), CoroutineStatus::Dead);
}

#[test]
fn close_runs_pending_to_be_closed() {
    let mut vm = new_vm();
    register_yield(&mut vm);

    fn on_close(vm: &mut LuaVM) -> LuaResult<i32> {
        let n = vm.get_global("co_closed")?.as_integer().unwrap_or(0);
        vm.set_global("co_closed", LuaValue::Integer(n + 1))?;
        Ok(0)
    }
    fn mkres(vm: &mut LuaVM) -> LuaResult<i32> {
        let mt = vm.create_table(0, 1)?;
        let k = vm.create_string("__close")?;
        vm.raw_set_checked(
            mt.as_table_id().unwrap(),
            &k,
            LuaValue::NativeFunction(on_close),
        )?;
        let t = vm.create_table(0, 0)?;
        vm.set_metatable_of(&t, mt.as_table_id())?;
        vm.push_lua_value(t)?;
        Ok(1)
    }
    vm.register("mkres", mkres).unwrap();
    vm.set_global("co_closed", LuaValue::Integer(0)).unwrap();

    // function() local r <close> = mkres(); yield(); return end
    let mut b = ProtoBuilder::new("co_tbc").max_stack(3);
    let k_mkres = b.constant(vm.create_string("mkres").unwrap());
    let k_yield = b.constant(vm.create_string("yield").unwrap());
    b.emit(Instruction::GetGlobal {
        dst: 0,
        name_k: k_mkres,
    });
    b.emit(Instruction::Call {
        func: 0,
        nargs: 0,
        nresults: 1,
    });
    b.emit(Instruction::Tbc { slot: 0 });
    b.emit(Instruction::GetGlobal {
        dst: 1,
        name_k: k_yield,
    });
    b.emit(Instruction::Call {
        func: 1,
        nargs: 0,
        nresults: 0,
    });
    b.emit(Instruction::Return { first: 0, count: 0 });
    let body = vm.instantiate_root(b.build()).unwrap();
    let co = vm.create_coroutine(body).unwrap();

    let (st, _) = vm.resume(co, &[]).unwrap();
    assert_eq!(st, ThreadStatus::Yield);
    assert_eq!(vm.get_global("co_closed").unwrap(), LuaValue::Integer(0));

    // Closing the suspended coroutine runs the closer exactly once.
    vm.close_thread(co).unwrap();
    assert_eq!(vm.get_global("co_closed").unwrap(), LuaValue::Integer(1));
    assert_eq!(vm.thread_status(&co), CoroutineStatus::Dead);

    // Closing again is a no-op on the to-be-closed list.
    vm.close_thread(co).unwrap();
    assert_eq!(vm.get_global("co_closed").unwrap(), LuaValue::Integer(1));
}

#[test]
fn closing_the_running_thread_is_an_error() {
    let mut vm = new_vm();
    let main = LuaValue::Thread(vm.main_thread_id());
    assert!(vm.close_thread(main).is_err());
}

#[test]
fn pcallk_continuation_handles_yield_across_native_frame() {
    let mut vm = new_vm();
    register_yield(&mut vm);

    // Continuation: runs when the protected body yielded and the
    // coroutine was resumed. Sums whatever the resume passed in.
    fn after_yield(vm: &mut LuaVM, status: ThreadStatus, kctx: i64) -> LuaResult<i32> {
        assert_eq!(status, ThreadStatus::Yield);
        assert_eq!(kctx, 99);
        let n = vm.get_top();
        let total: i64 = (1..=n)
            .map(|i| vm.to_integer(i as i32).unwrap_or(0))
            .sum();
        vm.push_integer(total)?;
        Ok(1)
    }

    // Native frame that runs the yielding function under pcallk: the
    // yield crosses this frame legally because of the continuation.
    fn guarded(vm: &mut LuaVM) -> LuaResult<i32> {
        let y = vm.get_global("yield")?;
        vm.push_lua_value(y)?;
        match vm.pcallk(0, 0, after_yield, 99) {
            Ok(_status) => {
                vm.push_integer(-1)?;
                Ok(1)
            }
            Err(e) => Err(e), // the yield travels through here
        }
    }
    vm.register("guarded", guarded).unwrap();

    let g = vm.get_global("guarded").unwrap();
    let co = vm.create_coroutine(g).unwrap();
    let (st, _) = vm.resume(co, &[]).unwrap();
    assert_eq!(st, ThreadStatus::Yield);

    // Resume with values; the continuation sums them into the result.
    let (st, vals) = vm
        .resume(co, &[LuaValue::Integer(3), LuaValue::Integer(4)])
        .unwrap();
    assert_eq!(st, ThreadStatus::Ok);
    assert_eq!(vals, vec![LuaValue::Integer(7)]);
}

#[test]
fn yield_across_a_plain_native_frame_is_an_error() {
    let mut vm = new_vm();
    register_yield(&mut vm);

    // A native frame that calls the yielding body with a plain call: the
    // yield cannot cross it.
    fn crossing(vm: &mut LuaVM) -> LuaResult<i32> {
        let body = vm.get_global("inner_body")?;
        vm.push_lua_value(body)?;
        vm.call(0, 0)?;
        Ok(0)
    }
    vm.register("crossing", crossing).unwrap();

    let mut b = ProtoBuilder::new("inner").max_stack(2);
    let k_yield = b.constant(vm.create_string("yield").unwrap());
    b.emit(Instruction::GetGlobal {
        dst: 0,
        name_k: k_yield,
    });
    b.emit(Instruction::Call {
        func: 0,
        nargs: 0,
        nresults: 0,
    });
    b.emit(Instruction::Return { first: 0, count: 0 });
    let inner = vm.instantiate_root(b.build()).unwrap();
    vm.set_global("inner_body", inner).unwrap();

    let crossing_fn = vm.get_global("crossing").unwrap();
    let co = vm.create_coroutine(crossing_fn).unwrap();
    let (st, vals) = vm.resume(co, &[]).unwrap();
    assert_eq!(st, ThreadStatus::ErrRun);
    let msg = vm.string_content(&vals[0]).unwrap();
    assert!(msg.contains("native call boundary"), "got: {msg}");
}

#[test]
fn nested_resume_marks_the_resumer_normal() {
    let mut vm = new_vm();
    register_yield(&mut vm);

    // outer coroutine resumes an inner one that yields; while inner runs
    // (and yields), outer is "normal".
    fn outer_body(vm: &mut LuaVM) -> LuaResult<i32> {
        let inner = vm.get_global("inner_co")?;
        let (st, vals) = vm.resume(inner, &[])?;
        assert_eq!(st, ThreadStatus::Yield);
        Err(vm.yield_values(&vals))
    }
    let body = build_yield_then_return(&mut vm);
    let inner_co = vm.create_coroutine(body).unwrap();
    vm.set_global("inner_co", inner_co).unwrap();

    let outer = vm
        .create_coroutine(LuaValue::NativeFunction(outer_body))
        .unwrap();
    let (st, vals) = vm.resume(outer, &[]).unwrap();
    assert_eq!(st, ThreadStatus::Yield);
    assert_eq!(vals, vec![LuaValue::Integer(11)]);
    assert_eq!(vm.thread_status(&inner_co), CoroutineStatus::Suspended);
}
