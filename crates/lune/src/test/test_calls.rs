use crate::lua_value::LuaValue;
use crate::lua_vm::{
    CmpOp, Instruction, LuaResult, LuaVM, ProtoBuilder, SafeOption, ThreadStatus,
};
use crate::test::new_vm;

/// countdown(n): if n == 0 then return "done" end; return countdown(n-1)
/// Tail-call variant when `tail` is true, plain recursion otherwise.
fn build_countdown(vm: &mut LuaVM, tail: bool) -> LuaValue {
    let mut b = ProtoBuilder::new("countdown").params(1).max_stack(3);
    let k_done = b.constant(vm.create_string("done").unwrap());
    let k_self = b.constant(vm.create_string("countdown").unwrap());
    b.emit(Instruction::LoadInt { dst: 1, value: 0 });
    b.emit(Instruction::Compare {
        op: CmpOp::Eq,
        dst: 1,
        lhs: 0,
        rhs: 1,
    });
    // n == 0: fall through to the jump; otherwise skip it.
    b.emit(Instruction::Test {
        src: 1,
        expect: true,
    });
    let jump_to_base = b.emit(Instruction::Jump { offset: 0 });
    b.emit(Instruction::GetGlobal {
        dst: 1,
        name_k: k_self,
    });
    b.emit(Instruction::LoadInt { dst: 2, value: 1 });
    b.emit(Instruction::Arith {
        op: crate::lua_vm::ArithOp::Sub,
        dst: 2,
        lhs: 0,
        rhs: 2,
    });
    if tail {
        b.emit(Instruction::TailCall { func: 1, nargs: 1 });
    } else {
        b.emit(Instruction::Call {
            func: 1,
            nargs: 1,
            nresults: 1,
        });
        b.emit(Instruction::Return { first: 1, count: 1 });
    }
    b.patch_jump_to_here(jump_to_base);
    b.emit(Instruction::LoadConst { dst: 1, k: k_done });
    b.emit(Instruction::Return { first: 1, count: 1 });

    let f = vm.instantiate_root(b.build()).unwrap();
    vm.set_global("countdown", f).unwrap();
    f
}

#[test]
fn plain_call_returns_adjusted_results() {
    let mut vm = new_vm();
    let f = build_countdown(&mut vm, true);
    vm.push_lua_value(f).unwrap();
    vm.push_integer(3).unwrap();
    vm.call(1, 1).unwrap();
    assert_eq!(vm.to_str(-1), Some("done"));
    vm.pop(1);
    assert_eq!(vm.get_top(), 0);
}

#[test]
fn tail_recursion_runs_in_constant_frames() {
    let mut vm = new_vm();
    let f = build_countdown(&mut vm, true);
    // Far deeper than any frame budget; only frame reuse survives this.
    let r = vm.call_values(f, &[LuaValue::Integer(1_000_000)], 1).unwrap();
    assert_eq!(vm.string_content(&r[0]), Some("done"));
    assert!(vm.ctx.frames.is_empty());
}

#[test]
fn non_tail_recursion_overflows_at_bounded_depth() {
    let mut vm = new_vm();
    let f = build_countdown(&mut vm, false);
    vm.push_lua_value(f).unwrap();
    vm.push_integer(1_000_000).unwrap();
    let status = vm.pcall(1, 1).unwrap();
    assert_eq!(status, ThreadStatus::ErrRun);
    let msg = vm.to_string_coerce(-1).unwrap();
    assert!(msg.contains("stack overflow"), "got: {msg}");
}

#[test]
fn tail_frames_carry_the_marker() {
    let mut vm = new_vm();

    // A function that tail-calls a native that inspects the traceback.
    fn probe(vm: &mut LuaVM) -> LuaResult<i32> {
        let tb = vm.traceback();
        let v = vm.create_string(&tb)?;
        vm.push_lua_value(v)?;
        Ok(1)
    }
    vm.register("probe", probe).unwrap();

    let mut b = ProtoBuilder::new("tailer").max_stack(2);
    let k_probe = b.constant(vm.create_string("probe").unwrap());
    b.emit(Instruction::GetGlobal {
        dst: 0,
        name_k: k_probe,
    });
    b.emit(Instruction::TailCall { func: 0, nargs: 0 });
    let f = vm.instantiate_root(b.build()).unwrap();

    let r = vm.call_values(f, &[], 1).unwrap();
    let tb = vm.string_content(&r[0]).unwrap();
    assert!(tb.contains("tail calls"), "traceback was: {tb}");
}

#[test]
fn pcall_catches_native_errors() {
    let mut vm = new_vm();
    fn boom(vm: &mut LuaVM) -> LuaResult<i32> {
        Err(vm.rt_error("kaboom"))
    }
    vm.push_native_function(boom).unwrap();
    let status = vm.pcall(0, 0).unwrap();
    assert_eq!(status, ThreadStatus::ErrRun);
    assert_eq!(vm.to_str(-1), Some("kaboom"));
    vm.pop(1);
}

#[test]
fn pcall_restores_the_stack_boundary() {
    let mut vm = new_vm();
    fn boom(vm: &mut LuaVM) -> LuaResult<i32> {
        vm.push_integer(1)?;
        vm.push_integer(2)?;
        Err(vm.rt_error("later"))
    }
    vm.push_integer(111).unwrap();
    vm.push_native_function(boom).unwrap();
    let status = vm.pcall(0, 0).unwrap();
    assert_eq!(status, ThreadStatus::ErrRun);
    vm.pop(1); // error value
    // The value below the boundary is untouched.
    assert_eq!(vm.to_integer(-1), Some(111));
}

#[test]
fn errors_carry_arbitrary_values() {
    let mut vm = new_vm();
    fn throw_table(vm: &mut LuaVM) -> LuaResult<i32> {
        let t = vm.create_table(0, 1)?;
        let tid = t.as_table_id().unwrap();
        let k = vm.create_string("code")?;
        vm.raw_set_checked(tid, &k, LuaValue::Integer(42))?;
        Err(vm.throw_value(t))
    }
    vm.push_native_function(throw_table).unwrap();
    let status = vm.pcall(0, 0).unwrap();
    assert_eq!(status, ThreadStatus::ErrRun);
    let err = vm.value_at(-1);
    assert!(err.is_table());
    let k = vm.create_string("code").unwrap();
    assert_eq!(vm.raw_get(&err, &k), LuaValue::Integer(42));
    vm.pop(1);
}

#[test]
fn protected_call_closes_to_be_closed_variables() {
    let mut vm = new_vm();

    // Counter bumped by the resource's __close.
    fn on_close(vm: &mut LuaVM) -> LuaResult<i32> {
        let n = vm.get_global("closed_count")?.as_integer().unwrap_or(0);
        vm.set_global("closed_count", LuaValue::Integer(n + 1))?;
        Ok(0)
    }
    // Builds a table whose metatable has __close.
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
    fn boom(vm: &mut LuaVM) -> LuaResult<i32> {
        Err(vm.rt_error("unwind now"))
    }
    vm.register("mkres", mkres).unwrap();
    vm.register("boom", boom).unwrap();
    vm.set_global("closed_count", LuaValue::Integer(0)).unwrap();

    // function() local r <close> = mkres(); boom(); end
    let mut b = ProtoBuilder::new("body").max_stack(3);
    let k_mkres = b.constant(vm.create_string("mkres").unwrap());
    let k_boom = b.constant(vm.create_string("boom").unwrap());
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
        name_k: k_boom,
    });
    b.emit(Instruction::Call {
        func: 1,
        nargs: 0,
        nresults: 0,
    });
    b.emit(Instruction::Return { first: 0, count: 0 });
    let f = vm.instantiate_root(b.build()).unwrap();

    vm.push_lua_value(f).unwrap();
    let status = vm.pcall(0, 0).unwrap();
    assert_eq!(status, ThreadStatus::ErrRun);
    assert_eq!(vm.to_str(-1), Some("unwind now"));
    vm.pop(1);

    // The raise bypassed the normal return path, yet the closer ran
    // exactly once.
    let n = vm.get_global("closed_count").unwrap();
    assert_eq!(n, LuaValue::Integer(1));
}

#[test]
fn call_metamethod_makes_tables_callable() {
    let mut vm = new_vm();
    fn call_mm(vm: &mut LuaVM) -> LuaResult<i32> {
        // Receives the table itself plus the argument.
        let arg = vm.check_integer(2)?;
        vm.push_integer(arg * 2)?;
        Ok(1)
    }
    let t = vm.create_table(0, 0).unwrap();
    let mt = vm.create_table(0, 1).unwrap();
    let k = vm.create_string("__call").unwrap();
    vm.raw_set_checked(
        mt.as_table_id().unwrap(),
        &k,
        LuaValue::NativeFunction(call_mm),
    )
    .unwrap();
    vm.set_metatable_of(&t, mt.as_table_id()).unwrap();

    let r = vm.call_values(t, &[LuaValue::Integer(21)], 1).unwrap();
    assert_eq!(r[0], LuaValue::Integer(42));
}

#[test]
fn custom_call_depth_limit_is_honored() {
    let mut vm = LuaVM::new(SafeOption {
        max_call_depth: 30,
        ..SafeOption::default()
    });
    let f = build_countdown(&mut vm, false);
    vm.push_lua_value(f).unwrap();
    vm.push_integer(100).unwrap();
    let status = vm.pcall(1, 1).unwrap();
    assert_eq!(status, ThreadStatus::ErrRun);
}
