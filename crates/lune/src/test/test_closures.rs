use crate::lua_value::LuaValue;
use crate::lua_vm::{Instruction, ProtoBuilder, UpvalDesc};
use crate::test::new_vm;

/// function() local x = 1; return (setter), (getter) end
/// where setter(v) writes x and getter() reads it - both capture the
/// same local.
fn build_make_pair(vm: &mut crate::lua_vm::LuaVM) -> LuaValue {
    let mut setter = ProtoBuilder::new("setter").params(1).max_stack(2);
    setter.upvalue(UpvalDesc {
        in_stack: true,
        index: 0,
    });
    setter.emit(Instruction::SetUpval { n: 0, src: 0 });
    setter.emit(Instruction::Return { first: 0, count: 0 });
    let setter = setter.build();

    let mut getter = ProtoBuilder::new("getter").max_stack(2);
    getter.upvalue(UpvalDesc {
        in_stack: true,
        index: 0,
    });
    getter.emit(Instruction::GetUpval { dst: 0, n: 0 });
    getter.emit(Instruction::Return { first: 0, count: 1 });
    let getter = getter.build();

    let mut outer = ProtoBuilder::new("outer").max_stack(4);
    let p_set = outer.child(setter);
    let p_get = outer.child(getter);
    outer.emit(Instruction::LoadInt { dst: 0, value: 1 });
    outer.emit(Instruction::Closure { dst: 1, proto: p_set });
    outer.emit(Instruction::Closure { dst: 2, proto: p_get });
    outer.emit(Instruction::Return { first: 1, count: 2 });
    let outer = outer.build();

    vm.instantiate_root(outer).unwrap()
}

#[test]
fn sibling_closures_share_one_upvalue() {
    let mut vm = new_vm();
    let outer = build_make_pair(&mut vm);

    vm.push_lua_value(outer).unwrap();
    vm.call(0, 2).unwrap();
    let getter = vm.value_at(-1);
    let setter = vm.value_at(-2);
    vm.pop(2);

    // Initial value observed through the shared cell.
    let r = vm.call_values(getter, &[], 1).unwrap();
    assert_eq!(r[0], LuaValue::Integer(1));

    // A write through one closure is visible through the other.
    vm.call_values(setter, &[LuaValue::Integer(2)], 0).unwrap();
    let r = vm.call_values(getter, &[], 1).unwrap();
    assert_eq!(r[0], LuaValue::Integer(2));
}

#[test]
fn separate_activations_capture_separate_cells() {
    let mut vm = new_vm();
    let outer = build_make_pair(&mut vm);

    vm.push_lua_value(outer).unwrap();
    vm.call(0, 2).unwrap();
    let getter1 = vm.value_at(-1);
    let setter1 = vm.value_at(-2);
    vm.pop(2);

    vm.push_lua_value(outer).unwrap();
    vm.call(0, 2).unwrap();
    let getter2 = vm.value_at(-1);
    vm.pop(2);

    vm.call_values(setter1, &[LuaValue::Integer(99)], 0).unwrap();
    let r1 = vm.call_values(getter1, &[], 1).unwrap();
    let r2 = vm.call_values(getter2, &[], 1).unwrap();
    assert_eq!(r1[0], LuaValue::Integer(99));
    // The other activation's cell is untouched.
    assert_eq!(r2[0], LuaValue::Integer(1));
}

#[test]
fn upvalue_join_aliases_cells() {
    let mut vm = new_vm();
    let outer = build_make_pair(&mut vm);

    vm.push_lua_value(outer).unwrap();
    vm.call(0, 2).unwrap();
    let getter1 = vm.value_at(-1);
    vm.pop(2);

    vm.push_lua_value(outer).unwrap();
    vm.call(0, 2).unwrap();
    let getter2 = vm.value_at(-1);
    let setter2 = vm.value_at(-2);
    vm.pop(2);

    // Alias getter1's cell onto getter2's: it now sees activation 2.
    vm.upvalue_join(getter1, 0, getter2, 0).unwrap();
    vm.call_values(setter2, &[LuaValue::Integer(7)], 0).unwrap();
    let r = vm.call_values(getter1, &[], 1).unwrap();
    assert_eq!(r[0], LuaValue::Integer(7));
}

#[test]
fn nested_closure_captures_outer_upvalue() {
    let mut vm = new_vm();

    // innermost: return upvalue[0] (shared from the middle closure's
    // upvalue list, not the stack).
    let mut inner = ProtoBuilder::new("inner").max_stack(2);
    inner.upvalue(UpvalDesc {
        in_stack: false,
        index: 0,
    });
    inner.emit(Instruction::GetUpval { dst: 0, n: 0 });
    inner.emit(Instruction::Return { first: 0, count: 1 });
    let inner = inner.build();

    // middle: captures outer local x, returns the inner closure.
    let mut middle = ProtoBuilder::new("middle").max_stack(2);
    middle.upvalue(UpvalDesc {
        in_stack: true,
        index: 0,
    });
    let p_inner = middle.child(inner);
    middle.emit(Instruction::Closure { dst: 0, proto: p_inner });
    middle.emit(Instruction::Return { first: 0, count: 1 });
    let middle = middle.build();

    // outer: local x = 31, build middle, call it, return its result.
    let mut outer = ProtoBuilder::new("outer").max_stack(4);
    let p_middle = outer.child(middle);
    outer.emit(Instruction::LoadInt { dst: 0, value: 31 });
    outer.emit(Instruction::Closure { dst: 1, proto: p_middle });
    outer.emit(Instruction::Call {
        func: 1,
        nargs: 0,
        nresults: 1,
    });
    outer.emit(Instruction::Return { first: 1, count: 1 });
    let outer = outer.build();

    let outer = vm.instantiate_root(outer).unwrap();
    let r = vm.call_values(outer, &[], 1).unwrap();
    // r[0] is the inner closure; calling it reads x through two capture
    // levels.
    let v = vm.call_values(r[0], &[], 1).unwrap();
    assert_eq!(v[0], LuaValue::Integer(31));
}

#[test]
fn to_be_closed_marks_require_close_metamethod() {
    let mut vm = new_vm();
    vm.push_integer(5).unwrap();
    // Plain integers are not closable.
    let abs = vm.ctx.top - 1;
    assert!(vm.mark_to_be_closed(abs).is_err());
}
