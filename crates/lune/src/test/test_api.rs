use crate::lua_value::{LuaValue, LuaValueKind};
use crate::lua_vm::{LuaResult, LuaVM, REGISTRY_INDEX, upvalue_index};
use crate::test::new_vm;

#[test]
fn push_and_index_round_trip() {
    let mut vm = new_vm();
    vm.push_integer(1).unwrap();
    vm.push_string("two").unwrap();
    vm.push_boolean(true).unwrap();
    assert_eq!(vm.get_top(), 3);

    // Positive and negative addressing agree.
    assert_eq!(vm.to_integer(1), Some(1));
    assert_eq!(vm.to_str(2), Some("two"));
    assert!(vm.to_boolean(3));
    assert_eq!(vm.to_integer(-3), Some(1));
    assert_eq!(vm.to_str(-2), Some("two"));
    assert!(vm.to_boolean(-1));

    vm.pop(3);
    assert_eq!(vm.get_top(), 0);
}

#[test]
fn set_top_pads_and_truncates() {
    let mut vm = new_vm();
    vm.push_integer(1).unwrap();
    vm.set_top(3).unwrap();
    assert_eq!(vm.get_top(), 3);
    assert!(vm.is_nil(2));
    assert!(vm.is_nil(3));
    vm.set_top(1).unwrap();
    assert_eq!(vm.get_top(), 1);
    assert_eq!(vm.to_integer(1), Some(1));
    vm.pop(1);
}

#[test]
fn insert_remove_rotate() {
    let mut vm = new_vm();
    for i in 1..=4 {
        vm.push_integer(i).unwrap();
    }
    // [1 2 3 4] -- insert top at index 2 -> [1 4 2 3]
    vm.insert(2).unwrap();
    let collect = |vm: &LuaVM| -> Vec<i64> {
        (1..=vm.get_top() as i32)
            .map(|i| vm.value_at(i).as_integer().unwrap())
            .collect()
    };
    assert_eq!(collect(&vm), vec![1, 4, 2, 3]);

    // remove index 2 -> [1 2 3]
    vm.remove(2).unwrap();
    assert_eq!(collect(&vm), vec![1, 2, 3]);

    // rotate the whole window by 1 -> [3 1 2]
    vm.rotate(1, 1).unwrap();
    assert_eq!(collect(&vm), vec![3, 1, 2]);
    vm.pop(3);
}

#[test]
fn replace_and_copy() {
    let mut vm = new_vm();
    vm.push_integer(10).unwrap();
    vm.push_integer(20).unwrap();
    vm.push_integer(30).unwrap();
    // replace writes the popped top over index 1.
    vm.replace(1).unwrap();
    assert_eq!(vm.to_integer(1), Some(30));
    assert_eq!(vm.get_top(), 2);
    vm.copy_value(2, 1).unwrap();
    assert_eq!(vm.to_integer(1), Some(20));
    vm.pop(2);
}

#[test]
fn registry_pseudo_index_reaches_the_registry() {
    let mut vm = new_vm();
    let v = vm.value_at(REGISTRY_INDEX);
    assert_eq!(v.as_table_id(), Some(vm.registry_id()));
    assert_eq!(vm.type_of(REGISTRY_INDEX), LuaValueKind::Table);
}

#[test]
fn native_closure_upvalues_via_pseudo_indices() {
    let mut vm = new_vm();

    fn counter(vm: &mut LuaVM) -> LuaResult<i32> {
        let n = vm.value_at(upvalue_index(1)).as_integer().unwrap_or(0);
        vm.set_value_at(upvalue_index(1), LuaValue::Integer(n + 1))?;
        vm.push_integer(n + 1)?;
        Ok(1)
    }

    vm.push_integer(0).unwrap();
    vm.push_native_closure(counter, 1).unwrap();
    let f = vm.value_at(-1);
    vm.pop(1);

    for expect in 1..=3 {
        let r = vm.call_values(f, &[], 1).unwrap();
        assert_eq!(r[0], LuaValue::Integer(expect));
    }
}

#[test]
fn check_and_opt_argument_helpers() {
    let mut vm = new_vm();

    fn adder(vm: &mut LuaVM) -> LuaResult<i32> {
        let a = vm.check_integer(1)?;
        let b = vm.opt_integer(2, 10)?;
        vm.push_integer(a + b)?;
        Ok(1)
    }
    vm.register("adder", adder).unwrap();
    let f = vm.get_global("adder").unwrap();

    let r = vm
        .call_values(f, &[LuaValue::Integer(1), LuaValue::Integer(2)], 1)
        .unwrap();
    assert_eq!(r[0], LuaValue::Integer(3));

    // Missing optional argument takes the default.
    let r = vm.call_values(f, &[LuaValue::Integer(1)], 1).unwrap();
    assert_eq!(r[0], LuaValue::Integer(11));

    // Wrong mandatory argument raises an argument error.
    let r = vm.call_values(f, &[LuaValue::Boolean(true)], 1);
    assert!(r.is_err());
    assert!(vm.error_message().contains("bad argument #1"));
}

#[test]
fn to_coercions_follow_the_rules() {
    let mut vm = new_vm();
    vm.push_string("42").unwrap();
    assert_eq!(vm.to_integer(-1), Some(42));
    assert_eq!(vm.to_number(-1), Some(42.0));
    vm.pop(1);

    vm.push_integer(7).unwrap();
    assert_eq!(vm.to_string_coerce(-1), Some("7".to_string()));
    // No in-place mutation: the slot is still a number.
    assert!(vm.is_number(-1));
    vm.pop(1);

    vm.push_number(2.5).unwrap();
    assert_eq!(vm.to_integer(-1), None);
    vm.pop(1);
}

#[test]
fn table_field_helpers() {
    let mut vm = new_vm();
    vm.new_table(0, 4).unwrap();
    vm.push_integer(99).unwrap();
    vm.set_field(1, "answer").unwrap();
    vm.get_field(1, "answer").unwrap();
    assert_eq!(vm.to_integer(-1), Some(99));
    vm.pop(1);

    vm.push_integer(123).unwrap();
    vm.raw_seti(1, 5).unwrap();
    vm.raw_geti(1, 5).unwrap();
    assert_eq!(vm.to_integer(-1), Some(123));
    vm.pop(2);
}

#[test]
fn global_registration() {
    let mut vm = new_vm();
    fn fortytwo(vm: &mut LuaVM) -> LuaResult<i32> {
        vm.push_integer(42)?;
        Ok(1)
    }
    vm.register("fortytwo", fortytwo).unwrap();
    let f = vm.get_global("fortytwo").unwrap();
    assert!(f.is_function());
    let r = vm.call_values(f, &[], 1).unwrap();
    assert_eq!(r[0], LuaValue::Integer(42));
}

#[test]
fn refs_reuse_released_ids() {
    let mut vm = new_vm();
    let a = vm.create_string("a").unwrap();
    let b = vm.create_string("b").unwrap();

    let r1 = vm.create_ref(a).unwrap();
    vm.release_ref(r1).unwrap();
    let r2 = vm.create_ref(b).unwrap();
    // Freed id comes back off the free list.
    assert_eq!(r1, r2);
    assert_eq!(vm.string_content(&vm.get_ref(r2)), Some("b"));

    // The nil reference needs no storage.
    let rn = vm.create_ref(LuaValue::Nil).unwrap();
    assert_eq!(rn, crate::lua_vm::REF_NIL);
    assert!(vm.get_ref(rn).is_nil());
}

#[test]
fn check_stack_reserves_room() {
    let mut vm = new_vm();
    vm.check_stack(100).unwrap();
    for i in 0..100 {
        vm.push_integer(i).unwrap();
    }
    assert_eq!(vm.get_top(), 100);
    vm.pop(100);
}

#[test]
fn metatable_stack_accessors() {
    let mut vm = new_vm();
    vm.new_table(0, 0).unwrap();
    assert!(!vm.get_metatable(1).unwrap());

    vm.new_table(0, 0).unwrap();
    vm.set_metatable(1).unwrap();
    assert!(vm.get_metatable(1).unwrap());
    assert_eq!(vm.type_of(-1), LuaValueKind::Table);
    vm.pop(2);
}
