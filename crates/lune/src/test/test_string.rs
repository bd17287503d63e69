use crate::lua_vm::LuaBuffer;
use crate::test::new_vm;

#[test]
fn short_strings_are_interned() {
    let mut vm = new_vm();
    let a = vm.create_string("hello").unwrap();
    let b = vm.create_string("hello").unwrap();
    // Same bytes, same object: identity equality.
    assert_eq!(a.as_string_id(), b.as_string_id());
    assert!(a.raw_equal(&b));

    let c = vm.create_string("world").unwrap();
    assert_ne!(a.as_string_id(), c.as_string_id());
}

#[test]
fn long_strings_compare_by_content_not_identity() {
    let mut vm = new_vm();
    let long = "x".repeat(100);
    let a = vm.create_string(&long).unwrap();
    let b = vm.create_string(&long).unwrap();
    // Not interned: distinct objects...
    assert_ne!(a.as_string_id(), b.as_string_id());
    // ...but the content is the same.
    assert_eq!(vm.string_content(&a), vm.string_content(&b));
}

#[test]
fn interned_strings_survive_collection_while_referenced() {
    let mut vm = new_vm();
    let s = vm.create_string("keepme").unwrap();
    let r = vm.create_ref(s).unwrap();
    vm.gc_collect();
    vm.gc_collect();
    let back = vm.get_ref(r);
    assert_eq!(vm.string_content(&back), Some("keepme"));
    vm.release_ref(r).unwrap();
}

#[test]
fn dead_strings_leave_the_intern_table() {
    let mut vm = new_vm();
    let s = vm.create_string("ephemeral-string").unwrap();
    let id = s.as_string_id().unwrap();
    // No reference anywhere: two full cycles reclaim it.
    vm.gc_collect();
    vm.gc_collect();
    assert!(vm.gc.pool.get_string(id).is_none());
    // Re-creating the content works and yields a fresh object.
    let s2 = vm.create_string("ephemeral-string").unwrap();
    assert_eq!(vm.string_content(&s2), Some("ephemeral-string"));
}

#[test]
fn buffer_stays_inline_below_threshold() {
    let mut b = LuaBuffer::new();
    b.push_str("short");
    assert!(!b.is_heap());
    assert_eq!(b.len(), 5);
}

#[test]
fn buffer_upgrades_to_heap_past_threshold() {
    let mut vm = new_vm();
    let mut b = LuaBuffer::new();
    for i in 0..100 {
        b.push_str(&format!("{i},"));
    }
    assert!(b.is_heap());
    let v = b.finish(&mut vm).unwrap();
    let s = vm.string_content(&v).unwrap();
    assert!(s.starts_with("0,1,2,"));
    assert!(s.ends_with("99,"));
}

#[test]
fn buffer_appends_bytes_and_stack_values() {
    let mut vm = new_vm();
    let mut b = LuaBuffer::new();
    b.push_str("n=");
    vm.push_integer(42).unwrap();
    b.push_value_from_stack(&mut vm, -1).unwrap();
    b.push_byte(b'!');
    let v = b.finish(&mut vm).unwrap();
    assert_eq!(vm.string_content(&v), Some("n=42!"));
    assert_eq!(vm.get_top(), 0);
}
