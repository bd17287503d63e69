use crate::lua_value::{LuaTable, LuaValue};

#[test]
fn set_get_roundtrip() {
    let mut t = LuaTable::new(0, 0);
    t.raw_seti(1, LuaValue::Integer(10));
    t.raw_seti(2, LuaValue::Integer(20));
    t.raw_set(&LuaValue::Boolean(true), LuaValue::Integer(30));
    assert_eq!(t.raw_geti(1), LuaValue::Integer(10));
    assert_eq!(t.raw_geti(2), LuaValue::Integer(20));
    assert_eq!(t.raw_get(&LuaValue::Boolean(true)), LuaValue::Integer(30));
    assert_eq!(t.raw_geti(3), LuaValue::Nil);
}

#[test]
fn setting_nil_removes() {
    let mut t = LuaTable::new(0, 0);
    t.raw_seti(1, LuaValue::Integer(10));
    t.raw_seti(1, LuaValue::Nil);
    assert_eq!(t.raw_geti(1), LuaValue::Nil);
}

#[test]
fn integral_float_keys_alias_integer_keys() {
    let mut t = LuaTable::new(0, 0);
    t.raw_set(&LuaValue::Float(1.0), LuaValue::Integer(99));
    assert_eq!(t.raw_geti(1), LuaValue::Integer(99));
    t.raw_seti(1, LuaValue::Integer(100));
    assert_eq!(t.raw_get(&LuaValue::Float(1.0)), LuaValue::Integer(100));
}

#[test]
fn length_is_exact_without_holes() {
    let mut t = LuaTable::new(0, 0);
    for i in 1..=40 {
        t.raw_seti(i, LuaValue::Integer(i));
    }
    assert_eq!(t.length(), 40);
    assert_eq!(LuaTable::new(0, 0).length(), 0);
}

#[test]
fn length_is_a_border_with_holes() {
    let mut t = LuaTable::new(0, 0);
    for i in 1..=10 {
        t.raw_seti(i, LuaValue::Integer(i));
    }
    t.raw_seti(4, LuaValue::Nil);
    t.raw_seti(9, LuaValue::Nil);
    // Any border is acceptable: t[n] ~= nil and t[n+1] == nil.
    let n = t.length();
    assert!(n >= 0);
    if n > 0 {
        assert!(!t.raw_geti(n).is_nil(), "t[{n}] must be non-nil");
    }
    assert!(t.raw_geti(n + 1).is_nil(), "t[{}] must be nil", n + 1);
}

#[test]
fn dense_append_migrates_from_hash() {
    let mut t = LuaTable::new(0, 0);
    // 2 and 3 land in the hash part (not dense yet).
    t.raw_seti(3, LuaValue::Integer(3));
    t.raw_seti(2, LuaValue::Integer(2));
    assert_eq!(t.length(), 0);
    // Appending 1 makes the whole run dense.
    t.raw_seti(1, LuaValue::Integer(1));
    assert_eq!(t.length(), 3);
    for i in 1..=3 {
        assert_eq!(t.raw_geti(i), LuaValue::Integer(i));
    }
}

#[test]
fn next_visits_every_key_once() {
    let mut t = LuaTable::new(0, 0);
    for i in 1..=5 {
        t.raw_seti(i, LuaValue::Integer(i * 10));
    }
    t.raw_set(&LuaValue::Boolean(true), LuaValue::Integer(60));
    t.raw_set(&LuaValue::Boolean(false), LuaValue::Integer(70));

    let mut seen = 0;
    let mut key = LuaValue::Nil;
    while let Some((k, v)) = t.next(&key).expect("valid key") {
        assert!(!v.is_nil());
        seen += 1;
        key = k;
    }
    assert_eq!(seen, 7);
}

#[test]
fn next_tolerates_removing_the_current_key() {
    let mut t = LuaTable::new(0, 0);
    for i in 1..=6 {
        t.raw_seti(i, LuaValue::Integer(i));
    }
    t.raw_set(&LuaValue::Boolean(true), LuaValue::Integer(7));

    let mut seen = 0;
    let mut key = LuaValue::Nil;
    while let Some((k, _)) = t.next(&key).expect("valid key") {
        seen += 1;
        // Deleting the key we are standing on is sanctioned.
        t.raw_set(&k, LuaValue::Nil);
        key = k;
    }
    assert_eq!(seen, 7);
    assert_eq!(t.pair_count(), 0);
}

#[test]
fn next_on_unknown_key_is_an_error() {
    let mut t = LuaTable::new(0, 0);
    t.raw_seti(1, LuaValue::Integer(1));
    assert!(t.next(&LuaValue::Boolean(true)).is_err());
}

#[test]
fn resize_preserves_contents() {
    let mut t = LuaTable::new(0, 0);
    t.raw_seti(1, LuaValue::Integer(1));
    t.resize(64, 64);
    assert_eq!(t.raw_geti(1), LuaValue::Integer(1));
    assert_eq!(t.length(), 1);
}
