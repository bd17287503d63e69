use crate::gc::GcState;
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaResult, LuaVM};
use crate::test::new_vm;

fn bump_fin_count(vm: &mut LuaVM) -> LuaResult<i32> {
    let n = vm.get_global("fin_count")?.as_integer().unwrap_or(0);
    vm.set_global("fin_count", LuaValue::Integer(n + 1))?;
    Ok(0)
}

/// Table with a __gc finalizer that bumps the global counter.
fn make_finalizable(vm: &mut LuaVM) -> LuaValue {
    let mt = vm.create_table(0, 1).unwrap();
    let k = vm.create_string("__gc").unwrap();
    vm.raw_set_checked(
        mt.as_table_id().unwrap(),
        &k,
        LuaValue::NativeFunction(bump_fin_count),
    )
    .unwrap();
    let t = vm.create_table(0, 0).unwrap();
    vm.set_metatable_of(&t, mt.as_table_id()).unwrap();
    t
}

#[test]
fn reachable_objects_survive_collection() {
    let mut vm = new_vm();
    // A chain: registry -> a -> b -> c.
    let a = vm.create_table(0, 1).unwrap();
    let b = vm.create_table(0, 1).unwrap();
    let c = vm.create_table(0, 1).unwrap();
    let k = vm.create_string("next").unwrap();
    vm.raw_set_checked(a.as_table_id().unwrap(), &k, b).unwrap();
    vm.raw_set_checked(b.as_table_id().unwrap(), &k, c).unwrap();
    let r = vm.create_ref(a).unwrap();

    vm.gc_collect();
    vm.gc_collect();

    let a2 = vm.get_ref(r);
    let b2 = vm.raw_get(&a2, &k);
    let c2 = vm.raw_get(&b2, &k);
    assert!(c2.is_table());
    assert_eq!(c2.as_table_id(), c.as_table_id());
    vm.release_ref(r).unwrap();
}

#[test]
fn unreachable_objects_are_collected_and_finalized_once() {
    let mut vm = new_vm();
    vm.set_global("fin_count", LuaValue::Integer(0)).unwrap();

    let t = make_finalizable(&mut vm);
    let holder = vm.create_table(0, 1).unwrap();
    let k = vm.create_string("slot").unwrap();
    vm.raw_set_checked(holder.as_table_id().unwrap(), &k, t)
        .unwrap();
    let r = vm.create_ref(holder).unwrap();
    let tid = t.as_table_id().unwrap();

    // Reachable through holder: survives.
    vm.gc_collect();
    assert!(vm.gc.pool.get_table(tid).is_some());
    assert_eq!(vm.get_global("fin_count").unwrap(), LuaValue::Integer(0));

    // Drop the only reference; the finalizer runs on the next cycle.
    vm.raw_set_checked(holder.as_table_id().unwrap(), &k, LuaValue::Nil)
        .unwrap();
    vm.gc_collect();
    assert_eq!(vm.get_global("fin_count").unwrap(), LuaValue::Integer(1));

    // Resurrected for the finalizer, freed for real afterwards - and the
    // finalizer never runs again.
    vm.gc_collect();
    vm.gc_collect();
    assert_eq!(vm.get_global("fin_count").unwrap(), LuaValue::Integer(1));
    assert!(vm.gc.pool.get_table(tid).is_none());
    vm.release_ref(r).unwrap();
}

#[test]
fn write_barrier_preserves_stores_into_black_tables() {
    let mut vm = new_vm();
    vm.gc_incremental();
    let k = vm.create_string("child").unwrap();

    for trial in 0..50 {
        let parent = vm.create_table(0, 4).unwrap();
        let r = vm.create_ref(parent).unwrap();

        // Walk the collector until the parent has been scanned (black or
        // past the mark phase entirely).
        for _ in 0..1000 {
            vm.gc_step();
            let done = {
                let obj = vm.gc.pool.get(parent.as_table_id().unwrap().0).unwrap();
                obj.header.is_black() || vm.gc.state == GcState::Pause
            };
            if done {
                break;
            }
        }

        // Store a brand-new white object into the (possibly black)
        // parent; the back barrier must re-gray the parent.
        let child = vm.create_table(0, 0).unwrap();
        let child_id = child.as_table_id().unwrap();
        vm.raw_set_checked(parent.as_table_id().unwrap(), &k, child)
            .unwrap();

        // Drive the in-flight cycle to completion with incremental steps
        // only: without the barrier, the atomic phase would never rescan
        // the black parent and the sweep would free the child.
        for _ in 0..10_000 {
            vm.gc_step();
            if vm.gc.state == GcState::Pause {
                break;
            }
        }
        assert_eq!(vm.gc.state, GcState::Pause, "cycle failed to finish");

        assert!(
            vm.gc.pool.get_table(child_id).is_some(),
            "stored child was swept in trial {trial}"
        );
        let back = vm.raw_get(&parent, &k);
        assert_eq!(back.as_table_id(), Some(child_id));
        vm.release_ref(r).unwrap();
    }
}

#[test]
fn weak_value_entries_are_cleared() {
    let mut vm = new_vm();
    let cache = vm.create_table(0, 4).unwrap();
    let mt = vm.create_table(0, 1).unwrap();
    let k_mode = vm.create_string("__mode").unwrap();
    let v_mode = vm.create_string("v").unwrap();
    vm.raw_set_checked(mt.as_table_id().unwrap(), &k_mode, v_mode)
        .unwrap();
    vm.set_metatable_of(&cache, mt.as_table_id()).unwrap();
    let r = vm.create_ref(cache).unwrap();

    let k = vm.create_string("entry").unwrap();
    let dead = vm.create_table(0, 0).unwrap();
    vm.raw_set_checked(cache.as_table_id().unwrap(), &k, dead)
        .unwrap();

    let keep = vm.create_table(0, 0).unwrap();
    let k2 = vm.create_string("kept").unwrap();
    vm.raw_set_checked(cache.as_table_id().unwrap(), &k2, keep)
        .unwrap();
    let keep_ref = vm.create_ref(keep).unwrap();

    vm.gc_collect();

    // The weakly held value vanished; the strongly held one stayed.
    assert!(vm.raw_get(&cache, &k).is_nil());
    assert!(vm.raw_get(&cache, &k2).is_table());
    vm.release_ref(r).unwrap();
    vm.release_ref(keep_ref).unwrap();
}

#[test]
fn ephemeron_values_follow_key_reachability() {
    let mut vm = new_vm();
    let t = vm.create_table(0, 4).unwrap();
    let mt = vm.create_table(0, 1).unwrap();
    let k_mode = vm.create_string("__mode").unwrap();
    let v_mode = vm.create_string("k").unwrap();
    vm.raw_set_checked(mt.as_table_id().unwrap(), &k_mode, v_mode)
        .unwrap();
    vm.set_metatable_of(&t, mt.as_table_id()).unwrap();
    let r = vm.create_ref(t).unwrap();

    // Key kept alive elsewhere: entry survives.
    let live_key = vm.create_table(0, 0).unwrap();
    let live_ref = vm.create_ref(live_key).unwrap();
    let v1 = vm.create_table(0, 0).unwrap();
    vm.raw_set_checked(t.as_table_id().unwrap(), &live_key, v1)
        .unwrap();

    // Key reachable only through the weak table: entry goes.
    let dead_key = vm.create_table(0, 0).unwrap();
    let v2 = vm.create_table(0, 0).unwrap();
    vm.raw_set_checked(t.as_table_id().unwrap(), &dead_key, v2)
        .unwrap();

    vm.gc_collect();

    assert!(vm.raw_get(&t, &live_key).is_table());
    assert!(vm.raw_get(&t, &dead_key).is_nil());
    vm.release_ref(r).unwrap();
    vm.release_ref(live_ref).unwrap();
}

#[test]
fn generational_mode_collects_young_garbage() {
    let mut vm = new_vm();
    vm.gc_generational();

    let keep = vm.create_table(0, 0).unwrap();
    let r = vm.create_ref(keep).unwrap();
    let keep_id = keep.as_table_id().unwrap();

    let before = vm.gc.stats.minor_collections;
    for _ in 0..200 {
        // Unreferenced young garbage.
        let _ = vm.create_table(0, 0).unwrap();
        vm.gc_step();
    }
    assert!(vm.gc.stats.minor_collections > before);
    // The referenced object was promoted, not collected.
    assert!(vm.gc.pool.get_table(keep_id).is_some());
    vm.release_ref(r).unwrap();
}

#[test]
fn stopped_collector_does_not_step() {
    let mut vm = new_vm();
    vm.gc_stop();
    assert!(!vm.gc_is_running());
    let before = vm.gc.stats.steps;
    for _ in 0..100 {
        let _ = vm.create_table(0, 0).unwrap();
    }
    assert_eq!(vm.gc.stats.steps, before);
    vm.gc_restart();
    assert!(vm.gc_is_running());
}

#[test]
fn byte_count_tracks_allocation_and_release() {
    let mut vm = new_vm();
    let before = vm.gc_count_bytes();
    let mut refs = Vec::new();
    for _ in 0..50 {
        let t = vm.create_table(8, 8).unwrap();
        refs.push(vm.create_ref(t).unwrap());
    }
    let with_tables = vm.gc_count_bytes();
    assert!(with_tables > before);
    for r in refs {
        vm.release_ref(r).unwrap();
    }
    vm.gc_collect();
    assert!(vm.gc_count_bytes() < with_tables);
}

#[test]
fn finalizer_errors_go_to_the_warning_sink() {
    use std::cell::RefCell;
    use std::rc::Rc;

    let mut vm = new_vm();
    let warnings: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = warnings.clone();
    vm.set_warn_fn(Box::new(move |msg| sink.borrow_mut().push(msg.to_string())));

    fn bad_finalizer(vm: &mut LuaVM) -> LuaResult<i32> {
        Err(vm.rt_error("finalizer exploded"))
    }
    let mt = vm.create_table(0, 1).unwrap();
    let k = vm.create_string("__gc").unwrap();
    vm.raw_set_checked(
        mt.as_table_id().unwrap(),
        &k,
        LuaValue::NativeFunction(bad_finalizer),
    )
    .unwrap();
    let t = vm.create_table(0, 0).unwrap();
    vm.set_metatable_of(&t, mt.as_table_id()).unwrap();
    drop(t);

    vm.gc_collect();
    let w = warnings.borrow();
    assert!(
        w.iter().any(|m| m.contains("finalizer exploded")),
        "warnings: {w:?}"
    );
}
