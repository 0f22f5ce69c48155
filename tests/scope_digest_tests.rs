//! Digest scheduler, watch-group/collection, and scope-tree invariants
//! (spec §4.6-§4.9, §8).

use reactive_core::scope::Scope;
use reactive_core::value::Value;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

// ============================================
// $watchGroup (spec §4.9)
// ============================================

#[test]
fn watch_group_first_firing_carries_the_same_sequence_in_both_slots() {
    let root = Scope::new_root();
    root.properties().borrow_mut().insert("a", Value::Number(1.0));
    root.properties().borrow_mut().insert("b", Value::Number(2.0));

    let seen: Rc<RefCell<Option<(Value, Value)>>> = Rc::new(RefCell::new(None));
    let seen_clone = seen.clone();
    let _d = root
        .watch_group(
            &["a", "b"],
            Rc::new(move |new, old, _scope| {
                *seen_clone.borrow_mut() = Some((new.clone(), old.clone()));
                Ok(())
            }),
        )
        .unwrap();

    root.digest().unwrap();
    let (new, old) = seen.borrow().clone().unwrap();
    assert!(new.reference_eq(&old));
}

#[test]
fn watch_group_later_firings_carry_distinct_sequences() {
    let root = Scope::new_root();
    root.properties().borrow_mut().insert("a", Value::Number(1.0));
    root.properties().borrow_mut().insert("b", Value::Number(2.0));

    let fire_count = Rc::new(Cell::new(0u32));
    let last_pair: Rc<RefCell<Option<(Value, Value)>>> = Rc::new(RefCell::new(None));
    let fire_count_clone = fire_count.clone();
    let last_pair_clone = last_pair.clone();
    let _d = root
        .watch_group(
            &["a", "b"],
            Rc::new(move |new, old, _scope| {
                fire_count_clone.set(fire_count_clone.get() + 1);
                *last_pair_clone.borrow_mut() = Some((new.clone(), old.clone()));
                Ok(())
            }),
        )
        .unwrap();

    root.digest().unwrap();
    root.properties().borrow_mut().insert("a", Value::Number(99.0));
    root.digest().unwrap();

    assert_eq!(fire_count.get(), 2);
    let (new, old) = last_pair.borrow().clone().unwrap();
    assert!(!new.reference_eq(&old));
}

#[test]
fn watch_group_with_no_expressions_fires_once_with_an_empty_array() {
    let root = Scope::new_root();
    let fire_count = Rc::new(Cell::new(0u32));
    let fire_count_clone = fire_count.clone();
    let _d = root
        .watch_group(
            &[],
            Rc::new(move |new, _old, _scope| {
                fire_count_clone.set(fire_count_clone.get() + 1);
                assert!(matches!(new, Value::Array(_)));
                Ok(())
            }),
        )
        .unwrap();
    root.digest().unwrap();
    root.digest().unwrap();
    assert_eq!(fire_count.get(), 1);
}

// ============================================
// $watchCollection (spec §4.8)
// ============================================

#[test]
fn watch_collection_fires_on_length_change_but_not_on_reassignment_of_equal_contents() {
    let root = Scope::new_root();
    root.properties().borrow_mut().insert("items", Value::array(vec![Value::Number(1.0)]));

    let fire_count = Rc::new(Cell::new(0u32));
    let fire_count_clone = fire_count.clone();
    let _d = root
        .watch_collection(
            "items",
            Rc::new(move |_new, _old, _scope| {
                fire_count_clone.set(fire_count_clone.get() + 1);
                Ok(())
            }),
        )
        .unwrap();

    root.digest().unwrap();
    assert_eq!(fire_count.get(), 1);

    root.digest().unwrap();
    assert_eq!(fire_count.get(), 1, "no structural change, no refire");

    if let Value::Array(items) = root.properties().borrow().get("items").unwrap() {
        items.borrow_mut().push(Value::Number(2.0));
    }
    root.digest().unwrap();
    assert_eq!(fire_count.get(), 2);
}

// ============================================
// Mutually-recursive watchers settle within TTL (spec §8 round-trip law)
// ============================================

#[test]
fn bounded_mutual_recursion_settles_for_every_cap_under_the_ttl() {
    for cap in 1..=7 {
        let root = Scope::new_root();
        root.properties().borrow_mut().insert("counterA", Value::Number(0.0));
        root.properties().borrow_mut().insert("counterB", Value::Number(0.0));

        let a_scope = root.clone();
        let _watch_a = root
            .watch(
                "counterA",
                Some(Rc::new(move |new, _old, _scope| {
                    let props = a_scope.properties();
                    let b = props.borrow().get("counterB").and_then(Value::as_number).unwrap_or(0.0);
                    if new.as_number().unwrap_or(0.0) < cap as f64 && b < cap as f64 {
                        props.borrow_mut().insert("counterB", Value::Number(b + 1.0));
                    }
                    Ok(())
                })),
                false,
            )
            .unwrap();

        let b_scope = root.clone();
        let _watch_b = root
            .watch(
                "counterB",
                Some(Rc::new(move |new, _old, _scope| {
                    let props = b_scope.properties();
                    let a = props.borrow().get("counterA").and_then(Value::as_number).unwrap_or(0.0);
                    if new.as_number().unwrap_or(0.0) < cap as f64 && a < cap as f64 {
                        props.borrow_mut().insert("counterA", Value::Number(a + 1.0));
                    }
                    Ok(())
                })),
                false,
            )
            .unwrap();

        assert!(root.digest().is_ok(), "cap={cap} should settle within the default TTL");
    }
}

// ============================================
// Watcher removal during digest (spec §8 boundary behaviour)
// ============================================

#[test]
fn removing_a_watcher_from_inside_another_does_not_skip_the_next_one() {
    let root = Scope::new_root();
    root.properties().borrow_mut().insert("a", Value::Number(1.0));
    root.properties().borrow_mut().insert("b", Value::Number(1.0));
    root.properties().borrow_mut().insert("c", Value::Number(1.0));

    let b_fired = Rc::new(Cell::new(false));
    let c_fired = Rc::new(Cell::new(false));

    let b_destructor: Rc<RefCell<Option<reactive_core::scope::Destructor>>> = Rc::new(RefCell::new(None));
    let b_destructor_for_a = b_destructor.clone();

    let _watch_a = root
        .watch(
            "a",
            Some(Rc::new(move |_n, _o, _s| {
                if let Some(d) = b_destructor_for_a.borrow_mut().take() {
                    d.run();
                }
                Ok(())
            })),
            false,
        )
        .unwrap();

    let b_fired_clone = b_fired.clone();
    let watch_b = root
        .watch(
            "b",
            Some(Rc::new(move |_n, _o, _s| {
                b_fired_clone.set(true);
                Ok(())
            })),
            false,
        )
        .unwrap();
    *b_destructor.borrow_mut() = Some(watch_b);

    let c_fired_clone = c_fired.clone();
    let _watch_c = root
        .watch(
            "c",
            Some(Rc::new(move |_n, _o, _s| {
                c_fired_clone.set(true);
                Ok(())
            })),
            false,
        )
        .unwrap();

    root.digest().unwrap();
    assert!(c_fired.get(), "c must still fire even though a's listener destroyed b mid-pass");
}

// ============================================
// Tree invariants
// ============================================

#[test]
fn non_shadowed_attribute_is_identical_across_a_non_isolated_child() {
    let parent = Scope::new_root();
    parent.properties().borrow_mut().insert("theme", Value::string("dark"));
    let child = parent.new_child(false);
    assert!(child.get("theme").structural_eq(&parent.get("theme")));
}

#[test]
fn destroy_before_digest_means_the_watcher_never_fires() {
    let root = Scope::new_root();
    root.properties().borrow_mut().insert("x", Value::Number(1.0));
    let count = Rc::new(Cell::new(0u32));
    let count_clone = count.clone();
    let d = root
        .watch(
            "x",
            Some(Rc::new(move |_n, _o, _s| {
                count_clone.set(count_clone.get() + 1);
                Ok(())
            })),
            false,
        )
        .unwrap();
    d.run();
    root.digest().unwrap();
    assert_eq!(count.get(), 0);
}
