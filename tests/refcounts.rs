//! Reference-count and lifetime invariants of the variable store.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::session;
use glint::prelude::*;
use glint::var;

#[test]
fn store_returns_to_baseline_after_expression_drop() {
    let _session = session();
    let before = var::registered();
    {
        let a = Float::scalar(1.0);
        let b = Float::scalar(2.0);
        let c = &(&a + &b) * &a;
        let d = c.sqrt();
        assert!(var::registered() > before);
        drop(d);
    }
    assert_eq!(var::registered(), before);
}

#[test]
fn inc_dec_is_neutral() {
    let _session = session();
    let v = Float::scalar(9.0);
    let id = v.index();

    var::inc_ref(id);
    var::dec_ref(id);

    // The handle still works and the store did not lose the variable.
    assert_eq!(v.read(0), 9.0);
}

#[test]
fn clones_share_the_variable() {
    let _session = session();
    let before = var::registered();
    let v = Float::scalar(5.0);
    let w = v.clone();
    assert_eq!(v.index(), w.index());
    assert_eq!(var::registered(), before + 1);
    drop(v);
    assert_eq!(w.read(0), 5.0);
    drop(w);
    assert_eq!(var::registered(), before);
}

#[test]
fn internal_edges_keep_operands_alive() {
    let _session = session();
    let before = var::registered();
    let sum = {
        let a = Float::from_slice(&[1.0, 2.0]);
        let b = Float::from_slice(&[3.0, 4.0]);
        &a + &b
        // a and b drop here but stay alive as dependencies of `sum`.
    };
    assert_eq!(sum.to_vec(), vec![4.0, 6.0]);
    drop(sum);
    assert_eq!(var::registered(), before);
}

#[test]
fn evaluation_collects_intermediates() {
    let _session = session();
    let x = &(&UInt32::arange(64) * &UInt32::scalar(3)) + &UInt32::scalar(1);
    let before_eval = var::registered();
    x.eval();
    // The counter, literals and the multiply node are gone; only the
    // evaluated output (and any client-held scalars) survive.
    assert!(var::registered() < before_eval);
    assert_eq!(x.read(5), 16);
}

#[test]
fn free_callback_fires_outside_the_lock() {
    let _session = session();
    let fired = Arc::new(AtomicBool::new(false));
    {
        let v = Float::scalar(3.5);
        let flag = fired.clone();
        var::set_callback(
            v.index(),
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );
        assert!(!fired.load(Ordering::SeqCst));
    }
    assert!(fired.load(Ordering::SeqCst));
}

#[test]
fn labels_round_trip() {
    let _session = session();
    let v = Float::scalar(1.0);
    v.set_label("weights");
    assert_eq!(var::label(v.index()).as_deref(), Some("weights"));
    assert!(var::whos().contains("weights"));
}

#[test]
fn whos_reports_store_contents() {
    let _session = session();
    let v = Float::from_slice(&[1.0, 2.0, 3.0]);
    let text = var::whos();
    assert!(text.contains("ID"));
    assert!(text.contains("host-async"));
    assert!(text.contains("Kernel launches"));
    drop(v);
}

#[test]
fn graphviz_lists_nodes_and_edges() {
    let _session = session();
    let a = Float::scalar(1.0);
    let b = &a + &a;
    let text = var::graphviz();
    assert!(text.starts_with("digraph {"));
    assert!(text.contains(&format!("{} -> {}", a.index(), b.index())));
    assert!(text.ends_with("}\n"));
}

#[test]
fn copies_are_independent() {
    let _session = session();
    let v = Float::from_slice(&[1.0, 2.0]);
    let w = v.copy();
    assert_ne!(v.index(), w.index());
    w.write(0, 10.0);
    assert_eq!(v.read(0), 1.0);
    assert_eq!(w.read(0), 10.0);
}

#[test]
fn copy_of_unevaluated_expression_gets_fresh_id() {
    let _session = session();
    let a = Float::scalar(2.0);
    let sum = &a + &a;
    let dup = sum.copy();
    assert_ne!(sum.index(), dup.index());
    assert_eq!(dup.read(0), 4.0);
}

#[test]
fn pointer_variables_are_deduplicated() {
    let _session = session();
    // Two gathers from the same source share one pointer variable; the
    // store shrinks back once both are gone.
    let before = var::registered();
    {
        let source = Float::from_slice(&[1.0, 2.0, 3.0]);
        let index = UInt32::from_slice(&[0, 1]);
        let mask = Mask::scalar(true);
        let g1 = Float::gather(&source, &index, &mask);
        let g2 = Float::gather(&source, &index, &mask);
        // Value numbering makes the two gathers one variable as well.
        assert_eq!(g1.index(), g2.index());
        assert_eq!(g1.to_vec(), vec![1.0, 2.0]);
    }
    assert_eq!(var::registered(), before);
}

#[test]
#[should_panic(expected = "unknown variable")]
fn unknown_id_is_fatal() {
    let _session = session();
    var::size(0xdead_beef);
}

#[test]
#[should_panic(expected = "incompatible size")]
fn size_mismatch_is_fatal() {
    let _session = session();
    let a = Float::from_slice(&[1.0, 2.0, 3.0]);
    let b = Float::from_slice(&[1.0, 2.0]);
    let _ = &a + &b;
}

#[test]
#[should_panic(expected = "incompatible types")]
fn type_mismatch_is_fatal() {
    let _session = session();
    let a = Float::scalar(1.0);
    let b = Int32::scalar(1);
    let _ = glint::op::add(a.index(), b.index());
}
