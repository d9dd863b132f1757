//! Indexed memory operations: gather, scatter (plain and reductive),
//! atomic increments, contiguous loads/stores, and the dirty-flush
//! discipline tying them to ordinary reads.

mod common;

use common::session;
use glint::prelude::*;
use glint::{op, var};

#[test]
fn gather_basic() {
    let _session = session();
    let source = Float::from_slice(&[10.0, 11.0, 12.0, 13.0]);
    let index = UInt32::from_slice(&[3, 1, 2]);
    let mask = Mask::scalar(true);

    let gathered = Float::gather(&source, &index, &mask);
    assert_eq!(gathered.to_vec(), vec![13.0, 11.0, 12.0]);
}

#[test]
fn gather_inactive_lanes_read_zero() {
    let _session = session();
    let source = Float::from_slice(&[10.0, 11.0, 12.0, 13.0]);
    let index = UInt32::from_slice(&[0, 1, 2, 3]);
    let mask = Mask::from_slice(&[true, false, true, false]);

    let gathered = Float::gather(&source, &index, &mask);
    assert_eq!(gathered.to_vec(), vec![10.0, 0.0, 12.0, 0.0]);
}

#[test]
fn scatter_overwrites_target() {
    let _session = session();
    let target = Float::zeros(6);
    let values = Float::from_slice(&[1.0, 2.0, 3.0]);
    let index = UInt32::from_slice(&[4, 0, 2]);
    let mask = Mask::scalar(true);

    target.scatter(&values, &index, &mask, ReduceOp::None);
    assert_eq!(target.to_vec(), vec![2.0, 0.0, 3.0, 0.0, 1.0, 0.0]);
}

/// Scatter-add with lanes colliding on the same cells matches a scalar
/// reference exactly (the lanes apply in order on one stream).
#[test]
fn scatter_add_overlapping_indices() {
    let _session = session();
    let n = 8usize;
    let values: Vec<f32> = (0..16).map(|v| (v + 1) as f32).collect();
    let index: Vec<u32> = (0..16).map(|v| (v % 4) as u32).collect();

    let target = Float::zeros(n as u32);
    let value_arr = Float::from_slice(&values);
    let index_arr = UInt32::from_slice(&index);
    target.scatter_add(&value_arr, &index_arr);

    let mut reference = vec![0.0f32; n];
    for (value, slot) in values.iter().zip(&index) {
        reference[*slot as usize] += value;
    }
    assert_eq!(target.to_vec(), reference);
}

#[test]
fn scatter_reductions_min_max() {
    let _session = session();
    let target = UInt32::full(100, 4);
    let values = UInt32::from_slice(&[7, 130, 3]);
    let index = UInt32::from_slice(&[0, 1, 0]);
    let mask = Mask::scalar(true);

    target.scatter(&values, &index, &mask, ReduceOp::Min);
    assert_eq!(target.to_vec(), vec![3, 100, 100, 100]);

    let target = UInt32::full(100, 4);
    target.scatter(&values, &index, &mask, ReduceOp::Max);
    assert_eq!(target.to_vec(), vec![100, 130, 100, 100]);
}

/// Creating a scatter marks its target dirty; any subsequent operation on
/// the target flushes the queue first.
#[test]
fn dirty_target_flushes_before_reads() {
    let _session = session();
    let target = Float::zeros(4);
    let values = Float::from_slice(&[5.0, 6.0]);
    let index = UInt32::from_slice(&[1, 3]);
    let mask = Mask::scalar(true);
    target.scatter(&values, &index, &mask, ReduceOp::None);

    // Arithmetic on the dirty target forces the pending scatter.
    let doubled = &target + &target;
    assert_eq!(doubled.to_vec(), vec![0.0, 10.0, 0.0, 12.0]);
}

/// An all-zeros scatter target is materialized by an asynchronous memset
/// instead of a kernel launch.
#[test]
fn zero_target_skips_kernel() {
    let _session = session();
    let launches_before = glint::kernel_stats().launches;
    let target = Float::zeros(1024);
    target.eval();
    assert_eq!(glint::kernel_stats().launches, launches_before);
    assert_eq!(target.read(100), 0.0);
}

#[test]
fn scatter_inc_counts_lanes() {
    let _session = session();
    let target = UInt32::zeros(4);
    let index = UInt32::from_slice(&[0, 0, 1]);
    let mask = Mask::scalar(true);

    let result_id = op::scatter_inc(target.index(), index.index(), mask.index());
    let result = UInt32::from_index(result_id);
    var::dec_ref(result_id);

    // Pre-increment values; lanes hitting the same counter receive
    // consecutive slots.
    assert_eq!(result.to_vec(), vec![0, 1, 0]);
    assert_eq!(target.to_vec(), vec![2, 1, 0, 0]);
}

#[test]
fn load_and_store_contiguous() {
    let _session = session();
    let target = Float::from_slice(&[1.0, 2.0, 3.0, 4.0]);
    let values = Float::from_slice(&[10.0, 20.0, 30.0, 40.0]);
    let mask = Mask::from_slice(&[true, false, true, false]);

    op::store(target.index(), values.index(), mask.index());
    assert_eq!(target.to_vec(), vec![10.0, 2.0, 30.0, 4.0]);

    let loaded_id = op::load(target.index(), mask.index());
    let loaded = Float::from_index(loaded_id);
    var::dec_ref(loaded_id);
    assert_eq!(loaded.to_vec(), vec![10.0, 0.0, 30.0, 0.0]);
}

#[test]
fn masked_keep_and_clear() {
    let _session = session();
    let x = Float::from_slice(&[1.0, 2.0, 3.0]);
    let mask = Mask::from_slice(&[true, false, true]);

    let kept_id = op::and(x.index(), mask.index());
    let kept = Float::from_index(kept_id);
    var::dec_ref(kept_id);
    assert_eq!(kept.to_vec(), vec![1.0, 0.0, 3.0]);
}

#[test]
fn mask_stack_push_pop() {
    let _session = session();
    let backend = JitBackend::LlvmSimd;
    let mask = Mask::from_slice(&[true, true, false, false]);

    assert_eq!(op::mask_peek(backend), 0);
    op::mask_push(backend, mask.index());
    let top = op::mask_peek(backend);
    assert_eq!(top, mask.index());
    var::dec_ref(top);

    // Applying a mask combines it with the innermost stack entry.
    let other = Mask::from_slice(&[true, false, true, false]);
    let combined_id = op::mask_apply(other.index(), 4);
    let combined = Mask::from_index(combined_id);
    var::dec_ref(combined_id);
    assert_eq!(combined.to_vec(), vec![true, false, false, false]);

    op::mask_pop(backend);
    assert_eq!(op::mask_peek(backend), 0);
}

#[test]
fn default_mask_covers_range() {
    let _session = session();
    let mask_id = op::default_mask(JitBackend::LlvmSimd, 5);
    let mask = Mask::from_index(mask_id);
    var::dec_ref(mask_id);
    assert_eq!(mask.to_vec(), vec![true; 5]);
}

/// Side-effect references keep the whole scatter expression alive even
/// when the client drops every handle before evaluating.
#[test]
fn side_effects_survive_handle_drops() {
    let _session = session();
    let target = Float::zeros(4);
    {
        let values = Float::from_slice(&[1.0, 2.0]);
        let index = UInt32::from_slice(&[0, 2]);
        let mask = Mask::scalar(true);
        target.scatter(&values, &index, &mask, ReduceOp::None);
        // values/index/mask handles drop here; the queued side effect
        // holds the graph.
    }
    assert_eq!(target.to_vec(), vec![1.0, 0.0, 2.0, 0.0]);
}
