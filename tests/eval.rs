//! Evaluator behavior: kernel caching, size grouping, and the PTX
//! backend driven end-to-end through the interpreter engine.

mod common;

use common::session;
use glint::prelude::*;
use glint::var;

#[test]
fn identical_graphs_hit_the_kernel_cache() {
    let _session = session();
    let run = || {
        let x = &UInt32::arange(32) * &UInt32::scalar(3);
        x.eval();
        x.read(7)
    };

    let first = run();
    let stats_after_first = glint::kernel_stats();
    let second = run();
    let stats_after_second = glint::kernel_stats();

    assert_eq!(first, 21);
    assert_eq!(second, 21);
    // The rebuilt graph assembles to the identical kernel text.
    assert_eq!(stats_after_second.hits, stats_after_first.hits + 1);
    assert_eq!(stats_after_second.launches, stats_after_first.launches + 1);
}

#[test]
fn changed_graphs_miss_the_kernel_cache() {
    let _session = session();
    let stats_before = glint::kernel_stats();
    let x = &UInt32::arange(32) + &UInt32::scalar(11311);
    x.eval();
    let stats_after = glint::kernel_stats();
    assert_eq!(stats_after.hits, stats_before.hits);
    assert_eq!(
        stats_after.soft_misses + stats_after.hard_misses,
        stats_before.soft_misses + stats_before.hard_misses + 1
    );
}

#[test]
fn groups_split_by_size_and_launch_separately() {
    let _session = session();
    let a = &Float::arange(16) + &Float::scalar(0.5);
    let b = &Float::arange(8) + &Float::scalar(0.25);

    let launches_before = glint::kernel_stats().launches;
    a.schedule();
    b.schedule();
    glint::eval();
    let launches_after = glint::kernel_stats().launches;

    assert_eq!(launches_after, launches_before + 2);
    assert_eq!(a.read(15), 15.5);
    assert_eq!(b.read(7), 7.25);
}

#[test]
fn scalars_broadcast_into_larger_groups() {
    let _session = session();
    // A scalar dependency joins the kernel of its consumer's size.
    let scalar = &Float::scalar(2.0) * &Float::scalar(3.0);
    let array = &Float::arange(8) * &scalar;
    assert_eq!(array.to_vec(), (0..8).map(|v| v as f32 * 6.0).collect::<Vec<_>>());
}

#[test]
fn eval_with_empty_queue_is_a_no_op() {
    let _session = session();
    let launches_before = glint::kernel_stats().launches;
    glint::eval();
    assert_eq!(glint::kernel_stats().launches, launches_before);
}

#[test]
fn evaluated_variables_become_plain_inputs() {
    let _session = session();
    let x = &Float::arange(8) + &Float::scalar(1.0);
    x.eval();

    // A second expression over the evaluated array launches a new kernel
    // that consumes it as an input.
    let y = &x * &Float::scalar(2.0);
    assert_eq!(y.read(3), 8.0);
}

#[test]
fn schedule_returns_false_for_evaluated_arrays() {
    let _session = session();
    let x = Float::from_slice(&[1.0, 2.0]);
    assert!(!x.schedule());

    let y = &x + &x;
    assert!(y.schedule());
    glint::eval();
    assert!(!y.schedule());
}

#[test]
fn cuda_backend_emits_and_runs_through_the_interpreter() {
    let _session = session();
    glint::init(JitBackend::Cuda);

    let x = &UInt32::arange(64) * &UInt32::scalar(5);
    assert_eq!(x.read(10), 50);

    let a = Float::from_slice(&[1.0, 2.0, 3.0, 4.0]);
    let b = Float::from_slice(&[3.0, 8.0, 1.0, 5.0]);
    let c = Float::fma(&a, &b, &Float::scalar(0.5));
    assert_eq!(c.to_vec(), vec![3.5, 16.5, 3.5, 20.5]);

    let target = Float::zeros(4);
    let index = UInt32::from_slice(&[1, 1, 3]);
    let values = Float::from_slice(&[1.0, 2.0, 4.0]);
    target.scatter_add(&values, &index);
    assert_eq!(target.to_vec(), vec![0.0, 3.0, 0.0, 4.0]);

    drop((x, a, b, c, target, index, values));
    glint::init(JitBackend::LlvmSimd);
}

#[test]
fn multithreaded_construction_shares_the_store() {
    let _session = session();
    let handles: Vec<_> = (0..4u32)
        .map(|t| {
            std::thread::spawn(move || {
                let x = &UInt32::arange(128) + &UInt32::scalar(t);
                x.to_vec()
            })
        })
        .collect();
    for (t, handle) in handles.into_iter().enumerate() {
        let values = handle.join().unwrap();
        assert_eq!(values, (0..128).map(|v| v + t as u32).collect::<Vec<_>>());
    }
}

#[test]
fn many_parameters_still_evaluate() {
    let _session = session();
    // Enough distinct inputs to overflow a direct parameter table.
    let inputs: Vec<Float> = (0..150)
        .map(|i| Float::from_slice(&[i as f32, (i + 1) as f32]))
        .collect();
    let mut sum = Float::full(0.0, 2);
    for input in &inputs {
        sum += input;
    }
    assert_eq!(sum.read(0), (0..150).map(|i| i as f32).sum::<f32>());
    drop(inputs);
    drop(sum);
    assert!(var::registered() < 10);
}
