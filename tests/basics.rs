//! End-to-end behavior of the tracing JIT on the CPU backend: reference
//! counting, value numbering, evaluation, conversions and stringification.

mod common;

use common::session;
use glint::prelude::*;
use glint::{var, AllocKind};
use rstest::rstest;

#[rstest]
#[case::host(AllocKind::Host)]
#[case::host_pinned(AllocKind::HostPinned)]
#[case::device(AllocKind::Device)]
fn migrate_to_each_kind(#[case] kind: AllocKind) {
    let _session = session();
    let v = Float::from_slice(&[1.0, -2.0, 3.5]);
    let moved = v.migrate(kind);
    assert_eq!(moved.to_vec(), vec![1.0, -2.0, 3.5]);
}

#[test]
fn creation_destruction() {
    let _session = session();
    // A never-evaluated variable disappears with its last handle.
    let before = var::registered();
    {
        let value = Float::scalar(1234.0);
        assert!(value.valid());
        assert_eq!(var::registered(), before + 1);
    }
    assert_eq!(var::registered(), before);
}

#[test]
fn fill_and_print() {
    let _session = session();
    assert_eq!(Array::<i8>::full(-111, 5).to_string(), "[-111, -111, -111, -111, -111]");
    assert_eq!(Array::<u8>::full(222, 5).to_string(), "[222, 222, 222, 222, 222]");
    assert_eq!(Array::<i16>::full(-1111, 3).to_string(), "[-1111, -1111, -1111]");
    assert_eq!(Array::<u16>::full(2222, 3).to_string(), "[2222, 2222, 2222]");
    assert_eq!(
        Array::<i32>::full(-1111111111, 2).to_string(),
        "[-1111111111, -1111111111]"
    );
    assert_eq!(
        Array::<u32>::full(2222222222, 2).to_string(),
        "[2222222222, 2222222222]"
    );
    assert_eq!(
        Array::<i64>::full(-1111111111111111111, 2).to_string(),
        "[-1111111111111111111, -1111111111111111111]"
    );
    assert_eq!(
        Array::<u64>::full(2222222222222222222, 2).to_string(),
        "[2222222222222222222, 2222222222222222222]"
    );
    assert_eq!(Array::<f64>::full(0.5, 2).to_string(), "[0.5, 0.5]");
}

#[test]
fn eval_scalar() {
    let _session = session();
    let value = Float::scalar(1234.0);
    assert_eq!(value.read(0), 1234.0);
}

#[test]
fn eval_scalar_lvn() {
    let _session = session();
    // Identical expressions share one variable; distinct ones do not.
    let value_1 = Float::scalar(1234.0);
    let value_2 = Float::scalar(1235.0);
    let value_3 = Float::scalar(1234.0);
    let value_4 = &value_1 + &value_2;
    let value_5 = &value_1 + &value_3;
    let value_6 = &value_1 + &value_2;

    assert_eq!(value_1.index(), value_3.index());
    assert_eq!(value_4.index(), value_6.index());
    assert_ne!(value_4.index(), value_5.index());

    value_4.schedule();
    value_5.schedule();
    value_6.schedule();
    glint::eval();

    assert_eq!(value_4.read(0), 2469.0);
    assert_eq!(value_5.read(0), 2468.0);
    assert_eq!(value_6.read(0), 2469.0);
}

#[test]
fn lvn_disabled_produces_distinct_ids() {
    let _session = session();
    glint::set_lvn(JitBackend::LlvmSimd, false);
    let a = Float::scalar(7.0);
    let b = Float::scalar(7.0);
    assert_ne!(a.index(), b.index());
    glint::set_lvn(JitBackend::LlvmSimd, true);
}

#[test]
fn arange_values() {
    let _session = session();
    let x = UInt32::arange(1024);
    assert_eq!(x.to_vec(), (0..1024).collect::<Vec<u32>>());

    let y = UInt32::arange_range(3, 512, 7);
    let expected: Vec<u32> = (0..).map(|i| 3 + 7 * i).take_while(|&v| v < 512).collect();
    assert_eq!(y.to_vec(), expected);
}

#[test]
fn conversions_from_uint32() {
    let _session = session();
    let src = UInt32::arange(1024);
    assert_eq!(src.cast::<i32>().to_vec(), (0..1024i32).collect::<Vec<_>>());
    assert_eq!(src.cast::<u64>().to_vec(), (0..1024u64).collect::<Vec<_>>());
    assert_eq!(src.cast::<i64>().to_vec(), (0..1024i64).collect::<Vec<_>>());
    assert_eq!(
        src.cast::<f32>().to_vec(),
        (0..1024).map(|v| v as f32).collect::<Vec<_>>()
    );
    assert_eq!(
        src.cast::<f64>().to_vec(),
        (0..1024).map(|v| v as f64).collect::<Vec<_>>()
    );
}

#[test]
fn conversions_from_int32() {
    let _session = session();
    let src = &Int32::arange(1024) - &Int32::scalar(512);
    let reference: Vec<i32> = (0..1024).map(|v| v - 512).collect();
    assert_eq!(src.to_vec(), reference);
    assert_eq!(
        src.cast::<i64>().to_vec(),
        reference.iter().map(|&v| v as i64).collect::<Vec<_>>()
    );
    assert_eq!(
        src.cast::<f32>().to_vec(),
        reference.iter().map(|&v| v as f32).collect::<Vec<_>>()
    );
    assert_eq!(
        src.cast::<f64>().to_vec(),
        reference.iter().map(|&v| v as f64).collect::<Vec<_>>()
    );
}

#[test]
fn conversions_from_float() {
    let _session = session();
    let src = &Float::arange(1024) - &Float::scalar(512.0);
    let reference: Vec<f32> = (0..1024).map(|v| v as f32 - 512.0).collect();
    assert_eq!(src.to_vec(), reference);
    assert_eq!(
        src.cast::<i32>().to_vec(),
        reference.iter().map(|&v| v as i32).collect::<Vec<_>>()
    );
    assert_eq!(
        src.cast::<i64>().to_vec(),
        reference.iter().map(|&v| v as i64).collect::<Vec<_>>()
    );
    assert_eq!(
        src.cast::<f64>().to_vec(),
        reference.iter().map(|&v| v as f64).collect::<Vec<_>>()
    );
}

/// Kernels whose parameter table is dominated by outputs: every literal
/// stays referenced by the client and is materialized.
#[test]
fn argument_out() {
    let _session = session();
    let mut i = 1usize;
    while i < 1024 {
        let mut value: Vec<Int32> = Vec::new();
        let mut out = Int32::scalar(0);
        for j in 0..i {
            value.push(Int32::scalar(j as i32));
            out += value.last().unwrap();
        }
        assert_eq!(out.read(0) as usize, i * (i - 1) / 2, "i = {i}");
        i *= 3;
    }
}

/// The same accumulation with inputs surviving across launches: later
/// kernels consume the previously materialized literals as inputs.
#[test]
fn argument_inout() {
    let _session = session();
    let mut value: Vec<Option<Int32>> = (0..1024).map(|_| None).collect();
    let mut i = 1usize;
    while i < 1024 {
        let mut out = Int32::scalar(0);
        for (j, slot) in value.iter_mut().take(i).enumerate() {
            let entry = slot.get_or_insert_with(|| Int32::scalar(j as i32));
            out += entry.clone();
        }
        assert_eq!(out.read(0) as usize, i * (i - 1) / 2, "i = {i}");
        i *= 3;
    }
}

#[test]
fn fma_and_fmsub() {
    let _session = session();
    let a = Float::from_slice(&[1.0, 2.0, 3.0, 4.0]);
    let b = Float::from_slice(&[3.0, 8.0, 1.0, 5.0]);
    let c = Float::from_slice(&[9.0, 1.0, 3.0, 0.0]);

    let d = Float::fma(&a, &b, &c);
    let e = Float::fmsub(&d, &b, &c);
    assert_eq!(d.to_vec(), vec![12.0, 17.0, 6.0, 20.0]);
    assert_eq!(e.to_vec(), vec![27.0, 135.0, 3.0, 100.0]);
}

#[test]
fn from_index_round_trip() {
    let _session = session();
    let v = Float::scalar(42.0);
    let before = var::registered();

    let w = Float::from_index(v.index());
    assert_eq!(w.index(), v.index());
    drop(w);

    assert_eq!(var::registered(), before);
    assert_eq!(v.read(0), 42.0);
}

#[test]
fn migrate_round_trip() {
    let _session = session();
    let data = [1.5f32, -2.5, 3.25, 0.0];
    let v = Float::from_slice(&data);

    let host = v.migrate(AllocKind::Host);
    let device = host.migrate(AllocKind::Device);
    assert_eq!(device.to_vec(), data.to_vec());

    // No move necessary: the same variable comes back.
    let same = device.migrate(AllocKind::Device);
    assert_eq!(same.index(), device.index());
}

#[test]
fn read_write_elements() {
    let _session = session();
    let v = Float::from_slice(&[1.0, 2.0, 3.0]);
    v.write(1, 20.0);
    assert_eq!(v.to_vec(), vec![1.0, 20.0, 3.0]);
}

#[test]
fn resize_broadcasts_literals() {
    let _session = session();
    let s = Float::scalar(3.0);
    let id = var::resize(s.index(), 5);
    let wide = Float::from_index(id);
    var::dec_ref(id);
    assert_eq!(wide.to_vec(), vec![3.0; 5]);
}

#[test]
fn print_limit_elides_middle() {
    let _session = session();
    let x = UInt32::arange(100);
    let text = x.to_string();
    assert!(text.starts_with("[0, 1,"));
    assert!(text.contains("skipped"));
    assert!(text.ends_with("98, 99]"));
}

#[test]
fn arithmetic_operators() {
    let _session = session();
    let a = Int32::from_slice(&[6, -6, 9]);
    let b = Int32::from_slice(&[4, 4, -3]);

    assert_eq!((&a + &b).to_vec(), vec![10, -2, 6]);
    assert_eq!((&a - &b).to_vec(), vec![2, -10, 12]);
    assert_eq!((&a * &b).to_vec(), vec![24, -24, -27]);
    assert_eq!((&a / &b).to_vec(), vec![1, -1, -3]);
    assert_eq!((&a % &b).to_vec(), vec![2, -2, 0]);
    assert_eq!((-&a).to_vec(), vec![-6, 6, -9]);
    assert_eq!(a.abs().to_vec(), vec![6, 6, 9]);
    assert_eq!(a.min(&b).to_vec(), vec![4, -6, -3]);
    assert_eq!(a.max(&b).to_vec(), vec![6, 4, 9]);
}

#[test]
fn float_functions() {
    let _session = session();
    let x = Float::from_slice(&[4.0, 2.25, 0.25]);
    assert_eq!(x.sqrt().to_vec(), vec![2.0, 1.5, 0.5]);

    let y = Float::from_slice(&[1.2, -1.7, 2.5]);
    assert_eq!(y.floor().to_vec(), vec![1.0, -2.0, 2.0]);
    assert_eq!(y.ceil().to_vec(), vec![2.0, -1.0, 3.0]);
    assert_eq!(y.round().to_vec(), vec![1.0, -2.0, 2.0]);
    assert_eq!(y.trunc().to_vec(), vec![1.0, -1.0, 2.0]);
}

#[test]
fn comparisons_and_select() {
    let _session = session();
    let a = Int32::from_slice(&[1, 5, 3]);
    let b = Int32::from_slice(&[2, 2, 3]);

    let less = a.lt(&b);
    assert_eq!(less.to_vec(), vec![true, false, false]);
    assert_eq!(a.eq(&b).to_vec(), vec![false, false, true]);
    assert!(a.le(&b).any());
    assert!(!a.le(&b).all());

    let blended = Int32::select(&less, &a, &b);
    assert_eq!(blended.to_vec(), vec![1, 2, 3]);
}

#[test]
fn horizontal_reductions() {
    let _session = session();
    let x = UInt32::arange(10);
    assert_eq!(x.reduce(ReduceOp::Add), 45);
    assert_eq!(x.reduce(ReduceOp::Max), 9);
    assert_eq!(x.reduce(ReduceOp::Min), 0);

    let y = Float::from_slice(&[1.5, 2.5, -4.0]);
    assert_eq!(y.reduce(ReduceOp::Add), 0.0);
}

#[test]
fn bit_manipulation() {
    let _session = session();
    let x = UInt32::from_slice(&[0b1011, 1 << 31, 8]);

    let id = glint::op::popc(x.index());
    let counts = UInt32::from_index(id);
    var::dec_ref(id);
    assert_eq!(counts.to_vec(), vec![3, 1, 1]);

    let shifted = &x << &UInt32::full(1, 3);
    assert_eq!(shifted.to_vec(), vec![0b10110, 0, 16]);

    assert_eq!((&x & &UInt32::full(8, 3)).to_vec(), vec![8, 0, 8]);
    assert_eq!((!&x).read(2), !8u32);
}
