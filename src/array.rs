//! Typed client handles over JIT variables.
//!
//! An [`Array<T>`] owns one external reference on a graph variable and
//! exposes the scalar-looking operator surface: arithmetic builds graph
//! nodes, nothing executes until a value is required (`eval`, `read`,
//! `to_vec`, `Display`). Handles are cheap to clone (a reference count
//! bump) and release their reference on drop.
//!
//! ```
//! use glint::prelude::*;
//!
//! glint::init(glint::JitBackend::LlvmSimd);
//! let x = UInt32::arange(10);
//! let y = &x * &UInt32::scalar(3);
//! assert_eq!(y.read(4), 12);
//! ```

use std::fmt;
use std::marker::PhantomData;

use crate::malloc::AllocKind;
use crate::op;
use crate::state::default_backend;
use crate::var::{self, ReduceOp, VarId};
use crate::vtype::{JitScalar, VarType};

pub struct Array<T: JitScalar> {
    index: VarId,
    marker: PhantomData<T>,
}

pub type Mask = Array<bool>;
pub type Int8 = Array<i8>;
pub type UInt8 = Array<u8>;
pub type Int16 = Array<i16>;
pub type UInt16 = Array<u16>;
pub type Int32 = Array<i32>;
pub type UInt32 = Array<u32>;
pub type Int64 = Array<i64>;
pub type UInt64 = Array<u64>;
pub type Float = Array<f32>;
pub type Double = Array<f64>;

impl<T: JitScalar> Array<T> {
    /// Wrap an index, taking ownership of one external reference.
    pub(crate) fn steal(index: VarId) -> Self {
        Self {
            index,
            marker: PhantomData,
        }
    }

    /// Wrap an index, acquiring a new external reference. Pairing this
    /// with the matching drop leaves all reference counts unchanged.
    pub fn from_index(index: VarId) -> Self {
        var::inc_ref(index);
        Self::steal(index)
    }

    /// The underlying variable id (0 for an empty handle).
    pub fn index(&self) -> VarId {
        self.index
    }

    pub fn valid(&self) -> bool {
        self.index != 0
    }

    /// Number of elements.
    pub fn len(&self) -> u32 {
        if self.index == 0 {
            0
        } else {
            var::size(self.index)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ----------------------------------------------------------------
    // Construction
    // ----------------------------------------------------------------

    /// A size-1 constant that broadcasts against any array.
    pub fn scalar(value: T) -> Self {
        Self::steal(var::literal(
            default_backend(),
            T::VTYPE,
            value.to_bits(),
            1,
            false,
        ))
    }

    /// `size` copies of `value`.
    pub fn full(value: T, size: u32) -> Self {
        Self::steal(var::literal(
            default_backend(),
            T::VTYPE,
            value.to_bits(),
            size,
            false,
        ))
    }

    pub fn zeros(size: u32) -> Self {
        Self::steal(var::literal(default_backend(), T::VTYPE, 0, size, false))
    }

    /// Copy host values into a fresh array.
    pub fn from_slice(values: &[T]) -> Self {
        let bytes: Vec<u8> = values
            .iter()
            .flat_map(|v| v.to_bits().to_le_bytes()[..T::VTYPE.size()].to_vec())
            .collect();
        Self::steal(var::mem_copy(
            default_backend(),
            T::VTYPE,
            bytes.as_ptr(),
            values.len() as u32,
        ))
    }

    /// `[0, 1, ..., size-1]` converted to the element type.
    pub fn arange(size: u32) -> Self {
        let counter = var::counter(default_backend(), size);
        let converted = op::cast(counter, T::VTYPE);
        var::dec_ref(counter);
        Self::steal(converted)
    }

    /// `[start, start+step, ...)` up to (excluding) `stop`.
    pub fn arange_range(start: i64, stop: i64, step: i64) -> Self {
        assert!(step != 0, "arange_range(): step must be non-zero!");
        let count = ((stop - start).abs() + step.abs() - 1) / step.abs();
        let counter = var::counter(default_backend(), count.max(0) as u32);
        let converted = op::cast(counter, T::VTYPE);
        var::dec_ref(counter);
        let scaled = Self::steal(converted)
            .fma_scalar_bits(T::from_bits_int(step), T::from_bits_int(start));
        scaled
    }

    fn fma_scalar_bits(self, scale: T, offset: T) -> Self {
        let result = op::fma(
            self.index,
            Self::scalar(scale).index,
            Self::scalar(offset).index,
        );
        Self::steal(result)
    }

    // ----------------------------------------------------------------
    // Evaluation and access
    // ----------------------------------------------------------------

    /// Queue this array for the next `eval()`.
    pub fn schedule(&self) -> bool {
        var::schedule(self.index)
    }

    /// Evaluate this array right away if needed.
    pub fn eval(&self) -> &Self {
        var::eval_var(self.index);
        self
    }

    /// Read one element, evaluating first.
    pub fn read(&self, offset: u32) -> T {
        T::from_bits(var::read(self.index, offset))
    }

    /// Overwrite one element, evaluating first.
    pub fn write(&self, offset: u32, value: T) {
        var::write(self.index, offset, value.to_bits());
    }

    /// Copy the contents back to the host.
    pub fn to_vec(&self) -> Vec<T> {
        let size = self.len();
        (0..size).map(|i| self.read(i)).collect()
    }

    /// Move the backing storage to a different allocation flavor.
    pub fn migrate(&self, kind: AllocKind) -> Self {
        Self::steal(var::migrate(self.index, kind))
    }

    /// Duplicate into an independent array.
    pub fn copy(&self) -> Self {
        Self::steal(var::copy(self.index))
    }

    pub fn set_label(&self, label: &str) {
        var::set_label(self.index, label);
    }

    // ----------------------------------------------------------------
    // Operations
    // ----------------------------------------------------------------

    /// Convert elements to another type.
    pub fn cast<U: JitScalar>(&self) -> Array<U> {
        Array::steal(op::cast(self.index, U::VTYPE))
    }

    /// Reinterpret the bits as another type of equal width.
    pub fn reinterpret<U: JitScalar>(&self) -> Array<U> {
        Array::steal(op::bitcast(self.index, U::VTYPE))
    }

    pub fn abs(&self) -> Self {
        Self::steal(op::abs(self.index))
    }

    pub fn min(&self, other: &Self) -> Self {
        Self::steal(op::min(self.index, other.index))
    }

    pub fn max(&self, other: &Self) -> Self {
        Self::steal(op::max(self.index, other.index))
    }

    pub fn eq(&self, other: &Self) -> Mask {
        Array::steal(op::eq(self.index, other.index))
    }

    pub fn neq(&self, other: &Self) -> Mask {
        Array::steal(op::neq(self.index, other.index))
    }

    pub fn lt(&self, other: &Self) -> Mask {
        Array::steal(op::lt(self.index, other.index))
    }

    pub fn le(&self, other: &Self) -> Mask {
        Array::steal(op::le(self.index, other.index))
    }

    pub fn gt(&self, other: &Self) -> Mask {
        Array::steal(op::gt(self.index, other.index))
    }

    pub fn ge(&self, other: &Self) -> Mask {
        Array::steal(op::ge(self.index, other.index))
    }

    /// Blend two arrays element-wise under a mask.
    pub fn select(mask: &Mask, t: &Self, f: &Self) -> Self {
        Self::steal(op::select(mask.index, t.index, f.index))
    }

    /// `source[index[lane]]` for active lanes.
    pub fn gather(source: &Self, index: &UInt32, mask: &Mask) -> Self {
        Self::steal(op::gather(source.index, index.index, mask.index))
    }

    /// `self[index[lane]] = value[lane]` (or a reduction) for active
    /// lanes; queued as a side effect until the next evaluation.
    pub fn scatter(&self, value: &Self, index: &UInt32, mask: &Mask, reduce: ReduceOp) {
        op::scatter(self.index, value.index, index.index, mask.index, reduce);
    }

    /// `self[index[lane]] += value[lane]` for active lanes.
    pub fn scatter_add(&self, value: &Self, index: &UInt32) {
        let mask = Mask::scalar(true);
        self.scatter(value, index, &mask, ReduceOp::Add);
    }

    /// Horizontal reduction to one element; synchronizes.
    pub fn reduce(&self, op: ReduceOp) -> T {
        let result = crate::op::reduce(self.index, op);
        let bits = var::read(result, 0);
        var::dec_ref(result);
        T::from_bits(bits)
    }
}

/// Helper used by `arange_range` to build typed start/step constants
/// from integers.
trait FromInt {
    fn from_bits_int(value: i64) -> Self;
}

impl<T: JitScalar> FromInt for T {
    fn from_bits_int(value: i64) -> T {
        match T::VTYPE {
            VarType::Float32 => T::from_bits((value as f32).to_bits() as u64),
            VarType::Float64 => T::from_bits((value as f64).to_bits()),
            _ => T::from_bits(value as u64 & mask_for(T::VTYPE)),
        }
    }
}

fn mask_for(vtype: VarType) -> u64 {
    let bytes = vtype.size();
    if bytes >= 8 {
        u64::MAX
    } else {
        (1u64 << (bytes * 8)) - 1
    }
}

impl<T: JitScalar> Array<T> {
    /// Fused multiply-add: `a * b + c`.
    pub fn fma(a: &Self, b: &Self, c: &Self) -> Self {
        Self::steal(op::fma(a.index, b.index, c.index))
    }

    /// Fused multiply-subtract: `a * b - c`.
    pub fn fmsub(a: &Self, b: &Self, c: &Self) -> Self {
        let minus_c = op::neg(c.index);
        let result = op::fma(a.index, b.index, minus_c);
        var::dec_ref(minus_c);
        Self::steal(result)
    }

    pub fn sqrt(&self) -> Self {
        Self::steal(op::sqrt(self.index))
    }

    pub fn floor(&self) -> Self {
        Self::steal(op::floor(self.index))
    }

    pub fn ceil(&self) -> Self {
        Self::steal(op::ceil(self.index))
    }

    pub fn round(&self) -> Self {
        Self::steal(op::round(self.index))
    }

    pub fn trunc(&self) -> Self {
        Self::steal(op::trunc(self.index))
    }
}

impl Mask {
    /// Horizontal AND; synchronizes.
    pub fn all(&self) -> bool {
        op::all(self.index)
    }

    /// Horizontal OR; synchronizes.
    pub fn any(&self) -> bool {
        op::any(self.index)
    }
}

impl<T: JitScalar> Clone for Array<T> {
    fn clone(&self) -> Self {
        Self::from_index(self.index)
    }
}

impl<T: JitScalar> Drop for Array<T> {
    fn drop(&mut self) {
        var::dec_ref(self.index);
    }
}

impl<T: JitScalar> fmt::Display for Array<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.index == 0 {
            return write!(f, "[]");
        }
        write!(f, "{}", var::to_str(self.index))
    }
}

impl<T: JitScalar> fmt::Debug for Array<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Array<{}>(r{})", T::VTYPE.name(), self.index)
    }
}

// The owned-value operator forms forward to the by-reference ones.
macro_rules! impl_binary_operators {
    ($($trait:ident :: $method:ident => $op:path),* $(,)?) => {$(
        impl<T: JitScalar> std::ops::$trait for &Array<T> {
            type Output = Array<T>;

            fn $method(self, rhs: Self) -> Array<T> {
                Array::steal($op(self.index, rhs.index))
            }
        }

        impl<T: JitScalar> std::ops::$trait for Array<T> {
            type Output = Array<T>;

            fn $method(self, rhs: Self) -> Array<T> {
                std::ops::$trait::$method(&self, &rhs)
            }
        }

        impl<T: JitScalar> std::ops::$trait<&Array<T>> for Array<T> {
            type Output = Array<T>;

            fn $method(self, rhs: &Array<T>) -> Array<T> {
                std::ops::$trait::$method(&self, rhs)
            }
        }

        impl<T: JitScalar> std::ops::$trait<Array<T>> for &Array<T> {
            type Output = Array<T>;

            fn $method(self, rhs: Array<T>) -> Array<T> {
                std::ops::$trait::$method(self, &rhs)
            }
        }
    )*};
}

impl_binary_operators!(
    Add::add => op::add,
    Sub::sub => op::sub,
    Mul::mul => op::mul,
    Div::div => op::div,
    Rem::rem => op::modulo,
    BitAnd::bitand => op::and,
    BitOr::bitor => op::or,
    BitXor::bitxor => op::xor,
    Shl::shl => op::shl,
    Shr::shr => op::shr,
);

impl<T: JitScalar> std::ops::Neg for &Array<T> {
    type Output = Array<T>;

    fn neg(self) -> Array<T> {
        Array::steal(op::neg(self.index))
    }
}

impl<T: JitScalar> std::ops::Neg for Array<T> {
    type Output = Array<T>;

    fn neg(self) -> Array<T> {
        -&self
    }
}

impl<T: JitScalar> std::ops::Not for &Array<T> {
    type Output = Array<T>;

    fn not(self) -> Array<T> {
        Array::steal(op::not(self.index))
    }
}

impl<T: JitScalar> std::ops::Not for Array<T> {
    type Output = Array<T>;

    fn not(self) -> Array<T> {
        !&self
    }
}

impl<T: JitScalar> std::ops::AddAssign<&Array<T>> for Array<T> {
    fn add_assign(&mut self, rhs: &Array<T>) {
        *self = &*self + rhs;
    }
}

impl<T: JitScalar> std::ops::AddAssign<Array<T>> for Array<T> {
    fn add_assign(&mut self, rhs: Array<T>) {
        *self = &*self + &rhs;
    }
}
