//! Typed operation constructors.
//!
//! Every function here appends one node to the computation graph (or
//! returns an existing id when local value numbering finds an equivalent
//! expression) and returns a new external reference. Nothing executes;
//! execution happens at the next `eval()`.
//!
//! Shared contract of all constructors:
//! 1. all-zero operand ids are a no-op (result 0); a mix of zero and
//!    non-zero ids is an error,
//! 2. operand sizes must broadcast (scalars combine with any size),
//! 3. a dirty operand forces evaluation of the pending work first,
//! 4. operand references are acquired eagerly and rolled back on LVN hits.

use log::debug;

use crate::state::{with_lock, with_ts, JitBackend, Lock};
use crate::var::{
    self, eval_var_impl, flush_if_dirty, literal_impl, mark_side_effect_impl, pointer_impl,
    ReduceOp, VarId, VarKind, Variable,
};
use crate::vtype::VarType;

// ====================================================================
// Construction helper
// ====================================================================

/// Validate operands, flush dirty dependencies, then append a node of the
/// given kind. `vtype` is the result type; the size is inferred as the
/// broadcast of the operand sizes.
fn new_node(
    lock: &mut Lock,
    kind: VarKind,
    vtype: VarType,
    literal: u64,
    deps: &[VarId],
) -> VarId {
    debug_assert!(!deps.is_empty() && deps.len() <= 4);

    if deps.iter().all(|&d| d == 0) {
        return 0;
    }
    if deps.iter().any(|&d| d == 0) {
        panic!(
            "{}(): arithmetic involving an uninitialized variable!",
            kind.name()
        );
    }

    let backend = lock.st().var(deps[0]).backend;
    flush_if_dirty(lock, backend, deps);

    let st = lock.st();
    let mut size = 0u32;
    let mut tsize = 1u32;
    let mut symbolic = false;
    for &d in deps {
        let vd = st.var(d);
        if vd.backend != backend {
            panic!(
                "{}(): operands span multiple backends ({} and {})!",
                kind.name(),
                backend.name(),
                vd.backend.name()
            );
        }
        if vd.size != 1 && size > 1 && vd.size != size {
            panic!(
                "{}(): arithmetic involving arrays of incompatible size ({} and {})!",
                kind.name(),
                size,
                vd.size
            );
        }
        size = size.max(vd.size);
        tsize = tsize.saturating_add(vd.tsize);
        symbolic |= vd.symbolic;
    }

    let mut v = Variable::new(backend, kind, vtype, size);
    v.literal = literal;
    v.tsize = tsize;
    v.symbolic = symbolic || st.flags.recording_vcall;
    for (slot, &d) in deps.iter().enumerate() {
        v.dep[slot] = d;
        st.inc_ref_int(d);
    }

    let (id, reused) = st.var_new(v, false);
    st.inc_ref_ext(id);
    debug!(
        "{}({id} <- {deps:?}): {}{}",
        kind.name(),
        vtype.name(),
        if reused { " (reused)" } else { "" }
    );
    id
}

/// Return `id` itself as the result of a simplified operation (a fresh
/// external reference on an existing node).
fn forward(lock: &mut Lock, id: VarId) -> VarId {
    lock.st().inc_ref_ext(id);
    id
}

fn is_zero_scalar(lock: &mut Lock, id: VarId) -> bool {
    let v = lock.st().var(id);
    v.is_literal_zero && v.size == 1
}

fn is_one_scalar(lock: &mut Lock, id: VarId) -> bool {
    let v = lock.st().var(id);
    v.is_literal_one && v.size == 1
}

fn check_same_type(lock: &mut Lock, op: &str, a: VarId, b: VarId) -> VarType {
    let st = lock.st();
    let (ta, tb) = (st.var(a).vtype, st.var(b).vtype);
    if ta != tb {
        panic!(
            "{op}(): operands have incompatible types ({} and {})!",
            ta.name(),
            tb.name()
        );
    }
    ta
}

fn expect_arithmetic(op: &str, vtype: VarType) {
    if matches!(vtype, VarType::Void | VarType::Bool | VarType::Pointer) {
        panic!("{op}(): unsupported operand type {}!", vtype.name());
    }
}

fn expect_int(op: &str, vtype: VarType) {
    if !vtype.is_int() || vtype == VarType::Pointer {
        panic!("{op}(): expected an integer operand, got {}!", vtype.name());
    }
}

fn expect_float(op: &str, vtype: VarType) {
    if !vtype.is_float() {
        panic!(
            "{op}(): expected a floating point operand, got {}!",
            vtype.name()
        );
    }
}

// ====================================================================
// Unary operations
// ====================================================================

pub(crate) fn neg_impl(lock: &mut Lock, a: VarId) -> VarId {
    if a == 0 {
        return 0;
    }
    let vtype = lock.st().var(a).vtype;
    expect_arithmetic("neg", vtype);
    new_node(lock, VarKind::Neg, vtype, 0, &[a])
}

pub(crate) fn not_impl(lock: &mut Lock, a: VarId) -> VarId {
    if a == 0 {
        return 0;
    }
    let vtype = lock.st().var(a).vtype;
    if !vtype.is_int() && !vtype.is_bool() {
        panic!(
            "not(): expected an integer or mask operand, got {}!",
            vtype.name()
        );
    }
    new_node(lock, VarKind::Not, vtype, 0, &[a])
}

macro_rules! float_unop {
    ($name:ident, $kind:ident, $opname:literal) => {
        pub(crate) fn $name(lock: &mut Lock, a: VarId) -> VarId {
            if a == 0 {
                return 0;
            }
            let vtype = lock.st().var(a).vtype;
            expect_float($opname, vtype);
            new_node(lock, VarKind::$kind, vtype, 0, &[a])
        }
    };
}

float_unop!(sqrt_impl, Sqrt, "sqrt");
float_unop!(ceil_impl, Ceil, "ceil");
float_unop!(floor_impl, Floor, "floor");
float_unop!(round_impl, Round, "round");
float_unop!(trunc_impl, Trunc, "trunc");

pub(crate) fn abs_impl(lock: &mut Lock, a: VarId) -> VarId {
    if a == 0 {
        return 0;
    }
    let vtype = lock.st().var(a).vtype;
    expect_arithmetic("abs", vtype);
    if vtype.is_uint() {
        return forward(lock, a);
    }
    new_node(lock, VarKind::Abs, vtype, 0, &[a])
}

macro_rules! int_unop {
    ($name:ident, $kind:ident, $opname:literal) => {
        pub(crate) fn $name(lock: &mut Lock, a: VarId) -> VarId {
            if a == 0 {
                return 0;
            }
            let vtype = lock.st().var(a).vtype;
            expect_int($opname, vtype);
            new_node(lock, VarKind::$kind, vtype, 0, &[a])
        }
    };
}

int_unop!(popc_impl, Popc, "popc");
int_unop!(clz_impl, Clz, "clz");
int_unop!(ctz_impl, Ctz, "ctz");

// ====================================================================
// Binary operations
// ====================================================================

pub(crate) fn add_impl(lock: &mut Lock, a: VarId, b: VarId) -> VarId {
    if a == 0 && b == 0 {
        return 0;
    }
    let vtype = check_same_type(lock, "add", a, b);
    expect_arithmetic("add", vtype);
    if is_zero_scalar(lock, a) {
        return forward(lock, b);
    }
    if is_zero_scalar(lock, b) {
        return forward(lock, a);
    }
    new_node(lock, VarKind::Add, vtype, 0, &[a, b])
}

pub(crate) fn sub_impl(lock: &mut Lock, a: VarId, b: VarId) -> VarId {
    if a == 0 && b == 0 {
        return 0;
    }
    let vtype = check_same_type(lock, "sub", a, b);
    expect_arithmetic("sub", vtype);
    if is_zero_scalar(lock, b) {
        return forward(lock, a);
    }
    new_node(lock, VarKind::Sub, vtype, 0, &[a, b])
}

pub(crate) fn mul_impl(lock: &mut Lock, a: VarId, b: VarId) -> VarId {
    if a == 0 && b == 0 {
        return 0;
    }
    let vtype = check_same_type(lock, "mul", a, b);
    expect_arithmetic("mul", vtype);
    if is_one_scalar(lock, a) {
        return forward(lock, b);
    }
    if is_one_scalar(lock, b) {
        return forward(lock, a);
    }
    new_node(lock, VarKind::Mul, vtype, 0, &[a, b])
}

pub(crate) fn div_impl(lock: &mut Lock, a: VarId, b: VarId) -> VarId {
    if a == 0 && b == 0 {
        return 0;
    }
    let vtype = check_same_type(lock, "div", a, b);
    expect_arithmetic("div", vtype);
    if is_one_scalar(lock, b) {
        return forward(lock, a);
    }
    new_node(lock, VarKind::Div, vtype, 0, &[a, b])
}

pub(crate) fn mod_impl(lock: &mut Lock, a: VarId, b: VarId) -> VarId {
    if a == 0 && b == 0 {
        return 0;
    }
    let vtype = check_same_type(lock, "mod", a, b);
    expect_int("mod", vtype);
    new_node(lock, VarKind::Mod, vtype, 0, &[a, b])
}

pub(crate) fn mulhi_impl(lock: &mut Lock, a: VarId, b: VarId) -> VarId {
    if a == 0 && b == 0 {
        return 0;
    }
    let vtype = check_same_type(lock, "mulhi", a, b);
    expect_int("mulhi", vtype);
    new_node(lock, VarKind::Mulhi, vtype, 0, &[a, b])
}

pub(crate) fn min_impl(lock: &mut Lock, a: VarId, b: VarId) -> VarId {
    if a == 0 && b == 0 {
        return 0;
    }
    let vtype = check_same_type(lock, "min", a, b);
    expect_arithmetic("min", vtype);
    new_node(lock, VarKind::Min, vtype, 0, &[a, b])
}

pub(crate) fn max_impl(lock: &mut Lock, a: VarId, b: VarId) -> VarId {
    if a == 0 && b == 0 {
        return 0;
    }
    let vtype = check_same_type(lock, "max", a, b);
    expect_arithmetic("max", vtype);
    new_node(lock, VarKind::Max, vtype, 0, &[a, b])
}

pub(crate) fn fma_impl(lock: &mut Lock, a: VarId, b: VarId, c: VarId) -> VarId {
    if a == 0 && b == 0 && c == 0 {
        return 0;
    }
    let vtype = check_same_type(lock, "fma", a, b);
    check_same_type(lock, "fma", a, c);
    expect_arithmetic("fma", vtype);
    if is_one_scalar(lock, a) {
        return add_impl(lock, b, c);
    }
    if is_one_scalar(lock, b) {
        return add_impl(lock, a, c);
    }
    if is_zero_scalar(lock, c) {
        return mul_impl(lock, a, b);
    }
    new_node(lock, VarKind::Fma, vtype, 0, &[a, b, c])
}

macro_rules! compare_op {
    ($name:ident, $kind:ident, $opname:literal) => {
        pub(crate) fn $name(lock: &mut Lock, a: VarId, b: VarId) -> VarId {
            if a == 0 && b == 0 {
                return 0;
            }
            check_same_type(lock, $opname, a, b);
            new_node(lock, VarKind::$kind, VarType::Bool, 0, &[a, b])
        }
    };
}

compare_op!(eq_impl, Eq, "eq");
compare_op!(neq_impl, Neq, "neq");
compare_op!(lt_impl, Lt, "lt");
compare_op!(le_impl, Le, "le");
compare_op!(gt_impl, Gt, "gt");
compare_op!(ge_impl, Ge, "ge");

pub(crate) fn and_impl(lock: &mut Lock, a: VarId, b: VarId) -> VarId {
    if a == 0 && b == 0 {
        return 0;
    }
    // `x & mask` with mismatched types is a masked keep/clear.
    let (ta, tb) = {
        let st = lock.st();
        (st.var(a).vtype, st.var(b).vtype)
    };
    if ta != tb && tb != VarType::Bool {
        panic!(
            "and(): operands have incompatible types ({} and {})!",
            ta.name(),
            tb.name()
        );
    }
    if tb == VarType::Bool && is_one_scalar(lock, b) {
        return forward(lock, a);
    }
    new_node(lock, VarKind::And, ta, 0, &[a, b])
}

pub(crate) fn or_impl(lock: &mut Lock, a: VarId, b: VarId) -> VarId {
    if a == 0 && b == 0 {
        return 0;
    }
    let (ta, tb) = {
        let st = lock.st();
        (st.var(a).vtype, st.var(b).vtype)
    };
    if ta != tb && tb != VarType::Bool {
        panic!(
            "or(): operands have incompatible types ({} and {})!",
            ta.name(),
            tb.name()
        );
    }
    if tb == VarType::Bool && is_zero_scalar(lock, b) {
        return forward(lock, a);
    }
    new_node(lock, VarKind::Or, ta, 0, &[a, b])
}

pub(crate) fn xor_impl(lock: &mut Lock, a: VarId, b: VarId) -> VarId {
    if a == 0 && b == 0 {
        return 0;
    }
    let vtype = check_same_type(lock, "xor", a, b);
    new_node(lock, VarKind::Xor, vtype, 0, &[a, b])
}

pub(crate) fn shl_impl(lock: &mut Lock, a: VarId, b: VarId) -> VarId {
    if a == 0 && b == 0 {
        return 0;
    }
    let vtype = check_same_type(lock, "shl", a, b);
    expect_int("shl", vtype);
    new_node(lock, VarKind::Shl, vtype, 0, &[a, b])
}

pub(crate) fn shr_impl(lock: &mut Lock, a: VarId, b: VarId) -> VarId {
    if a == 0 && b == 0 {
        return 0;
    }
    let vtype = check_same_type(lock, "shr", a, b);
    expect_int("shr", vtype);
    new_node(lock, VarKind::Shr, vtype, 0, &[a, b])
}

// ====================================================================
// Select, casts
// ====================================================================

pub(crate) fn select_impl(lock: &mut Lock, mask: VarId, t: VarId, f: VarId) -> VarId {
    if mask == 0 && t == 0 && f == 0 {
        return 0;
    }
    {
        let st = lock.st();
        let mt = st.var(mask).vtype;
        if mt != VarType::Bool {
            panic!("select(): mask operand must be of type bool, got {}!", mt.name());
        }
    }
    let _ = check_same_type(lock, "select", t, f);
    if t == f {
        return forward(lock, t);
    }
    if is_one_scalar(lock, mask) {
        return forward(lock, t);
    }
    if is_zero_scalar(lock, mask) {
        return forward(lock, f);
    }
    let vtype = lock.st().var(t).vtype;
    new_node(lock, VarKind::Select, vtype, 0, &[mask, t, f])
}

/// Numeric conversion between element types.
pub(crate) fn cast_impl(lock: &mut Lock, a: VarId, target: VarType) -> VarId {
    if a == 0 {
        return 0;
    }
    let source = lock.st().var(a).vtype;
    if source == target {
        return forward(lock, a);
    }
    let convertible = |t: VarType| (t.is_int() && t != VarType::Pointer) || t.is_float() || t.is_bool();
    if !convertible(source) || !convertible(target) {
        panic!(
            "cast(): invalid conversion from {} to {}!",
            source.name(),
            target.name()
        );
    }
    new_node(lock, VarKind::Cast, target, 0, &[a])
}

/// Reinterpret the bits of a variable as another type of equal width.
pub(crate) fn bitcast_impl(lock: &mut Lock, a: VarId, target: VarType) -> VarId {
    if a == 0 {
        return 0;
    }
    let source = lock.st().var(a).vtype;
    if source != target && source.size() != target.size() {
        panic!(
            "bitcast(): invalid reinterpretation from {} ({} bytes) to {} ({} bytes)!",
            source.name(),
            source.size(),
            target.name(),
            target.size()
        );
    }
    new_node(lock, VarKind::Bitcast, target, 0, &[a])
}

// ====================================================================
// Memory operations
// ====================================================================

/// Evaluate `target` and wrap its storage as a pointer variable.
fn pointer_to(lock: &mut Lock, target: VarId) -> VarId {
    eval_var_impl(lock, target);
    let st = lock.st();
    let v = st.var(target);
    let (backend, data) = (v.backend, v.data);
    pointer_impl(st, backend, data, target)
}

/// Indexed read: `result[lane] = source[index[lane]]` for active lanes.
pub(crate) fn gather_impl(lock: &mut Lock, source: VarId, index: VarId, mask: VarId) -> VarId {
    if source == 0 || index == 0 || mask == 0 {
        panic!("gather(): arithmetic involving an uninitialized variable!");
    }
    {
        let st = lock.st();
        expect_int("gather", st.var(index).vtype);
    }
    let vtype = lock.st().var(source).vtype;
    let ptr = pointer_to(lock, source);
    let id = new_node(lock, VarKind::Gather, vtype, 0, &[ptr, index, mask]);
    lock.st().dec_ref_ext(ptr);
    id
}

/// Indexed write: `target[index[lane]] = value[lane]` (or a read-modify-
/// write reduction) for active lanes. The target is marked dirty; reading
/// it before the next evaluation forces a flush.
pub(crate) fn scatter_impl(
    lock: &mut Lock,
    target: VarId,
    value: VarId,
    index: VarId,
    mask: VarId,
    reduce: ReduceOp,
) -> VarId {
    if target == 0 || value == 0 || index == 0 || mask == 0 {
        panic!("scatter(): arithmetic involving an uninitialized variable!");
    }
    {
        let st = lock.st();
        let tt = st.var(target).vtype;
        let tv = st.var(value).vtype;
        if tt != tv {
            panic!(
                "scatter(): target type {} does not match value type {}!",
                tt.name(),
                tv.name()
            );
        }
        expect_int("scatter", st.var(index).vtype);
        if reduce != ReduceOp::None && tv.is_bool() {
            panic!("scatter(): mask arrays do not support reductions!");
        }
    }

    let ptr = pointer_to(lock, target);
    let id = new_node(
        lock,
        VarKind::Scatter,
        VarType::Void,
        reduce as u64,
        &[ptr, value, index, mask],
    );
    let st = lock.st();
    st.dec_ref_ext(ptr);
    mark_side_effect_impl(st, id, target);
    // The side-effect reference keeps the node alive until the next
    // evaluation; the construction-time handle is not needed.
    st.dec_ref_ext(id);
    id
}

/// Atomic fetch-and-increment of `target[index[lane]]` per active lane;
/// returns the pre-increment values. Lanes addressing the same cell
/// receive consecutive results.
pub(crate) fn scatter_inc_impl(lock: &mut Lock, target: VarId, index: VarId, mask: VarId) -> VarId {
    if target == 0 || index == 0 || mask == 0 {
        panic!("scatter_inc(): arithmetic involving an uninitialized variable!");
    }
    {
        let st = lock.st();
        let tt = st.var(target).vtype;
        if tt != VarType::UInt32 {
            panic!("scatter_inc(): target must be of type uint32, got {}!", tt.name());
        }
        expect_int("scatter_inc", st.var(index).vtype);
    }
    let ptr = pointer_to(lock, target);
    let id = new_node(lock, VarKind::ScatterInc, VarType::UInt32, 0, &[ptr, index, mask]);
    let st = lock.st();
    st.dec_ref_ext(ptr);
    // Unlike a plain scatter, the node also produces a value; the caller
    // keeps the construction-time handle in addition to the side-effect
    // reference.
    mark_side_effect_impl(st, id, target);
    id
}

/// Contiguous masked read of an evaluated variable.
pub(crate) fn load_impl(lock: &mut Lock, source: VarId, mask: VarId) -> VarId {
    if source == 0 || mask == 0 {
        panic!("load(): arithmetic involving an uninitialized variable!");
    }
    let (vtype, size) = {
        let v = lock.st().var(source);
        (v.vtype, v.size)
    };
    let ptr = pointer_to(lock, source);
    let mask = mask_resize(lock, mask, size);
    let id = new_node(lock, VarKind::Load, vtype, 0, &[ptr, mask]);
    let st = lock.st();
    st.dec_ref_ext(ptr);
    st.dec_ref_ext(mask);
    id
}

/// Contiguous masked write into an evaluated variable.
pub(crate) fn store_impl(lock: &mut Lock, target: VarId, value: VarId, mask: VarId) -> VarId {
    if target == 0 || value == 0 || mask == 0 {
        panic!("store(): arithmetic involving an uninitialized variable!");
    }
    {
        let st = lock.st();
        let tt = st.var(target).vtype;
        let tv = st.var(value).vtype;
        if tt != tv {
            panic!(
                "store(): target type {} does not match value type {}!",
                tt.name(),
                tv.name()
            );
        }
    }
    let ptr = pointer_to(lock, target);
    let id = new_node(lock, VarKind::Store, VarType::Void, 0, &[ptr, value, mask]);
    let st = lock.st();
    st.dec_ref_ext(ptr);
    mark_side_effect_impl(st, id, target);
    st.dec_ref_ext(id);
    id
}

// ====================================================================
// Masks
// ====================================================================

/// Mask covering the first `size` lanes (`index < end` in the top-level
/// kernel loop).
pub(crate) fn default_mask_impl(lock: &mut Lock, backend: JitBackend, size: u32) -> VarId {
    let counter = var::counter_impl(lock.st(), backend, size);
    let id = new_node(lock, VarKind::DefaultMask, VarType::Bool, 0, &[counter]);
    lock.st().dec_ref_ext(counter);
    id
}

fn mask_resize(lock: &mut Lock, mask: VarId, size: u32) -> VarId {
    if lock.st().var(mask).size == size {
        return forward(lock, mask);
    }
    var::resize_impl(lock, mask, size)
}

/// Push an active mask for subsequently recorded operations.
pub(crate) fn mask_push_impl(lock: &mut Lock, backend: JitBackend, mask: VarId) {
    lock.st().inc_ref_ext(mask);
    with_ts(backend, |ts| ts.mask_stack.push(mask));
}

/// Pop the innermost active mask.
pub(crate) fn mask_pop_impl(lock: &mut Lock, backend: JitBackend) {
    let mask = with_ts(backend, |ts| ts.mask_stack.pop());
    match mask {
        Some(mask) => lock.st().dec_ref_ext(mask),
        None => panic!("mask_pop(): stack underflow!"),
    }
}

/// Innermost active mask, or 0 when the stack is empty.
pub(crate) fn mask_peek_impl(lock: &mut Lock, backend: JitBackend) -> VarId {
    let mask = with_ts(backend, |ts| ts.mask_stack.last().copied());
    match mask {
        Some(mask) => forward(lock, mask),
        None => 0,
    }
}

/// Combine `mask` with the innermost active mask (or broadcast it to the
/// given wavefront size when the stack is empty).
pub(crate) fn mask_apply_impl(lock: &mut Lock, mask: VarId, size: u32) -> VarId {
    let backend = lock.st().var(mask).backend;
    let top = with_ts(backend, |ts| ts.mask_stack.last().copied());
    match top {
        Some(top) => and_impl(lock, mask, top),
        None => mask_resize(lock, mask, size),
    }
}

// ====================================================================
// Printf
// ====================================================================

/// Print per-lane values from inside a kernel (CUDA only): packs the
/// arguments into a local byte buffer and calls `vprintf`. Queued as a
/// side effect; the output appears at the next evaluation.
pub(crate) fn printf_impl(lock: &mut Lock, fmt_str: &str, args: &[VarId]) {
    if args.len() > 3 {
        panic!("printf(): at most 3 arguments are supported!");
    }
    let backend = if args.is_empty() {
        JitBackend::Cuda
    } else {
        lock.st().var(args[0]).backend
    };
    if backend != JitBackend::Cuda {
        panic!("printf(): only supported on the cuda backend!");
    }

    let mut text = String::from("{\n        .global .align 1 .b8 fmt[] = { ");
    for (i, byte) in fmt_str.bytes().chain(std::iter::once(0)).enumerate() {
        if i > 0 {
            text.push_str(", ");
        }
        text.push_str(&byte.to_string());
    }
    text.push_str(" };\n");
    text.push_str(&format!("        .local .align 8 .b8 buf[{}];\n", 8 * args.len().max(1)));

    let mut offset = 0usize;
    for (i, &arg) in args.iter().enumerate() {
        let vtype = lock.st().var(arg).vtype;
        // vprintf promotes single-precision floats to double.
        let size = if vtype == VarType::Float32 { 8 } else { vtype.size().max(4) };
        offset = (offset + size - 1) / size * size;
        if vtype == VarType::Float32 {
            text.push_str(&format!(
                "        cvt.f64.f32 %d0, $r{};\n        st.local.f64 [buf+{offset}], %d0;\n",
                i + 1
            ));
        } else {
            text.push_str(&format!(
                "        st.local.$t{} [buf+{offset}], $r{};\n",
                i + 1,
                i + 1
            ));
        }
        offset += size;
    }

    text.push_str(
        "        .reg.b64 %fmt_r, %buf_r;\n\
         \x20       cvta.global.u64 %fmt_r, fmt;\n\
         \x20       cvta.local.u64 %buf_r, buf;\n\
         \x20       {\n\
         \x20           .param .b64 fmt_p;\n\
         \x20           .param .b64 buf_p;\n\
         \x20           .param .b32 rv_p;\n\
         \x20           st.param.b64 [fmt_p], %fmt_r;\n\
         \x20           st.param.b64 [buf_p], %buf_r;\n\
         \x20           call (rv_p), vprintf, (fmt_p, buf_p);\n\
         \x20       }\n\
         \x20   }",
    );

    let decl = var::global_impl(
        lock.st(),
        backend,
        ".extern .func (.param .b32 rv) vprintf (.param .b64 fmt, .param .b64 buf);",
    );

    let mut deps: Vec<VarId> = args.to_vec();
    deps.push(decl);
    let id = var::stmt_impl(lock, backend, VarType::Void, &text, &deps);

    let st = lock.st();
    st.dec_ref_ext(decl);
    mark_side_effect_impl(st, id, 0);
    st.dec_ref_ext(id);
}

pub fn printf(fmt_str: &str, args: &[VarId]) {
    with_lock(|lock| printf_impl(lock, fmt_str, args))
}

// ====================================================================
// Reductions
// ====================================================================

/// Reduce an evaluated variable to a single element using the backend's
/// reduction fallback (outside the main codegen path).
pub(crate) fn reduce_impl(lock: &mut Lock, id: VarId, op: ReduceOp) -> VarId {
    if id == 0 {
        return 0;
    }
    eval_var_impl(lock, id);
    let (backend, vtype, data, size, engine) = {
        let st = lock.st();
        let v = st.var(id);
        (v.backend, v.vtype, v.data, v.size, st.engine(v.backend))
    };
    let out = lock.unlocked(|| engine.reduce(vtype, op, data, size));
    let bits = match out {
        Ok(bits) => bits,
        Err(err) => panic!("reduce(): {err}"),
    };
    literal_impl(lock.st(), backend, vtype, bits, 1, true)
}

fn expect_mask_var(lock: &mut Lock, op: &str, id: VarId) {
    let vtype = lock.st().var(id).vtype;
    if vtype != VarType::Bool {
        panic!("{op}(): expected a mask array, got {}!", vtype.name());
    }
}

/// Horizontal AND of a mask array; synchronizes.
pub(crate) fn all_impl(lock: &mut Lock, id: VarId) -> bool {
    expect_mask_var(lock, "all", id);
    let r = reduce_impl(lock, id, ReduceOp::And);
    let bits = var::read_impl(lock, r, 0);
    lock.st().dec_ref_ext(r);
    bits != 0
}

/// Horizontal OR of a mask array; synchronizes.
pub(crate) fn any_impl(lock: &mut Lock, id: VarId) -> bool {
    expect_mask_var(lock, "any", id);
    let r = reduce_impl(lock, id, ReduceOp::Or);
    let bits = var::read_impl(lock, r, 0);
    lock.st().dec_ref_ext(r);
    bits != 0
}

// ====================================================================
// Public API
// ====================================================================

macro_rules! public_unary {
    ($($name:ident => $impl:ident),* $(,)?) => {$(
        pub fn $name(a: VarId) -> VarId {
            with_lock(|lock| $impl(lock, a))
        }
    )*};
}

macro_rules! public_binary {
    ($($name:ident => $impl:ident),* $(,)?) => {$(
        pub fn $name(a: VarId, b: VarId) -> VarId {
            with_lock(|lock| $impl(lock, a, b))
        }
    )*};
}

public_unary!(
    neg => neg_impl, not => not_impl, sqrt => sqrt_impl, abs => abs_impl,
    ceil => ceil_impl, floor => floor_impl, round => round_impl,
    trunc => trunc_impl, popc => popc_impl, clz => clz_impl, ctz => ctz_impl,
);

public_binary!(
    add => add_impl, sub => sub_impl, mul => mul_impl, div => div_impl,
    modulo => mod_impl, mulhi => mulhi_impl, min => min_impl, max => max_impl,
    eq => eq_impl, neq => neq_impl, lt => lt_impl, le => le_impl,
    gt => gt_impl, ge => ge_impl, and => and_impl, or => or_impl,
    xor => xor_impl, shl => shl_impl, shr => shr_impl,
);

pub fn fma(a: VarId, b: VarId, c: VarId) -> VarId {
    with_lock(|lock| fma_impl(lock, a, b, c))
}

pub fn select(mask: VarId, t: VarId, f: VarId) -> VarId {
    with_lock(|lock| select_impl(lock, mask, t, f))
}

pub fn cast(a: VarId, target: VarType) -> VarId {
    with_lock(|lock| cast_impl(lock, a, target))
}

pub fn bitcast(a: VarId, target: VarType) -> VarId {
    with_lock(|lock| bitcast_impl(lock, a, target))
}

pub fn gather(source: VarId, index: VarId, mask: VarId) -> VarId {
    with_lock(|lock| gather_impl(lock, source, index, mask))
}

/// Scatter `value` into `target` at `index`, optionally combining with a
/// reduction. The queued side effect stays alive through its side-effect
/// reference until the next evaluation.
pub fn scatter(target: VarId, value: VarId, index: VarId, mask: VarId, reduce: ReduceOp) {
    with_lock(|lock| {
        scatter_impl(lock, target, value, index, mask, reduce);
    })
}

pub fn scatter_inc(target: VarId, index: VarId, mask: VarId) -> VarId {
    with_lock(|lock| scatter_inc_impl(lock, target, index, mask))
}

pub fn load(source: VarId, mask: VarId) -> VarId {
    with_lock(|lock| load_impl(lock, source, mask))
}

pub fn store(target: VarId, value: VarId, mask: VarId) {
    with_lock(|lock| {
        store_impl(lock, target, value, mask);
    })
}

pub fn default_mask(backend: JitBackend, size: u32) -> VarId {
    with_lock(|lock| default_mask_impl(lock, backend, size))
}

pub fn mask_push(backend: JitBackend, mask: VarId) {
    with_lock(|lock| mask_push_impl(lock, backend, mask))
}

pub fn mask_pop(backend: JitBackend) {
    with_lock(|lock| mask_pop_impl(lock, backend))
}

pub fn mask_peek(backend: JitBackend) -> VarId {
    with_lock(|lock| mask_peek_impl(lock, backend))
}

pub fn mask_apply(mask: VarId, size: u32) -> VarId {
    with_lock(|lock| mask_apply_impl(lock, mask, size))
}

pub fn reduce(id: VarId, op: ReduceOp) -> VarId {
    with_lock(|lock| reduce_impl(lock, id, op))
}

pub fn all(id: VarId) -> bool {
    with_lock(|lock| all_impl(lock, id))
}

pub fn any(id: VarId) -> bool {
    with_lock(|lock| any_impl(lock, id))
}
