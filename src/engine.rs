//! Execution engines: the opaque compile/launch contract behind the
//! evaluator.
//!
//! The emitters always produce backend assembly, and its text is the
//! kernel cache key no matter which engine runs the kernel. The engine
//! merely decides *how* a scheduled program executes:
//!
//! - [`InterpEngine`] (always available) executes the scheduled kernel
//!   program element-wise on the host. It stands in for the LLVM JIT /
//!   CUDA driver on machines without them and keeps the full pipeline
//!   (scheduling, codegen, caching, launching) testable.
//! - `ClangEngine` (feature `clang`) pipes the emitted LLVM IR through an
//!   external `clang -shared` and loads the kernel symbol.
//! - `CudaEngine` (feature `cuda`) loads the emitted PTX through the CUDA
//!   driver API.

use std::any::Any;
use std::sync::Arc;

use crate::error::{JitError, Result};
use crate::kernel::{CompileClass, CompiledKernel, EmitVar, KernelProgram, ParamKind, NO_REG};
use crate::state::JitBackend;
use crate::var::{ReduceOp, VarKind};
use crate::vtype::{f16_to_f32, f32_to_f16, VarType};

#[cfg(feature = "clang")]
pub mod clang;
#[cfg(feature = "cuda")]
pub mod cuda;

/// Backend compiler/driver contract: `compile`, `launch`, the `reduce`
/// fallback, and the stream-event fabric used for cross-stream ordering.
pub trait Engine: Send + Sync {
    fn backend(&self) -> JitBackend;

    /// Compile an emitted kernel. `ir` is the assembly text (also the
    /// cache key); `program` is the backend-neutral schedule snapshot.
    fn compile(
        &self,
        ir: &str,
        program: &KernelProgram,
    ) -> Result<(Arc<dyn CompiledKernel>, CompileClass)>;

    /// Launch a compiled kernel over `size` elements. `params` holds one
    /// pointer per parameter slot, in emission order.
    fn launch(
        &self,
        kernel: &dyn CompiledKernel,
        size: u32,
        params: &[*mut u8],
        stream: u32,
    ) -> Result<()>;

    /// Reduction fallback used outside the main codegen path.
    fn reduce(&self, vtype: VarType, op: ReduceOp, data: *const u8, size: u32) -> Result<u64>;

    /// Record an event on `stream` (cross-stream ordering fabric).
    fn event_record(&self, _stream: u32) {}

    /// Make `stream` wait for the last event recorded on `event_stream`.
    fn stream_wait_event(&self, _stream: u32, _event_stream: u32) {}

    /// Block until `stream` has drained.
    fn sync_stream(&self, _stream: u32) {}
}

// ====================================================================
// Interpreter engine
// ====================================================================

/// Executes scheduled kernel programs element-wise on the host.
///
/// Execution is synchronous, so the stream/event hooks are no-ops and
/// `HostAsync`/`Device` allocations are plain host memory.
pub struct InterpEngine {
    backend: JitBackend,
}

impl InterpEngine {
    pub fn new(backend: JitBackend) -> Self {
        Self { backend }
    }
}

struct InterpKernel {
    ops: Vec<EmitVar>,
}

impl CompiledKernel for InterpKernel {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Engine for InterpEngine {
    fn backend(&self) -> JitBackend {
        self.backend
    }

    fn compile(
        &self,
        _ir: &str,
        program: &KernelProgram,
    ) -> Result<(Arc<dyn CompiledKernel>, CompileClass)> {
        for op in &program.ops {
            if let Some(reason) = unsupported(op) {
                return Err(JitError::Unsupported(reason));
            }
        }
        Ok((
            Arc::new(InterpKernel {
                ops: program.ops.clone(),
            }),
            CompileClass::Soft,
        ))
    }

    fn launch(
        &self,
        kernel: &dyn CompiledKernel,
        size: u32,
        params: &[*mut u8],
        _stream: u32,
    ) -> Result<()> {
        let kernel = kernel
            .as_any()
            .downcast_ref::<InterpKernel>()
            .ok_or_else(|| JitError::LaunchFailed("foreign kernel handle".into()))?;
        run_program(&kernel.ops, size, params);
        Ok(())
    }

    fn reduce(&self, vtype: VarType, op: ReduceOp, data: *const u8, size: u32) -> Result<u64> {
        Ok(reduce_buffer(vtype, op, data, size))
    }
}

fn unsupported(op: &EmitVar) -> Option<String> {
    match op.kind {
        VarKind::Stmt => Some(format!(
            "the interpreter engine cannot execute legacy IR statements (r{})",
            op.id
        )),
        VarKind::ScatterKahan | VarKind::TraceRay => {
            Some(format!("{} lowering is not finalized", op.kind.name()))
        }
        VarKind::CallStart | VarKind::CallMask | VarKind::CallSelf | VarKind::CallOutput
        | VarKind::LoopStart | VarKind::LoopCond | VarKind::LoopEnd | VarKind::LoopPhi
        | VarKind::LoopOutput | VarKind::Extract => Some(format!(
            "recorded subroutines require a JIT engine ({} node r{})",
            op.kind.name(),
            op.id
        )),
        _ => None,
    }
}

// --------------------------------------------------------------------
// Scalar semantics
// --------------------------------------------------------------------

/// Mask a value to the bit width of its type.
fn truncate(vtype: VarType, bits: u64) -> u64 {
    let bytes = vtype.size();
    if bytes >= 8 {
        bits
    } else {
        bits & ((1u64 << (bytes * 8)) - 1)
    }
}

/// Sign-extend a value of the given type to i64.
fn sext(vtype: VarType, bits: u64) -> i64 {
    match vtype.size() {
        1 => bits as u8 as i8 as i64,
        2 => bits as u16 as i16 as i64,
        4 => bits as u32 as i32 as i64,
        _ => bits as i64,
    }
}

#[derive(Clone, Copy)]
enum Num {
    F32(f32),
    F64(f64),
    SInt(i64),
    UInt(u64),
}

/// Decode a bit pattern into the arithmetic domain of its type. Half
/// precision computes at f32 and truncates on encode, mirroring the
/// transparent widening performed by the LLVM emitter.
fn decode(vtype: VarType, bits: u64) -> Num {
    use VarType::*;
    match vtype {
        Float16 => Num::F32(f16_to_f32(bits as u16)),
        Float32 => Num::F32(f32::from_bits(bits as u32)),
        Float64 => Num::F64(f64::from_bits(bits)),
        Int8 | Int16 | Int32 | Int64 => Num::SInt(sext(vtype, bits)),
        _ => Num::UInt(truncate(vtype, bits)),
    }
}

fn encode(vtype: VarType, value: Num) -> u64 {
    use VarType::*;
    match (vtype, value) {
        (Float16, Num::F32(v)) => f32_to_f16(v) as u64,
        (Float32, Num::F32(v)) => v.to_bits() as u64,
        (Float64, Num::F64(v)) => v.to_bits(),
        (_, Num::SInt(v)) => truncate(vtype, v as u64),
        (_, Num::UInt(v)) => truncate(vtype, v),
        _ => unreachable!("encode(): domain mismatch"),
    }
}

fn arith2(kind: VarKind, vtype: VarType, a: u64, b: u64) -> u64 {
    use VarKind::*;
    let out = match (decode(vtype, a), decode(vtype, b)) {
        (Num::F32(x), Num::F32(y)) => Num::F32(match kind {
            Add => x + y,
            Sub => x - y,
            Mul => x * y,
            Div => x / y,
            Min => x.min(y),
            Max => x.max(y),
            _ => unreachable!(),
        }),
        (Num::F64(x), Num::F64(y)) => Num::F64(match kind {
            Add => x + y,
            Sub => x - y,
            Mul => x * y,
            Div => x / y,
            Min => x.min(y),
            Max => x.max(y),
            _ => unreachable!(),
        }),
        (Num::SInt(x), Num::SInt(y)) => Num::SInt(match kind {
            Add => x.wrapping_add(y),
            Sub => x.wrapping_sub(y),
            Mul => x.wrapping_mul(y),
            Div => x.wrapping_div(y),
            Mod => x.wrapping_rem(y),
            Min => x.min(y),
            Max => x.max(y),
            _ => unreachable!(),
        }),
        (Num::UInt(x), Num::UInt(y)) => Num::UInt(match kind {
            Add => x.wrapping_add(y),
            Sub => x.wrapping_sub(y),
            Mul => x.wrapping_mul(y),
            Div => x / y,
            Mod => x % y,
            Min => x.min(y),
            Max => x.max(y),
            _ => unreachable!(),
        }),
        _ => unreachable!("arith2(): operand domain mismatch"),
    };
    encode(vtype, out)
}

fn compare(kind: VarKind, vtype: VarType, a: u64, b: u64) -> u64 {
    use std::cmp::Ordering;
    use VarKind::*;
    let ord = match (decode(vtype, a), decode(vtype, b)) {
        (Num::F32(x), Num::F32(y)) => x.partial_cmp(&y),
        (Num::F64(x), Num::F64(y)) => x.partial_cmp(&y),
        (Num::SInt(x), Num::SInt(y)) => Some(x.cmp(&y)),
        (Num::UInt(x), Num::UInt(y)) => Some(x.cmp(&y)),
        _ => unreachable!(),
    };
    let result = match (kind, ord) {
        // Comparisons involving NaN are ordered-false, except `neq`.
        (Neq, None) => true,
        (_, None) => false,
        (Eq, Some(o)) => o == Ordering::Equal,
        (Neq, Some(o)) => o != Ordering::Equal,
        (Lt, Some(o)) => o == Ordering::Less,
        (Le, Some(o)) => o != Ordering::Greater,
        (Gt, Some(o)) => o == Ordering::Greater,
        (Ge, Some(o)) => o != Ordering::Less,
        _ => unreachable!(),
    };
    result as u64
}

fn cast_value(src: VarType, dst: VarType, bits: u64) -> u64 {
    use VarType::*;
    if src == dst {
        return bits;
    }
    if dst == Bool {
        return match decode(src, bits) {
            Num::F32(v) => (v != 0.0) as u64,
            Num::F64(v) => (v != 0.0) as u64,
            Num::SInt(v) => (v != 0) as u64,
            Num::UInt(v) => (v != 0) as u64,
        };
    }
    if src == Bool {
        let one = bits != 0;
        return if one { dst.one_bits() } else { 0 };
    }
    let value = decode(src, bits);
    let out = match dst {
        Float16 | Float32 => Num::F32(match value {
            Num::F32(v) => v,
            Num::F64(v) => v as f32,
            Num::SInt(v) => v as f32,
            Num::UInt(v) => v as f32,
        }),
        Float64 => Num::F64(match value {
            Num::F32(v) => v as f64,
            Num::F64(v) => v,
            Num::SInt(v) => v as f64,
            Num::UInt(v) => v as f64,
        }),
        Int8 | Int16 | Int32 | Int64 => Num::SInt(match value {
            Num::F32(v) => v as i64,
            Num::F64(v) => v as i64,
            Num::SInt(v) => v,
            Num::UInt(v) => v as i64,
        }),
        _ => Num::UInt(match value {
            Num::F32(v) => v as u64,
            Num::F64(v) => v as u64,
            Num::SInt(v) => v as u64,
            Num::UInt(v) => v,
        }),
    };
    encode(dst, out)
}

fn apply_reduce(op: ReduceOp, vtype: VarType, current: u64, value: u64) -> u64 {
    match op {
        ReduceOp::None => value,
        ReduceOp::Add => arith2(VarKind::Add, vtype, current, value),
        ReduceOp::Mul => arith2(VarKind::Mul, vtype, current, value),
        ReduceOp::Min => arith2(VarKind::Min, vtype, current, value),
        ReduceOp::Max => arith2(VarKind::Max, vtype, current, value),
        ReduceOp::And => truncate(vtype, current & value),
        ReduceOp::Or => truncate(vtype, current | value),
    }
}

unsafe fn read_element(ptr: *const u8, vtype: VarType, index: usize) -> u64 {
    let base = ptr.add(index * vtype.size());
    match vtype.size() {
        1 => *base as u64,
        2 => (base as *const u16).read_unaligned() as u64,
        4 => (base as *const u32).read_unaligned() as u64,
        _ => (base as *const u64).read_unaligned(),
    }
}

unsafe fn write_element(ptr: *mut u8, vtype: VarType, index: usize, bits: u64) {
    let base = ptr.add(index * vtype.size());
    match vtype.size() {
        1 => *base = bits as u8,
        2 => (base as *mut u16).write_unaligned(bits as u16),
        4 => (base as *mut u32).write_unaligned(bits as u32),
        _ => (base as *mut u64).write_unaligned(bits),
    }
}

// --------------------------------------------------------------------
// Program execution
// --------------------------------------------------------------------

fn run_program(ops: &[EmitVar], size: u32, params: &[*mut u8]) {
    let mut regs = vec![0u64; ops.len()];

    for lane in 0..size as usize {
        for op in ops {
            let dep = |slot: usize| -> u64 {
                debug_assert_ne!(op.dep[slot], NO_REG);
                regs[op.dep[slot] as usize]
            };
            let dep_type = |slot: usize| ops[op.dep[slot] as usize].vtype;

            let value = match op.param {
                ParamKind::Input => {
                    let ptr = params[op.param_offset as usize];
                    if op.vtype == VarType::Pointer {
                        // Pointer literals pass their value through the
                        // parameter table directly.
                        ptr as u64
                    } else if op.scalar {
                        unsafe { read_element(ptr, op.vtype, 0) }
                    } else {
                        unsafe { read_element(ptr, op.vtype, lane) }
                    }
                }
                _ => match op.kind {
                    VarKind::Literal => op.literal,
                    VarKind::Counter => lane as u64,
                    VarKind::DefaultMask => 1,
                    VarKind::Nop | VarKind::Global => 0,
                    VarKind::Neg => match decode(op.vtype, dep(0)) {
                        Num::F32(v) => encode(op.vtype, Num::F32(-v)),
                        Num::F64(v) => encode(op.vtype, Num::F64(-v)),
                        Num::SInt(v) => encode(op.vtype, Num::SInt(v.wrapping_neg())),
                        Num::UInt(v) => encode(op.vtype, Num::UInt(v.wrapping_neg())),
                    },
                    VarKind::Not => truncate(op.vtype, !dep(0)),
                    VarKind::Sqrt | VarKind::Ceil | VarKind::Floor | VarKind::Round
                    | VarKind::Trunc | VarKind::Abs => {
                        let f32_op = |v: f32| -> f32 {
                            match op.kind {
                                VarKind::Sqrt => v.sqrt(),
                                VarKind::Ceil => v.ceil(),
                                VarKind::Floor => v.floor(),
                                VarKind::Round => v.round_ties_even(),
                                VarKind::Trunc => v.trunc(),
                                _ => v.abs(),
                            }
                        };
                        let f64_op = |v: f64| -> f64 {
                            match op.kind {
                                VarKind::Sqrt => v.sqrt(),
                                VarKind::Ceil => v.ceil(),
                                VarKind::Floor => v.floor(),
                                VarKind::Round => v.round_ties_even(),
                                VarKind::Trunc => v.trunc(),
                                _ => v.abs(),
                            }
                        };
                        match decode(op.vtype, dep(0)) {
                            Num::F32(v) => encode(op.vtype, Num::F32(f32_op(v))),
                            Num::F64(v) => encode(op.vtype, Num::F64(f64_op(v))),
                            Num::SInt(v) => encode(op.vtype, Num::SInt(v.wrapping_abs())),
                            Num::UInt(v) => encode(op.vtype, Num::UInt(v)),
                        }
                    }
                    VarKind::Add | VarKind::Sub | VarKind::Mul | VarKind::Div | VarKind::Mod
                    | VarKind::Min | VarKind::Max => arith2(op.kind, op.vtype, dep(0), dep(1)),
                    VarKind::Mulhi => {
                        let bits = op.vtype.size() as u32 * 8;
                        if op.vtype.is_uint() {
                            let wide = (dep(0) as u128) * (dep(1) as u128);
                            truncate(op.vtype, (wide >> bits) as u64)
                        } else {
                            let wide = (sext(op.vtype, dep(0)) as i128)
                                * (sext(op.vtype, dep(1)) as i128);
                            truncate(op.vtype, (wide >> bits) as u64)
                        }
                    }
                    VarKind::Fma => match (
                        decode(op.vtype, dep(0)),
                        decode(op.vtype, dep(1)),
                        decode(op.vtype, dep(2)),
                    ) {
                        (Num::F32(a), Num::F32(b), Num::F32(c)) => {
                            encode(op.vtype, Num::F32(a.mul_add(b, c)))
                        }
                        (Num::F64(a), Num::F64(b), Num::F64(c)) => {
                            encode(op.vtype, Num::F64(a.mul_add(b, c)))
                        }
                        (Num::SInt(a), Num::SInt(b), Num::SInt(c)) => {
                            encode(op.vtype, Num::SInt(a.wrapping_mul(b).wrapping_add(c)))
                        }
                        (Num::UInt(a), Num::UInt(b), Num::UInt(c)) => {
                            encode(op.vtype, Num::UInt(a.wrapping_mul(b).wrapping_add(c)))
                        }
                        _ => unreachable!(),
                    },
                    VarKind::Eq | VarKind::Neq | VarKind::Lt | VarKind::Le | VarKind::Gt
                    | VarKind::Ge => compare(op.kind, dep_type(0), dep(0), dep(1)),
                    VarKind::Select => {
                        if dep(0) != 0 {
                            dep(1)
                        } else {
                            dep(2)
                        }
                    }
                    VarKind::Popc => truncate(op.vtype, dep(0)).count_ones() as u64,
                    VarKind::Clz => {
                        let width = op.vtype.size() as u32 * 8;
                        let value = truncate(op.vtype, dep(0));
                        (value.leading_zeros().saturating_sub(64 - width)) as u64
                    }
                    VarKind::Ctz => {
                        let width = op.vtype.size() as u32 * 8;
                        let value = truncate(op.vtype, dep(0));
                        (value.trailing_zeros().min(width)) as u64
                    }
                    VarKind::And => {
                        if dep_type(1) == VarType::Bool && op.vtype != VarType::Bool {
                            if dep(1) != 0 {
                                dep(0)
                            } else {
                                0
                            }
                        } else {
                            truncate(op.vtype, dep(0) & dep(1))
                        }
                    }
                    VarKind::Or => {
                        if dep_type(1) == VarType::Bool && op.vtype != VarType::Bool {
                            if dep(1) != 0 {
                                op.vtype.all_ones_bits()
                            } else {
                                dep(0)
                            }
                        } else {
                            truncate(op.vtype, dep(0) | dep(1))
                        }
                    }
                    VarKind::Xor => truncate(op.vtype, dep(0) ^ dep(1)),
                    VarKind::Shl => {
                        let width = op.vtype.size() as u32 * 8;
                        let amount = (dep(1) as u32) & (width - 1);
                        truncate(op.vtype, truncate(op.vtype, dep(0)) << amount)
                    }
                    VarKind::Shr => {
                        let width = op.vtype.size() as u32 * 8;
                        let amount = (dep(1) as u32) & (width - 1);
                        if op.vtype.is_uint() {
                            truncate(op.vtype, truncate(op.vtype, dep(0)) >> amount)
                        } else {
                            truncate(op.vtype, (sext(op.vtype, dep(0)) >> amount) as u64)
                        }
                    }
                    VarKind::Cast => cast_value(dep_type(0), op.vtype, dep(0)),
                    VarKind::Bitcast => truncate(op.vtype, dep(0)),
                    VarKind::Gather => {
                        if dep(2) != 0 {
                            let base = dep(0) as *const u8;
                            unsafe { read_element(base, op.vtype, dep(1) as usize) }
                        } else {
                            0
                        }
                    }
                    VarKind::Load => {
                        if dep(1) != 0 {
                            let base = dep(0) as *const u8;
                            unsafe { read_element(base, op.vtype, lane) }
                        } else {
                            0
                        }
                    }
                    VarKind::Scatter => {
                        if dep(3) != 0 {
                            let vtype = dep_type(1);
                            let base = dep(0) as *mut u8;
                            let index = dep(2) as usize;
                            let reduce = ReduceOp::from_literal(op.literal);
                            unsafe {
                                let current = read_element(base, vtype, index);
                                let merged = apply_reduce(reduce, vtype, current, dep(1));
                                write_element(base, vtype, index, merged);
                            }
                        }
                        0
                    }
                    VarKind::ScatterInc => {
                        if dep(2) != 0 {
                            let base = dep(0) as *mut u8;
                            let index = dep(1) as usize;
                            unsafe {
                                let current = read_element(base, VarType::UInt32, index);
                                write_element(base, VarType::UInt32, index, current + 1);
                                current
                            }
                        } else {
                            0
                        }
                    }
                    VarKind::Store => {
                        if dep(2) != 0 {
                            let vtype = dep_type(1);
                            let base = dep(0) as *mut u8;
                            unsafe { write_element(base, vtype, lane, dep(1)) };
                        }
                        0
                    }
                    other => unreachable!("run_program(): unhandled kind {}", other.name()),
                },
            };

            regs[op.reg as usize] = value;

            if op.param == ParamKind::Output {
                let ptr = params[op.param_offset as usize];
                unsafe { write_element(ptr, op.vtype, lane, value) };
            }
        }
    }
}

pub(crate) fn reduce_buffer(vtype: VarType, op: ReduceOp, data: *const u8, size: u32) -> u64 {
    let identity = match op {
        ReduceOp::Add | ReduceOp::Or => 0,
        ReduceOp::Mul => vtype.one_bits(),
        ReduceOp::And => vtype.all_ones_bits(),
        ReduceOp::Min | ReduceOp::Max | ReduceOp::None => {
            // Seed with the first element.
            if size == 0 {
                return 0;
            }
            unsafe { read_element(data, vtype, 0) }
        }
    };
    let start = matches!(op, ReduceOp::Min | ReduceOp::Max | ReduceOp::None) as usize;
    let mut acc = identity;
    for i in start..size as usize {
        let value = unsafe { read_element(data, vtype, i) };
        acc = apply_reduce(op, vtype, acc, value);
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_arith_semantics() {
        let f = |x: f32| x.to_bits() as u64;
        assert_eq!(
            arith2(VarKind::Add, VarType::Float32, f(1.5), f(2.0)),
            f(3.5)
        );
        assert_eq!(
            arith2(VarKind::Div, VarType::Int32, (-7i32 as u32) as u64, 2),
            (-3i32 as u32) as u64
        );
        assert_eq!(arith2(VarKind::Max, VarType::UInt8, 0xff, 0x01), 0xff);
    }

    #[test]
    fn comparisons_handle_sign() {
        assert_eq!(
            compare(VarKind::Lt, VarType::Int32, (-1i32 as u32) as u64, 1),
            1
        );
        assert_eq!(compare(VarKind::Lt, VarType::UInt32, 0xffff_ffff, 1), 0);
    }

    #[test]
    fn cast_matrix() {
        // u32 -> f32
        assert_eq!(
            cast_value(VarType::UInt32, VarType::Float32, 7),
            7.0f32.to_bits() as u64
        );
        // f32 -> i32 truncates toward zero
        assert_eq!(
            cast_value(VarType::Float32, VarType::Int32, (-2.7f32).to_bits() as u64),
            (-2i32 as u32) as u64
        );
        // i32 sign-extends to i64
        assert_eq!(
            cast_value(VarType::Int32, VarType::Int64, (-5i32 as u32) as u64),
            -5i64 as u64
        );
        // u32 zero-extends to u64
        assert_eq!(cast_value(VarType::UInt32, VarType::UInt64, 0xffff_ffff), 0xffff_ffff);
        // bool -> f32
        assert_eq!(
            cast_value(VarType::Bool, VarType::Float32, 1),
            1.0f32.to_bits() as u64
        );
    }

    #[test]
    fn bit_helpers_respect_width() {
        assert_eq!(truncate(VarType::UInt8, 0x1ff), 0xff);
        assert_eq!(sext(VarType::Int16, 0x8000), -32768);
        assert_eq!(truncate(VarType::UInt32, !0u64), 0xffff_ffff);
    }

    #[test]
    fn reduce_buffer_min_max() {
        let data: Vec<u32> = vec![5, 3, 9, 1];
        let min = reduce_buffer(
            VarType::UInt32,
            ReduceOp::Min,
            data.as_ptr() as *const u8,
            4,
        );
        let max = reduce_buffer(
            VarType::UInt32,
            ReduceOp::Max,
            data.as_ptr() as *const u8,
            4,
        );
        assert_eq!((min, max), (1, 9));
    }
}
