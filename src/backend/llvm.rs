//! LLVM IR emitter for the vectorized CPU backend.
//!
//! Each kernel is one module containing a single function
//!
//! ```text
//! define void @glint_<hash>(i64 %start, i64 %end, i8** noalias %params)
//! ```
//!
//! whose body loops `%index` over `[start, end)` in steps of the vector
//! width. Every scheduled variable defines one vector register named by
//! its type prefix and register index. Inputs are loaded from the flat
//! `%params` pointer array (scalars broadcast via
//! `insertelement`/`shufflevector`), outputs are stored back through it,
//! and masks travel as `<w x i1>`, widening to `<w x i8>` whenever they
//! cross memory.
//!
//! Intrinsic declarations and helper subroutines accumulate in a separate
//! globals section and are deduplicated by content.

use crate::fmt::{wfmt, wfmt_g, CodeWriter, FmtCtx};
use crate::kernel::{KernelProgram, ParamKind, NO_REG};
use crate::state::State;
use crate::var::{ReduceOp, VarKind};
use crate::vtype::VarType;

use super::{patch_kernel_name, NAME_PLACEHOLDER};

/// Lower a scheduled program into a complete LLVM module.
pub(crate) fn assemble(st: &State, program: &mut KernelProgram) -> String {
    let cfg = &st.codegen;
    let mut em = Emitter {
        w: CodeWriter::new(FmtCtx::llvm(cfg.llvm_width, cfg.llvm_version)),
        alloca_size: -1,
        alloca_align: -1,
        uses_callables: false,
        st,
    };

    em.w.put(&format!(
        "define void @glint_{NAME_PLACEHOLDER}(i64 %start, i64 %end, {} noalias %params) #0 {{\n",
        if em.w.ctx.opaque_pointers { "ptr" } else { "i8**" }
    ));
    em.w.put("entry:\n    br label %body\n\nbody:\n");
    em.w.put("    %index = phi i64 [ %index_next, %suffix ], [ %start, %entry ]\n");

    for i in 0..program.ops.len() {
        em.emit(program, i);
    }

    em.w.put("    br label %suffix\n\nsuffix:\n");
    wfmt!(em.w, "    %index_next = add i64 %index, $w\n");
    em.w.put("    %cond = icmp uge i64 %index_next, %end\n");
    em.w.put("    br i1 %cond, label %done, label %body, !llvm.loop !4\n\ndone:\n    ret void\n}\n");

    // Scratch memory and the callable table are set up in the prologue;
    // their sizes are only known now, so splice the setup code in.
    if em.alloca_size >= 0 || em.uses_callables {
        let start = em.w.buf.len();
        if em.uses_callables {
            wfmt!(em.w, "    %callables = load {i8**}, {i8***} @callables, align 8\n");
        }
        if em.alloca_size >= 0 {
            wfmt!(
                em.w,
                "    %buffer = alloca i8, i32 $u, align $u\n",
                em.alloca_size as u32,
                em.alloca_align.max(16) as u32
            );
        }
        let target = em.w.buf.as_str().find("entry:\n").unwrap() + "entry:\n".len();
        em.w.buf.move_suffix(start, target);
    }

    let mut module = em.w.buf.take();
    if !em.w.globals.is_empty() {
        module.push('\n');
        module.push_str(em.w.globals.as_str());
    }

    module.push_str(
        "\n!0 = !{!0}\n\
         !1 = !{!1, !0}\n\
         !2 = !{!1}\n\
         !3 = !{i32 1}\n\
         !4 = !{!\"llvm.loop.unroll.disable\", !\"llvm.loop.vectorize.enable\", i1 0}\n\n",
    );
    module.push_str(&format!(
        "attributes #0 = {{ norecurse nounwind \"frame-pointer\"=\"none\" \
         \"no-builtins\" \"no-stack-arg-probe\" \"target-cpu\"=\"{}\" }}\n",
        cfg.llvm_target_cpu
    ));

    patch_kernel_name(module)
}

struct Emitter<'a> {
    w: CodeWriter,
    /// Bytes of `alloca`-backed scratch required by the kernel (-1: none);
    /// sized by the maximum over all users (call staging, ray staging).
    alloca_size: i64,
    alloca_align: i64,
    uses_callables: bool,
    st: &'a State,
}

/// Operations whose half-precision lowering needs an intrinsic that most
/// targets lack; they transparently compute at `f32`.
fn fp16_upcast(kind: VarKind) -> bool {
    matches!(
        kind,
        VarKind::Sqrt
            | VarKind::Abs
            | VarKind::Fma
            | VarKind::Min
            | VarKind::Max
            | VarKind::Ceil
            | VarKind::Floor
            | VarKind::Round
            | VarKind::Trunc
    )
}

impl Emitter<'_> {
    fn emit(&mut self, program: &mut KernelProgram, i: usize) {
        let op = &program.ops[i];
        let vt = op.vtype;
        let w = &mut self.w;

        if op.param == ParamKind::Input && op.scalar && vt == VarType::Pointer {
            // A pointer literal: load the address value itself.
            wfmt!(w, "    $v_p1 = getelementptr inbounds {i8*}, {i8**} %params, i32 $o\n", op, op);
            wfmt!(w, "    $v = load {i8*}, {i8**} $v_p1, align 8, !alias.scope !2\n", op, op);
            return;
        }

        // Parameter plumbing: compute the source/destination address of
        // this input/output inside the parameter array.
        if op.param != ParamKind::Register {
            wfmt!(w, "    $v_p1 = getelementptr inbounds {i8*}, {i8**} %params, i32 $o\n", op, op);
            wfmt!(w, "    $v_p{2|3} = load {i8*}, {i8**} $v_p1, align 8, !alias.scope !2\n", op, op);
            wfmt!(w, "{    $v_p3 = bitcast i8* $v_p2 to $m*\n|}", op, op, op);
            if op.param == ParamKind::Output || !op.scalar {
                wfmt!(w, "    $v_p{4|5} = getelementptr inbounds $m, {$m*} $v_p3, i64 %index\n", op, op, op, op);
                wfmt!(w, "{    $v_p5 = bitcast $m* $v_p4 to $M*\n|}", op, op, op, op);
            }
        }

        if op.param == ParamKind::Input {
            if !op.scalar {
                // Load one packet per iteration.
                let suffix = if vt == VarType::Bool { "_0" } else { "" };
                wfmt!(w, "    $v$s = load $M, {$M*} $v_p5, align $A, !alias.scope !2, !nontemporal !3\n",
                      op, suffix, op, op, op, op);
                if vt == VarType::Bool {
                    wfmt!(w, "    $v = trunc $M $v_0 to $T\n", op, op, op, op);
                }
            } else {
                // Load a scalar and broadcast it across the lanes.
                wfmt!(w, "    $v_0 = load $m, {$m*} $v_p3, align $a, !alias.scope !2\n", op, op, op, op, op);
                if vt == VarType::Bool {
                    wfmt!(w, "    $v_1 = trunc i8 $v_0 to i1\n", op, op);
                }
                let src = if vt == VarType::Bool { 1u32 } else { 0u32 };
                wfmt!(w, "    $v_$u = insertelement $T undef, $t $v_$u, i32 0\n", op, src + 1, op, op, op, src);
                wfmt!(w, "    $v = shufflevector $T $v_$u, $T undef, <$w x i32> $z\n", op, op, op, src + 1, op);
            }
        } else if op.kind == VarKind::Literal {
            wfmt!(w, "    $v_1 = insertelement $T undef, $t $l, i32 0\n", op, op, op, op);
            wfmt!(w, "    $v = shufflevector $T $v_1, $T undef, <$w x i32> $z\n", op, op, op, op);
        } else {
            self.render(program, i);
        }

        let op = &program.ops[i];
        let w = &mut self.w;
        if op.param == ParamKind::Output {
            if op.vtype != VarType::Bool {
                wfmt!(w, "    store $V, {$T*} $v_p5, align $A, !noalias !2, !nontemporal !3\n", op, op, op, op);
            } else {
                wfmt!(w, "    $v_e = zext $V to $M\n", op, op, op);
                wfmt!(w, "    store $M $v_e, {$M*} $v_p5, align $A, !noalias !2, !nontemporal !3\n", op, op, op, op, op);
            }
        }
    }

    /// Lower one symbolic node into the instruction sequence defining its
    /// register. Half-precision compute without native support widens to
    /// f32 on entry (once per operand and kernel) and narrows on exit.
    fn render(&mut self, program: &mut KernelProgram, i: usize) {
        let upcast = program.ops[i].vtype.is_half() && fp16_upcast(program.ops[i].kind);
        if upcast {
            for slot in 0..4 {
                let dep = program.ops[i].dep[slot];
                if dep == NO_REG {
                    continue;
                }
                let dep = dep as usize;
                if !program.ops[dep].ssa_f32_cast {
                    let reg = program.ops[dep].reg;
                    wfmt!(self.w, "    %f$u = fpext <$w x half> %h$u to <$w x float>\n", reg, reg);
                    program.ops[dep].ssa_f32_cast = true;
                }
                program.ops[dep].vtype = VarType::Float32;
            }
            program.ops[i].vtype = VarType::Float32;
        }

        let bool_gather = program.ops[i].kind == VarKind::Gather
            && program.ops[i].vtype == VarType::Bool;
        if bool_gather {
            // Mask data is stored as i8; gather bytes and truncate.
            program.ops[i].vtype = VarType::UInt8;
        }

        self.render_node(program, i, bool_gather);

        if bool_gather {
            program.ops[i].vtype = VarType::Bool;
            let op = &program.ops[i];
            wfmt!(self.w, "    $v = trunc <$w x i8> %b$u_2 to <$w x i1>\n", op, op.reg);
        }

        if upcast {
            program.ops[i].vtype = VarType::Float16;
            for slot in 0..4 {
                let dep = program.ops[i].dep[slot];
                if dep != NO_REG {
                    program.ops[dep as usize].vtype = VarType::Float16;
                }
            }
            let reg = program.ops[i].reg;
            wfmt!(self.w, "    %h$u = fptrunc <$w x float> %f$u to <$w x half>\n", reg, reg);
        }
    }

    fn render_node(&mut self, program: &KernelProgram, i: usize, bool_gather: bool) {
        let ops = &program.ops;
        let v = &ops[i];
        let dep = |slot: usize| &ops[v.dep[slot] as usize];
        let w = &mut self.w;

        match v.kind {
            VarKind::Nop | VarKind::CallOutput | VarKind::LoopOutput => {}

            VarKind::Global => {
                if let Some(stmt) = &v.stmt {
                    let text = stmt.to_string();
                    w.put_global_verbatim(&text);
                }
            }

            VarKind::Stmt => {
                let stmt = v.stmt.as_deref().unwrap_or_default().to_string();
                let slots = [
                    Some(v),
                    (v.dep[0] != NO_REG).then(|| dep(0)),
                    (v.dep[1] != NO_REG).then(|| dep(1)),
                    (v.dep[2] != NO_REG).then(|| dep(2)),
                    (v.dep[3] != NO_REG).then(|| dep(3)),
                ];
                w.buf.put("    ");
                crate::fmt::render_stmt(&mut w.buf, &w.ctx, &stmt, slots);
                w.buf.put("\n");
            }

            VarKind::Counter => {
                wfmt!(w, "    $v_0 = trunc i64 %index to $t\n", v, v);
                wfmt!(w, "    $v_1 = insertelement $T undef, $t $v_0, i32 0\n", v, v, v, v);
                wfmt!(w, "    $v_2 = shufflevector $T $v_1, $T undef, <$w x i32> $z\n", v, v, v, v);
                wfmt!(w, "    $v = add $V_2, <", v, v);
                let width = w.ctx.width;
                for lane in 0..width {
                    wfmt!(w, "i32 $u$s", lane, if lane + 1 < width { ", " } else { ">\n" });
                }
            }

            VarKind::DefaultMask => {
                wfmt!(w, "    $v_0 = trunc i64 %end to i32\n", v);
                wfmt!(w, "    $v_1 = insertelement <$w x i32> undef, i32 $v_0, i32 0\n", v, v);
                wfmt!(w, "    $v_2 = shufflevector <$w x i32> $v_1, <$w x i32> undef, <$w x i32> $z\n", v, v);
                wfmt!(w, "    $v = icmp ult $V, $v_2\n", v, dep(0), v);
            }

            VarKind::Neg => {
                if v.vtype.is_float() {
                    wfmt!(w, "    $v = fneg $V\n", v, dep(0));
                } else {
                    wfmt!(w, "    $v = sub $T $z, $v\n", v, v, dep(0));
                }
            }

            VarKind::Not => {
                wfmt!(w, "    $v_0 = insertelement $B undef, $b -1, i32 0\n", v, v, v);
                wfmt!(w, "    $v_1 = shufflevector $B $v_0, $B undef, <$w x i32> $z\n", v, v, v, v);
                wfmt!(w, "    $v = xor $V, $v_1\n", v, dep(0), v);
            }

            VarKind::Sqrt => {
                wfmt_g!(w, "declare $T @llvm.sqrt.v$w$h($T)", v, v, v);
                wfmt!(w, "    $v = call $T @llvm.sqrt.v$w$h($V)\n", v, v, v, dep(0));
            }

            VarKind::Abs => {
                if v.vtype.is_float() {
                    wfmt_g!(w, "declare $T @llvm.fabs.v$w$h($T)", v, v, v);
                    wfmt!(w, "    $v = call $T @llvm.fabs.v$w$h($V)\n", v, v, v, dep(0));
                } else {
                    wfmt!(w, "    $v_0 = icmp slt $V, $z\n", dep(0), v);
                    wfmt!(w, "    $v_1 = sub nsw $T $z, $v\n", v, v, dep(0));
                    wfmt!(w, "    $v = select <$w x i1> $v_0, $V_1, $V\n", v, v, v, dep(0));
                }
            }

            VarKind::Add => {
                let stmt = if v.vtype.is_float() { "    $v = fadd $V, $v\n" } else { "    $v = add $V, $v\n" };
                wfmt!(w, stmt, v, dep(0), dep(1));
            }

            VarKind::Sub => {
                let stmt = if v.vtype.is_float() { "    $v = fsub $V, $v\n" } else { "    $v = sub $V, $v\n" };
                wfmt!(w, stmt, v, dep(0), dep(1));
            }

            VarKind::Mul => {
                let stmt = if v.vtype.is_float() { "    $v = fmul $V, $v\n" } else { "    $v = mul $V, $v\n" };
                wfmt!(w, stmt, v, dep(0), dep(1));
            }

            VarKind::Div => {
                let stmt = if v.vtype.is_float() {
                    "    $v = fdiv $V, $v\n"
                } else if v.vtype.is_uint() {
                    "    $v = udiv $V, $v\n"
                } else {
                    "    $v = sdiv $V, $v\n"
                };
                wfmt!(w, stmt, v, dep(0), dep(1));
            }

            VarKind::Mod => {
                let stmt = if v.vtype.is_uint() { "    $v = urem $V, $v\n" } else { "    $v = srem $V, $v\n" };
                wfmt!(w, stmt, v, dep(0), dep(1));
            }

            VarKind::Mulhi => {
                let ext = if v.vtype.is_uint() { "z" } else { "s" };
                wfmt!(w, "    $v_0 = $sext $V to $D\n", v, ext, dep(0), v);
                wfmt!(w, "    $v_1 = $sext $V to $D\n", v, ext, dep(1), v);
                wfmt!(w, "    $v_2 = insertelement $D undef, $d $u, i32 0\n", v, v, v, (v.vtype.size() * 8) as u32);
                wfmt!(w, "    $v_3 = shufflevector $D $v_2, $D undef, <$w x i32> $z\n", v, v, v, v);
                wfmt!(w, "    $v_4 = mul $D $v_0, $v_1\n", v, v, v, v);
                wfmt!(w, "    $v_5 = lshr $D $v_4, $v_3\n", v, v, v, v);
                wfmt!(w, "    $v = trunc $D $v_5 to $T\n", v, v, v, v);
            }

            VarKind::Fma => {
                if v.vtype.is_float() {
                    wfmt_g!(w, "declare $T @llvm.fma.v$w$h($T, $T, $T)", v, v, v, v, v);
                    wfmt!(w, "    $v = call $T @llvm.fma.v$w$h($V, $V, $V)\n", v, v, v, dep(0), dep(1), dep(2));
                } else {
                    wfmt!(w, "    $v_0 = mul $V, $v\n", v, dep(0), dep(1));
                    wfmt!(w, "    $v = add $V_0, $v\n", v, v, dep(2));
                }
            }

            VarKind::Min | VarKind::Max => {
                let is_min = v.kind == VarKind::Min;
                if w.ctx.llvm_version >= 12 || v.vtype.is_float() {
                    let name = match (is_min, v.vtype.is_float(), v.vtype.is_uint()) {
                        (true, true, _) => "minnum",
                        (false, true, _) => "maxnum",
                        (true, false, true) => "umin",
                        (false, false, true) => "umax",
                        (true, false, false) => "smin",
                        (false, false, false) => "smax",
                    };
                    wfmt_g!(w, "declare $T @llvm.$s.v$w$h($T, $T)", v, name, v, v, v);
                    wfmt!(w, "    $v = call $T @llvm.$s.v$w$h($V, $V)\n", v, v, name, v, dep(0), dep(1));
                } else {
                    let cmp = match (is_min, v.vtype.is_uint()) {
                        (true, true) => "ult",
                        (true, false) => "slt",
                        (false, true) => "ugt",
                        (false, false) => "sgt",
                    };
                    wfmt!(w, "    $v_0 = icmp $s $V, $v\n", v, cmp, dep(0), dep(1));
                    wfmt!(w, "    $v = select <$w x i1> $v_0, $V, $V\n", v, v, dep(0), dep(1));
                }
            }

            VarKind::Ceil | VarKind::Floor | VarKind::Round | VarKind::Trunc => {
                let name = match v.kind {
                    VarKind::Ceil => "ceil",
                    VarKind::Floor => "floor",
                    VarKind::Round => "nearbyint",
                    _ => "trunc",
                };
                wfmt_g!(w, "declare $T @llvm.$s.v$w$h($T)", v, name, v, v);
                wfmt!(w, "    $v = call $T @llvm.$s.v$w$h($V)\n", v, v, name, v, dep(0));
            }

            VarKind::Eq | VarKind::Neq | VarKind::Lt | VarKind::Le | VarKind::Gt | VarKind::Ge => {
                let a0 = dep(0);
                let float = a0.vtype.is_float();
                let uint = a0.vtype.is_uint() || a0.vtype == VarType::Bool;
                let pred = match (v.kind, float, uint) {
                    (VarKind::Eq, true, _) => "fcmp oeq",
                    (VarKind::Eq, false, _) => "icmp eq",
                    (VarKind::Neq, true, _) => "fcmp one",
                    (VarKind::Neq, false, _) => "icmp ne",
                    (VarKind::Lt, true, _) => "fcmp olt",
                    (VarKind::Lt, false, true) => "icmp ult",
                    (VarKind::Lt, false, false) => "icmp slt",
                    (VarKind::Le, true, _) => "fcmp ole",
                    (VarKind::Le, false, true) => "icmp ule",
                    (VarKind::Le, false, false) => "icmp sle",
                    (VarKind::Gt, true, _) => "fcmp ogt",
                    (VarKind::Gt, false, true) => "icmp ugt",
                    (VarKind::Gt, false, false) => "icmp sgt",
                    (_, true, _) => "fcmp oge",
                    (_, false, true) => "icmp uge",
                    (_, false, false) => "icmp sge",
                };
                wfmt!(w, "    $v = $s $V, $v\n", v, pred, a0, dep(1));
            }

            VarKind::Select => {
                wfmt!(w, "    $v = select $V, $V, $V\n", v, dep(0), dep(1), dep(2));
            }

            VarKind::Popc => {
                wfmt_g!(w, "declare $T @llvm.ctpop.v$w$h($T)", v, v, v);
                wfmt!(w, "    $v = call $T @llvm.ctpop.v$w$h($V)\n", v, v, v, dep(0));
            }

            VarKind::Clz => {
                wfmt_g!(w, "declare $T @llvm.ctlz.v$w$h($T, i1)", v, v, v);
                wfmt!(w, "    $v = call $T @llvm.ctlz.v$w$h($V, i1 0)\n", v, v, v, dep(0));
            }

            VarKind::Ctz => {
                wfmt_g!(w, "declare $T @llvm.cttz.v$w$h($T, i1)", v, v, v);
                wfmt!(w, "    $v = call $T @llvm.cttz.v$w$h($V, i1 0)\n", v, v, v, dep(0));
            }

            VarKind::And => {
                let a0 = dep(0);
                let a1 = dep(1);
                if a0.vtype != a1.vtype {
                    wfmt!(w, "    $v = select $V, $V, $T $z\n", v, a1, a0, a0);
                } else if v.vtype.is_float() {
                    wfmt!(w, "    $v_0 = bitcast $V to $B\n", v, a0, v);
                    wfmt!(w, "    $v_1 = bitcast $V to $B\n", v, a1, v);
                    wfmt!(w, "    $v_2 = and $B $v_0, $v_1\n", v, v, v, v);
                    wfmt!(w, "    $v = bitcast $B $v_2 to $T\n", v, v, v, v);
                } else {
                    wfmt!(w, "    $v = and $V, $v\n", v, a0, a1);
                }
            }

            VarKind::Or => {
                let a0 = dep(0);
                let a1 = dep(1);
                if a0.vtype != a1.vtype {
                    wfmt!(w, "    $v_0 = bitcast $V to $B\n", v, a0, v);
                    wfmt!(w, "    $v_1 = sext $V to $B\n", v, a1, v);
                    wfmt!(w, "    $v_2 = or $B $v_0, $v_1\n", v, v, v, v);
                    wfmt!(w, "    $v = bitcast $B $v_2 to $T\n", v, v, v, v);
                } else if v.vtype.is_float() {
                    wfmt!(w, "    $v_0 = bitcast $V to $B\n", v, a0, v);
                    wfmt!(w, "    $v_1 = bitcast $V to $B\n", v, a1, v);
                    wfmt!(w, "    $v_2 = or $B $v_0, $v_1\n", v, v, v, v);
                    wfmt!(w, "    $v = bitcast $B $v_2 to $T\n", v, v, v, v);
                } else {
                    wfmt!(w, "    $v = or $V, $v\n", v, a0, a1);
                }
            }

            VarKind::Xor => {
                if v.vtype.is_float() {
                    wfmt!(w, "    $v_0 = bitcast $V to $B\n", v, dep(0), v);
                    wfmt!(w, "    $v_1 = bitcast $V to $B\n", v, dep(1), v);
                    wfmt!(w, "    $v_2 = xor $B $v_0, $v_1\n", v, v, v, v);
                    wfmt!(w, "    $v = bitcast $B $v_2 to $T\n", v, v, v, v);
                } else {
                    wfmt!(w, "    $v = xor $V, $v\n", v, dep(0), dep(1));
                }
            }

            VarKind::Shl => {
                wfmt!(w, "    $v = shl $V, $v\n", v, dep(0), dep(1));
            }

            VarKind::Shr => {
                let stmt = if v.vtype.is_uint() { "    $v = lshr $V, $v\n" } else { "    $v = ashr $V, $v\n" };
                wfmt!(w, stmt, v, dep(0), dep(1));
            }

            VarKind::Cast => self.render_cast(program, i),

            VarKind::Bitcast => {
                wfmt!(w, "    $v = bitcast $V to $T\n", v, dep(0), v);
            }

            VarKind::Gather => {
                let ptr = dep(0);
                let index = dep(1);
                let mask = dep(2);
                wfmt_g!(w, "declare $T @llvm.masked.gather.v$w$h(<$w x {$t*}>, i32, $T, $T)", v, v, v, mask, v);
                wfmt!(w, "{    $v_0 = bitcast $<i8*$> $v to $<$t*$>\n|}", v, ptr, v);
                wfmt!(w, "    $v_1 = getelementptr $t, $<{$t*}$> {$v_0|$v}, $V\n", v, v, v, v, ptr, index);
                let suffix = if bool_gather { "_2" } else { "" };
                wfmt!(w, "    $v$s = call $T @llvm.masked.gather.v$w$h(<$w x {$t*}> $v_1, i32 $a, $V, $T $z)\n",
                      v, suffix, v, v, v, v, v, mask, v);
            }

            VarKind::Scatter => self.render_scatter(program, i),
            VarKind::ScatterInc => self.render_scatter_inc(program, i),

            // The lowering of these two kinds is not finalized; refuse
            // rather than commit to tentative IR.
            VarKind::ScatterKahan => {
                panic!("assemble(): scatter_kahan lowering is tentative and disabled!");
            }
            VarKind::TraceRay => {
                panic!("assemble(): trace_ray lowering is tentative and disabled!");
            }

            VarKind::Load => {
                let ptr = dep(0);
                let mask = dep(1);
                let abbrev = if v.vtype == VarType::Bool { "i8" } else { v.vtype.llvm_abbrev() };
                wfmt_g!(w, "declare $M @llvm.masked.load.v$w$s({$M*}, i32, $T, $M)", v, abbrev, v, mask, v);
                wfmt!(w, "{    $v_0 = bitcast i8* $v to $m*\n|}", v, ptr, v);
                wfmt!(w, "    $v_1 = getelementptr $m, {$m*} {$v_0|$v}, i64 %index\n", v, v, v, v, ptr);
                let suffix = if v.vtype == VarType::Bool { "_2" } else { "" };
                wfmt!(w, "{    $v_3 = bitcast $m* $v_1 to $M*\n|}", v, v, v, v);
                wfmt!(w, "    $v$s = call $M @llvm.masked.load.v$w$s({$M*} $v_{3|1}, i32 $a, $V, $M $z)\n",
                      v, suffix, v, abbrev, v, v, v, mask, v);
                if v.vtype == VarType::Bool {
                    wfmt!(w, "    $v = trunc $M $v_2 to $T\n", v, v, v, v);
                }
            }

            VarKind::Store => {
                let ptr = dep(0);
                let value = dep(1);
                let mask = dep(2);
                wfmt_g!(w, "declare void @llvm.masked.store.v$w$h($T, {$T*}, i32, $T)", value, value, value, mask);
                wfmt!(w, "{    $v_0 = bitcast i8* $v to $t*\n|}", v, ptr, value);
                wfmt!(w, "    $v_1 = getelementptr $t, {$t*} {$v_0|$v}, i64 %index\n", v, value, value, v, ptr);
                wfmt!(w, "    call void @llvm.masked.store.v$w$h($V, {$T*} $v_1, i32 $a, $V)\n",
                      value, value, value, v, value, mask);
            }

            VarKind::CallMask => {
                wfmt!(w, "    $v = bitcast <$w x i1> %mask to <$w x i1>\n", v);
            }

            VarKind::CallSelf => {
                wfmt!(w, "    $v = bitcast <$w x i32> %self to <$w x i32>\n", v);
            }

            VarKind::Extract => {
                wfmt!(w, "    $v = bitcast $T $v_out_$u to $T\n", v, v, dep(0), v.literal as u32, v);
            }

            VarKind::CallStart => self.render_call(program, i),

            VarKind::LoopStart => {
                let reg = v.reg;
                wfmt!(w, "    br label %l_$u_before\n\nl_$u_before:\n", reg, reg);
                wfmt!(w, "    br label %l_$u_cond\n\nl_$u_cond:\n", reg, reg);
                if let Some(loop_data) = self.st.extra.get(&v.id).and_then(|e| e.loop_data.as_deref()) {
                    let name: &str = &loop_data.name;
                    wfmt!(self.w, "    ; Symbolic loop: $s\n", name);
                }
            }

            VarKind::LoopCond => {
                let start = dep(0);
                let cond = dep(1);
                wfmt_g!(w, "declare i1 @llvm$e.vector.reduce.or.v$wi1($T)", cond);
                wfmt!(w, "    $v_red = call i1 @llvm$e.vector.reduce.or.v$wi1($V)\n", cond, cond);
                wfmt!(w, "    br i1 $v_red, label %l_$u_body, label %l_$u_done\n\nl_$u_body:\n",
                      cond, start.reg, start.reg, start.reg);
            }

            VarKind::LoopEnd => {
                let start = dep(0);
                wfmt!(w, "    br label %l_$u_end\n\nl_$u_end:\n", start.reg, start.reg);
                wfmt!(w, "    br label %l_$u_cond\n\nl_$u_done:\n", start.reg, start.reg);
            }

            VarKind::LoopPhi => self.render_loop_phi(program, i),

            VarKind::Literal | VarKind::Input => unreachable!("render(): handled by caller"),
        }
    }

    fn render_cast(&mut self, program: &KernelProgram, i: usize) {
        let ops = &program.ops;
        let v = &ops[i];
        let a0 = &ops[v.dep[0] as usize];
        let w = &mut self.w;
        let (src, dst) = (a0.vtype, v.vtype);

        if dst == VarType::Bool {
            let stmt = if src.is_float() { "    $v = fcmp one $V, $z\n" } else { "    $v = icmp ne $V, $z\n" };
            wfmt!(w, stmt, v, a0);
        } else if src == VarType::Bool {
            let one = if dst.is_float() { "1.0" } else { "1" };
            wfmt!(w, "    $v_1 = insertelement $T undef, $t $s, i32 0\n", v, v, v, one);
            wfmt!(w, "    $v_2 = shufflevector $T $v_1, $T undef, <$w x i32> $z\n", v, v, v, v);
            wfmt!(w, "    $v = select $V, $T $v_2, $T $z\n", v, a0, v, v, v);
        } else if dst.is_float() && !src.is_float() {
            let stmt = if src.is_uint() { "    $v = uitofp $V to $T\n" } else { "    $v = sitofp $V to $T\n" };
            wfmt!(w, stmt, v, a0, v);
        } else if !dst.is_float() && src.is_float() {
            let stmt = if dst.is_uint() { "    $v = fptoui $V to $T\n" } else { "    $v = fptosi $V to $T\n" };
            wfmt!(w, stmt, v, a0, v);
        } else if dst.is_float() && src.is_float() {
            // half <-> double has no direct lowering on common targets;
            // hop through float.
            if (dst.is_double() && src.is_half()) || (dst.is_half() && src.is_double()) {
                if dst.size() > src.size() {
                    wfmt!(w, "    %cast_$u = fpext $V to <$w x float>\n", v.reg, a0);
                    wfmt!(w, "    $v = fpext <$w x float> %cast_$u to $T\n", v, v.reg, v);
                } else {
                    wfmt!(w, "    %cast_$u = fptrunc $V to <$w x float>\n", v.reg, a0);
                    wfmt!(w, "    $v = fptrunc <$w x float> %cast_$u to $T\n", v, v.reg, v);
                }
            } else {
                let stmt = if dst.size() > src.size() { "    $v = fpext $V to $T\n" } else { "    $v = fptrunc $V to $T\n" };
                wfmt!(w, stmt, v, a0, v);
            }
        } else if dst.size() < src.size() {
            wfmt!(w, "    $v = trunc $V to $T\n", v, a0, v);
        } else {
            let stmt = if src.is_uint() { "    $v = zext $V to $T\n" } else { "    $v = sext $V to $T\n" };
            wfmt!(w, stmt, v, a0, v);
        }
    }

    /// Plain scatters lower to `llvm.masked.scatter`; reductive variants
    /// call a helper subroutine that coalesces lanes addressing the same
    /// cell and issues one `atomicrmw` per unique target.
    fn render_scatter(&mut self, program: &KernelProgram, i: usize) {
        let ops = &program.ops;
        let v = &ops[i];
        let ptr = &ops[v.dep[0] as usize];
        let value = &ops[v.dep[1] as usize];
        let index = &ops[v.dep[2] as usize];
        let mask = &ops[v.dep[3] as usize];
        let reduce = ReduceOp::from_literal(v.literal);
        let w = &mut self.w;

        wfmt!(w, "{    $v_0 = bitcast $<i8*$> $v to $<$t*$>\n|}", v, ptr, value);
        wfmt!(w, "    $v_1 = getelementptr $t, $<{$t*}$> {$v_0|$v}, $V\n", v, value, value, v, ptr, index);

        if reduce == ReduceOp::None {
            wfmt_g!(w, "declare void @llvm.masked.scatter.v$w$h($T, <$w x {$t*}>, i32, $T)",
                    value, value, value, mask);
            wfmt!(w, "    call void @llvm.masked.scatter.v$w$h($V, <$w x {$t*}> $v_1, i32 $a, $V)\n",
                  value, value, value, v, value, mask);
            return;
        }

        let float = value.vtype.is_float();
        let (op_name, intrinsic, atomic, zero_elem) = match reduce {
            ReduceOp::Add if float => ("fadd", "fadd", "fadd", true),
            ReduceOp::Add => ("add", "add", "add", false),
            ReduceOp::Mul if float => ("fmul", "fmul", "fmul", true),
            ReduceOp::Mul => ("mul", "mul", "mul", false),
            ReduceOp::Min if float => ("fmin", "fmin", "fmin", false),
            ReduceOp::Min if value.vtype.is_uint() => ("umin", "umin", "umin", false),
            ReduceOp::Min => ("smin", "smin", "min", false),
            ReduceOp::Max if float => ("fmax", "fmax", "fmax", false),
            ReduceOp::Max if value.vtype.is_uint() => ("umax", "umax", "umax", false),
            ReduceOp::Max => ("smax", "smax", "max", false),
            ReduceOp::And => ("and", "and", "and", false),
            ReduceOp::Or => ("or", "or", "or", false),
            ReduceOp::None => unreachable!(),
        };

        wfmt_g!(w, "declare i1 @llvm$e.vector.reduce.or.v$wi1(<$w x i1>)");
        if zero_elem {
            wfmt_g!(w, "declare $t @llvm$e.vector.reduce.$s.v$w$h($t, $T)", value, intrinsic, value, value, value);
        } else {
            wfmt_g!(w, "declare $t @llvm$e.vector.reduce.$s.v$w$h($T)", value, intrinsic, value, value);
        }

        // The helper body is fixed modulo type spellings; resolve those
        // up front and emit it verbatim.
        let width = w.ctx.width;
        let t = value.vtype.llvm();
        let h = value.vtype.llvm_abbrev();
        let tp = if w.ctx.opaque_pointers { "ptr".to_string() } else { format!("{t}*") };
        let e = if w.ctx.llvm_version < 12 { ".experimental" } else { "" };
        let reassoc = if float { "reassoc " } else { "" };
        let start_arg = if zero_elem { format!("{t} -0.0, ") } else { String::new() };
        let helper = format!(
            "define internal void @reduce_{op_name}_{h}(<{width} x {tp}> %ptr, <{width} x {t}> %value, <{width} x i1> %active_in) #0 {{\n\
             L0:\n\
             \x20  br label %L1\n\n\
             L1:\n\
             \x20  %index = phi i32 [ 0, %L0 ], [ %index_next, %L3 ]\n\
             \x20  %active = phi <{width} x i1> [ %active_in, %L0 ], [ %active_next_2, %L3 ]\n\
             \x20  %active_i = extractelement <{width} x i1> %active, i32 %index\n\
             \x20  br i1 %active_i, label %L2, label %L3\n\n\
             L2:\n\
             \x20  %ptr_0 = extractelement <{width} x {tp}> %ptr, i32 %index\n\
             \x20  %ptr_1 = insertelement <{width} x {tp}> undef, {tp} %ptr_0, i32 0\n\
             \x20  %ptr_2 = shufflevector <{width} x {tp}> %ptr_1, <{width} x {tp}> undef, <{width} x i32> zeroinitializer\n\
             \x20  %ptr_eq = icmp eq <{width} x {tp}> %ptr, %ptr_2\n\
             \x20  %active_cur = and <{width} x i1> %ptr_eq, %active\n\
             \x20  %value_cur = select <{width} x i1> %active_cur, <{width} x {t}> %value, <{width} x {t}> zeroinitializer\n\
             \x20  %reduced = call {reassoc}{t} @llvm{e}.vector.reduce.{intrinsic}.v{width}{h}({start_arg}<{width} x {t}> %value_cur)\n\
             \x20  atomicrmw {atomic} {tp} %ptr_0, {t} %reduced monotonic\n\
             \x20  %active_next = xor <{width} x i1> %active, %active_cur\n\
             \x20  %active_red = call i1 @llvm{e}.vector.reduce.or.v{width}i1(<{width} x i1> %active_next)\n\
             \x20  br i1 %active_red, label %L3, label %L4\n\n\
             L3:\n\
             \x20  %active_next_2 = phi <{width} x i1> [ %active, %L1 ], [ %active_next, %L2 ]\n\
             \x20  %index_next = add nuw nsw i32 %index, 1\n\
             \x20  %cond_2 = icmp eq i32 %index_next, {width}\n\
             \x20  br i1 %cond_2, label %L4, label %L1\n\n\
             L4:\n\
             \x20  ret void\n\
             }}"
        );
        w.put_global_verbatim(&helper);

        wfmt!(w, "    call void @reduce_$s_$h(<$w x {$t*}> $v_1, $V, $V)\n",
              op_name, value, value, v, value, mask);
    }

    fn render_scatter_inc(&mut self, program: &KernelProgram, i: usize) {
        let ops = &program.ops;
        let v = &ops[i];
        let ptr = &ops[v.dep[0] as usize];
        let index = &ops[v.dep[1] as usize];
        let mask = &ops[v.dep[2] as usize];
        let w = &mut self.w;

        wfmt_g!(w, "declare i32 @llvm.cttz.i32(i32, i1)");
        wfmt_g!(w, "declare i64 @llvm$e.vector.reduce.umax.v$wi64(<$w x i64>)");

        // Fetch-and-add helper: lanes hitting the same counter receive
        // consecutive pre-increment values through a single atomic.
        let width = w.ctx.width;
        let tp = if w.ctx.opaque_pointers { "ptr" } else { "i32*" };
        let e = if w.ctx.llvm_version < 12 { ".experimental" } else { "" };
        let helper = format!(
            "define internal <{width} x i32> @reduce_inc_u32(<{width} x {tp}> %ptrs_in, <{width} x i1> %active_in) #0 {{\n\
             L0:\n\
             \x20   %ptrs_start_0 = select <{width} x i1> %active_in, <{width} x {tp}> %ptrs_in, <{width} x {tp}> zeroinitializer\n\
             \x20   %ptrs_start_1 = ptrtoint <{width} x {tp}> %ptrs_start_0 to <{width} x i64>\n\
             \x20   br label %L1\n\n\
             L1:\n\
             \x20   %ptrs = phi <{width} x i64> [ %ptrs_start_1, %L0 ], [ %ptrs_next, %L4 ]\n\
             \x20   %out = phi <{width} x i32> [ zeroinitializer, %L0 ], [ %out_next, %L4 ]\n\
             \x20   %ptr = call i64 @llvm{e}.vector.reduce.umax.v{width}i64(<{width} x i64> %ptrs)\n\
             \x20   %done = icmp eq i64 %ptr, 0\n\
             \x20   br i1 %done, label %L5, label %L2\n\n\
             L2:\n\
             \x20   %ptr_b0 = insertelement <{width} x i64> undef, i64 %ptr, i32 0\n\
             \x20   %ptr_b1 = shufflevector <{width} x i64> %ptr_b0, <{width} x i64> undef, <{width} x i32> zeroinitializer\n\
             \x20   %active_v = icmp eq <{width} x i64> %ptr_b1, %ptrs\n\
             \x20   %active_i0 = bitcast <{width} x i1> %active_v to i{width}\n\
             \x20   %active_i1 = zext i{width} %active_i0 to i32\n\
             \x20   %ptrs_next = select <{width} x i1> %active_v, <{width} x i64> zeroinitializer, <{width} x i64> %ptrs\n\
             \x20   br label %L3\n\n\
             L3:\n\
             \x20   %active = phi i32 [ %active_i1, %L2 ], [ %active_next, %L3 ]\n\
             \x20   %accum = phi i32 [ 0, %L2 ], [ %accum_next, %L3 ]\n\
             \x20   %out_2 = phi <{width} x i32> [ %out, %L2 ], [ %out_2_next, %L3 ]\n\
             \x20   %lane = call i32 @llvm.cttz.i32(i32 %active, i1 1)\n\
             \x20   %lane_bit = shl nuw nsw i32 1, %lane\n\
             \x20   %active_next = xor i32 %active, %lane_bit\n\
             \x20   %accum_next = add nuw nsw i32 %accum, 1\n\
             \x20   %out_2_next = insertelement <{width} x i32> %out_2, i32 %accum, i32 %lane\n\
             \x20   %done_2 = icmp eq i32 %active_next, 0\n\
             \x20   br i1 %done_2, label %L4, label %L3\n\n\
             L4:\n\
             \x20   %ptr_p = inttoptr i64 %ptr to {tp}\n\
             \x20   %prev = atomicrmw add {tp} %ptr_p, i32 %accum_next monotonic\n\
             \x20   %prev_b0 = insertelement <{width} x i32> undef, i32 %prev, i32 0\n\
             \x20   %prev_b1 = shufflevector <{width} x i32> %prev_b0, <{width} x i32> undef, <{width} x i32> zeroinitializer\n\
             \x20   %sum = add <{width} x i32> %prev_b1, %out_2_next\n\
             \x20   %out_next = select <{width} x i1> %active_v, <{width} x i32> %sum, <{width} x i32> %out\n\
             \x20   br label %L1\n\n\
             L5:\n\
             \x20   ret <{width} x i32> %out\n\
             }}"
        );
        w.put_global_verbatim(&helper);

        wfmt!(w, "{    $v_0 = bitcast $<i8*$> $v to $<i32*$>\n|}", v, ptr);
        wfmt!(w, "    $v_1 = getelementptr i32, $<{i32*}$> {$v_0|$v}, $V\n", v, v, ptr, index);
        wfmt!(w, "    $v = call $T @reduce_inc_u32(<$w x {i32*}> $v_1, $V)\n", v, v, v, mask);
    }

    /// Virtual-call lowering: pack the live inputs into the scratch
    /// buffer, then repeatedly reduce the remaining instance ids to their
    /// maximum, invoke that instance's callable over the matching lanes
    /// and retire them, until no active lane remains.
    fn render_call(&mut self, program: &KernelProgram, i: usize) {
        let ops = &program.ops;
        let v = &ops[i];
        let self_v = &ops[v.dep[0] as usize];
        let mask_v = &ops[v.dep[1] as usize];
        let call = self
            .st
            .extra
            .get(&v.id)
            .and_then(|extra| extra.call.as_deref())
            .unwrap_or_else(|| panic!("assemble(): call node r{} lacks call metadata!", v.id));

        let width = self.w.ctx.width;
        self.alloca_size = self.alloca_size.max((call.buf_size * width) as i64);
        self.alloca_align = self.alloca_align.max((call.buf_align * width) as i64);
        self.uses_callables = true;
        let reg = v.reg;

        let w = &mut self.w;
        wfmt_g!(w, "@callables = dso_local local_unnamed_addr global {i8**} null, align 8");
        // A store through a helper keeps @callables from being folded to
        // a constant without forcing it external.
        wfmt_g!(
            w,
            "define void @set_callables({i8**} %ptr) local_unnamed_addr #0 ${\n\
             \x20   store {i8**} %ptr, {i8***} @callables\n\
             \x20   ret void\n\
             $}"
        );
        wfmt_g!(w, "declare i32 @llvm$e.vector.reduce.umax.v$wi32(<$w x i32>)");

        let name: &str = &call.name;
        wfmt!(w, "    br label %l$u_start\n\nl$u_start:\n", reg, reg);
        wfmt!(w, "    ; Call: $s\n", name);

        // Pass the input arguments through the scratch buffer.
        for (slot, &outer) in call.outer_in.iter().enumerate() {
            let Some(input) = ops.iter().find(|o| o.id == outer) else {
                continue;
            };
            let offset = call.in_offset[slot] * width;
            let slot = slot as u32;
            wfmt!(w, "    %u$u_in_$u_{0|1} = getelementptr inbounds i8, {i8*} %buffer, i32 $u\n",
                  reg, slot, offset);
            wfmt!(w, "{    %u$u_in_$u_1 = bitcast i8* %u$u_in_$u_0 to $M*\n|}",
                  reg, slot, reg, slot, input);
            if input.vtype != VarType::Bool {
                wfmt!(w, "    store $V, {$T*} %u$u_in_$u_1, align $A\n",
                      input, input, reg, slot, input);
            } else {
                wfmt!(w, "    %u$u_$u_zext = zext $V to $M\n", reg, slot, input, input);
                wfmt!(w, "    store $M %u$u_$u_zext, {$M*} %u$u_in_$u_1, align $A\n",
                      input, reg, slot, input, reg, slot, input);
            }
        }

        // Zero-initialize the output slots.
        for (slot, &offset) in call.out_offset.iter().enumerate() {
            if offset == u32::MAX {
                continue;
            }
            let slot = slot as u32;
            wfmt!(w, "    %u$u_tmp_$u_{0|1} = getelementptr inbounds i8, {i8*} %buffer, i64 $U\n",
                  reg, slot, (offset * width) as u64);
            wfmt!(w, "{    %u$u_tmp_$u_1 = bitcast i8* %u$u_tmp_$u_0 to <$w x i8>*\n|}",
                  reg, slot, reg, slot);
            wfmt!(w, "    store <$w x i8> $z, {<$w x i8>*} %u$u_tmp_$u_1, align $u\n",
                  reg, slot, width);
        }

        // Iterate over the distinct instances among the active lanes.
        wfmt!(w, "    br label %l$u_check\n\nl$u_check:\n", reg, reg);
        wfmt!(w, "    %u$u_self = phi <$w x i32> [ $v, %l$u_start ], [ %u$u_self_next, %l$u_call ]\n",
              reg, self_v, reg, reg, reg);
        wfmt!(w, "    %u$u_next = call i32 @llvm$e.vector.reduce.umax.v$wi32(<$w x i32> %u$u_self)\n",
              reg, reg);
        wfmt!(w, "    %u$u_valid = icmp ne i32 %u$u_next, 0\n", reg, reg);
        wfmt!(w, "    br i1 %u$u_valid, label %l$u_call, label %l$u_end\n", reg, reg, reg);

        wfmt!(w, "\nl$u_call:\n", reg);
        wfmt!(w, "    %u$u_bcast_0 = insertelement <$w x i32> undef, i32 %u$u_next, i32 0\n", reg, reg);
        wfmt!(w, "    %u$u_bcast = shufflevector <$w x i32> %u$u_bcast_0, <$w x i32> undef, <$w x i32> $z\n",
              reg, reg);
        wfmt!(w, "    %u$u_active_0 = icmp eq <$w x i32> %u$u_self, %u$u_bcast\n", reg, reg, reg);
        wfmt!(w, "    %u$u_active = and <$w x i1> %u$u_active_0, $v\n", reg, reg, mask_v);
        wfmt!(w, "    %u$u_func_0 = getelementptr inbounds {i8*}, {i8**} %callables, i32 %u$u_next\n",
              reg, reg);
        wfmt!(w, "    %u$u_func{_1|} = load {i8*}, {i8**} %u$u_func_0\n", reg, reg);

        if !w.ctx.opaque_pointers {
            if call.use_self {
                wfmt!(w, "    %u$u_func = bitcast i8* %u$u_func_1 to void (<$w x i1>, <$w x i32>, i8*)*\n",
                      reg, reg);
            } else {
                wfmt!(w, "    %u$u_func = bitcast i8* %u$u_func_1 to void (<$w x i1>, i8*)*\n",
                      reg, reg);
            }
        }

        if call.use_self {
            wfmt!(w, "    call void %u$u_func(<$w x i1> %u$u_active, $V, {i8*} %buffer)\n",
                  reg, reg, self_v);
        } else {
            wfmt!(w, "    call void %u$u_func(<$w x i1> %u$u_active, {i8*} %buffer)\n", reg, reg);
        }
        wfmt!(w, "    %u$u_self_next = select <$w x i1> %u$u_active, <$w x i32> $z, <$w x i32> %u$u_self\n",
              reg, reg, reg);
        wfmt!(w, "    br label %l$u_check\n\nl$u_end:\n", reg, reg);
    }

    fn render_loop_phi(&mut self, program: &KernelProgram, i: usize) {
        let ops = &program.ops;
        let v = &ops[i];
        let start = &ops[v.dep[0] as usize];
        let slot = v.literal as usize;
        let loop_data = self
            .st
            .extra
            .get(&start.id)
            .and_then(|extra| extra.loop_data.as_deref())
            .unwrap_or_else(|| panic!("assemble(): loop node r{} lacks loop metadata!", start.id));

        let outer_id = loop_data.outer_in[slot];
        let outer_in = ops.iter().find(|o| o.id == outer_id).unwrap_or_else(|| {
            panic!("assemble(): loop-carried input r{outer_id} was not scheduled!")
        });
        let inner_id = loop_data.inner_out[slot];
        let inner_out = ops.iter().find(|o| o.id == inner_id).unwrap_or_else(|| {
            panic!("assemble(): loop-carried output r{inner_id} was not scheduled!")
        });

        wfmt!(
            self.w,
            "    $v = phi $T [ $v, %l_$u_before ], [ $v, %l_$u_end ]\n",
            v, v, outer_in, start.reg, inner_out, start.reg
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{EmitVar, KernelProgram, ParamKind, NO_REG};
    use crate::var::VarKind;

    fn ev(reg: u32, kind: VarKind, vtype: VarType, dep: [u32; 4], param: ParamKind) -> EmitVar {
        let param_offset = match param {
            ParamKind::Register => u32::MAX,
            _ => reg,
        };
        EmitVar {
            id: reg + 1,
            reg,
            kind,
            vtype,
            scalar: false,
            param,
            param_offset,
            literal: 0,
            stmt: None,
            dep,
            ssa_f32_cast: false,
        }
    }

    fn assemble_ops(ops: Vec<EmitVar>) -> String {
        let st = State::new();
        let n_params = ops
            .iter()
            .filter(|o| o.param != ParamKind::Register)
            .count() as u32;
        let mut program = KernelProgram {
            backend: crate::state::JitBackend::LlvmSimd,
            size: 16,
            ops,
            n_params,
        };
        assemble(&st, &mut program)
    }

    #[test]
    fn kernel_skeleton() {
        let ir = assemble_ops(vec![ev(
            0,
            VarKind::Counter,
            VarType::UInt32,
            [NO_REG; 4],
            ParamKind::Output,
        )]);
        assert!(ir.contains("define void @glint_"));
        assert!(!ir.contains("@@@@"));
        assert!(ir.contains("%index = phi i64 [ %index_next, %suffix ], [ %start, %entry ]"));
        assert!(ir.contains("%index_next = add i64 %index, 8"));
        assert!(ir.contains("store <8 x i32>"));
        assert!(ir.contains("!llvm.loop !4"));
        assert!(ir.contains("attributes #0"));
    }

    #[test]
    fn arithmetic_arms_smoke() {
        // One entry per arithmetic kind; a formatter argument mismatch in
        // any arm panics here.
        let mut ops = vec![
            ev(0, VarKind::Literal, VarType::Float32, [NO_REG; 4], ParamKind::Register),
            ev(1, VarKind::Literal, VarType::Float32, [NO_REG; 4], ParamKind::Register),
        ];
        for kind in [
            VarKind::Neg,
            VarKind::Sqrt,
            VarKind::Abs,
            VarKind::Ceil,
            VarKind::Floor,
            VarKind::Round,
            VarKind::Trunc,
        ] {
            let reg = ops.len() as u32;
            ops.push(ev(reg, kind, VarType::Float32, [0, NO_REG, NO_REG, NO_REG], ParamKind::Register));
        }
        for kind in [
            VarKind::Add,
            VarKind::Sub,
            VarKind::Mul,
            VarKind::Div,
            VarKind::Min,
            VarKind::Max,
            VarKind::Eq,
            VarKind::Neq,
            VarKind::Lt,
            VarKind::Le,
            VarKind::Gt,
            VarKind::Ge,
            VarKind::Xor,
        ] {
            let reg = ops.len() as u32;
            let vtype = if matches!(
                kind,
                VarKind::Eq | VarKind::Neq | VarKind::Lt | VarKind::Le | VarKind::Gt | VarKind::Ge
            ) {
                VarType::Bool
            } else {
                VarType::Float32
            };
            ops.push(ev(reg, kind, vtype, [0, 1, NO_REG, NO_REG], ParamKind::Register));
        }
        let reg = ops.len() as u32;
        ops.push(ev(reg, VarKind::Fma, VarType::Float32, [0, 1, 0, NO_REG], ParamKind::Register));

        let ir = assemble_ops(ops);
        assert!(ir.contains("fadd"));
        assert!(ir.contains("fsub"));
        assert!(ir.contains("fmul"));
        assert!(ir.contains("fdiv"));
        assert!(ir.contains("@llvm.sqrt.v8f32"));
        assert!(ir.contains("@llvm.fma.v8f32"));
        assert!(ir.contains("@llvm.minnum.v8f32"));
        assert!(ir.contains("fcmp oeq"));
        assert!(ir.contains("fcmp olt"));
    }

    #[test]
    fn integer_arms_smoke() {
        let mut ops = vec![
            ev(0, VarKind::Literal, VarType::Int32, [NO_REG; 4], ParamKind::Register),
            ev(1, VarKind::Literal, VarType::Int32, [NO_REG; 4], ParamKind::Register),
        ];
        for kind in [
            VarKind::Neg,
            VarKind::Not,
            VarKind::Abs,
            VarKind::Popc,
            VarKind::Clz,
            VarKind::Ctz,
        ] {
            let reg = ops.len() as u32;
            ops.push(ev(reg, kind, VarType::Int32, [0, NO_REG, NO_REG, NO_REG], ParamKind::Register));
        }
        for kind in [
            VarKind::Add,
            VarKind::Div,
            VarKind::Mod,
            VarKind::Mulhi,
            VarKind::And,
            VarKind::Or,
            VarKind::Shl,
            VarKind::Shr,
            VarKind::Min,
        ] {
            let reg = ops.len() as u32;
            ops.push(ev(reg, kind, VarType::Int32, [0, 1, NO_REG, NO_REG], ParamKind::Register));
        }
        let ir = assemble_ops(ops);
        assert!(ir.contains("sdiv"));
        assert!(ir.contains("srem"));
        assert!(ir.contains("@llvm.ctpop.v8i32"));
        assert!(ir.contains("@llvm.smin.v8i32"));
        assert!(ir.contains("ashr"));
        // mulhi widens to the double-width integer type
        assert!(ir.contains("<8 x i64>"));
    }

    #[test]
    fn gather_and_scatter_lowering() {
        let ops = vec![
            {
                let mut ptr = ev(0, VarKind::Input, VarType::Pointer, [NO_REG; 4], ParamKind::Input);
                ptr.scalar = true;
                ptr
            },
            ev(1, VarKind::Counter, VarType::UInt32, [NO_REG; 4], ParamKind::Register),
            ev(2, VarKind::Literal, VarType::Bool, [NO_REG; 4], ParamKind::Register),
            ev(3, VarKind::Literal, VarType::Float32, [NO_REG; 4], ParamKind::Register),
            ev(4, VarKind::Gather, VarType::Float32, [0, 1, 2, NO_REG], ParamKind::Register),
            {
                let mut s = ev(5, VarKind::Scatter, VarType::Void, [0, 3, 1, 2], ParamKind::Register);
                s.literal = crate::var::ReduceOp::Add as u64;
                s
            },
        ];
        let ir = assemble_ops(ops);
        assert!(ir.contains("@llvm.masked.gather.v8f32"));
        assert!(ir.contains("@reduce_fadd_f32"));
        assert!(ir.contains("atomicrmw fadd"));
        assert!(ir.contains("reassoc"));
    }

    #[test]
    fn plain_scatter_uses_masked_intrinsic() {
        let ops = vec![
            {
                let mut ptr = ev(0, VarKind::Input, VarType::Pointer, [NO_REG; 4], ParamKind::Input);
                ptr.scalar = true;
                ptr
            },
            ev(1, VarKind::Counter, VarType::UInt32, [NO_REG; 4], ParamKind::Register),
            ev(2, VarKind::Literal, VarType::Bool, [NO_REG; 4], ParamKind::Register),
            ev(3, VarKind::Literal, VarType::Float32, [NO_REG; 4], ParamKind::Register),
            ev(4, VarKind::Scatter, VarType::Void, [0, 3, 1, 2], ParamKind::Register),
        ];
        let ir = assemble_ops(ops);
        assert!(ir.contains("@llvm.masked.scatter.v8f32"));
    }

    #[test]
    fn scalar_input_broadcasts() {
        let mut input = ev(0, VarKind::Input, VarType::Float32, [NO_REG; 4], ParamKind::Input);
        input.scalar = true;
        let ops = vec![
            input,
            ev(1, VarKind::Add, VarType::Float32, [0, 0, NO_REG, NO_REG], ParamKind::Output),
        ];
        let ir = assemble_ops(ops);
        assert!(ir.contains("insertelement <8 x float> undef"));
        assert!(ir.contains("shufflevector <8 x float>"));
    }

    #[test]
    fn mask_io_promotes_to_bytes() {
        let ops = vec![
            ev(0, VarKind::Input, VarType::Bool, [NO_REG; 4], ParamKind::Input),
            ev(1, VarKind::Not, VarType::Bool, [0, NO_REG, NO_REG, NO_REG], ParamKind::Output),
        ];
        let ir = assemble_ops(ops);
        assert!(ir.contains("trunc <8 x i8>"));
        assert!(ir.contains("zext <8 x i1>"));
    }

    #[test]
    fn half_precision_upcasts_for_intrinsics() {
        let ops = vec![
            ev(0, VarKind::Literal, VarType::Float16, [NO_REG; 4], ParamKind::Register),
            ev(1, VarKind::Sqrt, VarType::Float16, [0, NO_REG, NO_REG, NO_REG], ParamKind::Register),
        ];
        let ir = assemble_ops(ops);
        assert!(ir.contains("fpext <8 x half>"));
        assert!(ir.contains("@llvm.sqrt.v8f32"));
        assert!(ir.contains("fptrunc <8 x float>"));
    }

    #[test]
    fn identical_programs_share_kernel_names() {
        let make = || {
            assemble_ops(vec![
                ev(0, VarKind::Counter, VarType::UInt32, [NO_REG; 4], ParamKind::Output),
            ])
        };
        assert_eq!(make(), make());
    }

    #[test]
    fn loop_lowering_emits_blocks() {
        use crate::state::LoopData;
        let mut st = State::new();
        let start_id = 10;
        st.extra.entry(start_id).or_default().loop_data = Some(Box::new(LoopData {
            name: "walk".to_string(),
            outer_in: vec![2],
            inner_out: vec![6],
        }));

        let mut ops = vec![
            ev(0, VarKind::Literal, VarType::Bool, [NO_REG; 4], ParamKind::Register),
            ev(1, VarKind::Literal, VarType::UInt32, [NO_REG; 4], ParamKind::Register),
            ev(2, VarKind::LoopStart, VarType::Void, [NO_REG; 4], ParamKind::Register),
            ev(3, VarKind::LoopPhi, VarType::UInt32, [2, NO_REG, NO_REG, NO_REG], ParamKind::Register),
            ev(4, VarKind::LoopCond, VarType::Void, [2, 0, NO_REG, NO_REG], ParamKind::Register),
            ev(5, VarKind::Add, VarType::UInt32, [3, 3, NO_REG, NO_REG], ParamKind::Register),
            ev(6, VarKind::LoopEnd, VarType::Void, [2, NO_REG, NO_REG, NO_REG], ParamKind::Register),
        ];
        // ids referenced by the loop metadata
        ops[1].id = 2; // outer_in
        ops[5].id = 6; // inner_out
        ops[2].id = start_id;

        let n_params = 0;
        let mut program = KernelProgram {
            backend: crate::state::JitBackend::LlvmSimd,
            size: 16,
            ops,
            n_params,
        };
        let ir = assemble(&st, &mut program);
        assert!(ir.contains("l_2_before:"));
        assert!(ir.contains("l_2_cond:"));
        assert!(ir.contains("l_2_body:"));
        assert!(ir.contains("l_2_done:"));
        assert!(ir.contains("phi <8 x i32>"));
        assert!(ir.contains("@llvm.vector.reduce.or.v8i1"));
        assert!(ir.contains("; Symbolic loop: walk"));
    }

    #[test]
    fn call_lowering_iterates_instances() {
        use crate::state::CallData;
        let mut st = State::new();
        let call_id = 20;
        st.extra.entry(call_id).or_default().call = Some(Box::new(CallData {
            name: "Shape::area".to_string(),
            n_inst: 2,
            inst_hash: vec![1, 2],
            outer_in: vec![2],
            data_offset: vec![0, 16],
            in_offset: vec![0],
            out_offset: vec![4],
            buf_size: 8,
            buf_align: 4,
            use_self: true,
        }));

        let mut ops = vec![
            ev(0, VarKind::Literal, VarType::UInt32, [NO_REG; 4], ParamKind::Register),
            ev(1, VarKind::Literal, VarType::Bool, [NO_REG; 4], ParamKind::Register),
            ev(2, VarKind::Literal, VarType::Float32, [NO_REG; 4], ParamKind::Register),
            ev(3, VarKind::CallStart, VarType::Void, [0, 1, NO_REG, NO_REG], ParamKind::Register),
        ];
        ops[2].id = 2;
        ops[3].id = call_id;

        let mut program = KernelProgram {
            backend: crate::state::JitBackend::LlvmSimd,
            size: 16,
            ops,
            n_params: 0,
        };
        let ir = assemble(&st, &mut program);
        assert!(ir.contains("@callables"));
        assert!(ir.contains("@set_callables"));
        assert!(ir.contains("@llvm.vector.reduce.umax.v8i32"));
        assert!(ir.contains("; Call: Shape::area"));
        assert!(ir.contains("%buffer = alloca i8"));
        assert!(ir.contains("%callables = load"));
    }

    #[test]
    fn opaque_pointer_mode_uses_ptr() {
        let mut st = State::new();
        st.codegen.llvm_version = 16;
        let mut program = KernelProgram {
            backend: crate::state::JitBackend::LlvmSimd,
            size: 16,
            ops: vec![ev(0, VarKind::Counter, VarType::UInt32, [NO_REG; 4], ParamKind::Output)],
            n_params: 1,
        };
        let ir = assemble(&st, &mut program);
        assert!(ir.contains("ptr noalias %params"));
        assert!(!ir.contains("i8**"));
    }
}
