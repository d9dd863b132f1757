//! PTX emitter for the CUDA backend.
//!
//! Mirrors the LLVM emitter's structure for NVPTX: one
//! `.visible .entry glint_<hash>` per kernel with a grid-stride loop over
//! the element range, per-type-class register banks sized by the
//! schedule, and predicated control flow instead of masked intrinsics.
//! Kernel parameters are passed directly (`.param .u64 argN`) while the
//! combined input/output count stays below 128, and through one packed
//! pointer beyond that. Booleans live in predicate registers and cross
//! memory as `u8`.

use crate::fmt::{wfmt, CodeWriter, FmtCtx};
use crate::kernel::{EmitVar, KernelProgram, ParamKind, NO_REG};
use crate::state::State;
use crate::var::{ReduceOp, VarKind};
use crate::vtype::VarType;

use super::{patch_kernel_name, NAME_PLACEHOLDER};

/// Parameter counts below this limit are passed as individual `.param`
/// entries; larger tables go through a single packed pointer.
const DIRECT_PARAM_LIMIT: u32 = 128;

/// Lower a scheduled program into a complete PTX module.
pub(crate) fn assemble(st: &State, program: &mut KernelProgram) -> String {
    let cfg = &st.codegen;
    let direct = program.n_params < DIRECT_PARAM_LIMIT;
    let n_regs = (program.ops.len() as u32).max(3);

    let mut em = Emitter {
        w: CodeWriter::new(FmtCtx::cuda()),
        direct,
        st,
    };

    em.w.put(&format!(
        ".version 6.3\n.target sm_{}{}\n.address_size 64\n\n",
        cfg.cuda_arch.0, cfg.cuda_arch.1
    ));

    if direct {
        em.w.put(&format!(
            ".visible .entry glint_{NAME_PLACEHOLDER}(.param .u32 size{}",
            if program.n_params > 0 { ",\n" } else { ") {" }
        ));
        for slot in 0..program.n_params {
            em.w.put(&format!(
                "                              .param .u64 arg{slot}{}",
                if slot + 1 < program.n_params { ",\n" } else { ") {" }
            ));
        }
        em.w.put("\n");
    } else {
        em.w.put(&format!(
            ".visible .entry glint_{NAME_PLACEHOLDER}(.param .u32 size,\n\
             \x20                             .param .u64 arg) {{\n"
        ));
    }

    // Register banks plus a few fixed scratch registers for addressing,
    // sub-word loads and predicate plumbing.
    em.w.put(&format!("    .reg.b8 %b<{n_regs}>;\n"));
    em.w.put(&format!("    .reg.b16 %w<{n_regs}>, %h<{n_regs}>, %aux0, %aux1;\n"));
    em.w.put(&format!("    .reg.b32 %r<{n_regs}>, %size, %index, %step, %auxr;\n"));
    em.w.put(&format!("    .reg.b64 %rd<{n_regs}>, %out<8>, %arg, %ptr, %ofs;\n"));
    em.w.put(&format!("    .reg.f32 %f<{n_regs}>;\n"));
    em.w.put(&format!("    .reg.f64 %d<{n_regs}>;\n"));
    em.w.put(&format!("    .reg.pred %p<{n_regs}>, %done, %pt0, %pt1;\n\n"));

    em.w.put("    // Grid-stride loop setup\n");
    em.w.put("    ld.param.u32 %size, [size];\n");
    if !direct {
        em.w.put("    ld.param.u64 %arg, [arg];\n");
    }
    em.w.put("    mov.u32 %r0, %ctaid.x;\n");
    em.w.put("    mov.u32 %r1, %ntid.x;\n");
    em.w.put("    mov.u32 %r2, %tid.x;\n");
    em.w.put("    mad.lo.u32 %index, %r0, %r1, %r2;\n");
    em.w.put("    setp.ge.u32 %done, %index, %size;\n");
    em.w.put("    @%done bra L0;\n\n");
    em.w.put("    mov.u32 %r0, %nctaid.x;\n");
    em.w.put("    mul.lo.u32 %step, %r1, %r0;\n\n");
    em.w.put("L1:\n");

    for i in 0..program.ops.len() {
        em.emit(program, i);
    }

    em.w.put("\n    add.u32 %index, %index, %step;\n");
    em.w.put("    setp.ge.u32 %done, %index, %size;\n");
    em.w.put("    @!%done bra L1;\n\nL0:\n    ret;\n}\n");

    let mut module = em.w.buf.take();
    if !em.w.globals.is_empty() {
        module.push('\n');
        module.push_str(em.w.globals.as_str());
    }

    patch_kernel_name(module)
}

struct Emitter<'a> {
    w: CodeWriter,
    direct: bool,
    st: &'a State,
}

impl Emitter<'_> {
    /// Load the raw pointer of parameter slot `slot` into `%ptr`.
    fn param_base(&mut self, slot: u32) {
        if self.direct {
            self.w.put(&format!("    ld.param.u64 %ptr, [arg{slot}];\n"));
        } else {
            self.w.put(&format!("    ld.global.u64 %ptr, [%arg+{}];\n", slot * 8));
        }
    }

    /// Advance `%ptr` to the current lane's element of width `isize`.
    fn index_ptr(&mut self, isize: usize) {
        self.w.put(&format!("    mul.wide.u32 %ofs, %index, {isize};\n"));
        self.w.put("    add.u64 %ptr, %ptr, %ofs;\n");
    }

    fn emit(&mut self, program: &mut KernelProgram, i: usize) {
        let op = &program.ops[i];

        if op.param == ParamKind::Input {
            self.w.put("\n");
            if op.vtype == VarType::Pointer && op.scalar {
                // Pointer literal: the parameter value is the pointer.
                let w = &mut self.w;
                if self.direct {
                    wfmt!(w, "    ld.param.u64 $v, [arg$u];\n", op, op.param_offset);
                } else {
                    wfmt!(w, "    ld.global.u64 $v, [%arg+$u];\n", op, op.param_offset * 8);
                }
                return;
            }

            self.param_base(op.param_offset);
            let load = if op.scalar { "ldu" } else { "ld" };
            if !op.scalar {
                self.index_ptr(op.vtype.size());
            }
            let w = &mut self.w;
            if op.vtype != VarType::Bool {
                wfmt!(w, "    $s.global.$t $v, [%ptr];\n", load, op, op);
            } else {
                wfmt!(w, "    $s.global.u8 %aux0, [%ptr];\n", load);
                wfmt!(w, "    setp.ne.u16 $v, %aux0, 0;\n", op);
            }
            return;
        }

        if op.kind != VarKind::Nop && op.kind != VarKind::Global {
            self.w.put("\n");
        }
        self.render(program, i);

        let op = &program.ops[i];
        if op.param == ParamKind::Output {
            self.param_base(op.param_offset);
            self.index_ptr(op.vtype.size());
            let w = &mut self.w;
            if op.vtype != VarType::Bool {
                wfmt!(w, "    st.global.$t [%ptr], $v;\n", op, op);
            } else {
                wfmt!(w, "    selp.u16 %aux0, 1, 0, $v;\n", op);
                w.put("    st.global.u8 [%ptr], %aux0;\n");
            }
        }
    }

    fn render(&mut self, program: &KernelProgram, i: usize) {
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
                let trimmed = stmt.trim_end();
                if !(trimmed.ends_with(';') || trimmed.ends_with('}')) {
                    w.buf.put(";");
                }
                w.buf.put("\n");
            }

            VarKind::Literal => {
                if v.vtype == VarType::Bool {
                    wfmt!(w, "    mov.pred $v, $u;\n", v, (v.literal != 0) as u32);
                } else if v.vtype.size() == 1 {
                    // 8-bit immediates go through a 16-bit register.
                    wfmt!(w, "    mov.b16 %aux0, $l;\n", v);
                    wfmt!(w, "    cvt.u8.u16 $v, %aux0;\n", v);
                } else {
                    wfmt!(w, "    mov.$b $v, $l;\n", v, v, v);
                }
            }

            VarKind::Counter => {
                wfmt!(w, "    mov.u32 $v, %index;\n", v);
            }

            VarKind::DefaultMask => {
                wfmt!(w, "    setp.lt.u32 $v, $v, %size;\n", v, dep(0));
            }

            VarKind::Neg => {
                if v.vtype.is_uint() {
                    wfmt!(w, "    sub.$t $v, 0, $v;\n", v, v, dep(0));
                } else {
                    wfmt!(w, "    neg.$t $v, $v;\n", v, v, dep(0));
                }
            }

            VarKind::Not => {
                if v.vtype == VarType::Bool {
                    wfmt!(w, "    not.pred $v, $v;\n", v, dep(0));
                } else {
                    wfmt!(w, "    not.$b $v, $v;\n", v, v, dep(0));
                }
            }

            VarKind::Sqrt => {
                wfmt!(w, "    sqrt.rn.$t $v, $v;\n", v, v, dep(0));
            }

            VarKind::Abs => {
                wfmt!(w, "    abs.$t $v, $v;\n", v, v, dep(0));
            }

            VarKind::Add => {
                wfmt!(w, "    add.$t $v, $v, $v;\n", v, v, dep(0), dep(1));
            }

            VarKind::Sub => {
                wfmt!(w, "    sub.$t $v, $v, $v;\n", v, v, dep(0), dep(1));
            }

            VarKind::Mul => {
                if v.vtype.is_float() {
                    wfmt!(w, "    mul.$t $v, $v, $v;\n", v, v, dep(0), dep(1));
                } else {
                    wfmt!(w, "    mul.lo.$t $v, $v, $v;\n", v, v, dep(0), dep(1));
                }
            }

            VarKind::Mulhi => {
                wfmt!(w, "    mul.hi.$t $v, $v, $v;\n", v, v, dep(0), dep(1));
            }

            VarKind::Div => {
                if v.vtype.is_float() {
                    wfmt!(w, "    div.rn.$t $v, $v, $v;\n", v, v, dep(0), dep(1));
                } else {
                    wfmt!(w, "    div.$t $v, $v, $v;\n", v, v, dep(0), dep(1));
                }
            }

            VarKind::Mod => {
                wfmt!(w, "    rem.$t $v, $v, $v;\n", v, v, dep(0), dep(1));
            }

            VarKind::Fma => {
                if v.vtype.is_float() {
                    wfmt!(w, "    fma.rn.$t $v, $v, $v, $v;\n", v, v, dep(0), dep(1), dep(2));
                } else {
                    wfmt!(w, "    mad.lo.$t $v, $v, $v, $v;\n", v, v, dep(0), dep(1), dep(2));
                }
            }

            VarKind::Min => {
                wfmt!(w, "    min.$t $v, $v, $v;\n", v, v, dep(0), dep(1));
            }

            VarKind::Max => {
                wfmt!(w, "    max.$t $v, $v, $v;\n", v, v, dep(0), dep(1));
            }

            VarKind::Ceil | VarKind::Floor | VarKind::Round | VarKind::Trunc => {
                let mode = match v.kind {
                    VarKind::Ceil => "rpi",
                    VarKind::Floor => "rmi",
                    VarKind::Round => "rni",
                    _ => "rzi",
                };
                wfmt!(w, "    cvt.$s.$t.$t $v, $v;\n", mode, v, v, v, dep(0));
            }

            VarKind::Eq | VarKind::Neq | VarKind::Lt | VarKind::Le | VarKind::Gt | VarKind::Ge => {
                let a0 = dep(0);
                if a0.vtype == VarType::Bool {
                    match v.kind {
                        VarKind::Neq => wfmt!(w, "    xor.pred $v, $v, $v;\n", v, a0, dep(1)),
                        VarKind::Eq => {
                            wfmt!(w, "    xor.pred $v, $v, $v;\n", v, a0, dep(1));
                            wfmt!(w, "    not.pred $v, $v;\n", v, v);
                        }
                        _ => panic!("assemble(): ordered comparison of mask arrays!"),
                    }
                    return;
                }
                let name = match v.kind {
                    VarKind::Eq => "eq",
                    VarKind::Neq => "ne",
                    VarKind::Lt => "lt",
                    VarKind::Le => "le",
                    VarKind::Gt => "gt",
                    _ => "ge",
                };
                wfmt!(w, "    setp.$s.$t $v, $v, $v;\n", name, a0, v, a0, dep(1));
            }

            VarKind::Select => {
                let mask = dep(0);
                let t = dep(1);
                let f = dep(2);
                if v.vtype == VarType::Bool {
                    wfmt!(w, "    and.pred %pt0, $v, $v;\n", mask, t);
                    wfmt!(w, "    not.pred %pt1, $v;\n", mask);
                    wfmt!(w, "    and.pred %pt1, %pt1, $v;\n", f);
                    wfmt!(w, "    or.pred $v, %pt0, %pt1;\n", v);
                } else if v.vtype.size() == 1 {
                    // selp has no 8-bit form.
                    wfmt!(w, "    cvt.u16.u8 %aux0, $v;\n", t);
                    wfmt!(w, "    cvt.u16.u8 %aux1, $v;\n", f);
                    wfmt!(w, "    selp.b16 %aux0, %aux0, %aux1, $v;\n", mask);
                    wfmt!(w, "    cvt.u8.u16 $v, %aux0;\n", v);
                } else {
                    wfmt!(w, "    selp.$b $v, $v, $v, $v;\n", v, v, t, f, mask);
                }
            }

            VarKind::Popc | VarKind::Clz | VarKind::Ctz => self.render_bit_count(program, i),

            VarKind::And => {
                let a0 = dep(0);
                let a1 = dep(1);
                if v.vtype == VarType::Bool {
                    wfmt!(w, "    and.pred $v, $v, $v;\n", v, a0, a1);
                } else if a1.vtype == VarType::Bool {
                    // Masked keep/clear.
                    if v.vtype.size() == 1 {
                        wfmt!(w, "    cvt.u16.u8 %aux0, $v;\n", a0);
                        wfmt!(w, "    selp.b16 %aux0, %aux0, 0, $v;\n", a1);
                        wfmt!(w, "    cvt.u8.u16 $v, %aux0;\n", v);
                    } else {
                        wfmt!(w, "    selp.$b $v, $v, 0, $v;\n", v, v, a0, a1);
                    }
                } else {
                    wfmt!(w, "    and.$b $v, $v, $v;\n", v, v, a0, a1);
                }
            }

            VarKind::Or => {
                let a0 = dep(0);
                let a1 = dep(1);
                if v.vtype == VarType::Bool {
                    wfmt!(w, "    or.pred $v, $v, $v;\n", v, a0, a1);
                } else if a1.vtype == VarType::Bool {
                    if v.vtype.size() == 1 {
                        wfmt!(w, "    cvt.u16.u8 %aux0, $v;\n", a0);
                        wfmt!(w, "    selp.b16 %aux0, -1, %aux0, $v;\n", a1);
                        wfmt!(w, "    cvt.u8.u16 $v, %aux0;\n", v);
                    } else {
                        wfmt!(w, "    selp.$b $v, -1, $v, $v;\n", v, v, a0, a1);
                    }
                } else {
                    wfmt!(w, "    or.$b $v, $v, $v;\n", v, v, a0, a1);
                }
            }

            VarKind::Xor => {
                if v.vtype == VarType::Bool {
                    wfmt!(w, "    xor.pred $v, $v, $v;\n", v, dep(0), dep(1));
                } else {
                    wfmt!(w, "    xor.$b $v, $v, $v;\n", v, v, dep(0), dep(1));
                }
            }

            VarKind::Shl | VarKind::Shr => {
                let is_shl = v.kind == VarKind::Shl;
                let amount = dep(1);
                if amount.vtype.size() == 8 {
                    wfmt!(w, "    cvt.u32.u64 %auxr, $v;\n", amount);
                    if is_shl {
                        wfmt!(w, "    shl.$b $v, $v, %auxr;\n", v, v, dep(0));
                    } else {
                        wfmt!(w, "    shr.$t $v, $v, %auxr;\n", v, v, dep(0));
                    }
                } else if is_shl {
                    wfmt!(w, "    shl.$b $v, $v, $v;\n", v, v, dep(0), amount);
                } else {
                    wfmt!(w, "    shr.$t $v, $v, $v;\n", v, v, dep(0), amount);
                }
            }

            VarKind::Cast => self.render_cast(program, i),

            VarKind::Bitcast => {
                wfmt!(w, "    mov.$b $v, $v;\n", v, v, dep(0));
            }

            VarKind::Gather => {
                let ptr = dep(0);
                let index = dep(1);
                let mask = dep(2);
                self.gather_address(ptr, index, v.vtype.size());
                let w = &mut self.w;
                if v.vtype == VarType::Bool {
                    wfmt!(w, "    mov.b16 %aux0, 0;\n");
                    wfmt!(w, "    @$v ld.global.nc.u8 %aux0, [%ptr];\n", mask);
                    wfmt!(w, "    setp.ne.u16 $v, %aux0, 0;\n", v);
                } else {
                    wfmt!(w, "    @!$v mov.$b $v, 0;\n", mask, v, v);
                    wfmt!(w, "    @$v ld.global.nc.$t $v, [%ptr];\n", mask, v, v);
                }
            }

            VarKind::Scatter => {
                let ptr = dep(0);
                let value = dep(1);
                let index = dep(2);
                let mask = dep(3);
                let reduce = ReduceOp::from_literal(v.literal);
                self.gather_address(ptr, index, value.vtype.size());
                let w = &mut self.w;
                match reduce {
                    ReduceOp::None => {
                        if value.vtype == VarType::Bool {
                            wfmt!(w, "    selp.u16 %aux0, 1, 0, $v;\n", value);
                            wfmt!(w, "    @$v st.global.u8 [%ptr], %aux0;\n", mask);
                        } else {
                            wfmt!(w, "    @$v st.global.$t [%ptr], $v;\n", mask, value, value);
                        }
                    }
                    ReduceOp::Add => {
                        wfmt!(w, "    @$v red.global.add.$t [%ptr], $v;\n", mask, value, value);
                    }
                    ReduceOp::Min => {
                        wfmt!(w, "    @$v red.global.min.$t [%ptr], $v;\n", mask, value, value);
                    }
                    ReduceOp::Max => {
                        wfmt!(w, "    @$v red.global.max.$t [%ptr], $v;\n", mask, value, value);
                    }
                    ReduceOp::And => {
                        wfmt!(w, "    @$v red.global.and.$b [%ptr], $v;\n", mask, value, value);
                    }
                    ReduceOp::Or => {
                        wfmt!(w, "    @$v red.global.or.$b [%ptr], $v;\n", mask, value, value);
                    }
                    ReduceOp::Mul => {
                        panic!("assemble(): multiplicative scatter-reduction has no PTX lowering!");
                    }
                }
            }

            VarKind::ScatterInc => {
                let ptr = dep(0);
                let index = dep(1);
                let mask = dep(2);
                self.gather_address(ptr, index, 4);
                let w = &mut self.w;
                wfmt!(w, "    @!$v mov.b32 $v, 0;\n", mask, v);
                wfmt!(w, "    @$v atom.global.add.u32 $v, [%ptr], 1;\n", mask, v);
            }

            VarKind::ScatterKahan => {
                panic!("assemble(): scatter_kahan lowering is tentative and disabled!");
            }
            VarKind::TraceRay => {
                panic!("assemble(): trace_ray lowering is tentative and disabled!");
            }

            VarKind::Load => {
                let ptr = dep(0);
                let mask = dep(1);
                wfmt!(w, "    mov.u64 %ptr, $v;\n", ptr);
                self.index_ptr(v.vtype.size());
                let w = &mut self.w;
                if v.vtype == VarType::Bool {
                    wfmt!(w, "    mov.b16 %aux0, 0;\n");
                    wfmt!(w, "    @$v ld.global.u8 %aux0, [%ptr];\n", mask);
                    wfmt!(w, "    setp.ne.u16 $v, %aux0, 0;\n", v);
                } else {
                    wfmt!(w, "    @!$v mov.$b $v, 0;\n", mask, v, v);
                    wfmt!(w, "    @$v ld.global.$t $v, [%ptr];\n", mask, v, v);
                }
            }

            VarKind::Store => {
                let ptr = dep(0);
                let value = dep(1);
                let mask = dep(2);
                wfmt!(w, "    mov.u64 %ptr, $v;\n", ptr);
                self.index_ptr(value.vtype.size());
                let w = &mut self.w;
                if value.vtype == VarType::Bool {
                    wfmt!(w, "    selp.u16 %aux0, 1, 0, $v;\n", value);
                    wfmt!(w, "    @$v st.global.u8 [%ptr], %aux0;\n", mask);
                } else {
                    wfmt!(w, "    @$v st.global.$t [%ptr], $v;\n", mask, value, value);
                }
            }

            VarKind::CallMask => {
                wfmt!(w, "    mov.pred $v, %mask;\n", v);
            }

            VarKind::CallSelf => {
                wfmt!(w, "    mov.u32 $v, %self;\n", v);
            }

            VarKind::Extract => {
                wfmt!(w, "    mov.$b $v, %out$u;\n", v, v, v.literal as u32);
            }

            VarKind::CallStart => self.render_call(program, i),

            VarKind::LoopStart => {
                let reg = v.reg;
                wfmt!(w, "    bra l_$u_cond;\n\nl_$u_cond:\n", reg, reg);
            }

            VarKind::LoopCond => {
                let start = dep(0);
                let cond = dep(1);
                wfmt!(w, "    @!$v bra l_$u_done;\n\nl_$u_body:\n", cond, start.reg, start.reg);
            }

            VarKind::LoopEnd => {
                let start = dep(0);
                // Close the back-edge: copy the loop-carried outputs into
                // their phi registers, then branch back to the condition.
                let loop_data = self
                    .st
                    .extra
                    .get(&ops[v.dep[0] as usize].id)
                    .and_then(|extra| extra.loop_data.as_deref());
                if let Some(loop_data) = loop_data {
                    for (slot, &inner) in loop_data.inner_out.iter().enumerate() {
                        let Some(inner) = ops.iter().find(|o| o.id == inner) else {
                            continue;
                        };
                        let Some(phi) = ops.iter().find(|o| {
                            o.kind == VarKind::LoopPhi
                                && o.dep[0] == start.reg
                                && o.literal == slot as u64
                        }) else {
                            continue;
                        };
                        let w = &mut self.w;
                        wfmt!(w, "    mov.$b $v, $v;\n", phi, phi, inner);
                    }
                }
                let w = &mut self.w;
                wfmt!(w, "    bra l_$u_cond;\n\nl_$u_done:\n", start.reg, start.reg);
            }

            VarKind::LoopPhi => {
                // Loop entry: seed the phi register from the outer value.
                let start = dep(0);
                let loop_data = self
                    .st
                    .extra
                    .get(&start.id)
                    .and_then(|extra| extra.loop_data.as_deref())
                    .unwrap_or_else(|| {
                        panic!("assemble(): loop node r{} lacks loop metadata!", start.id)
                    });
                let outer = loop_data.outer_in[v.literal as usize];
                let outer = ops
                    .iter()
                    .find(|o| o.id == outer)
                    .unwrap_or_else(|| {
                        panic!("assemble(): loop-carried input r{outer} was not scheduled!")
                    });
                let w = &mut self.w;
                wfmt!(w, "    mov.$b $v, $v;\n", v, v, outer);
            }

            VarKind::Input => unreachable!("render(): handled by caller"),
        }
    }

    /// `%ptr = pointer + index * isize`, with the index width selecting
    /// between a widening and a 64-bit multiply.
    fn gather_address(&mut self, ptr: &EmitVar, index: &EmitVar, isize: usize) {
        let w = &mut self.w;
        if index.vtype.size() == 8 {
            wfmt!(w, "    mul.lo.u64 %ofs, $v, $u;\n", index, isize as u32);
            wfmt!(w, "    add.u64 %ptr, $v, %ofs;\n", ptr);
        } else {
            wfmt!(w, "    mad.wide.u32 %ptr, $v, $u, $v;\n", index, isize as u32, ptr);
        }
    }

    fn render_bit_count(&mut self, program: &KernelProgram, i: usize) {
        let ops = &program.ops;
        let v = &ops[i];
        let a0 = &ops[v.dep[0] as usize];
        let wide = v.vtype.size() == 8;
        let w = &mut self.w;

        // popc/clz produce u32; brev+clz stands in for the missing ctz.
        match (v.kind, wide) {
            (VarKind::Popc, false) => {
                wfmt!(w, "    popc.b32 %auxr, $v;\n", a0);
            }
            (VarKind::Popc, true) => {
                wfmt!(w, "    popc.b64 %auxr, $v;\n", a0);
            }
            (VarKind::Clz, false) => {
                wfmt!(w, "    clz.b32 %auxr, $v;\n", a0);
            }
            (VarKind::Clz, true) => {
                wfmt!(w, "    clz.b64 %auxr, $v;\n", a0);
            }
            (_, false) => {
                wfmt!(w, "    brev.b32 %auxr, $v;\n", a0);
                w.put("    clz.b32 %auxr, %auxr;\n");
            }
            (_, true) => {
                wfmt!(w, "    brev.b64 %ofs, $v;\n", a0);
                w.put("    clz.b64 %auxr, %ofs;\n");
            }
        }
        if wide {
            wfmt!(w, "    cvt.u64.u32 $v, %auxr;\n", v);
        } else {
            wfmt!(w, "    mov.b32 $v, %auxr;\n", v);
        }
    }

    fn render_cast(&mut self, program: &KernelProgram, i: usize) {
        let ops = &program.ops;
        let v = &ops[i];
        let a0 = &ops[v.dep[0] as usize];
        let (src, dst) = (a0.vtype, v.vtype);
        let w = &mut self.w;

        if dst == VarType::Bool {
            wfmt!(w, "    setp.ne.$t $v, $v, 0;\n", a0, v, a0);
        } else if src == VarType::Bool {
            let (one, zero) = match dst {
                VarType::Float32 => ("0f3F800000", "0f00000000"),
                VarType::Float64 => ("0d3FF0000000000000", "0d0000000000000000"),
                _ => ("1", "0"),
            };
            if dst.size() == 1 {
                wfmt!(w, "    selp.b16 %aux0, $s, $s, $v;\n", one, zero, a0);
                wfmt!(w, "    cvt.u8.u16 $v, %aux0;\n", v);
            } else {
                wfmt!(w, "    selp.$t $v, $s, $s, $v;\n", v, v, one, zero, a0);
            }
        } else {
            let round = if dst.is_float() && !src.is_float() {
                ".rn"
            } else if !dst.is_float() && src.is_float() {
                ".rzi"
            } else if dst.is_float() && src.is_float() && dst.size() < src.size() {
                ".rn"
            } else {
                ""
            };
            wfmt!(w, "    cvt$s.$t.$t $v, $v;\n", round, v, a0, v, a0);
        }
    }

    /// Indirect-call lowering: pack live inputs into `.param` space, fetch
    /// the target from the callable table and invoke it through a
    /// `.callprototype`.
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

        let align = call.buf_align.max(1);
        let in_size = call.buf_size.max(1);
        let out_size: u32 = call
            .out_offset
            .iter()
            .filter(|&&offset| offset != u32::MAX)
            .map(|_| 8u32)
            .sum::<u32>()
            .max(1);
        let reg = v.reg;

        self.w.put_global_verbatim(".visible .global .align 8 .u64 callables[];");

        // Resolve the instance id to a function pointer.
        let w = &mut self.w;
        w.put("    // indirect call via table callables\n");
        wfmt!(w, "    mov.u64 %ptr, callables;\n");
        wfmt!(w, "    mad.wide.u32 %ptr, $v, 8, %ptr;\n", self_v);
        w.put("    ld.global.u64 %ptr, [%ptr];\n");

        w.put("    {\n");
        w.put(&format!("    .param .align {align} .b8 param_in[{in_size}];\n"));
        w.put(&format!("    .param .align {align} .b8 param_out[{out_size}];\n"));
        w.put(&format!(
            "    Fproto_{reg}: .callprototype (.param .align {align} .b8 _[{out_size}]) _ \
             (.param .align {align} .b8 _[{in_size}]);\n"
        ));

        for (slot, &outer) in call.outer_in.iter().enumerate() {
            let Some(input) = ops.iter().find(|o| o.id == outer) else {
                continue;
            };
            let offset = call.in_offset[slot];
            let w = &mut self.w;
            if input.vtype == VarType::Bool {
                wfmt!(w, "    selp.u16 %aux0, 1, 0, $v;\n", input);
                wfmt!(w, "    st.param.b8 [param_in+$u], %aux0;\n", offset);
            } else {
                wfmt!(w, "    st.param.$t [param_in+$u], $v;\n", input, offset, input);
            }
        }

        let w = &mut self.w;
        wfmt!(w, "    @$v call (param_out), %ptr, (param_in), Fproto_$u;\n", mask_v, reg);

        for (slot, &offset) in call.out_offset.iter().enumerate() {
            if offset == u32::MAX {
                continue;
            }
            let w = &mut self.w;
            wfmt!(w, "    ld.param.b64 %ofs, [param_out+$u];\n", offset);
            wfmt!(w, "    mov.b64 %out$u, %ofs;\n", slot as u32);
        }
        self.w.put("    }\n");
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
            backend: crate::state::JitBackend::Cuda,
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
        assert!(ir.starts_with(".version 6.3\n.target sm_61\n.address_size 64"));
        assert!(ir.contains(".visible .entry glint_"));
        assert!(!ir.contains("@@@@"));
        assert!(ir.contains("mad.lo.u32 %index, %r0, %r1, %r2;"));
        assert!(ir.contains("mul.lo.u32 %step, %r1, %r0;"));
        assert!(ir.contains("st.global.u32 [%ptr], %r0;"));
        assert!(ir.contains("@!%done bra L1;"));
    }

    #[test]
    fn arithmetic_arms_smoke() {
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
            VarKind::Lt,
        ] {
            let reg = ops.len() as u32;
            let vtype = if matches!(kind, VarKind::Eq | VarKind::Lt) {
                VarType::Bool
            } else {
                VarType::Float32
            };
            ops.push(ev(reg, kind, vtype, [0, 1, NO_REG, NO_REG], ParamKind::Register));
        }
        let reg = ops.len() as u32;
        ops.push(ev(reg, VarKind::Fma, VarType::Float32, [0, 1, 0, NO_REG], ParamKind::Register));

        let ir = assemble_ops(ops);
        assert!(ir.contains("sqrt.rn.f32"));
        assert!(ir.contains("fma.rn.f32"));
        assert!(ir.contains("cvt.rpi.f32.f32"));
        assert!(ir.contains("setp.eq.f32"));
        assert!(ir.contains("div.rn.f32"));
        assert!(ir.contains("min.f32"));
    }

    #[test]
    fn integer_arms_smoke() {
        let mut ops = vec![
            ev(0, VarKind::Literal, VarType::UInt32, [NO_REG; 4], ParamKind::Register),
            ev(1, VarKind::Literal, VarType::UInt32, [NO_REG; 4], ParamKind::Register),
        ];
        for kind in [VarKind::Not, VarKind::Popc, VarKind::Clz, VarKind::Ctz] {
            let reg = ops.len() as u32;
            ops.push(ev(reg, kind, VarType::UInt32, [0, NO_REG, NO_REG, NO_REG], ParamKind::Register));
        }
        for kind in [
            VarKind::Add,
            VarKind::Mul,
            VarKind::Mulhi,
            VarKind::Div,
            VarKind::Mod,
            VarKind::And,
            VarKind::Or,
            VarKind::Xor,
            VarKind::Shl,
            VarKind::Shr,
        ] {
            let reg = ops.len() as u32;
            ops.push(ev(reg, kind, VarType::UInt32, [0, 1, NO_REG, NO_REG], ParamKind::Register));
        }
        let ir = assemble_ops(ops);
        assert!(ir.contains("mul.lo.u32"));
        assert!(ir.contains("mul.hi.u32"));
        assert!(ir.contains("rem.u32"));
        assert!(ir.contains("popc.b32"));
        assert!(ir.contains("brev.b32"));
        assert!(ir.contains("shl.b32"));
        assert!(ir.contains("shr.u32"));
    }

    #[test]
    fn gather_scatter_predicated() {
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
            ev(6, VarKind::ScatterInc, VarType::UInt32, [0, 1, 2, NO_REG], ParamKind::Register),
        ];
        let ir = assemble_ops(ops);
        assert!(ir.contains("ld.global.nc.f32"));
        assert!(ir.contains("mad.wide.u32 %ptr"));
        assert!(ir.contains("red.global.add.f32"));
        assert!(ir.contains("atom.global.add.u32"));
    }

    #[test]
    fn bool_crosses_memory_as_u8() {
        let ops = vec![
            ev(0, VarKind::Input, VarType::Bool, [NO_REG; 4], ParamKind::Input),
            ev(1, VarKind::Not, VarType::Bool, [0, NO_REG, NO_REG, NO_REG], ParamKind::Output),
        ];
        let ir = assemble_ops(ops);
        assert!(ir.contains("ld.global.u8 %aux0"));
        assert!(ir.contains("setp.ne.u16 %p0, %aux0, 0;"));
        assert!(ir.contains("selp.u16 %aux0, 1, 0, %p1;"));
        assert!(ir.contains("st.global.u8 [%ptr], %aux0;"));
    }

    #[test]
    fn packed_parameter_table_beyond_limit() {
        let mut ops = Vec::new();
        for reg in 0..140u32 {
            let mut input = ev(reg, VarKind::Input, VarType::Float32, [NO_REG; 4], ParamKind::Input);
            input.param_offset = reg;
            ops.push(input);
        }
        let ir = assemble_ops(ops);
        assert!(ir.contains(".param .u64 arg) {"));
        assert!(ir.contains("ld.param.u64 %arg, [arg];"));
        assert!(ir.contains("ld.global.u64 %ptr, [%arg+72];"));
        assert!(!ir.contains("arg139"));
    }

    #[test]
    fn direct_parameter_table_below_limit() {
        let ops = vec![
            ev(0, VarKind::Input, VarType::Float32, [NO_REG; 4], ParamKind::Input),
            ev(1, VarKind::Neg, VarType::Float32, [0, NO_REG, NO_REG, NO_REG], ParamKind::Output),
        ];
        let ir = assemble_ops(ops);
        assert!(ir.contains(".param .u64 arg0"));
        assert!(ir.contains(".param .u64 arg1"));
        assert!(ir.contains("ld.param.u64 %ptr, [arg0];"));
    }

    #[test]
    fn stmt_and_global_nodes() {
        let mut global = ev(0, VarKind::Global, VarType::Void, [NO_REG; 4], ParamKind::Register);
        global.stmt = Some(Box::from(
            ".extern .func (.param .b32 rv) vprintf (.param .b64 fmt, .param .b64 buf);",
        ));
        let mut literal = ev(1, VarKind::Literal, VarType::UInt32, [NO_REG; 4], ParamKind::Register);
        literal.literal = 0x2a;
        let mut stmt = ev(2, VarKind::Stmt, VarType::UInt32, [1, NO_REG, NO_REG, NO_REG], ParamKind::Register);
        stmt.stmt = Some(Box::from("mov.$t0 $r0, $r1"));

        let ir = assemble_ops(vec![global, literal, stmt]);
        assert!(ir.contains("mov.b32 %r1, 0x2a;"));
        assert!(ir.contains("mov.u32 %r2, %r1;"));
        assert!(ir.contains("vprintf"));
    }
}
