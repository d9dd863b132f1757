//! The evaluator: dependency traversal, kernel assembly, caching,
//! launching and graph cleanup.
//!
//! Evaluation drains the per-thread todo list, groups the transitive
//! closure of the roots by output size, assembles one kernel per group
//! (largest first), executes it through the backend engine and finally
//! strips the node bodies of everything that now lives in memory.
//!
//! Every variable touched by an evaluation is pinned through a
//! side-effect reference for its duration, so client handles may be
//! dropped concurrently without invalidating in-flight kernels.

use log::debug;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::kernel::{EmitVar, KernelProgram, ParamKind, NO_REG};
use crate::state::{with_lock, with_ts, JitBackend, Lock, State};
use crate::var::{self, VarId, VarKind, VariableKey};
use crate::vtype::VarType;

/// One kernel's worth of work: all scheduled variables of a common size.
struct ScheduledGroup {
    size: u32,
    ids: Vec<VarId>,
}

/// Recursively traverse the dependencies of `root` and append them to
/// `out` in post-order. The first three edges are visited in order of
/// decreasing transitive size, which keeps long dependency chains
/// together and improves register allocation downstream; the fourth edge
/// (scatter masks) follows last.
///
/// The traversal is iterative: accumulation loops produce graphs much
/// deeper than any sane stack limit.
fn traverse(
    st: &State,
    visited: &mut FxHashSet<(u32, VarId)>,
    out: &mut Vec<VarId>,
    size: u32,
    root: VarId,
) {
    let mut stack: Vec<(VarId, bool)> = vec![(root, false)];
    while let Some((id, leave)) = stack.pop() {
        if leave {
            out.push(id);
            continue;
        }
        if id == 0 || !visited.insert((size, id)) {
            continue;
        }
        stack.push((id, true));

        let v = st.var(id);
        let tsize = |dep: VarId| if dep == 0 { 0 } else { st.var(dep).tsize };
        let mut ch = [
            (v.dep[0], tsize(v.dep[0])),
            (v.dep[1], tsize(v.dep[1])),
            (v.dep[2], tsize(v.dep[2])),
        ];
        // Simple sorting network, descending.
        if ch[1].1 < ch[2].1 {
            ch.swap(1, 2);
        }
        if ch[0].1 < ch[2].1 {
            ch.swap(0, 2);
        }
        if ch[0].1 < ch[1].1 {
            ch.swap(0, 1);
        }

        // Pushed in reverse so that visit order is ch[0], ch[1], ch[2],
        // then the fourth edge.
        stack.push((v.dep[3], false));
        stack.push((ch[2].0, false));
        stack.push((ch[1].0, false));
        stack.push((ch[0].0, false));
    }
}

/// Assembled launch description of one group.
struct LaunchJob {
    program: KernelProgram,
    params: Vec<*mut u8>,
    ir: String,
    /// The group contains computation or side effects (not only inputs).
    needs_kernel: bool,
}

fn assemble_group(st: &mut State, backend: JitBackend, group: &ScheduledGroup) -> LaunchJob {
    let size = group.size;
    let mut ops: Vec<EmitVar> = Vec::with_capacity(group.ids.len());
    let mut reg_map: FxHashMap<VarId, u32> = FxHashMap::default();
    let mut n_params = 0u32;
    let mut n_in = 0u32;
    let mut n_out = 0u32;
    let mut needs_kernel = false;

    for (i, &id) in group.ids.iter().enumerate() {
        // Pin for the duration of the evaluation.
        st.inc_ref_se(id);

        let v = st.var(id);
        let is_input = !v.data.is_null();
        let param = if is_input {
            ParamKind::Input
        } else if v.vtype != VarType::Void
            && v.ref_ext > 0
            && v.size == size
            && !matches!(
                v.kind,
                VarKind::Nop
                    | VarKind::Global
                    | VarKind::CallMask
                    | VarKind::CallSelf
                    | VarKind::CallOutput
                    | VarKind::LoopOutput
            )
        {
            ParamKind::Output
        } else {
            ParamKind::Register
        };

        let param_offset = match param {
            ParamKind::Register => u32::MAX,
            _ => {
                let offset = n_params;
                n_params += 1;
                offset
            }
        };
        match param {
            ParamKind::Input => n_in += 1,
            ParamKind::Output => {
                n_out += 1;
                needs_kernel = true;
            }
            ParamKind::Register => {}
        }
        if !is_input
            && matches!(
                v.kind,
                VarKind::Scatter
                    | VarKind::ScatterInc
                    | VarKind::ScatterKahan
                    | VarKind::Store
                    | VarKind::CallStart
                    | VarKind::TraceRay
            )
        {
            needs_kernel = true;
        }

        let mut dep = [NO_REG; 4];
        if !is_input {
            for (slot, &d) in v.dep.iter().enumerate() {
                if d != 0 {
                    dep[slot] = *reg_map.get(&d).unwrap_or_else(|| {
                        panic!("assemble(): dependency r{d} of r{id} was not scheduled!")
                    });
                }
            }
        }

        ops.push(EmitVar {
            id,
            reg: i as u32,
            kind: if is_input { VarKind::Input } else { v.kind },
            vtype: v.vtype,
            scalar: v.size == 1,
            param,
            param_offset,
            literal: v.literal,
            stmt: v.stmt.clone(),
            dep,
            ssa_f32_cast: false,
        });
        reg_map.insert(id, i as u32);
    }

    // Allocate output storage and collect the parameter-pointer table in
    // emission order.
    let mut params: Vec<*mut u8> = vec![std::ptr::null_mut(); n_params as usize];
    for op in &ops {
        match op.param {
            ParamKind::Input => {
                params[op.param_offset as usize] = st.var(op.id).data;
            }
            ParamKind::Output => {
                let bytes = size as usize * op.vtype.size();
                let ptr = st.alloc.alloc(var::alloc_kind_for(backend), bytes);
                if ptr.is_null() {
                    panic!(
                        "{}",
                        crate::error::JitError::AllocFailed {
                            kind: var::alloc_kind_for(backend).name(),
                            bytes,
                        }
                    );
                }
                st.var_mut(op.id).data = ptr;
                params[op.param_offset as usize] = ptr;
            }
            ParamKind::Register => {}
        }
    }

    let mut program = KernelProgram {
        backend,
        size,
        ops,
        n_params,
    };

    let ir = match backend {
        JitBackend::LlvmSimd => crate::backend::llvm::assemble(st, &mut program),
        JitBackend::Cuda => crate::backend::ptx::assemble(st, &mut program),
    };

    debug!(
        "assemble(size={size}): {} op(s), in={n_in}, out={n_out}",
        program.ops.len()
    );
    if st.flags.print_ir {
        debug!("{ir}");
    }

    LaunchJob {
        program,
        params,
        ir,
        needs_kernel,
    }
}

/// Strip node bodies of evaluated variables, clear dirty flags of scatter
/// targets and release every reference the evaluation held.
fn cleanup(st: &mut State, schedule: &[ScheduledGroup], todo: &[VarId]) {
    // Scatter targets first: the kind test below relies on node bodies
    // that the second pass strips.
    for &id in todo {
        let v = st.var(id);
        if matches!(
            v.kind,
            VarKind::Scatter | VarKind::ScatterInc | VarKind::ScatterKahan | VarKind::Store
        ) {
            let ptr = v.dep[0];
            if ptr != 0 {
                let target = st.var(ptr).dep_extra;
                if target != 0 {
                    st.var_mut(target).dirty = false;
                }
            }
        }
    }

    // Newly evaluated variables trade their node body for the buffer:
    // internal edges drop, which garbage-collects most intermediates once
    // the evaluation pins go away.
    for group in schedule {
        for &id in &group.ids {
            let v = st.var(id);
            if v.data.is_null() || v.kind == VarKind::Input {
                continue;
            }
            let key = VariableKey::new(v);
            if st.lvn.get(&key) == Some(&id) {
                st.lvn.remove(&key);
            }
            let v = st.var_mut(id);
            let deps = std::mem::replace(&mut v.dep, [0; 4]);
            v.stmt = None;
            v.kind = VarKind::Input;
            for d in deps {
                st.dec_ref_int(d);
            }
        }
    }

    // Release the evaluation pins, then the todo-list references. Side
    // effects with no other referents die here.
    for group in schedule {
        for &id in &group.ids {
            st.dec_ref_se(id);
        }
    }
    for &id in todo {
        st.dec_ref_se(id);
    }
}

/// Evaluate everything queued on the current thread for `backend`.
pub(crate) fn eval_backend(lock: &mut Lock, backend: JitBackend) {
    let (todo, stream) = with_ts(backend, |ts| (std::mem::take(&mut ts.todo), ts.stream));
    if todo.is_empty() {
        return;
    }
    debug!("eval(): begin ({} root(s))", todo.len());

    // Group the transitive closure of the roots by output size.
    let st = lock.st();
    let mut visited: FxHashSet<(u32, VarId)> = FxHashSet::default();
    let mut schedule: Vec<ScheduledGroup> = Vec::new();
    let mut group_of: FxHashMap<u32, usize> = FxHashMap::default();
    for &root in &todo {
        let size = st.var(root).size;
        let slot = *group_of.entry(size).or_insert_with(|| {
            schedule.push(ScheduledGroup {
                size,
                ids: Vec::new(),
            });
            schedule.len() - 1
        });
        let mut ids = std::mem::take(&mut schedule[slot].ids);
        traverse(st, &mut visited, &mut ids, size, root);
        schedule[slot].ids = ids;
    }
    schedule.sort_by(|a, b| b.size.cmp(&a.size));

    let engine = st.engine(backend);
    let parallel = st.flags.parallel_dispatch && schedule.len() > 1;
    if parallel {
        debug!(
            "eval(): parallel dispatch of {} group(s) to sibling streams",
            schedule.len()
        );
        engine.event_record(stream);
    }

    for (i, group) in schedule.iter().enumerate() {
        let job = assemble_group(lock.st(), backend, group);
        if !job.needs_kernel {
            continue;
        }

        let kernel = match lock.st().kernels.lookup(&job.ir) {
            Some(kernel) => kernel,
            None => {
                let compiled = lock.unlocked(|| engine.compile(&job.ir, &job.program));
                match compiled {
                    Ok((kernel, class)) => {
                        lock.st().kernels.insert(&job.ir, kernel.clone(), class);
                        kernel
                    }
                    Err(err) => panic!("eval(): {err}"),
                }
            }
        };

        // Sibling streams fork off the master stream and join it again,
        // so cross-stream dependencies of later work remain ordered.
        let sub_stream = if parallel { 1000 * (stream + 1) + i as u32 } else { stream };
        if parallel {
            engine.stream_wait_event(sub_stream, stream);
        }
        let launched = lock.unlocked(|| {
            engine.launch(&*kernel, group.size, &job.params, sub_stream)
        });
        if let Err(err) = launched {
            panic!("eval(): {err}");
        }
        lock.st().kernels.stats.launches += 1;
        if parallel {
            engine.event_record(sub_stream);
            engine.stream_wait_event(stream, sub_stream);
        }
    }

    cleanup(lock.st(), &schedule, &todo);
    debug!("eval(): done");
}

/// Evaluate all queued computation of both backends on this thread.
pub fn eval() {
    with_lock(|lock| {
        eval_backend(lock, JitBackend::LlvmSimd);
        eval_backend(lock, JitBackend::Cuda);
    });
}

/// Evaluate all queued computation of one backend on this thread.
pub fn eval_ts(backend: JitBackend) {
    with_lock(|lock| eval_backend(lock, backend));
}
