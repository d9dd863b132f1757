//! The variable store: graph nodes, reference counting and local value
//! numbering.
//!
//! Every node of the computation graph is a [`Variable`] owned by the
//! global [`State`] and addressed by a dense 32-bit id (0 = unset). Three
//! reference counters keep a variable alive: `ref_ext` (client handles),
//! `ref_int` (graph edges) and `ref_se` (pending side effects). A variable
//! is destroyed by the operation that drops the last of the three.

use log::{debug, trace};
use std::hash::{Hash, Hasher};

use crate::malloc::{mem_string, AllocKind};
use crate::state::{with_lock, with_ts, JitBackend, Lock, State};
use crate::vtype::{f16_to_f32, VarType};

/// Variable id; 0 is reserved for "unset".
pub type VarId = u32;

/// Operation performed by a graph node.
///
/// `Input` marks nodes whose value lives in memory (evaluated results,
/// mapped or copied buffers, pointer literals); they contribute data to a
/// kernel but no computation. `Stmt` carries a legacy IR template in
/// [`Variable::stmt`] instead of a fixed lowering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum VarKind {
    Literal,
    Counter,
    Input,
    Stmt,
    Load,
    Store,
    Neg,
    Not,
    Sqrt,
    Abs,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Fma,
    Mulhi,
    Min,
    Max,
    Ceil,
    Floor,
    Round,
    Trunc,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    Select,
    Popc,
    Clz,
    Ctz,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Cast,
    Bitcast,
    Gather,
    Scatter,
    ScatterInc,
    ScatterKahan,
    DefaultMask,
    CallStart,
    CallMask,
    CallSelf,
    CallOutput,
    LoopStart,
    LoopCond,
    LoopEnd,
    LoopPhi,
    LoopOutput,
    TraceRay,
    Extract,
    Nop,
    Global,
}

impl VarKind {
    pub fn name(self) -> &'static str {
        use VarKind::*;
        match self {
            Literal => "literal",
            Counter => "counter",
            Input => "input",
            Stmt => "stmt",
            Load => "load",
            Store => "store",
            Neg => "neg",
            Not => "not",
            Sqrt => "sqrt",
            Abs => "abs",
            Add => "add",
            Sub => "sub",
            Mul => "mul",
            Div => "div",
            Mod => "mod",
            Fma => "fma",
            Mulhi => "mulhi",
            Min => "min",
            Max => "max",
            Ceil => "ceil",
            Floor => "floor",
            Round => "round",
            Trunc => "trunc",
            Eq => "eq",
            Neq => "neq",
            Lt => "lt",
            Le => "le",
            Gt => "gt",
            Ge => "ge",
            Select => "select",
            Popc => "popc",
            Clz => "clz",
            Ctz => "ctz",
            And => "and",
            Or => "or",
            Xor => "xor",
            Shl => "shl",
            Shr => "shr",
            Cast => "cast",
            Bitcast => "bitcast",
            Gather => "gather",
            Scatter => "scatter",
            ScatterInc => "scatter_inc",
            ScatterKahan => "scatter_kahan",
            DefaultMask => "default_mask",
            CallStart => "call",
            CallMask => "call_mask",
            CallSelf => "call_self",
            CallOutput => "call_output",
            LoopStart => "loop_start",
            LoopCond => "loop_cond",
            LoopEnd => "loop_end",
            LoopPhi => "loop_phi",
            LoopOutput => "loop_output",
            TraceRay => "trace_ray",
            Extract => "extract",
            Nop => "nop",
            Global => "global",
        }
    }
}

/// Reduction applied by a scatter, stored in the node's literal payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum ReduceOp {
    None = 0,
    Add = 1,
    Mul = 2,
    Min = 3,
    Max = 4,
    And = 5,
    Or = 6,
}

impl ReduceOp {
    pub fn from_literal(value: u64) -> Self {
        match value {
            0 => ReduceOp::None,
            1 => ReduceOp::Add,
            2 => ReduceOp::Mul,
            3 => ReduceOp::Min,
            4 => ReduceOp::Max,
            5 => ReduceOp::And,
            6 => ReduceOp::Or,
            _ => panic!("ReduceOp::from_literal(): invalid value {value}!"),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ReduceOp::None => "none",
            ReduceOp::Add => "add",
            ReduceOp::Mul => "mul",
            ReduceOp::Min => "min",
            ReduceOp::Max => "max",
            ReduceOp::And => "and",
            ReduceOp::Or => "or",
        }
    }
}

/// A node of the computation graph.
pub struct Variable {
    pub kind: VarKind,
    pub vtype: VarType,
    pub backend: JitBackend,
    /// Logical element count. Size-1 variables broadcast against any size.
    pub size: u32,
    /// Compute dependencies, traversed by the scheduler. Unused slots = 0.
    pub dep: [VarId; 4],
    /// Held reference that is *not* a compute edge: a pointer variable keeps
    /// the buffer it points into alive through this slot.
    pub dep_extra: VarId,
    /// Literal payload: constant bits, scatter [`ReduceOp`], extract index.
    pub literal: u64,
    /// Legacy IR template for `VarKind::Stmt` nodes.
    pub stmt: Option<Box<str>>,
    /// Materialized buffer of `size * vtype.size()` bytes; non-null means
    /// the variable is evaluated and its node body is gone.
    pub data: *mut u8,
    /// Transitive size of the expression rooted here (1 + sum over deps),
    /// used to order scheduler traversal.
    pub tsize: u32,
    pub ref_ext: u32,
    pub ref_int: u32,
    pub ref_se: u32,
    /// Created inside a recorded subroutine body.
    pub symbolic: bool,
    /// A not-yet-evaluated scatter targets this variable's storage.
    pub dirty: bool,
    pub is_literal_zero: bool,
    pub is_literal_one: bool,
    /// The allocator must not free `data` on destruction (mapped memory).
    pub retain_data: bool,
    /// The value *is* a pointer (registered in the reverse pointer table).
    pub direct_pointer: bool,
    /// An entry exists in the sideband `extra` map.
    pub extra: bool,
}

// Variables live in the mutex-protected store, which uniquely owns the
// buffers behind `data`.
unsafe impl Send for Variable {}

impl Variable {
    pub fn new(backend: JitBackend, kind: VarKind, vtype: VarType, size: u32) -> Self {
        Self {
            kind,
            vtype,
            backend,
            size,
            dep: [0; 4],
            dep_extra: 0,
            literal: 0,
            stmt: None,
            data: std::ptr::null_mut(),
            tsize: 1,
            ref_ext: 0,
            ref_int: 0,
            ref_se: 0,
            symbolic: false,
            dirty: false,
            is_literal_zero: false,
            is_literal_one: false,
            retain_data: false,
            direct_pointer: false,
            extra: false,
        }
    }

    /// Whether the node still has a symbolic body (i.e. participates in
    /// code generation rather than contributing a buffer).
    pub fn is_symbolic_body(&self) -> bool {
        self.data.is_null() && !self.direct_pointer
    }

    /// Nodes eligible for the LVN table: symbolic body, non-void result.
    pub fn lvn_eligible(&self) -> bool {
        self.is_symbolic_body() && self.vtype != VarType::Void
    }

    pub fn bytes(&self) -> usize {
        self.size as usize * self.vtype.size()
    }
}

/// Key of the local value numbering table. Two nodes with equal keys
/// compute the same value and may share an id.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct VariableKey {
    kind: VarKind,
    vtype: VarType,
    backend: JitBackend,
    size: u32,
    dep: [VarId; 4],
    literal: u64,
    stmt_hash: u64,
}

impl VariableKey {
    pub fn new(v: &Variable) -> Self {
        let stmt_hash = match &v.stmt {
            Some(stmt) => {
                let mut hasher = rustc_hash::FxHasher::default();
                stmt.as_bytes().hash(&mut hasher);
                hasher.finish()
            }
            None => 0,
        };
        Self {
            kind: v.kind,
            vtype: v.vtype,
            backend: v.backend,
            size: v.size,
            dep: v.dep,
            literal: v.literal,
            stmt_hash,
        }
    }
}

// ====================================================================
// Store primitives
// ====================================================================

impl State {
    /// Look up a variable. An unknown id is always a reference-counting
    /// bug, never a recoverable condition.
    pub fn var(&self, id: VarId) -> &Variable {
        self.variables
            .get(&id)
            .unwrap_or_else(|| panic!("var({id}): unknown variable!"))
    }

    pub fn var_mut(&mut self, id: VarId) -> &mut Variable {
        self.variables
            .get_mut(&id)
            .unwrap_or_else(|| panic!("var({id}): unknown variable!"))
    }

    pub fn inc_ref_ext(&mut self, id: VarId) {
        if id == 0 {
            return;
        }
        let v = self.var_mut(id);
        v.ref_ext += 1;
        trace!("inc_ref_ext({id}): {}", v.ref_ext);
    }

    pub fn inc_ref_int(&mut self, id: VarId) {
        if id == 0 {
            return;
        }
        let v = self.var_mut(id);
        v.ref_int += 1;
        trace!("inc_ref_int({id}): {}", v.ref_int);
    }

    pub fn inc_ref_se(&mut self, id: VarId) {
        if id == 0 {
            return;
        }
        let v = self.var_mut(id);
        v.ref_se += 1;
        trace!("inc_ref_se({id}): {}", v.ref_se);
    }

    pub fn dec_ref_ext(&mut self, id: VarId) {
        if id == 0 {
            return;
        }
        let v = self.var_mut(id);
        if v.ref_ext == 0 {
            panic!("dec_ref_ext(): variable {id} has no external references!");
        }
        v.ref_ext -= 1;
        trace!("dec_ref_ext({id}): {}", v.ref_ext);
        if v.ref_ext == 0 && v.ref_int == 0 && v.ref_se == 0 {
            self.free_variable(id);
        }
    }

    pub fn dec_ref_int(&mut self, id: VarId) {
        if id == 0 {
            return;
        }
        let v = self.var_mut(id);
        if v.ref_int == 0 {
            panic!("dec_ref_int(): variable {id} has no internal references!");
        }
        v.ref_int -= 1;
        trace!("dec_ref_int({id}): {}", v.ref_int);
        if v.ref_ext == 0 && v.ref_int == 0 && v.ref_se == 0 {
            self.free_variable(id);
        }
    }

    pub fn dec_ref_se(&mut self, id: VarId) {
        if id == 0 {
            return;
        }
        let v = self.var_mut(id);
        if v.ref_se == 0 {
            panic!("dec_ref_se(): variable {id} has no side-effect references!");
        }
        v.ref_se -= 1;
        trace!("dec_ref_se({id}): {}", v.ref_se);
        if v.ref_ext == 0 && v.ref_int == 0 && v.ref_se == 0 {
            self.free_variable(id);
        }
    }

    /// Remove a variable from the LVN table, if it owns its entry.
    pub fn lvn_drop(&mut self, id: VarId, v: &Variable) {
        if self.lvn.is_empty() {
            return;
        }
        let key = VariableKey::new(v);
        if self.lvn.get(&key) == Some(&id) {
            self.lvn.remove(&key);
        }
    }

    /// Destruction protocol: LVN drop, buffer release, dependency
    /// decrements (iterative, chains can be very long), reverse-pointer
    /// cleanup, sideband cleanup. Free callbacks are deferred until the
    /// state lock is released.
    fn free_variable(&mut self, id: VarId) {
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            trace!("free_variable({id})");
            let v = self
                .variables
                .remove(&id)
                .unwrap_or_else(|| panic!("free_variable({id}): unknown variable!"));

            if v.lvn_eligible() {
                self.lvn_drop(id, &v);
            }

            if !v.data.is_null() && !v.retain_data {
                self.alloc.free(v.data);
            }

            for &dep in v.dep.iter().chain(std::iter::once(&v.dep_extra)) {
                if dep == 0 {
                    continue;
                }
                let vd = self.var_mut(dep);
                if vd.ref_int == 0 {
                    panic!("free_variable(): variable {dep} has no internal references!");
                }
                vd.ref_int -= 1;
                trace!("dec_ref_int({dep}): {}", vd.ref_int);
                if vd.ref_ext == 0 && vd.ref_int == 0 && vd.ref_se == 0 {
                    work.push(dep);
                }
            }

            if v.direct_pointer {
                let removed = self.variable_from_ptr.remove(&(v.data as usize));
                if removed.is_none() {
                    panic!("free_variable({id}): direct pointer not found in reverse table!");
                }
            }

            if v.extra {
                let extra = self
                    .extra
                    .remove(&id)
                    .unwrap_or_else(|| panic!("free_variable({id}): missing extra record!"));
                if let Some(callback) = extra.free_callback {
                    self.deferred.push(callback);
                }
            }
        }
    }

    fn next_id(&mut self) -> VarId {
        loop {
            let id = self.variable_index;
            self.variable_index = self.variable_index.wrapping_add(1);
            if id != 0 && !self.variables.contains_key(&id) {
                return id;
            }
        }
    }

    /// Append a node to the graph, or return an existing id when local
    /// value numbering finds an equal key. On an LVN hit the passed-in
    /// description is discarded and the dependency references it had
    /// already acquired are rolled back.
    ///
    /// Returns `(id, reused)`. The caller still owns no reference to the
    /// result; it typically follows up with `inc_ref_ext`.
    pub fn var_new(&mut self, v: Variable, disable_lvn: bool) -> (VarId, bool) {
        let use_lvn = !disable_lvn && self.flags.lvn[v.backend as usize] && v.lvn_eligible();

        if use_lvn {
            let key = VariableKey::new(&v);
            if let Some(&existing) = self.lvn.get(&key) {
                for &dep in &v.dep {
                    self.dec_ref_int(dep);
                }
                debug_assert_eq!(v.dep_extra, 0);
                return (existing, true);
            }
            let id = self.next_id();
            self.lvn.insert(key, id);
            self.variables.insert(id, v);
            (id, false)
        } else {
            let id = self.next_id();
            self.variables.insert(id, v);
            (id, false)
        }
    }
}

// ====================================================================
// Variable-level constructors
// ====================================================================

/// Create a literal constant. With `eval` set, the value is materialized
/// immediately through the allocator (`memset_async`) instead of becoming
/// a graph node.
pub(crate) fn literal_impl(
    st: &mut State,
    backend: JitBackend,
    vtype: VarType,
    value: u64,
    size: u32,
    eval: bool,
) -> VarId {
    if size == 0 {
        return 0;
    }

    if eval {
        let ptr = st.alloc.alloc(alloc_kind_for(backend), size as usize * vtype.size());
        if ptr.is_null() {
            panic!("literal(): allocation of {} bytes failed!", size as usize * vtype.size());
        }
        st.alloc.memset_async(ptr, size as usize, vtype.size(), value);
        return mem_map_impl(st, backend, vtype, ptr, size, true);
    }

    let mut v = Variable::new(backend, VarKind::Literal, vtype, size);
    v.literal = value;
    v.is_literal_zero = value == 0;
    v.is_literal_one = value == vtype.one_bits();

    // Large constants are kept out of the LVN table: they are usually
    // scatter targets and deduplicating them would alias unrelated buffers.
    let (id, reused) = st.var_new(v, size != 1);
    st.inc_ref_ext(id);
    debug!(
        "literal({id}): {} = {:#x}, size={size}{}",
        vtype.name(),
        value,
        if reused { " (reused)" } else { "" }
    );
    id
}

/// Create a variable counting `0 .. size-1`.
pub(crate) fn counter_impl(st: &mut State, backend: JitBackend, size: u32) -> VarId {
    if size == 0 {
        return 0;
    }
    let v = Variable::new(backend, VarKind::Counter, VarType::UInt32, size);
    let (id, reused) = st.var_new(v, false);
    st.inc_ref_ext(id);
    debug!("counter({id}): size={size}{}", if reused { " (reused)" } else { "" });
    id
}

/// Register an existing memory region as an (evaluated) variable. With
/// `free_` set, the allocator reclaims the region on destruction.
pub(crate) fn mem_map_impl(
    st: &mut State,
    backend: JitBackend,
    vtype: VarType,
    ptr: *mut u8,
    size: u32,
    free_: bool,
) -> VarId {
    if size == 0 {
        return 0;
    }
    let mut v = Variable::new(backend, VarKind::Input, vtype, size);
    v.data = ptr;
    v.retain_data = !free_;
    let (id, _) = st.var_new(v, true);
    st.inc_ref_ext(id);
    debug!("mem_map({id}): {ptr:p}, size={size}, free={free_}");
    id
}

/// Copy a host memory region into backend storage and register it.
pub(crate) fn mem_copy_impl(
    st: &mut State,
    backend: JitBackend,
    vtype: VarType,
    ptr: *const u8,
    size: u32,
) -> VarId {
    if size == 0 {
        return 0;
    }
    let bytes = size as usize * vtype.size();
    let dst = st.alloc.alloc(alloc_kind_for(backend), bytes);
    if dst.is_null() {
        panic!("mem_copy(): allocation of {bytes} bytes failed!");
    }
    st.alloc.memcpy_async(dst, ptr, bytes);
    let id = mem_map_impl(st, backend, vtype, dst, size, true);
    debug!("mem_copy({id}): size={size}");
    id
}

/// Register a pointer literal. The pointed-into variable `dep` is kept
/// alive through the held (non-traversed) reference slot. Pointers are
/// deduplicated through the reverse pointer table instead of LVN.
pub(crate) fn pointer_impl(
    st: &mut State,
    backend: JitBackend,
    ptr: *const u8,
    dep: VarId,
) -> VarId {
    if let Some(&existing) = st.variable_from_ptr.get(&(ptr as usize)) {
        st.inc_ref_ext(existing);
        return existing;
    }

    let mut v = Variable::new(backend, VarKind::Input, VarType::Pointer, 1);
    v.data = ptr as *mut u8;
    v.retain_data = true;
    v.direct_pointer = true;
    v.dep_extra = dep;
    st.inc_ref_int(dep);

    let (id, _) = st.var_new(v, true);
    st.inc_ref_ext(id);
    st.variable_from_ptr.insert(ptr as usize, id);
    debug!("pointer({id} <- {dep}): {ptr:p}");
    id
}

/// Create a global declaration node (intrinsic/extern declarations that
/// the emitters route into the deduplicated globals section).
pub(crate) fn global_impl(st: &mut State, backend: JitBackend, text: &str) -> VarId {
    let mut v = Variable::new(backend, VarKind::Global, VarType::Void, 1);
    v.stmt = Some(Box::from(text));
    let (id, _) = st.var_new(v, true);
    st.inc_ref_ext(id);
    debug!("global({id})");
    id
}

/// Create a node from a legacy IR template. Statement text is owned by the
/// node and participates in the LVN key via its content hash.
pub(crate) fn stmt_impl(
    lock: &mut Lock,
    backend: JitBackend,
    vtype: VarType,
    stmt: &str,
    deps: &[VarId],
) -> VarId {
    assert!(deps.len() <= 4, "stmt(): at most four dependencies!");
    if deps.iter().all(|&d| d == 0) && !deps.is_empty() {
        return 0;
    }
    if deps.iter().any(|&d| d == 0) && !deps.is_empty() {
        panic!("stmt(): arithmetic involving an uninitialized variable!");
    }

    flush_if_dirty(lock, backend, deps);

    let st = lock.st();
    let mut size = 1u32;
    let mut tsize = 1u32;
    for &d in deps {
        let vd = st.var(d);
        if vd.size != 1 && size != 1 && vd.size != size {
            panic!(
                "stmt(): arithmetic involving arrays of incompatible size ({} and {})!",
                size, vd.size
            );
        }
        size = size.max(vd.size);
        tsize += vd.tsize;
    }

    let mut v = Variable::new(backend, VarKind::Stmt, vtype, size);
    v.stmt = Some(Box::from(stmt));
    v.tsize = tsize;
    for (slot, &d) in deps.iter().enumerate() {
        v.dep[slot] = d;
        st.inc_ref_int(d);
    }

    let (id, reused) = st.var_new(v, false);
    st.inc_ref_ext(id);
    debug!(
        "stmt({id} <- {deps:?}): \"{stmt}\"{}",
        if reused { " (reused)" } else { "" }
    );
    id
}

/// Duplicate a variable: evaluated data is copied, symbolic bodies are
/// cloned with LVN disabled so the copy receives a fresh id.
pub(crate) fn copy_impl(lock: &mut Lock, id: VarId) -> VarId {
    if id == 0 {
        return 0;
    }
    if lock.st().var(id).dirty {
        eval_var_impl(lock, id);
    }

    let st = lock.st();
    let v = st.var(id);
    let new_id = if !v.data.is_null() {
        let (backend, vtype, data, size) = (v.backend, v.vtype, v.data, v.size);
        mem_copy_impl(st, backend, vtype, data, size)
    } else {
        let mut copy = Variable::new(v.backend, v.kind, v.vtype, v.size);
        copy.dep = v.dep;
        copy.literal = v.literal;
        copy.stmt = v.stmt.clone();
        copy.tsize = v.tsize;
        copy.symbolic = v.symbolic;
        copy.is_literal_zero = v.is_literal_zero;
        copy.is_literal_one = v.is_literal_one;
        let deps = copy.dep;
        for &dep in &deps {
            st.inc_ref_int(dep);
        }
        let (new_id, _) = st.var_new(copy, true);
        st.inc_ref_ext(new_id);
        new_id
    };
    debug!("copy({new_id} <- {id})");
    new_id
}

/// Resize a scalar variable (or a literal) to a new length.
pub(crate) fn resize_impl(lock: &mut Lock, id: VarId, size: u32) -> VarId {
    let st = lock.st();
    let v = st.var(id);
    debug!("resize({id}): {size}");

    if v.size == size {
        st.inc_ref_ext(id);
        return id;
    }
    if v.size != 1 {
        panic!(
            "resize(): variable {id} must be a scalar, but has size {}!",
            v.size
        );
    }

    if v.kind == VarKind::Literal {
        let (backend, vtype, literal) = (v.backend, v.vtype, v.literal);
        return literal_impl(st, backend, vtype, literal, size, false);
    }

    if v.is_symbolic_body() && v.ref_int == 0 && v.ref_ext == 1 {
        // Sole handle on an unevaluated scalar: rewrite in place.
        let key_src = VariableKey::new(v);
        if st.lvn.get(&key_src).copied() == Some(id) {
            st.lvn.remove(&key_src);
        }
        let v = st.var_mut(id);
        v.size = size;
        st.inc_ref_ext(id);
        return id;
    }

    // Broadcast through a same-type reinterpretation node of the wider
    // size; the scalar operand replicates inside the kernel.
    let (backend, vtype) = {
        let v = st.var(id);
        (v.backend, v.vtype)
    };
    let mut bcast = Variable::new(backend, VarKind::Bitcast, vtype, size);
    bcast.dep[0] = id;
    bcast.tsize = 1 + st.var(id).tsize;
    st.inc_ref_int(id);
    let (new_id, _) = st.var_new(bcast, true);
    st.inc_ref_ext(new_id);
    new_id
}

/// Migrate a variable's storage to a different allocation flavor,
/// evaluating it first. Returns a new reference: the same id when no move
/// is necessary, otherwise a fresh variable holding a copy of the data.
pub(crate) fn migrate_impl(lock: &mut Lock, id: VarId, kind: AllocKind) -> VarId {
    if id == 0 {
        return 0;
    }
    eval_var_impl(lock, id);

    let st = lock.st();
    let v = st.var(id);
    let src = v.data;
    let bytes = v.bytes();
    if !st.alloc.owns(src) {
        panic!("migrate(): cannot resolve pointer of variable {id} to an allocation!");
    }

    if st.alloc.kind_of(src) == kind {
        st.inc_ref_ext(id);
        debug!("migrate({id}): no move necessary");
        return id;
    }

    let dst = st.alloc.alloc(kind, bytes);
    if dst.is_null() {
        panic!("migrate(): allocation of {bytes} bytes failed!");
    }
    st.alloc.memcpy_async(dst, src, bytes);

    let v = st.var(id);
    let mut copy = Variable::new(v.backend, VarKind::Input, v.vtype, v.size);
    copy.data = dst;
    let (new_id, _) = st.var_new(copy, true);
    st.inc_ref_ext(new_id);
    debug!("migrate({new_id} <- {id}): {src:p} -> {dst:p} ({})", kind.name());
    new_id
}

pub(crate) fn alloc_kind_for(backend: JitBackend) -> AllocKind {
    match backend {
        JitBackend::LlvmSimd => AllocKind::HostAsync,
        JitBackend::Cuda => AllocKind::Device,
    }
}

/// Evaluate the thread state of `backend` if any of `deps` is dirty, and
/// panic if a dependency remains dirty afterwards.
pub(crate) fn flush_if_dirty(lock: &mut Lock, backend: JitBackend, deps: &[VarId]) {
    let any_dirty = {
        let st = lock.st();
        deps.iter().any(|&d| d != 0 && st.var(d).dirty)
    };
    if !any_dirty {
        return;
    }
    crate::eval::eval_backend(lock, backend);
    let st = lock.st();
    for &d in deps {
        if d != 0 && st.var(d).dirty {
            panic!("flush_if_dirty(): variable {d} remains dirty after evaluation!");
        }
    }
}

// ====================================================================
// Scheduling, evaluation entry points
// ====================================================================

/// Push a variable onto its thread's todo list. Every queued entry holds
/// a side-effect reference that the evaluator releases after the run, so
/// ids on the list can never dangle.
pub(crate) fn todo_push(st: &mut State, id: VarId) {
    st.inc_ref_se(id);
    let backend = st.var(id).backend;
    with_ts(backend, |ts| ts.todo.push(id));
}

/// Queue a variable for the next `eval()`. Returns whether anything was
/// scheduled.
pub(crate) fn schedule_impl(st: &mut State, id: VarId) -> bool {
    if id == 0 {
        return false;
    }
    let v = st.var(id);
    if v.is_symbolic_body() {
        todo_push(st, id);
        debug!("schedule({id})");
        true
    } else {
        v.dirty
    }
}

/// Evaluate a single variable right away if it is unevaluated or dirty.
/// Returns whether any work was performed.
pub(crate) fn eval_var_impl(lock: &mut Lock, id: VarId) -> bool {
    let st = lock.st();
    let v = st.var(id);
    let unevaluated = v.is_symbolic_body();
    let backend = v.backend;

    if !unevaluated && !v.dirty {
        return false;
    }

    if unevaluated {
        if v.is_literal_zero {
            // An all-zeros constant does not deserve a kernel; clear it
            // with an asynchronous memset instead. This is the common
            // "allocate zeros, then scatter into them" pattern.
            let bytes = v.bytes();
            let size = v.size as usize;
            let isize_ = v.vtype.size();
            let key = VariableKey::new(v);
            if st.lvn.get(&key) == Some(&id) {
                st.lvn.remove(&key);
            }
            let ptr = st.alloc.alloc(alloc_kind_for(backend), bytes);
            if ptr.is_null() {
                panic!("eval_var(): allocation of {bytes} bytes failed!");
            }
            st.alloc.memset_async(ptr, size, isize_, 0);
            let v = st.var_mut(id);
            v.data = ptr;
            v.kind = VarKind::Input;
            v.is_literal_zero = false;
            v.literal = 0;
            debug!("eval_var({id}): zero-initialized via memset");
            return true;
        }
        todo_push(st, id);
    }

    crate::eval::eval_backend(lock, backend);

    let st = lock.st();
    let v = st.var(id);
    if v.dirty {
        panic!("eval_var({id}): variable remains dirty after evaluation!");
    }
    if v.is_symbolic_body() {
        panic!("eval_var({id}): invalid/uninitialized variable!");
    }
    true
}

/// Mark a node as a side effect: it is queued on the thread's todo list,
/// acquires a side-effect reference that keeps it alive until the next
/// evaluation, and (unless a virtual call is being recorded) marks the
/// scatter target dirty.
pub(crate) fn mark_side_effect_impl(st: &mut State, id: VarId, target: VarId) {
    debug!("mark_side_effect({id}, target={target})");
    todo_push(st, id);
    let backend = st.var(id).backend;
    with_ts(backend, |ts| ts.side_effect_counter += 1);

    if target != 0 && !st.flags.recording_vcall {
        st.var_mut(target).dirty = true;
    }
}

// ====================================================================
// Element access and stringification
// ====================================================================

/// Read one element as a zero-extended bit pattern, evaluating first.
pub(crate) fn read_impl(lock: &mut Lock, id: VarId, offset: u32) -> u64 {
    eval_var_impl(lock, id);
    let st = lock.st();
    let v = st.var(id);
    let offset = if v.size == 1 { 0 } else { offset };
    if offset >= v.size {
        panic!(
            "read(): attempted to access entry {offset} in an array of size {}!",
            v.size
        );
    }
    let isize_ = v.vtype.size();
    let mut bits = 0u64;
    unsafe {
        std::ptr::copy_nonoverlapping(
            v.data.add(offset as usize * isize_),
            &mut bits as *mut u64 as *mut u8,
            isize_,
        );
    }
    bits
}

/// Overwrite one element with the given bit pattern, evaluating first.
pub(crate) fn write_impl(lock: &mut Lock, id: VarId, offset: u32, bits: u64) {
    eval_var_impl(lock, id);
    let st = lock.st();
    let v = st.var(id);
    if offset >= v.size {
        panic!(
            "write(): attempted to access entry {offset} in an array of size {}!",
            v.size
        );
    }
    let isize_ = v.vtype.size();
    unsafe {
        std::ptr::copy_nonoverlapping(
            &bits as *const u64 as *const u8,
            v.data.add(offset as usize * isize_),
            isize_,
        );
    }
}

fn fmt_scalar(vtype: VarType, bits: u64) -> String {
    use VarType::*;
    match vtype {
        Bool => format!("{}", (bits != 0) as u8),
        Int8 => format!("{}", bits as i8),
        UInt8 => format!("{}", bits as u8),
        Int16 => format!("{}", bits as i16),
        UInt16 => format!("{}", bits as u16),
        Int32 => format!("{}", bits as i32),
        UInt32 => format!("{}", bits as u32),
        Int64 => format!("{}", bits as i64),
        UInt64 => format!("{}", bits),
        Float16 => format!("{}", f16_to_f32(bits as u16)),
        Float32 => format!("{}", f32::from_bits(bits as u32)),
        Float64 => format!("{}", f64::from_bits(bits)),
        Pointer => format!("{bits:#x}"),
        Void => "(void)".to_string(),
    }
}

/// Human-readable summary of a variable's contents, e.g. `[1, 2, 3]`.
/// Large arrays elide their middle according to the print limit.
pub(crate) fn to_str_impl(lock: &mut Lock, id: VarId) -> String {
    eval_var_impl(lock, id);
    let st = lock.st();
    let v = st.var(id);
    let (size, vtype) = (v.size, v.vtype);
    let limit = st.print_limit;
    let shown_half = (limit / 2).max(1);

    let mut out = String::from("[");
    let mut i = 0u32;
    while i < size {
        if size > limit && i == shown_half {
            out.push_str(&format!(".. {} skipped .., ", size - 2 * shown_half));
            i = size - shown_half;
            continue;
        }
        let bits = {
            let v = st.var(id);
            let isize_ = vtype.size();
            let mut bits = 0u64;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    v.data.add(i as usize * isize_),
                    &mut bits as *mut u64 as *mut u8,
                    isize_,
                );
            }
            bits
        };
        out.push_str(&fmt_scalar(vtype, bits));
        if i + 1 < size {
            out.push_str(", ");
        }
        i += 1;
    }
    out.push(']');
    out
}

// ====================================================================
// Labels, callbacks, diagnostics
// ====================================================================

pub(crate) fn set_label_impl(st: &mut State, id: VarId, label: &str) {
    st.var_mut(id).extra = true;
    st.extra.entry(id).or_default().label = Some(label.to_string());
    debug!("set_label({id}): \"{label}\"");
}

pub(crate) fn label_impl(st: &State, id: VarId) -> Option<String> {
    st.extra.get(&id).and_then(|e| e.label.clone())
}

pub(crate) fn set_callback_impl(
    st: &mut State,
    id: VarId,
    callback: Box<dyn FnOnce() + Send>,
) {
    st.var_mut(id).extra = true;
    let extra = st.extra.entry(id).or_default();
    if extra.free_callback.is_some() {
        panic!("set_callback(): a callback was already set on variable {id}!");
    }
    extra.free_callback = Some(callback);
}

/// Human-readable summary of all registered variables, kernel statistics
/// and allocator statistics.
pub(crate) fn whos_impl(st: &State) -> String {
    let mut out = String::new();
    out.push_str("\n  ID        Backend  Type  Status       E/I/S Refs  Entries   Storage     Label\n");
    out.push_str("  ===============================================================================\n");

    let mut indices: Vec<VarId> = st.variables.keys().copied().collect();
    indices.sort_unstable();

    let mut evaluated = 0usize;
    let mut unevaluated = 0usize;
    let mut saved = 0usize;

    for id in indices.iter().copied() {
        let v = st.var(id);
        let bytes = v.bytes();
        let status = if v.direct_pointer {
            "direct ptr."
        } else if !v.data.is_null() {
            if st.alloc.owns(v.data) {
                st.alloc.kind_of(v.data).name()
            } else {
                "mapped mem."
            }
        } else {
            "[not ready]"
        };
        let refs = format!("{}/{}/{}", v.ref_ext, v.ref_int, v.ref_se);
        let label = label_impl(st, id).unwrap_or_default();
        out.push_str(&format!(
            "  {:<9} {:<8} {:<5} {:<12} {:<11} {:<9} {:<11} {}\n",
            id,
            v.backend.name(),
            v.vtype.name_short(),
            status,
            refs,
            v.size,
            mem_string(bytes),
            label
        ));

        if v.direct_pointer {
            continue;
        } else if !v.data.is_null() {
            evaluated += bytes;
        } else if v.ref_ext == 0 {
            saved += bytes;
        } else {
            unevaluated += bytes;
        }
    }
    if st.variables.is_empty() {
        out.push_str("                        -- No variables registered --\n");
    }
    out.push_str("  ===============================================================================\n\n");

    let stats = &st.kernels.stats;
    out.push_str("  JIT compiler\n  ============\n");
    out.push_str(&format!("   - Memory usage (evaluated)   : {}.\n", mem_string(evaluated)));
    out.push_str(&format!("   - Memory usage (unevaluated) : {}.\n", mem_string(unevaluated)));
    out.push_str(&format!("   - Memory usage (saved)       : {}.\n", mem_string(saved)));
    out.push_str(&format!(
        "   - Kernel launches            : {} ({} cache hits, {} soft, {} hard misses).\n\n",
        stats.launches, stats.hits, stats.soft_misses, stats.hard_misses
    ));

    out.push_str("  Memory allocator\n  ================\n");
    for kind in [
        AllocKind::Host,
        AllocKind::HostPinned,
        AllocKind::HostAsync,
        AllocKind::Device,
    ] {
        out.push_str(&format!(
            "   - {:<12}: {}/{} used (peak: {}).\n",
            kind.name(),
            mem_string(st.alloc.usage(kind)),
            mem_string(st.alloc.allocated(kind)),
            mem_string(st.alloc.watermark(kind))
        ));
    }
    out
}

/// GraphViz dump of the live graph.
pub(crate) fn graphviz_impl(st: &State) -> String {
    let mut indices: Vec<VarId> = st.variables.keys().copied().collect();
    indices.sort_unstable();

    let mut out = String::new();
    out.push_str("digraph {\n");
    out.push_str("  node [shape=record fontname=Consolas];\n");
    for id in indices {
        let v = st.var(id);
        let color = if v.direct_pointer {
            " fillcolor=wheat style=filled"
        } else if !v.data.is_null() {
            " fillcolor=salmon style=filled"
        } else if v.ref_se > 0 {
            " fillcolor=cornflowerblue style=filled"
        } else {
            ""
        };
        let label = label_impl(st, id)
            .map(|l| format!("|Label: \\\"{l}\\\""))
            .unwrap_or_default();
        out.push_str(&format!(
            "  {id} [label=\"{{{}{label}{}|{{Type: {} {}|Size: {}}}|{{ID #{id}|E:{}|I:{}|S:{}}}}}\"{color}];\n",
            v.kind.name(),
            if v.dirty { "| ** DIRTY **" } else { "" },
            v.backend.name(),
            v.vtype.name_short(),
            v.size,
            v.ref_ext,
            v.ref_int,
            v.ref_se,
        ));
        for (slot, &dep) in v.dep.iter().enumerate() {
            if dep != 0 {
                out.push_str(&format!("  {dep} -> {id} [label=\" {}\"];\n", slot + 1));
            }
        }
        if v.dep_extra != 0 {
            out.push_str(&format!("  {} -> {id} [style=dashed];\n", v.dep_extra));
        }
    }
    out.push_str("}\n");
    out
}

// ====================================================================
// Public API
// ====================================================================

/// Increase the external (client handle) reference count.
pub fn inc_ref(id: VarId) {
    if id != 0 {
        with_lock(|lock| lock.st().inc_ref_ext(id));
    }
}

/// Decrease the external reference count, destroying the variable when it
/// was the last reference of any flavor.
pub fn dec_ref(id: VarId) {
    if id != 0 {
        with_lock(|lock| lock.st().dec_ref_ext(id));
    }
}

/// Element type of a variable.
pub fn vtype(id: VarId) -> VarType {
    with_lock(|lock| lock.st().var(id).vtype)
}

/// Logical element count of a variable.
pub fn size(id: VarId) -> u32 {
    with_lock(|lock| lock.st().var(id).size)
}

/// Pointer to the variable's materialized storage, evaluating if needed.
pub fn ptr(id: VarId) -> *mut u8 {
    with_lock(|lock| {
        eval_var_impl(lock, id);
        lock.st().var(id).data
    })
}

pub fn literal(backend: JitBackend, vtype: VarType, value: u64, size: u32, eval: bool) -> VarId {
    with_lock(|lock| literal_impl(lock.st(), backend, vtype, value, size, eval))
}

pub fn counter(backend: JitBackend, size: u32) -> VarId {
    with_lock(|lock| counter_impl(lock.st(), backend, size))
}

pub fn stmt(backend: JitBackend, vtype: VarType, template: &str, deps: &[VarId]) -> VarId {
    with_lock(|lock| stmt_impl(lock, backend, vtype, template, deps))
}

pub fn mem_map(backend: JitBackend, vtype: VarType, ptr: *mut u8, size: u32, free: bool) -> VarId {
    with_lock(|lock| mem_map_impl(lock.st(), backend, vtype, ptr, size, free))
}

pub fn mem_copy(backend: JitBackend, vtype: VarType, ptr: *const u8, size: u32) -> VarId {
    with_lock(|lock| mem_copy_impl(lock.st(), backend, vtype, ptr, size))
}

pub fn pointer(backend: JitBackend, ptr: *const u8, dep: VarId) -> VarId {
    with_lock(|lock| pointer_impl(lock.st(), backend, ptr, dep))
}

pub fn copy(id: VarId) -> VarId {
    with_lock(|lock| copy_impl(lock, id))
}

pub fn resize(id: VarId, size: u32) -> VarId {
    with_lock(|lock| resize_impl(lock, id, size))
}

pub fn migrate(id: VarId, kind: AllocKind) -> VarId {
    with_lock(|lock| migrate_impl(lock, id, kind))
}

/// Queue a variable for the next `eval()`.
pub fn schedule(id: VarId) -> bool {
    with_lock(|lock| schedule_impl(lock.st(), id))
}

/// Evaluate a variable right away if unevaluated or dirty.
pub fn eval_var(id: VarId) -> bool {
    with_lock(|lock| eval_var_impl(lock, id))
}

/// Read one element as a zero-extended bit pattern.
pub fn read(id: VarId, offset: u32) -> u64 {
    with_lock(|lock| read_impl(lock, id, offset))
}

/// Overwrite one element with a bit pattern.
pub fn write(id: VarId, offset: u32, bits: u64) {
    with_lock(|lock| write_impl(lock, id, offset, bits))
}

/// Stringify the contents of a variable, evaluating it first.
pub fn to_str(id: VarId) -> String {
    with_lock(|lock| to_str_impl(lock, id))
}

pub fn set_label(id: VarId, label: &str) {
    with_lock(|lock| set_label_impl(lock.st(), id, label));
}

pub fn label(id: VarId) -> Option<String> {
    with_lock(|lock| label_impl(lock.st(), id))
}

/// Register a callback invoked (outside the state lock) when the variable
/// is destroyed.
pub fn set_callback(id: VarId, callback: Box<dyn FnOnce() + Send>) {
    with_lock(|lock| set_callback_impl(lock.st(), id, callback));
}

/// Human-readable summary of the variable store.
pub fn whos() -> String {
    with_lock(|lock| whos_impl(lock.st()))
}

/// GraphViz dump of the live graph.
pub fn graphviz() -> String {
    with_lock(|lock| graphviz_impl(lock.st()))
}

/// Number of live variables (diagnostics and tests).
pub fn registered() -> usize {
    with_lock(|lock| lock.st().variables.len())
}
