//! Process-wide JIT state and per-thread evaluation state.
//!
//! A single mutex serializes node creation, reference counting and LVN
//! lookups. Backend compilation and kernel launches run *outside* the
//! critical section through [`Lock::unlocked`], and free callbacks
//! registered on variables fire after the lock has been released.

use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::engine::Engine;
use crate::kernel::KernelCache;
use crate::malloc::Allocator;
use crate::var::{VarId, Variable, VariableKey};

/// Code generation backend of a variable or kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum JitBackend {
    /// Vectorized CPU execution through LLVM IR.
    LlvmSimd,
    /// CUDA execution through PTX.
    Cuda,
}

pub const BACKEND_COUNT: usize = 2;

impl JitBackend {
    pub fn name(self) -> &'static str {
        match self {
            JitBackend::LlvmSimd => "llvm",
            JitBackend::Cuda => "cuda",
        }
    }
}

/// Runtime toggles. All default to the production configuration.
pub struct JitFlags {
    /// Enable local value numbering per backend.
    pub lvn: [bool; BACKEND_COUNT],
    /// A virtual-call body is being recorded: scatters must not mark their
    /// target dirty, the deferred write happens at call lowering.
    pub recording_vcall: bool,
    /// Dispatch independent size-groups onto sibling streams.
    pub parallel_dispatch: bool,
    /// Dump every assembled kernel via `log::debug`.
    pub print_ir: bool,
}

impl Default for JitFlags {
    fn default() -> Self {
        Self {
            lvn: [true; BACKEND_COUNT],
            recording_vcall: false,
            parallel_dispatch: false,
            print_ir: false,
        }
    }
}

/// Code generation parameters of the process.
pub struct CodegenConfig {
    /// SIMD lanes per iteration of the LLVM kernel loop.
    pub llvm_width: u32,
    /// Targeted LLVM major version; selects typed vs. opaque pointers and
    /// the min/max intrinsic polyfill.
    pub llvm_version: u32,
    /// Targeted PTX compute capability, e.g. (6, 1) for `sm_61`.
    pub cuda_arch: (u32, u32),
    /// `target-cpu` attribute stamped on LLVM kernels.
    pub llvm_target_cpu: &'static str,
}

impl Default for CodegenConfig {
    fn default() -> Self {
        Self {
            llvm_width: 8,
            llvm_version: 15,
            cuda_arch: (6, 1),
            llvm_target_cpu: "generic",
        }
    }
}

/// Optional per-variable payload, allocated only when first needed.
#[derive(Default)]
pub struct Extra {
    /// Descriptive label shown in diagnostics and IR comments.
    pub label: Option<String>,
    /// Invoked (outside the state lock) when the variable is destroyed.
    pub free_callback: Option<Box<dyn FnOnce() + Send>>,
    /// Metadata of a recorded virtual call rooted at this variable.
    pub call: Option<Box<CallData>>,
    /// Metadata of a recorded loop rooted at this variable.
    pub loop_data: Option<Box<LoopData>>,
}

/// Recorded virtual-call metadata, attached to a `CallStart` variable.
///
/// Per-instance captured pointers live in a concatenated buffer addressed
/// through `offset[inst]`, the wire format expected by callable bodies.
pub struct CallData {
    pub name: String,
    pub n_inst: u32,
    /// Content hash of each instance's compiled body, used to name
    /// `@func_<hash>` symbols in the callable table.
    pub inst_hash: Vec<u64>,
    /// Input variables captured at record time (outer scope).
    pub outer_in: Vec<VarId>,
    /// Wire format of per-instance captured state: `data_offset[inst]`
    /// is the base of that instance's record inside the concatenated
    /// capture buffer.
    pub data_offset: Vec<u32>,
    /// Byte offset of every forwarded input inside the parameter buffer.
    pub in_offset: Vec<u32>,
    /// Output slots; `u32::MAX` marks an elided output.
    pub out_offset: Vec<u32>,
    /// Total parameter-buffer footprint in bytes (per lane).
    pub buf_size: u32,
    pub buf_align: u32,
    pub use_self: bool,
}

/// Recorded loop metadata, attached to a `LoopStart` variable.
pub struct LoopData {
    pub name: String,
    /// Loop-carried state: value at entry (outer scope).
    pub outer_in: Vec<VarId>,
    /// Loop-carried state: value at the end of the body.
    pub inner_out: Vec<VarId>,
}

/// Global JIT compiler state protected by [`lock`].
pub struct State {
    /// All live variables, keyed by id. Ids are dense but become sparse as
    /// variables are destroyed; id 0 is reserved for "unset".
    pub variables: FxHashMap<VarId, Variable>,
    /// Local value numbering table used for common subexpression
    /// elimination at construction time. Holds ids, never pointers.
    pub lvn: FxHashMap<VariableKey, VarId>,
    /// Reverse map used when external memory is pinned as a variable.
    pub variable_from_ptr: FxHashMap<usize, VarId>,
    /// Sideband records (labels, callbacks, call/loop metadata).
    pub extra: FxHashMap<VarId, Extra>,
    /// Monotonic id source; skips 0 on wraparound.
    pub variable_index: VarId,
    pub alloc: Allocator,
    pub kernels: KernelCache,
    pub engines: [Option<Arc<dyn Engine>>; BACKEND_COUNT],
    pub flags: JitFlags,
    pub codegen: CodegenConfig,
    /// Maximum number of elements printed by `var::to_str`.
    pub print_limit: u32,
    /// Closures to run once the state lock is released.
    pub deferred: Vec<Box<dyn FnOnce() + Send>>,
    /// Backend used by newly created client arrays.
    pub default_backend: Option<JitBackend>,
}

impl State {
    pub(crate) fn new() -> Self {
        Self {
            variables: FxHashMap::default(),
            lvn: FxHashMap::default(),
            variable_from_ptr: FxHashMap::default(),
            extra: FxHashMap::default(),
            variable_index: 1,
            alloc: Allocator::new(),
            kernels: KernelCache::default(),
            engines: [None, None],
            flags: JitFlags::default(),
            codegen: CodegenConfig::default(),
            print_limit: 20,
            deferred: Vec::new(),
            default_backend: None,
        }
    }

    pub fn engine(&self, backend: JitBackend) -> Arc<dyn Engine> {
        self.engines[backend as usize]
            .clone()
            .unwrap_or_else(|| panic!("engine(): backend {} not initialized, call init() first!",
                                      backend.name()))
    }
}

static STATE: OnceLock<Mutex<State>> = OnceLock::new();

fn mutex() -> &'static Mutex<State> {
    STATE.get_or_init(|| Mutex::new(State::new()))
}

/// Re-lockable handle on the global state. Holding a `Lock` is the
/// capability required by every operation that touches the variable store.
pub struct Lock {
    guard: Option<MutexGuard<'static, State>>,
}

impl Lock {
    fn acquire() -> Self {
        // A panic while the lock was held (a fatal diagnostic) must not
        // wedge every subsequent operation in the process.
        let guard = match mutex().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Lock { guard: Some(guard) }
    }

    pub fn st(&mut self) -> &mut State {
        self.guard.as_mut().expect("state lock released")
    }

    /// Run `f` with the state lock released, re-acquiring it afterwards.
    /// Used around backend compilation and kernel launches.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.guard = None;
        let result = f();
        self.guard = Some(match mutex().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        });
        result
    }
}

/// Acquire the state lock, run `f`, then run deferred callbacks after the
/// lock has been released.
pub fn with_lock<R>(f: impl FnOnce(&mut Lock) -> R) -> R {
    let mut lock = Lock::acquire();
    let result = f(&mut lock);
    let deferred = std::mem::take(&mut lock.st().deferred);
    drop(lock);
    for callback in deferred {
        callback();
    }
    result
}

/// Per-thread evaluation state, one per backend.
pub struct ThreadState {
    pub backend: JitBackend,
    pub device: i32,
    pub stream: u32,
    /// Roots queued for the next `eval()` (scheduled outputs and pending
    /// side effects), in program order.
    pub todo: Vec<VarId>,
    /// Number of side effects queued since the last evaluation.
    pub side_effect_counter: u32,
    /// Stack of active masks (`mask_push`/`mask_pop`), holding external
    /// references on its entries.
    pub mask_stack: Vec<VarId>,
}

impl ThreadState {
    fn new(backend: JitBackend) -> Self {
        Self {
            backend,
            device: 0,
            stream: 0,
            todo: Vec::new(),
            side_effect_counter: 0,
            mask_stack: Vec::new(),
        }
    }
}

thread_local! {
    static THREAD_STATE: RefCell<[ThreadState; BACKEND_COUNT]> = RefCell::new([
        ThreadState::new(JitBackend::LlvmSimd),
        ThreadState::new(JitBackend::Cuda),
    ]);
}

/// Access this thread's evaluation state for the given backend.
pub fn with_ts<R>(backend: JitBackend, f: impl FnOnce(&mut ThreadState) -> R) -> R {
    THREAD_STATE.with(|ts| f(&mut ts.borrow_mut()[backend as usize]))
}

/// Initialize the given backend with its default engine and make it the
/// default for newly created arrays. Safe to call repeatedly.
pub fn init(backend: JitBackend) {
    let engine: Arc<dyn Engine> = Arc::new(crate::engine::InterpEngine::new(backend));
    init_with_engine(backend, engine);
}

/// Initialize a backend with a caller-provided engine.
pub fn init_with_engine(backend: JitBackend, engine: Arc<dyn Engine>) {
    with_lock(|lock| {
        let st = lock.st();
        st.engines[backend as usize] = Some(engine);
        st.default_backend = Some(backend);
    });
    log::debug!("init(): backend {} ready", backend.name());
}

/// Tear down the JIT: flushes the allocator and reports leaked variables.
/// All client handles should be dropped before calling this.
pub fn shutdown() {
    with_lock(|lock| {
        let st = lock.st();
        if !st.variables.is_empty() {
            log::warn!(
                "shutdown(): {} variable(s) still alive!\n{}",
                st.variables.len(),
                crate::var::whos_impl(st)
            );
        }
        st.kernels.clear();
        st.alloc.trim();
    });
}

/// Flip a runtime flag (see [`JitFlags`]).
pub fn set_lvn(backend: JitBackend, enabled: bool) {
    with_lock(|lock| lock.st().flags.lvn[backend as usize] = enabled);
}

/// Backend used for newly constructed arrays.
pub fn default_backend() -> JitBackend {
    with_lock(|lock| {
        lock.st()
            .default_backend
            .expect("default_backend(): call init() first!")
    })
}
