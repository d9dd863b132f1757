//! Kernel programs, compiled-kernel handles and the kernel cache.
//!
//! Assembly snapshots each scheduled variable into an [`EmitVar`]; the
//! backend emitters lower the snapshot to IR text and the interpreter
//! engine executes it directly. The fully assembled IR string is the
//! content-addressed cache key: identical graphs compile once.

use rustc_hash::FxHashMap;
use std::any::Any;
use std::sync::Arc;

use crate::state::JitBackend;
use crate::var::{VarId, VarKind};
use crate::vtype::VarType;

/// Marker for "no dependency" in [`EmitVar::dep`].
pub const NO_REG: u32 = u32::MAX;

/// Role of a scheduled variable in the kernel parameter table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamKind {
    /// Lives in a register only; no parameter slot.
    Register,
    /// Evaluated data loaded from the parameter array.
    Input,
    /// Result stored through the parameter array.
    Output,
}

/// Snapshot of one scheduled variable, in schedule order.
///
/// `dep` holds positions of the operands inside the same program, which
/// double as register indices during code generation.
#[derive(Clone)]
pub struct EmitVar {
    /// Id of the variable this entry was snapshotted from.
    pub id: VarId,
    /// Register index: the entry's position in the program.
    pub reg: u32,
    pub kind: VarKind,
    pub vtype: VarType,
    /// The variable's logical size is 1 and broadcasts across the kernel.
    pub scalar: bool,
    pub param: ParamKind,
    /// Slot in the kernel parameter array (inputs and outputs only).
    pub param_offset: u32,
    pub literal: u64,
    /// Legacy IR template (`VarKind::Stmt` nodes).
    pub stmt: Option<Box<str>>,
    pub dep: [u32; 4],
    /// Set once the half-precision operand has been widened to f32 inside
    /// the current kernel (LLVM emitter bookkeeping).
    pub ssa_f32_cast: bool,
}

impl EmitVar {
    pub fn dep_count(&self) -> usize {
        self.dep.iter().take_while(|&&d| d != NO_REG).count()
    }
}

/// One kernel's worth of scheduled work: every variable of a size group,
/// in execution order.
pub struct KernelProgram {
    pub backend: JitBackend,
    /// Logical element count the kernel iterates over.
    pub size: u32,
    pub ops: Vec<EmitVar>,
    /// Number of parameter slots (inputs + outputs).
    pub n_params: u32,
}

/// A backend-compiled kernel. The concrete payload depends on the engine
/// (an executable tape, a dlopen'd symbol, a CUDA module).
pub trait CompiledKernel: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// Whether a cache miss required invoking a heavyweight external compiler
/// (`Hard`) or only engine-local preparation (`Soft`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompileClass {
    Soft,
    Hard,
}

#[derive(Default, Clone, Copy)]
pub struct KernelStats {
    pub hits: u64,
    pub soft_misses: u64,
    pub hard_misses: u64,
    pub launches: u64,
}

/// Content-addressed cache of compiled kernels, keyed by the full IR
/// string produced by the emitters.
#[derive(Default)]
pub struct KernelCache {
    kernels: FxHashMap<Box<str>, Arc<dyn CompiledKernel>>,
    pub stats: KernelStats,
}

impl KernelCache {
    pub fn lookup(&mut self, ir: &str) -> Option<Arc<dyn CompiledKernel>> {
        let hit = self.kernels.get(ir).cloned();
        if hit.is_some() {
            self.stats.hits += 1;
        }
        hit
    }

    pub fn insert(&mut self, ir: &str, kernel: Arc<dyn CompiledKernel>, class: CompileClass) {
        match class {
            CompileClass::Soft => self.stats.soft_misses += 1,
            CompileClass::Hard => self.stats.hard_misses += 1,
        }
        self.kernels.insert(Box::from(ir), kernel);
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    pub fn clear(&mut self) {
        self.kernels.clear();
    }
}

/// FNV-1a over the kernel body, used to give kernels content-derived
/// names (`glint_<hash>`).
pub fn kernel_hash(data: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x1000_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;
    impl CompiledKernel for Dummy {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn cache_hit_and_miss_statistics() {
        let mut cache = KernelCache::default();
        assert!(cache.lookup("k1").is_none());
        cache.insert("k1", Arc::new(Dummy), CompileClass::Hard);
        assert!(cache.lookup("k1").is_some());
        assert!(cache.lookup("k2").is_none());
        cache.insert("k2", Arc::new(Dummy), CompileClass::Soft);
        assert_eq!(cache.stats.hits, 1);
        assert_eq!(cache.stats.hard_misses, 1);
        assert_eq!(cache.stats.soft_misses, 1);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn kernel_hash_is_content_sensitive() {
        assert_eq!(kernel_hash(b"abc"), kernel_hash(b"abc"));
        assert_ne!(kernel_hash(b"abc"), kernel_hash(b"abd"));
    }
}
