//! glint: a tracing just-in-time compiler for wide-SIMD / GPU array
//! computation.
//!
//! Client code builds arithmetic expressions over [`Array<T>`] handles
//! that look like scalar code; every operation appends a node to a
//! process-wide computation graph instead of executing. When a value is
//! required, the runtime schedules the pending nodes, emits backend
//! assembly (LLVM IR for vectorized CPU execution, PTX for CUDA),
//! compiles and caches one kernel per output-size group, launches it over
//! the active stream, and replaces the evaluated nodes' bodies with
//! device buffers.
//!
//! Construction-time local value numbering deduplicates identical
//! expressions, three reference-count flavors (client handles, graph
//! edges, pending side effects) manage lifetimes, and scatters mark
//! their target dirty so that reads always observe pending writes.
//!
//! # Example
//!
//! ```
//! use glint::prelude::*;
//!
//! glint::init(glint::JitBackend::LlvmSimd);
//!
//! let a = Float::from_slice(&[1.0, 2.0, 3.0, 4.0]);
//! let b = Float::from_slice(&[3.0, 8.0, 1.0, 5.0]);
//! let c = Float::fma(&a, &b, &Float::scalar(1.0));
//!
//! assert_eq!(c.to_vec(), vec![4.0, 17.0, 4.0, 21.0]);
//! ```

pub mod array;
pub mod backend;
pub mod engine;
pub mod error;
pub mod eval;
pub mod fmt;
pub mod kernel;
pub mod malloc;
pub mod op;
pub mod state;
pub mod var;
pub mod vtype;

pub use array::{
    Array, Double, Float, Int16, Int32, Int64, Int8, Mask, UInt16, UInt32, UInt64, UInt8,
};
pub use error::JitError;
pub use eval::{eval, eval_ts};
pub use kernel::KernelStats;
pub use malloc::AllocKind;
pub use state::{default_backend, init, init_with_engine, set_lvn, shutdown, JitBackend};
pub use var::{ReduceOp, VarId, VarKind};
pub use vtype::{JitScalar, VarType};

/// Convenient imports for client code.
pub mod prelude {
    pub use crate::array::{
        Array, Double, Float, Int16, Int32, Int64, Int8, Mask, UInt16, UInt32, UInt64, UInt8,
    };
    pub use crate::state::JitBackend;
    pub use crate::var::ReduceOp;
    pub use crate::vtype::VarType;
}

/// Snapshot of the kernel cache statistics.
pub fn kernel_stats() -> KernelStats {
    state::with_lock(|lock| lock.st().kernels.stats)
}
