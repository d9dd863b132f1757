//! Shared test harness: the JIT state is process-wide, so tests within a
//! binary serialize on one mutex and use count deltas rather than
//! absolute store sizes.

use std::sync::{Mutex, MutexGuard, OnceLock};

static SESSION: OnceLock<Mutex<()>> = OnceLock::new();

/// Initialize the CPU backend and serialize the calling test against the
/// rest of the binary.
pub fn session() -> MutexGuard<'static, ()> {
    let guard = match SESSION.get_or_init(|| Mutex::new(())).lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let _ = env_logger::builder().is_test(true).try_init();
    glint::init(glint::JitBackend::LlvmSimd);
    guard
}
