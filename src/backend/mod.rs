//! Backend code emitters.
//!
//! Each backend lowers a scheduled [`KernelProgram`](crate::kernel::KernelProgram)
//! into assembly text: LLVM IR for vectorized CPU execution, PTX for
//! CUDA. The text doubles as the kernel cache key.

pub mod llvm;
pub mod ptx;

/// Placeholder embedded in kernel names while the module is assembled;
/// replaced by the content hash once the full text exists.
pub(crate) const NAME_PLACEHOLDER: &str = "@@@@@@@@@@@@@@@@";

/// Stamp the content hash of `module` into its kernel name. The hash is
/// computed over the text with the placeholder still in place, so equal
/// programs produce equal names (and equal cache keys).
pub(crate) fn patch_kernel_name(module: String) -> String {
    let hash = crate::kernel::kernel_hash(module.as_bytes());
    module.replace(NAME_PLACEHOLDER, &format!("{hash:016x}"))
}
