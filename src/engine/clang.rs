//! Engine that compiles emitted LLVM IR with an external `clang`.
//!
//! The IR text is written to a temporary `.ll` file, compiled into a
//! shared object (`clang -shared -O2`) and loaded with `libloading`; the
//! kernel symbol has the signature
//! `void glint_<hash>(uint64_t start, uint64_t end, uint8_t **params)`.

use std::any::Any;
use std::io::Write;
use std::process::Command;
use std::sync::Arc;

use libloading::Library;
use log::debug;

use crate::error::{JitError, Result};
use crate::kernel::{CompileClass, CompiledKernel, KernelProgram};
use crate::state::JitBackend;
use crate::var::ReduceOp;
use crate::vtype::VarType;

use super::{reduce_buffer, Engine};

pub struct ClangEngine {
    compiler: String,
}

impl ClangEngine {
    pub fn new() -> Self {
        Self {
            compiler: std::env::var("GLINT_CC").unwrap_or_else(|_| "clang".to_string()),
        }
    }

    /// Whether the configured compiler responds to `--version`.
    pub fn is_available(&self) -> bool {
        Command::new(&self.compiler)
            .arg("--version")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }
}

impl Default for ClangEngine {
    fn default() -> Self {
        Self::new()
    }
}

type KernelFn = unsafe extern "C" fn(u64, u64, *const *mut u8);

struct ClangKernel {
    library: Library,
    symbol: String,
    // Keeps the shared object on disk for the library's lifetime.
    _dir: tempfile::TempDir,
}

impl CompiledKernel for ClangKernel {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Extract the `glint_<hash>` symbol name from the module text.
fn kernel_symbol(ir: &str) -> Result<String> {
    let start = ir
        .find("@glint_")
        .ok_or_else(|| JitError::LaunchFailed("kernel entry point not found".into()))?;
    let name = &ir[start + 1..];
    let end = name
        .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .unwrap_or(name.len());
    Ok(name[..end].to_string())
}

impl Engine for ClangEngine {
    fn backend(&self) -> JitBackend {
        JitBackend::LlvmSimd
    }

    fn compile(
        &self,
        ir: &str,
        _program: &KernelProgram,
    ) -> Result<(Arc<dyn CompiledKernel>, CompileClass)> {
        let dir = tempfile::tempdir().map_err(|err| JitError::CompileFailed {
            backend: "llvm",
            message: err.to_string(),
            ir: String::new(),
        })?;

        let source = dir.path().join("kernel.ll");
        let object = dir.path().join("kernel.so");
        std::fs::File::create(&source)
            .and_then(|mut file| file.write_all(ir.as_bytes()))
            .map_err(|err| JitError::CompileFailed {
                backend: "llvm",
                message: err.to_string(),
                ir: ir.to_string(),
            })?;

        debug!("compile(): {} -shared -O2 {}", self.compiler, source.display());
        let output = Command::new(&self.compiler)
            .args(["-shared", "-fPIC", "-O2", "-march=native", "-o"])
            .arg(&object)
            .arg(&source)
            .output()
            .map_err(|err| JitError::CompileFailed {
                backend: "llvm",
                message: err.to_string(),
                ir: ir.to_string(),
            })?;
        if !output.status.success() {
            return Err(JitError::CompileFailed {
                backend: "llvm",
                message: String::from_utf8_lossy(&output.stderr).into_owned(),
                ir: ir.to_string(),
            });
        }

        let library = unsafe { Library::new(&object) }.map_err(|err| JitError::CompileFailed {
            backend: "llvm",
            message: err.to_string(),
            ir: ir.to_string(),
        })?;

        Ok((
            Arc::new(ClangKernel {
                library,
                symbol: kernel_symbol(ir)?,
                _dir: dir,
            }),
            CompileClass::Hard,
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
            .downcast_ref::<ClangKernel>()
            .ok_or_else(|| JitError::LaunchFailed("foreign kernel handle".into()))?;
        unsafe {
            let func: libloading::Symbol<KernelFn> = kernel
                .library
                .get(kernel.symbol.as_bytes())
                .map_err(|err| JitError::LaunchFailed(err.to_string()))?;
            func(0, size as u64, params.as_ptr());
        }
        Ok(())
    }

    fn reduce(&self, vtype: VarType, op: ReduceOp, data: *const u8, size: u32) -> Result<u64> {
        Ok(reduce_buffer(vtype, op, data, size))
    }
}
