//! Engine that executes emitted PTX through the CUDA driver API.
//!
//! Modules are loaded with `cuModuleLoadData`; launches use a grid-stride
//! configuration sized for the element count. Kernel parameters are the
//! element count followed by one device pointer per slot, matching the
//! `.param` list the PTX emitter declares.
//!
//! The allocator pool must hand out CUDA-reachable memory (managed or
//! unified) for `Device`/`HostPinned` requests when this engine is
//! active.

use std::any::Any;
use std::ffi::c_void;
use std::sync::Arc;

use cudarc::driver::sys as cu;
use log::debug;

use crate::error::{JitError, Result};
use crate::kernel::{CompileClass, CompiledKernel, KernelProgram};
use crate::state::JitBackend;
use crate::var::ReduceOp;
use crate::vtype::VarType;

use super::{reduce_buffer, Engine};

pub struct CudaEngine {
    context: cu::CUcontext,
}

// The driver context is used from whichever thread holds the evaluator.
unsafe impl Send for CudaEngine {}
unsafe impl Sync for CudaEngine {}

fn check(code: cu::CUresult, what: &str) -> Result<()> {
    if code == cu::CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(JitError::LaunchFailed(format!("{what} failed: {code:?}")))
    }
}

impl CudaEngine {
    pub fn new(device: i32) -> Result<Self> {
        unsafe {
            check(cu::cuInit(0), "cuInit")?;
            let mut dev = 0;
            check(cu::cuDeviceGet(&mut dev, device), "cuDeviceGet")?;
            let mut context = std::ptr::null_mut();
            check(
                cu::cuDevicePrimaryCtxRetain(&mut context, dev),
                "cuDevicePrimaryCtxRetain",
            )?;
            check(cu::cuCtxSetCurrent(context), "cuCtxSetCurrent")?;
            Ok(Self { context })
        }
    }
}

struct CudaKernel {
    module: cu::CUmodule,
    function: cu::CUfunction,
}

unsafe impl Send for CudaKernel {}
unsafe impl Sync for CudaKernel {}

impl CompiledKernel for CudaKernel {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for CudaKernel {
    fn drop(&mut self) {
        unsafe {
            cu::cuModuleUnload(self.module);
        }
    }
}

impl Engine for CudaEngine {
    fn backend(&self) -> JitBackend {
        JitBackend::Cuda
    }

    fn compile(
        &self,
        ir: &str,
        _program: &KernelProgram,
    ) -> Result<(Arc<dyn CompiledKernel>, CompileClass)> {
        let name_start = ir
            .find("glint_")
            .ok_or_else(|| JitError::LaunchFailed("kernel entry point not found".into()))?;
        let name: String = ir[name_start..]
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();

        let text = std::ffi::CString::new(ir).map_err(|err| JitError::CompileFailed {
            backend: "cuda",
            message: err.to_string(),
            ir: ir.to_string(),
        })?;
        let entry = std::ffi::CString::new(name).unwrap();

        unsafe {
            check(cu::cuCtxSetCurrent(self.context), "cuCtxSetCurrent")?;
            let mut module = std::ptr::null_mut();
            let rv = cu::cuModuleLoadData(&mut module, text.as_ptr() as *const c_void);
            if rv != cu::CUresult::CUDA_SUCCESS {
                return Err(JitError::CompileFailed {
                    backend: "cuda",
                    message: format!("cuModuleLoadData failed: {rv:?}"),
                    ir: ir.to_string(),
                });
            }
            let mut function = std::ptr::null_mut();
            check(
                cu::cuModuleGetFunction(&mut function, module, entry.as_ptr()),
                "cuModuleGetFunction",
            )?;
            debug!("compile(): loaded PTX module {:?}", entry);
            Ok((Arc::new(CudaKernel { module, function }), CompileClass::Hard))
        }
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
            .downcast_ref::<CudaKernel>()
            .ok_or_else(|| JitError::LaunchFailed("foreign kernel handle".into()))?;

        let block = 128u32;
        let grid = size.div_ceil(block).min(4096).max(1);

        // Kernel parameter marshalling: the size word first, then the
        // pointer table in emission order.
        let mut size_arg = size;
        let mut args: Vec<*mut c_void> = Vec::with_capacity(params.len() + 1);
        args.push(&mut size_arg as *mut u32 as *mut c_void);
        let mut slots: Vec<*mut u8> = params.to_vec();
        for slot in slots.iter_mut() {
            args.push(slot as *mut *mut u8 as *mut c_void);
        }

        unsafe {
            check(cu::cuCtxSetCurrent(self.context), "cuCtxSetCurrent")?;
            check(
                cu::cuLaunchKernel(
                    kernel.function,
                    grid,
                    1,
                    1,
                    block,
                    1,
                    1,
                    0,
                    std::ptr::null_mut(),
                    args.as_mut_ptr(),
                    std::ptr::null_mut(),
                ),
                "cuLaunchKernel",
            )?;
            check(cu::cuCtxSynchronize(), "cuCtxSynchronize")?;
        }
        Ok(())
    }

    fn reduce(&self, vtype: VarType, op: ReduceOp, data: *const u8, size: u32) -> Result<u64> {
        // Reductions fall back to the host; buffers are unified memory.
        Ok(reduce_buffer(vtype, op, data, size))
    }
}
