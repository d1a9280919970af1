//! Per-device CUDA resources: compute streams, completion events and fusion
//! scratch buffers.
//!
//! Everything here is created and destroyed with its owning context bound
//! to the calling thread, so callers may come from any thread.

use std::mem::MaybeUninit;
use std::sync::Arc;

use boxing::{BoxingError, DeviceEvent, DeviceId, EventStatus};
use cudarc::driver::{CudaContext, result, sys};

use crate::error::Result;

/// A non-blocking stream created at the highest priority the device allows.
pub struct ComputeStream {
    ctx: Arc<CudaContext>,
    raw: sys::CUstream,
}

// SAFETY: CUstream handles may be used from any thread once the owning
// context is bound; every method binds it first.
unsafe impl Send for ComputeStream {}
unsafe impl Sync for ComputeStream {}

impl ComputeStream {
    pub fn high_priority(ctx: &Arc<CudaContext>) -> Result<Self> {
        ctx.bind_to_thread()?;
        let mut least = 0i32;
        let mut greatest = 0i32;
        unsafe { sys::cuCtxGetStreamPriorityRange(&mut least, &mut greatest) }.result()?;
        let mut raw = MaybeUninit::uninit();
        unsafe {
            sys::cuStreamCreateWithPriority(
                raw.as_mut_ptr(),
                sys::CUstream_flags::CU_STREAM_NON_BLOCKING as u32,
                greatest,
            )
        }
        .result()?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            raw: unsafe { raw.assume_init() },
        })
    }

    pub fn raw(&self) -> sys::CUstream {
        self.raw
    }

    /// Make this stream's context current on the calling thread.
    pub fn bind(&self) -> Result<()> {
        self.ctx.bind_to_thread()?;
        Ok(())
    }

    pub fn synchronize(&self) -> Result<()> {
        self.bind()?;
        unsafe { result::stream::synchronize(self.raw)? };
        Ok(())
    }
}

impl Drop for ComputeStream {
    fn drop(&mut self) {
        if let Err(e) = self.synchronize() {
            tracing::error!(error = %e, "compute stream synchronize failed during teardown");
        }
        unsafe {
            let _ = result::stream::destroy(self.raw);
        }
    }
}

/// A timing-disabled event recorded on a compute stream.
pub struct CudaEvent {
    ctx: Arc<CudaContext>,
    device_id: DeviceId,
    raw: sys::CUevent,
}

// SAFETY: the event is only queried and destroyed after binding its context.
unsafe impl Send for CudaEvent {}

impl CudaEvent {
    /// Record a new event capturing all work queued so far on `stream`.
    pub fn record(device_id: DeviceId, stream: &ComputeStream) -> Result<Self> {
        stream.bind()?;
        let raw = result::event::create(sys::CUevent_flags::CU_EVENT_DISABLE_TIMING)?;
        let event = Self {
            ctx: Arc::clone(&stream.ctx),
            device_id,
            raw,
        };
        unsafe { result::event::record(event.raw, stream.raw())? };
        Ok(event)
    }
}

impl DeviceEvent for CudaEvent {
    fn query(&self) -> boxing::Result<EventStatus> {
        self.ctx
            .bind_to_thread()
            .map_err(|e| BoxingError::DeviceEvent {
                device_id: self.device_id,
                message: e.to_string(),
            })?;
        match unsafe { sys::cuEventQuery(self.raw) } {
            sys::CUresult::CUDA_SUCCESS => Ok(EventStatus::Complete),
            sys::CUresult::CUDA_ERROR_NOT_READY => Ok(EventStatus::Pending),
            other => Err(BoxingError::DeviceEvent {
                device_id: self.device_id,
                message: format!("{other:?}"),
            }),
        }
    }
}

impl Drop for CudaEvent {
    fn drop(&mut self) {
        if self.ctx.bind_to_thread().is_ok() {
            unsafe {
                let _ = result::event::destroy(self.raw);
            }
        }
    }
}

/// Contiguous device allocation used to stage fused all-reduces.
pub struct FusionBuffer {
    ctx: Arc<CudaContext>,
    ptr: sys::CUdeviceptr,
    len: usize,
}

impl FusionBuffer {
    pub fn alloc(ctx: &Arc<CudaContext>, len: usize) -> Result<Self> {
        ctx.bind_to_thread()?;
        let ptr = unsafe { result::malloc_sync(len)? };
        Ok(Self {
            ctx: Arc::clone(ctx),
            ptr,
            len,
        })
    }

    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for FusionBuffer {
    fn drop(&mut self) {
        if self.ctx.bind_to_thread().is_ok() {
            unsafe {
                let _ = result::free_sync(self.ptr);
            }
        }
    }
}
