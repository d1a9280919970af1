use std::collections::BTreeMap;
use std::ffi::c_void;
use std::mem::MaybeUninit;
use std::sync::Arc;

use boxing::{CommunicatorSpec, DeviceId, OpDesc, OpType};
use cudarc::driver::CudaContext;
use cudarc::nccl::{result as nccl, safe::Id, sys};

use crate::device::ComputeStream;
use crate::error::{NcclBackendError, Result};
use crate::types::{launch_count, reduce_op, root, to_nccl_dtype};

pub const UNIQUE_ID_BYTES: usize = 128;

/// One rank's raw `ncclComm_t` within a device set.
pub struct Communicator {
    comm: sys::ncclComm_t,
}

// SAFETY: launches on a communicator are serialized by the executor lock,
// and teardown happens after the completion poller has drained.
unsafe impl Send for Communicator {}
unsafe impl Sync for Communicator {}

/// Local communicators of one (device set, stream) pair, keyed by device.
pub type DeviceComms = BTreeMap<DeviceId, Communicator>;

impl Communicator {
    /// Initialize every local rank of `spec` from a shared unique id inside
    /// one NCCL group, so ranks on this machine handshake together.
    pub fn init_local_ranks(
        spec: &CommunicatorSpec,
        contexts: &BTreeMap<DeviceId, Arc<CudaContext>>,
        id: &Id,
    ) -> Result<DeviceComms> {
        let world = spec.device_set.len() as i32;
        let mut comms = DeviceComms::new();
        nccl::group_start()?;
        let init = (|| -> Result<()> {
            for &rank in &spec.local_ranks {
                let device_id = spec
                    .device_set
                    .device(rank)
                    .map(|d| d.device_id)
                    .ok_or_else(|| NcclBackendError::RankOutOfRange {
                        name: spec.name.clone(),
                        rank,
                    })?;
                contexts
                    .get(&device_id)
                    .ok_or(NcclBackendError::UnknownDevice { device_id })?
                    .bind_to_thread()?;
                let mut comm = MaybeUninit::uninit();
                unsafe {
                    nccl::comm_init_rank(comm.as_mut_ptr(), world, *id_to_sys(id), rank as i32)?;
                }
                comms.insert(
                    device_id,
                    Communicator {
                        comm: unsafe { comm.assume_init() },
                    },
                );
            }
            Ok(())
        })();
        nccl::group_end()?;
        init?;
        Ok(comms)
    }

    /// Queue the primitive `op` describes for one rank on `stream`.
    ///
    /// # Safety
    /// `send_ptr` and `recv_ptr` must be device pointers sized for `op` on
    /// the stream's device.
    pub unsafe fn launch(
        &self,
        op: &OpDesc,
        send_ptr: u64,
        recv_ptr: u64,
        stream: &ComputeStream,
    ) -> Result<()> {
        let send = send_ptr as *const c_void;
        let recv = recv_ptr as *mut c_void;
        let count = launch_count(op)?;
        let dtype = to_nccl_dtype(op.data_type);
        let s = stream.raw() as sys::cudaStream_t;
        unsafe {
            match op.op_type {
                OpType::AllReduce => {
                    nccl::all_reduce(send, recv, count, dtype, reduce_op(op)?, self.comm, s)?;
                }
                OpType::AllGather => {
                    nccl::all_gather(send, recv, count, dtype, self.comm, s)?;
                }
                OpType::ReduceScatter => {
                    nccl::reduce_scatter(send, recv, count, dtype, reduce_op(op)?, self.comm, s)?;
                }
                OpType::Reduce => {
                    nccl::reduce(
                        send,
                        recv,
                        count,
                        dtype,
                        reduce_op(op)?,
                        root(op)?,
                        self.comm,
                        s,
                    )?;
                }
                OpType::Broadcast => {
                    nccl::broadcast(send, recv, count, dtype, root(op)?, self.comm, s)?;
                }
            }
        }
        Ok(())
    }

    /// In-place all-reduce over `count` elements at `ptr`.
    ///
    /// # Safety
    /// `ptr` must be a device pointer for `count` elements of `dtype`.
    pub unsafe fn all_reduce_inplace(
        &self,
        ptr: u64,
        count: usize,
        dtype: sys::ncclDataType_t,
        op: sys::ncclRedOp_t,
        stream: &ComputeStream,
    ) -> Result<()> {
        let p = ptr as *mut c_void;
        unsafe {
            nccl::all_reduce(
                p as *const c_void,
                p,
                count,
                dtype,
                op,
                self.comm,
                stream.raw() as sys::cudaStream_t,
            )?;
        }
        Ok(())
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        unsafe {
            let _ = nccl::comm_destroy(self.comm);
        }
    }
}

/// Generate a fresh unique id and serialize it for the control plane.
pub fn generate_unique_id() -> Result<Vec<u8>> {
    let id = Id::new()?;
    Ok(id_to_bytes(&id))
}

/// Convert our `Id` to the sys-level `ncclUniqueId`.
///
/// `ncclUniqueId` is `#[repr(C)]` with a single `[c_char; 128]` field, the
/// same layout `Id::internal()` returns.
fn id_to_sys(id: &Id) -> &sys::ncclUniqueId {
    let internal = id.internal();
    unsafe { &*(internal as *const [std::ffi::c_char; 128] as *const sys::ncclUniqueId) }
}

/// Serialize an NCCL unique id to bytes.
pub fn id_to_bytes(id: &Id) -> Vec<u8> {
    id.internal().iter().map(|&c| c as u8).collect()
}

/// Rebuild an NCCL unique id from control-plane bytes.
pub fn id_from_bytes(bytes: &[u8]) -> Result<Id> {
    if bytes.len() != UNIQUE_ID_BYTES {
        return Err(NcclBackendError::InvalidUniqueId {
            expected: UNIQUE_ID_BYTES,
            got: bytes.len(),
        });
    }
    let mut internal = [0 as std::ffi::c_char; UNIQUE_ID_BYTES];
    for (dst, &b) in internal.iter_mut().zip(bytes) {
        *dst = b as std::ffi::c_char;
    }
    Ok(Id::uninit(internal))
}
