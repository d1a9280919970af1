use boxing::{BackendKind, BoxingError, DeviceId, OpType, Rank};
use cudarc::nccl::result::NcclError;

pub type Result<T> = std::result::Result<T, NcclBackendError>;

#[derive(Debug, thiserror::Error)]
pub enum NcclBackendError {
    #[error("NCCL error: {0:?}")]
    Nccl(NcclError),

    #[error("CUDA driver error: {0}")]
    CudaDriver(#[from] cudarc::driver::result::DriverError),

    #[error("scheduler error: {0}")]
    Boxing(#[from] BoxingError),

    #[error("unique id must be {expected} bytes, got {got}")]
    InvalidUniqueId { expected: usize, got: usize },

    #[error("no communicator for device {device_id} of `{name}` on stream {stream_id}")]
    MissingCommunicator {
        name: String,
        device_id: DeviceId,
        stream_id: usize,
    },

    #[error("no communicators were established for the device set of `{name}`")]
    UnknownDeviceSet { name: String },

    #[error("rank {rank} out of range for the device set of `{name}`")]
    RankOutOfRange { name: String, rank: Rank },

    #[error("device {device_id} is not managed by this backend")]
    UnknownDevice { device_id: DeviceId },

    #[error("cannot launch `{name}` ({op_type}): {reason}")]
    Launch {
        name: String,
        op_type: OpType,
        reason: String,
    },
}

impl From<NcclError> for NcclBackendError {
    fn from(e: NcclError) -> Self {
        NcclBackendError::Nccl(e)
    }
}

impl From<NcclBackendError> for BoxingError {
    fn from(e: NcclBackendError) -> Self {
        match e {
            NcclBackendError::Boxing(inner) => inner,
            other => BoxingError::backend_with_source(BackendKind::Nccl, "nccl backend", other),
        }
    }
}
