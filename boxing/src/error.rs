use crate::types::{BackendKind, JobId, OpType, Rank};

pub type Result<T> = std::result::Result<T, BoxingError>;

/// Errors raised by the scheduler.
///
/// Every variant except `ControlPlane`, `RendezvousTimeout` and `Io` marks an
/// inconsistent plan or runtime contract violation; callers are expected to
/// abort on them rather than retry.
#[derive(Debug, thiserror::Error)]
pub enum BoxingError {
    #[error("request `{name}` registered twice")]
    DuplicateRequest { name: String },

    #[error("unknown request `{name}`")]
    UnknownRequest { name: String },

    #[error(
        "dependency depth decreased along submission order: `{prev}` (depth {prev_depth}) precedes `{next}` (depth {next_depth})"
    )]
    DependencyDepthDecreased {
        prev: String,
        prev_depth: i64,
        next: String,
        next_depth: i64,
    },

    #[error("no backend registered for tag {kind}")]
    UnknownBackend { kind: BackendKind },

    #[error("invalid op `{name}` ({op_type}): {reason}")]
    InvalidOpDesc {
        name: String,
        op_type: OpType,
        reason: String,
    },

    #[error("rank {rank} is not local to request `{name}`")]
    UnexpectedRank { name: String, rank: Rank },

    #[error("rank {rank} already contributed to request `{name}` this round")]
    DuplicateContribution { name: String, rank: Rank },

    #[error("request `{name}` belongs to job {job} while job {active} is still active")]
    JobInterleaved {
        name: String,
        job: JobId,
        active: JobId,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("backend {kind} failed: {message}")]
    Backend {
        kind: BackendKind,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("group {group_id} failed to launch: {message}")]
    GroupLaunchFailed { group_id: usize, message: String },

    #[error("device event query failed on device {device_id}: {message}")]
    DeviceEvent { device_id: u32, message: String },

    #[error("control plane error: {0}")]
    ControlPlane(String),

    #[error("rendezvous on key `{key}` timed out after {timeout_ms}ms")]
    RendezvousTimeout { key: String, timeout_ms: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("completion tracker shut down")]
    TrackerShutdown,
}

impl BoxingError {
    /// Create a `Backend` error with just a message.
    pub fn backend(kind: BackendKind, msg: impl Into<String>) -> Self {
        Self::Backend {
            kind,
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Backend` error with a message and a source error.
    pub fn backend_with_source(
        kind: BackendKind,
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            kind,
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    pub(crate) fn invalid_op(name: &str, op_type: OpType, reason: impl Into<String>) -> Self {
        Self::InvalidOpDesc {
            name: name.to_owned(),
            op_type,
            reason: reason.into(),
        }
    }
}
