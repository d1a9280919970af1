use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{BoxingError, Result};
use crate::plan::RequestDesc;
use crate::types::{BackendKind, Rank};

/// Outcome delivered to a contribution's callback once its device work is done.
///
/// The error is shared so one device event can fan out to many callbacks.
pub type Status = std::result::Result<(), Arc<BoxingError>>;

/// Completion callback for one rank's contribution.
pub type Callback = Box<dyn FnOnce(Status) + Send + 'static>;

/// Identifies which rank of which named operation a contribution is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankDesc {
    pub op_name: String,
    pub rank: Rank,
}

impl RankDesc {
    pub fn new(op_name: impl Into<String>, rank: Rank) -> Self {
        Self {
            op_name: op_name.into(),
            rank,
        }
    }
}

/// Buffers and callback supplied by one local rank for one invocation.
pub struct RuntimeRequestInfo {
    /// Device pointer to the send buffer.
    pub send_buf: u64,
    /// Device pointer to the receive buffer.
    pub recv_buf: u64,
    pub callback: Callback,
}

impl RuntimeRequestInfo {
    pub fn new(send_buf: u64, recv_buf: u64, callback: impl FnOnce(Status) + Send + 'static) -> Self {
        Self {
            send_buf,
            recv_buf,
            callback: Box::new(callback),
        }
    }
}

impl std::fmt::Debug for RuntimeRequestInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeRequestInfo")
            .field("send_buf", &format_args!("{:#x}", self.send_buf))
            .field("recv_buf", &format_args!("{:#x}", self.recv_buf))
            .finish_non_exhaustive()
    }
}

/// Local contributions of one request, keyed by rank.
pub type RankContributions = BTreeMap<Rank, RuntimeRequestInfo>;

/// A collective backend: splits co-located independent requests into fusable
/// groups at plan time, and launches finalized groups at run time.
///
/// Backends are constructed (communicators, streams, buffers) before they
/// are registered; the executor only dispatches through this trait.
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Split a run of requests sharing device set, backend and dependency
    /// depth into execution groups. Must preserve order and cover every
    /// request exactly once.
    ///
    /// Default: every request is its own group.
    fn group_requests(&self, requests: &[Arc<RequestDesc>]) -> Vec<Vec<Arc<RequestDesc>>> {
        requests.iter().map(|r| vec![Arc::clone(r)]).collect()
    }

    /// Launch one group. `ranks[i]` holds the local contributions for
    /// `group[i]`. Must not block on device completion; callbacks fire
    /// asynchronously once the work is done.
    ///
    /// On `Err`, callbacks the backend dropped without invoking are
    /// completed by the executor with `GroupLaunchFailed`.
    fn execute_group(&self, group: &[Arc<RequestDesc>], ranks: Vec<RankContributions>)
    -> Result<()>;
}

/// Backend tag → backend instance, built once at startup.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<BackendKind, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own tag, replacing any previous one.
    pub fn register(&mut self, backend: Arc<dyn Backend>) -> &mut Self {
        self.backends.insert(backend.kind(), backend);
        self
    }

    pub fn get(&self, kind: BackendKind) -> Result<&Arc<dyn Backend>> {
        self.backends
            .get(&kind)
            .ok_or(BoxingError::UnknownBackend { kind })
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.backends.keys().collect();
        kinds.sort();
        f.debug_struct("BackendRegistry")
            .field("backends", &kinds)
            .finish()
    }
}
