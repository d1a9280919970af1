pub mod backend;
pub mod completion;
pub mod config;
pub mod control_plane;
pub mod error;
pub mod executor;
pub mod fusion;
pub mod plan;
pub mod pool;
pub mod rendezvous;
pub mod schedule;
pub mod types;

pub use backend::{
    Backend, BackendRegistry, Callback, RankContributions, RankDesc, RuntimeRequestInfo, Status,
};
pub use completion::{CompletionTracker, DeviceEvent, EventStatus};
pub use config::BoxingConfig;
pub use control_plane::{ControlPlane, ControlPlaneServer, LocalControlPlane, TcpControlPlane};
pub use error::{BoxingError, Result};
pub use executor::Executor;
pub use fusion::FusionPolicy;
pub use plan::{DeviceDesc, DeviceSet, MachineContext, OpDesc, Plan, RequestDesc, RequestSet};
pub use pool::{Scratch, ScratchPool};
pub use rendezvous::{CommunicatorSpec, communicator_specs, exchange_unique_id, unique_id_key};
pub use schedule::{GroupId, RequestId, Schedule, ScheduledGroup, ScheduledRequest};
pub use types::{BackendKind, DataType, DeviceId, JobId, MachineId, OpType, Rank, ReduceOp};
