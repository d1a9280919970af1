//! Communicator rendezvous over the control plane.
//!
//! For every distinct device set a backend needs one communicator per
//! stream. Rank 0 generates the opaque handle; when the device set spans
//! machines it publishes the handle and every machine without rank 0 pulls
//! it under the same key before initializing its local ranks.

use indexmap::IndexMap;
use std::collections::BTreeSet;
use std::time::Duration;

use crate::control_plane::ControlPlane;
use crate::error::BoxingError;
use crate::plan::{DeviceSet, MachineContext, Plan};
use crate::types::{BackendKind, Rank};

pub const UNIQUE_ID_KEY_PREFIX: &str = "CollectiveBoxingUniqueId";

/// Control-plane key for the handle of communicator `stream_id` of the
/// device set first referenced by request `name`.
pub fn unique_id_key(name: &str, stream_id: usize) -> String {
    format!("{UNIQUE_ID_KEY_PREFIX}-{name}-{stream_id}")
}

/// One device set that needs communicators on this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommunicatorSpec {
    pub device_set: DeviceSet,
    /// Name of the first request referencing this device set; keys the
    /// rendezvous.
    pub name: String,
    pub local_ranks: BTreeSet<Rank>,
    /// Whether every rank lives on this machine.
    pub local_only: bool,
}

impl CommunicatorSpec {
    pub fn has_root(&self) -> bool {
        self.local_ranks.contains(&0)
    }
}

/// Distinct device sets served by backend `kind` with at least one rank on
/// this machine, in first-encounter order across jobs.
pub fn communicator_specs(
    plan: &Plan,
    ctx: &MachineContext,
    kind: BackendKind,
) -> Vec<CommunicatorSpec> {
    let mut specs: IndexMap<DeviceSet, CommunicatorSpec> = IndexMap::new();
    for &job_id in plan.jobs.keys() {
        for request in plan.local_requests(job_id, ctx.this_machine_id) {
            if request.op_desc.backend != kind {
                continue;
            }
            specs
                .entry(request.device_set.clone())
                .or_insert_with(|| CommunicatorSpec {
                    device_set: request.device_set.clone(),
                    name: request.name().to_owned(),
                    local_ranks: request.device_set.local_ranks(ctx.this_machine_id),
                    local_only: request.device_set.is_local_only(ctx.this_machine_id),
                });
        }
    }
    specs.into_values().collect()
}

/// Agree on the communicator handle for (`spec`, `stream_id`).
///
/// `generate` runs only on the machine holding rank 0. Other machines wait
/// at most `timeout` for the published handle.
pub async fn exchange_unique_id<E>(
    control_plane: &dyn ControlPlane,
    spec: &CommunicatorSpec,
    stream_id: usize,
    generate: impl FnOnce() -> Result<Vec<u8>, E>,
    timeout: Duration,
) -> Result<Vec<u8>, E>
where
    E: From<BoxingError>,
{
    let key = unique_id_key(&spec.name, stream_id);
    if spec.has_root() {
        let id = generate()?;
        if !spec.local_only {
            control_plane.push_kv(&key, &id).await?;
            tracing::debug!(key, "published communicator handle");
        }
        return Ok(id);
    }

    let id = tokio::time::timeout(timeout, control_plane.pull_kv(&key))
        .await
        .map_err(|_| BoxingError::RendezvousTimeout {
            key: key.clone(),
            timeout_ms: timeout.as_millis() as u64,
        })??;
    tracing::debug!(key, "received communicator handle");
    Ok(id)
}
