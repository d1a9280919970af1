//! Runtime readiness engine.
//!
//! Local ranks contribute to named requests from many threads. A single lock
//! serializes the bookkeeping and the decision of which groups become
//! executable; groups of the active job are launched strictly in schedule
//! order, and only one job is active at a time.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crate::backend::{
    BackendRegistry, Callback, RankContributions, RankDesc, RuntimeRequestInfo, Status,
};
use crate::config::BoxingConfig;
use crate::error::{BoxingError, Result};
use crate::plan::{MachineContext, Plan};
use crate::schedule::{GroupId, RequestId, Schedule};
use crate::types::JobId;

#[derive(Default)]
struct RequestState {
    ready_ranks: RankContributions,
}

#[derive(Default)]
struct GroupState {
    ready_requests: BTreeSet<RequestId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ActiveJob {
    job_id: JobId,
    /// Index into the job's group list of the next group to launch.
    cursor: usize,
}

struct RuntimeState {
    requests: Vec<RequestState>,
    groups: Vec<GroupState>,
    active: Option<ActiveJob>,
}

/// Accepts per-rank contributions and drives in-order group execution.
pub struct Executor {
    schedule: Schedule,
    backends: BackendRegistry,
    state: Mutex<RuntimeState>,
}

impl Executor {
    /// Build the static schedule and prepare runtime state.
    ///
    /// Backends in `backends` must already be initialized for `plan`.
    pub fn new(
        plan: &Plan,
        ctx: MachineContext,
        config: &BoxingConfig,
        backends: BackendRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let schedule = Schedule::build(plan, &ctx, config, &backends)?;
        tracing::info!(
            machine_id = ctx.this_machine_id,
            requests = schedule.requests().len(),
            groups = schedule.num_groups(),
            "collective schedule built"
        );
        if config.enable_debug_mode {
            schedule.dump_summary();
        }
        let state = RuntimeState {
            requests: schedule
                .requests()
                .iter()
                .map(|_| RequestState::default())
                .collect(),
            groups: schedule
                .groups()
                .iter()
                .map(|_| GroupState::default())
                .collect(),
            active: None,
        };
        Ok(Self {
            schedule,
            backends,
            state: Mutex::new(state),
        })
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Job currently being drained, if any.
    pub fn active_job(&self) -> Result<Option<JobId>> {
        let state = self
            .state
            .lock()
            .map_err(|_| BoxingError::LockPoisoned("executor"))?;
        Ok(state.active.map(|a| a.job_id))
    }

    /// Record one local rank's contribution and launch every group that
    /// became executable, in schedule order.
    ///
    /// An `Err` means the plan or the caller broke the scheduling contract,
    /// and the submission is rejected without touching runtime state. The
    /// exception is a backend failing to launch a group this submission
    /// completed: the group is consumed, every callback it held receives
    /// `GroupLaunchFailed`, and the backend's error is returned here.
    pub fn enqueue(&self, rank_desc: &RankDesc, info: RuntimeRequestInfo) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| BoxingError::LockPoisoned("executor"))?;

        let request_id =
            self.schedule
                .request_id(&rank_desc.op_name)
                .ok_or_else(|| BoxingError::UnknownRequest {
                    name: rank_desc.op_name.clone(),
                })?;
        let scheduled = self.schedule.request(request_id);

        if let Some(active) = state.active
            && active.job_id != scheduled.job_id
        {
            return Err(BoxingError::JobInterleaved {
                name: rank_desc.op_name.clone(),
                job: scheduled.job_id,
                active: active.job_id,
            });
        }
        if !scheduled.local_ranks.contains(&rank_desc.rank) {
            return Err(BoxingError::UnexpectedRank {
                name: rank_desc.op_name.clone(),
                rank: rank_desc.rank,
            });
        }
        if state.requests[request_id]
            .ready_ranks
            .contains_key(&rank_desc.rank)
        {
            return Err(BoxingError::DuplicateContribution {
                name: rank_desc.op_name.clone(),
                rank: rank_desc.rank,
            });
        }

        let active = *state.active.get_or_insert(ActiveJob {
            job_id: scheduled.job_id,
            cursor: 0,
        });

        let request_state = &mut state.requests[request_id];
        request_state.ready_ranks.insert(rank_desc.rank, info);
        if request_state.ready_ranks.len() == scheduled.local_ranks.len() {
            state.groups[scheduled.group_id]
                .ready_requests
                .insert(request_id);
        }

        let outcome = self.drain(&mut state, active);
        drop(state);
        outcome.map_err(LaunchFailure::notify)
    }

    /// Launch ready groups from the cursor onward; stop at the first group
    /// that is still missing contributions or fails to launch.
    fn drain(
        &self,
        state: &mut RuntimeState,
        mut active: ActiveJob,
    ) -> std::result::Result<(), LaunchFailure> {
        let group_ids = self.schedule.job_groups(active.job_id);
        let mut outcome = Ok(());
        while let Some(&group_id) = group_ids.get(active.cursor) {
            if !self.is_group_ready(state, group_id) {
                break;
            }
            // Advance before launching so a failed launch never re-runs the group.
            active.cursor += 1;
            if let Err(failure) = self.launch(state, group_id) {
                outcome = Err(failure);
                break;
            }
        }
        if active.cursor == group_ids.len() {
            tracing::debug!(job_id = active.job_id, "job drained");
            state.active = None;
        } else {
            state.active = Some(active);
        }
        outcome
    }

    fn is_group_ready(&self, state: &RuntimeState, group_id: GroupId) -> bool {
        state.groups[group_id].ready_requests.len()
            == self.schedule.group(group_id).request_ids.len()
    }

    fn launch(
        &self,
        state: &mut RuntimeState,
        group_id: GroupId,
    ) -> std::result::Result<(), LaunchFailure> {
        let group = self.schedule.group(group_id);
        let mut unfired = Vec::new();
        let ranks: Vec<RankContributions> = group
            .request_ids
            .iter()
            .map(|&id| {
                let mut contributions = std::mem::take(&mut state.requests[id].ready_ranks);
                unfired.extend(contributions.values_mut().map(reclaimable_callback));
                contributions
            })
            .collect();
        state.groups[group_id].ready_requests.clear();

        tracing::debug!(
            group_id,
            backend = %group.backend,
            members = group.requests.len(),
            "launching group"
        );
        self.backends
            .get(group.backend)
            .and_then(|backend| backend.execute_group(&group.requests, ranks))
            .map_err(|error| LaunchFailure {
                group_id,
                error,
                unfired,
            })
    }
}

/// A callback the executor can still fire if the backend drops it unfired.
type CallbackSlot = Arc<Mutex<Option<Callback>>>;

/// Swap `info`'s callback for a forwarder and keep the original in a slot.
/// Whichever side takes the slot first fires the callback.
fn reclaimable_callback(info: &mut RuntimeRequestInfo) -> CallbackSlot {
    let original = std::mem::replace(&mut info.callback, Box::new(|_: Status| {}));
    let slot: CallbackSlot = Arc::new(Mutex::new(Some(original)));
    let forward = Arc::clone(&slot);
    info.callback = Box::new(move |status: Status| {
        if let Some(callback) = take_callback(&forward) {
            callback(status);
        }
    });
    slot
}

fn take_callback(slot: &CallbackSlot) -> Option<Callback> {
    slot.lock().ok().and_then(|mut callback| callback.take())
}

struct LaunchFailure {
    group_id: GroupId,
    error: BoxingError,
    unfired: Vec<CallbackSlot>,
}

impl LaunchFailure {
    /// Complete every callback the backend never fired, then hand back the
    /// backend's error. Runs without the executor lock held.
    fn notify(self) -> BoxingError {
        tracing::error!(group_id = self.group_id, error = %self.error, "group launch failed");
        let status = Arc::new(BoxingError::GroupLaunchFailed {
            group_id: self.group_id,
            message: self.error.to_string(),
        });
        for slot in &self.unfired {
            if let Some(callback) = take_callback(slot) {
                callback(Err(Arc::clone(&status)));
            }
        }
        self.error
    }
}
