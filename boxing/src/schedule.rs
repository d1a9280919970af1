//! Static execution schedule built once from the plan.
//!
//! Requests with at least one rank on this machine are sorted by submission
//! order, split into rough groups (same dependency depth, backend and device
//! set), and each rough group is handed to its backend for fusion.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::backend::BackendRegistry;
use crate::config::BoxingConfig;
use crate::error::{BoxingError, Result};
use crate::plan::{MachineContext, Plan, RequestDesc};
use crate::types::{BackendKind, JobId, Rank};

pub type RequestId = usize;
pub type GroupId = usize;

/// Per-request static data.
#[derive(Debug, Clone)]
pub struct ScheduledRequest {
    pub desc: Arc<RequestDesc>,
    pub job_id: JobId,
    pub group_id: GroupId,
    pub local_ranks: BTreeSet<Rank>,
}

/// Members of one execution group, in submission order.
#[derive(Debug, Clone)]
pub struct ScheduledGroup {
    pub backend: BackendKind,
    pub request_ids: Vec<RequestId>,
    pub requests: Vec<Arc<RequestDesc>>,
}

/// Immutable job → ordered group list, plus request and group tables.
#[derive(Debug, Default)]
pub struct Schedule {
    requests: Vec<ScheduledRequest>,
    groups: Vec<ScheduledGroup>,
    job_groups: HashMap<JobId, Vec<GroupId>>,
    name_to_request: HashMap<String, RequestId>,
}

impl Schedule {
    pub fn build(
        plan: &Plan,
        ctx: &MachineContext,
        config: &BoxingConfig,
        backends: &BackendRegistry,
    ) -> Result<Self> {
        let mut schedule = Self::default();
        for &job_id in plan.jobs.keys() {
            let requests = plan.local_requests(job_id, ctx.this_machine_id);
            check_dependency_order(&requests)?;
            for request in &requests {
                request.op_desc.validate(request.device_set.len())?;
            }

            for rough in rough_groups(&requests, config.enable_fusion) {
                let kind = rough[0].op_desc.backend;
                let backend = backends.get(kind)?;
                let groups = backend.group_requests(&rough);
                check_partition(kind, &rough, &groups)?;
                for group in groups {
                    schedule.push_group(job_id, kind, group, ctx)?;
                }
            }
        }
        Ok(schedule)
    }

    fn push_group(
        &mut self,
        job_id: JobId,
        backend: BackendKind,
        requests: Vec<Arc<RequestDesc>>,
        ctx: &MachineContext,
    ) -> Result<()> {
        let group_id = self.groups.len();
        let mut request_ids = Vec::with_capacity(requests.len());
        for request in &requests {
            let request_id = self.requests.len();
            let name = request.name().to_owned();
            if self.name_to_request.contains_key(&name) {
                return Err(BoxingError::DuplicateRequest { name });
            }
            self.name_to_request.insert(name, request_id);
            self.requests.push(ScheduledRequest {
                desc: Arc::clone(request),
                job_id,
                group_id,
                local_ranks: request.device_set.local_ranks(ctx.this_machine_id),
            });
            request_ids.push(request_id);
        }
        self.groups.push(ScheduledGroup {
            backend,
            request_ids,
            requests,
        });
        self.job_groups.entry(job_id).or_default().push(group_id);
        Ok(())
    }

    pub fn request_id(&self, name: &str) -> Option<RequestId> {
        self.name_to_request.get(name).copied()
    }

    pub fn request(&self, id: RequestId) -> &ScheduledRequest {
        &self.requests[id]
    }

    pub fn requests(&self) -> &[ScheduledRequest] {
        &self.requests
    }

    pub fn group(&self, id: GroupId) -> &ScheduledGroup {
        &self.groups[id]
    }

    pub fn groups(&self) -> &[ScheduledGroup] {
        &self.groups
    }

    /// Ordered group ids of `job_id`; empty when the job has no local work.
    pub fn job_groups(&self, job_id: JobId) -> &[GroupId] {
        self.job_groups
            .get(&job_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    /// Emit the schedule, one event per group, when debug mode is on.
    pub fn dump_summary(&self) {
        for (group_id, group) in self.groups.iter().enumerate() {
            tracing::info!(
                target: "boxing::schedule",
                group_id,
                backend = %group.backend,
                members = group.requests.len(),
                "group"
            );
            for request in &group.requests {
                tracing::info!(target: "boxing::schedule", group_id, request = %request);
            }
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (group_id, group) in self.groups.iter().enumerate() {
            writeln!(f, "group id: {group_id}")?;
            for request in &group.requests {
                writeln!(f, "  {request}")?;
            }
        }
        Ok(())
    }
}

fn check_dependency_order(requests: &[Arc<RequestDesc>]) -> Result<()> {
    match requests
        .windows(2)
        .find(|w| w[0].dependency_depth > w[1].dependency_depth)
    {
        Some(w) => Err(BoxingError::DependencyDepthDecreased {
            prev: w[0].name().to_owned(),
            prev_depth: w[0].dependency_depth,
            next: w[1].name().to_owned(),
            next_depth: w[1].dependency_depth,
        }),
        None => Ok(()),
    }
}

/// Split sorted requests into runs sharing depth, backend and device set.
fn rough_groups(requests: &[Arc<RequestDesc>], enable_fusion: bool) -> Vec<Vec<Arc<RequestDesc>>> {
    let mut rough: Vec<Vec<Arc<RequestDesc>>> = Vec::new();
    for request in requests {
        let joins = enable_fusion
            && rough.last().is_some_and(|g| {
                let first = &g[0];
                first.dependency_depth == request.dependency_depth
                    && first.op_desc.backend == request.op_desc.backend
                    && first.device_set == request.device_set
            });
        match rough.last_mut() {
            Some(g) if joins => g.push(Arc::clone(request)),
            _ => rough.push(vec![Arc::clone(request)]),
        }
    }
    rough
}

/// A backend's grouping must cover its input exactly once, in order.
fn check_partition(
    kind: BackendKind,
    rough: &[Arc<RequestDesc>],
    groups: &[Vec<Arc<RequestDesc>>],
) -> Result<()> {
    let flattened = groups.iter().flatten();
    let same = groups.iter().all(|g| !g.is_empty())
        && groups.iter().map(Vec::len).sum::<usize>() == rough.len()
        && flattened.zip(rough).all(|(a, b)| Arc::ptr_eq(a, b));
    if same {
        Ok(())
    } else {
        Err(BoxingError::backend(
            kind,
            "grouping reordered, dropped or duplicated requests",
        ))
    }
}
