//! Static description of the collective operations a process takes part in.
//!
//! A [`Plan`] is produced by the graph-construction stage and consumed once
//! at startup. Nothing here changes after the schedule is built.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{BoxingError, Result};
use crate::types::{BackendKind, DataType, DeviceId, JobId, MachineId, OpType, Rank, ReduceOp};

/// One physical participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceDesc {
    pub machine_id: MachineId,
    pub device_id: DeviceId,
}

impl DeviceDesc {
    pub const fn new(machine_id: MachineId, device_id: DeviceId) -> Self {
        Self {
            machine_id,
            device_id,
        }
    }
}

/// Ordered participants of one operation. The index of a device is its rank.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceSet {
    devices: Vec<DeviceDesc>,
}

impl DeviceSet {
    pub fn new(devices: Vec<DeviceDesc>) -> Self {
        Self { devices }
    }

    /// `devices_per_machine` devices on each of `machines` machines, ranks
    /// assigned machine-major.
    pub fn grid(machines: u32, devices_per_machine: u32) -> Self {
        let devices = (0..machines)
            .flat_map(|m| (0..devices_per_machine).map(move |d| DeviceDesc::new(m, d)))
            .collect();
        Self { devices }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn devices(&self) -> &[DeviceDesc] {
        &self.devices
    }

    /// Device holding `rank`, if the rank is in range.
    pub fn device(&self, rank: Rank) -> Option<&DeviceDesc> {
        self.devices.get(rank as usize)
    }

    /// Ranks whose device lives on `machine_id`.
    pub fn local_ranks(&self, machine_id: MachineId) -> BTreeSet<Rank> {
        self.devices
            .iter()
            .enumerate()
            .filter(|(_, d)| d.machine_id == machine_id)
            .map(|(r, _)| r as Rank)
            .collect()
    }

    pub fn has_device_on(&self, machine_id: MachineId) -> bool {
        self.devices.iter().any(|d| d.machine_id == machine_id)
    }

    /// True when every participant lives on `machine_id`.
    pub fn is_local_only(&self, machine_id: MachineId) -> bool {
        self.devices.iter().all(|d| d.machine_id == machine_id)
    }
}

/// Static description of one logical collective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpDesc {
    /// Globally unique operation name; contributions are routed by it.
    pub name: String,
    pub op_type: OpType,
    pub shape: Vec<usize>,
    pub data_type: DataType,
    pub reduce_method: Option<ReduceOp>,
    pub root: Option<Rank>,
    pub num_ranks: u32,
    pub backend: BackendKind,
}

impl OpDesc {
    fn new(name: impl Into<String>, op_type: OpType, shape: Vec<usize>, dtype: DataType) -> Self {
        Self {
            name: name.into(),
            op_type,
            shape,
            data_type: dtype,
            reduce_method: None,
            root: None,
            num_ranks: 0,
            backend: BackendKind::Nccl,
        }
    }

    pub fn all_reduce(
        name: impl Into<String>,
        shape: Vec<usize>,
        dtype: DataType,
        op: ReduceOp,
    ) -> Self {
        Self {
            reduce_method: Some(op),
            ..Self::new(name, OpType::AllReduce, shape, dtype)
        }
    }

    pub fn all_gather(name: impl Into<String>, shape: Vec<usize>, dtype: DataType) -> Self {
        Self::new(name, OpType::AllGather, shape, dtype)
    }

    pub fn reduce_scatter(
        name: impl Into<String>,
        shape: Vec<usize>,
        dtype: DataType,
        op: ReduceOp,
    ) -> Self {
        Self {
            reduce_method: Some(op),
            ..Self::new(name, OpType::ReduceScatter, shape, dtype)
        }
    }

    pub fn reduce(
        name: impl Into<String>,
        shape: Vec<usize>,
        dtype: DataType,
        op: ReduceOp,
        root: Rank,
    ) -> Self {
        Self {
            reduce_method: Some(op),
            root: Some(root),
            ..Self::new(name, OpType::Reduce, shape, dtype)
        }
    }

    pub fn broadcast(
        name: impl Into<String>,
        shape: Vec<usize>,
        dtype: DataType,
        root: Rank,
    ) -> Self {
        Self {
            root: Some(root),
            ..Self::new(name, OpType::Broadcast, shape, dtype)
        }
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_num_ranks(mut self, num_ranks: u32) -> Self {
        self.num_ranks = num_ranks;
        self
    }

    /// Number of elements described by `shape`.
    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Unaligned operand size in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.elem_count() * self.data_type.size_in_bytes()
    }

    /// Check the descriptor is executable on a device set of `world` ranks.
    pub fn validate(&self, world: usize) -> Result<()> {
        if self.num_ranks as usize != world {
            return Err(BoxingError::invalid_op(
                &self.name,
                self.op_type,
                format!(
                    "declares {} ranks but its device set has {world}",
                    self.num_ranks
                ),
            ));
        }
        if self.op_type.is_reducing() && self.reduce_method.is_none() {
            return Err(BoxingError::invalid_op(
                &self.name,
                self.op_type,
                "missing reduce method",
            ));
        }
        if self.op_type.is_rooted() {
            match self.root {
                Some(root) if root < self.num_ranks => {}
                Some(root) => {
                    return Err(BoxingError::invalid_op(
                        &self.name,
                        self.op_type,
                        format!("root {root} out of range for {} ranks", self.num_ranks),
                    ));
                }
                None => {
                    return Err(BoxingError::invalid_op(
                        &self.name,
                        self.op_type,
                        "missing root",
                    ));
                }
            }
        }
        if matches!(self.op_type, OpType::AllGather | OpType::ReduceScatter)
            && self.num_ranks > 0
            && self.elem_count() % self.num_ranks as usize != 0
        {
            return Err(BoxingError::invalid_op(
                &self.name,
                self.op_type,
                format!(
                    "element count {} not divisible by {} ranks",
                    self.elem_count(),
                    self.num_ranks
                ),
            ));
        }
        Ok(())
    }
}

/// One logical collective call inside a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDesc {
    pub op_desc: OpDesc,
    pub device_set: DeviceSet,
    /// Deterministic execution order within the job.
    pub order: i64,
    /// Non-decreasing along `order`.
    pub dependency_depth: i64,
}

impl RequestDesc {
    /// Build a request; `op_desc.num_ranks` is filled from the device set
    /// when left at zero.
    pub fn new(mut op_desc: OpDesc, device_set: DeviceSet, order: i64, depth: i64) -> Self {
        if op_desc.num_ranks == 0 {
            op_desc.num_ranks = device_set.len() as u32;
        }
        Self {
            op_desc,
            device_set,
            order,
            dependency_depth: depth,
        }
    }

    pub fn name(&self) -> &str {
        &self.op_desc.name
    }
}

impl std::fmt::Display for RequestDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} shape={:?} dtype={} ranks={} order={} depth={} backend={}",
            self.op_desc.name,
            self.op_desc.op_type,
            self.op_desc.shape,
            self.op_desc.data_type,
            self.op_desc.num_ranks,
            self.order,
            self.dependency_depth,
            self.op_desc.backend,
        )?;
        if let Some(op) = self.op_desc.reduce_method {
            write!(f, " reduce={op}")?;
        }
        if let Some(root) = self.op_desc.root {
            write!(f, " root={root}")?;
        }
        Ok(())
    }
}

/// All requests of one job.
#[derive(Debug, Clone, Default)]
pub struct RequestSet {
    pub requests: Vec<Arc<RequestDesc>>,
}

impl RequestSet {
    pub fn push(&mut self, request: RequestDesc) {
        self.requests.push(Arc::new(request));
    }
}

impl FromIterator<RequestDesc> for RequestSet {
    fn from_iter<I: IntoIterator<Item = RequestDesc>>(iter: I) -> Self {
        Self {
            requests: iter.into_iter().map(Arc::new).collect(),
        }
    }
}

/// Job → request set, iterated in job id order.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub jobs: BTreeMap<JobId, RequestSet>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_job(&mut self, job_id: JobId, requests: RequestSet) {
        self.jobs.insert(job_id, requests);
    }

    /// Requests of `job_id` with at least one rank on `machine_id`, sorted by
    /// submission order.
    pub fn local_requests(&self, job_id: JobId, machine_id: MachineId) -> Vec<Arc<RequestDesc>> {
        let mut requests: Vec<Arc<RequestDesc>> = self
            .jobs
            .get(&job_id)
            .map(|set| {
                set.requests
                    .iter()
                    .filter(|r| r.device_set.has_device_on(machine_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        sort_by_order(&mut requests);
        requests
    }
}

pub(crate) fn sort_by_order(requests: &mut [Arc<RequestDesc>]) {
    requests.sort_by_key(|r| r.order);
}

/// Identity of this process within the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineContext {
    pub this_machine_id: MachineId,
}

impl MachineContext {
    pub const fn new(this_machine_id: MachineId) -> Self {
        Self { this_machine_id }
    }

    /// Locate this host in the cluster host list; its index is the machine id.
    pub fn discover(hosts: &[String]) -> Result<Self> {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        Self::from_host_list(&hostname, hosts)
    }

    fn from_host_list(hostname: &str, hosts: &[String]) -> Result<Self> {
        hosts
            .iter()
            .position(|h| h == hostname)
            .map(|idx| Self::new(idx as MachineId))
            .ok_or_else(|| {
                BoxingError::Config(format!("host `{hostname}` not found in cluster host list"))
            })
    }

    pub fn is_local(&self, device: &DeviceDesc) -> bool {
        device.machine_id == self.this_machine_id
    }
}
