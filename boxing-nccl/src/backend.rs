use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use boxing::{
    Backend, BackendKind, BoxingConfig, Callback, CompletionTracker, ControlPlane, DeviceId,
    DeviceSet, FusionPolicy, MachineContext, OpType, Plan, RankContributions, RequestDesc,
    Scratch, ScratchPool, Status, communicator_specs, exchange_unique_id,
};
use cudarc::driver::CudaContext;
use cudarc::driver::{result as driver, sys as driver_sys};
use cudarc::nccl::result as nccl;

use crate::comm::{Communicator, DeviceComms, generate_unique_id, id_from_bytes};
use crate::device::{ComputeStream, CudaEvent, FusionBuffer};
use crate::error::{NcclBackendError, Result};
use crate::layout::FusionLayout;
use crate::types::{reduce_op, to_nccl_dtype};

/// Streams of one local device, indexed by stream id.
struct DeviceStreams {
    ctx: Arc<CudaContext>,
    streams: Vec<ComputeStream>,
}

/// Reference collective backend on NCCL.
///
/// Owns one communicator per (device set, stream, local device), one
/// high-priority stream per (stream, local device), and a pool of fusion
/// buffers per local device. Fields are declared in teardown order.
pub struct NcclBackend {
    tracker: CompletionTracker,
    streams: BTreeMap<DeviceId, DeviceStreams>,
    comms: HashMap<DeviceSet, Vec<DeviceComms>>,
    fusion_buffers: BTreeMap<DeviceId, Arc<ScratchPool<FusionBuffer>>>,
    policy: FusionPolicy,
    num_streams: usize,
    next_stream: AtomicUsize,
}

impl NcclBackend {
    /// Establish communicators for every NCCL device set in `plan` with a
    /// rank on this machine, then allocate streams and fusion buffers.
    ///
    /// All machines must call this concurrently; non-root machines block on
    /// the control plane until rank 0's machine publishes each handle.
    pub async fn init(
        plan: &Plan,
        ctx: &MachineContext,
        config: &BoxingConfig,
        control_plane: &dyn ControlPlane,
    ) -> Result<Self> {
        config.validate()?;
        let specs = communicator_specs(plan, ctx, BackendKind::Nccl);

        let mut contexts: BTreeMap<DeviceId, Arc<CudaContext>> = BTreeMap::new();
        for spec in &specs {
            for &rank in &spec.local_ranks {
                if let Some(device) = spec.device_set.device(rank)
                    && !contexts.contains_key(&device.device_id)
                {
                    let cu_ctx = CudaContext::new(device.device_id as usize)?;
                    contexts.insert(device.device_id, cu_ctx);
                }
            }
        }

        let mut comms = HashMap::with_capacity(specs.len());
        for spec in &specs {
            let mut per_stream = Vec::with_capacity(config.num_streams);
            for stream_id in 0..config.num_streams {
                let bytes = exchange_unique_id(
                    control_plane,
                    spec,
                    stream_id,
                    generate_unique_id,
                    config.rendezvous_timeout,
                )
                .await?;
                let id = id_from_bytes(&bytes)?;
                per_stream.push(Communicator::init_local_ranks(spec, &contexts, &id)?);
            }
            tracing::info!(
                name = %spec.name,
                world = spec.device_set.len(),
                local_ranks = spec.local_ranks.len(),
                streams = config.num_streams,
                "nccl communicators established"
            );
            comms.insert(spec.device_set.clone(), per_stream);
        }

        let mut streams = BTreeMap::new();
        let mut fusion_buffers = BTreeMap::new();
        for (&device_id, cu_ctx) in &contexts {
            let device_streams = (0..config.num_streams)
                .map(|_| ComputeStream::high_priority(cu_ctx))
                .collect::<Result<Vec<_>>>()?;
            streams.insert(
                device_id,
                DeviceStreams {
                    ctx: Arc::clone(cu_ctx),
                    streams: device_streams,
                },
            );
            let pool = ScratchPool::prefilled(config.num_streams, || {
                Ok(FusionBuffer::alloc(cu_ctx, config.fusion_threshold_bytes)?)
            })?;
            fusion_buffers.insert(device_id, pool);
        }
        tracing::info!(
            devices = contexts.len(),
            streams_per_device = config.num_streams,
            fusion_buffer_bytes = config.fusion_threshold_bytes,
            "nccl streams and fusion buffers allocated"
        );

        Ok(Self {
            tracker: CompletionTracker::start("boxing-nccl-poller")?,
            streams,
            comms,
            fusion_buffers,
            policy: FusionPolicy::from_config(config),
            num_streams: config.num_streams,
            next_stream: AtomicUsize::new(0),
        })
    }

    /// Number of distinct device sets with communicators on this machine.
    pub fn num_device_sets(&self) -> usize {
        self.comms.len()
    }

    fn stream(&self, device_id: DeviceId, stream_id: usize) -> Result<&ComputeStream> {
        self.streams
            .get(&device_id)
            .and_then(|d| d.streams.get(stream_id))
            .ok_or(NcclBackendError::UnknownDevice { device_id })
    }

    fn launch(&self, group: &[Arc<RequestDesc>], ranks: Vec<RankContributions>) -> Result<()> {
        let Some(first) = group.first() else {
            return Ok(());
        };
        let stream_id = self.next_stream.fetch_add(1, Ordering::Relaxed) % self.num_streams;
        let comms = self
            .comms
            .get(&first.device_set)
            .and_then(|per_stream| per_stream.get(stream_id))
            .ok_or_else(|| NcclBackendError::UnknownDeviceSet {
                name: first.name().to_owned(),
            })?;

        let mut callbacks: BTreeMap<DeviceId, Vec<Callback>> = BTreeMap::new();
        let buffered = (first.op_desc.op_type == OpType::AllReduce
            && self.policy.all_reduce_use_buffer)
            .then(|| FusionLayout::for_group(group))
            .filter(|layout| layout.fits(self.policy.threshold_bytes));
        if let Some(layout) = buffered {
            self.launch_buffered_all_reduce(
                group,
                &layout,
                ranks,
                stream_id,
                comms,
                &mut callbacks,
            )?;
        } else {
            nccl::group_start()?;
            let launched = self.launch_each(group, ranks, stream_id, comms, &mut callbacks);
            nccl::group_end()?;
            launched?;
        }

        for (device_id, device_callbacks) in callbacks {
            let event = CudaEvent::record(device_id, self.stream(device_id, stream_id)?)?;
            self.tracker
                .submit(device_id, Box::new(event), device_callbacks)?;
        }
        tracing::debug!(
            name = %first.name(),
            members = group.len(),
            stream_id,
            "nccl group queued"
        );
        Ok(())
    }

    /// One primitive per (request, local rank), all inside the caller's
    /// NCCL group.
    fn launch_each(
        &self,
        group: &[Arc<RequestDesc>],
        ranks: Vec<RankContributions>,
        stream_id: usize,
        comms: &DeviceComms,
        callbacks: &mut BTreeMap<DeviceId, Vec<Callback>>,
    ) -> Result<()> {
        for (request, contributions) in group.iter().zip(ranks) {
            for (rank, info) in contributions {
                let device_id = self.local_device(request, rank)?;
                let stream = self.stream(device_id, stream_id)?;
                stream.bind()?;
                let comm = self.comm(comms, request, device_id, stream_id)?;
                unsafe { comm.launch(&request.op_desc, info.send_buf, info.recv_buf, stream)? };
                callbacks.entry(device_id).or_default().push(info.callback);
            }
        }
        Ok(())
    }

    /// Copy every member into one scratch buffer per rank, reduce it in
    /// place once, and copy each member's slice back out.
    fn launch_buffered_all_reduce(
        &self,
        group: &[Arc<RequestDesc>],
        layout: &FusionLayout,
        ranks: Vec<RankContributions>,
        stream_id: usize,
        comms: &DeviceComms,
        callbacks: &mut BTreeMap<DeviceId, Vec<Callback>>,
    ) -> Result<()> {
        let first = &group[0];
        let dtype = first.op_desc.data_type;
        let op = reduce_op(&first.op_desc)?;

        // rank -> (device, scratch, (member, send, recv) per contribution)
        let mut staged: BTreeMap<u32, (DeviceId, Scratch<FusionBuffer>, Vec<(usize, u64, u64)>)> =
            BTreeMap::new();
        for (member, (contributions, request)) in ranks.into_iter().zip(group).enumerate() {
            for (rank, info) in contributions {
                let device_id = self.local_device(request, rank)?;
                if !staged.contains_key(&rank) {
                    let scratch = self.acquire_fusion_buffer(device_id)?;
                    staged.insert(rank, (device_id, scratch, Vec::new()));
                }
                if let Some((_, _, buffers)) = staged.get_mut(&rank) {
                    buffers.push((member, info.send_buf, info.recv_buf));
                }
                callbacks.entry(device_id).or_default().push(info.callback);
            }
        }

        for (device_id, scratch, buffers) in staged.values() {
            let stream = self.stream(*device_id, stream_id)?;
            stream.bind()?;
            for &(member, send, _) in buffers {
                unsafe {
                    driver::memcpy_dtod_async(
                        scratch.ptr() + layout.offsets[member] as u64,
                        send as driver_sys::CUdeviceptr,
                        group[member].op_desc.size_in_bytes(),
                        stream.raw(),
                    )?;
                }
            }
        }

        let count = layout.elem_count(dtype);
        nccl::group_start()?;
        let reduced = staged.values().try_for_each(|(device_id, scratch, _)| {
            let stream = self.stream(*device_id, stream_id)?;
            stream.bind()?;
            let comm = self.comm(comms, first, *device_id, stream_id)?;
            unsafe {
                comm.all_reduce_inplace(scratch.ptr(), count, to_nccl_dtype(dtype), op, stream)
            }
        });
        nccl::group_end()?;
        reduced?;

        for (device_id, scratch, buffers) in staged.into_values() {
            let stream = self.stream(device_id, stream_id)?;
            stream.bind()?;
            for &(member, _, recv) in &buffers {
                unsafe {
                    driver::memcpy_dtod_async(
                        recv as driver_sys::CUdeviceptr,
                        scratch.ptr() + layout.offsets[member] as u64,
                        group[member].op_desc.size_in_bytes(),
                        stream.raw(),
                    )?;
                }
            }
            // The buffer goes back to the pool once the device work completes.
            callbacks
                .entry(device_id)
                .or_default()
                .push(Box::new(move |_: Status| drop(scratch)));
        }
        Ok(())
    }

    fn acquire_fusion_buffer(&self, device_id: DeviceId) -> Result<Scratch<FusionBuffer>> {
        let pool = self
            .fusion_buffers
            .get(&device_id)
            .ok_or(NcclBackendError::UnknownDevice { device_id })?;
        let ctx = &self
            .streams
            .get(&device_id)
            .ok_or(NcclBackendError::UnknownDevice { device_id })?
            .ctx;
        let len = self.policy.threshold_bytes;
        Ok(pool.acquire(|| Ok(FusionBuffer::alloc(ctx, len)?))?)
    }

    fn local_device(&self, request: &RequestDesc, rank: u32) -> Result<DeviceId> {
        request
            .device_set
            .device(rank)
            .map(|d| d.device_id)
            .ok_or_else(|| NcclBackendError::RankOutOfRange {
                name: request.name().to_owned(),
                rank,
            })
    }

    fn comm<'a>(
        &self,
        comms: &'a DeviceComms,
        request: &RequestDesc,
        device_id: DeviceId,
        stream_id: usize,
    ) -> Result<&'a Communicator> {
        comms
            .get(&device_id)
            .ok_or_else(|| NcclBackendError::MissingCommunicator {
                name: request.name().to_owned(),
                device_id,
                stream_id,
            })
    }
}

impl Backend for NcclBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Nccl
    }

    fn group_requests(&self, requests: &[Arc<RequestDesc>]) -> Vec<Vec<Arc<RequestDesc>>> {
        self.policy.group(requests)
    }

    fn execute_group(
        &self,
        group: &[Arc<RequestDesc>],
        ranks: Vec<RankContributions>,
    ) -> boxing::Result<()> {
        Ok(self.launch(group, ranks)?)
    }
}

impl Drop for NcclBackend {
    fn drop(&mut self) {
        // Drain outstanding events first; streams, communicators and fusion
        // buffers are then released in field order.
        self.tracker.shutdown();
        for (device_id, device) in &self.streams {
            for stream in &device.streams {
                if let Err(e) = stream.synchronize() {
                    tracing::error!(device_id, error = %e, "stream synchronize failed");
                }
            }
        }
    }
}
