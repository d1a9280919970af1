use boxing::{
    Backend, BackendKind, BackendRegistry, BoxingConfig, Callback, CompletionTracker, DataType,
    DeviceEvent, DeviceSet, EventStatus, Executor, MachineContext, OpDesc, Plan,
    RankContributions, RankDesc, RequestDesc, RequestSet, ReduceOp, Result, RuntimeRequestInfo,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Completes when the shared gate opens.
struct GateEvent(Arc<AtomicBool>);

impl DeviceEvent for GateEvent {
    fn query(&self) -> Result<EventStatus> {
        Ok(if self.0.load(Ordering::Acquire) {
            EventStatus::Complete
        } else {
            EventStatus::Pending
        })
    }
}

/// Backend that defers completion to a tracker, one event per rank.
struct DeferredBackend {
    tracker: Mutex<CompletionTracker>,
    gate: Arc<AtomicBool>,
}

impl Backend for DeferredBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Nccl
    }

    fn execute_group(
        &self,
        _group: &[Arc<RequestDesc>],
        ranks: Vec<RankContributions>,
    ) -> Result<()> {
        let tracker = self.tracker.lock().unwrap();
        let mut per_device: Vec<Vec<Callback>> = Vec::new();
        for contributions in ranks {
            for (rank, info) in contributions {
                let idx = rank as usize;
                if per_device.len() <= idx {
                    per_device.resize_with(idx + 1, Vec::new);
                }
                per_device[idx].push(info.callback);
            }
        }
        for (device, callbacks) in per_device.into_iter().enumerate() {
            tracker.submit(
                device as u32,
                Box::new(GateEvent(Arc::clone(&self.gate))),
                callbacks,
            )?;
        }
        Ok(())
    }
}

#[test]
fn test_callbacks_fire_only_after_device_completion() {
    let mut plan = Plan::new();
    plan.add_job(
        0,
        [RequestDesc::new(
            OpDesc::all_reduce("grad", vec![32], DataType::F32, ReduceOp::Sum),
            DeviceSet::grid(1, 2),
            0,
            0,
        )]
        .into_iter()
        .collect::<RequestSet>(),
    );
    let gate = Arc::new(AtomicBool::new(false));
    let backend = Arc::new(DeferredBackend {
        tracker: Mutex::new(CompletionTracker::start("boxing-test-poller").unwrap()),
        gate: Arc::clone(&gate),
    });
    let mut backends = BackendRegistry::new();
    backends.register(backend.clone());
    let exec = Executor::new(
        &plan,
        MachineContext::new(0),
        &BoxingConfig::default(),
        backends,
    )
    .unwrap();

    let (tx, rx) = mpsc::channel();
    for rank in [0u32, 1] {
        let tx = tx.clone();
        exec.enqueue(
            &RankDesc::new("grad", rank),
            RuntimeRequestInfo::new(0, 0, move |status| {
                let _ = tx.send((rank, status.is_ok()));
            }),
        )
        .unwrap();
    }
    // Launched, but nothing has completed on the device yet.
    assert_eq!(exec.active_job().unwrap(), None);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    gate.store(true, Ordering::Release);
    let mut seen: Vec<_> = (0..2)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect();
    seen.sort();
    assert_eq!(seen, vec![(0, true), (1, true)]);

    backend.tracker.lock().unwrap().shutdown();
    assert_eq!(backend.tracker.lock().unwrap().pending(), 0);
}
