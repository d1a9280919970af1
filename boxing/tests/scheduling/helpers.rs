use boxing::{
    Backend, BackendKind, BackendRegistry, BoxingConfig, BoxingError, Executor, FusionPolicy,
    MachineContext, Plan, Rank, RankContributions, RankDesc, RequestDesc, Result,
    RuntimeRequestInfo, Status,
};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

/// One `execute_group` call as seen by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub names: Vec<String>,
    pub ranks: Vec<Vec<Rank>>,
}

/// Backend that records launches and completes every contribution inline.
pub struct RecordingBackend {
    kind: BackendKind,
    policy: FusionPolicy,
    launches: Mutex<Vec<Launch>>,
    /// Groups containing this request fail to launch.
    fail_on: Mutex<Option<String>>,
}

impl RecordingBackend {
    pub fn new(kind: BackendKind, config: &BoxingConfig) -> Arc<Self> {
        Arc::new(Self {
            kind,
            policy: FusionPolicy::from_config(config),
            launches: Mutex::new(Vec::new()),
            fail_on: Mutex::new(None),
        })
    }

    pub fn fail_on(&self, name: &str) {
        *self.fail_on.lock().unwrap() = Some(name.to_owned());
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.launches.lock().unwrap().clone()
    }

    /// Launched groups as lists of member names.
    pub fn launched_names(&self) -> Vec<Vec<String>> {
        self.launches().into_iter().map(|l| l.names).collect()
    }
}

impl Backend for RecordingBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn group_requests(&self, requests: &[Arc<RequestDesc>]) -> Vec<Vec<Arc<RequestDesc>>> {
        self.policy.group(requests)
    }

    fn execute_group(
        &self,
        group: &[Arc<RequestDesc>],
        ranks: Vec<RankContributions>,
    ) -> Result<()> {
        self.launches.lock().unwrap().push(Launch {
            names: group.iter().map(|r| r.name().to_owned()).collect(),
            ranks: ranks.iter().map(|c| c.keys().copied().collect()).collect(),
        });
        if let Some(name) = self.fail_on.lock().unwrap().as_deref()
            && group.iter().any(|r| r.name() == name)
        {
            return Err(BoxingError::backend(self.kind, format!("cannot launch `{name}`")));
        }
        for contributions in ranks {
            for (_, info) in contributions {
                (info.callback)(Ok(()));
            }
        }
        Ok(())
    }
}

/// Executor on `machine` with a single recording NCCL-tagged backend.
pub fn recording_executor(
    plan: &Plan,
    machine: u32,
    config: &BoxingConfig,
) -> Result<(Executor, Arc<RecordingBackend>)> {
    let backend = RecordingBackend::new(BackendKind::Nccl, config);
    let mut backends = BackendRegistry::new();
    backends.register(backend.clone());
    let exec = Executor::new(plan, MachineContext::new(machine), config, backends)?;
    Ok((exec, backend))
}

pub fn no_fusion() -> BoxingConfig {
    BoxingConfig {
        enable_fusion: false,
        ..BoxingConfig::default()
    }
}

/// Contribution whose callback reports its status on `tx`.
pub fn contribution(tx: &mpsc::Sender<(String, Status)>, name: &str) -> RuntimeRequestInfo {
    let tx = tx.clone();
    let name = name.to_owned();
    RuntimeRequestInfo::new(0x1000, 0x2000, move |status| {
        let _ = tx.send((name, status));
    })
}

/// Contribution that ignores its completion.
pub fn silent() -> RuntimeRequestInfo {
    RuntimeRequestInfo::new(0, 0, |_| {})
}

pub fn submit(exec: &Executor, name: &str, rank: Rank) -> Result<()> {
    exec.enqueue(&RankDesc::new(name, rank), silent())
}

/// Submit every local rank of every named request, in the given order.
pub fn submit_all(exec: &Executor, names: &[&str], ranks: &[Rank]) -> Result<()> {
    for name in names {
        for &rank in ranks {
            submit(exec, name, rank)?;
        }
    }
    Ok(())
}
