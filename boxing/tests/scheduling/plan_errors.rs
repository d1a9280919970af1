use super::helpers::{RecordingBackend, no_fusion, recording_executor};
use boxing::{
    BackendKind, BackendRegistry, BoxingConfig, BoxingError, DataType, DeviceSet, Executor,
    MachineContext, OpDesc, Plan, RequestDesc, RequestSet, ReduceOp,
};

fn gather(name: &str, order: i64, depth: i64) -> RequestDesc {
    RequestDesc::new(
        OpDesc::all_gather(name, vec![4], DataType::F32),
        DeviceSet::grid(1, 2),
        order,
        depth,
    )
}

#[test]
fn test_duplicate_names_across_jobs_rejected() {
    let mut plan = Plan::new();
    plan.add_job(0, [gather("same", 0, 0)].into_iter().collect::<RequestSet>());
    plan.add_job(1, [gather("same", 0, 0)].into_iter().collect::<RequestSet>());
    let err = recording_executor(&plan, 0, &no_fusion()).err().unwrap();
    assert!(matches!(err, BoxingError::DuplicateRequest { name } if name == "same"));
}

#[test]
fn test_decreasing_depth_rejected() {
    let mut plan = Plan::new();
    plan.add_job(
        0,
        [gather("first", 0, 3), gather("second", 1, 2)]
            .into_iter()
            .collect::<RequestSet>(),
    );
    let err = recording_executor(&plan, 0, &BoxingConfig::default())
        .err()
        .unwrap();
    assert!(matches!(
        err,
        BoxingError::DependencyDepthDecreased {
            prev_depth: 3,
            next_depth: 2,
            ..
        }
    ));
}

#[test]
fn test_unregistered_backend_rejected() {
    let mut plan = Plan::new();
    plan.add_job(
        0,
        [RequestDesc::new(
            OpDesc::all_reduce("custom", vec![4], DataType::F32, ReduceOp::Sum)
                .with_backend(BackendKind::Custom(9)),
            DeviceSet::grid(1, 1),
            0,
            0,
        )]
        .into_iter()
        .collect::<RequestSet>(),
    );
    let err = recording_executor(&plan, 0, &BoxingConfig::default())
        .err()
        .unwrap();
    assert!(matches!(
        err,
        BoxingError::UnknownBackend {
            kind: BackendKind::Custom(9)
        }
    ));
}

#[test]
fn test_invalid_descriptor_rejected() {
    let mut plan = Plan::new();
    plan.add_job(
        0,
        [RequestDesc::new(
            OpDesc::broadcast("bcast", vec![4], DataType::F32, 5),
            DeviceSet::grid(1, 2),
            0,
            0,
        )]
        .into_iter()
        .collect::<RequestSet>(),
    );
    let err = recording_executor(&plan, 0, &BoxingConfig::default())
        .err()
        .unwrap();
    assert!(matches!(err, BoxingError::InvalidOpDesc { .. }));
}

#[test]
fn test_zero_streams_rejected() {
    let config = BoxingConfig {
        num_streams: 0,
        ..BoxingConfig::default()
    };
    let err = recording_executor(&Plan::new(), 0, &config).err().unwrap();
    assert!(matches!(err, BoxingError::Config(_)));
}

#[test]
fn test_requests_without_local_ranks_are_ignored() {
    let mut plan = Plan::new();
    plan.add_job(0, [gather("here", 0, 0)].into_iter().collect::<RequestSet>());
    let mut backends = BackendRegistry::new();
    backends.register(RecordingBackend::new(BackendKind::Nccl, &no_fusion()));
    let exec = Executor::new(&plan, MachineContext::new(4), &no_fusion(), backends).unwrap();
    assert_eq!(exec.schedule().num_groups(), 0);
    assert!(exec.schedule().job_groups(0).is_empty());
}
