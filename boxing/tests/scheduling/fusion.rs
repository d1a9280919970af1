use super::helpers::{recording_executor, submit, submit_all};
use boxing::{BoxingConfig, DataType, DeviceSet, OpDesc, Plan, RequestDesc, RequestSet, ReduceOp};

fn plan_of(requests: Vec<RequestDesc>) -> Plan {
    let mut plan = Plan::new();
    plan.add_job(0, requests.into_iter().collect::<RequestSet>());
    plan
}

#[test]
fn test_compatible_all_reduces_fuse_into_one_group() {
    let devices = DeviceSet::grid(2, 2);
    let plan = plan_of(vec![
        RequestDesc::new(
            OpDesc::all_reduce("g0", vec![256], DataType::F32, ReduceOp::Sum),
            devices.clone(),
            0,
            0,
        ),
        RequestDesc::new(
            OpDesc::all_reduce("g1", vec![512], DataType::F32, ReduceOp::Sum),
            devices,
            1,
            0,
        ),
    ]);
    let (exec, backend) = recording_executor(&plan, 1, &BoxingConfig::default()).unwrap();
    assert_eq!(exec.schedule().num_groups(), 1);

    submit_all(&exec, &["g0"], &[2, 3]).unwrap();
    assert!(backend.launches().is_empty());
    submit(&exec, "g1", 3).unwrap();
    assert!(backend.launches().is_empty());
    submit(&exec, "g1", 2).unwrap();

    let launches = backend.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].names, vec!["g0", "g1"]);
    assert_eq!(launches[0].ranks, vec![vec![2, 3], vec![2, 3]]);
}

#[test]
fn test_dependency_depth_bounds_fusion() {
    let devices = DeviceSet::grid(1, 2);
    let plan = plan_of(vec![
        RequestDesc::new(
            OpDesc::all_reduce("d0", vec![8], DataType::F32, ReduceOp::Sum),
            devices.clone(),
            0,
            0,
        ),
        RequestDesc::new(
            OpDesc::all_reduce("d1", vec![8], DataType::F32, ReduceOp::Sum),
            devices,
            1,
            1,
        ),
    ]);
    let (exec, _backend) = recording_executor(&plan, 0, &BoxingConfig::default()).unwrap();
    assert_eq!(exec.schedule().num_groups(), 2);
}

#[test]
fn test_threshold_splits_fused_groups() {
    let devices = DeviceSet::grid(1, 2);
    // Each request is 4 KiB; three fit under 12 KiB, the fourth starts a new group.
    let plan = plan_of(
        (0..4)
            .map(|i| {
                RequestDesc::new(
                    OpDesc::reduce_scatter(format!("rs{i}"), vec![1024], DataType::F32, ReduceOp::Max),
                    devices.clone(),
                    i,
                    0,
                )
            })
            .collect(),
    );
    let config = BoxingConfig {
        fusion_threshold_bytes: 12 * 1024,
        ..BoxingConfig::default()
    };
    let (exec, backend) = recording_executor(&plan, 0, &config).unwrap();
    assert_eq!(exec.schedule().num_groups(), 2);

    submit_all(&exec, &["rs3", "rs2", "rs1", "rs0"], &[0, 1]).unwrap();
    assert_eq!(
        backend.launched_names(),
        vec![
            vec!["rs0".to_string(), "rs1".to_string(), "rs2".to_string()],
            vec!["rs3".to_string()],
        ]
    );
}

#[test]
fn test_schedule_display_lists_groups() {
    let devices = DeviceSet::grid(1, 1);
    let plan = plan_of(vec![
        RequestDesc::new(
            OpDesc::all_gather("x", vec![4], DataType::F32),
            devices.clone(),
            0,
            0,
        ),
        RequestDesc::new(OpDesc::broadcast("y", vec![4], DataType::F32, 0), devices, 1, 0),
    ]);
    let config = BoxingConfig {
        enable_debug_mode: true,
        ..BoxingConfig::default()
    };
    let (exec, _backend) = recording_executor(&plan, 0, &config).unwrap();
    let dump = exec.schedule().to_string();
    assert!(dump.contains("group id: 0"));
    assert!(dump.contains("group id: 1"));
    assert!(dump.contains("x all_gather"));
}
