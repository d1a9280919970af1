use super::helpers::{no_fusion, recording_executor, submit, submit_all};
use boxing::{DataType, DeviceSet, OpDesc, Plan, RequestDesc, RequestSet, ReduceOp};
use std::sync::Arc;

fn four_ranks_two_machines() -> Plan {
    let devices = DeviceSet::grid(2, 2);
    let mut plan = Plan::new();
    plan.add_job(
        0,
        [
            RequestDesc::new(
                OpDesc::all_reduce("grad", vec![1024], DataType::F32, ReduceOp::Sum),
                devices.clone(),
                0,
                0,
            ),
            RequestDesc::new(
                OpDesc::all_gather("weights", vec![1024], DataType::F32),
                devices,
                1,
                0,
            ),
        ]
        .into_iter()
        .collect::<RequestSet>(),
    );
    plan
}

#[test]
fn test_two_machines_without_fusion_run_two_groups() {
    let plan = four_ranks_two_machines();
    for (machine, ranks) in [(0u32, [0u32, 1]), (1, [2, 3])] {
        let (exec, backend) = recording_executor(&plan, machine, &no_fusion()).unwrap();
        assert_eq!(exec.schedule().job_groups(0).len(), 2);

        // All-gather fully contributed first must still wait for the all-reduce.
        submit_all(&exec, &["weights"], &ranks).unwrap();
        assert!(backend.launches().is_empty());

        submit(&exec, "grad", ranks[0]).unwrap();
        assert!(backend.launches().is_empty());
        submit(&exec, "grad", ranks[1]).unwrap();

        let launches = backend.launches();
        assert_eq!(launches.len(), 2);
        assert_eq!(launches[0].names, vec!["grad"]);
        assert_eq!(launches[0].ranks, vec![ranks.to_vec()]);
        assert_eq!(launches[1].names, vec!["weights"]);
        assert_eq!(exec.active_job().unwrap(), None);
    }
}

#[test]
fn test_execution_follows_submission_order_not_arrival() {
    let devices = DeviceSet::grid(1, 2);
    let set: RequestSet = (0..5)
        .map(|i| {
            RequestDesc::new(
                OpDesc::broadcast(format!("b{i}"), vec![16], DataType::U8, 0),
                devices.clone(),
                // Orders deliberately out of insertion order.
                (4 - i) as i64,
                0,
            )
        })
        .collect();
    let mut plan = Plan::new();
    plan.add_job(0, set);
    let (exec, backend) = recording_executor(&plan, 0, &no_fusion()).unwrap();

    submit_all(&exec, &["b1", "b3", "b0", "b2", "b4"], &[0, 1]).unwrap();
    assert_eq!(
        backend.launched_names(),
        vec![
            vec!["b4".to_string()],
            vec!["b3".to_string()],
            vec!["b2".to_string()],
            vec!["b1".to_string()],
            vec!["b0".to_string()],
        ]
    );
}

#[test]
fn test_concurrent_submitters_preserve_plan_order() {
    let world = 8u32;
    let devices = DeviceSet::grid(1, world);
    let names: Vec<String> = (0..6).map(|i| format!("op{i}")).collect();
    let set: RequestSet = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            RequestDesc::new(
                OpDesc::all_reduce(name.clone(), vec![64], DataType::F32, ReduceOp::Sum),
                devices.clone(),
                i as i64,
                i as i64,
            )
        })
        .collect();
    let mut plan = Plan::new();
    plan.add_job(7, set);
    let (exec, backend) = recording_executor(&plan, 0, &no_fusion()).unwrap();
    let exec = Arc::new(exec);

    // One thread per rank, each walking the ops in reverse.
    std::thread::scope(|s| {
        for rank in 0..world {
            let exec = Arc::clone(&exec);
            let names = names.clone();
            s.spawn(move || {
                for name in names.iter().rev() {
                    submit(&exec, name, rank).unwrap();
                }
            });
        }
    });

    let launches = backend.launches();
    assert_eq!(launches.len(), names.len());
    for (launch, name) in launches.iter().zip(&names) {
        assert_eq!(&launch.names, &vec![name.clone()]);
        assert_eq!(launch.ranks[0], (0..world).collect::<Vec<_>>());
    }
    assert_eq!(exec.active_job().unwrap(), None);
}
