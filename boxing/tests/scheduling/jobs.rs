use super::helpers::{contribution, no_fusion, recording_executor, submit, submit_all};
use boxing::{BoxingError, DataType, DeviceSet, OpDesc, Plan, RankDesc, RequestDesc, RequestSet};
use std::sync::mpsc;

/// Job 0 has two groups ("a0", "a1"), job 1 has one ("b0").
fn two_jobs() -> Plan {
    let devices = DeviceSet::grid(1, 2);
    let job = |names: &[&str]| -> RequestSet {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| {
                RequestDesc::new(
                    OpDesc::all_gather(*n, vec![8], DataType::F32),
                    devices.clone(),
                    i as i64,
                    0,
                )
            })
            .collect()
    };
    let mut plan = Plan::new();
    plan.add_job(0, job(&["a0", "a1"]));
    plan.add_job(1, job(&["b0"]));
    plan
}

#[test]
fn test_interleaving_jobs_is_rejected() {
    let (exec, backend) = recording_executor(&two_jobs(), 0, &no_fusion()).unwrap();
    submit_all(&exec, &["a0"], &[0, 1]).unwrap();
    assert_eq!(backend.launches().len(), 1);
    assert_eq!(exec.active_job().unwrap(), Some(0));

    let err = submit(&exec, "b0", 0).unwrap_err();
    assert!(matches!(
        err,
        BoxingError::JobInterleaved {
            job: 1,
            active: 0,
            ..
        }
    ));

    // The rejection changed nothing: job 0 can still finish, then job 1 runs.
    submit_all(&exec, &["a1"], &[0, 1]).unwrap();
    assert_eq!(exec.active_job().unwrap(), None);
    submit_all(&exec, &["b0"], &[0, 1]).unwrap();
    assert_eq!(
        backend.launched_names(),
        vec![
            vec!["a0".to_string()],
            vec!["a1".to_string()],
            vec!["b0".to_string()],
        ]
    );
}

#[test]
fn test_drained_job_replays_identically() {
    let (exec, backend) = recording_executor(&two_jobs(), 0, &no_fusion()).unwrap();
    for _ in 0..3 {
        submit_all(&exec, &["a1", "a0"], &[1, 0]).unwrap();
        assert_eq!(exec.active_job().unwrap(), None);
    }
    let launches = backend.launches();
    assert_eq!(launches.len(), 6);
    for round in launches.chunks(2) {
        assert_eq!(round[0].names, vec!["a0"]);
        assert_eq!(round[1].names, vec!["a1"]);
        assert_eq!(round[0].ranks, vec![vec![0, 1]]);
    }
}

#[test]
fn test_duplicate_contribution_in_same_round_rejected() {
    let (exec, backend) = recording_executor(&two_jobs(), 0, &no_fusion()).unwrap();
    submit(&exec, "a0", 1).unwrap();
    assert!(matches!(
        submit(&exec, "a0", 1),
        Err(BoxingError::DuplicateContribution { rank: 1, .. })
    ));
    submit(&exec, "a0", 0).unwrap();
    assert_eq!(backend.launches().len(), 1);
    // A new round accepts the same rank again.
    submit(&exec, "a0", 1).unwrap();
}

#[test]
fn test_unknown_names_and_foreign_ranks_rejected() {
    let (exec, _backend) = recording_executor(&two_jobs(), 0, &no_fusion()).unwrap();
    assert!(matches!(
        submit(&exec, "missing", 0),
        Err(BoxingError::UnknownRequest { .. })
    ));
    assert!(matches!(
        submit(&exec, "a0", 2),
        Err(BoxingError::UnexpectedRank { rank: 2, .. })
    ));
    assert_eq!(exec.active_job().unwrap(), None);
}

#[test]
fn test_callbacks_receive_success_per_rank() {
    let (exec, _backend) = recording_executor(&two_jobs(), 0, &no_fusion()).unwrap();
    let (tx, rx) = mpsc::channel();
    for rank in [0, 1] {
        exec.enqueue(&RankDesc::new("a0", rank), contribution(&tx, "a0"))
            .unwrap();
    }
    drop(tx);
    let statuses: Vec<_> = rx.iter().collect();
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|(n, s)| n == "a0" && s.is_ok()));
}

#[test]
fn test_failed_last_group_releases_job_and_reports_callbacks() {
    let (exec, backend) = recording_executor(&two_jobs(), 0, &no_fusion()).unwrap();
    backend.fail_on("b0");
    submit_all(&exec, &["a0", "a1"], &[0, 1]).unwrap();

    let (tx, rx) = mpsc::channel();
    exec.enqueue(&RankDesc::new("b0", 0), contribution(&tx, "b0"))
        .unwrap();
    let err = exec
        .enqueue(&RankDesc::new("b0", 1), contribution(&tx, "b0"))
        .unwrap_err();
    assert!(matches!(err, BoxingError::Backend { .. }));
    drop(tx);

    // Both ranks hear about the failure, including the one whose own
    // submission succeeded.
    let statuses: Vec<_> = rx.iter().collect();
    assert_eq!(statuses.len(), 2);
    for (name, status) in &statuses {
        assert_eq!(name, "b0");
        assert!(matches!(
            status.as_ref().unwrap_err().as_ref(),
            BoxingError::GroupLaunchFailed { .. }
        ));
    }

    // The failed group was the job's last, so other jobs may start.
    assert_eq!(exec.active_job().unwrap(), None);
    submit_all(&exec, &["a0", "a1"], &[0, 1]).unwrap();
    assert_eq!(backend.launches().len(), 5);
}

#[test]
fn test_failed_middle_group_keeps_job_active() {
    let (exec, backend) = recording_executor(&two_jobs(), 0, &no_fusion()).unwrap();
    backend.fail_on("a0");
    submit(&exec, "a0", 0).unwrap();
    assert!(submit(&exec, "a0", 1).is_err());

    // Job 0 still owes "a1"; the failed group is not relaunched.
    assert_eq!(exec.active_job().unwrap(), Some(0));
    assert!(matches!(
        submit(&exec, "b0", 0),
        Err(BoxingError::JobInterleaved { .. })
    ));
    submit_all(&exec, &["a1"], &[0, 1]).unwrap();
    assert_eq!(exec.active_job().unwrap(), None);
    assert_eq!(
        backend.launched_names(),
        vec![vec!["a0".to_string()], vec!["a1".to_string()]]
    );
}
