mod test_harness;

use std::time::Duration;

use gpupool_control::cluster::{ClusterError, SimulatedCluster};
use gpupool_control::jobs::lifecycle::CAPACITY_LOST;
use gpupool_control::jobs::JobState;
use gpupool_control::ControlError;
use test_harness::{job, Harness, MAX_NODES};

fn slow_cluster() -> SimulatedCluster {
    SimulatedCluster::new("gpupool", "Standard_NC6s_v3")
        .with_provisioning_delay(Duration::from_secs(30))
}

#[tokio::test(start_paused = true)]
async fn test_idle_pool_stays_at_zero() {
    let h = Harness::new();
    for _ in 0..3 {
        let report = h.tick().await;
        assert_eq!(report.desired, 0);
        assert_eq!(report.actual, Some(0));
        assert!(report.resize_requested.is_none());
    }
    assert!(h.resize_requests().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_resize_is_not_reissued() {
    let h = Harness::with_cluster(slow_cluster());
    h.submit(job(300, 2)).await;

    let first = h.tick().await;
    assert_eq!(first.resize_requested, Some(2));

    tokio::time::advance(Duration::from_secs(10)).await;
    let second = h.tick().await;
    assert!(second.resize_requested.is_none());
    assert_eq!(second.actual, Some(0));

    assert_eq!(h.resize_requests().await, vec![2]);
}

#[tokio::test(start_paused = true)]
async fn test_jobs_wait_for_settled_pool() {
    let h = Harness::with_cluster(slow_cluster());
    let id = h.submit(job(300, 2)).await;

    h.tick().await;
    tokio::time::advance(Duration::from_secs(20)).await;
    h.tick().await;
    assert_eq!(h.state(&id).await, JobState::Provisioning);

    tokio::time::advance(Duration::from_secs(10)).await;
    let report = h.tick().await;
    assert_eq!(report.actual, Some(2));
    assert_eq!(report.signalled_jobs, vec![id.clone()]);
    assert_eq!(h.state(&id).await, JobState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_desired_covers_every_active_job() {
    let h = Harness::with_cluster(slow_cluster());
    let a = h.submit(job(300, 1)).await;
    let b = h.submit(job(300, 3)).await;
    let c = h.submit(job(300, 2)).await;

    let mut expected = [(a.clone(), 1), (b.clone(), 3), (c.clone(), 2)].to_vec();
    for step in 0..8 {
        let report = h.tick().await;
        let mut need = 0;
        for (id, nodes) in &expected {
            if h.state(id).await.needs_capacity() {
                need = need.max(*nodes);
            }
        }
        assert!(report.desired >= need, "step {}: {:?}", step, report);

        if step == 4 {
            h.plane.lifecycle.cancel(&b).await.unwrap();
            expected.retain(|(id, _)| id != &b);
        }
        tokio::time::advance(Duration::from_secs(10)).await;
    }

    let report = h.tick().await;
    assert_eq!(report.job_desired, 2);
}

#[tokio::test(start_paused = true)]
async fn test_scales_to_zero_after_last_job_and_then_rests() {
    let h = Harness::new();
    let id = h.submit(job(300, 2)).await;
    h.run_until_running(&id, 5).await;

    h.plane.lifecycle.cancel(&id).await.unwrap();
    let report = h.tick().await;
    assert_eq!(report.desired, 0);
    assert_eq!(report.resize_requested, Some(0));

    for _ in 0..3 {
        tokio::time::advance(Duration::from_secs(10)).await;
        let report = h.tick().await;
        assert_eq!(report.actual, Some(0));
        assert!(report.resize_requested.is_none());
    }
    assert_eq!(h.resize_requests().await, vec![2, 0]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_resize_backs_off() {
    let h = Harness::new();
    h.submit(job(300, 1)).await;
    h.cluster
        .fail_next_resize(ClusterError::Transient("429 too many requests".into()))
        .await;

    let report = h.tick().await;
    assert!(report.error.is_some());
    assert!(report.resize_requested.is_none());

    // Inside the backoff window
    let report = h.tick().await;
    assert!(report.resize_requested.is_none());
    assert_eq!(h.resize_requests().await.len(), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    let report = h.tick().await;
    assert_eq!(report.resize_requested, Some(1));
    assert_eq!(h.resize_requests().await, vec![1, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_scale_down_is_not_held_by_failed_scale_up() {
    let h = Harness::new();
    let small = h.submit(job(300, 1)).await;
    h.run_until_running(&small, 5).await;

    let large = h.submit(job(300, 3)).await;
    h.cluster
        .fail_next_resize(ClusterError::Permanent("quota exhausted".into()))
        .await;
    let report = h.tick().await;
    assert!(report.error.is_some());
    assert!(report.resize_requested.is_none());

    h.plane.lifecycle.cancel(&large).await.unwrap();
    h.plane.lifecycle.cancel(&small).await.unwrap();
    let report = h.tick().await;
    assert_eq!(report.desired, 0);
    assert_eq!(report.resize_requested, Some(0));
    assert_eq!(h.resize_requests().await, vec![1, 3, 0]);
}

#[tokio::test(start_paused = true)]
async fn test_same_target_stays_backed_off() {
    let h = Harness::new();
    h.submit(job(300, 2)).await;
    h.cluster
        .fail_next_resize(ClusterError::Permanent("quota exhausted".into()))
        .await;
    h.tick().await;

    tokio::time::advance(Duration::from_secs(10)).await;
    let report = h.tick().await;
    assert!(report.resize_requested.is_none());
    assert_eq!(h.resize_requests().await, vec![2]);
}

#[tokio::test(start_paused = true)]
async fn test_tick_does_not_wait_for_slow_dispatch() {
    let cluster = SimulatedCluster::new("gpupool", "Standard_NC6s_v3")
        .with_create_latency(Duration::from_secs(20));
    let h = Harness::with_cluster(cluster);
    let id = h.submit(job(300, 1)).await;
    h.tick().await;

    let report = tokio::time::timeout(Duration::from_secs(1), h.plane.reconciler.tick())
        .await
        .expect("tick waited on workload creation");
    assert_eq!(report.signalled_jobs, vec![id.clone()]);
    assert_eq!(h.state(&id).await, JobState::Provisioning);

    // A second tick while the dispatch is pending starts nothing new
    h.plane.reconciler.tick().await;
    h.plane.reconciler.wait_for_dispatches().await;
    assert_eq!(h.state(&id).await, JobState::Running);
    assert_eq!(h.cluster.live_workloads().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_resize_leaves_jobs_waiting() {
    let cluster = SimulatedCluster::new("gpupool", "Standard_NC6s_v3").with_quota(1);
    let h = Harness::with_cluster(cluster);
    let id = h.submit(job(300, 2)).await;

    let report = h.tick().await;
    assert!(report.error.unwrap().contains("quota"));
    let report = h.tick().await;
    assert!(report.resize_requested.is_none());

    assert_eq!(h.resize_requests().await, vec![2]);
    assert_eq!(h.state(&id).await, JobState::Provisioning);
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_pool_is_reported_not_fatal() {
    let h = Harness::new();
    h.submit(job(300, 1)).await;
    h.cluster
        .fail_next_get_nodepool(ClusterError::Transient("timeout".into()))
        .await;

    let report = h.tick().await;
    assert_eq!(report.actual, None);
    assert!(report.error.is_some());
    assert!(h.resize_requests().await.is_empty());
    assert!(!h.plane.reconciler.is_healthy().await);

    let report = h.tick().await;
    assert_eq!(report.resize_requested, Some(1));
    assert!(h.plane.reconciler.is_healthy().await);
}

#[tokio::test(start_paused = true)]
async fn test_health_goes_stale() {
    let h = Harness::new();
    h.tick().await;
    assert!(h.plane.reconciler.is_healthy().await);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(!h.plane.reconciler.is_healthy().await);
}

#[tokio::test(start_paused = true)]
async fn test_external_shrink_fails_running_job() {
    let h = Harness::new();
    let id = h.submit(job(300, 2)).await;
    h.run_until_running(&id, 5).await;
    let handle = h.record(&id).await.workload.unwrap();

    h.cluster.shrink_externally(1).await;
    let report = h.tick().await;

    assert_eq!(report.lost_jobs, vec![id.clone()]);
    assert_eq!(report.desired, 0);
    let record = h.record(&id).await;
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.error.as_deref(), Some(CAPACITY_LOST));
    assert!(h.cluster.deleted_workloads().await.contains(&handle));
}

#[tokio::test(start_paused = true)]
async fn test_manual_scale_holds_until_grace_expires() {
    let h = Harness::new();
    h.plane.reconciler.request_scale(3).await.unwrap();
    assert_eq!(h.plane.reconciler.desired_count().await, 3);

    assert_eq!(h.tick().await.resize_requested, Some(3));
    tokio::time::advance(Duration::from_secs(10)).await;
    assert_eq!(h.tick().await.actual, Some(3));

    tokio::time::advance(Duration::from_secs(15 * 60)).await;
    let report = h.tick().await;
    assert_eq!(report.desired, 0);
    assert_eq!(report.resize_requested, Some(0));
    assert!(h.plane.reconciler.manual_override().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_manual_scale_to_zero_clears_override() {
    let h = Harness::new();
    h.plane.reconciler.request_scale(2).await.unwrap();
    h.plane.reconciler.request_scale(0).await.unwrap();

    assert!(h.plane.reconciler.manual_override().await.is_none());
    assert_eq!(h.tick().await.desired, 0);
}

#[tokio::test]
async fn test_manual_scale_bounds() {
    let h = Harness::new();
    let err = h
        .plane
        .reconciler
        .request_scale(MAX_NODES + 1)
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidConfig(_)));

    h.submit(job(300, 2)).await;
    let err = h.plane.reconciler.request_scale(1).await.unwrap_err();
    assert!(matches!(err, ControlError::Conflict(_)));
    assert!(h.plane.reconciler.request_scale(2).await.is_ok());
}
