//! Integration tests for complete deployment rollouts.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::fixtures::{eui, store, DeploymentBuilder};
use common::{Script, ScriptedAction, TestWorker};
use fuota_control::state::ROLLOUT_ORDER;
use fuota_control::{
    DeploymentState, DeploymentStore, DeviceReport, DeviceState, MemoryStore, Page, RetryPolicy,
    StoreTransaction,
};
use rstest::rstest;

#[rstest]
#[tokio::test]
async fn rollout_walks_every_state_to_done(store: Arc<MemoryStore>) {
    let action = Arc::new(ScriptedAction::new());
    action.script(
        DeploymentState::StatusRequested,
        [Script::CompleteWith(vec![
            DeviceReport::success(eui(1)),
            DeviceReport::success(eui(2)),
        ])],
    );
    let worker = TestWorker::new(Arc::clone(&store), Arc::clone(&action));
    let deployment = DeploymentBuilder::new("rollout")
        .with_devices(2)
        .create(store.as_ref())
        .await;

    let history = worker.drive_to_done(&deployment.id, 20).await;

    let visited: Vec<_> = history.iter().map(|d| d.state).collect();
    assert_eq!(visited, ROLLOUT_ORDER);

    let requested: Vec<_> = action
        .requests_for(&deployment.id)
        .into_iter()
        .map(|r| r.state)
        .collect();
    assert_eq!(requested, ROLLOUT_ORDER[..7]);

    for pair in history.windows(2) {
        assert!(pair[1].next_step_after >= pair[0].next_step_after);
        assert_eq!(pair[1].retry_count, 0);
    }

    let participants = store
        .list_devices(&deployment.id, Page::new(10))
        .await
        .unwrap();
    assert_eq!(participants.len(), 2);
    assert!(participants.iter().all(|p| p.state == DeviceState::Success));
}

#[rstest]
#[tokio::test]
async fn step_delays_follow_timing_rules(store: Arc<MemoryStore>) {
    let action = Arc::new(ScriptedAction::new());
    let worker = TestWorker::new(Arc::clone(&store), action);
    let deployment = DeploymentBuilder::new("timing").create(store.as_ref()).await;

    let history = worker.drive_to_done(&deployment.id, 20).await;
    let gap = |i: usize| history[i + 1].next_step_after - history[i].next_step_after;

    // Unicast timeout is 60s, redundancy 20 and the multicast timeout exponent 3.
    assert_eq!(gap(0), chrono::TimeDelta::seconds(60));
    assert_eq!(gap(3), chrono::TimeDelta::seconds(60 * 20));
    assert_eq!(gap(4), chrono::TimeDelta::seconds(8 + 10));
    assert_eq!(gap(6), chrono::TimeDelta::zero());
}

#[rstest]
#[tokio::test]
async fn status_request_waits_for_every_device(store: Arc<MemoryStore>) {
    let action = Arc::new(ScriptedAction::new());
    action.script(
        DeploymentState::StatusRequested,
        [
            Script::CompleteWith(vec![DeviceReport::success(eui(1))]),
            Script::CompleteWith(vec![DeviceReport::error(eui(2), "bad mic")]),
        ],
    );
    let worker = TestWorker::new(Arc::clone(&store), Arc::clone(&action));
    let deployment = DeploymentBuilder::new("status")
        .with_devices(2)
        .create(store.as_ref())
        .await;

    while worker.get(&deployment.id).await.state != DeploymentState::StatusRequested {
        worker.step(&deployment.id).await;
    }

    let summary = worker.step(&deployment.id).await;
    assert_eq!(summary.retried, 1);
    assert_eq!(summary.device_outcomes, 1);
    let after_first = worker.get(&deployment.id).await;
    assert_eq!(after_first.state, DeploymentState::StatusRequested);
    assert_eq!(after_first.retry_count, 1);
    assert_eq!(store.pending_count(&deployment.id).await.unwrap(), 1);

    let summary = worker.step(&deployment.id).await;
    assert_eq!(summary.finished, 1);
    assert_eq!(worker.get(&deployment.id).await.state, DeploymentState::Done);

    let last = action.requests_for(&deployment.id).pop().unwrap();
    assert_eq!(last.pending_devices, vec![eui(2)]);

    let participants = store
        .list_devices(&deployment.id, Page::new(10))
        .await
        .unwrap();
    assert_eq!(participants[0].state, DeviceState::Success);
    assert_eq!(participants[1].state, DeviceState::Error);
    assert_eq!(participants[1].error_message, "bad mic");
}

#[rstest]
#[tokio::test]
async fn retry_ceiling_forces_done(store: Arc<MemoryStore>) {
    let action = Arc::new(ScriptedAction::new());
    action.script(
        DeploymentState::Enqueue,
        [Script::Fail("network server unavailable".to_owned())],
    );
    let retry = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_secs(5),
        max_delay: Duration::from_secs(60),
    };
    let worker = TestWorker::with_retry(Arc::clone(&store), Arc::clone(&action), retry);
    let deployment = DeploymentBuilder::new("flaky")
        .with_devices(3)
        .create(store.as_ref())
        .await;

    let history = worker.drive_to_done(&deployment.id, 20).await;

    let enqueue_attempts = action
        .requests_for(&deployment.id)
        .iter()
        .filter(|r| r.state == DeploymentState::Enqueue)
        .count();
    assert_eq!(enqueue_attempts, 3);

    let retries: Vec<_> = history
        .iter()
        .filter(|d| d.state == DeploymentState::Enqueue)
        .map(|d| d.retry_count)
        .collect();
    assert_eq!(retries, [0, 1, 2]);

    let participants = store
        .list_devices(&deployment.id, Page::new(10))
        .await
        .unwrap();
    assert_eq!(participants.len(), 3);
    for participant in participants {
        assert_eq!(participant.state, DeviceState::Error);
        assert!(
            participant.error_message.contains("gave up after 3 attempt(s)"),
            "unexpected message: {}",
            participant.error_message
        );
    }
}

#[rstest]
#[tokio::test]
async fn backoff_grows_between_retries(store: Arc<MemoryStore>) {
    let action = Arc::new(ScriptedAction::new());
    action.script(DeploymentState::MulticastSetup, [Script::Pending]);
    let retry = RetryPolicy {
        max_attempts: 10,
        base_delay: Duration::from_secs(5),
        max_delay: Duration::from_secs(15),
    };
    let worker = TestWorker::with_retry(Arc::clone(&store), action, retry);
    let deployment = DeploymentBuilder::new("backoff").create(store.as_ref()).await;

    let mut times = vec![deployment.next_step_after];
    for _ in 0..4 {
        worker.step(&deployment.id).await;
        times.push(worker.get(&deployment.id).await.next_step_after);
    }

    let gaps: Vec<_> = times.windows(2).map(|w| (w[1] - w[0]).num_seconds()).collect();
    assert_eq!(gaps, [5, 10, 15, 15]);
}

#[rstest]
#[tokio::test]
async fn rejection_finishes_immediately(store: Arc<MemoryStore>) {
    let action = Arc::new(ScriptedAction::new());
    action.script(
        DeploymentState::FragmentationSessionSetup,
        [Script::Reject("fragment size too large".to_owned())],
    );
    let worker = TestWorker::new(Arc::clone(&store), Arc::clone(&action));
    let deployment = DeploymentBuilder::new("rejected")
        .with_devices(1)
        .create(store.as_ref())
        .await;

    worker.step(&deployment.id).await;
    let summary = worker.step(&deployment.id).await;
    assert_eq!(summary.finished, 1);

    let done = worker.get(&deployment.id).await;
    assert_eq!(done.state, DeploymentState::Done);

    let participants = store
        .list_devices(&deployment.id, Page::new(10))
        .await
        .unwrap();
    assert_eq!(participants[0].state, DeviceState::Error);
    assert_eq!(
        participants[0].error_message,
        "FRAG_SESS_SETUP failed: fragment size too large"
    );

    // Done deployments are never claimed again.
    let summary = worker.scheduler.run_once_at(chrono::DateTime::<chrono::Utc>::MAX_UTC).await.unwrap();
    assert_eq!(summary.claimed, 0);
    assert_eq!(action.requests_for(&deployment.id).len(), 2);
}

#[rstest]
#[tokio::test]
async fn hung_collaborator_is_retried(store: Arc<MemoryStore>) {
    let action = Arc::new(ScriptedAction::new());
    action.script(DeploymentState::MulticastSetup, [Script::Hang, Script::Complete]);
    let worker = TestWorker::new(Arc::clone(&store), action);
    let deployment = DeploymentBuilder::new("hung").create(store.as_ref()).await;

    let summary = worker.step(&deployment.id).await;
    assert_eq!(summary.retried, 1);
    assert_eq!(worker.get(&deployment.id).await.retry_count, 1);

    let summary = worker.step(&deployment.id).await;
    assert_eq!(summary.advanced, 1);
    let advanced = worker.get(&deployment.id).await;
    assert_eq!(advanced.state, DeploymentState::FragmentationSessionSetup);
    assert_eq!(advanced.retry_count, 0);
}

#[rstest]
#[tokio::test]
async fn reference_scenario(store: Arc<MemoryStore>) {
    let device = fuota_control::DevEui::new([1, 2, 3, 4, 5, 6, 7, 8]);
    let first = DeploymentBuilder::new("first")
        .with_device(device, "test-device")
        .create(store.as_ref())
        .await;
    let second = DeploymentBuilder::new("second").create(store.as_ref()).await;

    assert_eq!(first.state, DeploymentState::MulticastSetup);
    assert_eq!(first.fragmentation_matrix, 3);
    assert_eq!(first.descriptor, [1, 2, 3, 4]);
    assert_eq!(first.payload, [5, 6, 7, 8]);
    assert_eq!(first.frag_size, 10);
    assert_eq!(first.redundancy, 20);

    let participants = store.list_devices(&first.id, Page::new(10)).await.unwrap();
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0].dev_eui, device);
    assert_eq!(participants[0].state, DeviceState::Pending);

    let at = second.next_step_after;
    let mut tx = store.begin().await.unwrap();
    let mut due = tx.claim_due(10, at).await.unwrap();
    assert!(due.iter().any(|d| d.id == first.id));
    assert!(due.iter().any(|d| d.id == second.id));

    let claimed = due.iter_mut().find(|d| d.id == first.id).unwrap();
    claimed.state = DeploymentState::Done;
    tx.update(claimed).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let due = tx.claim_due(10, at).await.unwrap();
    assert!(due.iter().all(|d| d.id != first.id));
    assert!(due.iter().any(|d| d.id == second.id));
    tx.rollback().await.unwrap();
}
