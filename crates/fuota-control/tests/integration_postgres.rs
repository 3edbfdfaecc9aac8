//! Integration tests against a real PostgreSQL database.
//!
//! Run with `DATABASE_URL=postgres://... cargo test -- --ignored`.

#![allow(clippy::unwrap_used)]

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, TimeZone, Utc};
use sqlx::PgPool;

use common::fixtures::{eui, DeploymentBuilder};
use common::{Script, ScriptedAction};
use fuota_control::config::{DatabaseConfig, SchedulerConfig};
use fuota_control::{
    ClaimScheduler, DeploymentState, DeploymentStore, DeviceReport, DeviceState, Page,
    PostgresStore, RetryPolicy, StateMachine, StepAction, StepExecutor, StoreTransaction,
    TimingPolicy,
};

async fn connect() -> PostgresStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL not set");
    let config = DatabaseConfig {
        url,
        ..DatabaseConfig::default()
    };
    PostgresStore::new(&config).await.expect("failed to connect")
}

fn scheduler(store: Arc<dyn DeploymentStore>, action: Arc<ScriptedAction>) -> ClaimScheduler {
    ClaimScheduler::new(
        store,
        StepExecutor::new(action as Arc<dyn StepAction>, Duration::from_secs(1)),
        StateMachine::new(RetryPolicy::default(), TimingPolicy::default()),
        &SchedulerConfig {
            batch_size: 1_000,
            ..SchedulerConfig::default()
        },
    )
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn create_round_trips_every_field() {
    let store = connect().await;
    let deployment = DeploymentBuilder::new("round-trip")
        .with_unicast_timeout(Duration::new(1, 500_500))
        .with_devices(3)
        .create(&store)
        .await;

    let stored = store.get(&deployment.id).await.unwrap().unwrap();
    assert_eq!(stored, deployment);
    assert_eq!(stored.unicast_timeout, Duration::new(1, 500_500));

    let participants = store
        .list_devices(&deployment.id, Page::new(2))
        .await
        .unwrap();
    let names: Vec<_> = participants.iter().map(|p| p.device_name.as_str()).collect();
    assert_eq!(names, ["device-1", "device-2"]);
    assert_eq!(store.device_count(&deployment.id).await.unwrap(), 3);
    assert_eq!(store.pending_count(&deployment.id).await.unwrap(), 3);
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn concurrent_transactions_claim_disjoint_rows() {
    let store = connect().await;
    let mut latest = chrono::DateTime::<chrono::Utc>::MIN_UTC;
    for i in 0..6 {
        let d = DeploymentBuilder::new(&format!("claim-{i}"))
            .create(&store)
            .await;
        latest = latest.max(d.next_step_after);
    }

    let mut first = store.begin().await.unwrap();
    let mut second = store.begin().await.unwrap();

    let a: HashSet<_> = first
        .claim_due(1_000, latest)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.id)
        .collect();
    let b: HashSet<_> = second
        .claim_due(1_000, latest)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.id)
        .collect();

    assert!(!a.is_empty());
    assert!(a.is_disjoint(&b));

    first.rollback().await.unwrap();
    second.rollback().await.unwrap();
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn rollout_completes_on_postgres() {
    let store: Arc<dyn DeploymentStore> = Arc::new(connect().await);
    let action = Arc::new(ScriptedAction::new());
    action.script(
        DeploymentState::StatusRequested,
        [Script::CompleteWith(vec![DeviceReport::success(eui(1))])],
    );
    let scheduler = scheduler(Arc::clone(&store), Arc::clone(&action));
    let deployment = DeploymentBuilder::new("pg-rollout")
        .with_devices(1)
        .create(store.as_ref())
        .await;

    // Rows locked by concurrently running tests are skipped, so allow spare cycles.
    for _ in 0..50 {
        let current = store.get(&deployment.id).await.unwrap().unwrap();
        if current.state == DeploymentState::Done {
            break;
        }
        scheduler.run_once_at(current.next_step_after).await.unwrap();
    }

    let done = store.get(&deployment.id).await.unwrap().unwrap();
    assert_eq!(done.state, DeploymentState::Done);
    assert!(done.next_step_after >= deployment.next_step_after);

    let participants = store
        .list_devices(&deployment.id, Page::new(10))
        .await
        .unwrap();
    assert_eq!(participants[0].state, DeviceState::Success);
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn corrupt_row_does_not_block_its_siblings() {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL not set");
    let pool = PgPool::connect(&url).await.unwrap();
    let store: Arc<dyn DeploymentStore> =
        Arc::new(PostgresStore::from_pool(pool.clone()).await.unwrap());

    let healthy = DeploymentBuilder::new("healthy").create(store.as_ref()).await;
    let corrupt = DeploymentBuilder::new("corrupt").create(store.as_ref()).await;

    // Far in the past so only these two rows are due at `at`, corrupt first.
    let at = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
    sqlx::query("UPDATE fuota_deployment SET next_step_after = $2 WHERE id = $1")
        .bind(healthy.id.as_uuid())
        .bind(at)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        "UPDATE fuota_deployment SET descriptor = '\\x0102', next_step_after = $2 WHERE id = $1",
    )
    .bind(corrupt.id.as_uuid())
    .bind(at - TimeDelta::seconds(1))
    .execute(&pool)
    .await
    .unwrap();

    let action = Arc::new(ScriptedAction::new());
    let scheduler = scheduler(Arc::clone(&store), Arc::clone(&action));

    // Rows locked by concurrently running tests are skipped, so allow spare cycles.
    for _ in 0..10 {
        scheduler.run_once_at(at).await.unwrap();
        let current = store.get(&healthy.id).await.unwrap().unwrap();
        if current.state != DeploymentState::MulticastSetup {
            break;
        }
    }

    // Other tests' cycles may also pick the healthy row up, so only require progress.
    let advanced = store.get(&healthy.id).await.unwrap().unwrap();
    assert_ne!(advanced.state, DeploymentState::MulticastSetup);

    let quarantined: chrono::DateTime<Utc> =
        sqlx::query_scalar("SELECT next_step_after FROM fuota_deployment WHERE id = $1")
            .bind(corrupt.id.as_uuid())
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(quarantined > at);
    assert!(store.get(&corrupt.id).await.is_err());
}
