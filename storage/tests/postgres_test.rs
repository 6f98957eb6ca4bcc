//! Store behavior of the PostgreSQL backend.
//!
//! Each test runs against its own database on the shared testcontainers
//! instance and is skipped when Docker is not available.

mod common;

use std::sync::Arc;

use nb_core::ManualClock;
use storage::PostgresBackend;

async fn backend(name: &str) -> Option<(PostgresBackend, Arc<ManualClock>)> {
    let Some(fixture) = testing::postgres().await else {
        eprintln!("Skipping PostgreSQL test: Docker not available");
        return None;
    };
    let url = fixture.fresh_database(name).await.unwrap();
    let clock = Arc::new(ManualClock::default());
    let backend = PostgresBackend::connect(&url, 10)
        .await
        .unwrap()
        .with_clock(clock.clone());
    backend.migrate().await.unwrap();
    Some((backend, clock))
}

#[tokio::test]
async fn test_migrations_apply_once() {
    let Some((backend, _)) = backend("migrate").await else {
        return;
    };
    let again = backend.migrate().await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn test_sequences_are_contiguous() {
    let Some((backend, _)) = backend("sequences").await else {
        return;
    };
    common::sequences_are_contiguous(Arc::new(backend)).await;
}

#[tokio::test]
async fn test_each_job_claimed_once() {
    let Some((backend, _)) = backend("claim_once").await else {
        return;
    };
    common::each_job_claimed_once(Arc::new(backend)).await;
}

#[tokio::test]
async fn test_expired_claim_is_taken_over() {
    let Some((backend, clock)) = backend("takeover").await else {
        return;
    };
    common::expired_claim_is_taken_over(&backend, &clock).await;
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let Some((backend, _)) = backend("retries").await else {
        return;
    };
    common::retries_are_bounded(&backend).await;
}

#[tokio::test]
async fn test_reclaim_is_idempotent() {
    let Some((backend, clock)) = backend("reclaim").await else {
        return;
    };
    common::reclaim_is_idempotent(&backend, &clock).await;
}

#[tokio::test]
async fn test_stale_version_is_rejected() {
    let Some((backend, _)) = backend("versions").await else {
        return;
    };
    common::stale_version_is_rejected(&backend).await;
}

#[tokio::test]
async fn test_tombstones_are_permanent() {
    let Some((backend, _)) = backend("tombstones").await else {
        return;
    };
    common::tombstones_are_permanent(&backend).await;
}

#[tokio::test]
async fn test_retracted_entry_mirrors_tombstoned() {
    let Some((backend, _)) = backend("retracted").await else {
        return;
    };
    common::retracted_entry_mirrors_tombstoned(&backend).await;
}

#[tokio::test]
async fn test_watermark_is_compare_and_set() {
    let Some((backend, _)) = backend("watermark").await else {
        return;
    };
    common::watermark_is_compare_and_set(&backend).await;
}

#[tokio::test]
async fn test_access_records_round_trip() {
    let Some((backend, _)) = backend("access").await else {
        return;
    };
    common::access_records_round_trip(&backend).await;
}

#[tokio::test]
async fn test_audit_lists_most_recent_first() {
    let Some((backend, _)) = backend("audit").await else {
        return;
    };
    common::audit_lists_most_recent_first(&backend).await;
}

#[tokio::test]
async fn test_entry_batch_is_all_or_nothing() {
    let Some((backend, _)) = backend("entry_batch").await else {
        return;
    };
    common::entry_batch_is_all_or_nothing(&backend).await;
}
