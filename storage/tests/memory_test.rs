//! Store behavior of the in-memory backend.

mod common;

use std::sync::Arc;

use nb_core::{EntryStore, ManualClock, NewEntry};
use proptest::prelude::*;
use storage::InMemoryBackend;

fn with_manual_clock() -> (InMemoryBackend, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    (InMemoryBackend::with_clock(clock.clone()), clock)
}

#[tokio::test]
async fn test_entry_batch_is_all_or_nothing() {
    common::entry_batch_is_all_or_nothing(&InMemoryBackend::new()).await;
}

#[tokio::test]
async fn test_sequences_are_contiguous() {
    common::sequences_are_contiguous(Arc::new(InMemoryBackend::new())).await;
}

#[tokio::test]
async fn test_each_job_claimed_once() {
    common::each_job_claimed_once(Arc::new(InMemoryBackend::new())).await;
}

#[tokio::test]
async fn test_expired_claim_is_taken_over() {
    let (store, clock) = with_manual_clock();
    common::expired_claim_is_taken_over(&store, &clock).await;
}

#[tokio::test]
async fn test_retries_are_bounded() {
    common::retries_are_bounded(&InMemoryBackend::new()).await;
}

#[tokio::test]
async fn test_reclaim_is_idempotent() {
    let (store, clock) = with_manual_clock();
    common::reclaim_is_idempotent(&store, &clock).await;
}

#[tokio::test]
async fn test_stale_version_is_rejected() {
    common::stale_version_is_rejected(&InMemoryBackend::new()).await;
}

#[tokio::test]
async fn test_tombstones_are_permanent() {
    common::tombstones_are_permanent(&InMemoryBackend::new()).await;
}

#[tokio::test]
async fn test_retracted_entry_mirrors_tombstoned() {
    common::retracted_entry_mirrors_tombstoned(&InMemoryBackend::new()).await;
}

#[tokio::test]
async fn test_watermark_is_compare_and_set() {
    common::watermark_is_compare_and_set(&InMemoryBackend::new()).await;
}

#[tokio::test]
async fn test_access_records_round_trip() {
    common::access_records_round_trip(&InMemoryBackend::new()).await;
}

#[tokio::test]
async fn test_audit_lists_most_recent_first() {
    common::audit_lists_most_recent_first(&InMemoryBackend::new()).await;
}

proptest! {
    #[test]
    fn prop_entries_after_returns_suffix(count in 1usize..40, after in 0i64..45, limit in 1usize..50) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let store = InMemoryBackend::new();
            let nb = common::notebook(&store, "alice").await;
            for i in 0..count {
                store
                    .append_entry(NewEntry::new(nb.id, common::author("alice"), format!("{i}")))
                    .await
                    .unwrap();
            }

            let page = store.entries_after(nb.id, after, limit).await.unwrap();
            let expected: Vec<i64> = ((after + 1)..=(count as i64)).take(limit).collect();
            let sequences: Vec<i64> = page.iter().map(|e| e.sequence).collect();
            prop_assert_eq!(sequences, expected);
            Ok(())
        })?;
    }
}
