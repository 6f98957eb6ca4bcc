//! Store scenarios shared by the in-memory and PostgreSQL test suites.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use errors::StorageError;
use nb_core::{
    AccessGrant, AccessStore, AuditAction, AuditEvent, AuditOutcome, AuditStore, AuthorId, Claim,
    ClaimsStatus, Classification, Clearance, EntryId, EntryStore, FailOutcome, JobStatus,
    JobStore, JobType, ManualClock, MirrorStore, MirroredClaim, NewEntry, NewJob, Notebook,
    NotebookId, NotebookStore, Subscription, SubscriptionFilter, SubscriptionId,
};

pub fn author(id: &str) -> AuthorId {
    AuthorId::new(id).unwrap()
}

pub async fn notebook<S: NotebookStore>(store: &S, owner: &str) -> Notebook {
    store
        .create_notebook(Notebook::new("scratch", author(owner), Utc::now()))
        .await
        .unwrap()
}

pub fn job(notebook_id: NotebookId, timeout_seconds: i32, max_retries: i32) -> NewJob {
    NewJob {
        notebook_id,
        entry_id: EntryId::new(),
        job_type: JobType::ExtractClaims,
        payload: serde_json::json!({}),
        priority: 0,
        timeout_seconds,
        max_retries,
    }
}

fn mirror(
    subscription_id: SubscriptionId,
    source_notebook_id: NotebookId,
    entry_id: EntryId,
    sequence: i64,
    text: &str,
) -> MirroredClaim {
    MirroredClaim {
        subscription_id,
        source_entry_id: entry_id,
        source_notebook_id,
        claims: vec![Claim::new(text, 0.9)],
        topic: None,
        embedding: None,
        source_sequence: sequence,
        tombstoned: false,
        mirrored_at: Utc::now(),
    }
}

pub async fn sequences_are_contiguous<S: NotebookStore + 'static>(store: Arc<S>) {
    let nb = notebook(store.as_ref(), "alice").await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .append_entry(NewEntry::new(nb.id, author("alice"), format!("entry {i}")))
                .await
                .unwrap()
                .sequence
        }));
    }

    let mut sequences = Vec::new();
    for handle in handles {
        sequences.push(handle.await.unwrap());
    }
    sequences.sort_unstable();
    assert_eq!(sequences, (1..=20).collect::<Vec<i64>>());

    let stored = store.get_notebook(nb.id).await.unwrap().unwrap();
    assert_eq!(stored.current_sequence, 20);
}

pub async fn each_job_claimed_once<S: NotebookStore + 'static>(store: Arc<S>) {
    let nb = NotebookId::new();
    for _ in 0..10 {
        store.insert_job(job(nb, 300, 3)).await.unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let worker = format!("worker-{w}");
            let mut claimed = Vec::new();
            while let Some(job) = store
                .claim_next(&worker, &[JobType::ExtractClaims])
                .await
                .unwrap()
            {
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), 10);
    assert_eq!(unique.len(), 10);
}

pub async fn expired_claim_is_taken_over<S: NotebookStore>(store: &S, clock: &ManualClock) {
    let inserted = store
        .insert_job(job(NotebookId::new(), 5, 3))
        .await
        .unwrap();
    let types = [JobType::ExtractClaims];

    let first = store.claim_next("crashed", &types).await.unwrap().unwrap();
    assert_eq!(first.id, inserted.id);

    clock.advance(Duration::seconds(4));
    assert!(store.claim_next("rescuer", &types).await.unwrap().is_none());

    clock.advance(Duration::seconds(1));
    let second = store.claim_next("rescuer", &types).await.unwrap().unwrap();
    assert_eq!(second.id, inserted.id);
    assert_eq!(second.claimed_by.as_deref(), Some("rescuer"));
    assert_eq!(second.retry_count, 1);

    let stale = store
        .complete_job(inserted.id, "crashed", serde_json::json!({}))
        .await;
    assert!(matches!(stale, Err(StorageError::StaleClaim { .. })));

    let done = store
        .complete_job(inserted.id, "rescuer", serde_json::json!({"ok": true}))
        .await
        .unwrap();
    assert_eq!(done.status, JobStatus::Completed);
}

pub async fn retries_are_bounded<S: NotebookStore>(store: &S) {
    let inserted = store
        .insert_job(job(NotebookId::new(), 300, 3))
        .await
        .unwrap();
    let types = [JobType::ExtractClaims];

    let mut attempts = 0;
    while let Some(claimed) = store.claim_next("w", &types).await.unwrap() {
        attempts += 1;
        let outcome = store.fail_job(claimed.id, "w", "boom").await.unwrap();
        assert!(outcome.job().retry_count <= outcome.job().max_retries);
        if let FailOutcome::Exhausted(job) = outcome {
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.error.as_deref(), Some("boom"));
        }
    }

    assert_eq!(attempts, 4);
    let job = store.get_job(inserted.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 3);
}

pub async fn reclaim_is_idempotent<S: NotebookStore>(store: &S, clock: &ManualClock) {
    let nb = NotebookId::new();
    let keep = store.insert_job(job(nb, 5, 2)).await.unwrap();
    let spent = store.insert_job(job(nb, 5, 0)).await.unwrap();
    let types = [JobType::ExtractClaims];
    store.claim_next("w1", &types).await.unwrap().unwrap();
    store.claim_next("w2", &types).await.unwrap().unwrap();

    clock.advance(Duration::seconds(6));
    let report = store.reclaim_expired().await.unwrap();
    assert_eq!(report.requeued, vec![keep.id]);
    assert_eq!(report.exhausted.len(), 1);
    assert_eq!(report.exhausted[0].id, spent.id);

    let again = store.reclaim_expired().await.unwrap();
    assert_eq!(again.count(), 0);

    let requeued = store.get_job(keep.id).await.unwrap().unwrap();
    assert_eq!(requeued.status, JobStatus::Pending);
    assert_eq!(requeued.retry_count, 1);
    assert_eq!(requeued.claimed_by, None);
}

pub async fn stale_version_is_rejected<S: NotebookStore>(store: &S) {
    let nb = notebook(store, "alice").await;
    let entry = store
        .append_entry(NewEntry::new(nb.id, author("alice"), "the sky is blue"))
        .await
        .unwrap();

    let updated = store
        .update_claims(
            entry.id,
            vec![Claim::new("the sky is blue", 0.9)],
            ClaimsStatus::Distilled,
            entry.version,
        )
        .await
        .unwrap();
    assert_eq!(updated.version, entry.version + 1);
    assert_eq!(updated.claims_status, ClaimsStatus::Distilled);

    let stale = store
        .update_embedding(entry.id, vec![0.1, 0.2], entry.version)
        .await;
    assert!(matches!(stale, Err(StorageError::VersionConflict { .. })));

    let missing = store.update_embedding(EntryId::new(), vec![0.1], 0).await;
    assert!(matches!(missing, Err(StorageError::NotFound { .. })));
}

async fn subscription<S: NotebookStore>(store: &S) -> (Notebook, Subscription) {
    let source = notebook(store, "alice").await;
    let target = notebook(store, "bob").await;
    let sub = store
        .create_subscription(Subscription {
            id: SubscriptionId::new(),
            source_notebook_id: source.id,
            target_notebook_id: target.id,
            filter: SubscriptionFilter::default(),
            watermark: 0,
            created_by: author("alice"),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    (source, sub)
}

pub async fn tombstones_are_permanent<S: NotebookStore>(store: &S) {
    let (source, sub) = subscription(store).await;
    let entry_id = EntryId::new();

    let applied = store
        .apply_mirrors(
            sub.id,
            vec![mirror(sub.id, source.id, entry_id, 1, "v1")],
            0,
            1,
        )
        .await
        .unwrap();
    assert!(applied);

    assert_eq!(store.tombstone_source_entry(entry_id).await.unwrap(), 1);
    assert_eq!(store.tombstone_source_entry(entry_id).await.unwrap(), 0);
    assert!(store.is_retracted(entry_id).await.unwrap());

    let reapplied = store
        .apply_mirrors(
            sub.id,
            vec![mirror(sub.id, source.id, entry_id, 1, "v2")],
            1,
            1,
        )
        .await
        .unwrap();
    assert!(reapplied);

    let visible = store
        .list_mirrors(sub.target_notebook_id, false)
        .await
        .unwrap();
    assert!(visible.is_empty());
    let all = store
        .list_mirrors(sub.target_notebook_id, true)
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].tombstoned);
    assert_eq!(all[0].claims[0].text, "v1");
}

pub async fn retracted_entry_mirrors_tombstoned<S: NotebookStore>(store: &S) {
    let (source, sub) = subscription(store).await;
    let entry_id = EntryId::new();
    store.tombstone_source_entry(entry_id).await.unwrap();

    store
        .apply_mirrors(
            sub.id,
            vec![mirror(sub.id, source.id, entry_id, 1, "late")],
            0,
            1,
        )
        .await
        .unwrap();

    let all = store
        .list_mirrors(sub.target_notebook_id, true)
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].tombstoned);
}

pub async fn watermark_is_compare_and_set<S: NotebookStore>(store: &S) {
    let (source, sub) = subscription(store).await;

    let stale = store
        .apply_mirrors(
            sub.id,
            vec![mirror(sub.id, source.id, EntryId::new(), 1, "x")],
            3,
            4,
        )
        .await
        .unwrap();
    assert!(!stale);

    let current = store.get_subscription(sub.id).await.unwrap().unwrap();
    assert_eq!(current.watermark, 0);
    assert!(
        store
            .list_mirrors(sub.target_notebook_id, true)
            .await
            .unwrap()
            .is_empty()
    );
}

pub async fn access_records_round_trip<S: NotebookStore>(store: &S) {
    let nb = notebook(store, "alice").await;
    let grant = AccessGrant {
        notebook_id: nb.id,
        author_id: author("bob"),
        read: true,
        write: true,
        admin: false,
        granted_by: author("alice"),
        granted_at: Utc::now(),
    };
    store.put_grant(grant.clone()).await.unwrap();
    store
        .put_grant(AccessGrant {
            admin: true,
            ..grant.clone()
        })
        .await
        .unwrap();

    let stored = store.get_grant(nb.id, &author("bob")).await.unwrap().unwrap();
    assert!(stored.admin);
    assert!(store.delete_grant(nb.id, &author("bob")).await.unwrap());
    assert!(!store.delete_grant(nb.id, &author("bob")).await.unwrap());

    let clearance = Clearance {
        author_id: author("carol"),
        level: Classification::Secret,
        compartments: ["orion".to_string()].into_iter().collect(),
    };
    store.put_clearance(clearance.clone()).await.unwrap();
    assert_eq!(
        store.get_clearance(&author("carol")).await.unwrap(),
        Some(clearance)
    );
}

pub async fn audit_lists_most_recent_first<S: NotebookStore>(store: &S) {
    let nb = notebook(store, "alice").await;
    let start = Utc::now();
    let events: Vec<AuditEvent> = (0..5)
        .map(|i| {
            AuditEvent::new(
                author("alice"),
                AuditAction::WriteEntry,
                AuditOutcome::Allowed,
                start + Duration::seconds(i),
            )
            .on_notebook(nb.id)
            .with_target(i)
        })
        .collect();
    store.append_audit(&events).await.unwrap();

    let recent = store.list_audit(Some(nb.id), 2).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].target.as_deref(), Some("4"));
    assert_eq!(recent[1].target.as_deref(), Some("3"));
}

pub async fn entry_batch_is_all_or_nothing<S: NotebookStore>(store: &S) {
    let nb = notebook(store, "alice").await;
    let with_job = |entry: NewEntry| {
        let planned = NewJob {
            entry_id: entry.id,
            ..job(entry.notebook_id, 300, 3)
        };
        (entry, vec![planned])
    };

    let kept = NewEntry::new(nb.id, author("alice"), "first half");
    let orphan = NewEntry::new(NotebookId::new(), author("alice"), "second half");
    let err = store
        .append_entries_with_jobs(vec![with_job(kept.clone()), with_job(orphan)])
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));
    assert!(store.entries_after(nb.id, 0, 10).await.unwrap().is_empty());
    assert!(store.jobs_for_entry(kept.id).await.unwrap().is_empty());

    let head = NewEntry::new(nb.id, author("alice"), "head");
    let tail = NewEntry::new(nb.id, author("alice"), "tail");
    let written = store
        .append_entries_with_jobs(vec![with_job(head.clone()), with_job(tail)])
        .await
        .unwrap();
    let sequences: Vec<i64> = written.iter().map(|(e, _)| e.sequence).collect();
    assert_eq!(sequences, vec![1, 2]);
    assert!(
        written
            .iter()
            .all(|(e, jobs)| jobs.len() == 1 && jobs[0].entry_id == e.id)
    );
    let jobs = store.jobs_for_entry(head.id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Pending);
}
