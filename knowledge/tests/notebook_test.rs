//! Access rules, fragmentation and auditing of the notebook service.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::{Harness, StubProcessor, author, drain};
use config::Config;
use errors::{ErrorStatus, NotebookError};
use knowledge::{CreateNotebook, Permissions, WriteEntry};
use nb_core::{
    AccessStore, AuditAction, AuditOutcome, AuditStore, ClaimsStatus, Classification, Clearance,
    GroupId, GroupRole, Tier,
};
use tokio_util::sync::CancellationToken;

fn secret(who: &str) -> Clearance {
    Clearance {
        author_id: author(who),
        level: Classification::Secret,
        compartments: BTreeSet::from(["orion".to_string()]),
    }
}

fn labelled(name: &str) -> CreateNotebook {
    CreateNotebook {
        classification: Some(Classification::Secret),
        compartments: BTreeSet::from(["orion".to_string()]),
        ..CreateNotebook::named(name)
    }
}

#[tokio::test]
async fn test_labelled_notebook_requires_clearance() {
    let h = Harness::new();
    let alice = author("alice");

    let err = h
        .service
        .create_notebook(&alice, labelled("ops"))
        .await
        .unwrap_err();
    assert!(err.is_denied());

    h.store.put_clearance(secret("alice")).await.unwrap();
    let nb = h
        .service
        .create_notebook(&alice, labelled("ops"))
        .await
        .unwrap();
    assert_eq!(
        h.service.effective_tier(&alice, nb.id).await.unwrap(),
        Tier::Owner
    );
}

#[tokio::test]
async fn test_ceiling_applies_before_grants() {
    let h = Harness::new();
    let (alice, bob) = (author("alice"), author("bob"));
    h.store.put_clearance(secret("alice")).await.unwrap();
    let nb = h
        .service
        .create_notebook(&alice, labelled("ops"))
        .await
        .unwrap();
    h.service
        .share(&alice, nb.id, &bob, Permissions::WRITE)
        .await
        .unwrap();

    let denied = h
        .service
        .write_entry(&bob, nb.id, WriteEntry::text("launch at dawn"))
        .await
        .unwrap_err();
    assert_eq!(denied.status(), ErrorStatus::Denied);
    assert!(h.service.get_notebook(&bob, nb.id).await.is_err());

    h.service.set_clearance(&alice, secret("bob")).await.unwrap();
    let receipt = h
        .service
        .write_entry(&bob, nb.id, WriteEntry::text("launch at dawn"))
        .await
        .unwrap();
    assert_eq!(receipt.sequence(), 1);

    // Losing the clearance caps the owner too.
    h.store
        .put_clearance(Clearance {
            compartments: BTreeSet::new(),
            ..secret("alice")
        })
        .await
        .unwrap();
    assert_eq!(
        h.service.effective_tier(&alice, nb.id).await.unwrap(),
        Tier::None
    );
}

#[tokio::test]
async fn test_clearance_cannot_exceed_assigner() {
    let h = Harness::new();
    let alice = author("alice");
    h.store
        .put_clearance(Clearance {
            author_id: alice.clone(),
            level: Classification::Confidential,
            compartments: BTreeSet::new(),
        })
        .await
        .unwrap();

    let err = h
        .service
        .set_clearance(&alice, secret("bob"))
        .await
        .unwrap_err();
    assert!(err.is_denied());
    assert!(h.store.get_clearance(&author("bob")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_admin_grants_need_owner() {
    let h = Harness::new();
    let (alice, bob, carol) = (author("alice"), author("bob"), author("carol"));
    let nb = h
        .service
        .create_notebook(&alice, CreateNotebook::named("team"))
        .await
        .unwrap();
    h.service
        .share(&alice, nb.id, &bob, Permissions::ADMIN)
        .await
        .unwrap();

    h.service
        .share(&bob, nb.id, &carol, Permissions::WRITE)
        .await
        .unwrap();
    let err = h
        .service
        .share(&bob, nb.id, &carol, Permissions::ADMIN)
        .await
        .unwrap_err();
    assert!(err.is_denied());
    assert_eq!(
        h.service.effective_tier(&carol, nb.id).await.unwrap(),
        Tier::Write
    );

    assert!(h.service.revoke(&bob, nb.id, &carol).await.unwrap());
    assert_eq!(
        h.service.effective_tier(&carol, nb.id).await.unwrap(),
        Tier::None
    );
}

#[tokio::test]
async fn test_group_roles_and_founding_member() {
    let h = Harness::new();
    let (alice, bob, carol) = (author("alice"), author("bob"), author("carol"));
    let group = GroupId::new("research").unwrap();

    // Only the founder of an empty group may enrol themselves.
    assert!(
        h.service
            .add_member(&bob, &group, &carol, GroupRole::Maintainer)
            .await
            .unwrap_err()
            .is_denied()
    );
    h.service
        .add_member(&alice, &group, &alice, GroupRole::Maintainer)
        .await
        .unwrap();
    h.service
        .add_member(&alice, &group, &bob, GroupRole::Contributor)
        .await
        .unwrap();
    assert!(
        h.service
            .add_member(&bob, &group, &carol, GroupRole::Member)
            .await
            .unwrap_err()
            .is_denied()
    );

    let nb = h
        .service
        .create_notebook(
            &carol,
            CreateNotebook {
                group_id: Some(group.clone()),
                ..CreateNotebook::named("shared")
            },
        )
        .await
        .unwrap();
    assert_eq!(
        h.service.effective_tier(&bob, nb.id).await.unwrap(),
        Tier::Write
    );
    assert_eq!(
        h.service.effective_tier(&alice, nb.id).await.unwrap(),
        Tier::Admin
    );
    assert_eq!(h.store.list_members(&group).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_large_content_is_fragmented() {
    let mut config = Config::default();
    config.entries.max_fragment_bytes = 16;
    let h = Harness::with_config(config);
    let alice = author("alice");
    let nb = h
        .service
        .create_notebook(&alice, CreateNotebook::named("long"))
        .await
        .unwrap();

    let content = "abcdefghijklmnopqrstuvwxyz0123456789ABCD";
    let mut request = WriteEntry::text(content).with_topic("alphabet");
    request.signature = "sig-1".to_string();
    let receipt = h
        .service
        .write_entry(&alice, nb.id, request)
        .await
        .unwrap();

    assert_eq!(receipt.entries.len(), 3);
    assert_eq!(receipt.jobs.len(), 6);
    let head = receipt.head();
    assert_eq!(head.fragment_of, None);
    assert_eq!(head.fragment_index, None);
    for (i, fragment) in receipt.entries.iter().enumerate() {
        assert_eq!(fragment.sequence, i as i64 + 1);
        assert_eq!(fragment.signature, "sig-1");
        assert_eq!(fragment.topic.as_deref(), Some("alphabet"));
        if i > 0 {
            assert_eq!(fragment.fragment_of, Some(head.id));
            assert_eq!(fragment.fragment_index, Some(i as i32));
        }
    }
    let joined: String = receipt.entries.iter().map(|e| e.content.as_str()).collect();
    assert_eq!(joined, content);
}

#[tokio::test]
async fn test_revision_inherits_topic_and_links_back() {
    let h = Harness::new();
    let alice = author("alice");
    let nb = h
        .service
        .create_notebook(&alice, CreateNotebook::named("drafts"))
        .await
        .unwrap();
    let original = h
        .service
        .write_entry(&alice, nb.id, WriteEntry::text("first draft").with_topic("essay"))
        .await
        .unwrap();

    let revised = h
        .service
        .revise_entry(&alice, original.head().id, WriteEntry::text("second draft"))
        .await
        .unwrap();
    let head = revised.head();
    assert_eq!(head.sequence, 2);
    assert_eq!(head.revision_of, Some(original.head().id));
    assert_eq!(head.topic.as_deref(), Some("essay"));
    assert_eq!(original.head().content, "first draft");
}

#[tokio::test]
async fn test_reader_cannot_write_or_verify() {
    let h = Harness::new();
    let (alice, bob) = (author("alice"), author("bob"));
    let nb = h
        .service
        .create_notebook(&alice, CreateNotebook::named("review"))
        .await
        .unwrap();
    h.service
        .share(&alice, nb.id, &bob, Permissions::READ)
        .await
        .unwrap();
    let receipt = h
        .service
        .write_entry(&alice, nb.id, WriteEntry::text("checked fact"))
        .await
        .unwrap();
    drain(&h.worker("w1", Arc::new(StubProcessor::new()))).await;

    assert_eq!(
        h.service
            .list_entries(&bob, nb.id, 0, 10)
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(
        h.service
            .write_entry(&bob, nb.id, WriteEntry::text("nope"))
            .await
            .unwrap_err()
            .is_denied()
    );
    let id = receipt.head().id;
    assert!(h.service.verify_claims(&bob, id).await.unwrap_err().is_denied());

    let verified = h.service.verify_claims(&alice, id).await.unwrap();
    assert_eq!(verified.claims_status, ClaimsStatus::Verified);
    assert!(matches!(
        h.service.verify_claims(&alice, id).await,
        Err(NotebookError::InvalidInput { .. })
    ));
}

#[tokio::test]
async fn test_privileged_actions_are_audited() {
    let mut h = Harness::new();
    let (alice, mallory) = (author("alice"), author("mallory"));
    let consumer = h.audit.take().unwrap();
    let cancel = CancellationToken::new();
    let writer = tokio::spawn(consumer.run(h.store.clone(), 16, cancel.clone()));

    let nb = h
        .service
        .create_notebook(&alice, CreateNotebook::named("audited"))
        .await
        .unwrap();
    h.clock.advance(chrono::Duration::seconds(1));
    h.service
        .write_entry(&alice, nb.id, WriteEntry::text("logged"))
        .await
        .unwrap();
    h.clock.advance(chrono::Duration::seconds(1));
    let _ = h
        .service
        .share(&mallory, nb.id, &mallory, Permissions::ADMIN)
        .await;

    cancel.cancel();
    writer.await.unwrap();

    let log = h.service.audit_log(&alice, nb.id, 10).await.unwrap();
    let actions: Vec<_> = log.iter().map(|e| (e.action, e.outcome)).collect();
    assert_eq!(
        actions,
        vec![
            (AuditAction::ShareNotebook, AuditOutcome::Denied),
            (AuditAction::WriteEntry, AuditOutcome::Allowed),
            (AuditAction::CreateNotebook, AuditOutcome::Allowed),
        ]
    );
    assert_eq!(log[0].actor, mallory);
    assert!(h.service.audit_log(&mallory, nb.id, 10).await.is_err());
    assert_eq!(h.store.list_audit(None, 10).await.unwrap().len(), 3);
}
