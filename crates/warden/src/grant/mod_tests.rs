// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::notify::{spawn_notifier, Notifier};
use super::*;
use crate::test_support::unrecorded;

fn store() -> GrantStore {
    let (tx, _) = broadcast::channel(16);
    GrantStore::in_memory(tx)
}

fn request(service: &str) -> GrantRequest {
    GrantRequest {
        service: service.to_owned(),
        scopes: vec!["repo".to_owned()],
        reason: Some("open a PR".to_owned()),
        ..Default::default()
    }
}

#[tokio::test]
async fn create_starts_pending() -> anyhow::Result<()> {
    let store = store();
    let grant = store.create(request("github"), "agent-1", "owner", unrecorded).await?;
    assert_eq!(grant.status, GrantStatus::Pending);
    assert_eq!(grant.agent, "agent-1");
    assert_eq!(grant.oauth_state, None);
    assert_eq!(store.get(&grant.id).await, Some(grant));
    Ok(())
}

#[tokio::test]
async fn create_rejects_empty_service() {
    let store = store();
    crate::assert_err_contains!(store.create(request("  "), "a", "p", unrecorded).await, "service is required");
    assert!(store.list().await.is_empty());
}

#[tokio::test]
async fn approve_assigns_oauth_state_for_capable_service() -> anyhow::Result<()> {
    let store = store();
    let grant = store.create(request("github"), "agent", "owner", unrecorded).await?;

    let approved = store
        .approve(&grant.id, "owner", |_| true, unrecorded)
        .await?
        .ok_or_else(|| anyhow::anyhow!("approve returned None"))?;

    assert_eq!(approved.status, GrantStatus::Approved);
    assert_eq!(approved.decided_by.as_deref(), Some("owner"));
    assert!(approved.decided_at.is_some());
    let state = approved.oauth_state.as_deref().unwrap_or_default();
    assert_eq!(state.len(), 43);
    assert_eq!(store.find_by_oauth_state(state).await.map(|g| g.id), Some(grant.id));
    Ok(())
}

#[tokio::test]
async fn approve_leaves_oauth_state_unset_for_manual_service() -> anyhow::Result<()> {
    let store = store();
    let grant = store.create(request("openai"), "agent", "owner", unrecorded).await?;
    let approved = store.approve(&grant.id, "owner", |_| false, unrecorded).await?;
    assert_eq!(approved.and_then(|g| g.oauth_state), None);
    Ok(())
}

#[tokio::test]
async fn approve_non_pending_returns_none_and_preserves_state() -> anyhow::Result<()> {
    let store = store();
    let grant = store.create(request("github"), "agent", "owner", unrecorded).await?;
    store.approve(&grant.id, "owner", |_| false, unrecorded).await?;
    let before = store.get(&grant.id).await;

    assert_eq!(store.approve(&grant.id, "someone", |_| true, unrecorded).await?, None);
    assert_eq!(store.deny(&grant.id, None, "someone", unrecorded).await?, None);
    assert_eq!(store.get(&grant.id).await, before);
    Ok(())
}

#[tokio::test]
async fn unknown_id_is_none_not_error() -> anyhow::Result<()> {
    let store = store();
    assert_eq!(store.approve("missing", "owner", |_| true, unrecorded).await?, None);
    assert_eq!(store.deny("missing", None, "owner", unrecorded).await?, None);
    Ok(())
}

#[tokio::test]
async fn deny_records_reason_and_is_terminal() -> anyhow::Result<()> {
    let store = store();
    let grant = store.create(request("github"), "agent", "owner", unrecorded).await?;

    let denied = store
        .deny(&grant.id, Some("not today".to_owned()), "owner", unrecorded)
        .await?
        .ok_or_else(|| anyhow::anyhow!("deny returned None"))?;
    assert_eq!(denied.status, GrantStatus::Denied);
    assert_eq!(denied.deny_reason.as_deref(), Some("not today"));
    assert_eq!(store.approve(&grant.id, "owner", |_| true, unrecorded).await?, None);
    Ok(())
}

fn refused(_: &Grant) -> std::future::Ready<Result<(), AuditError>> {
    std::future::ready(Err(AuditError::WriterGone))
}

#[tokio::test]
async fn unrecorded_transitions_roll_back() -> anyhow::Result<()> {
    let (tx, mut rx) = broadcast::channel(16);
    let store = GrantStore::in_memory(tx);

    let created = store.create(request("github"), "agent", "owner", refused).await;
    assert!(matches!(created, Err(GrantError::Audit(_))));
    assert!(store.list().await.is_empty());

    let grant = store.create(request("github"), "agent", "owner", unrecorded).await?;
    assert!(matches!(rx.recv().await?, GrantEvent::Requested(_)));

    let approved = store.approve(&grant.id, "owner", |_| true, refused).await;
    assert!(matches!(approved, Err(GrantError::Audit(_))));
    let denied = store.deny(&grant.id, Some("no".to_owned()), "owner", refused).await;
    assert!(matches!(denied, Err(GrantError::Audit(_))));

    let current = store.get(&grant.id).await;
    assert_eq!(current, Some(grant.clone()));
    assert!(rx.try_recv().is_err(), "rolled-back transition published an event");

    // Once recording works again the grant is still decidable.
    let approved = store.approve(&grant.id, "owner", |_| true, unrecorded).await?;
    assert_eq!(approved.map(|g| g.status), Some(GrantStatus::Approved));
    Ok(())
}

#[tokio::test]
async fn rollback_is_persisted() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("grants.json");
    let (tx, _) = broadcast::channel(16);
    let store = GrantStore::open(path.clone(), tx.clone())?;
    let grant = store.create(request("github"), "agent", "owner", unrecorded).await?;
    assert!(store.approve(&grant.id, "owner", |_| false, refused).await.is_err());

    let reopened = GrantStore::open(path, tx)?;
    assert_eq!(reopened.get(&grant.id).await.map(|g| g.status), Some(GrantStatus::Pending));
    Ok(())
}

#[tokio::test]
async fn concurrent_approvals_have_one_winner() -> anyhow::Result<()> {
    let store = Arc::new(store());
    let grant = store.create(request("github"), "agent", "owner", unrecorded).await?;

    let mut handles = Vec::new();
    for i in 0..16 {
        let store = Arc::clone(&store);
        let id = grant.id.clone();
        handles.push(tokio::spawn(async move {
            store.approve(&id, &format!("approver-{i}"), |_| true, unrecorded).await
        }));
    }
    let mut winners = 0;
    for h in handles {
        if h.await??.is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    Ok(())
}

#[tokio::test]
async fn pending_is_fifo() -> anyhow::Result<()> {
    let store = store();
    let a = store.create(request("a"), "agent", "owner", unrecorded).await?;
    let b = store.create(request("b"), "agent", "owner", unrecorded).await?;
    let c = store.create(request("c"), "agent", "owner", unrecorded).await?;
    store.approve(&b.id, "owner", |_| false, unrecorded).await?;

    let ids: Vec<String> = store.pending().await.into_iter().map(|g| g.id).collect();
    assert_eq!(ids, vec![a.id, c.id]);
    Ok(())
}

#[tokio::test]
async fn revoke_moves_approved_grants_and_is_idempotent() -> anyhow::Result<()> {
    let store = store();
    let approved = store.create(request("github"), "agent", "owner", unrecorded).await?;
    let pending = store.create(request("github"), "agent", "owner", unrecorded).await?;
    let other = store.create(request("gitlab"), "agent", "owner", unrecorded).await?;
    store.approve(&approved.id, "owner", |_| true, unrecorded).await?;
    store.approve(&other.id, "owner", |_| true, unrecorded).await?;

    let revoked = store.revoke("github").await?;
    assert_eq!(revoked.len(), 1);
    assert_eq!(revoked[0].id, approved.id);
    assert!(revoked[0].revoked_at.is_some());

    assert_eq!(store.get(&pending.id).await.map(|g| g.status), Some(GrantStatus::Pending));
    assert_eq!(store.get(&other.id).await.map(|g| g.status), Some(GrantStatus::Approved));
    assert!(store.revoke("github").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn revoked_grant_no_longer_matches_oauth_state() -> anyhow::Result<()> {
    let store = store();
    let grant = store.create(request("github"), "agent", "owner", unrecorded).await?;
    let approved = store.approve(&grant.id, "owner", |_| true, unrecorded).await?;
    let state = approved.and_then(|g| g.oauth_state).unwrap_or_default();
    store.revoke("github").await?;
    assert_eq!(store.find_by_oauth_state(&state).await, None);
    Ok(())
}

#[tokio::test]
async fn transitions_publish_events() -> anyhow::Result<()> {
    let (tx, mut rx) = broadcast::channel(16);
    let store = GrantStore::in_memory(tx);
    let grant = store.create(request("github"), "agent", "owner", unrecorded).await?;
    store.approve(&grant.id, "owner", |_| false, unrecorded).await?;
    store.revoke("github").await?;

    assert!(matches!(rx.recv().await?, GrantEvent::Requested(_)));
    assert!(matches!(rx.recv().await?, GrantEvent::Approved(_)));
    let revoked = rx.recv().await?;
    assert!(matches!(revoked, GrantEvent::Revoked(_)));
    assert_eq!(revoked.grant().id, grant.id);
    Ok(())
}

#[tokio::test]
async fn persisted_store_survives_reopen_in_order() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("grants.json");
    let (tx, _) = broadcast::channel(16);
    let ids = {
        let store = GrantStore::open(path.clone(), tx.clone())?;
        let a = store.create(request("a"), "agent", "owner", unrecorded).await?;
        let b = store.create(request("b"), "agent", "owner", unrecorded).await?;
        store.deny(&a.id, None, "owner", unrecorded).await?;
        vec![a.id, b.id]
    };

    let store = GrantStore::open(path, tx)?;
    let listed: Vec<(String, GrantStatus)> =
        store.list().await.into_iter().map(|g| (g.id, g.status)).collect();
    assert_eq!(
        listed,
        vec![(ids[0].clone(), GrantStatus::Denied), (ids[1].clone(), GrantStatus::Pending)]
    );
    Ok(())
}

#[yare::parameterized(
    approve = { GrantStatus::Pending, GrantStatus::Approved, true },
    deny = { GrantStatus::Pending, GrantStatus::Denied, true },
    revoke_approved = { GrantStatus::Approved, GrantStatus::Revoked, true },
    revoke_denied = { GrantStatus::Denied, GrantStatus::Revoked, true },
    revoke_pending = { GrantStatus::Pending, GrantStatus::Revoked, false },
    reapprove = { GrantStatus::Approved, GrantStatus::Approved, false },
    undeny = { GrantStatus::Denied, GrantStatus::Approved, false },
    unrevoke = { GrantStatus::Revoked, GrantStatus::Approved, false },
    back_to_pending = { GrantStatus::Approved, GrantStatus::Pending, false },
)]
fn transition_table(from: GrantStatus, to: GrantStatus, legal: bool) {
    assert_eq!(from.can_become(to), legal);
}

#[derive(Default)]
struct RecordingNotifier {
    seen: Mutex<Vec<(String, Option<String>)>>,
}

impl Notifier for RecordingNotifier {
    fn notify_grant_request<'a>(
        &'a self,
        grant: &'a Grant,
        dashboard_url: Option<&'a str>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + 'a>> {
        self.seen.lock().push((grant.service.clone(), dashboard_url.map(str::to_owned)));
        Box::pin(async { Ok(()) })
    }
}

#[tokio::test]
async fn notifier_fires_only_for_requests() -> anyhow::Result<()> {
    let (tx, _) = broadcast::channel(16);
    let store = GrantStore::in_memory(tx);
    let recorder = Arc::new(RecordingNotifier::default());
    let shutdown = CancellationToken::new();
    let handle = spawn_notifier(
        vec![recorder.clone() as Arc<dyn Notifier>],
        Some("https://dash.example".to_owned()),
        store.subscribe(),
        shutdown.clone(),
    );

    let grant = store.create(request("github"), "agent", "owner", unrecorded).await?;
    store.approve(&grant.id, "owner", |_| false, unrecorded).await?;

    for _ in 0..100 {
        if !recorder.seen.lock().is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    shutdown.cancel();
    handle.await?;

    let seen = recorder.seen.lock().clone();
    assert_eq!(seen, vec![("github".to_owned(), Some("https://dash.example".to_owned()))]);
    Ok(())
}

/// Never finishes, like a webhook stuck in retries.
struct StalledNotifier;

impl Notifier for StalledNotifier {
    fn notify_grant_request<'a>(
        &'a self,
        _grant: &'a Grant,
        _dashboard_url: Option<&'a str>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + 'a>> {
        Box::pin(std::future::pending())
    }
}

#[tokio::test]
async fn stalled_notifier_does_not_hold_up_others() -> anyhow::Result<()> {
    let (tx, _) = broadcast::channel(16);
    let store = GrantStore::in_memory(tx);
    let recorder = Arc::new(RecordingNotifier::default());
    let shutdown = CancellationToken::new();
    let handle = spawn_notifier(
        vec![Arc::new(StalledNotifier) as Arc<dyn Notifier>, recorder.clone() as Arc<dyn Notifier>],
        None,
        store.subscribe(),
        shutdown.clone(),
    );

    store.create(request("github"), "agent", "owner", unrecorded).await?;
    store.create(request("openai"), "agent", "owner", unrecorded).await?;

    for _ in 0..100 {
        if recorder.seen.lock().len() == 2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    shutdown.cancel();
    handle.await?;

    let services: Vec<String> = recorder.seen.lock().iter().map(|(s, _)| s.clone()).collect();
    assert_eq!(services, vec!["github", "openai"]);
    Ok(())
}
