// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Grant request notifications: tells the human an approval is waiting.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{Grant, GrantEvent};

/// Maximum webhook delivery retries for a single notification.
const MAX_RETRIES: u32 = 3;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Out-of-band channel to the approving human.
pub trait Notifier: Send + Sync {
    fn notify_grant_request<'a>(
        &'a self,
        grant: &'a Grant,
        dashboard_url: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;
}

/// Writes the request to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_grant_request<'a>(
        &'a self,
        grant: &'a Grant,
        dashboard_url: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            tracing::info!(
                grant_id = %grant.id,
                service = %grant.service,
                agent = %grant.agent,
                scopes = ?grant.scopes,
                dashboard = dashboard_url.unwrap_or("-"),
                "grant awaiting approval"
            );
            Ok(())
        })
    }
}

/// POSTs a JSON summary of the request to a webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }

    async fn deliver(&self, grant: &Grant, dashboard_url: Option<&str>) -> anyhow::Result<()> {
        let body = serde_json::json!({
            "event": "grant_requested",
            "grant_id": grant.id,
            "service": grant.service,
            "scopes": grant.scopes,
            "agent": grant.agent,
            "reason": grant.reason,
            "dashboard_url": dashboard_url,
        });

        let mut backoff = INITIAL_BACKOFF;
        for attempt in 0..=MAX_RETRIES {
            let result = self.client.post(&self.url).json(&body).send().await;
            let err = match result {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => anyhow::anyhow!("webhook returned {}", resp.status()),
                Err(e) => e.into(),
            };
            if attempt == MAX_RETRIES {
                return Err(err);
            }
            tracing::debug!(grant_id = %grant.id, attempt, err = %err, "webhook delivery failed, retrying");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        Ok(())
    }
}

impl Notifier for WebhookNotifier {
    fn notify_grant_request<'a>(
        &'a self,
        grant: &'a Grant,
        dashboard_url: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        Box::pin(self.deliver(grant, dashboard_url))
    }
}

/// Spawn a task that turns [`GrantEvent::Requested`] into notifications.
///
/// Delivery failures are logged and never affect the grant.
pub fn spawn_notifier(
    notifiers: Vec<Arc<dyn Notifier>>,
    dashboard_url: Option<String>,
    mut event_rx: broadcast::Receiver<GrantEvent>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = event_rx.recv() => event,
            };
            let grant = match event {
                Ok(GrantEvent::Requested(grant)) => grant,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "notifier lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            // Each delivery runs on its own so slow retries never hold up the receiver.
            for notifier in &notifiers {
                let notifier = Arc::clone(notifier);
                let grant = grant.clone();
                let dashboard_url = dashboard_url.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        notifier.notify_grant_request(&grant, dashboard_url.as_deref()).await
                    {
                        tracing::warn!(grant_id = %grant.id, err = %e, "grant notification failed");
                    }
                });
            }
        }
    })
}
