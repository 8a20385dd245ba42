// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Hash-chained audit log.
//!
//! Every entry records `previous_hash = HMAC(key, <raw line of predecessor>)`,
//! with the first entry chained to `HMAC(key, "GENESIS")`. Appends go through
//! a single writer task that owns the tail hash: two concurrent appends must
//! never chain from the same predecessor.

pub mod key;
pub mod storage;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ring::hmac;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use self::storage::AuditStorage;

/// Literal hashed to seed the chain.
pub const GENESIS: &str = "GENESIS";

/// Depth of the writer command queue.
const QUEUE_DEPTH: usize = 256;

/// Sensitive actions recorded in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    GrantRequested,
    GrantApproved,
    GrantDenied,
    CredentialStored,
    CredentialAccessed,
    CredentialRevoked,
    DeviceFlowStarted,
    DeviceFlowFailed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GrantRequested => "grant_requested",
            Self::GrantApproved => "grant_approved",
            Self::GrantDenied => "grant_denied",
            Self::CredentialStored => "credential_stored",
            Self::CredentialAccessed => "credential_accessed",
            Self::CredentialRevoked => "credential_revoked",
            Self::DeviceFlowStarted => "device_flow_started",
            Self::DeviceFlowFailed => "device_flow_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Denied,
    Error,
}

/// Who is acting, and from where. Built per request by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditContext {
    pub principal_id: String,
    pub agent_id: Option<String>,
    pub source_ip: String,
    pub user_agent: String,
    pub request_id: String,
}

impl AuditContext {
    /// Context for actions taken by background tasks rather than a request.
    pub fn system() -> Self {
        Self {
            principal_id: "system".to_owned(),
            agent_id: None,
            source_ip: "local".to_owned(),
            user_agent: concat!("warden/", env!("CARGO_PKG_VERSION")).to_owned(),
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Start an entry for `action` on `service` with a `success` outcome.
    pub fn entry(&self, action: AuditAction, service: impl Into<String>) -> NewAuditEntry {
        NewAuditEntry {
            principal_id: self.principal_id.clone(),
            agent_id: self.agent_id.clone(),
            source_ip: self.source_ip.clone(),
            user_agent: self.user_agent.clone(),
            action,
            service: service.into(),
            scopes: None,
            resource_id: None,
            outcome: Outcome::Success,
            error_code: None,
            error_message: None,
            request_id: self.request_id.clone(),
            metadata: None,
        }
    }
}

/// Caller-supplied part of an entry; id, timestamp and hash are assigned on append.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    pub principal_id: String,
    pub agent_id: Option<String>,
    pub source_ip: String,
    pub user_agent: String,
    pub action: AuditAction,
    pub service: String,
    pub scopes: Option<Vec<String>>,
    pub resource_id: Option<String>,
    pub outcome: Outcome,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub request_id: String,
    pub metadata: Option<serde_json::Value>,
}

impl NewAuditEntry {
    pub fn scopes(mut self, scopes: &[String]) -> Self {
        self.scopes = Some(scopes.to_vec());
        self
    }

    pub fn resource(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }

    pub fn outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A persisted audit entry. Field order is the serialization order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub previous_hash: String,
    pub principal_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub source_ip: String,
    pub user_agent: String,
    pub action: AuditAction,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Result of re-deriving the chain from storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<usize>,
    pub total_entries: usize,
}

impl VerifyReport {
    fn valid(total_entries: usize) -> Self {
        Self { valid: true, broken_at: None, total_entries }
    }

    fn broken(index: usize, total_entries: usize) -> Self {
        Self { valid: false, broken_at: Some(index), total_entries }
    }
}

/// Query filters. All fields are optional and combined with AND.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditFilter {
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub action: Option<AuditAction>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub principal: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub outcome: Option<Outcome>,
    /// Keep only the most recent `limit` matches.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        if self.from.is_some_and(|from| entry.timestamp < from) {
            return false;
        }
        if self.to.is_some_and(|to| entry.timestamp > to) {
            return false;
        }
        if self.action.is_some_and(|a| a != entry.action) {
            return false;
        }
        if self.outcome.is_some_and(|o| o != entry.outcome) {
            return false;
        }
        if self.service.as_deref().is_some_and(|s| s != entry.service) {
            return false;
        }
        if self.principal.as_deref().is_some_and(|p| p != entry.principal_id) {
            return false;
        }
        if let Some(ref agent) = self.agent {
            if entry.agent_id.as_deref() != Some(agent.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit storage failure: {0}")]
    Storage(#[from] std::io::Error),
    #[error("audit serialization failure: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("audit writer is not running")]
    WriterGone,
}

enum Command {
    Append { entry: NewAuditEntry, reply: oneshot::Sender<Result<AuditEntry, AuditError>> },
    Verify { reply: oneshot::Sender<Result<VerifyReport, AuditError>> },
}

/// Handle to the audit chain. Cheap to share behind an `Arc`.
pub struct AuditChain {
    tx: mpsc::Sender<Command>,
    storage: Arc<dyn AuditStorage>,
}

impl AuditChain {
    /// Open the chain over `storage` and spawn its writer task.
    ///
    /// The tail hash is recomputed from the persisted lines; nothing cached
    /// from a previous process is trusted.
    pub fn open(storage: Arc<dyn AuditStorage>, key: &[u8]) -> Result<Self, AuditError> {
        let key = hmac::Key::new(hmac::HMAC_SHA256, key);
        let lines = storage.read_all()?;
        let tail_hash = match lines.last() {
            Some(line) => sign(&key, line),
            None => sign(&key, GENESIS.as_bytes()),
        };
        let writer =
            Writer { storage: Arc::clone(&storage), key, tail_hash, written: lines.len() };
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(writer.run(rx));
        tracing::debug!(entries = lines.len(), "audit chain opened");
        Ok(Self { tx, storage })
    }

    /// Append an entry, returning it with id, timestamp and hash assigned.
    pub async fn append(&self, entry: NewAuditEntry) -> Result<AuditEntry, AuditError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Append { entry, reply }).await.map_err(|_| AuditError::WriterGone)?;
        rx.await.map_err(|_| AuditError::WriterGone)?
    }

    /// Re-derive the whole chain from storage.
    pub async fn verify(&self) -> Result<VerifyReport, AuditError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Verify { reply }).await.map_err(|_| AuditError::WriterGone)?;
        rx.await.map_err(|_| AuditError::WriterGone)?
    }

    /// Scan all entries and return those matching `filter`, oldest first.
    ///
    /// Linear in the size of the log; lines that fail to parse are skipped
    /// here and reported by [`AuditChain::verify`] instead.
    pub fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
        let lines = self.storage.read_all()?;
        let mut matched: Vec<AuditEntry> = lines
            .iter()
            .filter_map(|line| serde_json::from_slice::<AuditEntry>(line).ok())
            .filter(|e| filter.matches(e))
            .collect();
        if let Some(limit) = filter.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        Ok(matched)
    }
}

/// Only the link field is needed to verify a line.
#[derive(Deserialize)]
struct ChainLink {
    previous_hash: String,
}

/// The `previous_hash` a stored line claims, or `None` if the line is not
/// valid UTF-8 JSON carrying one.
fn link_of(line: &[u8]) -> Option<String> {
    let line = std::str::from_utf8(line).ok()?;
    serde_json::from_str::<ChainLink>(line).ok().map(|l| l.previous_hash)
}

/// Single writer owning the tail of the chain.
struct Writer {
    storage: Arc<dyn AuditStorage>,
    key: hmac::Key,
    tail_hash: String,
    /// Entries this process knows to be in storage (loaded + appended).
    written: usize,
}

impl Writer {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Append { entry, reply } => {
                    let result = self.append(entry);
                    if let Err(ref e) = result {
                        tracing::error!(err = %e, "audit append failed");
                    }
                    let _ = reply.send(result);
                }
                Command::Verify { reply } => {
                    let _ = reply.send(self.verify());
                }
            }
        }
        tracing::debug!("audit writer stopped");
    }

    fn append(&mut self, new: NewAuditEntry) -> Result<AuditEntry, AuditError> {
        let entry = AuditEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            previous_hash: self.tail_hash.clone(),
            principal_id: new.principal_id,
            agent_id: new.agent_id,
            source_ip: new.source_ip,
            user_agent: new.user_agent,
            action: new.action,
            service: new.service,
            scopes: new.scopes,
            resource_id: new.resource_id,
            outcome: new.outcome,
            error_code: new.error_code,
            error_message: new.error_message,
            request_id: new.request_id,
            metadata: new.metadata,
        };
        let line = serde_json::to_string(&entry)?;
        self.storage.append(&line)?;
        self.tail_hash = sign(&self.key, line.as_bytes());
        self.written += 1;
        Ok(entry)
    }

    fn verify(&self) -> Result<VerifyReport, AuditError> {
        let lines = self.storage.read_all()?;
        let total = lines.len();

        let mut expected = sign(&self.key, GENESIS.as_bytes());
        for (index, line) in lines.iter().enumerate() {
            if link_of(line).as_deref() != Some(expected.as_str()) {
                return Ok(VerifyReport::broken(index, total));
            }
            expected = sign(&self.key, line);
        }

        // The links only cover predecessors; the tail is checked against what
        // this writer last wrote.
        if total < self.written {
            return Ok(VerifyReport::broken(total, total));
        }
        if total > self.written {
            return Ok(VerifyReport::broken(self.written, total));
        }
        if total > 0 && expected != self.tail_hash {
            return Ok(VerifyReport::broken(total - 1, total));
        }
        Ok(VerifyReport::valid(total))
    }
}

/// Hex-encoded HMAC-SHA256 of `data`.
fn sign(key: &hmac::Key, data: &[u8]) -> String {
    hex::encode(hmac::sign(key, data).as_ref())
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
