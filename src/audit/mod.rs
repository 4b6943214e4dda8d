//! Audit trail of every attempted action.
//!
//! One [`AuditEntry`] is written per attempt whatever the verdict: allowed,
//! denied, confirmed, rejected, expired, superseded. Entries are immutable and
//! go to an append-only [`AuditStore`]. The [`AuditSink`] wraps a store with
//! bounded retry: after the last failed attempt the entry is dropped, the drop
//! is logged and counted, and the caller gets [`AuditError::Dropped`] so it can
//! tell the user the action happened without a record.

mod jsonl;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::AuditConfig;
use crate::policy::{DenyReason, VerdictKind};

pub use self::jsonl::JsonlAuditStore;

// ── Errors ───────────────────────────────────────────────────────────────

#[derive(Debug, Error, Diagnostic)]
pub enum AuditError {
    #[error("audit store unavailable: {message}")]
    #[diagnostic(
        code(colonel::audit::unavailable),
        help("The audit store could not accept the write. Check disk space and permissions.")
    )]
    Unavailable { message: String },

    #[error("audit I/O failed at {path}")]
    #[diagnostic(
        code(colonel::audit::io),
        help("Ensure the audit log directory exists and is writable.")
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("audit record {entry_id} dropped after {attempts} attempts: {last_error}")]
    #[diagnostic(
        code(colonel::audit::dropped),
        help(
            "The action's outcome was delivered but no audit record exists for it. \
             Restore the audit store and reconcile from the service logs."
        )
    )]
    Dropped {
        entry_id: Uuid,
        attempts: u32,
        last_error: String,
    },
}

// ── Entry ────────────────────────────────────────────────────────────────

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Timeout,
    Cancelled,
    ValidationFailed,
    Denied,
    Rejected,
    Expired,
    Stale,
    Superseded,
}

impl AuditOutcome {
    /// Whether the capability was invoked for this attempt.
    pub fn executed(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Timeout | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::ValidationFailed => "validation_failed",
            Self::Denied => "denied",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Stale => "stale",
            Self::Superseded => "superseded",
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one attempted action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub user_id: String,
    pub model_id: String,
    pub skill: String,
    pub action: String,
    /// Parameters as proposed, with sensitive values redacted.
    pub params: Map<String, Value>,
    pub verdict: VerdictKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny_reason: Option<DenyReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm_id: Option<String>,
    pub outcome: AuditOutcome,
    /// Short result or error summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Longest `detail` kept in an entry.
pub const MAX_DETAIL_CHARS: usize = 500;

impl AuditEntry {
    /// Trim a result or error text for the `detail` field.
    pub fn summarize(text: &str) -> String {
        text.chars().take(MAX_DETAIL_CHARS).collect()
    }
}

/// Query filter for [`AuditStore::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    pub skill: Option<String>,
    pub action: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub outcome: Option<AuditOutcome>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Default page size for queries.
pub const DEFAULT_QUERY_LIMIT: usize = 100;

impl AuditFilter {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.skill.as_ref().is_none_or(|s| *s == entry.skill)
            && self.action.as_ref().is_none_or(|a| *a == entry.action)
            && self.user_id.as_ref().is_none_or(|u| *u == entry.user_id)
            && self.session_id.as_ref().is_none_or(|s| *s == entry.session_id)
            && self.outcome.is_none_or(|o| o == entry.outcome)
    }

    /// Filter, order newest first, then page.
    pub fn apply<'a>(&self, entries: impl Iterator<Item = &'a AuditEntry>) -> Vec<AuditEntry> {
        let mut hits: Vec<&AuditEntry> = entries.filter(|e| self.matches(e)).collect();
        hits.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        hits.into_iter()
            .skip(self.offset.unwrap_or(0))
            .take(self.limit.unwrap_or(DEFAULT_QUERY_LIMIT))
            .cloned()
            .collect()
    }
}

// ── Store ────────────────────────────────────────────────────────────────

/// Append-only storage for audit entries.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Store `entry`. Appending an id that is already stored is a no-op, so
    /// a retried append never produces a second record.
    async fn append(&self, entry: &AuditEntry) -> Result<(), AuditError>;

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, AuditError>;
}

/// Keeps entries in memory. The default when no audit path is configured.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry in append order.
    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let mut entries = self.entries.lock().await;
        if !entries.iter().any(|e| e.id == entry.id) {
            entries.push(entry.clone());
        }
        Ok(())
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
        let entries = self.entries.lock().await;
        Ok(filter.apply(entries.iter()))
    }
}

// ── Sink ─────────────────────────────────────────────────────────────────

/// Bounded-retry writer in front of an [`AuditStore`].
pub struct AuditSink {
    store: Arc<dyn AuditStore>,
    max_attempts: u32,
    attempt_timeout: Duration,
    backoff: Duration,
    recorded: AtomicU64,
    dropped: AtomicU64,
}

impl AuditSink {
    pub fn new(store: Arc<dyn AuditStore>, config: &AuditConfig) -> Self {
        Self {
            store,
            max_attempts: config.max_attempts.max(1),
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
            backoff: Duration::from_millis(config.retry_backoff_ms),
            recorded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Sink over a JSONL file when `config.path` is set, memory otherwise.
    pub fn from_config(config: &AuditConfig) -> Self {
        let store: Arc<dyn AuditStore> = match &config.path {
            Some(path) => Arc::new(JsonlAuditStore::new(path.clone())),
            None => Arc::new(MemoryAuditStore::new()),
        };
        Self::new(store, config)
    }

    /// Write `entry`, retrying up to the configured number of attempts. Never
    /// waits longer than `max_attempts * (attempt_timeout + backoff)`.
    ///
    /// Each append runs as its own task, so a timeout never cuts a write in
    /// half. An append that outlives its attempt is waited on again by the
    /// next attempt rather than started a second time.
    pub async fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let entry = Arc::new(entry);
        let mut last_error = String::new();
        let mut in_flight: Option<JoinHandle<Result<(), AuditError>>> = None;
        for attempt in 1..=self.max_attempts {
            let append = in_flight.get_or_insert_with(|| {
                let store = Arc::clone(&self.store);
                let entry = Arc::clone(&entry);
                tokio::spawn(async move { store.append(&entry).await })
            });
            match tokio::time::timeout(self.attempt_timeout, append).await {
                Ok(joined) => {
                    in_flight = None;
                    match joined {
                        Ok(Ok(())) => {
                            self.recorded.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(
                                entry_id = %entry.id,
                                outcome = entry.outcome.as_str(),
                                "audit entry recorded"
                            );
                            return Ok(());
                        }
                        Ok(Err(e)) => last_error = e.to_string(),
                        Err(e) => last_error = format!("append task failed: {e}"),
                    }
                }
                Err(_) => {
                    last_error = format!("append timed out after {}ms", self.attempt_timeout.as_millis())
                }
            }
            tracing::warn!(entry_id = %entry.id, attempt, error = last_error.as_str(), "audit append failed");
            if attempt < self.max_attempts {
                tokio::time::sleep(self.backoff).await;
            }
        }

        self.dropped.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            entry_id = %entry.id,
            session_id = entry.session_id.as_str(),
            skill = entry.skill.as_str(),
            action = entry.action.as_str(),
            outcome = entry.outcome.as_str(),
            error = last_error.as_str(),
            "audit entry dropped"
        );
        Err(AuditError::Dropped {
            entry_id: entry.id,
            attempts: self.max_attempts,
            last_error,
        })
    }

    pub async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
        self.store.query(filter).await
    }

    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    /// Entries lost after exhausting retries since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for AuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditSink")
            .field("max_attempts", &self.max_attempts)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("recorded", &self.recorded())
            .field("dropped", &self.dropped())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::testing::entry;
    use super::*;

    /// Fails the first `failures` appends.
    struct FlakyStore {
        failures: AtomicU32,
        inner: MemoryAuditStore,
    }

    #[async_trait]
    impl AuditStore for FlakyStore {
        async fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(AuditError::Unavailable {
                    message: "disk full".into(),
                });
            }
            self.inner.append(entry).await
        }

        async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
            self.inner.query(filter).await
        }
    }

    fn config() -> AuditConfig {
        AuditConfig {
            path: None,
            max_attempts: 3,
            attempt_timeout_ms: 50,
            retry_backoff_ms: 1,
        }
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let store = Arc::new(FlakyStore {
            failures: AtomicU32::new(2),
            inner: MemoryAuditStore::new(),
        });
        let sink = AuditSink::new(store.clone(), &config());
        sink.record(entry("pg", AuditOutcome::Success)).await.unwrap();
        assert_eq!(store.inner.entries().await.len(), 1);
        assert_eq!(sink.dropped(), 0);
    }

    #[tokio::test]
    async fn drops_after_budget() {
        let store = Arc::new(FlakyStore {
            failures: AtomicU32::new(10),
            inner: MemoryAuditStore::new(),
        });
        let sink = AuditSink::new(store.clone(), &config());
        let err = sink.record(entry("pg", AuditOutcome::Denied)).await.unwrap_err();
        assert!(matches!(err, AuditError::Dropped { attempts: 3, .. }));
        assert_eq!(sink.dropped(), 1);
        assert!(store.inner.entries().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_store_is_bounded() {
        struct Hung;
        #[async_trait]
        impl AuditStore for Hung {
            async fn append(&self, _entry: &AuditEntry) -> Result<(), AuditError> {
                futures_util::future::pending().await
            }
            async fn query(&self, _filter: &AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
                Ok(Vec::new())
            }
        }
        let sink = AuditSink::new(Arc::new(Hung), &config());
        let err = sink.record(entry("pg", AuditOutcome::Success)).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_append_is_not_repeated() {
        /// Takes longer than one attempt to finish its write.
        struct Slow {
            calls: AtomicU32,
            inner: MemoryAuditStore,
        }
        #[async_trait]
        impl AuditStore for Slow {
            async fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(80)).await;
                self.inner.append(entry).await
            }
            async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
                self.inner.query(filter).await
            }
        }

        let store = Arc::new(Slow {
            calls: AtomicU32::new(0),
            inner: MemoryAuditStore::new(),
        });
        let sink = AuditSink::new(store.clone(), &config());
        sink.record(entry("pg", AuditOutcome::Success)).await.unwrap();

        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.inner.entries().await.len(), 1);
        assert_eq!(sink.recorded(), 1);
    }

    #[tokio::test]
    async fn memory_store_ignores_repeated_ids() {
        let store = MemoryAuditStore::new();
        let record = entry("pg", AuditOutcome::Success);
        store.append(&record).await.unwrap();
        store.append(&record).await.unwrap();
        assert_eq!(store.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn query_filters_and_pages() {
        let store = MemoryAuditStore::new();
        for (skill, outcome) in [
            ("pg", AuditOutcome::Success),
            ("pg", AuditOutcome::Denied),
            ("docker", AuditOutcome::Success),
        ] {
            store.append(&entry(skill, outcome)).await.unwrap();
        }
        let pg = store
            .query(&AuditFilter {
                skill: Some("pg".into()),
                ..AuditFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(pg.len(), 2);

        let denied = store
            .query(&AuditFilter {
                outcome: Some(AuditOutcome::Denied),
                ..AuditFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(denied.len(), 1);

        let paged = store
            .query(&AuditFilter {
                limit: Some(1),
                offset: Some(1),
                ..AuditFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(paged.len(), 1);
    }

    #[test]
    fn outcome_classification() {
        assert!(AuditOutcome::Timeout.executed());
        assert!(!AuditOutcome::Expired.executed());
        assert_eq!(AuditOutcome::ValidationFailed.to_string(), "validation_failed");
    }
}
