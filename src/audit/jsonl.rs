//! Append-only JSON Lines audit log.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{AuditEntry, AuditError, AuditFilter, AuditStore};

/// One JSON object per line. Appends are serialized through a lock so lines
/// from concurrent sessions never interleave, and an entry whose id is
/// already in the file is not written again.
#[derive(Debug)]
pub struct JsonlAuditStore {
    path: PathBuf,
    /// What the file holds, scanned on first append and after any failed one.
    written: Mutex<Option<Written>>,
}

#[derive(Debug)]
struct Written {
    ids: HashSet<Uuid>,
    /// The last line has no terminating newline (an append was cut short).
    torn_tail: bool,
}

#[derive(Deserialize)]
struct IdOnly {
    id: Uuid,
}

impl JsonlAuditStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            written: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> AuditError {
        AuditError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    async fn read_text(&self) -> Result<String, AuditError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn scan(&self) -> Result<Written, AuditError> {
        let text = self.read_text().await?;
        let ids = text
            .lines()
            .filter_map(|line| serde_json::from_str::<IdOnly>(line).ok())
            .map(|record| record.id)
            .collect();
        Ok(Written {
            ids,
            torn_tail: !text.is_empty() && !text.ends_with('\n'),
        })
    }

    /// Parse every line of the log. A missing file reads as empty; lines
    /// that do not parse are logged and skipped.
    pub async fn read_all(&self) -> Result<Vec<AuditEntry>, AuditError> {
        let text = self.read_text().await?;
        let entries = text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(i, line)| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        line = i + 1,
                        error = %e,
                        "skipping corrupt audit line"
                    );
                    None
                }
            })
            .collect();
        Ok(entries)
    }
}

#[async_trait]
impl AuditStore for JsonlAuditStore {
    async fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let mut line = serde_json::to_string(entry).map_err(|e| AuditError::Unavailable {
            message: format!("serialize audit entry: {e}"),
        })?;
        line.push('\n');

        let mut guard = self.written.lock().await;
        // Taken out so an early return leaves `None` and the next append rescans.
        let mut written = match guard.take() {
            Some(written) => written,
            None => self.scan().await?,
        };
        if written.ids.contains(&entry.id) {
            tracing::debug!(entry_id = %entry.id, "audit entry already in log");
            *guard = Some(written);
            return Ok(());
        }
        if written.torn_tail {
            line.insert(0, '\n');
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| self.io_error(e))?;
        file.flush().await.map_err(|e| self.io_error(e))?;

        written.torn_tail = false;
        written.ids.insert(entry.id);
        *guard = Some(written);
        Ok(())
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
        let entries = self.read_all().await?;
        Ok(filter.apply(entries.iter()))
    }
}
