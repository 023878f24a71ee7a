/// Audit trail of rule changes
///
/// Every mutating rule operation appends one JSON line describing what was attempted,
/// on which backend, and whether it worked. Audit failures are logged and never abort
/// the operation they describe.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub const AUDIT_FILE_NAME: &str = "audit.log";

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ApplyNat,
    RemoveNat,
    OpenPort,
    OpenPortForSource,
    TrustSource,
    ClosePort,
    Cleanup,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub event_type: EventType,

    /// Backend that executed the operation
    pub backend: String,

    pub success: bool,

    /// Rule fields and other structured data
    pub details: serde_json::Value,

    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        backend: impl Into<String>,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            backend: backend.into(),
            success,
            details,
            error,
        }
    }
}

/// Append-only JSON-lines audit file
#[derive(Debug, Clone)]
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Audit log in the state directory.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push(AUDIT_FILE_NAME);

        Ok(Self { log_path })
    }

    /// Audit log at an explicit path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
        }
    }

    /// Appends an event as one JSON line.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be opened or written
    pub async fn log(&self, event: &AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(event)?;

        if let Some(parent) = self.log_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            crate::utils::ensure_dir(parent)?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Logs an event, downgrading any write failure to a warning.
    pub async fn record(
        &self,
        event_type: EventType,
        backend: &str,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) {
        let event = AuditEvent::new(event_type, backend, success, details, error);
        if let Err(e) = self.log(&event).await {
            tracing::warn!("Failed to write audit log {}: {e}", self.log_path.display());
        }
    }

    /// The most recent `count` events, newest first. Unparseable lines are skipped.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = match tokio::fs::read_to_string(&self.log_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        Ok(content
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str(line).ok())
            .take(count)
            .collect())
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}
