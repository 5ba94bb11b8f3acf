//! SFTP data types

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::path::RemotePath;
use super::permissions::PermissionSet;
use crate::error::{Error, ErrorKind};

/// Node type as reported by the remote host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

impl EntryKind {
    /// Type column of the `ls -l` form
    pub fn type_char(self) -> char {
        match self {
            EntryKind::File => '-',
            EntryKind::Directory => 'd',
            EntryKind::Symlink => 'l',
        }
    }
}

/// One filesystem node as reported by the remote host.
///
/// Never cached across a mutation of its directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// File name (not full path)
    pub name: String,
    /// Normalized full path
    pub path: RemotePath,
    pub kind: EntryKind,
    /// Size in bytes, 0 for directories
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    pub mode: PermissionSet,
}

impl RemoteEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// `drwxr-xr-x` style rendering
    pub fn mode_string(&self) -> String {
        format!("{}{}", self.kind.type_char(), self.mode.to_symbolic())
    }
}

/// What to do when the destination name is already taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Fail with `AlreadyExists`
    #[default]
    Reject,
    /// Replace the existing destination
    Overwrite,
}

/// Result for one input path of a batch operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathOutcome {
    pub path: RemotePath,
    #[serde(flatten)]
    pub status: OutcomeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Failure { error: Error },
}

impl PathOutcome {
    pub fn success(path: RemotePath) -> Self {
        Self {
            path,
            status: OutcomeStatus::Success,
        }
    }

    pub fn failure(path: RemotePath, error: Error) -> Self {
        Self {
            path,
            status: OutcomeStatus::Failure { error },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, OutcomeStatus::Success)
    }

    pub fn error(&self) -> Option<&Error> {
        match &self.status {
            OutcomeStatus::Success => None,
            OutcomeStatus::Failure { error } => Some(error),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error().map(Error::kind)
    }
}

/// Per-path results of a batch, in input order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub outcomes: Vec<PathOutcome>,
}

impl BatchResult {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.len() - self.succeeded()
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(PathOutcome::is_success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &PathOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }
}

/// Content returned by `read_file`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub path: RemotePath,
    pub data: Vec<u8>,
    pub modified_at: DateTime<Utc>,
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Transfer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    /// Waiting for a transfer slot
    Queued,
    /// Currently transferring
    Active,
    /// Paused by user at a chunk boundary
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Cancelled
        )
    }
}

/// Snapshot of one upload or download
#[derive(Debug, Clone, Serialize)]
pub struct TransferTask {
    pub id: String,
    pub connection_id: String,
    pub direction: TransferDirection,
    pub local_path: PathBuf,
    pub remote_path: RemotePath,
    pub bytes_total: u64,
    /// Confirmed bytes at the destination, always a chunk boundary
    pub bytes_transferred: u64,
    pub state: TransferState,
    pub retry_count: u32,
    /// Terminal error for `Failed` tasks
    pub error: Option<Error>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferTask {
    /// Calculate progress percentage (0-100)
    pub fn percentage(&self) -> f64 {
        if self.bytes_total == 0 {
            if self.state == TransferState::Completed {
                100.0
            } else {
                0.0
            }
        } else {
            (self.bytes_transferred as f64 / self.bytes_total as f64) * 100.0
        }
    }
}

/// Progress notification delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferEvent {
    pub task_id: String,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    pub state: TransferState,
    pub error: Option<Error>,
}

impl TransferEvent {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
