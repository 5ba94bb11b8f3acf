//! Transport seam
//!
//! A [`Connector`] performs the SSH handshake and authentication and yields a
//! [`Transport`]: one authenticated connection over which SFTP channels are
//! opened. Each [`RemoteChannel`] processes its requests in issue order.
//!
//! The russh implementation lives in `ssh::client` and `sftp::channel`; the
//! in-memory one in `ssh::memory`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::config::{ConnectionConfig, Credential};
use crate::error::Result;
use crate::sftp::{PermissionSet, RemoteEntry, RemotePath};

/// Ping result, distinguishing failure causes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    /// Connection is healthy
    Ok,
    /// No reply in time (may be latency, can be retried)
    Timeout,
    /// Link is gone
    IoError,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Handshake and authenticate. Errors are `Network`, `Auth` or `Protocol`.
    async fn connect(
        &self,
        config: &ConnectionConfig,
        credential: &Credential,
    ) -> Result<Arc<dyn Transport>>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open one SFTP channel. A server refusal maps to `ChannelLimitExceeded`.
    async fn open_channel(&self) -> Result<Box<dyn RemoteChannel>>;

    /// Lightweight round-trip
    async fn ping(&self) -> PingResult;

    /// Tear down the connection; idempotent
    async fn disconnect(&self);

    /// Fires once when the link goes away, whatever the cause
    fn subscribe_disconnect(&self) -> broadcast::Receiver<()>;
}

/// SFTP request surface of one channel.
///
/// Paths are normalized before they reach a channel. `stat` does not follow
/// symlinks.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    async fn stat(&self, path: &RemotePath) -> Result<RemoteEntry>;

    async fn read_dir(&self, path: &RemotePath) -> Result<Vec<RemoteEntry>>;

    async fn mkdir(&self, path: &RemotePath) -> Result<()>;

    async fn rmdir(&self, path: &RemotePath) -> Result<()>;

    async fn remove_file(&self, path: &RemotePath) -> Result<()>;

    /// Plain SFTP rename; fails if `to` exists on servers that honour v3
    async fn rename(&self, from: &RemotePath, to: &RemotePath) -> Result<()>;

    async fn set_mode(&self, path: &RemotePath, mode: PermissionSet) -> Result<()>;

    /// Create an empty file, truncating any existing one
    async fn create(&self, path: &RemotePath) -> Result<()>;

    /// Up to `len` bytes from `offset`; shorter only at end of file
    async fn read_at(&self, path: &RemotePath, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Write all of `data` at `offset`, creating the file if needed
    async fn write_at(&self, path: &RemotePath, offset: u64, data: &[u8]) -> Result<()>;

    /// Cut the file to `len` bytes
    async fn truncate(&self, path: &RemotePath, len: u64) -> Result<()>;

    async fn close(&self);
}
