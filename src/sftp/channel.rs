//! SFTP channel over russh-sftp
//!
//! Implements [`RemoteChannel`] on one `sftp` subsystem channel. Server status
//! codes are mapped onto the crate error taxonomy with the target path kept
//! for display.
//!
//! Chunked reads and writes against the same file reuse one open handle; any
//! other request touching that file closes it first.

use std::io::SeekFrom;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use russh::client::Msg;
use russh::Channel;
use russh_sftp::client::error::Error as SftpErrorInner;
use russh_sftp::client::fs::{File, Metadata};
use russh_sftp::client::SftpSession as RusshSftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags, StatusCode};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use super::path::RemotePath;
use super::permissions::PermissionSet;
use super::types::{EntryKind, RemoteEntry};
use crate::error::{Error, Result};
use crate::ssh::transport::RemoteChannel;

/// Map SFTP errors to our error type
pub(crate) fn map_sftp_error(err: SftpErrorInner, path: &RemotePath) -> Error {
    match err {
        SftpErrorInner::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => Error::NotFound(path.to_string()),
            StatusCode::PermissionDenied => Error::PermissionDenied(path.to_string()),
            StatusCode::NoConnection | StatusCode::ConnectionLost => {
                Error::ConnectionLost(format!("{}: {}", path, status.error_message))
            }
            StatusCode::OpUnsupported => {
                Error::Protocol(format!("{}: operation not supported by server", path))
            }
            _ => Error::Protocol(format!("{}: {}", path, status.error_message)),
        },
        SftpErrorInner::IO(msg) => Error::ConnectionLost(format!("{}: {}", path, msg)),
        SftpErrorInner::Timeout => {
            Error::ConnectionLost(format!("{}: no reply from SFTP server", path))
        }
        other => Error::Protocol(format!("{}: {}", path, other)),
    }
}

/// Errors surfaced through the `File` stream adapters
fn map_io_error(err: std::io::Error, path: &RemotePath) -> Error {
    match err.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound(path.to_string()),
        std::io::ErrorKind::PermissionDenied => Error::PermissionDenied(path.to_string()),
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset => {
            Error::ConnectionLost(format!("{}: {}", path, err))
        }
        _ => Error::Protocol(format!("{}: {}", path, err)),
    }
}

/// Attributes with every field unset except the ones filled in by the caller
fn blank_attributes() -> FileAttributes {
    FileAttributes {
        size: None,
        uid: None,
        user: None,
        gid: None,
        group: None,
        permissions: None,
        atime: None,
        mtime: None,
        ..FileAttributes::default()
    }
}

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;

pub(crate) fn entry_from_metadata(path: RemotePath, metadata: &Metadata) -> RemoteEntry {
    let kind = match metadata.permissions.unwrap_or(0) & S_IFMT {
        S_IFDIR => EntryKind::Directory,
        S_IFLNK => EntryKind::Symlink,
        _ => EntryKind::File,
    };
    let modified_at = metadata
        .mtime
        .and_then(|t| DateTime::<Utc>::from_timestamp(i64::from(t), 0))
        .unwrap_or_default();

    RemoteEntry {
        name: path.file_name().unwrap_or("/").to_string(),
        path,
        kind,
        size: metadata.size.unwrap_or(0),
        modified_at,
        mode: PermissionSet::from_mode(metadata.permissions.unwrap_or(0)),
    }
}

struct OpenHandle {
    path: RemotePath,
    writable: bool,
    file: File,
}

/// Decrements the transport's open channel count on drop
pub(crate) struct ChannelCounter(Arc<AtomicUsize>);

impl ChannelCounter {
    pub(crate) fn acquire(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count.clone())
    }
}

impl Drop for ChannelCounter {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SftpChannel {
    sftp: RusshSftpSession,
    handle: Mutex<Option<OpenHandle>>,
    _counter: ChannelCounter,
}

impl SftpChannel {
    /// Start the `sftp` subsystem on a freshly opened session channel
    pub(crate) async fn open(
        channel: Channel<Msg>,
        counter: ChannelCounter,
        request_timeout_secs: u64,
    ) -> Result<Self> {
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| Error::Protocol(format!("Failed to request SFTP subsystem: {}", e)))?;

        let sftp = RusshSftpSession::new(channel.into_stream())
            .await
            .map_err(|e| Error::Protocol(format!("SFTP subsystem not available: {}", e)))?;
        sftp.set_timeout(request_timeout_secs);

        debug!("SFTP subsystem opened");
        Ok(Self {
            sftp,
            handle: Mutex::new(None),
            _counter: counter,
        })
    }

    /// Close the cached handle if it refers to `path`
    async fn release(&self, path: &RemotePath) {
        let mut handle = self.handle.lock().await;
        if handle.as_ref().is_some_and(|h| h.path.starts_with(path)) {
            if let Some(mut open) = handle.take() {
                let _ = open.file.shutdown().await;
            }
        }
    }

    async fn handle_for<'a>(
        &self,
        slot: &'a mut Option<OpenHandle>,
        path: &RemotePath,
        writable: bool,
    ) -> Result<&'a mut File> {
        let reusable = slot
            .as_ref()
            .is_some_and(|h| &h.path == path && (h.writable || !writable));
        if !reusable {
            if let Some(mut stale) = slot.take() {
                let _ = stale.file.shutdown().await;
            }
            let file = if writable {
                self.sftp
                    .open_with_flags(
                        path.as_str(),
                        OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::READ,
                    )
                    .await
            } else {
                self.sftp.open(path.as_str()).await
            }
            .map_err(|e| map_sftp_error(e, path))?;
            trace!("Opened SFTP handle for {} (writable: {})", path, writable);
            *slot = Some(OpenHandle {
                path: path.clone(),
                writable,
                file,
            });
        }
        match slot.as_mut() {
            Some(open) => Ok(&mut open.file),
            None => Err(Error::Protocol(format!("{}: handle unavailable", path))),
        }
    }
}

#[async_trait]
impl RemoteChannel for SftpChannel {
    async fn stat(&self, path: &RemotePath) -> Result<RemoteEntry> {
        let metadata = self
            .sftp
            .symlink_metadata(path.as_str())
            .await
            .map_err(|e| map_sftp_error(e, path))?;
        Ok(entry_from_metadata(path.clone(), &metadata))
    }

    async fn read_dir(&self, path: &RemotePath) -> Result<Vec<RemoteEntry>> {
        let read_dir = self
            .sftp
            .read_dir(path.as_str())
            .await
            .map_err(|e| map_sftp_error(e, path))?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            match path.join(&name) {
                Ok(child) => entries.push(entry_from_metadata(child, &entry.metadata())),
                Err(e) => warn!("Skipping entry {:?} in {}: {}", name, path, e),
            }
        }
        Ok(entries)
    }

    async fn mkdir(&self, path: &RemotePath) -> Result<()> {
        self.sftp
            .create_dir(path.as_str())
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn rmdir(&self, path: &RemotePath) -> Result<()> {
        self.release(path).await;
        self.sftp
            .remove_dir(path.as_str())
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn remove_file(&self, path: &RemotePath) -> Result<()> {
        self.release(path).await;
        self.sftp
            .remove_file(path.as_str())
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn rename(&self, from: &RemotePath, to: &RemotePath) -> Result<()> {
        self.release(from).await;
        self.release(to).await;
        self.sftp
            .rename(from.as_str(), to.as_str())
            .await
            .map_err(|e| map_sftp_error(e, from))
    }

    async fn set_mode(&self, path: &RemotePath, mode: PermissionSet) -> Result<()> {
        let attrs = FileAttributes {
            permissions: Some(mode.mode()),
            ..blank_attributes()
        };
        self.sftp
            .set_metadata(path.as_str(), attrs)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn create(&self, path: &RemotePath) -> Result<()> {
        let mut slot = self.handle.lock().await;
        if let Some(mut stale) = slot.take() {
            let _ = stale.file.shutdown().await;
        }
        let file = self
            .sftp
            .create(path.as_str())
            .await
            .map_err(|e| map_sftp_error(e, path))?;
        *slot = Some(OpenHandle {
            path: path.clone(),
            writable: true,
            file,
        });
        Ok(())
    }

    async fn read_at(&self, path: &RemotePath, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut slot = self.handle.lock().await;
        let file = self.handle_for(&mut slot, path, false).await?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| map_io_error(e, path))?;

        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file
                .read(&mut buf[filled..])
                .await
                .map_err(|e| map_io_error(e, path))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    async fn write_at(&self, path: &RemotePath, offset: u64, data: &[u8]) -> Result<()> {
        let mut slot = self.handle.lock().await;
        let file = self.handle_for(&mut slot, path, true).await?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| map_io_error(e, path))?;
        file.write_all(data).await.map_err(|e| map_io_error(e, path))?;
        file.flush().await.map_err(|e| map_io_error(e, path))
    }

    async fn truncate(&self, path: &RemotePath, len: u64) -> Result<()> {
        self.release(path).await;
        let attrs = FileAttributes {
            size: Some(len),
            ..blank_attributes()
        };
        self.sftp
            .set_metadata(path.as_str(), attrs)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn close(&self) {
        if let Some(mut open) = self.handle.lock().await.take() {
            let _ = open.file.shutdown().await;
        }
        if let Err(e) = self.sftp.close().await {
            debug!("SFTP close: {}", e);
        }
    }
}
