//! CloudFM core - SSH/SFTP session manager and remote filesystem engine
//!
//! Built on russh and russh-sftp. The UI layer drives everything through
//! [`FileManager`]; the modules below are usable on their own.
//!
//! ```ignore
//! let manager = FileManager::new(EngineConfig::default())?;
//! let id = manager
//!     .connect(
//!         ConnectionConfig::new("prod", "files.example.com", 22, "deploy"),
//!         Credential::password(password),
//!     )
//!     .await?;
//! let entries = manager.list_directory(&id, &RemotePath::parse("/srv")?).await?;
//! ```

pub mod config;
pub mod error;
pub mod manager;
pub mod sftp;
pub mod ssh;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub use config::{ConnectionConfig, ConnectionId, Credential, EngineConfig};
pub use error::{Error, ErrorKind, Result};
pub use manager::{BatchOptions, FileManager};
pub use sftp::{
    BatchResult, ConflictPolicy, EntryKind, PermissionSet, RemoteEntry, RemotePath, TransferEvent,
    TransferState, TransferTask,
};

/// Install the global tracing subscriber (`RUST_LOG`, default `info`).
///
/// Returns `false` if a subscriber was already installed.
pub fn init_logging() -> bool {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
