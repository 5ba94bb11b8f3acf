//! Configuration Management Module
//!
//! Connection and engine settings, persistent storage of non-secret
//! connection metadata, and the in-memory credential vault.

pub mod storage;
pub mod types;
pub mod vault;

pub use storage::{config_dir, ConnectionStore, ConnectionsFile, SavedConnection};
pub use types::{
    AuthKind, ConnectionConfig, ConnectionId, EngineConfig, HostKeyPolicy, TransferConfig,
    CONFIG_VERSION,
};
pub use vault::{Credential, CredentialVault};
