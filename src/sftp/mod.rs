//! SFTP file management module
//!
//! Remote path and permission models, the filesystem operations engine, the
//! resumable transfer manager and the russh-sftp channel they run on.

pub mod cache;
pub mod channel;
pub mod engine;
pub mod path;
pub mod permissions;
pub mod retry;
pub mod transfer;
pub mod types;

pub use cache::ListingCache;
pub use channel::SftpChannel;
pub use engine::FsEngine;
pub use path::RemotePath;
pub use permissions::{Access, Class, PermissionSet};
pub use retry::{calculate_backoff, is_retryable_error, RetryConfig};
pub use transfer::{TransferControl, TransferManager};
pub use types::*;
