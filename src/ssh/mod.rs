//! SSH module - connections, sessions and the transport seam
//!
//! # Features
//! - russh client with host key verification via `~/.ssh/known_hosts`
//! - Single-owner handle task, SFTP channels opened on demand
//! - Per-connection session with admission control and a channel pool
//! - Connection registry with heartbeat and single-flight reconnect
//! - In-memory transport for tests and offline use

mod client;
pub mod connection_registry;
mod handle_owner;
pub mod known_hosts;
pub mod memory;
pub mod session;
pub mod transport;

pub use client::{ClientHandler, SshConnector, SshTransport};
pub use connection_registry::{ConnectionEntry, ConnectionInfo, ConnectionRegistry};
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use known_hosts::{HostKeyVerification, KnownHostsStore};
pub use memory::{MemoryConnector, MemoryFs};
pub use session::{ChannelLease, Session, SessionLimits, SessionState};
pub use transport::{Connector, PingResult, RemoteChannel, Transport};
