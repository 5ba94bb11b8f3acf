//! Connection Registry
//!
//! Single source of truth for which connections exist and which session
//! backs each one.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  ConnectionRegistry                                      │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │  ConnectionEntry                                    │  │
//! │  │  ├── config: ConnectionConfig (no secrets)         │  │
//! │  │  ├── session: Arc<Session>                         │  │
//! │  │  ├── reconnect: shared outcome of the attempt      │  │
//! │  │  └── heartbeat_task: Option<JoinHandle>            │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │  CredentialVault (secret per connection id)              │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Reconnect policy
//!
//! - Nothing reconnects on its own; the heartbeat only marks sessions Failed
//! - At most one handshake is in flight per connection; concurrent callers
//!   of [`ConnectionRegistry::reconnect`] join it and observe the same outcome

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::session::{handshake, Session, SessionLimits, SessionState};
use super::transport::{Connector, PingResult};
use crate::config::{
    AuthKind, ConnectionConfig, ConnectionId, Credential, CredentialVault, EngineConfig,
};
use crate::error::{Error, Result};

/// Consecutive keepalive timeouts before a session is marked Failed
const HEARTBEAT_FAIL_THRESHOLD: u32 = 2;

/// Connection snapshot for display
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthKind,
    pub state: SessionState,
    pub reconnecting: bool,
    pub created_at: DateTime<Utc>,
}

type ReconnectOutcome = Option<Result<()>>;

pub struct ConnectionEntry {
    pub id: ConnectionId,
    config: RwLock<ConnectionConfig>,
    auth: AuthKind,
    session: RwLock<Arc<Session>>,
    /// Receiver of the in-flight reconnect attempt, if any
    reconnect: Mutex<Option<watch::Receiver<ReconnectOutcome>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    pub created_at: DateTime<Utc>,
}

impl ConnectionEntry {
    pub fn config(&self) -> ConnectionConfig {
        self.config.read().clone()
    }

    pub fn session(&self) -> Arc<Session> {
        self.session.read().clone()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnect.lock().is_some()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn replace_session(&self, session: Arc<Session>) -> Arc<Session> {
        std::mem::replace(&mut *self.session.write(), session)
    }

    pub fn to_info(&self) -> ConnectionInfo {
        let config = self.config.read();
        ConnectionInfo {
            id: self.id,
            name: config.name.clone(),
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            auth: self.auth,
            state: self.session().state(),
            reconnecting: self.is_reconnecting(),
            created_at: self.created_at,
        }
    }

    fn cancel_heartbeat(&self) {
        if let Some(task) = self.heartbeat_task.lock().take() {
            task.abort();
        }
    }
}

pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionEntry>>,
    connector: Arc<dyn Connector>,
    vault: CredentialVault,
    config: EngineConfig,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn Connector>, config: EngineConfig) -> Self {
        Self {
            connections: DashMap::new(),
            connector,
            vault: CredentialVault::new(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Connect and register. On failure nothing is registered.
    pub async fn open(&self, config: ConnectionConfig, credential: Credential) -> Result<ConnectionId> {
        self.open_with_id(ConnectionId::new(), config, credential).await
    }

    /// Like [`open`](Self::open) under a caller-chosen id (saved connections)
    pub async fn open_with_id(
        &self,
        id: ConnectionId,
        config: ConnectionConfig,
        credential: Credential,
    ) -> Result<ConnectionId> {
        config.validate()?;
        credential.validate()?;
        if self.connections.contains_key(&id) {
            return Err(Error::InvalidState(format!("connection {} is already open", id)));
        }

        let session =
            match Session::connect(id, self.connector.as_ref(), &config, &credential, &self.config)
                .await
            {
                Ok(session) => session,
                Err(e) => {
                    warn!("Connection to {} failed: {}", config.target(), e);
                    return Err(e);
                }
            };

        let entry = Arc::new(ConnectionEntry {
            id,
            auth: credential.kind(),
            config: RwLock::new(config),
            session: RwLock::new(session),
            reconnect: Mutex::new(None),
            heartbeat_task: Mutex::new(None),
            closed: AtomicBool::new(false),
            created_at: Utc::now(),
        });

        self.vault.store(id, credential);
        self.connections.insert(id, entry.clone());
        self.start_heartbeat(&entry);

        info!("Connection {} registered ({})", id, entry.config().target());
        Ok(id)
    }

    /// Close the session and forget the connection. Idempotent.
    pub async fn close(&self, id: &ConnectionId) -> bool {
        let Some((_, entry)) = self.connections.remove(id) else {
            debug!("Close on unknown connection {}", id);
            return false;
        };

        entry.closed.store(true, Ordering::SeqCst);
        entry.cancel_heartbeat();
        entry.session().close().await;
        self.vault.remove(id);
        info!("Connection {} closed", id);
        true
    }

    pub async fn close_all(&self) {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| *e.key()).collect();
        info!("Closing {} connections", ids.len());
        for id in ids {
            self.close(&id).await;
        }
    }

    pub fn get_connection(&self, id: &ConnectionId) -> Result<Arc<ConnectionEntry>> {
        self.connections
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::UnknownConnection(id.to_string()))
    }

    /// The Ready session of a connection.
    ///
    /// A Failed session reports `ConnectionLost` until a reconnect succeeds.
    pub fn get_session(&self, id: &ConnectionId) -> Result<Arc<Session>> {
        let session = self.get_connection(id)?.session();
        if session.state().is_terminal() {
            return Err(Error::ConnectionLost(format!(
                "connection {} lost; reconnect required",
                id
            )));
        }
        Ok(session)
    }

    pub fn get_info(&self, id: &ConnectionId) -> Result<ConnectionInfo> {
        Ok(self.get_connection(id)?.to_info())
    }

    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> =
            self.connections.iter().map(|e| e.value().to_info()).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    /// Update the display name only
    pub fn rename_connection(&self, id: &ConnectionId, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::InvalidConfig("connection name is required".into()));
        }
        let entry = self.get_connection(id)?;
        entry.config.write().name = name.to_string();
        debug!("Connection {} renamed to {:?}", id, name);
        Ok(())
    }

    /// Round-trip on the current session; false when it is not usable
    pub async fn health_check(&self, id: &ConnectionId) -> Result<bool> {
        let session = self.get_connection(id)?.session();
        Ok(session.health_check().await)
    }

    /// Re-run the handshake for a connection.
    ///
    /// A Ready session is reauthenticated in place; a Failed one is replaced.
    /// Concurrent callers share one attempt.
    pub async fn reconnect(self: &Arc<Self>, id: &ConnectionId) -> Result<()> {
        let entry = self.get_connection(id)?;

        let mut outcome_rx = {
            let mut slot = entry.reconnect.lock();
            match slot.as_ref() {
                Some(rx) => {
                    debug!("Joining in-flight reconnect for connection {}", id);
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx.clone());

                    let registry = Arc::clone(self);
                    let entry = entry.clone();
                    tokio::spawn(async move {
                        let outcome = registry.run_reconnect(&entry).await;
                        // a caller that finds the slot empty must also find the outcome sent
                        let mut slot = entry.reconnect.lock();
                        let _ = tx.send(Some(outcome));
                        *slot = None;
                    });
                    rx
                }
            }
        };

        let outcome = match outcome_rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(Error::ConnectionLost(format!(
                "reconnect of {} was aborted",
                id
            )))
        })
    }

    async fn run_reconnect(&self, entry: &ConnectionEntry) -> Result<()> {
        let id = entry.id;
        let credential = self
            .vault
            .checkout(&id)
            .ok_or_else(|| Error::Auth(format!("no credential held for connection {}", id)))?;
        let config = entry.config();
        let current = entry.session();
        let reauth = current.begin_reauth().is_ok();

        info!(
            "Reconnecting {} ({}, session {:?})",
            id,
            config.target(),
            current.state()
        );

        let transport = match handshake(
            self.connector.as_ref(),
            &config,
            &credential,
            self.config.connect_timeout(),
        )
        .await
        {
            Ok(transport) => transport,
            Err(e) => {
                if reauth {
                    current.abort_reauth();
                }
                error!("Reconnect of {} failed: {}", id, e);
                return Err(e);
            }
        };
        drop(credential);

        if entry.is_closed() {
            transport.disconnect().await;
            return Err(Error::UnknownConnection(id.to_string()));
        }

        if reauth && current.complete_reauth(transport.clone()).await.is_ok() {
            info!("Connection {} reauthenticated", id);
            return Ok(());
        }

        let session = Session::new(id, transport, SessionLimits::from(&self.config));
        session.mark_ready();
        let old = entry.replace_session(session);
        old.close().await;
        info!("Connection {} reconnected with a new session", id);
        Ok(())
    }

    /// Periodic keepalive. Marks the session Failed on I/O error or repeated
    /// timeouts; never reconnects.
    fn start_heartbeat(&self, entry: &Arc<ConnectionEntry>) {
        let Some(interval) = self.config.heartbeat_interval() else {
            return;
        };
        let weak: Weak<ConnectionEntry> = Arc::downgrade(entry);
        let id = entry.id;

        let task = tokio::spawn(async move {
            // Stagger connections opened together
            let jitter = rand::random::<u64>() % 250;
            tokio::time::sleep(Duration::from_millis(jitter)).await;

            debug!(
                "Heartbeat started for connection {} ({:?}, jitter {}ms)",
                id, interval, jitter
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            let mut failures = 0u32;

            loop {
                ticker.tick().await;
                let Some(entry) = weak.upgrade() else { break };
                if entry.is_closed() {
                    break;
                }

                let session = entry.session();
                if !session.is_ready() || entry.is_reconnecting() {
                    failures = 0;
                    continue;
                }

                match session.ping().await {
                    PingResult::Ok => failures = 0,
                    PingResult::IoError => {
                        error!("Connection {} link down", id);
                        failures = 0;
                    }
                    PingResult::Timeout => {
                        failures += 1;
                        warn!(
                            "Connection {} heartbeat timeout ({}/{})",
                            id, failures, HEARTBEAT_FAIL_THRESHOLD
                        );
                        if failures >= HEARTBEAT_FAIL_THRESHOLD {
                            session.fail("heartbeat timed out");
                            failures = 0;
                        }
                    }
                }
            }
            debug!("Heartbeat stopped for connection {}", id);
        });

        *entry.heartbeat_task.lock() = Some(task);
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        for entry in self.connections.iter() {
            entry.cancel_heartbeat();
        }
    }
}
