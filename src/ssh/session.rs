//! Transport Session
//!
//! One authenticated connection plus a bounded pool of SFTP channels.
//!
//! # State machine
//!
//! ```text
//! Connecting ──► Ready ◄──► Reauthenticating
//!     │            │               │
//!     └────────────┴───────────────┴──► Closed | Failed   (exactly once)
//! ```
//!
//! Every operation runs inside [`Session::guard`], which races it against
//! the session's failure fence: when the session turns Failed or Closed all
//! in-flight operations resolve to `ConnectionLost` at once. A
//! `ConnectionLost` produced by an operation trips the fence itself.
//!
//! # Backpressure
//!
//! At most `max_inflight_ops` operations hold an admission permit; up to
//! `max_queue_depth` more wait for one, beyond that callers get `Overloaded`.
//! Channels are capped at `max_channels` and recycled between operations.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::transport::{Connector, PingResult, RemoteChannel, Transport};
use crate::config::{ConnectionConfig, ConnectionId, Credential, EngineConfig};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Ready,
    Reauthenticating,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// Per-session limits, taken from [`EngineConfig`]
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub max_inflight_ops: usize,
    pub max_queue_depth: usize,
    pub max_channels: usize,
    pub op_timeout: Duration,
}

impl From<&EngineConfig> for SessionLimits {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_inflight_ops: config.max_inflight_ops,
            max_queue_depth: config.max_queue_depth,
            max_channels: config.max_channels,
            op_timeout: config.op_timeout(),
        }
    }
}

/// Handshake with a timeout; a timeout is a `Network` error.
pub async fn handshake(
    connector: &dyn Connector,
    config: &ConnectionConfig,
    credential: &Credential,
    timeout: Duration,
) -> Result<Arc<dyn Transport>> {
    match tokio::time::timeout(timeout, connector.connect(config, credential)).await {
        Ok(result) => result.map_err(Error::during_handshake),
        Err(_) => Err(Error::Network(format!(
            "connection to {}:{} timed out after {}s",
            config.host,
            config.port,
            timeout.as_secs()
        ))),
    }
}

pub struct Session {
    id: ConnectionId,
    transport: RwLock<Arc<dyn Transport>>,
    /// Bumped on every transport swap; stale channels are not recycled
    generation: AtomicU64,
    state: Mutex<SessionState>,
    fence_tx: watch::Sender<Option<Error>>,
    limits: SessionLimits,
    admission: Arc<Semaphore>,
    waiting: AtomicUsize,
    channel_slots: Arc<Semaphore>,
    idle: Mutex<Vec<(u64, Box<dyn RemoteChannel>)>>,
}

impl Session {
    /// Connect and return a Ready session.
    pub async fn connect(
        id: ConnectionId,
        connector: &dyn Connector,
        config: &ConnectionConfig,
        credential: &Credential,
        engine: &EngineConfig,
    ) -> Result<Arc<Self>> {
        info!("Connecting session {} to {}", id, config.target());
        let transport = handshake(connector, config, credential, engine.connect_timeout()).await?;
        let session = Self::new(id, transport, SessionLimits::from(engine));
        session.mark_ready();
        info!("Session {} ready", id);
        Ok(session)
    }

    /// Wrap an authenticated transport. The session starts in `Connecting`.
    pub fn new(id: ConnectionId, transport: Arc<dyn Transport>, limits: SessionLimits) -> Arc<Self> {
        let (fence_tx, _) = watch::channel(None);
        let session = Arc::new(Self {
            id,
            transport: RwLock::new(transport.clone()),
            generation: AtomicU64::new(0),
            state: Mutex::new(SessionState::Connecting),
            fence_tx,
            admission: Arc::new(Semaphore::new(limits.max_inflight_ops)),
            waiting: AtomicUsize::new(0),
            channel_slots: Arc::new(Semaphore::new(limits.max_channels)),
            idle: Mutex::new(Vec::new()),
            limits,
        });
        session.watch_link(transport, 0);
        session
    }

    /// Trip the fence when the transport of `generation` reports a drop
    fn watch_link(self: &Arc<Self>, transport: Arc<dyn Transport>, generation: u64) {
        let mut dropped = transport.subscribe_disconnect();
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            let _ = dropped.recv().await;
            if let Some(session) = session.upgrade() {
                if session.generation.load(Ordering::SeqCst) == generation {
                    session.fail("transport disconnected");
                }
            }
        });
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Ready | SessionState::Reauthenticating
        )
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    /// Operations currently holding an admission permit
    pub fn inflight(&self) -> usize {
        self.limits.max_inflight_ops - self.admission.available_permits()
    }

    /// Operations waiting for admission
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Channels currently leased
    pub fn open_channels(&self) -> usize {
        self.limits.max_channels - self.channel_slots.available_permits()
    }

    /// Connecting -> Ready once the transport is authenticated
    pub fn mark_ready(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Connecting {
            debug!("Session {} state Connecting -> Ready", self.id);
            *state = SessionState::Ready;
        }
    }

    /// Error every operation fails with once the session is terminal
    fn fence_error(&self) -> Option<Error> {
        self.fence_tx.borrow().clone()
    }

    fn terminate(&self, next: SessionState, error: Error) -> bool {
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return false;
            }
            *state = next;
        }
        self.fence_tx.send_replace(Some(error));
        self.idle.lock().clear();
        true
    }

    /// Mark the session Failed and fail everything in flight
    pub fn fail(&self, reason: &str) {
        if self.terminate(
            SessionState::Failed,
            Error::ConnectionLost(format!("session {} failed: {}", self.id, reason)),
        ) {
            warn!("Session {} failed: {}", self.id, reason);
        }
    }

    /// Close the session; idempotent
    pub async fn close(&self) {
        if self.terminate(
            SessionState::Closed,
            Error::ConnectionLost(format!("session {} closed", self.id)),
        ) {
            info!("Closing session {}", self.id);
            let transport = self.transport.read().clone();
            transport.disconnect().await;
        }
    }

    /// Ready -> Reauthenticating. Fails unless the session is Ready.
    pub fn begin_reauth(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != SessionState::Ready {
            return Err(Error::InvalidState(format!(
                "session {} is {:?}, cannot reauthenticate",
                self.id, *state
            )));
        }
        *state = SessionState::Reauthenticating;
        info!("Session {} reauthenticating", self.id);
        Ok(())
    }

    /// Swap in a fresh transport and return to Ready
    pub async fn complete_reauth(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Result<()> {
        let old = {
            let mut state = self.state.lock();
            if *state != SessionState::Reauthenticating {
                return Err(Error::InvalidState(format!(
                    "session {} is {:?}, not reauthenticating",
                    self.id, *state
                )));
            }
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            self.idle.lock().clear();
            let old = std::mem::replace(&mut *self.transport.write(), transport.clone());
            *state = SessionState::Ready;
            self.watch_link(transport, generation);
            old
        };
        old.disconnect().await;
        info!("Session {} reauthenticated", self.id);
        Ok(())
    }

    /// Reauthentication failed; the old link is still in place
    pub fn abort_reauth(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Reauthenticating {
            *state = SessionState::Ready;
        }
    }

    /// Keepalive round-trip. An `IoError` fails the session.
    pub async fn ping(&self) -> PingResult {
        if !self.is_ready() {
            return PingResult::IoError;
        }
        let transport = self.transport.read().clone();
        let result = transport.ping().await;
        match result {
            PingResult::Ok => {}
            PingResult::Timeout => warn!("Session {} keepalive timed out", self.id),
            PingResult::IoError => self.fail("keepalive failed"),
        }
        result
    }

    /// Lightweight round-trip, used before issuing a batch
    pub async fn health_check(&self) -> bool {
        self.ping().await == PingResult::Ok
    }

    /// Run `fut` against the fence and the operation timeout.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let mut fence_rx = self.fence_tx.subscribe();
        if let Some(err) = self.fence_error() {
            return Err(err);
        }

        let result = tokio::select! {
            result = tokio::time::timeout(self.limits.op_timeout, fut) => match result {
                Ok(result) => result,
                Err(_) => Err(Error::ConnectionLost(format!(
                    "operation timed out after {}s",
                    self.limits.op_timeout.as_secs()
                ))),
            },
            err = fenced(&mut fence_rx) => Err(err),
        };

        if let Err(Error::ConnectionLost(reason)) = &result {
            self.fail(reason);
        }
        result
    }

    /// Wait for an admission permit, bounded by the queue depth
    async fn admit(&self) -> Result<OwnedSemaphorePermit> {
        if let Some(err) = self.fence_error() {
            return Err(err);
        }
        if let Ok(permit) = self.admission.clone().try_acquire_owned() {
            return Ok(permit);
        }

        let queued = self.waiting.fetch_add(1, Ordering::SeqCst);
        let _waiting = WaitingGuard(&self.waiting);
        if queued >= self.limits.max_queue_depth {
            warn!(
                "Session {} overloaded: {} operations already waiting",
                self.id, queued
            );
            return Err(Error::Overloaded { queued });
        }

        let mut fence_rx = self.fence_tx.subscribe();
        tokio::select! {
            permit = self.admission.clone().acquire_owned() => {
                permit.map_err(|_| Error::ConnectionLost(format!("session {} closed", self.id)))
            }
            err = fenced(&mut fence_rx) => Err(err),
        }
    }

    /// Admit one operation and lease it a channel, waiting for a free slot.
    pub async fn lease(self: &Arc<Self>) -> Result<ChannelLease> {
        let admission = self.admit().await?;

        let mut fence_rx = self.fence_tx.subscribe();
        let slot = tokio::select! {
            slot = self.channel_slots.clone().acquire_owned() => {
                slot.map_err(|_| Error::ConnectionLost(format!("session {} closed", self.id)))?
            }
            err = fenced(&mut fence_rx) => return Err(err),
        };

        self.checkout_channel(slot, Some(admission)).await
    }

    /// Open a channel now or fail with `ChannelLimitExceeded`.
    pub async fn open_channel(self: &Arc<Self>) -> Result<ChannelLease> {
        if let Some(err) = self.fence_error() {
            return Err(err);
        }
        let slot = self.channel_slots.clone().try_acquire_owned().map_err(|_| {
            Error::ChannelLimitExceeded {
                current: self.open_channels(),
                max: self.limits.max_channels,
            }
        })?;
        self.checkout_channel(slot, None).await
    }

    async fn checkout_channel(
        self: &Arc<Self>,
        slot: OwnedSemaphorePermit,
        admission: Option<OwnedSemaphorePermit>,
    ) -> Result<ChannelLease> {
        let generation = self.generation.load(Ordering::SeqCst);
        let recycled = {
            let mut idle = self.idle.lock();
            idle.retain(|(g, _)| *g == generation);
            idle.pop()
        };

        let channel = match recycled {
            Some((_, channel)) => channel,
            None => {
                let transport = self.transport.read().clone();
                let channel = self.guard(transport.open_channel()).await?;
                debug!("Session {} opened channel ({} leased)", self.id, self.open_channels());
                channel
            }
        };

        Ok(ChannelLease {
            session: self.clone(),
            channel: Some(channel),
            generation,
            _slot: slot,
            _admission: admission,
        })
    }

    fn recycle(&self, generation: u64, channel: Box<dyn RemoteChannel>) {
        if self.is_ready() && self.generation.load(Ordering::SeqCst) == generation {
            self.idle.lock().push((generation, channel));
        }
    }
}

/// Resolves with the fence error once the session is terminal
async fn fenced(fence_rx: &mut watch::Receiver<Option<Error>>) -> Error {
    loop {
        let current = fence_rx.borrow_and_update().clone();
        if let Some(err) = current {
            return err;
        }
        if fence_rx.changed().await.is_err() {
            return Error::ConnectionLost("session dropped".to_string());
        }
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One channel borrowed for the lifetime of an operation or task.
///
/// Dropping the lease returns the channel to the session's idle pool and
/// frees its slot.
pub struct ChannelLease {
    session: Arc<Session>,
    channel: Option<Box<dyn RemoteChannel>>,
    generation: u64,
    _slot: OwnedSemaphorePermit,
    _admission: Option<OwnedSemaphorePermit>,
}

impl ChannelLease {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Run one request on the leased channel under the session guard
    pub async fn call<'a, T, F, Fut>(&'a self, f: F) -> Result<T>
    where
        F: FnOnce(&'a dyn RemoteChannel) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let channel = self
            .channel
            .as_deref()
            .ok_or_else(|| Error::InvalidState("channel already released".into()))?;
        self.session.guard(f(channel)).await
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            self.session.recycle(self.generation, channel);
        }
    }
}
