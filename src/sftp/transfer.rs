//! Transfer Manager
//!
//! Chunked, resumable uploads and downloads with progress, pause, cancel
//! and bounded retry.
//!
//! # Task lifecycle
//!
//! ```text
//!            ┌──────── pause ───────┐
//!            ▼                      │
//! Queued ─► Active ─► Completed     │
//!   │         │  └──► Failed ──► retry ─► Queued
//!   │         └─────► Cancelled ─► retry ─► Queued
//!   └──── pause ────► Paused ─► resume ─► Queued
//! ```
//!
//! A *run* is one pass from Queued until the task parks (Paused) or reaches a
//! terminal state; every run that ends terminally emits exactly one terminal
//! event. `bytes_transferred` only ever advances by confirmed chunks, and a
//! paused or cancelled destination is truncated back to it.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{broadcast, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cache::ListingCache;
use super::path::RemotePath;
use super::retry::{backoff_or_cancel, calculate_backoff, is_retryable_error};
use super::types::{EntryKind, TransferDirection, TransferEvent, TransferState, TransferTask};
use crate::config::{ConnectionId, TransferConfig};
use crate::error::{Error, Result};
use crate::ssh::connection_registry::ConnectionRegistry;
use crate::ssh::session::ChannelLease;

const EVENT_CAPACITY: usize = 1024;

/// Transfer control signals
#[derive(Debug)]
pub struct TransferControl {
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    /// Independent from cancellation
    pause_tx: watch::Sender<bool>,
    pause_rx: watch::Receiver<bool>,
}

impl TransferControl {
    pub fn new() -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (pause_tx, pause_rx) = watch::channel(false);
        Self {
            cancel_tx,
            cancel_rx,
            pause_tx,
            pause_rx,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_rx.borrow()
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn pause(&self) {
        let _ = self.pause_tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.pause_tx.send(false);
    }

    pub fn subscribe_cancellation(&self) -> watch::Receiver<bool> {
        self.cancel_rx.clone()
    }

    pub fn subscribe_pause(&self) -> watch::Receiver<bool> {
        self.pause_rx.clone()
    }
}

impl Default for TransferControl {
    fn default() -> Self {
        Self::new()
    }
}

/// How a run ended
#[derive(Debug)]
enum RunEnd {
    Completed,
    Paused,
    Cancelled,
    Failed(Error),
}

/// Resolves once the flag behind `rx` is raised
async fn raised(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Resolves on cancel or pause, cancel first
async fn interrupted(control: &TransferControl) -> RunEnd {
    let mut cancel_rx = control.subscribe_cancellation();
    let mut pause_rx = control.subscribe_pause();
    tokio::select! {
        biased;
        _ = raised(&mut cancel_rx) => RunEnd::Cancelled,
        _ = raised(&mut pause_rx) => RunEnd::Paused,
    }
}

/// RAII permit that decrements the active count on drop
struct TransferPermit {
    _permit: OwnedSemaphorePermit,
    active_count: Arc<AtomicUsize>,
}

impl Drop for TransferPermit {
    fn drop(&mut self) {
        let result = self
            .active_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if result.is_err() {
            warn!("TransferPermit dropped with active_count already 0");
        }
    }
}

struct SlotInner {
    task: TransferTask,
    control: Arc<TransferControl>,
    /// A run currently owns the task
    running: bool,
    finished_at: Option<Instant>,
}

struct TransferSlot {
    id: String,
    connection: ConnectionId,
    direction: TransferDirection,
    local_path: PathBuf,
    remote_path: RemotePath,
    inner: Mutex<SlotInner>,
}

impl TransferSlot {
    fn snapshot(&self) -> TransferTask {
        self.inner.lock().task.clone()
    }

    fn confirmed_offset(&self) -> u64 {
        self.inner.lock().task.bytes_transferred
    }
}

fn event_of(task: &TransferTask) -> TransferEvent {
    TransferEvent {
        task_id: task.id.clone(),
        bytes_transferred: task.bytes_transferred,
        bytes_total: task.bytes_total,
        state: task.state,
        error: task.error.clone(),
    }
}

pub struct TransferManager {
    registry: Arc<ConnectionRegistry>,
    listings: Arc<ListingCache>,
    config: TransferConfig,
    semaphore: Arc<Semaphore>,
    active_count: Arc<AtomicUsize>,
    tasks: DashMap<String, Arc<TransferSlot>>,
    events: broadcast::Sender<TransferEvent>,
}

impl TransferManager {
    /// `listings` is the cache shared with the filesystem engine; every upload
    /// run drops the entries it may have made stale when it ends.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        config: TransferConfig,
        listings: Arc<ListingCache>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry,
            listings,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            active_count: Arc::new(AtomicUsize::new(0)),
            tasks: DashMap::new(),
            events,
            config,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    fn chunk_size(&self) -> usize {
        self.config.chunk_size.max(1)
    }

    /// Transfers currently moving bytes
    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::Acquire)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Task creation
    // ═══════════════════════════════════════════════════════════════════════════

    /// Queue an upload; returns at once with the Queued task
    pub async fn upload(
        self: &Arc<Self>,
        connection: ConnectionId,
        local_path: impl Into<PathBuf>,
        remote_path: RemotePath,
    ) -> Result<TransferTask> {
        let local_path = local_path.into();
        self.registry.get_connection(&connection)?;

        let metadata = tokio::fs::metadata(&local_path)
            .await
            .map_err(|e| Error::local_io(local_path.display().to_string(), e))?;
        if metadata.is_dir() {
            return Err(Error::IsADirectory(local_path.display().to_string()));
        }

        Ok(self.enqueue(
            connection,
            TransferDirection::Upload,
            local_path,
            remote_path,
            metadata.len(),
        ))
    }

    /// Queue a download; the size is learned when the transfer starts
    pub async fn download(
        self: &Arc<Self>,
        connection: ConnectionId,
        remote_path: RemotePath,
        local_path: impl Into<PathBuf>,
    ) -> Result<TransferTask> {
        self.registry.get_connection(&connection)?;
        Ok(self.enqueue(
            connection,
            TransferDirection::Download,
            local_path.into(),
            remote_path,
            0,
        ))
    }

    fn enqueue(
        self: &Arc<Self>,
        connection: ConnectionId,
        direction: TransferDirection,
        local_path: PathBuf,
        remote_path: RemotePath,
        bytes_total: u64,
    ) -> TransferTask {
        self.purge_expired();

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let task = TransferTask {
            id: id.clone(),
            connection_id: connection.to_string(),
            direction,
            local_path: local_path.clone(),
            remote_path: remote_path.clone(),
            bytes_total,
            bytes_transferred: 0,
            state: TransferState::Queued,
            retry_count: 0,
            error: None,
            created_at: now,
            updated_at: now,
        };
        let control = Arc::new(TransferControl::new());
        let slot = Arc::new(TransferSlot {
            id: id.clone(),
            connection,
            direction,
            local_path,
            remote_path,
            inner: Mutex::new(SlotInner {
                task: task.clone(),
                control: control.clone(),
                running: true,
                finished_at: None,
            }),
        });

        self.tasks.insert(id.clone(), slot.clone());
        info!(
            "Queued {:?} {} ({} <-> {})",
            direction,
            id,
            task.local_path.display(),
            task.remote_path
        );
        self.spawn_run(slot, control);
        task
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════════

    fn slot(&self, id: &str) -> Result<Arc<TransferSlot>> {
        self.tasks
            .get(id)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::UnknownTransfer(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Result<TransferTask> {
        Ok(self.slot(id)?.snapshot())
    }

    /// Every tracked task, oldest first
    pub fn list(&self) -> Vec<TransferTask> {
        self.purge_expired();
        let mut tasks: Vec<TransferTask> = self.tasks.iter().map(|s| s.snapshot()).collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    /// All progress events of every task
    pub fn events(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Deliver the events of one task to `callback` until its next terminal
    /// event. A task that is already terminal yields its final state once.
    pub fn subscribe<F>(&self, id: &str, callback: F) -> Result<JoinHandle<()>>
    where
        F: Fn(TransferEvent) + Send + 'static,
    {
        let mut rx = self.events.subscribe();
        let snapshot = self.get(id)?;
        let task_id = id.to_string();

        Ok(tokio::spawn(async move {
            if snapshot.state.is_terminal() {
                callback(event_of(&snapshot));
                return;
            }
            loop {
                match rx.recv().await {
                    Ok(event) if event.task_id == task_id => {
                        let done = event.is_terminal();
                        callback(event);
                        if done {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Subscriber of {} skipped {} events", task_id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Control
    // ═══════════════════════════════════════════════════════════════════════════

    /// Stop at the next chunk boundary and release the transfer slot
    pub fn pause(&self, id: &str) -> Result<()> {
        let slot = self.slot(id)?;
        let inner = slot.inner.lock();
        let state = inner.task.state;
        match state {
            TransferState::Queued | TransferState::Active => {
                inner.control.pause();
                info!("Pausing transfer {}", id);
                Ok(())
            }
            TransferState::Paused => Ok(()),
            state => Err(Error::InvalidState(format!(
                "transfer {} is {:?}, cannot pause",
                id, state
            ))),
        }
    }

    pub fn resume(self: &Arc<Self>, id: &str) -> Result<()> {
        let slot = self.slot(id)?;
        let mut inner = slot.inner.lock();
        let state = inner.task.state;
        match state {
            TransferState::Paused if !inner.running => {
                let control = self.restart(&mut inner);
                info!("Resuming transfer {} at {}", id, inner.task.bytes_transferred);
                drop(inner);
                self.spawn_run(slot.clone(), control);
                Ok(())
            }
            TransferState::Queued | TransferState::Active if inner.control.is_paused() => {
                // the run has not parked yet; it picks the flag up itself
                inner.control.resume();
                Ok(())
            }
            state => Err(Error::InvalidState(format!(
                "transfer {} is {:?}, not paused",
                id, state
            ))),
        }
    }

    pub fn cancel(&self, id: &str) -> Result<()> {
        let slot = self.slot(id)?;
        let mut inner = slot.inner.lock();
        let state = inner.task.state;
        match state {
            TransferState::Queued | TransferState::Active => {
                inner.control.cancel();
                info!("Cancelling transfer {}", id);
                Ok(())
            }
            TransferState::Paused if inner.running => {
                inner.control.cancel();
                Ok(())
            }
            TransferState::Paused => {
                inner.control.cancel();
                inner.task.state = TransferState::Cancelled;
                inner.task.updated_at = Utc::now();
                inner.finished_at = Some(Instant::now());
                info!("Transfer {} cancelled while paused", id);
                let _ = self.events.send(event_of(&inner.task));
                Ok(())
            }
            state => Err(Error::InvalidState(format!(
                "transfer {} is already {:?}",
                id, state
            ))),
        }
    }

    /// Cancel every unfinished transfer of a connection
    pub fn cancel_connection(&self, connection: &ConnectionId) -> usize {
        let ids: Vec<String> = self
            .tasks
            .iter()
            .filter(|s| s.connection == *connection)
            .map(|s| s.id.clone())
            .collect();
        ids.iter().filter(|id| self.cancel(id).is_ok()).count()
    }

    /// Re-queue a Failed or Cancelled task from its last confirmed offset
    pub fn retry(self: &Arc<Self>, id: &str) -> Result<TransferTask> {
        let slot = self.slot(id)?;
        let mut inner = slot.inner.lock();
        let state = inner.task.state;
        match state {
            TransferState::Failed | TransferState::Cancelled if !inner.running => {
                let control = self.restart(&mut inner);
                info!(
                    "Retrying transfer {} from offset {}",
                    id, inner.task.bytes_transferred
                );
                let task = inner.task.clone();
                drop(inner);
                self.spawn_run(slot.clone(), control);
                Ok(task)
            }
            state => Err(Error::InvalidState(format!(
                "transfer {} is {:?}, only failed or cancelled transfers can be retried",
                id, state
            ))),
        }
    }

    /// Forget a finished task
    pub fn acknowledge(&self, id: &str) -> Result<TransferTask> {
        let slot = self.slot(id)?;
        let task = slot.snapshot();
        if !task.state.is_terminal() {
            return Err(Error::InvalidState(format!(
                "transfer {} is {:?}, not finished",
                id, task.state
            )));
        }
        self.tasks.remove(id);
        debug!("Transfer {} acknowledged", id);
        Ok(task)
    }

    /// Drop Failed tasks whose retry window has passed
    pub fn purge_expired(&self) -> usize {
        let retention = self.config.failed_retention();
        let before = self.tasks.len();
        self.tasks.retain(|_, slot| {
            let inner = slot.inner.lock();
            let expired = inner.task.state == TransferState::Failed
                && inner
                    .finished_at
                    .is_some_and(|at| at.elapsed() >= retention);
            !expired
        });
        let purged = before.saturating_sub(self.tasks.len());
        if purged > 0 {
            debug!("Purged {} expired failed transfers", purged);
        }
        purged
    }

    /// New control for the next run; the caller spawns it
    fn restart(&self, inner: &mut SlotInner) -> Arc<TransferControl> {
        let control = Arc::new(TransferControl::new());
        inner.control = control.clone();
        inner.running = true;
        inner.finished_at = None;
        inner.task.error = None;
        inner.task.state = TransferState::Queued;
        inner.task.updated_at = Utc::now();
        let _ = self.events.send(event_of(&inner.task));
        control
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Runs
    // ═══════════════════════════════════════════════════════════════════════════

    fn spawn_run(self: &Arc<Self>, slot: Arc<TransferSlot>, control: Arc<TransferControl>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run(slot, control).await;
        });
    }

    async fn run(self: Arc<Self>, slot: Arc<TransferSlot>, control: Arc<TransferControl>) {
        let permit = tokio::select! {
            biased;
            end = interrupted(&control) => {
                self.finish(&slot, &control, end);
                return;
            }
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => {
                    self.active_count.fetch_add(1, Ordering::SeqCst);
                    TransferPermit {
                        _permit: permit,
                        active_count: self.active_count.clone(),
                    }
                }
                Err(_) => {
                    let err = Error::InvalidState("transfer manager shut down".into());
                    self.finish(&slot, &control, RunEnd::Failed(err));
                    return;
                }
            },
        };

        let end = self.run_attempts(&slot, &control).await;
        drop(permit);
        self.finish(&slot, &control, end);
    }

    /// Attempts of one run, with backoff between retryable failures
    async fn run_attempts(&self, slot: &TransferSlot, control: &TransferControl) -> RunEnd {
        let retry = &self.config.retry;
        let mut cancel_rx = control.subscribe_cancellation();
        let mut failures = 0u32;

        loop {
            if control.is_cancelled() {
                return RunEnd::Cancelled;
            }
            if control.is_paused() {
                return RunEnd::Paused;
            }
            self.mark_active(slot);

            match self.attempt(slot, control).await {
                Ok(RunEnd::Paused) if !control.is_paused() && !control.is_cancelled() => continue,
                Ok(end) => return end,
                Err(e) if is_retryable_error(&e) && failures < retry.max_retries => {
                    let delay = calculate_backoff(failures, retry);
                    failures += 1;
                    {
                        let mut inner = slot.inner.lock();
                        inner.task.retry_count += 1;
                        inner.task.updated_at = Utc::now();
                    }
                    warn!(
                        "Transfer {} failed at offset {} (retry {}/{} in {:?}): {}",
                        slot.id,
                        slot.confirmed_offset(),
                        failures,
                        retry.max_retries,
                        delay,
                        e
                    );
                    if !backoff_or_cancel(delay, &mut cancel_rx, &slot.id).await {
                        return RunEnd::Cancelled;
                    }
                }
                Err(e) => return RunEnd::Failed(e),
            }
        }
    }

    async fn attempt(&self, slot: &TransferSlot, control: &TransferControl) -> Result<RunEnd> {
        let session = self.registry.get_session(&slot.connection)?;
        let lease = tokio::select! {
            biased;
            end = interrupted(control) => return Ok(end),
            lease = session.lease() => lease?,
        };
        match slot.direction {
            TransferDirection::Upload => self.upload_chunks(slot, control, &lease).await,
            TransferDirection::Download => self.download_chunks(slot, control, &lease).await,
        }
    }

    async fn upload_chunks(
        &self,
        slot: &TransferSlot,
        control: &TransferControl,
        lease: &ChannelLease,
    ) -> Result<RunEnd> {
        let remote = &slot.remote_path;
        let local_name = slot.local_path.display().to_string();
        let local_err = |e| Error::local_io(local_name.clone(), e);

        let mut file = tokio::fs::File::open(&slot.local_path).await.map_err(local_err)?;
        let total = file.metadata().await.map_err(local_err)?.len();

        let mut offset = slot.confirmed_offset().min(total);
        if offset > 0 {
            match lease.call(|ch| ch.stat(remote)).await {
                Ok(entry) if entry.kind == EntryKind::File && entry.size >= offset => {
                    lease.call(|ch| ch.truncate(remote, offset)).await?;
                }
                Ok(_) | Err(Error::NotFound(_)) => {
                    warn!(
                        "Destination {} no longer holds {} bytes, restarting upload {}",
                        remote, offset, slot.id
                    );
                    offset = 0;
                }
                Err(e) => return Err(e),
            }
        }
        if offset == 0 {
            lease.call(|ch| ch.create(remote)).await?;
        }
        self.report_progress(slot, offset, total);
        file.seek(SeekFrom::Start(offset)).await.map_err(local_err)?;

        let chunk_size = self.chunk_size();
        let mut buf = vec![0u8; chunk_size];
        while offset < total {
            let len = (total - offset).min(chunk_size as u64) as usize;
            file.read_exact(&mut buf[..len]).await.map_err(local_err)?;
            let chunk = &buf[..len];

            let written = tokio::select! {
                biased;
                end = interrupted(control) => Err(end),
                result = lease.call(|ch| ch.write_at(remote, offset, chunk)) => Ok(result),
            };
            match written {
                Ok(result) => result?,
                Err(end) => {
                    // a write abandoned mid-flight may still land; cut it off
                    if let Err(e) = lease.call(|ch| ch.truncate(remote, offset)).await {
                        warn!("Could not truncate {} to {}: {}", remote, offset, e);
                    }
                    return Ok(end);
                }
            }

            offset += len as u64;
            self.report_progress(slot, offset, total);
        }

        Ok(RunEnd::Completed)
    }

    async fn download_chunks(
        &self,
        slot: &TransferSlot,
        control: &TransferControl,
        lease: &ChannelLease,
    ) -> Result<RunEnd> {
        let remote = &slot.remote_path;
        let local_name = slot.local_path.display().to_string();
        let local_err = |e| Error::local_io(local_name.clone(), e);

        let entry = lease.call(|ch| ch.stat(remote)).await?;
        if entry.is_dir() {
            return Err(Error::IsADirectory(remote.to_string()));
        }
        let total = entry.size;

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&slot.local_path)
            .await
            .map_err(local_err)?;
        let local_len = file.metadata().await.map_err(local_err)?.len();

        let mut offset = slot.confirmed_offset();
        if offset > total || offset > local_len {
            warn!("Download {} cannot resume at {}, restarting", slot.id, offset);
            offset = 0;
        }
        file.set_len(offset).await.map_err(local_err)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(local_err)?;
        self.report_progress(slot, offset, total);

        let chunk_size = self.chunk_size();
        loop {
            let read = tokio::select! {
                biased;
                end = interrupted(control) => Err(end),
                result = lease.call(|ch| ch.read_at(remote, offset, chunk_size)) => Ok(result),
            };
            let chunk = match read {
                Ok(result) => result?,
                Err(end) => {
                    file.flush().await.map_err(local_err)?;
                    return Ok(end);
                }
            };
            if chunk.is_empty() {
                break;
            }

            file.write_all(&chunk).await.map_err(local_err)?;
            offset += chunk.len() as u64;
            self.report_progress(slot, offset, total.max(offset));
            if chunk.len() < chunk_size {
                break;
            }
        }

        file.flush().await.map_err(local_err)?;
        Ok(RunEnd::Completed)
    }

    fn mark_active(&self, slot: &TransferSlot) {
        let mut inner = slot.inner.lock();
        if inner.task.state != TransferState::Active {
            debug!("Transfer {} active", slot.id);
            inner.task.state = TransferState::Active;
            inner.task.updated_at = Utc::now();
            let _ = self.events.send(event_of(&inner.task));
        }
    }

    fn report_progress(&self, slot: &TransferSlot, offset: u64, total: u64) {
        let mut inner = slot.inner.lock();
        inner.task.bytes_transferred = offset;
        inner.task.bytes_total = total;
        inner.task.updated_at = Utc::now();
        let _ = self.events.send(event_of(&inner.task));
    }

    /// Record how a run ended and emit its event
    fn finish(self: &Arc<Self>, slot: &Arc<TransferSlot>, control: &Arc<TransferControl>, end: RunEnd) {
        let mut inner = slot.inner.lock();

        let end = match end {
            RunEnd::Paused if control.is_cancelled() => RunEnd::Cancelled,
            RunEnd::Paused if !control.is_paused() => {
                // resumed while the run was winding down
                inner.task.state = TransferState::Queued;
                inner.task.updated_at = Utc::now();
                let _ = self.events.send(event_of(&inner.task));
                drop(inner);
                self.spawn_run(slot.clone(), control.clone());
                return;
            }
            other => other,
        };

        if slot.direction == TransferDirection::Upload {
            self.listings.invalidate(slot.connection, &slot.remote_path);
        }
        inner.running = false;
        inner.task.updated_at = Utc::now();
        match end {
            RunEnd::Completed => {
                inner.task.state = TransferState::Completed;
                inner.finished_at = Some(Instant::now());
                info!(
                    "Transfer {} completed: {} bytes",
                    slot.id, inner.task.bytes_transferred
                );
            }
            RunEnd::Paused => {
                inner.task.state = TransferState::Paused;
                info!(
                    "Transfer {} paused at {}/{}",
                    slot.id, inner.task.bytes_transferred, inner.task.bytes_total
                );
            }
            RunEnd::Cancelled => {
                inner.task.state = TransferState::Cancelled;
                inner.finished_at = Some(Instant::now());
                info!(
                    "Transfer {} cancelled at {}/{}",
                    slot.id, inner.task.bytes_transferred, inner.task.bytes_total
                );
            }
            RunEnd::Failed(e) => {
                error!("Transfer {} failed: {}", slot.id, e);
                inner.task.state = TransferState::Failed;
                inner.task.error = Some(e);
                inner.finished_at = Some(Instant::now());
            }
        }
        let _ = self.events.send(event_of(&inner.task));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{ConnectionConfig, Credential, EngineConfig};
    use crate::error::ErrorKind;
    use crate::sftp::retry::RetryConfig;
    use crate::ssh::memory::MemoryConnector;

    fn p(raw: &str) -> RemotePath {
        RemotePath::parse(raw).unwrap()
    }

    fn transfer_config(chunk_size: usize, max_retries: u32) -> TransferConfig {
        TransferConfig {
            chunk_size,
            max_concurrent: 2,
            retry: RetryConfig::new(max_retries).with_backoff(1, 1.0, 1),
            failed_retention_secs: 600,
        }
    }

    async fn setup(config: TransferConfig) -> (MemoryConnector, Arc<TransferManager>, ConnectionId) {
        let connector = MemoryConnector::new();
        connector.fs().add_dir("/upload").unwrap();
        let engine = EngineConfig {
            heartbeat_interval_secs: 0,
            ..EngineConfig::default()
        };
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(connector.clone()), engine));
        let id = registry
            .open(
                ConnectionConfig::new("t", "memory", 22, "u"),
                Credential::password("pw"),
            )
            .await
            .unwrap();
        let listings = Arc::new(ListingCache::new(Duration::ZERO));
        (connector, Arc::new(TransferManager::new(registry, config, listings)), id)
    }

    async fn wait_for_state(manager: &TransferManager, id: &str, state: TransferState) -> TransferTask {
        for _ in 0..400 {
            let task = manager.get(id).unwrap();
            if task.state == state {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("transfer {} never reached {:?}", id, state);
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_upload_completes_with_single_terminal_event() {
        let (connector, manager, conn) = setup(transfer_config(16, 3)).await;
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("data.bin");
        std::fs::write(&local, payload(100)).unwrap();

        let task = manager.upload(conn, &local, p("/upload/data.bin")).await.unwrap();
        assert_eq!(task.state, TransferState::Queued);
        assert_eq!(task.bytes_total, 100);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let handle = manager
            .subscribe(&task.id, move |e| sink.lock().push(e))
            .unwrap();
        handle.await.unwrap();

        let done = manager.get(&task.id).unwrap();
        assert_eq!(done.state, TransferState::Completed);
        assert_eq!(done.percentage(), 100.0);
        assert_eq!(connector.fs().read("/upload/data.bin").unwrap(), payload(100));

        let events = events.lock();
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_download_completes() {
        let (connector, manager, conn) = setup(transfer_config(7, 3)).await;
        connector.fs().add_file("/upload/remote.txt", payload(50)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("remote.txt");

        let task = manager.download(conn, p("/upload/remote.txt"), &local).await.unwrap();
        let done = wait_for_state(&manager, &task.id, TransferState::Completed).await;
        assert_eq!(done.bytes_transferred, 50);
        assert_eq!(done.bytes_total, 50);
        assert_eq!(std::fs::read(&local).unwrap(), payload(50));
    }

    #[tokio::test]
    async fn test_chunk_failures_are_retried() {
        let (connector, manager, conn) = setup(transfer_config(8, 3)).await;
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a.bin");
        std::fs::write(&local, payload(40)).unwrap();

        connector.fail_next_writes(2);
        let task = manager.upload(conn, &local, p("/upload/a.bin")).await.unwrap();
        let done = wait_for_state(&manager, &task.id, TransferState::Completed).await;
        assert_eq!(done.retry_count, 2);
        assert_eq!(connector.fs().read("/upload/a.bin").unwrap(), payload(40));
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_then_retry_resumes() {
        let (connector, manager, conn) = setup(transfer_config(8, 1)).await;
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("b.bin");
        std::fs::write(&local, payload(40)).unwrap();

        connector.fail_next_writes(5);
        let task = manager.upload(conn, &local, p("/upload/b.bin")).await.unwrap();
        let failed = wait_for_state(&manager, &task.id, TransferState::Failed).await;
        assert_eq!(failed.error.as_ref().map(Error::kind), Some(ErrorKind::Protocol));
        assert_eq!(failed.retry_count, 1);

        connector.fail_next_writes(0);
        manager.retry(&task.id).unwrap();
        wait_for_state(&manager, &task.id, TransferState::Completed).await;
        assert_eq!(connector.fs().read("/upload/b.bin").unwrap(), payload(40));
    }

    #[tokio::test]
    async fn test_pause_truncates_and_resume_finishes() {
        let (connector, manager, conn) = setup(transfer_config(4, 3)).await;
        connector.set_latency(Duration::from_millis(5));
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("c.bin");
        std::fs::write(&local, payload(200)).unwrap();

        let task = manager.upload(conn, &local, p("/upload/c.bin")).await.unwrap();
        for _ in 0..400 {
            if manager.get(&task.id).unwrap().bytes_transferred >= 12 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        manager.pause(&task.id).unwrap();
        let paused = wait_for_state(&manager, &task.id, TransferState::Paused).await;
        assert!(paused.bytes_transferred < 200);
        assert_eq!(paused.bytes_transferred % 4, 0);
        let remote = connector.fs().read("/upload/c.bin").unwrap();
        assert_eq!(remote.len() as u64, paused.bytes_transferred);
        assert_eq!(manager.active_count(), 0);

        manager.resume(&task.id).unwrap();
        wait_for_state(&manager, &task.id, TransferState::Completed).await;
        assert_eq!(connector.fs().read("/upload/c.bin").unwrap(), payload(200));
    }

    #[tokio::test]
    async fn test_cancel_paused_task() {
        let (connector, manager, conn) = setup(transfer_config(4, 3)).await;
        connector.set_latency(Duration::from_millis(5));
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("d.bin");
        std::fs::write(&local, payload(200)).unwrap();

        let task = manager.upload(conn, &local, p("/upload/d.bin")).await.unwrap();
        manager.pause(&task.id).unwrap();
        wait_for_state(&manager, &task.id, TransferState::Paused).await;

        manager.cancel(&task.id).unwrap();
        assert_eq!(manager.get(&task.id).unwrap().state, TransferState::Cancelled);
        assert!(matches!(manager.cancel(&task.id), Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_control_errors() {
        let (_connector, manager, conn) = setup(transfer_config(8, 0)).await;
        assert!(matches!(manager.get("nope"), Err(Error::UnknownTransfer(_))));

        let missing = manager
            .upload(conn, "/definitely/not/here.bin", p("/upload/x"))
            .await
            .unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::LocalIo);

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("e.bin");
        std::fs::write(&local, b"tiny").unwrap();
        let task = manager.upload(conn, &local, p("/upload/e.bin")).await.unwrap();
        wait_for_state(&manager, &task.id, TransferState::Completed).await;

        assert!(matches!(manager.retry(&task.id), Err(Error::InvalidState(_))));
        assert!(matches!(manager.pause(&task.id), Err(Error::InvalidState(_))));
        assert_eq!(manager.acknowledge(&task.id).unwrap().state, TransferState::Completed);
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn test_missing_remote_fails_without_retry() {
        let (_connector, manager, conn) = setup(transfer_config(8, 3)).await;
        let dir = tempfile::tempdir().unwrap();
        let task = manager
            .download(conn, p("/upload/absent"), dir.path().join("absent"))
            .await
            .unwrap();
        let failed = wait_for_state(&manager, &task.id, TransferState::Failed).await;
        assert_eq!(failed.retry_count, 0);
        assert_eq!(failed.error.map(|e| e.kind()), Some(ErrorKind::NotFound));
    }
}
