//! File manager facade
//!
//! The boundary the UI talks to. Each method resolves the connection through
//! the registry, then hands the call to the operations engine or the transfer
//! manager. Remote paths arrive already normalized as [`RemotePath`];
//! `RemotePath::parse` is the place raw strings are rejected.
//!
//! Batch methods return `Err` only when the connection itself cannot be
//! resolved. Per-item failures are reported in the [`BatchResult`].

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{
    ConnectionConfig, ConnectionId, ConnectionStore, Credential, EngineConfig, SavedConnection,
};
use crate::error::{Error, Result};
use crate::sftp::{
    BatchResult, ConflictPolicy, FileContent, FsEngine, PermissionSet, RemoteEntry, RemotePath,
    TransferEvent, TransferManager, TransferTask,
};
use crate::ssh::{ConnectionInfo, ConnectionRegistry, Connector, SshConnector};

/// Per-call knobs for batch operations
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Overrides the configured conflict policy for move and copy
    pub conflict_policy: Option<ConflictPolicy>,
    /// Cancels the items of the batch that have not started yet
    pub cancel: CancellationToken,
}

impl BatchOptions {
    pub fn with_policy(policy: ConflictPolicy) -> Self {
        Self {
            conflict_policy: Some(policy),
            ..Self::default()
        }
    }
}

pub struct FileManager {
    registry: Arc<ConnectionRegistry>,
    engine: FsEngine,
    transfers: Arc<TransferManager>,
    store: Option<ConnectionStore>,
}

impl FileManager {
    /// Manager over real SSH connections
    pub fn new(config: EngineConfig) -> Result<Self> {
        let connector = Arc::new(SshConnector::new(&config));
        Self::with_connector(connector, config)
    }

    /// Manager over any transport, e.g. `ssh::MemoryConnector`
    pub fn with_connector(connector: Arc<dyn Connector>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let engine = FsEngine::new(&config);
        let transfer_config = config.transfer.clone();
        let registry = Arc::new(ConnectionRegistry::new(connector, config));
        let transfers = Arc::new(TransferManager::new(
            registry.clone(),
            transfer_config,
            engine.cache().clone(),
        ));
        Ok(Self {
            registry,
            engine,
            transfers,
            store: None,
        })
    }

    /// Persist saved connections in `store`
    pub fn with_store(mut self, store: ConnectionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        self.registry.config()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &FsEngine {
        &self.engine
    }

    pub fn transfers(&self) -> &Arc<TransferManager> {
        &self.transfers
    }

    fn store(&self) -> Result<&ConnectionStore> {
        self.store
            .as_ref()
            .ok_or_else(|| Error::Storage("no connection store configured".into()))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Connections
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn connect(
        &self,
        config: ConnectionConfig,
        credential: Credential,
    ) -> Result<ConnectionId> {
        self.registry.open(config, credential).await
    }

    /// Cancel the connection's transfers, then close it. Idempotent.
    pub async fn disconnect(&self, id: &ConnectionId) {
        let cancelled = self.transfers.cancel_connection(id);
        if cancelled > 0 {
            info!("Cancelled {} transfers of connection {}", cancelled, id);
        }
        self.engine.cache().invalidate_connection(*id);
        self.registry.close(id).await;
    }

    /// Close every connection
    pub async fn shutdown(&self) {
        for info in self.registry.list_connections() {
            self.disconnect(&info.id).await;
        }
    }

    /// Reconnect a connection whose session failed; concurrent callers share
    /// one attempt.
    pub async fn reconnect(&self, id: &ConnectionId) -> Result<()> {
        self.engine.cache().invalidate_connection(*id);
        self.registry.reconnect(id).await
    }

    pub async fn health_check(&self, id: &ConnectionId) -> Result<bool> {
        self.registry.health_check(id).await
    }

    pub fn connection_info(&self, id: &ConnectionId) -> Result<ConnectionInfo> {
        self.registry.get_info(id)
    }

    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        self.registry.list_connections()
    }

    /// Change the display name, in the registry and the saved copy if any
    pub async fn rename_connection(&self, id: &ConnectionId, name: &str) -> Result<()> {
        self.registry.rename_connection(id, name)?;
        if let Some(store) = &self.store {
            store.rename(id, name.trim()).await?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Saved connections
    // ═══════════════════════════════════════════════════════════════════════════

    /// Persist the metadata of an open connection. Secrets are not saved.
    pub async fn save_connection(&self, id: &ConnectionId) -> Result<SavedConnection> {
        let store = self.store()?;
        let entry = self.registry.get_connection(id)?;
        let saved = SavedConnection::new(*id, &entry.config(), entry.to_info().auth);
        store.upsert(saved.clone()).await?;
        info!("Saved connection {} ({})", id, saved.name);
        Ok(saved)
    }

    pub async fn saved_connections(&self) -> Result<Vec<SavedConnection>> {
        self.store()?.list().await
    }

    /// Open a saved connection under its saved id
    pub async fn connect_saved(
        &self,
        id: &ConnectionId,
        credential: Credential,
    ) -> Result<ConnectionId> {
        let saved = self
            .saved_connections()
            .await?
            .into_iter()
            .find(|c| &c.id == id)
            .ok_or_else(|| Error::UnknownConnection(id.to_string()))?;
        if saved.auth != credential.kind() {
            warn!(
                "Connection {} was saved with {:?} auth, connecting with {:?}",
                id,
                saved.auth,
                credential.kind()
            );
        }
        self.registry.open_with_id(saved.id, saved.config(), credential).await
    }

    pub async fn forget_connection(&self, id: &ConnectionId) -> Result<bool> {
        self.store()?.remove(id).await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Filesystem operations
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn list_directory(
        &self,
        id: &ConnectionId,
        path: &RemotePath,
    ) -> Result<Vec<RemoteEntry>> {
        let session = self.registry.get_session(id)?;
        self.engine.list(&session, path).await
    }

    pub async fn stat(&self, id: &ConnectionId, path: &RemotePath) -> Result<RemoteEntry> {
        let session = self.registry.get_session(id)?;
        self.engine.stat(&session, path).await
    }

    pub async fn create_directory(&self, id: &ConnectionId, path: &RemotePath) -> Result<()> {
        let session = self.registry.get_session(id)?;
        self.engine.create_directory(&session, path).await
    }

    /// Rename under the configured conflict policy
    pub async fn rename(&self, id: &ConnectionId, from: &RemotePath, to: &RemotePath) -> Result<()> {
        self.rename_with_policy(id, from, to, self.engine.conflict_policy())
            .await
    }

    pub async fn rename_with_policy(
        &self,
        id: &ConnectionId,
        from: &RemotePath,
        to: &RemotePath,
        policy: ConflictPolicy,
    ) -> Result<()> {
        let session = self.registry.get_session(id)?;
        self.engine.rename(&session, from, to, policy).await
    }

    fn policy(&self, options: &BatchOptions) -> ConflictPolicy {
        options
            .conflict_policy
            .unwrap_or_else(|| self.engine.conflict_policy())
    }

    pub async fn move_paths(
        &self,
        id: &ConnectionId,
        sources: &[RemotePath],
        dest_dir: &RemotePath,
        options: &BatchOptions,
    ) -> Result<BatchResult> {
        let session = self.registry.get_session(id)?;
        Ok(self
            .engine
            .move_paths(&session, sources, dest_dir, self.policy(options), &options.cancel)
            .await)
    }

    pub async fn copy_paths(
        &self,
        id: &ConnectionId,
        sources: &[RemotePath],
        dest_dir: &RemotePath,
        options: &BatchOptions,
    ) -> Result<BatchResult> {
        let session = self.registry.get_session(id)?;
        Ok(self
            .engine
            .copy_paths(&session, sources, dest_dir, self.policy(options), &options.cancel)
            .await)
    }

    pub async fn delete(
        &self,
        id: &ConnectionId,
        paths: &[RemotePath],
        options: &BatchOptions,
    ) -> Result<BatchResult> {
        let session = self.registry.get_session(id)?;
        Ok(self.engine.delete(&session, paths, &options.cancel).await)
    }

    pub async fn set_permissions(
        &self,
        id: &ConnectionId,
        paths: &[RemotePath],
        mode: PermissionSet,
        options: &BatchOptions,
    ) -> Result<BatchResult> {
        let session = self.registry.get_session(id)?;
        Ok(self
            .engine
            .set_permissions(&session, paths, mode, &options.cancel)
            .await)
    }

    /// Whole-file read for the editor, capped by `read_limit_bytes`
    pub async fn read_file(&self, id: &ConnectionId, path: &RemotePath) -> Result<FileContent> {
        let session = self.registry.get_session(id)?;
        self.engine.read_file(&session, path).await
    }

    pub async fn write_file(&self, id: &ConnectionId, path: &RemotePath, data: &[u8]) -> Result<()> {
        let session = self.registry.get_session(id)?;
        self.engine.write_file(&session, path, data).await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Transfers
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn start_upload(
        &self,
        id: &ConnectionId,
        local_path: impl Into<PathBuf>,
        remote_path: RemotePath,
    ) -> Result<TransferTask> {
        let task = self.transfers.upload(*id, local_path, remote_path.clone()).await?;
        self.engine.cache().invalidate(*id, &remote_path);
        Ok(task)
    }

    pub async fn start_download(
        &self,
        id: &ConnectionId,
        remote_path: RemotePath,
        local_path: impl Into<PathBuf>,
    ) -> Result<TransferTask> {
        self.transfers.download(*id, remote_path, local_path).await
    }

    /// Deliver the task's progress events to `callback` until its terminal event
    pub fn subscribe<F>(&self, task_id: &str, callback: F) -> Result<JoinHandle<()>>
    where
        F: Fn(TransferEvent) + Send + 'static,
    {
        self.transfers.subscribe(task_id, callback)
    }

    /// Events of every transfer
    pub fn transfer_events(&self) -> broadcast::Receiver<TransferEvent> {
        self.transfers.events()
    }

    pub fn get_transfer(&self, task_id: &str) -> Result<TransferTask> {
        self.transfers.get(task_id)
    }

    pub fn list_transfers(&self) -> Vec<TransferTask> {
        self.transfers.list()
    }

    pub fn pause_transfer(&self, task_id: &str) -> Result<()> {
        self.transfers.pause(task_id)
    }

    pub fn resume_transfer(&self, task_id: &str) -> Result<()> {
        self.transfers.resume(task_id)
    }

    pub fn cancel_transfer(&self, task_id: &str) -> Result<()> {
        self.transfers.cancel(task_id)
    }

    pub fn retry_transfer(&self, task_id: &str) -> Result<TransferTask> {
        self.transfers.retry(task_id)
    }

    /// Drop a finished task from the list
    pub fn acknowledge_transfer(&self, task_id: &str) -> Result<TransferTask> {
        self.transfers.acknowledge(task_id)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::config::AuthKind;
    use crate::ssh::MemoryConnector;

    fn engine() -> EngineConfig {
        EngineConfig {
            heartbeat_interval_secs: 0,
            ..EngineConfig::default()
        }
    }

    fn p(raw: &str) -> RemotePath {
        RemotePath::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = EngineConfig {
            max_inflight_ops: 0,
            ..engine()
        };
        let result = FileManager::with_connector(Arc::new(MemoryConnector::new()), config);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_saved_connection_round_trip() {
        let dir = tempdir().unwrap();
        let connector = MemoryConnector::new();
        let manager = FileManager::with_connector(Arc::new(connector.clone()), engine())
            .unwrap()
            .with_store(ConnectionStore::with_path(dir.path().join("connections.json")));

        let id = manager
            .connect(
                ConnectionConfig::new("prod", "files.example", 22, "deploy"),
                Credential::password("hunter2"),
            )
            .await
            .unwrap();
        let saved = manager.save_connection(&id).await.unwrap();
        assert_eq!(saved.auth, AuthKind::Password);

        manager.rename_connection(&id, "production").await.unwrap();
        let stored = manager.saved_connections().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name, "production");

        let on_disk = std::fs::read_to_string(dir.path().join("connections.json")).unwrap();
        assert!(!on_disk.contains("hunter2"));

        manager.disconnect(&id).await;
        assert!(manager.list_connections().is_empty());

        let reopened = manager
            .connect_saved(&id, Credential::password("hunter2"))
            .await
            .unwrap();
        assert_eq!(reopened, id);
        assert_eq!(manager.connection_info(&id).unwrap().name, "production");
        assert_eq!(connector.handshake_count(), 2);

        assert!(manager.forget_connection(&id).await.unwrap());
        assert!(manager.saved_connections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_without_store_is_storage_error() {
        let manager =
            FileManager::with_connector(Arc::new(MemoryConnector::new()), engine()).unwrap();
        let id = manager
            .connect(
                ConnectionConfig::new("dev", "localhost", 22, "me"),
                Credential::password("pw"),
            )
            .await
            .unwrap();
        assert!(matches!(manager.save_connection(&id).await, Err(Error::Storage(_))));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_transfers_and_fences_operations() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("payload.bin");
        std::fs::write(&local, vec![7u8; 4096]).unwrap();

        let connector = MemoryConnector::new();
        connector.set_latency(std::time::Duration::from_millis(5));
        let mut config = engine();
        config.transfer.chunk_size = 64;
        let manager = FileManager::with_connector(Arc::new(connector.clone()), config).unwrap();
        let id = manager
            .connect(
                ConnectionConfig::new("dev", "localhost", 22, "me"),
                Credential::password("pw"),
            )
            .await
            .unwrap();

        let task = manager.start_upload(&id, &local, p("/payload.bin")).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let watcher = manager
            .subscribe(&task.id, move |event| {
                let _ = tx.send(event);
            })
            .unwrap();
        while manager.get_transfer(&task.id).unwrap().bytes_transferred == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        manager.disconnect(&id).await;
        watcher.await.unwrap();

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        assert_eq!(last.unwrap().state, crate::sftp::TransferState::Cancelled);
        assert!(matches!(
            manager.list_directory(&id, &RemotePath::root()).await,
            Err(Error::UnknownConnection(_))
        ));
        assert!(manager.registry().vault().is_empty());
    }
}
