//! Remote Filesystem Operations Engine
//!
//! Turns filesystem intents into channel requests against one [`Session`].
//! Every single operation (and every item of a batch) leases its own channel
//! for its duration, so a listing can run next to a transfer while the
//! session's admission limits apply to both.
//!
//! Batch operations never fail as a whole: they return one [`PathOutcome`]
//! per input path, in input order.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::ListingCache;
use super::path::RemotePath;
use super::permissions::PermissionSet;
use super::types::{BatchResult, ConflictPolicy, EntryKind, FileContent, PathOutcome, RemoteEntry};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::ssh::session::{ChannelLease, Session};
use crate::ssh::transport::PingResult;

pub struct FsEngine {
    cache: Arc<ListingCache>,
    conflict_policy: ConflictPolicy,
    read_limit: u64,
    chunk_size: usize,
}

impl FsEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            cache: Arc::new(ListingCache::new(config.listing_cache_ttl())),
            conflict_policy: config.conflict_policy,
            read_limit: config.read_limit_bytes,
            chunk_size: config.transfer.chunk_size.max(1),
        }
    }

    /// Policy used when a caller does not pick one
    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.conflict_policy
    }

    pub fn cache(&self) -> &Arc<ListingCache> {
        &self.cache
    }

    fn invalidate(&self, session: &Session, path: &RemotePath) {
        self.cache.invalidate(session.id(), path);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Single operations
    // ═══════════════════════════════════════════════════════════════════════════

    /// Entries of a directory, in no particular order
    pub async fn list(&self, session: &Arc<Session>, path: &RemotePath) -> Result<Vec<RemoteEntry>> {
        if let Some(entries) = self.cache.get(session.id(), path) {
            return Ok(entries);
        }

        let lease = session.lease().await?;
        let entry = lease.call(|ch| ch.stat(path)).await?;
        if entry.kind == EntryKind::File {
            return Err(Error::NotADirectory(path.to_string()));
        }
        let entries = read_dir_of(&lease, &entry).await?;
        debug!("Listed {} entries in {}", entries.len(), path);

        self.cache.put(session.id(), path, &entries);
        Ok(entries)
    }

    pub async fn stat(&self, session: &Arc<Session>, path: &RemotePath) -> Result<RemoteEntry> {
        let lease = session.lease().await?;
        lease.call(|ch| ch.stat(path)).await
    }

    pub async fn create_directory(&self, session: &Arc<Session>, path: &RemotePath) -> Result<()> {
        let lease = session.lease().await?;
        if exists(&lease, path).await? {
            return Err(Error::AlreadyExists(path.to_string()));
        }
        lease.call(|ch| ch.mkdir(path)).await?;
        self.invalidate(session, path);
        info!("Created directory {}", path);
        Ok(())
    }

    /// Rename one entry. With [`ConflictPolicy::Reject`] an existing
    /// destination fails with `AlreadyExists`.
    pub async fn rename(
        &self,
        session: &Arc<Session>,
        from: &RemotePath,
        to: &RemotePath,
        policy: ConflictPolicy,
    ) -> Result<()> {
        let lease = session.lease().await?;
        lease.call(|ch| ch.stat(from)).await?;
        if from == to {
            return Ok(());
        }
        self.rename_on(&lease, from, to, policy).await?;
        info!("Renamed {} to {}", from, to);
        Ok(())
    }

    async fn rename_on(
        &self,
        lease: &ChannelLease,
        from: &RemotePath,
        to: &RemotePath,
        policy: ConflictPolicy,
    ) -> Result<()> {
        if to.starts_with(from) {
            return Err(Error::InvalidPath(format!("cannot move {} into itself", from)));
        }
        if from.starts_with(to) {
            return Err(Error::InvalidPath(format!(
                "cannot replace {} with an entry inside it",
                to
            )));
        }
        self.clear_destination(lease, to, policy).await?;
        lease.call(|ch| ch.rename(from, to)).await?;
        self.invalidate(lease.session(), from);
        self.invalidate(lease.session(), to);
        Ok(())
    }

    /// Make room at `to` according to the conflict policy
    async fn clear_destination(
        &self,
        lease: &ChannelLease,
        to: &RemotePath,
        policy: ConflictPolicy,
    ) -> Result<()> {
        if !exists(lease, to).await? {
            return Ok(());
        }
        match policy {
            ConflictPolicy::Reject => Err(Error::AlreadyExists(to.to_string())),
            ConflictPolicy::Overwrite => {
                debug!("Overwriting existing {}", to);
                self.remove_tree(lease, to).await
            }
        }
    }

    /// Whole file content, refused above the configured read limit
    pub async fn read_file(&self, session: &Arc<Session>, path: &RemotePath) -> Result<FileContent> {
        let lease = session.lease().await?;
        let entry = lease.call(|ch| ch.stat(path)).await?;
        if entry.is_dir() {
            return Err(Error::IsADirectory(path.to_string()));
        }
        if entry.size > self.read_limit {
            return Err(Error::TooLarge {
                path: path.to_string(),
                size: entry.size,
                limit: self.read_limit,
            });
        }

        let mut data = Vec::with_capacity(entry.size as usize);
        loop {
            let chunk = lease
                .call(|ch| ch.read_at(path, data.len() as u64, self.chunk_size))
                .await?;
            let done = chunk.len() < self.chunk_size;
            data.extend_from_slice(&chunk);
            if data.len() as u64 > self.read_limit {
                return Err(Error::TooLarge {
                    path: path.to_string(),
                    size: data.len() as u64,
                    limit: self.read_limit,
                });
            }
            if done {
                break;
            }
        }

        debug!("Read {} bytes from {}", data.len(), path);
        Ok(FileContent {
            path: path.clone(),
            data,
            modified_at: entry.modified_at,
        })
    }

    /// Create or truncate `path` and write `data` to it
    pub async fn write_file(&self, session: &Arc<Session>, path: &RemotePath, data: &[u8]) -> Result<()> {
        let lease = session.lease().await?;
        lease.call(|ch| ch.create(path)).await?;
        for (index, chunk) in data.chunks(self.chunk_size).enumerate() {
            let offset = (index * self.chunk_size) as u64;
            lease.call(|ch| ch.write_at(path, offset, chunk)).await?;
        }
        self.invalidate(session, path);
        info!("Wrote {} bytes to {}", data.len(), path);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Batch operations
    // ═══════════════════════════════════════════════════════════════════════════

    /// Move each source into `dest_dir`, keeping its name
    pub async fn move_paths(
        &self,
        session: &Arc<Session>,
        sources: &[RemotePath],
        dest_dir: &RemotePath,
        policy: ConflictPolicy,
        cancel: &CancellationToken,
    ) -> BatchResult {
        let mut outcomes = Vec::with_capacity(sources.len());
        let fence = preflight(session).await;
        for source in sources {
            let result = match start_item(&fence, cancel, source) {
                Err(e) => Err(e),
                Ok(()) => self.move_one(session, source, dest_dir, policy).await,
            };
            outcomes.push(record("move", source, result));
        }
        BatchResult { outcomes }
    }

    async fn move_one(
        &self,
        session: &Arc<Session>,
        source: &RemotePath,
        dest_dir: &RemotePath,
        policy: ConflictPolicy,
    ) -> Result<()> {
        let target = destination_for(source, dest_dir)?;
        let lease = session.lease().await?;
        require_dir(&lease, dest_dir).await?;
        lease.call(|ch| ch.stat(source)).await?;
        if &target == source {
            return Ok(());
        }
        self.rename_on(&lease, source, &target, policy).await?;
        info!("Moved {} to {}", source, target);
        Ok(())
    }

    /// Copy each source into `dest_dir`, recursively for directories
    pub async fn copy_paths(
        &self,
        session: &Arc<Session>,
        sources: &[RemotePath],
        dest_dir: &RemotePath,
        policy: ConflictPolicy,
        cancel: &CancellationToken,
    ) -> BatchResult {
        let mut outcomes = Vec::with_capacity(sources.len());
        let fence = preflight(session).await;
        for source in sources {
            let result = match start_item(&fence, cancel, source) {
                Err(e) => Err(e),
                Ok(()) => self.copy_one(session, source, dest_dir, policy, cancel).await,
            };
            outcomes.push(record("copy", source, result));
        }
        BatchResult { outcomes }
    }

    async fn copy_one(
        &self,
        session: &Arc<Session>,
        source: &RemotePath,
        dest_dir: &RemotePath,
        policy: ConflictPolicy,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let target = destination_for(source, dest_dir)?;
        if &target == source || target.starts_with(source) {
            return Err(Error::InvalidPath(format!(
                "cannot copy {} onto or into itself",
                source
            )));
        }
        if source.starts_with(&target) {
            return Err(Error::InvalidPath(format!(
                "cannot replace {} with an entry inside it",
                target
            )));
        }

        let lease = session.lease().await?;
        require_dir(&lease, dest_dir).await?;
        let entry = lease.call(|ch| ch.stat(source)).await?;
        if entry.kind == EntryKind::Symlink {
            return Err(Error::Protocol(format!("{}: copying symlinks is not supported", source)));
        }
        self.clear_destination(&lease, &target, policy).await?;

        self.copy_tree(&lease, &entry, &target, cancel).await?;
        self.invalidate(session, &target);
        info!("Copied {} to {}", source, target);
        Ok(())
    }

    async fn copy_tree(
        &self,
        lease: &ChannelLease,
        entry: &RemoteEntry,
        target: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match entry.kind {
            EntryKind::Symlink => {
                warn!("Skipping symlink {} during copy", entry.path);
                Ok(())
            }
            EntryKind::File => self.copy_file(lease, &entry.path, target, cancel).await,
            EntryKind::Directory => {
                lease.call(|ch| ch.mkdir(target)).await?;
                lease.call(|ch| ch.set_mode(target, entry.mode)).await?;
                let children = lease.call(|ch| ch.read_dir(&entry.path)).await?;
                for child in children {
                    let child_target = target.join(&child.name)?;
                    Box::pin(self.copy_tree(lease, &child, &child_target, cancel)).await?;
                }
                Ok(())
            }
        }
    }

    /// Stream one file chunk by chunk. A cancel mid-file removes the partial copy.
    async fn copy_file(
        &self,
        lease: &ChannelLease,
        source: &RemotePath,
        target: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<()> {
        lease.call(|ch| ch.create(target)).await?;
        let mut offset = 0u64;
        loop {
            if cancel.is_cancelled() {
                if let Err(e) = lease.call(|ch| ch.remove_file(target)).await {
                    warn!("Could not remove partial copy {}: {}", target, e);
                }
                return Err(Error::Cancelled(format!("copy of {} cancelled", source)));
            }
            let chunk = lease
                .call(|ch| ch.read_at(source, offset, self.chunk_size))
                .await?;
            if chunk.is_empty() {
                break;
            }
            lease.call(|ch| ch.write_at(target, offset, &chunk)).await?;
            offset += chunk.len() as u64;
            if chunk.len() < self.chunk_size {
                break;
            }
        }
        debug!("Copied {} bytes {} -> {}", offset, source, target);
        Ok(())
    }

    /// Delete each path; directories are removed with their contents
    pub async fn delete(
        &self,
        session: &Arc<Session>,
        paths: &[RemotePath],
        cancel: &CancellationToken,
    ) -> BatchResult {
        let mut outcomes = Vec::with_capacity(paths.len());
        let fence = preflight(session).await;
        for path in paths {
            let result = match start_item(&fence, cancel, path) {
                Err(e) => Err(e),
                Ok(()) => self.delete_one(session, path).await,
            };
            outcomes.push(record("delete", path, result));
        }
        BatchResult { outcomes }
    }

    async fn delete_one(&self, session: &Arc<Session>, path: &RemotePath) -> Result<()> {
        if path.is_root() {
            return Err(Error::PermissionDenied("refusing to delete /".to_string()));
        }
        let lease = session.lease().await?;
        self.remove_tree(&lease, path).await?;
        info!("Deleted {}", path);
        Ok(())
    }

    /// Remove a file, symlink (not followed) or directory tree
    async fn remove_tree(&self, lease: &ChannelLease, path: &RemotePath) -> Result<()> {
        let entry = lease.call(|ch| ch.stat(path)).await?;
        if entry.is_dir() {
            let children = lease.call(|ch| ch.read_dir(path)).await?;
            for child in children {
                Box::pin(self.remove_tree(lease, &child.path)).await?;
            }
            lease.call(|ch| ch.rmdir(path)).await?;
        } else {
            lease.call(|ch| ch.remove_file(path)).await?;
        }
        self.invalidate(lease.session(), path);
        Ok(())
    }

    /// Apply `mode` to each path
    pub async fn set_permissions(
        &self,
        session: &Arc<Session>,
        paths: &[RemotePath],
        mode: PermissionSet,
        cancel: &CancellationToken,
    ) -> BatchResult {
        let mut outcomes = Vec::with_capacity(paths.len());
        let fence = preflight(session).await;
        for path in paths {
            let result = match start_item(&fence, cancel, path) {
                Err(e) => Err(e),
                Ok(()) => self.chmod_one(session, path, mode).await,
            };
            outcomes.push(record("chmod", path, result));
        }
        BatchResult { outcomes }
    }

    async fn chmod_one(&self, session: &Arc<Session>, path: &RemotePath, mode: PermissionSet) -> Result<()> {
        let lease = session.lease().await?;
        lease.call(|ch| ch.stat(path)).await?;
        lease.call(|ch| ch.set_mode(path, mode)).await?;
        self.invalidate(session, path);
        debug!("Set mode {} on {}", mode.to_octal(), path);
        Ok(())
    }
}

/// Round-trip before a batch, so a silently dropped link fails every item
/// at once instead of one timeout per item.
async fn preflight(session: &Session) -> Option<Error> {
    match session.ping().await {
        PingResult::IoError => Some(Error::ConnectionLost(format!(
            "session {} is not usable",
            session.id()
        ))),
        PingResult::Ok | PingResult::Timeout => None,
    }
}

fn start_item(fence: &Option<Error>, cancel: &CancellationToken, path: &RemotePath) -> Result<()> {
    if let Some(err) = fence {
        return Err(err.clone());
    }
    if cancel.is_cancelled() {
        return Err(Error::Cancelled(format!("{}: batch cancelled before start", path)));
    }
    Ok(())
}

fn record(op: &str, path: &RemotePath, result: Result<()>) -> PathOutcome {
    match result {
        Ok(()) => PathOutcome::success(path.clone()),
        Err(e) => {
            warn!("{} {} failed: {}", op, path, e);
            PathOutcome::failure(path.clone(), e)
        }
    }
}

fn destination_for(source: &RemotePath, dest_dir: &RemotePath) -> Result<RemotePath> {
    let name = source
        .file_name()
        .ok_or_else(|| Error::InvalidPath("the root directory cannot be moved or copied".into()))?;
    dest_dir.join(name)
}

async fn exists(lease: &ChannelLease, path: &RemotePath) -> Result<bool> {
    match lease.call(|ch| ch.stat(path)).await {
        Ok(_) => Ok(true),
        Err(Error::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

async fn require_dir(lease: &ChannelLease, path: &RemotePath) -> Result<()> {
    let entry = lease.call(|ch| ch.stat(path)).await?;
    match entry.kind {
        EntryKind::File => Err(Error::NotADirectory(path.to_string())),
        EntryKind::Symlink => read_dir_of(lease, &entry).await.map(|_| ()),
        EntryKind::Directory => Ok(()),
    }
}

/// Read a directory whose entry came from `stat`. Servers answer opendir on a
/// link to a non-directory with a bare failure status.
async fn read_dir_of(lease: &ChannelLease, entry: &RemoteEntry) -> Result<Vec<RemoteEntry>> {
    let path = &entry.path;
    match lease.call(|ch| ch.read_dir(path)).await {
        Err(Error::Protocol(_)) if entry.kind == EntryKind::Symlink => {
            Err(Error::NotADirectory(path.to_string()))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{ConnectionConfig, ConnectionId, Credential};
    use crate::error::ErrorKind;
    use crate::ssh::memory::{MemoryConnector, MemoryFs};

    fn p(raw: &str) -> RemotePath {
        RemotePath::parse(raw).unwrap()
    }

    fn engine_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.transfer.chunk_size = 4;
        config
    }

    async fn setup() -> (MemoryConnector, Arc<Session>, FsEngine) {
        let fs = Arc::new(MemoryFs::new());
        fs.add_file("/home/user/a.txt", "alpha").unwrap();
        fs.add_file("/home/user/b.txt", "bravo").unwrap();
        fs.add_file("/home/user/docs/readme.md", "read me please").unwrap();
        fs.add_dir("/home/user/empty").unwrap();
        let connector = MemoryConnector::with_fs(fs);
        let config = engine_config();
        let session = Session::connect(
            ConnectionId::new(),
            &connector,
            &ConnectionConfig::new("t", "memory", 22, "u"),
            &Credential::password("pw"),
            &config,
        )
        .await
        .unwrap();
        (connector, session, FsEngine::new(&config))
    }

    #[tokio::test]
    async fn test_list_and_not_a_directory() {
        let (_c, session, engine) = setup().await;
        let mut names: Vec<_> = engine
            .list(&session, &p("/home/user"))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "b.txt", "docs", "empty"]);

        let err = engine.list(&session, &p("/home/user/a.txt")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotADirectory);
        let err = engine.list(&session, &p("/nope")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_mutation_invalidates_listing() {
        let (_c, session, engine) = setup().await;
        assert_eq!(engine.list(&session, &p("/home/user/empty")).await.unwrap().len(), 0);
        engine
            .write_file(&session, &p("/home/user/empty/new.txt"), b"x")
            .await
            .unwrap();
        assert_eq!(engine.list(&session, &p("/home/user/empty")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_directory_twice() {
        let (_c, session, engine) = setup().await;
        engine.create_directory(&session, &p("/home/user/new")).await.unwrap();
        let err = engine
            .create_directory(&session, &p("/home/user/new/"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_rename_conflict_policy() {
        let (connector, session, engine) = setup().await;
        let (a, b) = (p("/home/user/a.txt"), p("/home/user/b.txt"));

        let err = engine
            .rename(&session, &a, &b, ConflictPolicy::Reject)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(connector.fs().read("/home/user/b.txt").unwrap(), b"bravo");

        engine
            .rename(&session, &a, &b, ConflictPolicy::Overwrite)
            .await
            .unwrap();
        assert!(!connector.fs().exists("/home/user/a.txt"));
        assert_eq!(connector.fs().read("/home/user/b.txt").unwrap(), b"alpha");

        let err = engine
            .rename(&session, &p("/missing"), &p("/other"), ConflictPolicy::Reject)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_move_batch_partial_failure() {
        let (connector, session, engine) = setup().await;
        let sources = [p("/home/user/a.txt"), p("/home/user/missing"), p("/home/user/docs")];
        let result = engine
            .move_paths(
                &session,
                &sources,
                &p("/home/user/empty"),
                ConflictPolicy::Reject,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.len(), 3);
        assert_eq!(result.failed(), 1);
        assert_eq!(result.outcomes[1].error_kind(), Some(ErrorKind::NotFound));
        assert!(connector.fs().exists("/home/user/empty/a.txt"));
        assert!(connector.fs().exists("/home/user/empty/docs/readme.md"));
    }

    #[tokio::test]
    async fn test_move_directory_into_itself() {
        let (_c, session, engine) = setup().await;
        let result = engine
            .move_paths(
                &session,
                &[p("/home/user/docs")],
                &p("/home/user/docs"),
                ConflictPolicy::Reject,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.outcomes[0].error_kind(), Some(ErrorKind::InvalidPath));
    }

    #[tokio::test]
    async fn test_copy_is_recursive_and_chunked() {
        let (connector, session, engine) = setup().await;
        let result = engine
            .copy_paths(
                &session,
                &[p("/home/user/docs"), p("/home/user/b.txt")],
                &p("/home/user/empty"),
                ConflictPolicy::Reject,
                &CancellationToken::new(),
            )
            .await;
        assert!(result.all_succeeded());
        assert_eq!(
            connector.fs().read("/home/user/empty/docs/readme.md").unwrap(),
            b"read me please"
        );
        assert_eq!(connector.fs().read("/home/user/empty/b.txt").unwrap(), b"bravo");
        assert!(connector.fs().exists("/home/user/docs/readme.md"));

        let again = engine
            .copy_paths(
                &session,
                &[p("/home/user/b.txt")],
                &p("/home/user/empty"),
                ConflictPolicy::Reject,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(again.outcomes[0].error_kind(), Some(ErrorKind::AlreadyExists));
    }

    #[tokio::test]
    async fn test_cancelled_batch_skips_unstarted_items() {
        let (connector, session, engine) = setup().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = engine
            .delete(&session, &[p("/home/user/a.txt"), p("/home/user/b.txt")], &cancel)
            .await;
        assert_eq!(result.failed(), 2);
        assert!(result
            .outcomes
            .iter()
            .all(|o| o.error_kind() == Some(ErrorKind::Cancelled)));
        assert!(connector.fs().exists("/home/user/a.txt"));
    }

    #[tokio::test]
    async fn test_delete_recursive_and_locked() {
        let (connector, session, engine) = setup().await;
        connector.fs().lock("/home/user/b.txt").unwrap();
        let result = engine
            .delete(
                &session,
                &[p("/home/user/docs"), p("/home/user/b.txt"), p("/home/user/a.txt")],
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.succeeded(), 2);
        assert_eq!(result.outcomes[1].error_kind(), Some(ErrorKind::PermissionDenied));
        assert!(!connector.fs().exists("/home/user/docs"));
        assert!(!connector.fs().exists("/home/user/a.txt"));
    }

    #[tokio::test]
    async fn test_set_permissions_per_path() {
        let (connector, session, engine) = setup().await;
        let mode = PermissionSet::parse_octal("750").unwrap();
        let result = engine
            .set_permissions(
                &session,
                &[p("/home/user/a.txt"), p("/ghost")],
                mode,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.succeeded(), 1);
        assert_eq!(connector.fs().mode("/home/user/a.txt"), Some(mode));
    }

    #[tokio::test]
    async fn test_read_file_limits() {
        let (_c, session, mut engine) = setup().await;
        let content = engine.read_file(&session, &p("/home/user/docs/readme.md")).await.unwrap();
        assert_eq!(content.data, b"read me please");

        let err = engine.read_file(&session, &p("/home/user/docs")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IsADirectory);

        engine.read_limit = 3;
        let err = engine.read_file(&session, &p("/home/user/a.txt")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TooLarge);
    }

    #[tokio::test]
    async fn test_dropped_link_fails_whole_batch() {
        let (connector, session, engine) = setup().await;
        connector.drop_links();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let result = engine
            .delete(
                &session,
                &[p("/home/user/a.txt"), p("/home/user/b.txt")],
                &CancellationToken::new(),
            )
            .await;
        assert!(result
            .outcomes
            .iter()
            .all(|o| o.error_kind() == Some(ErrorKind::ConnectionLost)));
    }

    #[tokio::test]
    async fn test_overwrite_never_clears_an_ancestor_of_the_source() {
        let (connector, session, engine) = setup().await;
        let fs = connector.fs();
        fs.add_file("/home/user/x/x", "moved").unwrap();
        fs.add_file("/home/user/y/y", "copied").unwrap();
        fs.add_file("/home/user/z/inner.txt", "renamed").unwrap();
        let cancel = CancellationToken::new();

        let moved = engine
            .move_paths(
                &session,
                &[p("/home/user/x/x")],
                &p("/home/user"),
                ConflictPolicy::Overwrite,
                &cancel,
            )
            .await;
        assert_eq!(moved.outcomes[0].error_kind(), Some(ErrorKind::InvalidPath));
        assert_eq!(fs.read("/home/user/x/x"), Some(b"moved".to_vec()));

        let copied = engine
            .copy_paths(
                &session,
                &[p("/home/user/y/y")],
                &p("/home/user"),
                ConflictPolicy::Overwrite,
                &cancel,
            )
            .await;
        assert_eq!(copied.outcomes[0].error_kind(), Some(ErrorKind::InvalidPath));
        assert_eq!(fs.read("/home/user/y/y"), Some(b"copied".to_vec()));

        let err = engine
            .rename(&session, &p("/home/user/z/inner.txt"), &p("/home/user/z"), ConflictPolicy::Overwrite)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPath);
        assert_eq!(fs.read("/home/user/z/inner.txt"), Some(b"renamed".to_vec()));
    }

    #[tokio::test]
    async fn test_symlink_to_file_is_not_a_directory() {
        let (connector, session, engine) = setup().await;
        connector.fs().add_symlink("/home/user/to-file", "/home/user/a.txt").unwrap();
        connector.fs().add_symlink("/home/user/to-docs", "docs").unwrap();

        let err = engine.list(&session, &p("/home/user/to-file")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotADirectory);

        let names: Vec<_> = engine
            .list(&session, &p("/home/user/to-docs"))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["readme.md".to_string()]);

        let result = engine
            .copy_paths(
                &session,
                &[p("/home/user/b.txt")],
                &p("/home/user/to-file"),
                ConflictPolicy::Reject,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.outcomes[0].error_kind(), Some(ErrorKind::NotADirectory));
    }
}
