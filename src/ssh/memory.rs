//! In-memory transport
//!
//! A [`Connector`] backed by an in-process filesystem, used as a mock
//! backend and for tests. Fault injection covers the failure modes the
//! session layer has to survive: rejected or slow handshakes, dropped links,
//! failing writes, added latency and operations held until released.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use super::transport::{Connector, PingResult, RemoteChannel, Transport};
use crate::config::{ConnectionConfig, Credential};
use crate::error::{Error, Result};
use crate::sftp::{EntryKind, PermissionSet, RemoteEntry, RemotePath};

#[derive(Debug, Clone)]
enum NodeData {
    File(Vec<u8>),
    Dir,
    Symlink(String),
}

#[derive(Debug, Clone)]
struct Node {
    data: NodeData,
    mode: PermissionSet,
    modified_at: DateTime<Utc>,
}

impl Node {
    fn dir() -> Self {
        Self {
            data: NodeData::Dir,
            mode: PermissionSet::from_mode(0o755),
            modified_at: Utc::now(),
        }
    }

    fn file(data: Vec<u8>) -> Self {
        Self {
            data: NodeData::File(data),
            mode: PermissionSet::from_mode(0o644),
            modified_at: Utc::now(),
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self.data, NodeData::Dir)
    }

    fn entry(&self, path: &RemotePath) -> RemoteEntry {
        let (kind, size) = match &self.data {
            NodeData::File(data) => (EntryKind::File, data.len() as u64),
            NodeData::Dir => (EntryKind::Directory, 0),
            NodeData::Symlink(target) => (EntryKind::Symlink, target.len() as u64),
        };
        RemoteEntry {
            name: path.file_name().unwrap_or("/").to_string(),
            path: path.clone(),
            kind,
            size,
            modified_at: self.modified_at,
            mode: self.mode,
        }
    }
}

/// Remote filesystem held in memory, shared by every link of a connector
pub struct MemoryFs {
    nodes: Mutex<BTreeMap<RemotePath, Node>>,
    /// Paths whose mutation is refused with `PermissionDenied`
    locked: Mutex<HashSet<RemotePath>>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(RemotePath::root(), Node::dir());
        Self {
            nodes: Mutex::new(nodes),
            locked: Mutex::new(HashSet::new()),
        }
    }

    /// `mkdir -p`
    pub fn add_dir(&self, path: &str) -> Result<()> {
        let path = RemotePath::parse(path)?;
        let mut nodes = self.nodes.lock();
        Self::ensure_dirs(&mut nodes, &path)
    }

    /// Create or replace a file, creating missing parents
    pub fn add_file(&self, path: &str, data: impl Into<Vec<u8>>) -> Result<()> {
        let path = RemotePath::parse(path)?;
        let mut nodes = self.nodes.lock();
        Self::ensure_dirs(&mut nodes, &path.parent())?;
        nodes.insert(path, Node::file(data.into()));
        Ok(())
    }

    pub fn add_symlink(&self, path: &str, target: &str) -> Result<()> {
        let path = RemotePath::parse(path)?;
        let mut nodes = self.nodes.lock();
        Self::ensure_dirs(&mut nodes, &path.parent())?;
        nodes.insert(
            path,
            Node {
                data: NodeData::Symlink(target.to_string()),
                mode: PermissionSet::from_mode(0o777),
                modified_at: Utc::now(),
            },
        );
        Ok(())
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        let path = RemotePath::parse(path).ok()?;
        match &self.nodes.lock().get(&path)?.data {
            NodeData::File(data) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        RemotePath::parse(path)
            .map(|p| self.nodes.lock().contains_key(&p))
            .unwrap_or(false)
    }

    pub fn mode(&self, path: &str) -> Option<PermissionSet> {
        let path = RemotePath::parse(path).ok()?;
        self.nodes.lock().get(&path).map(|n| n.mode)
    }

    /// Refuse any mutation of `path` (and creation directly inside it)
    pub fn lock(&self, path: &str) -> Result<()> {
        self.locked.lock().insert(RemotePath::parse(path)?);
        Ok(())
    }

    pub fn unlock(&self, path: &str) -> Result<()> {
        self.locked.lock().remove(&RemotePath::parse(path)?);
        Ok(())
    }

    fn ensure_dirs(nodes: &mut BTreeMap<RemotePath, Node>, path: &RemotePath) -> Result<()> {
        let mut current = RemotePath::root();
        for segment in path.as_str().split('/').filter(|s| !s.is_empty()) {
            current = current.join(segment)?;
            match nodes.get(&current) {
                Some(node) if node.is_dir() => {}
                Some(_) => return Err(Error::NotADirectory(current.to_string())),
                None => {
                    nodes.insert(current.clone(), Node::dir());
                }
            }
        }
        Ok(())
    }

    fn check_unlocked(&self, path: &RemotePath) -> Result<()> {
        if self.locked.lock().contains(path) {
            Err(Error::PermissionDenied(path.to_string()))
        } else {
            Ok(())
        }
    }

    /// Parent must be an existing, writable directory
    fn check_parent(&self, nodes: &BTreeMap<RemotePath, Node>, path: &RemotePath) -> Result<()> {
        let parent = path.parent();
        match nodes.get(&parent) {
            None => Err(Error::NotFound(parent.to_string())),
            Some(node) if !node.is_dir() => Err(Error::NotADirectory(parent.to_string())),
            Some(_) => self.check_unlocked(&parent),
        }
    }

    fn stat(&self, path: &RemotePath) -> Result<RemoteEntry> {
        self.nodes
            .lock()
            .get(path)
            .map(|node| node.entry(path))
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    fn read_dir(&self, path: &RemotePath) -> Result<Vec<RemoteEntry>> {
        let nodes = self.nodes.lock();
        let dir = match nodes.get(path).map(|n| &n.data) {
            None => return Err(Error::NotFound(path.to_string())),
            Some(NodeData::Dir) => path.clone(),
            // opendir follows the link; a non-directory target is a bare failure status
            Some(NodeData::Symlink(target)) => {
                let target = Self::link_target(path, target)?;
                match nodes.get(&target).map(|n| &n.data) {
                    None => return Err(Error::NotFound(path.to_string())),
                    Some(NodeData::Dir) => target,
                    Some(_) => return Err(Error::Protocol(format!("{}: failure", path))),
                }
            }
            Some(NodeData::File(_)) => return Err(Error::NotADirectory(path.to_string())),
        };
        Ok(nodes
            .iter()
            .filter(|(p, _)| **p != dir && p.parent() == dir)
            .map(|(p, node)| node.entry(p))
            .collect())
    }

    fn link_target(link: &RemotePath, target: &str) -> Result<RemotePath> {
        if target.starts_with('/') {
            RemotePath::parse(target)
        } else {
            RemotePath::parse(&format!("{}/{}", link.parent(), target))
        }
    }

    fn mkdir(&self, path: &RemotePath) -> Result<()> {
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(path) {
            return Err(Error::AlreadyExists(path.to_string()));
        }
        self.check_parent(&nodes, path)?;
        nodes.insert(path.clone(), Node::dir());
        Ok(())
    }

    fn rmdir(&self, path: &RemotePath) -> Result<()> {
        let mut nodes = self.nodes.lock();
        match nodes.get(path) {
            None => return Err(Error::NotFound(path.to_string())),
            Some(node) if !node.is_dir() => return Err(Error::NotADirectory(path.to_string())),
            Some(_) => {}
        }
        if path.is_root() {
            return Err(Error::PermissionDenied(path.to_string()));
        }
        self.check_unlocked(path)?;
        if nodes.keys().any(|p| p != path && p.starts_with(path)) {
            return Err(Error::Protocol(format!("{}: directory not empty", path)));
        }
        nodes.remove(path);
        Ok(())
    }

    fn remove_file(&self, path: &RemotePath) -> Result<()> {
        let mut nodes = self.nodes.lock();
        match nodes.get(path) {
            None => return Err(Error::NotFound(path.to_string())),
            Some(node) if node.is_dir() => return Err(Error::IsADirectory(path.to_string())),
            Some(_) => {}
        }
        self.check_unlocked(path)?;
        nodes.remove(path);
        Ok(())
    }

    fn rename(&self, from: &RemotePath, to: &RemotePath) -> Result<()> {
        let mut nodes = self.nodes.lock();
        if !nodes.contains_key(from) {
            return Err(Error::NotFound(from.to_string()));
        }
        if nodes.contains_key(to) {
            return Err(Error::AlreadyExists(to.to_string()));
        }
        if to.starts_with(from) {
            return Err(Error::InvalidPath(format!("cannot move {} into itself", from)));
        }
        self.check_unlocked(from)?;
        self.check_parent(&nodes, to)?;

        let moved: Vec<RemotePath> = nodes
            .keys()
            .filter(|p| p.starts_with(from))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = nodes.remove(&old) {
                let suffix = &old.as_str()[from.as_str().len()..];
                let new = RemotePath::parse(&format!("{}{}", to, suffix))?;
                nodes.insert(new, node);
            }
        }
        Ok(())
    }

    fn set_mode(&self, path: &RemotePath, mode: PermissionSet) -> Result<()> {
        self.check_unlocked(path)?;
        let mut nodes = self.nodes.lock();
        let node = nodes
            .get_mut(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        node.mode = mode;
        Ok(())
    }

    fn create(&self, path: &RemotePath) -> Result<()> {
        let mut nodes = self.nodes.lock();
        match nodes.get_mut(path) {
            Some(node) if node.is_dir() => Err(Error::IsADirectory(path.to_string())),
            Some(node) => {
                self.check_unlocked(path)?;
                node.data = NodeData::File(Vec::new());
                node.modified_at = Utc::now();
                Ok(())
            }
            None => {
                self.check_parent(&nodes, path)?;
                nodes.insert(path.clone(), Node::file(Vec::new()));
                Ok(())
            }
        }
    }

    fn read_at(&self, path: &RemotePath, offset: u64, len: usize) -> Result<Vec<u8>> {
        let nodes = self.nodes.lock();
        match nodes.get(path).map(|n| &n.data) {
            None => Err(Error::NotFound(path.to_string())),
            Some(NodeData::Dir) => Err(Error::IsADirectory(path.to_string())),
            Some(NodeData::Symlink(_)) => Err(Error::Protocol(format!("{}: is a symlink", path))),
            Some(NodeData::File(data)) => {
                let start = (offset as usize).min(data.len());
                let end = start.saturating_add(len).min(data.len());
                Ok(data[start..end].to_vec())
            }
        }
    }

    fn write_at(&self, path: &RemotePath, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut nodes = self.nodes.lock();
        if !nodes.contains_key(path) {
            self.check_parent(&nodes, path)?;
            nodes.insert(path.clone(), Node::file(Vec::new()));
        } else {
            self.check_unlocked(path)?;
        }
        let node = nodes
            .get_mut(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        let NodeData::File(data) = &mut node.data else {
            return Err(Error::IsADirectory(path.to_string()));
        };
        let start = offset as usize;
        let end = start + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        node.modified_at = Utc::now();
        Ok(())
    }

    fn truncate(&self, path: &RemotePath, len: u64) -> Result<()> {
        self.check_unlocked(path)?;
        let mut nodes = self.nodes.lock();
        let node = nodes
            .get_mut(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        let NodeData::File(data) = &mut node.data else {
            return Err(Error::IsADirectory(path.to_string()));
        };
        data.resize(len as usize, 0);
        node.modified_at = Utc::now();
        Ok(())
    }
}

/// Injected failures, shared by a connector and every link it created
struct Faults {
    handshakes: AtomicUsize,
    handshake_error: Mutex<Option<Error>>,
    handshake_delay: Mutex<Duration>,
    password: Mutex<Option<String>>,
    failing_writes: AtomicUsize,
    latency: Mutex<Duration>,
    hold_tx: watch::Sender<bool>,
}

struct Link {
    alive: AtomicBool,
    disconnect_tx: broadcast::Sender<()>,
}

impl Link {
    fn new() -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            alive: AtomicBool::new(true),
            disconnect_tx,
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn sever(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            let _ = self.disconnect_tx.send(());
        }
    }
}

fn link_lost() -> Error {
    Error::ConnectionLost("link dropped".to_string())
}

/// Connector over a [`MemoryFs`]. Clones share the filesystem and faults.
#[derive(Clone)]
pub struct MemoryConnector {
    fs: Arc<MemoryFs>,
    faults: Arc<Faults>,
    links: Arc<Mutex<Vec<Arc<Link>>>>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::with_fs(Arc::new(MemoryFs::new()))
    }

    pub fn with_fs(fs: Arc<MemoryFs>) -> Self {
        let (hold_tx, _) = watch::channel(false);
        Self {
            fs,
            faults: Arc::new(Faults {
                handshakes: AtomicUsize::new(0),
                handshake_error: Mutex::new(None),
                handshake_delay: Mutex::new(Duration::ZERO),
                password: Mutex::new(None),
                failing_writes: AtomicUsize::new(0),
                latency: Mutex::new(Duration::ZERO),
                hold_tx,
            }),
            links: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn fs(&self) -> &Arc<MemoryFs> {
        &self.fs
    }

    /// Handshakes attempted so far, successful or not
    pub fn handshake_count(&self) -> usize {
        self.faults.handshakes.load(Ordering::SeqCst)
    }

    /// Fail every handshake with `error` until cleared with `None`
    pub fn fail_handshakes(&self, error: Option<Error>) {
        *self.faults.handshake_error.lock() = error;
    }

    pub fn set_handshake_delay(&self, delay: Duration) {
        *self.faults.handshake_delay.lock() = delay;
    }

    /// Only accept this password; key credentials are refused
    pub fn require_password(&self, password: impl Into<String>) {
        *self.faults.password.lock() = Some(password.into());
    }

    /// Sever every live link, as if the network dropped
    pub fn drop_links(&self) {
        let links: Vec<Arc<Link>> = self.links.lock().drain(..).collect();
        info!("Dropping {} in-memory link(s)", links.len());
        for link in links {
            link.sever();
        }
    }

    pub fn live_links(&self) -> usize {
        self.links.lock().iter().filter(|l| l.is_alive()).count()
    }

    /// The next `count` writes fail with a protocol error
    pub fn fail_next_writes(&self, count: usize) {
        self.faults.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Delay added before every channel operation
    pub fn set_latency(&self, latency: Duration) {
        *self.faults.latency.lock() = latency;
    }

    /// Park every channel operation until [`release_operations`](Self::release_operations)
    pub fn hold_operations(&self) {
        self.faults.hold_tx.send_replace(true);
    }

    pub fn release_operations(&self) {
        self.faults.hold_tx.send_replace(false);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        config: &ConnectionConfig,
        credential: &Credential,
    ) -> Result<Arc<dyn Transport>> {
        let attempt = self.faults.handshakes.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("In-memory handshake #{} for {}", attempt, config.target());

        let delay = *self.faults.handshake_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let injected = self.faults.handshake_error.lock().clone();
        if let Some(err) = injected {
            return Err(err);
        }

        let expected = self.faults.password.lock().clone();
        if let Some(expected) = expected {
            match credential {
                Credential::Password(p) if p.as_str() == expected => {}
                Credential::Password(_) => {
                    return Err(Error::Auth("password rejected by server".into()))
                }
                Credential::PrivateKey { .. } => {
                    return Err(Error::Auth("publickey rejected by server".into()))
                }
            }
        }

        let link = Arc::new(Link::new());
        {
            let mut links = self.links.lock();
            links.retain(|l| l.is_alive());
            links.push(link.clone());
        }

        Ok(Arc::new(MemoryTransport {
            fs: self.fs.clone(),
            faults: self.faults.clone(),
            link,
        }))
    }
}

struct MemoryTransport {
    fs: Arc<MemoryFs>,
    faults: Arc<Faults>,
    link: Arc<Link>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open_channel(&self) -> Result<Box<dyn RemoteChannel>> {
        if !self.link.is_alive() {
            return Err(link_lost());
        }
        Ok(Box::new(MemoryChannel {
            fs: self.fs.clone(),
            faults: self.faults.clone(),
            link: self.link.clone(),
        }))
    }

    async fn ping(&self) -> PingResult {
        if self.link.is_alive() {
            PingResult::Ok
        } else {
            PingResult::IoError
        }
    }

    async fn disconnect(&self) {
        self.link.sever();
    }

    fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.link.disconnect_tx.subscribe()
    }
}

struct MemoryChannel {
    fs: Arc<MemoryFs>,
    faults: Arc<Faults>,
    link: Arc<Link>,
}

impl MemoryChannel {
    /// Apply latency and holds; fails if the link drops meanwhile
    async fn enter(&self) -> Result<()> {
        let mut dropped = self.link.disconnect_tx.subscribe();
        if !self.link.is_alive() {
            return Err(link_lost());
        }

        let latency = *self.faults.latency.lock();
        let mut hold_rx = self.faults.hold_tx.subscribe();
        let wait = async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let _ = hold_rx.wait_for(|held| !*held).await;
        };

        tokio::select! {
            _ = wait => {}
            _ = dropped.recv() => return Err(link_lost()),
        }

        if self.link.is_alive() {
            Ok(())
        } else {
            Err(link_lost())
        }
    }
}

#[async_trait]
impl RemoteChannel for MemoryChannel {
    async fn stat(&self, path: &RemotePath) -> Result<RemoteEntry> {
        self.enter().await?;
        self.fs.stat(path)
    }

    async fn read_dir(&self, path: &RemotePath) -> Result<Vec<RemoteEntry>> {
        self.enter().await?;
        self.fs.read_dir(path)
    }

    async fn mkdir(&self, path: &RemotePath) -> Result<()> {
        self.enter().await?;
        self.fs.mkdir(path)
    }

    async fn rmdir(&self, path: &RemotePath) -> Result<()> {
        self.enter().await?;
        self.fs.rmdir(path)
    }

    async fn remove_file(&self, path: &RemotePath) -> Result<()> {
        self.enter().await?;
        self.fs.remove_file(path)
    }

    async fn rename(&self, from: &RemotePath, to: &RemotePath) -> Result<()> {
        self.enter().await?;
        self.fs.rename(from, to)
    }

    async fn set_mode(&self, path: &RemotePath, mode: PermissionSet) -> Result<()> {
        self.enter().await?;
        self.fs.set_mode(path, mode)
    }

    async fn create(&self, path: &RemotePath) -> Result<()> {
        self.enter().await?;
        self.fs.create(path)
    }

    async fn read_at(&self, path: &RemotePath, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.enter().await?;
        self.fs.read_at(path, offset, len)
    }

    async fn write_at(&self, path: &RemotePath, offset: u64, data: &[u8]) -> Result<()> {
        self.enter().await?;
        let injected = self
            .faults
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Protocol(format!("{}: injected write failure", path)));
        }
        self.fs.write_at(path, offset, data)
    }

    async fn truncate(&self, path: &RemotePath, len: u64) -> Result<()> {
        self.enter().await?;
        self.fs.truncate(path, len)
    }

    async fn close(&self) {}
}
