#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cloudfm_lib::config::TransferConfig;
use cloudfm_lib::sftp::RetryConfig;
use cloudfm_lib::ssh::MemoryConnector;
use cloudfm_lib::{ConnectionConfig, ConnectionId, Credential, EngineConfig, FileManager, RemotePath};

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        heartbeat_interval_secs: 0,
        transfer: TransferConfig {
            chunk_size: 64,
            max_concurrent: 2,
            retry: RetryConfig::new(2).with_backoff(1, 1.0, 1),
            failed_retention_secs: 600,
        },
        ..EngineConfig::default()
    }
}

pub fn connection() -> ConnectionConfig {
    ConnectionConfig::new("memory", "files.internal", 22, "deploy")
}

pub fn p(raw: &str) -> RemotePath {
    RemotePath::parse(raw).unwrap()
}

/// Manager over a memory server with a small `/data` tree
pub async fn connected(config: EngineConfig) -> (MemoryConnector, Arc<FileManager>, ConnectionId) {
    let connector = MemoryConnector::new();
    let fs = connector.fs();
    fs.add_file("/data/a.txt", "alpha").unwrap();
    fs.add_file("/data/b.txt", "bravo").unwrap();
    fs.add_file("/data/c.txt", "charlie").unwrap();
    fs.add_file("/data/docs/readme.md", "# readme").unwrap();
    fs.add_dir("/backup").unwrap();

    let manager = FileManager::with_connector(Arc::new(connector.clone()), config).unwrap();
    let id = manager
        .connect(connection(), Credential::password("hunter2"))
        .await
        .unwrap();
    (connector, Arc::new(manager), id)
}

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Poll until `check` holds, panicking after about two seconds
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}
