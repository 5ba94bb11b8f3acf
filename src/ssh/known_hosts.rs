//! Known hosts management for SSH host key verification
//!
//! Reads and appends the OpenSSH `known_hosts` format. Entries are keyed the
//! way OpenSSH writes them: bare host for port 22, `[host]:port` otherwise.
//! Hashed hostnames (`|1|...`) are not matched.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches a known_hosts entry
    Verified,
    /// No entry for this host and key type
    Unknown { fingerprint: String },
    /// A different key of the same type is recorded (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

pub struct KnownHostsStore {
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    path: PathBuf,
}

impl KnownHostsStore {
    /// `~/.ssh/known_hosts`, or `None` without a home directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".ssh").join("known_hosts"))
    }

    /// Load from `path`; a missing or unreadable file starts empty
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path: path.into(),
        };

        if let Err(e) = store.load() {
            warn!("Failed to load known_hosts from {}: {}", store.path.display(), e);
        }

        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<()> {
        if !self.path.exists() {
            debug!("No known_hosts at {}", self.path.display());
            return Ok(());
        }

        let file = fs::File::open(&self.path).map_err(|e| self.io_error(e))?;
        let reader = BufReader::new(file);
        let mut hosts = self.hosts.write();
        let mut entry_count = 0;

        for line in reader.lines() {
            let line = line.map_err(|e| self.io_error(e))?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostname[,alias] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 || parts[0].starts_with('@') {
                continue;
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                if hostname.starts_with('|') {
                    continue;
                }
                hosts
                    .entry(Self::normalize_hostname(hostname))
                    .or_default()
                    .push(entry.clone());
                entry_count += 1;
            }
        }

        info!(
            "Loaded {} known host entries ({} unique hosts)",
            entry_count,
            hosts.len()
        );
        Ok(())
    }

    fn io_error(&self, err: std::io::Error) -> Error {
        Error::Storage(format!("known_hosts {}: {}", self.path.display(), err))
    }

    /// Lowercase, and fold `[host]:22` into `host`
    fn normalize_hostname(host: &str) -> String {
        let host = host.to_lowercase();
        match host.strip_prefix('[').and_then(|h| h.rsplit_once("]:")) {
            Some((name, "22")) => name.to_string(),
            Some(_) => host,
            None => host.trim_end_matches(']').to_string(),
        }
    }

    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// SHA256 fingerprint in OpenSSH display form
    pub fn fingerprint(key: &PublicKey) -> String {
        Self::fingerprint_bytes(&key.public_key_bytes())
    }

    fn fingerprint_bytes(bytes: &[u8]) -> String {
        let hash = Sha256::digest(bytes);
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let actual_b64 = BASE64.encode(key.public_key_bytes());
        let actual_type = key.algorithm().as_str().to_string();
        let fingerprint = Self::fingerprint(key);

        let hosts = self.hosts.read();
        let Some(entries) = hosts.get(&lookup_key) else {
            debug!("Unknown host: {}", lookup_key);
            return HostKeyVerification::Unknown { fingerprint };
        };

        let mut changed = None;
        for entry in entries.iter().filter(|e| e.key_type == actual_type) {
            if entry.key_data == actual_b64 {
                debug!("Host key verified for {} ({})", lookup_key, actual_type);
                return HostKeyVerification::Verified;
            }
            changed.get_or_insert_with(|| {
                BASE64
                    .decode(&entry.key_data)
                    .map(|bytes| Self::fingerprint_bytes(&bytes))
                    .unwrap_or_else(|_| "unknown".to_string())
            });
        }

        match changed {
            Some(expected_fingerprint) => {
                warn!(
                    "HOST KEY CHANGED for {} ({})! Expected {}, got {}",
                    lookup_key, actual_type, expected_fingerprint, fingerprint
                );
                HostKeyVerification::Changed {
                    expected_fingerprint,
                    actual_fingerprint: fingerprint,
                }
            }
            None => {
                debug!("Host {} known but no {} key stored", lookup_key, actual_type);
                HostKeyVerification::Unknown { fingerprint }
            }
        }
    }

    /// Record a host key in memory and append it to the file
    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> Result<()> {
        let lookup_key = Self::make_key(host, port);
        let key_data = BASE64.encode(key.public_key_bytes());
        let key_type = key.algorithm().as_str().to_string();

        self.hosts
            .write()
            .entry(lookup_key.clone())
            .or_default()
            .push(HostKeyEntry {
                key_type: key_type.clone(),
                key_data: key_data.clone(),
            });

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;
        writeln!(file, "{} {} {}", lookup_key, key_type, key_data).map_err(|e| self.io_error(e))?;

        info!("Added host key for {} ({}) to known_hosts", lookup_key, key_type);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const KEY_A: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAICP0gDCe+x8/zKH5afWtRqEa6HPazIO3gGT4Jtuip38E a";
    const KEY_B: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIP1dtqA4iD/IctDakYwhsAVyKBWYNTEapA9BSfSAQY+D b";

    fn key(line: &str) -> PublicKey {
        PublicKey::from_openssh(line).unwrap()
    }

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(KnownHostsStore::normalize_hostname("GitHub.com"), "github.com");
        assert_eq!(KnownHostsStore::normalize_hostname("[github.com]:22"), "github.com");
        assert_eq!(
            KnownHostsStore::normalize_hostname("[server.example.com]:2222"),
            "[server.example.com]:2222"
        );
    }

    #[test]
    fn test_make_key() {
        assert_eq!(KnownHostsStore::make_key("github.com", 22), "github.com");
        assert_eq!(KnownHostsStore::make_key("server.com", 2222), "[server.com]:2222");
    }

    #[test]
    fn test_unknown_then_verified_after_add() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ssh").join("known_hosts");
        let store = KnownHostsStore::with_path(&path);
        let a = key(KEY_A);

        assert!(matches!(
            store.verify("files.example", 2222, &a),
            HostKeyVerification::Unknown { .. }
        ));
        store.add_host("files.example", 2222, &a).unwrap();
        assert_eq!(store.verify("files.example", 2222, &a), HostKeyVerification::Verified);

        // Persisted in OpenSSH form and picked up by a fresh store
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("[files.example]:2222 ssh-ed25519 "));
        let reloaded = KnownHostsStore::with_path(&path);
        assert_eq!(reloaded.verify("files.example", 2222, &a), HostKeyVerification::Verified);
        assert!(matches!(
            reloaded.verify("files.example", 22, &a),
            HostKeyVerification::Unknown { .. }
        ));
    }

    #[test]
    fn test_changed_key_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(&path, format!("# comment\nfiles.example,10.0.0.5 {}\n", KEY_A)).unwrap();

        let store = KnownHostsStore::with_path(&path);
        match store.verify("10.0.0.5", 22, &key(KEY_B)) {
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                assert_eq!(expected_fingerprint, KnownHostsStore::fingerprint(&key(KEY_A)));
                assert_eq!(actual_fingerprint, KnownHostsStore::fingerprint(&key(KEY_B)));
            }
            other => panic!("expected Changed, got {:?}", other),
        }
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = KnownHostsStore::fingerprint(&key(KEY_A));
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
        assert_eq!(fp.len(), "SHA256:".len() + 43);
    }
}
