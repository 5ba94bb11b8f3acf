//! SSH client implementation using russh
//!
//! [`SshConnector`] dials, verifies the host key, authenticates and hands the
//! russh handle to its owner task. [`SshTransport`] opens SFTP channels through
//! the resulting [`HandleController`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::known_hosts::{HostKeyVerification, KnownHostsStore};
use super::transport::{Connector, PingResult, RemoteChannel, Transport};
use crate::config::{ConnectionConfig, Credential, EngineConfig, HostKeyPolicy};
use crate::error::{Error, Result};
use crate::sftp::channel::{ChannelCounter, SftpChannel};

/// russh-based [`Connector`]
pub struct SshConnector {
    policy: HostKeyPolicy,
    known_hosts: Option<Arc<KnownHostsStore>>,
    request_timeout_secs: u64,
}

impl SshConnector {
    /// Connector using `~/.ssh/known_hosts`
    pub fn new(config: &EngineConfig) -> Self {
        let known_hosts =
            KnownHostsStore::default_path().map(|p| Arc::new(KnownHostsStore::with_path(p)));
        if known_hosts.is_none() {
            warn!("No home directory; host keys will not be recorded");
        }
        Self {
            policy: config.host_key_policy,
            known_hosts,
            request_timeout_secs: config.op_timeout_secs.max(1),
        }
    }

    pub fn with_known_hosts(config: &EngineConfig, known_hosts: Arc<KnownHostsStore>) -> Self {
        Self {
            policy: config.host_key_policy,
            known_hosts: Some(known_hosts),
            request_timeout_secs: config.op_timeout_secs.max(1),
        }
    }

    async fn authenticate(
        handle: &mut client::Handle<ClientHandler>,
        config: &ConnectionConfig,
        credential: &Credential,
    ) -> Result<()> {
        let authenticated = match credential {
            Credential::Password(password) => handle
                .authenticate_password(&config.username, password.as_str())
                .await
                .map_err(|e| Error::from(e).during_handshake())?,
            Credential::PrivateKey {
                key_pem,
                passphrase,
            } => {
                let key = russh::keys::decode_secret_key(
                    key_pem.as_str(),
                    passphrase.as_ref().map(|p| p.as_str()),
                )?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                handle
                    .authenticate_publickey(&config.username, key_with_hash)
                    .await
                    .map_err(|e| Error::from(e).during_handshake())?
            }
        };

        if !authenticated.success() {
            return Err(Error::Auth(format!(
                "credentials rejected by server for {}",
                config.target()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        config: &ConnectionConfig,
        credential: &Credential,
    ) -> Result<Arc<dyn Transport>> {
        let addr = format!("{}:{}", config.host, config.port);
        info!("Connecting to SSH server at {}", addr);

        let socket_addr = tokio::net::lookup_host(&addr)
            .await
            .map_err(|e| Error::Network(format!("Failed to resolve {}: {}", addr, e)))?
            .next()
            .ok_or_else(|| Error::Network(format!("No address found for {}", addr)))?;

        // Liveness is driven by the registry heartbeat
        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler {
            host: config.host.clone(),
            port: config.port,
            policy: self.policy,
            known_hosts: self.known_hosts.clone(),
        };

        let mut handle = client::connect(Arc::new(ssh_config), socket_addr, handler)
            .await
            .map_err(Error::during_handshake)?;
        debug!("SSH handshake completed with {}", addr);

        Self::authenticate(&mut handle, config, credential).await?;
        info!("SSH authentication successful for {}", config.target());

        let controller = spawn_handle_owner_task(handle, config.target());
        Ok(Arc::new(SshTransport {
            controller,
            open_channels: Arc::new(AtomicUsize::new(0)),
            request_timeout_secs: self.request_timeout_secs,
        }))
    }
}

/// Client handler for russh callbacks; verifies the server host key
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: Option<Arc<KnownHostsStore>>,
}

impl client::Handler for ClientHandler {
    type Error = Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool> {
        if self.policy == HostKeyPolicy::AcceptAny {
            debug!("Host key checking disabled for {}:{}", self.host, self.port);
            return Ok(true);
        }

        let Some(known_hosts) = self.known_hosts.as_ref() else {
            return match self.policy {
                HostKeyPolicy::Strict => Err(Error::Protocol(format!(
                    "Host key verification failed: no known_hosts available for {}:{}",
                    self.host, self.port
                ))),
                _ => Ok(true),
            };
        };

        match known_hosts.verify(&self.host, self.port, server_public_key) {
            HostKeyVerification::Verified => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyVerification::Unknown { fingerprint } => match self.policy {
                HostKeyPolicy::Strict => {
                    warn!(
                        "Unknown host key for {}:{} (fingerprint: {}). Strict mode, rejecting.",
                        self.host, self.port, fingerprint
                    );
                    Err(Error::Protocol(format!(
                        "Host key verification failed: unknown host {}:{}. Fingerprint: {}",
                        self.host, self.port, fingerprint
                    )))
                }
                _ => {
                    info!(
                        "New host {}:{}, adding to known_hosts (fingerprint: {})",
                        self.host, self.port, fingerprint
                    );
                    if let Err(e) = known_hosts.add_host(&self.host, self.port, server_public_key) {
                        warn!("Failed to save host key: {}", e);
                    }
                    Ok(true)
                }
            },
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                );
                Err(Error::Protocol(format!(
                    "Host key for {}:{} has changed (expected {}, got {})",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                )))
            }
        }
    }
}

/// One authenticated russh connection
pub struct SshTransport {
    controller: HandleController,
    open_channels: Arc<AtomicUsize>,
    request_timeout_secs: u64,
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_channel(&self) -> Result<Box<dyn RemoteChannel>> {
        let channel = match self.controller.open_session_channel().await {
            Ok(channel) => channel,
            Err(russh::Error::ChannelOpenFailure(reason)) => {
                let current = self.open_channels.load(Ordering::SeqCst);
                warn!("Server refused channel {} ({:?})", current + 1, reason);
                return Err(Error::ChannelLimitExceeded {
                    current,
                    max: current,
                });
            }
            Err(russh::Error::Disconnect) => {
                return Err(Error::ConnectionLost("SSH connection closed".to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let counter = ChannelCounter::acquire(&self.open_channels);
        let channel = SftpChannel::open(channel, counter, self.request_timeout_secs).await?;
        Ok(Box::new(channel))
    }

    async fn ping(&self) -> PingResult {
        self.controller.ping().await
    }

    async fn disconnect(&self) {
        self.controller.disconnect().await;
    }

    fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.controller.subscribe_disconnect()
    }
}
