//! Handle Owner Task
//!
//! Only one task owns the russh `Handle<ClientHandler>`. Everything else talks
//! to it through a cloneable [`HandleController`] that sends commands over an
//! mpsc channel, so no lock is ever held across an SSH round-trip.
//!
//! The task also watches the handle itself and broadcasts once on the
//! disconnect channel when the link goes away, whether the peer dropped it or
//! we asked for it.

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::transport::PingResult;

/// How long a keepalive may take before it counts as a timeout
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the owner checks whether the peer closed the link
const LIVENESS_POLL: Duration = Duration::from_millis(500);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (the SFTP subsystem is requested on it)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Keepalive round-trip
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task.
///
/// Cloning is cheap (it copies the sender). Holding one grants full control of
/// the connection, so it never leaves the process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Subscribe to SSH disconnect notifications.
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Open a session channel
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, russh::Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| russh::Error::Disconnect)?;
        reply_rx.await.map_err(|_| russh::Error::Disconnect)?
    }

    /// Disconnect the SSH connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Keepalive round-trip
    pub async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HandleCommand::Ping { reply_tx }).await.is_err() {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task.
///
/// Consumes the `Handle`; `label` is only used for logging.
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, label: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let notify_tx = disconnect_tx.clone();

    tokio::spawn(async move {
        let mut handle = handle;
        let mut liveness = tokio::time::interval(LIVENESS_POLL);
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Handle owner task started for {}", label);

        loop {
            let cmd = tokio::select! {
                cmd = cmd_rx.recv() => cmd,
                _ = liveness.tick() => {
                    if handle.is_closed() {
                        warn!("SSH link to {} closed by peer", label);
                        break;
                    }
                    continue;
                }
            };

            match cmd {
                Some(HandleCommand::ChannelOpenSession { reply_tx }) => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        // The server closes the orphaned channel when it is dropped
                        warn!("Caller dropped before receiving channel_open_session result");
                    }
                }

                Some(HandleCommand::Ping { reply_tx }) => {
                    debug!("Keepalive probe for {}", label);
                    let result =
                        match tokio::time::timeout(KEEPALIVE_TIMEOUT, handle.send_keepalive(true))
                            .await
                        {
                            Ok(Ok(())) => PingResult::Ok,
                            Ok(Err(russh::Error::Disconnect)) | Ok(Err(russh::Error::IO(_))) => {
                                warn!("Keepalive for {} failed: link is down", label);
                                PingResult::IoError
                            }
                            Ok(Err(e)) => {
                                warn!("Keepalive SSH error for {} (soft failure): {:?}", label, e);
                                PingResult::Timeout
                            }
                            Err(_) => {
                                warn!("Keepalive timeout for {} ({:?})", label, KEEPALIVE_TIMEOUT);
                                PingResult::Timeout
                            }
                        };
                    let _ = reply_tx.send(result);
                }

                Some(HandleCommand::Disconnect) => {
                    info!("Disconnect requested for {}", label);
                    break;
                }

                None => {
                    info!("All controllers dropped for {}", label);
                    break;
                }
            }
        }

        let _ = notify_tx.send(());
        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for {}", label);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Fail every queued command with a disconnect
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}
