//! In-memory credential vault
//!
//! Secrets are held only here, keyed by connection, and are zeroed when the
//! entry is removed. Nothing in this module is serializable.

use std::fmt;

use dashmap::DashMap;
use tracing::debug;
use zeroize::Zeroizing;

use super::types::{AuthKind, ConnectionId};
use crate::error::{Error, Result};

/// Secret material supplied at connect time.
///
/// `Debug` never prints the secret.
#[derive(Clone)]
pub enum Credential {
    Password(Zeroizing<String>),
    PrivateKey {
        /// OpenSSH or PEM encoded private key
        key_pem: Zeroizing<String>,
        passphrase: Option<Zeroizing<String>>,
    },
}

impl Credential {
    pub fn password(password: impl Into<String>) -> Self {
        Credential::Password(Zeroizing::new(password.into()))
    }

    pub fn private_key(key_pem: impl Into<String>, passphrase: Option<String>) -> Self {
        Credential::PrivateKey {
            key_pem: Zeroizing::new(key_pem.into()),
            passphrase: passphrase.map(Zeroizing::new),
        }
    }

    pub fn kind(&self) -> AuthKind {
        match self {
            Credential::Password(_) => AuthKind::Password,
            Credential::PrivateKey { .. } => AuthKind::PrivateKey,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let empty = match self {
            Credential::Password(p) => p.is_empty(),
            Credential::PrivateKey { key_pem, .. } => key_pem.trim().is_empty(),
        };
        if empty {
            Err(Error::InvalidConfig(match self.kind() {
                AuthKind::Password => "password is required".into(),
                AuthKind::PrivateKey => "private key is required".into(),
            }))
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Credential::Password(<redacted>)"),
            Credential::PrivateKey { passphrase, .. } => f
                .debug_struct("Credential::PrivateKey")
                .field("key_pem", &"<redacted>")
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

/// Process-local store of connection secrets
#[derive(Default)]
pub struct CredentialVault {
    entries: DashMap<ConnectionId, Credential>,
}

impl CredentialVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or replace) the secret of a connection
    pub fn store(&self, id: ConnectionId, credential: Credential) {
        self.entries.insert(id, credential);
        debug!("Stored credential for connection {}", id);
    }

    /// Copy of the secret for one handshake. The copy zeroes itself on drop.
    pub fn checkout(&self, id: &ConnectionId) -> Option<Credential> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    /// Remove and zero the secret of a connection
    pub fn remove(&self, id: &ConnectionId) -> bool {
        let removed = self.entries.remove(id).is_some();
        if removed {
            debug!("Dropped credential for connection {}", id);
        }
        removed
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
