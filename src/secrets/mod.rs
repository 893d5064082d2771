//! Slot and admin secret documents plus the store abstraction.
//!
//! The secret store is the source of truth between runs: it holds both
//! slot credentials, the `active_slot` marker, and the DB admin login.
//! Backends implement [`SecretStore`]; production uses AWS Secrets Manager
//! (`aws.rs`), tests use in-process fakes.

pub mod aws;

use std::fmt;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::RotateError;

/// One of the two pre-provisioned DB user identities.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    /// The standby for any given active slot.
    pub fn other(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Slot::A => "A",
            Slot::B => "B",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection parameters for one slot user. Usernames are stable across
/// rotations; only the password changes.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotCredentials {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: String,
    pub dbname: String,
}

impl fmt::Debug for SlotCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .finish()
    }
}

/// The versioned dual-slot document. JSON shape:
/// `{"active_slot": "A"|"B", "A": {...}, "B": {...}}`.
#[derive(Clone, Serialize, Deserialize)]
pub struct SlotSecret {
    pub active_slot: Slot,
    #[serde(rename = "A")]
    pub slot_a: SlotCredentials,
    #[serde(rename = "B")]
    pub slot_b: SlotCredentials,
}

impl SlotSecret {
    pub fn slot(&self, s: Slot) -> &SlotCredentials {
        match s {
            Slot::A => &self.slot_a,
            Slot::B => &self.slot_b,
        }
    }

    pub fn slot_mut(&mut self, s: Slot) -> &mut SlotCredentials {
        match s {
            Slot::A => &mut self.slot_a,
            Slot::B => &mut self.slot_b,
        }
    }

    /// Which slot a config-file username belongs to, if any.
    pub fn slot_for_username(&self, username: &str) -> Option<Slot> {
        if self.slot_a.username == username {
            Some(Slot::A)
        } else if self.slot_b.username == username {
            Some(Slot::B)
        } else {
            None
        }
    }

    /// The engine repairs drift but does not provision: a document missing
    /// usernames or passwords is refused before any mutation.
    pub fn validate(&self) -> Result<(), RotateError> {
        for (name, creds) in [("A", &self.slot_a), ("B", &self.slot_b)] {
            if creds.username.is_empty() || creds.password.is_empty() {
                return Err(RotateError::SecretUnavailable(format!(
                    "slot secret is not seeded: slot {name} has an empty username or password"
                )));
            }
        }
        if self.slot_a.username == self.slot_b.username {
            return Err(RotateError::SecretUnavailable(
                "slot secret is malformed: both slots name the same DB user".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for SlotSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotSecret")
            .field("active_slot", &self.active_slot)
            .field("A", &self.slot_a)
            .field("B", &self.slot_b)
            .finish()
    }
}

/// The DBA account used to manage slot users.
#[derive(Clone, Serialize, Deserialize)]
pub struct AdminSecret {
    pub username: String,
    pub password: String,
    pub host: String,
}

impl fmt::Debug for AdminSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminSecret")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .finish()
    }
}

/// Typed read/write access to the two secret documents.
///
/// Every successful put is durable before the method returns. A put that
/// detects a concurrent writer fails with [`RotateError::Conflict`] and
/// leaves the store at the pre-call version; two rotations must never run
/// at once, so the engine treats that as fatal.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_slot_secret(&self) -> Result<SlotSecret, RotateError>;
    async fn put_slot_secret(&self, doc: &SlotSecret) -> Result<(), RotateError>;
    async fn get_admin_secret(&self) -> Result<AdminSecret, RotateError>;
    async fn put_admin_secret(&self, doc: &AdminSecret) -> Result<(), RotateError>;
}

/// Characters MySQL accepts in an `IDENTIFIED BY` literal without quoting
/// trouble: ASCII alphanumerics plus a conservative punctuation subset.
const PASSWORD_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#%^&*-_=+?";

const PASSWORD_LEN: usize = 32;

/// Generate a fresh slot or admin password from the OS CSPRNG.
/// The result is never logged.
pub fn generate_password() -> String {
    let mut rng = rand::rngs::OsRng;
    (0..PASSWORD_LEN)
        .map(|_| PASSWORD_CHARSET[rng.gen_range(0..PASSWORD_CHARSET.len())] as char)
        .collect()
}
