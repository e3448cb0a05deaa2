//! Versioned backup container.
//!
//! A backup is JSON holding the sealed vault plus every piece of public
//! wallet state. Older versions are upgraded on read by walking
//! [`MIGRATIONS`], one pure `Value -> Value` step per version, before the
//! result is decoded into the current [`BackupContainer`].
//!
//! | version | adds |
//! |---|---|
//! | 1 | `network`, `vault`, `accounts` |
//! | 2 | `contacts`, `pending_psbts` |
//! | 3 | optional `tx_notes` |

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use satchel_core::address::Network;

use crate::account::Account;
use crate::encryption::EncryptedBlob;
use crate::error::BackupError;

pub const CURRENT_BACKUP_VERSION: u32 = 3;

/// An address-book entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A signing round waiting on co-signers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSession {
    pub id: String,
    /// Base64 PSBT as last saved.
    pub psbt: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupContainer {
    pub version: u32,
    pub network: Network,
    pub vault: EncryptedBlob,
    pub accounts: Vec<Account>,
    pub contacts: Vec<Contact>,
    pub pending_psbts: Vec<PendingSession>,
    /// Per-transaction notes keyed by txid. Absent in backups that never
    /// had any, and left absent on export.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_notes: Option<BTreeMap<String, String>>,
}

type Migration = fn(Value) -> Result<Value, BackupError>;

/// `(from_version, step)` pairs. Each step produces `from_version + 1`.
pub const MIGRATIONS: &[(u32, Migration)] = &[(1, migrate_v1_to_v2), (2, migrate_v2_to_v3)];

fn object(value: Value, from: u32) -> Result<Map<String, Value>, BackupError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(BackupError::Migration {
            from,
            reason: "top level is not an object".into(),
        }),
    }
}

/// v1 had no contacts or pending sessions.
pub fn migrate_v1_to_v2(value: Value) -> Result<Value, BackupError> {
    let mut map = object(value, 1)?;
    map.entry("contacts").or_insert_with(|| Value::Array(Vec::new()));
    map.entry("pending_psbts")
        .or_insert_with(|| Value::Array(Vec::new()));
    map.insert("version".into(), Value::from(2));
    Ok(Value::Object(map))
}

/// v3 only introduces the optional notes section; nothing to fill in.
pub fn migrate_v2_to_v3(value: Value) -> Result<Value, BackupError> {
    let mut map = object(value, 2)?;
    map.insert("version".into(), Value::from(3));
    Ok(Value::Object(map))
}

fn version_of(value: &Value) -> Result<u32, BackupError> {
    value
        .get("version")
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .filter(|v| *v > 0)
        .ok_or_else(|| BackupError::Malformed("missing or invalid version".into()))
}

/// Upgrade a parsed backup of any supported version to the current shape.
pub fn migrate(mut value: Value) -> Result<Value, BackupError> {
    let mut version = version_of(&value)?;
    if version > CURRENT_BACKUP_VERSION {
        return Err(BackupError::UnsupportedVersion {
            found: version,
            supported: CURRENT_BACKUP_VERSION,
        });
    }
    while version < CURRENT_BACKUP_VERSION {
        let (_, step) = MIGRATIONS
            .iter()
            .find(|(from, _)| *from == version)
            .ok_or_else(|| BackupError::Migration {
                from: version,
                reason: "no migration registered".into(),
            })?;
        value = step(value)?;
        let next = version_of(&value)?;
        if next != version + 1 {
            return Err(BackupError::Migration {
                from: version,
                reason: format!("step produced version {next}"),
            });
        }
        info!(from = version, to = next, "backup migrated");
        version = next;
    }
    Ok(value)
}

impl BackupContainer {
    pub fn new(network: Network, vault: EncryptedBlob, accounts: Vec<Account>) -> Self {
        Self {
            version: CURRENT_BACKUP_VERSION,
            network,
            vault,
            accounts,
            contacts: Vec::new(),
            pending_psbts: Vec::new(),
            tx_notes: None,
        }
    }

    /// Decode a backup of any supported version.
    pub fn from_json(bytes: &[u8]) -> Result<Self, BackupError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| BackupError::Malformed(e.to_string()))?;
        serde_json::from_value(migrate(value)?).map_err(|e| BackupError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, BackupError> {
        serde_json::to_vec_pretty(self).map_err(|e| BackupError::Malformed(e.to_string()))
    }
}
