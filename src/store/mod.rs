//! Device/session store (mirrors whatsmeow store) plus the keystore
//! collaborator traits the relay core drives.
//!
//! [`DeviceStore`] is the original paired-device persistence (noise/
//! identity keys, account blob). The other traits here —
//! [`LidMapStore`], [`SenderKeyMemoryStore`], [`DeviceListStore`] — are new:
//! they back [`crate::identity::IdentityMap`], [`crate::group::GroupState`],
//! and [`crate::devices::DeviceResolver`] respectively, one keystore
//! namespace each (`lid-mapping`, `sender-key-memory`, `device-list`).

mod memory;
mod txn;

pub use memory::MemoryStore;
pub use txn::TransactionManager;

use crate::types::Jid;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// Device identity and keys for one linked device (whatsmeow store.Device).
#[derive(Clone, Debug)]
pub struct OwnDevice {
    /// Our JID after pairing (None if not paired).
    pub id: Option<Jid>,
    pub lid: Option<Jid>,
    pub business_name: Option<String>,
    pub platform: Option<String>,
    /// Noise public key (32 bytes).
    pub noise_key_pub: Option<[u8; 32]>,
    /// Identity key pair (32 + 32 bytes).
    pub identity_key_pub: Option<[u8; 32]>,
    pub identity_key_priv: Option<[u8; 32]>,
    /// Adv secret for pairing.
    pub adv_secret_key: Option<[u8; 32]>,
    /// Signed device identity (protobuf) after pairing.
    pub account: Option<Vec<u8>>,
    /// Registration ID for Signal.
    pub registration_id: u32,
    /// Signed prekey ID.
    pub signed_prekey_id: u32,
}

impl Default for OwnDevice {
    fn default() -> Self {
        Self {
            id: None,
            lid: None,
            business_name: None,
            platform: None,
            noise_key_pub: None,
            identity_key_pub: None,
            identity_key_priv: None,
            adv_secret_key: None,
            account: None,
            registration_id: 0,
            signed_prekey_id: 0,
        }
    }
}

impl OwnDevice {
    pub fn is_logged_in(&self) -> bool {
        self.id.is_some()
    }
}

/// Store trait: persist and load device state (like whatsmeow store.Container + Device).
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Get the first (or only) device. Used to create a client.
    async fn get_first_device(&self) -> crate::Result<Option<OwnDevice>>;

    /// Get device by JID (for multi-session).
    async fn get_device(&self, jid: &Jid) -> crate::Result<Option<OwnDevice>>;

    /// Save device state (after pairing or key changes).
    async fn save(&self, device: &OwnDevice) -> crate::Result<()>;

    /// Delete device (logout).
    async fn delete(&self, jid: &Jid) -> crate::Result<()>;

    /// Get all stored devices.
    async fn get_all_devices(&self) -> crate::Result<Vec<OwnDevice>>;
}

/// Alias for boxed store (common usage).
pub type Store = Arc<dyn DeviceStore>;

/// One durable LID↔PN mapping record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LidMappingEntry {
    pub pn_user: String,
    pub lid_user: String,
}

/// Keystore namespace `lid-mapping`. Writes must be idempotent: a caller
/// rewriting an identical mapping should not be treated as a conflict.
#[async_trait]
pub trait LidMapStore: Send + Sync {
    async fn get_lid_for_pn(&self, pn_user: &str) -> crate::Result<Option<String>>;
    async fn get_pn_for_lid(&self, lid_user: &str) -> crate::Result<Option<String>>;
    async fn put_mapping(&self, entry: &LidMappingEntry) -> crate::Result<()>;
}

/// Keystore namespace `sender-key-memory`. Tracks, per group, which wire
/// JIDs have already received the current sender-key distribution
/// message.
#[async_trait]
pub trait SenderKeyMemoryStore: Send + Sync {
    async fn get(&self, group_jid: &str) -> crate::Result<HashSet<String>>;
    async fn mark_sent(&self, group_jid: &str, wire_jids: &[String]) -> crate::Result<()>;
    /// Cleared when the sender key is rotated.
    async fn clear(&self, group_jid: &str) -> crate::Result<()>;
}

/// One user's device list snapshot, persisted for bulk migration by other
/// components (keystore namespace `device-list`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceListRecord {
    pub user: String,
    pub wire_jids: Vec<String>,
}

#[async_trait]
pub trait DeviceListStore: Send + Sync {
    async fn get(&self, user: &str) -> crate::Result<Option<DeviceListRecord>>;
    async fn put(&self, record: DeviceListRecord) -> crate::Result<()>;
}

/// Convenience bundle of the keystore collaborator traits the relay
/// pipeline needs, so callers can wire up one object instead of four.
pub trait KeyStoreBundle:
    LidMapStore + SenderKeyMemoryStore + DeviceListStore + crate::session::KeyStore
{
}
impl<T: LidMapStore + SenderKeyMemoryStore + DeviceListStore + crate::session::KeyStore> KeyStoreBundle
    for T
{
}
