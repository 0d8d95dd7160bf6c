use super::{
    OwnDevice, DeviceListRecord, DeviceListStore, DeviceStore, LidMapStore, LidMappingEntry,
    SenderKeyMemoryStore,
};
use crate::session::{KeyStore, PreKeyBundle, ProtocolAddress};
use crate::{error::StoreError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// In-memory device store (for testing or single-run; not persistent).
///
/// Also implements the [`LidMapStore`], [`SenderKeyMemoryStore`], and
/// [`DeviceListStore`] keystore collaborator traits, grounded on the single
/// `MemoryStore`-implements-everything shape used by the corpus's
/// `whatsapp-rust` in-memory backend (which does the same for its
/// `SignalStore`/`AppSyncStore`/`ProtocolStore` split).
pub struct MemoryStore {
    devices: RwLock<HashMap<String, OwnDevice>>,
    first_jid: RwLock<Option<String>>,
    /// pnUser -> lidUser.
    lid_by_pn: DashMap<String, String>,
    /// lidUser -> pnUser (reverse index).
    pn_by_lid: DashMap<String, String>,
    sender_key_memory: DashMap<String, HashSet<String>>,
    device_lists: DashMap<String, Vec<String>>,
    sessions: DashMap<ProtocolAddress, PreKeyBundle>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            first_jid: RwLock::new(None),
            lid_by_pn: DashMap::new(),
            pn_by_lid: DashMap::new(),
            sender_key_memory: DashMap::new(),
            device_lists: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    fn first_jid_key() -> String {
        "__first".to_string()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn get_first_device(&self) -> Result<Option<OwnDevice>> {
        let first = self
            .first_jid
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?
            .clone();
        let default_key = Self::first_jid_key();
        let key = first.as_deref().unwrap_or_else(|| default_key.as_str());
        let devices = self
            .devices
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?;
        Ok(devices.get(key).cloned())
    }

    async fn get_device(&self, jid: &crate::types::Jid) -> Result<Option<OwnDevice>> {
        let devices = self
            .devices
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?;
        Ok(devices.get(&jid.to_string()).cloned())
    }

    async fn save(&self, device: &OwnDevice) -> Result<()> {
        let key = device
            .id
            .as_ref()
            .map(|j| j.to_string())
            .unwrap_or_else(Self::first_jid_key);
        if device.id.is_some() {
            *self
                .first_jid
                .write()
                .map_err(|e| StoreError::Save(e.to_string()))? = Some(key.clone());
        }
        self.devices
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?
            .insert(key, device.clone());
        Ok(())
    }

    async fn delete(&self, jid: &crate::types::Jid) -> Result<()> {
        let key = jid.to_string();
        self.devices
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?
            .remove(&key);
        let mut first = self
            .first_jid
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?;
        if *first == Some(key) {
            *first = None;
        }
        Ok(())
    }

    async fn get_all_devices(&self) -> Result<Vec<OwnDevice>> {
        let devices = self
            .devices
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?;
        Ok(devices
            .values()
            .filter(|d| d.id.is_some())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LidMapStore for MemoryStore {
    async fn get_lid_for_pn(&self, pn_user: &str) -> Result<Option<String>> {
        Ok(self.lid_by_pn.get(pn_user).map(|v| v.value().clone()))
    }

    async fn get_pn_for_lid(&self, lid_user: &str) -> Result<Option<String>> {
        Ok(self.pn_by_lid.get(lid_user).map(|v| v.value().clone()))
    }

    async fn put_mapping(&self, entry: &LidMappingEntry) -> Result<()> {
        self.lid_by_pn
            .insert(entry.pn_user.clone(), entry.lid_user.clone());
        self.pn_by_lid
            .insert(entry.lid_user.clone(), entry.pn_user.clone());
        Ok(())
    }
}

#[async_trait]
impl SenderKeyMemoryStore for MemoryStore {
    async fn get(&self, group_jid: &str) -> Result<HashSet<String>> {
        Ok(self
            .sender_key_memory
            .get(group_jid)
            .map(|v| v.value().clone())
            .unwrap_or_default())
    }

    async fn mark_sent(&self, group_jid: &str, wire_jids: &[String]) -> Result<()> {
        self.sender_key_memory
            .entry(group_jid.to_string())
            .or_default()
            .extend(wire_jids.iter().cloned());
        Ok(())
    }

    async fn clear(&self, group_jid: &str) -> Result<()> {
        self.sender_key_memory.remove(group_jid);
        Ok(())
    }
}

#[async_trait]
impl DeviceListStore for MemoryStore {
    async fn get(&self, user: &str) -> Result<Option<DeviceListRecord>> {
        Ok(self.device_lists.get(user).map(|v| DeviceListRecord {
            user: user.to_string(),
            wire_jids: v.value().clone(),
        }))
    }

    async fn put(&self, record: DeviceListRecord) -> Result<()> {
        self.device_lists.insert(record.user, record.wire_jids);
        Ok(())
    }
}

/// Keystore namespace `session`: presence and
/// installation of pairwise Signal sessions, consulted by
/// [`crate::session::SessionGuard`] before the real ratchet math in
/// [`crate::crypto::InMemorySignalRepository`] ever runs.
#[async_trait]
impl KeyStore for MemoryStore {
    async fn has_session(&self, addr: &ProtocolAddress) -> Result<bool> {
        Ok(self.sessions.contains_key(addr))
    }

    async fn install_session(&self, addr: &ProtocolAddress, bundle: &PreKeyBundle) -> Result<()> {
        self.sessions.insert(addr.clone(), bundle.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Jid;

    #[tokio::test]
    async fn memory_store_save_and_get_first() {
        let store = MemoryStore::new();
        let mut dev = OwnDevice::default();
        dev.id = Some(Jid::new("123", "s.whatsapp.net"));

        store.save(&dev).await.unwrap();
        let loaded = store.get_first_device().await.unwrap().unwrap();
        assert_eq!(
            loaded.id.as_ref().unwrap().to_string(),
            "123@s.whatsapp.net"
        );
    }

    #[tokio::test]
    async fn memory_store_get_device_by_jid() {
        let store = MemoryStore::new();
        let jid = Jid::new("456", "s.whatsapp.net");
        let mut dev = OwnDevice::default();
        dev.id = Some(jid.clone());

        store.save(&dev).await.unwrap();
        let loaded = store.get_device(&jid).await.unwrap().unwrap();
        assert!(loaded.id.is_some());
    }

    #[tokio::test]
    async fn memory_store_delete() {
        let store = MemoryStore::new();
        let jid = Jid::new("789", "s.whatsapp.net");
        let mut dev = OwnDevice::default();
        dev.id = Some(jid.clone());

        store.save(&dev).await.unwrap();
        assert!(store.get_device(&jid).await.unwrap().is_some());
        store.delete(&jid).await.unwrap();
        assert!(store.get_device(&jid).await.unwrap().is_none());
        assert!(store.get_first_device().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_get_all_devices() {
        let store = MemoryStore::new();
        let mut d1 = OwnDevice::default();
        d1.id = Some(Jid::new("1", "s.whatsapp.net"));
        let mut d2 = OwnDevice::default();
        d2.id = Some(Jid::new("2", "s.whatsapp.net"));
        store.save(&d1).await.unwrap();
        store.save(&d2).await.unwrap();
        let all = store.get_all_devices().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn lid_mapping_bidirectional() {
        let store = MemoryStore::new();
        store
            .put_mapping(&LidMappingEntry {
                pn_user: "15551234".into(),
                lid_user: "100000000001".into(),
            })
            .await
            .unwrap();
        assert_eq!(
            store.get_lid_for_pn("15551234").await.unwrap(),
            Some("100000000001".into())
        );
        assert_eq!(
            store.get_pn_for_lid("100000000001").await.unwrap(),
            Some("15551234".into())
        );
        assert_eq!(store.get_lid_for_pn("unknown").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sender_key_memory_accumulates_and_clears() {
        let store = MemoryStore::new();
        assert!(store.get("group1").await.unwrap().is_empty());
        store
            .mark_sent("group1", &["a@s.whatsapp.net:1".into()])
            .await
            .unwrap();
        store
            .mark_sent("group1", &["b@s.whatsapp.net:1".into()])
            .await
            .unwrap();
        let members = store.get("group1").await.unwrap();
        assert_eq!(members.len(), 2);
        store.clear("group1").await.unwrap();
        assert!(store.get("group1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn device_list_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.get("user1").await.unwrap().is_none());
        store
            .put(DeviceListRecord {
                user: "user1".into(),
                wire_jids: vec!["user1:0@s.whatsapp.net".into()],
            })
            .await
            .unwrap();
        let rec = store.get("user1").await.unwrap().unwrap();
        assert_eq!(rec.wire_jids.len(), 1);
    }

    fn bundle() -> PreKeyBundle {
        PreKeyBundle {
            registration_id: 1,
            identity_key: [1u8; 32],
            signed_prekey_id: 1,
            signed_prekey_pub: [2u8; 32],
            signed_prekey_sig: [3u8; 64],
            prekey_id: Some(1),
            prekey_pub: Some([4u8; 32]),
        }
    }

    #[tokio::test]
    async fn session_presence_roundtrip() {
        let store = MemoryStore::new();
        let addr = ProtocolAddress {
            user: "1".into(),
            device: 0,
        };
        assert!(!store.has_session(&addr).await.unwrap());
        store.install_session(&addr, &bundle()).await.unwrap();
        assert!(store.has_session(&addr).await.unwrap());
    }
}
