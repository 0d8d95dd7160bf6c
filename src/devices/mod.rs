//! DeviceResolver: expand bare-user JIDs into per-device wire JIDs via a
//! USync round trip, with a 5-minute device-list cache.

use crate::error::AddressingError;
use crate::identity::IdentityMap;
use crate::store::{DeviceListRecord, DeviceListStore, LidMapStore};
use crate::types::Jid;
use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One device of a resolved recipient, disambiguated here from
/// [`crate::store::OwnDevice`], the paired-device record used by pairing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedDevice {
    pub user: String,
    pub device: u16,
    pub jid: Jid,
}

/// Tuning knobs for a single [`DeviceResolver::resolve`] call.
#[derive(Clone, Copy, Debug)]
pub struct ResolveOptions {
    /// Serve from the 5-minute device-list cache when fresh.
    pub use_cache: bool,
    /// Suppress the primary device (device id 0) from the emitted devices,
    /// used by certain fan-out modes.
    pub ignore_zero_devices: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            ignore_zero_devices: false,
        }
    }
}

/// One user's USync response: the device ids the server advertises, plus
/// any opt-in LID/PN counterpart the server chose to include for that
/// user (§4.2 step 3).
#[derive(Clone, Debug, Default)]
pub struct UsyncUserResult {
    pub devices: Vec<u16>,
    pub lid_mapping: Option<Jid>,
}

/// The USync `<iq type=get xmlns=usync>` round trip. An external
/// collaborator exposed as a trait so [`DeviceResolver`] is testable
/// against a fake.
#[async_trait]
pub trait UsyncClient: Send + Sync {
    /// Query device lists for a batch of bare users in one round trip.
    /// Returns each found user's devices and any opt-in LID mapping.
    async fn query_devices(&self, users: &[String]) -> Result<HashMap<String, UsyncUserResult>>;
}

struct CacheEntry {
    devices: Vec<u16>,
    fetched_at: Instant,
}

/// Per-user device-list cache, TTL 5 minutes.
pub struct UserDevicesCache {
    ttl: Duration,
    entries: DashMap<String, CacheEntry>,
}

impl UserDevicesCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    fn fresh(&self, user: &str) -> Option<Vec<u16>> {
        let entry = self.entries.get(user)?;
        if entry.fetched_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.devices.clone())
    }

    fn put(&self, user: &str, devices: Vec<u16>) {
        self.entries.insert(
            user.to_string(),
            CacheEntry {
                devices,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Serve `user`'s device list from cache if fresh, else run `fetch`
    /// (typically a [`UsyncClient`] call) and populate the cache.
    pub async fn get_or_fetch<F, Fut>(&self, user: &str, use_cache: bool, fetch: F) -> Result<Vec<u16>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<u16>>>,
    {
        if use_cache {
            if let Some(devices) = self.fresh(user) {
                return Ok(devices);
            }
        }
        let devices = fetch().await?;
        self.put(user, devices.clone());
        Ok(devices)
    }
}

/// Resolves bare-user JIDs into per-device wire JIDs.
pub struct DeviceResolver<U: UsyncClient, D: DeviceListStore + LidMapStore> {
    usync: Arc<U>,
    persistent: Arc<D>,
    identity: Arc<IdentityMap<D>>,
    cache: UserDevicesCache,
}

impl<U: UsyncClient, D: DeviceListStore + LidMapStore> DeviceResolver<U, D> {
    pub fn new(
        usync: Arc<U>,
        persistent: Arc<D>,
        identity: Arc<IdentityMap<D>>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            usync,
            persistent,
            identity,
            cache: UserDevicesCache::new(cache_ttl),
        }
    }

    /// Expand `jids` into one [`ResolvedDevice`] per registered device.
    /// Inputs that already carry an explicit device are emitted verbatim
    /// (§4.2 step 1); the rest are normalized to their bare user and
    /// batched into a single [`UsyncClient::query_devices`] call for any
    /// that miss the cache. Any opt-in LID mapping the response carries is
    /// handed to [`crate::identity::IdentityMap::store_mappings`] before
    /// devices are extracted for that user (§4.2 step 3).
    pub async fn resolve(&self, jids: &[Jid], opts: &ResolveOptions) -> Result<Vec<ResolvedDevice>> {
        let mut out = Vec::new();
        let mut by_user: HashMap<String, Jid> = HashMap::new();
        for jid in jids {
            if jid.has_device() {
                out.push(ResolvedDevice {
                    user: jid.user.clone(),
                    device: jid.device,
                    jid: jid.clone(),
                });
            } else {
                by_user.insert(jid.user.clone(), jid.clone());
            }
        }

        let mut device_lists: HashMap<String, Vec<u16>> = HashMap::new();
        let mut to_fetch = Vec::new();
        for user in by_user.keys() {
            if opts.use_cache {
                if let Some(devices) = self.cache.fresh(user) {
                    device_lists.insert(user.clone(), devices);
                    continue;
                }
            }
            to_fetch.push(user.clone());
        }

        if !to_fetch.is_empty() {
            let fetched = self.usync.query_devices(&to_fetch).await.map_err(|e| {
                crate::Error::Addressing(AddressingError::UsyncFailed(e.to_string()))
            })?;

            let lid_pairs: Vec<(Jid, Jid)> = to_fetch
                .iter()
                .filter_map(|user| {
                    let result = fetched.get(user)?;
                    let lid = result.lid_mapping.clone()?;
                    let original = by_user.get(user)?.clone();
                    Some((original, lid))
                })
                .collect();
            if !lid_pairs.is_empty() {
                self.identity.store_mappings(&lid_pairs).await?;
            }

            for user in &to_fetch {
                let devices = fetched.get(user).map(|r| r.devices.clone()).unwrap_or_default();
                self.cache.put(user, devices.clone());
                self.persistent
                    .put(DeviceListRecord {
                        user: user.clone(),
                        wire_jids: devices
                            .iter()
                            .map(|d| format!("{}:{}", user, d))
                            .collect(),
                    })
                    .await?;
                device_lists.insert(user.clone(), devices);
            }
        }

        for (user, jid) in &by_user {
            let devices = device_lists.get(user).cloned().unwrap_or_default();
            for device in devices {
                if opts.ignore_zero_devices && device == 0 {
                    continue;
                }
                out.push(ResolvedDevice {
                    user: user.clone(),
                    device,
                    jid: jid.with_device(device),
                });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::DEFAULT_USER_SERVER;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeUsync {
        calls: AtomicU32,
        answers: HashMap<String, UsyncUserResult>,
    }

    #[async_trait]
    impl UsyncClient for FakeUsync {
        async fn query_devices(&self, users: &[String]) -> Result<HashMap<String, UsyncUserResult>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(users
                .iter()
                .filter_map(|u| self.answers.get(u).map(|d| (u.clone(), d.clone())))
                .collect())
        }
    }

    fn answer(devices: Vec<u16>) -> UsyncUserResult {
        UsyncUserResult {
            devices,
            lid_mapping: None,
        }
    }

    fn resolver(
        answers: HashMap<String, UsyncUserResult>,
    ) -> (
        DeviceResolver<FakeUsync, MemoryStore>,
        Arc<FakeUsync>,
        Arc<IdentityMap<MemoryStore>>,
    ) {
        let fake = Arc::new(FakeUsync {
            calls: AtomicU32::new(0),
            answers,
        });
        let store = Arc::new(MemoryStore::new());
        let identity = Arc::new(IdentityMap::new(Arc::clone(&store), Duration::from_secs(300)));
        (
            DeviceResolver::new(Arc::clone(&fake), store, Arc::clone(&identity), Duration::from_secs(300)),
            fake,
            identity,
        )
    }

    #[tokio::test]
    async fn resolves_devices_for_user() {
        let mut answers = HashMap::new();
        answers.insert("123".to_string(), answer(vec![0, 1, 2]));
        let (resolver, _, _) = resolver(answers);

        let jid = Jid::new("123", DEFAULT_USER_SERVER);
        let resolved = resolver
            .resolve(&[jid.clone()], &ResolveOptions::default())
            .await
            .unwrap();
        assert_eq!(resolved.len(), 3);
        assert!(resolved.iter().all(|d| d.user == "123"));
        assert!(resolved.iter().any(|d| d.jid.device == 1));
    }

    #[tokio::test]
    async fn caches_across_calls() {
        let mut answers = HashMap::new();
        answers.insert("1".to_string(), answer(vec![0]));
        let (resolver, fake, _) = resolver(answers);
        let jid = Jid::new("1", DEFAULT_USER_SERVER);

        resolver.resolve(&[jid.clone()], &ResolveOptions::default()).await.unwrap();
        resolver.resolve(&[jid], &ResolveOptions::default()).await.unwrap();
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_user_resolves_to_no_devices() {
        let (resolver, _, _) = resolver(HashMap::new());
        let jid = Jid::new("ghost", DEFAULT_USER_SERVER);
        let resolved = resolver
            .resolve(&[jid], &ResolveOptions::default())
            .await
            .unwrap();
        assert!(resolved.is_empty());
    }

    #[tokio::test]
    async fn ignore_zero_devices_suppresses_only_primary_device() {
        let mut answers = HashMap::new();
        answers.insert("123".to_string(), answer(vec![0, 1, 2]));
        let (resolver, _, _) = resolver(answers);

        let jid = Jid::new("123", DEFAULT_USER_SERVER);
        let opts = ResolveOptions {
            use_cache: true,
            ignore_zero_devices: true,
        };
        let resolved = resolver.resolve(&[jid], &opts).await.unwrap();
        assert_eq!(resolved.len(), 2);
        assert!(resolved.iter().all(|d| d.device != 0));
    }

    #[tokio::test]
    async fn explicit_device_input_passes_through_verbatim() {
        let mut answers = HashMap::new();
        answers.insert("123".to_string(), answer(vec![0, 1, 2, 3]));
        let (resolver, fake, _) = resolver(answers);

        let explicit = Jid::new("123", DEFAULT_USER_SERVER).with_device(5);
        let resolved = resolver
            .resolve(&[explicit.clone()], &ResolveOptions::default())
            .await
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].device, 5);
        assert_eq!(resolved[0].jid, explicit);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mixed_explicit_and_bare_inputs_for_same_user_do_not_collide() {
        let mut answers = HashMap::new();
        answers.insert("123".to_string(), answer(vec![0, 1]));
        let (resolver, _, _) = resolver(answers);

        let explicit = Jid::new("123", DEFAULT_USER_SERVER).with_device(9);
        let bare = Jid::new("123", DEFAULT_USER_SERVER);
        let resolved = resolver
            .resolve(&[explicit.clone(), bare], &ResolveOptions::default())
            .await
            .unwrap();
        assert!(resolved.iter().any(|d| d.device == 9));
        assert!(resolved.iter().any(|d| d.device == 0));
        assert!(resolved.iter().any(|d| d.device == 1));
        assert_eq!(resolved.len(), 3);
    }

    #[tokio::test]
    async fn usync_lid_mapping_is_stored_before_device_extraction() {
        let mut answers = HashMap::new();
        let lid = Jid::new("999", crate::types::HIDDEN_USER_SERVER);
        answers.insert(
            "123".to_string(),
            UsyncUserResult {
                devices: vec![0, 1],
                lid_mapping: Some(lid.clone()),
            },
        );
        let (resolver, _, identity) = resolver(answers);

        let jid = Jid::new("123", DEFAULT_USER_SERVER);
        let resolved = resolver
            .resolve(&[jid.clone()], &ResolveOptions::default())
            .await
            .unwrap();
        assert_eq!(resolved.len(), 2);

        let stored = identity.lid_for_pn(&jid).await.unwrap();
        assert_eq!(stored, Some(lid));
    }
}
