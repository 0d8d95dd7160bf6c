//! IdentityMap: bidirectional LID↔PN user mapping.
//!
//! Two independent identity spaces coexist on the wire. Carrying devices
//! through the mapping would cause multiple parallel threads per contact,
//! so the map is deliberately "unified" at user level: [`IdentityMap::lid_for_pn`]
//! always returns a bare `<lidUser>@lid` JID, never device-qualified.

use crate::store::{LidMapStore, LidMappingEntry, TransactionManager};
use crate::types::{Jid, HIDDEN_USER_SERVER};
use crate::Result;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct CachedMapping {
    value: String,
    last_touched: Instant,
}

/// Bidirectional LID↔PN mapping cache over a [`LidMapStore`] keystore
/// collaborator. Cache entries expire after `idle_ttl` of inactivity
/// (default 7 days); the underlying store entries never expire — a
/// mapping is superseded on conflict (logged) rather than deleted.
pub struct IdentityMap<S: LidMapStore> {
    store: Arc<S>,
    idle_ttl: Duration,
    pn_to_lid: DashMap<String, CachedMapping>,
    lid_to_pn: DashMap<String, CachedMapping>,
    txn: TransactionManager,
}

impl<S: LidMapStore> IdentityMap<S> {
    pub fn new(store: Arc<S>, idle_ttl: Duration) -> Self {
        Self {
            store,
            idle_ttl,
            pn_to_lid: DashMap::new(),
            lid_to_pn: DashMap::new(),
            txn: TransactionManager::new(),
        }
    }

    /// Store a batch of LID/PN pairs. For each pair, the server determines
    /// which side is LID and which is PN; pairs where neither side is a
    /// recognizable LID/PN JID are skipped with a warning rather than
    /// erroring out. Cache and keystore writes for the whole batch happen
    /// inside one `lid-mapping`-scoped transaction.
    pub async fn store_mappings(&self, pairs: &[(Jid, Jid)]) -> Result<()> {
        self.txn
            .transaction("lid-mapping", || async {
                for (a, b) in pairs {
                    let (pn, lid) = match classify_pair(a, b) {
                        Some(pair) => pair,
                        None => {
                            tracing::warn!(a = %a, b = %b, "skipping mapping pair: neither side is LID/PN");
                            continue;
                        }
                    };
                    self.store_one(&pn.user, &lid.user).await?;
                }
                Ok(())
            })
            .await
    }

    async fn store_one(&self, pn_user: &str, lid_user: &str) -> Result<()> {
        if let Some(existing) = self.store.get_lid_for_pn(pn_user).await? {
            if existing == lid_user {
                // Idempotent write: nothing changed, nothing to log.
                self.touch(pn_user, lid_user);
                return Ok(());
            }
            tracing::warn!(
                pn_user,
                lid_user,
                previous_lid = existing,
                "overwriting existing LID mapping"
            );
        }
        self.store
            .put_mapping(&LidMappingEntry {
                pn_user: pn_user.to_string(),
                lid_user: lid_user.to_string(),
            })
            .await?;
        self.touch(pn_user, lid_user);
        Ok(())
    }

    fn touch(&self, pn_user: &str, lid_user: &str) {
        let now = Instant::now();
        self.pn_to_lid.insert(
            pn_user.to_string(),
            CachedMapping {
                value: lid_user.to_string(),
                last_touched: now,
            },
        );
        self.lid_to_pn.insert(
            lid_user.to_string(),
            CachedMapping {
                value: pn_user.to_string(),
                last_touched: now,
            },
        );
    }

    fn cached(&self, map: &DashMap<String, CachedMapping>, key: &str, idle_ttl: Duration) -> Option<String> {
        let entry = map.get(key)?;
        if entry.last_touched.elapsed() > idle_ttl {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Returns the user-level LID JID `"<lidUser>@lid"` for a PN JID,
    /// never carrying a device suffix.
    pub async fn lid_for_pn(&self, pn: &Jid) -> Result<Option<Jid>> {
        if let Some(lid_user) = self.cached(&self.pn_to_lid, &pn.user, self.idle_ttl) {
            return Ok(Some(Jid::new(lid_user, HIDDEN_USER_SERVER)));
        }
        let lid_user = match self.store.get_lid_for_pn(&pn.user).await? {
            Some(v) => v,
            None => return Ok(None),
        };
        self.touch(&pn.user, &lid_user);
        Ok(Some(Jid::new(lid_user, HIDDEN_USER_SERVER)))
    }

    /// Symmetric to [`Self::lid_for_pn`].
    pub async fn pn_for_lid(&self, lid: &Jid) -> Result<Option<Jid>> {
        if let Some(pn_user) = self.cached(&self.lid_to_pn, &lid.user, self.idle_ttl) {
            return Ok(Some(Jid::new(pn_user, crate::types::DEFAULT_USER_SERVER)));
        }
        let pn_user = match self.store.get_pn_for_lid(&lid.user).await? {
            Some(v) => v,
            None => return Ok(None),
        };
        self.touch(&pn_user, &lid.user);
        Ok(Some(Jid::new(pn_user, crate::types::DEFAULT_USER_SERVER)))
    }

    /// Batched variant used before session assertion.
    pub async fn lids_for_pns(&self, batch: &[Jid]) -> Result<HashMap<Jid, Jid>> {
        let mut out = HashMap::with_capacity(batch.len());
        for pn in batch {
            if let Some(lid) = self.lid_for_pn(pn).await? {
                out.insert(pn.clone(), lid);
            }
        }
        Ok(out)
    }
}

/// Deduce which JID of a pair is PN and which is LID by server. Returns
/// `(pn, lid)` in that order, or `None` if neither rule holds (e.g. both
/// sides are the same server, or neither is LID/PN).
fn classify_pair(a: &Jid, b: &Jid) -> Option<(Jid, Jid)> {
    if a.is_pn_user() && b.is_lid_user() {
        Some((a.clone(), b.clone()))
    } else if a.is_lid_user() && b.is_pn_user() {
        Some((b.clone(), a.clone()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn map() -> IdentityMap<MemoryStore> {
        IdentityMap::new(Arc::new(MemoryStore::new()), Duration::from_secs(7 * 24 * 3600))
    }

    #[tokio::test]
    async fn store_and_lookup_roundtrip() {
        let m = map();
        let pn = Jid::new("15551234567", crate::types::DEFAULT_USER_SERVER);
        let lid = Jid::new("100000000001", HIDDEN_USER_SERVER);
        m.store_mappings(&[(pn.clone(), lid.clone())]).await.unwrap();

        let got_lid = m.lid_for_pn(&pn).await.unwrap().unwrap();
        assert_eq!(got_lid, lid);
        assert!(!got_lid.has_device(), "lid_for_pn must never carry a device");

        let got_pn = m.pn_for_lid(&lid).await.unwrap().unwrap();
        assert_eq!(got_pn, pn);
    }

    #[tokio::test]
    async fn invariant_round_trip_law() {
        // Round-trip invariant: lid_for_pn(pn_for_lid(x)) == x when populated.
        let m = map();
        let pn = Jid::new("999", crate::types::DEFAULT_USER_SERVER);
        let lid = Jid::new("888", HIDDEN_USER_SERVER);
        m.store_mappings(&[(pn.clone(), lid.clone())]).await.unwrap();

        let via_pn = m.pn_for_lid(&lid).await.unwrap().unwrap();
        let back_to_lid = m.lid_for_pn(&via_pn).await.unwrap().unwrap();
        assert_eq!(back_to_lid, lid);
    }

    #[tokio::test]
    async fn rejects_same_server_pairs() {
        let m = map();
        let a = Jid::new("1", crate::types::DEFAULT_USER_SERVER);
        let b = Jid::new("2", crate::types::DEFAULT_USER_SERVER);
        // Neither side is LID, so this pair is skipped, not stored.
        m.store_mappings(&[(a.clone(), b)]).await.unwrap();
        assert!(m.lid_for_pn(&a).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn idempotent_write_keeps_value() {
        let m = map();
        let pn = Jid::new("1", crate::types::DEFAULT_USER_SERVER);
        let lid = Jid::new("2", HIDDEN_USER_SERVER);
        m.store_mappings(&[(pn.clone(), lid.clone())]).await.unwrap();
        m.store_mappings(&[(pn.clone(), lid.clone())]).await.unwrap();
        assert_eq!(m.lid_for_pn(&pn).await.unwrap().unwrap(), lid);
    }

    #[tokio::test]
    async fn batched_lookup() {
        let m = map();
        let pn1 = Jid::new("1", crate::types::DEFAULT_USER_SERVER);
        let lid1 = Jid::new("11", HIDDEN_USER_SERVER);
        let pn2 = Jid::new("2", crate::types::DEFAULT_USER_SERVER);
        let lid2 = Jid::new("22", HIDDEN_USER_SERVER);
        m.store_mappings(&[(pn1.clone(), lid1.clone()), (pn2.clone(), lid2.clone())])
            .await
            .unwrap();

        let batch = m.lids_for_pns(&[pn1.clone(), pn2.clone()]).await.unwrap();
        assert_eq!(batch.get(&pn1), Some(&lid1));
        assert_eq!(batch.get(&pn2), Some(&lid2));
    }
}
