//! SessionGuard: ensures a pairwise Signal session exists for every wire
//! device before encryption is attempted.

use crate::error::SessionError;
use crate::types::Jid;
use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A pairwise session identity: bare user plus device id, addressed in
/// whichever identity space (LID or PN) the caller already resolved to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProtocolAddress {
    pub user: String,
    pub device: u16,
}

impl ProtocolAddress {
    pub fn from_jid(jid: &Jid) -> Self {
        Self {
            user: jid.user.clone(),
            device: jid.device,
        }
    }
}

/// A fetched pre-key bundle (X3DH initial key material). Field shapes are
/// intentionally opaque byte blobs — the math lives in [`crate::crypto`].
#[derive(Clone, Debug)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub identity_key: [u8; 32],
    pub signed_prekey_id: u32,
    pub signed_prekey_pub: [u8; 32],
    pub signed_prekey_sig: [u8; 64],
    pub prekey_id: Option<u32>,
    pub prekey_pub: Option<[u8; 32]>,
}

/// Keystore collaborator: session presence and installation (keystore
/// namespace `session`).
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn has_session(&self, addr: &ProtocolAddress) -> Result<bool>;
    async fn install_session(&self, addr: &ProtocolAddress, bundle: &PreKeyBundle) -> Result<()>;
}

/// The `<iq type="get" xmlns="encrypt">` pre-key round trip. External
/// collaborator, exposed as a trait.
#[async_trait]
pub trait PreKeyClient: Send + Sync {
    async fn fetch_bundles(
        &self,
        addrs: &[ProtocolAddress],
    ) -> Result<HashMap<ProtocolAddress, PreKeyBundle>>;
}

struct CacheEntry {
    seen_at: Instant,
}

/// Presence cache: once an address is known to have a session, skip the
/// keystore round trip for `ttl` (same shape as the device cache).
struct PeerSessionsCache {
    ttl: Duration,
    entries: DashMap<ProtocolAddress, CacheEntry>,
}

impl PeerSessionsCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    fn is_fresh(&self, addr: &ProtocolAddress) -> bool {
        self.entries
            .get(addr)
            .map(|e| e.seen_at.elapsed() <= self.ttl)
            .unwrap_or(false)
    }

    fn mark_present(&self, addr: &ProtocolAddress) {
        self.entries.insert(
            addr.clone(),
            CacheEntry {
                seen_at: Instant::now(),
            },
        );
    }
}

/// Ensures pairwise sessions exist before [`crate::crypto::Encryptor`]
/// encrypts to a device.
pub struct SessionGuard<K: KeyStore, P: PreKeyClient> {
    keystore: Arc<K>,
    prekeys: Arc<P>,
    cache: PeerSessionsCache,
    /// Downgrades assert/install failures to `tracing::warn!` instead of
    /// propagating, and the caller bypasses the per-peer encrypt mutex too —
    /// trading correctness for legacy throughput.
    compat_v6_group_send: bool,
}

impl<K: KeyStore, P: PreKeyClient> SessionGuard<K, P> {
    pub fn new(keystore: Arc<K>, prekeys: Arc<P>, cache_ttl: Duration, compat_v6_group_send: bool) -> Self {
        Self {
            keystore,
            prekeys,
            cache: PeerSessionsCache::new(cache_ttl),
            compat_v6_group_send,
        }
    }

    /// Ensure every address in `addrs` has a session, fetching and
    /// installing pre-key bundles for any that don't. Returns whether any
    /// new session was fetched.
    pub async fn assert_sessions(&self, addrs: &[ProtocolAddress]) -> Result<bool> {
        let mut missing = Vec::new();
        for addr in addrs {
            if self.cache.is_fresh(addr) {
                continue;
            }
            if self.keystore.has_session(addr).await? {
                self.cache.mark_present(addr);
                continue;
            }
            missing.push(addr.clone());
        }

        if missing.is_empty() {
            return Ok(false);
        }

        let fetch_result = self.prekeys.fetch_bundles(&missing).await;
        let bundles = match fetch_result {
            Ok(b) => b,
            Err(e) => {
                if self.compat_v6_group_send {
                    tracing::warn!(error = %e, "pre-key fetch failed, continuing under v6 compat");
                    return Ok(false);
                }
                return Err(crate::Error::Session(SessionError::PreKeyFetchFailed(e.to_string())));
            }
        };

        for addr in &missing {
            let bundle = match bundles.get(addr) {
                Some(b) => b,
                None => {
                    let err = SessionError::NoPreKeyBundle(addr.user.clone());
                    if self.compat_v6_group_send {
                        tracing::warn!(user = %addr.user, device = addr.device, "no pre-key bundle, skipping under v6 compat");
                        continue;
                    }
                    return Err(crate::Error::Session(err));
                }
            };
            if let Err(e) = self.keystore.install_session(addr, bundle).await {
                if self.compat_v6_group_send {
                    tracing::warn!(user = %addr.user, device = addr.device, error = %e, "session install failed, continuing under v6 compat");
                    continue;
                }
                return Err(e);
            }
            self.cache.mark_present(addr);
        }

        Ok(true)
    }

    /// Batched progressive session assertion for large group fan-out
    /// (default chunk 10 / delay 250ms): asserting sessions
    /// for thousands of participants at once would hold the keystore
    /// transaction open too long, so chunks are asserted with a yield
    /// between them.
    pub async fn assert_sessions_batched(
        &self,
        addrs: &[ProtocolAddress],
        chunk_size: usize,
        delay: Duration,
    ) -> Result<bool> {
        let mut did_fetch_new = false;
        let mut chunks = addrs.chunks(chunk_size.max(1)).peekable();
        while let Some(chunk) = chunks.next() {
            if self.assert_sessions(chunk).await? {
                did_fetch_new = true;
            }
            if chunks.peek().is_some() {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(did_fetch_new)
    }
}
