//! User-facing relay configuration.

use std::time::Duration;

/// Tunables exposed to callers of [`crate::relay::Relay`].
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Downgrade session-assert and per-device encryption failures to
    /// warnings in group sends, and bypass the per-peer encrypt mutex.
    pub compat_v6_group_send: bool,

    /// Chunk size for batched progressive session assertion in large
    /// groups (default 10).
    pub group_assert_chunk: usize,

    /// Delay between chunks of batched session assertion, in milliseconds
    /// (default 250).
    pub group_assert_delay_ms: u64,

    /// Capacity of the recent-messages LRU used for retry receipts
    /// (default 20,000).
    pub recent_messages_cache_size: usize,

    /// Whether sent plaintexts are cached at all for retry re-encryption.
    pub enable_recent_message_cache: bool,

    /// Maximum number of retry attempts the caller will make for a given
    /// message id before giving up (retry orchestration itself is handled
    /// by the caller; this only bounds how long this crate holds onto the
    /// cached plaintext).
    pub max_msg_retry_count: u32,

    /// Whether the relay emits its own `Event::Message` for sends made by
    /// this device (useful for UI echo).
    pub emit_own_events: bool,

    /// TTL for the user-devices cache (default 5 minutes).
    pub user_devices_ttl: Duration,

    /// TTL for the peer-sessions presence cache (same as the device
    /// cache).
    pub peer_sessions_ttl: Duration,

    /// Freshness window for cached group metadata (default 5 minutes).
    pub group_metadata_ttl: Duration,

    /// Idle expiry for LID↔PN mapping cache entries (default 7 days).
    pub lid_mapping_idle_ttl: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            compat_v6_group_send: false,
            group_assert_chunk: 10,
            group_assert_delay_ms: 250,
            recent_messages_cache_size: 20_000,
            enable_recent_message_cache: true,
            max_msg_retry_count: 5,
            emit_own_events: false,
            user_devices_ttl: Duration::from_secs(5 * 60),
            peer_sessions_ttl: Duration::from_secs(5 * 60),
            group_metadata_ttl: Duration::from_secs(5 * 60),
            lid_mapping_idle_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RelayConfig::default();
        assert!(!cfg.compat_v6_group_send);
        assert_eq!(cfg.group_assert_chunk, 10);
        assert_eq!(cfg.group_assert_delay_ms, 250);
        assert_eq!(cfg.recent_messages_cache_size, 20_000);
        assert_eq!(cfg.group_metadata_ttl, Duration::from_secs(300));
        assert_eq!(cfg.lid_mapping_idle_ttl, Duration::from_secs(604_800));
    }
}
