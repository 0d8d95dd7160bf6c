//! Recent-message retention for retry receipts.
//!
//! Retry *orchestration* — deciding whether and when to resend — lives
//! with the caller; this module only remembers what was sent recently so
//! a retry-receipt handler elsewhere can ask [`RetryCache::get`] for the
//! plaintext to re-encrypt via [`crate::stanza::build_retry_resend_message`].

use crate::types::{Jid, MessageId, WireMessage};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Key into the recent-messages cache: `(chatJid, messageId)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct RecentKey {
    chat: String,
    message_id: MessageId,
}

/// Bounded LRU of recently sent plaintexts, default capacity 20,000
/// (`RelayConfig::recent_messages_cache_size`). Disabled entirely when
/// `RelayConfig::enable_recent_message_cache` is false —
/// callers should skip constructing one rather than passing capacity 0.
pub struct RetryCache {
    inner: Mutex<LruCache<RecentKey, WireMessage>>,
}

impl RetryCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Cache `message` for `(chat, message_id)`, called after a successful
    /// send that was not itself a retry-resend.
    pub fn insert(&self, chat: &Jid, message_id: &MessageId, message: WireMessage) {
        let key = RecentKey {
            chat: chat.to_string(),
            message_id: message_id.clone(),
        };
        self.inner.lock().expect("retry cache lock poisoned").put(key, message);
    }

    /// Fetch the cached plaintext for a retry-receipt handler to
    /// re-encrypt, or `None` if it has aged out of the LRU or was never
    /// cached.
    pub fn get(&self, chat: &Jid, message_id: &MessageId) -> Option<WireMessage> {
        let key = RecentKey {
            chat: chat.to_string(),
            message_id: message_id.clone(),
        };
        self.inner
            .lock()
            .expect("retry cache lock poisoned")
            .get(&key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("retry cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
