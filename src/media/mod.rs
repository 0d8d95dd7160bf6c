//! MediaConn: the shared, race-coalescing media-host lease, plus media
//! re-upload error mapping.
//!
//! Media *upload itself* stays with the caller — this module only owns
//! the host/auth lease that an upload call would need, and the status
//! code translation for a failed re-upload response.

use crate::error::RelayError;
use crate::Result;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// `{ hosts[], auth, ttl, fetchDate }`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaConn {
    pub hosts: Vec<String>,
    pub auth: String,
    pub ttl: Duration,
}

/// The `<iq type="set" xmlns="w:m">` media-connection round trip. External
/// collaborator, exposed as a trait for testability.
#[async_trait]
pub trait MediaConnFetcher: Send + Sync {
    async fn fetch(&self) -> Result<MediaConn>;
}

struct Leased {
    conn: MediaConn,
    fetched_at: Instant,
}

/// Memoized, race-coalescing `mediaConn` lease. Concurrent callers that
/// arrive while a refresh is in flight simply queue on the same async
/// mutex and observe the result the first caller fetched, rather than
/// each issuing their own round trip.
pub struct MediaConnCache<F: MediaConnFetcher> {
    fetcher: F,
    state: Mutex<Option<Leased>>,
}

impl<F: MediaConnFetcher> MediaConnCache<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            state: Mutex::new(None),
        }
    }

    /// Refreshed when absent, forced, or when `now - fetch_date > ttl`.
    pub async fn get_or_refresh(&self, force: bool) -> Result<MediaConn> {
        let mut guard = self.state.lock().await;
        let stale = match guard.as_ref() {
            None => true,
            Some(leased) => force || leased.fetched_at.elapsed() > leased.conn.ttl,
        };
        if stale {
            let conn = self.fetcher.fetch().await?;
            *guard = Some(Leased {
                conn: conn.clone(),
                fetched_at: Instant::now(),
            });
            return Ok(conn);
        }
        Ok(guard.as_ref().unwrap().conn.clone())
    }
}

/// Outcome of a media re-upload attempt: error surfaced per-key; a
/// non-success result code translates to a status code derived from a
/// documented mapping.
#[derive(Clone, Debug)]
pub struct ReuploadOutcome {
    pub success: bool,
    pub result_code: u16,
    pub message: String,
}

/// Maps a documented set of WhatsApp media-server result codes to a
/// standard HTTP-flavored status and surfaces `Ok(())` only on success.
/// Unlisted non-success codes pass through unchanged —
/// there is no silent "unknown -> 500" coercion, since the caller needs
/// the original code to decide whether to retry with a fresh
/// [`MediaConn`].
pub fn check_reupload_result(outcome: &ReuploadOutcome) -> Result<()> {
    if outcome.success {
        return Ok(());
    }
    let status_code = match outcome.result_code {
        404 => 404,
        410 => 410,
        470 => 470, // media no longer available upstream
        other => other,
    };
    Err(crate::Error::Relay(RelayError::MediaReupload {
        status_code,
        message: outcome.message.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FakeFetcher {
        calls: AtomicU32,
    }

    #[async_trait]
    impl MediaConnFetcher for FakeFetcher {
        async fn fetch(&self) -> Result<MediaConn> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(MediaConn {
                hosts: vec!["media1.example.net".to_string()],
                auth: "token".to_string(),
                ttl: Duration::from_secs(300),
            })
        }
    }

    #[tokio::test]
    async fn fetches_once_when_absent_then_reuses() {
        let cache = MediaConnCache::new(FakeFetcher {
            calls: AtomicU32::new(0),
        });
        let first = cache.get_or_refresh(false).await.unwrap();
        let second = cache.get_or_refresh(false).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_bypasses_freshness() {
        let cache = MediaConnCache::new(FakeFetcher {
            calls: AtomicU32::new(0),
        });
        cache.get_or_refresh(false).await.unwrap();
        cache.get_or_refresh(true).await.unwrap();
        assert_eq!(cache.fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_coalesce_to_one_fetch() {
        let cache = Arc::new(MediaConnCache::new(FakeFetcher {
            calls: AtomicU32::new(0),
        }));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.get_or_refresh(false).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(cache.fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn successful_outcome_is_ok() {
        let outcome = ReuploadOutcome {
            success: true,
            result_code: 200,
            message: String::new(),
        };
        assert!(check_reupload_result(&outcome).is_ok());
    }

    #[test]
    fn failed_outcome_surfaces_status_code() {
        let outcome = ReuploadOutcome {
            success: false,
            result_code: 404,
            message: "not found".to_string(),
        };
        let err = check_reupload_result(&outcome).unwrap_err();
        match err {
            crate::Error::Relay(RelayError::MediaReupload { status_code, .. }) => {
                assert_eq!(status_code, 404);
            }
            _ => panic!("wrong error variant"),
        }
    }
}
