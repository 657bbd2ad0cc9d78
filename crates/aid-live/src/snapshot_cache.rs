use crate::error::FetchError;
use aid_core::{SessionRecord, SessionSummary};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Loads authoritative state from the history API.
pub trait SessionFetcher: Send + Sync + 'static {
    fn fetch_session(&self, session_id: &str) -> BoxFuture<'static, Result<SessionRecord, FetchError>>;

    fn fetch_active_sessions(&self) -> BoxFuture<'static, Result<Vec<SessionSummary>, FetchError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    /// Served from the cache without a network call.
    Cache,
    /// Fetched and stored as the current entry.
    Fetched,
    /// Fetched, but a newer request for the same session had been issued in
    /// the meantime; the cache was left alone.
    Superseded,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub record: Arc<SessionRecord>,
    pub generation: u64,
    pub source: SnapshotSource,
}

impl Snapshot {
    pub fn is_current(&self) -> bool {
        self.source != SnapshotSource::Superseded
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Arc<SessionRecord>>,
    generations: HashMap<String, u64>,
}

/// Session snapshots keyed by session id.
///
/// Every network fetch takes a new generation for its session id; a response
/// is written only while its generation is still the newest one issued, so a
/// slow older response can never overwrite a faster newer one.
pub struct SnapshotCache {
    fetcher: Arc<dyn SessionFetcher>,
    state: Mutex<CacheState>,
}

impl SnapshotCache {
    pub fn new(fetcher: Arc<dyn SessionFetcher>) -> Self {
        Self {
            fetcher,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn fetcher(&self) -> &Arc<dyn SessionFetcher> {
        &self.fetcher
    }

    pub async fn get(&self, session_id: &str, force_refresh: bool) -> Result<Arc<SessionRecord>, FetchError> {
        self.load(session_id, force_refresh)
            .await
            .map(|snapshot| snapshot.record)
    }

    /// Like [`SnapshotCache::get`], but reports where the record came from.
    pub async fn load(&self, session_id: &str, force_refresh: bool) -> Result<Snapshot, FetchError> {
        let generation = {
            let mut state = self.lock();
            if !force_refresh {
                if let Some(record) = state.entries.get(session_id) {
                    let generation = state.generations.get(session_id).copied().unwrap_or(0);
                    return Ok(Snapshot {
                        record: Arc::clone(record),
                        generation,
                        source: SnapshotSource::Cache,
                    });
                }
            }
            let counter = state.generations.entry(session_id.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };

        debug!(event = "snapshot_fetch", session_id, generation, force_refresh);
        let record = match self.fetcher.fetch_session(session_id).await {
            Ok(record) => Arc::new(record),
            Err(err) => {
                warn!(event = "snapshot_fetch_failed", session_id, generation, error = %err);
                return Err(err);
            }
        };

        let mut state = self.lock();
        let current = state.generations.get(session_id).copied().unwrap_or(0);
        if current != generation {
            debug!(
                event = "snapshot_stale_discarded",
                session_id,
                generation,
                current_generation = current
            );
            return Ok(Snapshot {
                record,
                generation,
                source: SnapshotSource::Superseded,
            });
        }
        state
            .entries
            .insert(session_id.to_string(), Arc::clone(&record));
        Ok(Snapshot {
            record,
            generation,
            source: SnapshotSource::Fetched,
        })
    }

    pub fn cached(&self, session_id: &str) -> Option<Arc<SessionRecord>> {
        self.lock().entries.get(session_id).cloned()
    }

    pub fn generation(&self, session_id: &str) -> u64 {
        self.lock().generations.get(session_id).copied().unwrap_or(0)
    }

    /// Drops the cached record; the generation counter is kept so that
    /// responses already in flight stay ordered.
    pub fn invalidate(&self, session_id: &str) -> bool {
        self.lock().entries.remove(session_id).is_some()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aid_core::SessionStatus;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    type Reply = oneshot::Receiver<Result<SessionRecord, FetchError>>;

    #[derive(Default)]
    struct GatedFetcher {
        replies: Mutex<VecDeque<Reply>>,
        calls: AtomicUsize,
    }

    impl GatedFetcher {
        fn gate(&self) -> oneshot::Sender<Result<SessionRecord, FetchError>> {
            let (tx, rx) = oneshot::channel();
            self.replies.lock().expect("lock").push_back(rx);
            tx
        }
    }

    impl SessionFetcher for GatedFetcher {
        fn fetch_session(&self, _session_id: &str) -> BoxFuture<'static, Result<SessionRecord, FetchError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self.replies.lock().expect("lock").pop_front();
            Box::pin(async move {
                match reply {
                    Some(rx) => rx
                        .await
                        .unwrap_or_else(|_| Err(FetchError::Network("gate dropped".to_string()))),
                    None => Err(FetchError::Network("no reply scripted".to_string())),
                }
            })
        }

        fn fetch_active_sessions(&self) -> BoxFuture<'static, Result<Vec<SessionSummary>, FetchError>> {
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    fn record(id: &str, status: SessionStatus) -> SessionRecord {
        SessionRecord {
            session_id: id.to_string(),
            alert_type: None,
            status,
            started_at_us: Some(1),
            completed_at_us: None,
            error_message: None,
            final_analysis: None,
            stages: Vec::new(),
        }
    }

    #[tokio::test]
    async fn cache_hit_skips_the_network() {
        let fetcher = Arc::new(GatedFetcher::default());
        let cache = SnapshotCache::new(fetcher.clone());
        let tx = fetcher.gate();
        let _ = tx.send(Ok(record("s1", SessionStatus::InProgress)));

        let first = cache.load("s1", false).await.expect("first load");
        assert_eq!(first.source, SnapshotSource::Fetched);
        let second = cache.load("s1", false).await.expect("second load");
        assert_eq!(second.source, SnapshotSource::Cache);
        assert!(Arc::ptr_eq(&first.record, &second.record));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_refresh_replaces_the_entry() {
        let fetcher = Arc::new(GatedFetcher::default());
        let cache = SnapshotCache::new(fetcher.clone());
        let _ = fetcher.gate().send(Ok(record("s1", SessionStatus::InProgress)));
        let _ = fetcher.gate().send(Ok(record("s1", SessionStatus::Completed)));

        cache.get("s1", false).await.expect("initial");
        let refreshed = cache.get("s1", true).await.expect("refresh");
        assert_eq!(refreshed.status, SessionStatus::Completed);
        assert_eq!(cache.generation("s1"), 2);
    }

    #[tokio::test]
    async fn fetch_error_leaves_cache_untouched() {
        let fetcher = Arc::new(GatedFetcher::default());
        let cache = SnapshotCache::new(fetcher.clone());
        let _ = fetcher.gate().send(Ok(record("s1", SessionStatus::InProgress)));
        let _ = fetcher
            .gate()
            .send(Err(FetchError::Status { status: 503, message: "unavailable".to_string() }));

        let before = cache.get("s1", false).await.expect("initial");
        let err = cache.get("s1", true).await.expect_err("refresh fails");
        assert_eq!(err.to_string(), "server returned status 503: unavailable");
        let after = cache.cached("s1").expect("still cached");
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn slow_older_response_does_not_overwrite_newer_one() {
        let fetcher = Arc::new(GatedFetcher::default());
        let cache = SnapshotCache::new(fetcher.clone());
        let old_gate = fetcher.gate();
        let new_gate = fetcher.gate();

        let (older, newer, ()) = tokio::join!(
            cache.load("s1", true),
            cache.load("s1", true),
            async {
                let _ = new_gate.send(Ok(record("s1", SessionStatus::Completed)));
                tokio::task::yield_now().await;
                let _ = old_gate.send(Ok(record("s1", SessionStatus::InProgress)));
            }
        );

        let older = older.expect("older response");
        let newer = newer.expect("newer response");
        assert_eq!(older.generation, 1);
        assert_eq!(older.source, SnapshotSource::Superseded);
        assert!(!older.is_current());
        assert_eq!(newer.source, SnapshotSource::Fetched);
        let cached = cache.cached("s1").expect("cached");
        assert_eq!(cached.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn invalidate_forces_next_get_to_fetch() {
        let fetcher = Arc::new(GatedFetcher::default());
        let cache = SnapshotCache::new(fetcher.clone());
        let _ = fetcher.gate().send(Ok(record("s1", SessionStatus::InProgress)));
        let _ = fetcher.gate().send(Ok(record("s1", SessionStatus::Failed)));

        cache.get("s1", false).await.expect("initial");
        assert!(cache.invalidate("s1"));
        let reloaded = cache.get("s1", false).await.expect("reload");
        assert_eq!(reloaded.status, SessionStatus::Failed);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }
}
