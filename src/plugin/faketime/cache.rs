//! Per-namespace fake clock anchors
//!
//! In clustered mode the first pod admitted in a namespace anchors the fake
//! time for that namespace. Later pods derive their clock from the anchor so
//! every pod in the namespace shares one origin. An anchor lives for a fixed
//! timeout from creation; reads never extend it.
//!
//! The map sits behind a single mutex. Inserting an anchor and arming its
//! expiry timer happen under one lock hold, and the timer takes the same lock
//! before removing its entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::info;

use super::timespec::{FakeTimeError, FakeTimeSpec};

/// Fake-time anchor shared by the pods of one namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceDelayEntry {
    /// Namespace the anchor belongs to
    pub namespace: String,
    /// Annotation value of the anchoring pod
    pub fake_time: String,
    /// Wall-clock time the anchor was created
    pub created_at: DateTime<Utc>,
}

impl NamespaceDelayEntry {
    /// Fake time a pod admitted at `now` should use
    ///
    /// Absolute anchors advance by the time elapsed since anchoring; offset
    /// anchors are returned as-is.
    pub fn fake_time_at(&self, now: DateTime<Utc>) -> Result<FakeTimeSpec, FakeTimeError> {
        FakeTimeSpec::parse(&self.fake_time)?.advance(now - self.created_at)
    }
}

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anchor {
    /// This call created the anchor
    Created(NamespaceDelayEntry),
    /// An anchor already existed
    Existing(NamespaceDelayEntry),
}

impl Anchor {
    /// The anchor entry
    pub fn entry(&self) -> &NamespaceDelayEntry {
        match self {
            Self::Created(e) | Self::Existing(e) => e,
        }
    }
}

struct Slot {
    entry: NamespaceDelayEntry,
    generation: u64,
    expiry: AbortHandle,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Slot>,
    next_generation: u64,
}

/// Concurrent namespace -> anchor map with self-expiring entries
///
/// Expiry timers run as tokio tasks, so entries must be created from within
/// a tokio runtime.
#[derive(Clone, Default)]
pub struct NamespaceDelayCache {
    state: Arc<Mutex<State>>,
}

impl NamespaceDelayCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the anchor for `namespace`, creating it when absent
    ///
    /// A new anchor stores `fake_time` and expires `timeout` after creation.
    /// An existing anchor is returned unchanged and keeps its original expiry.
    pub fn get_or_create(&self, namespace: &str, fake_time: &str, timeout: Duration) -> Anchor {
        let mut state = self.state.lock();

        if let Some(slot) = state.entries.get(namespace) {
            return Anchor::Existing(slot.entry.clone());
        }

        let generation = state.next_generation;
        state.next_generation += 1;

        let entry = NamespaceDelayEntry {
            namespace: namespace.to_string(),
            fake_time: fake_time.to_string(),
            created_at: Utc::now(),
        };

        let timer_state = Arc::clone(&self.state);
        let timer_namespace = namespace.to_string();
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            expire(&timer_state, &timer_namespace, generation);
        })
        .abort_handle();

        state.entries.insert(
            namespace.to_string(),
            Slot {
                entry: entry.clone(),
                generation,
                expiry,
            },
        );

        info!(
            namespace = %namespace,
            fake_time = %fake_time,
            timeout_secs = timeout.as_secs(),
            "Anchored namespace fake time"
        );
        Anchor::Created(entry)
    }

    /// Current anchor for `namespace`, if any
    pub fn get(&self, namespace: &str) -> Option<NamespaceDelayEntry> {
        self.state
            .lock()
            .entries
            .get(namespace)
            .map(|slot| slot.entry.clone())
    }

    /// Remove the anchor for `namespace` and cancel its expiry timer
    pub fn remove(&self, namespace: &str) -> Option<NamespaceDelayEntry> {
        let slot = self.state.lock().entries.remove(namespace)?;
        slot.expiry.abort();
        info!(namespace = %namespace, "Removed namespace fake time anchor");
        Some(slot.entry)
    }

    /// Number of live anchors
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether no anchor is live
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }
}

/// Timer callback: drop the entry only if it is still the one that armed us
fn expire(state: &Mutex<State>, namespace: &str, generation: u64) {
    let mut state = state.lock();
    let current = state.entries.get(namespace).map(|slot| slot.generation);
    if current == Some(generation) {
        state.entries.remove(namespace);
        info!(namespace = %namespace, "Namespace fake time anchor expired");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeDelta};

    const TIMEOUT: Duration = Duration::from_secs(40);

    #[tokio::test]
    async fn first_lookup_creates_then_reuses() {
        let cache = NamespaceDelayCache::new();

        let first = cache.get_or_create("team-a", "+1h", TIMEOUT);
        assert!(matches!(first, Anchor::Created(_)));

        let second = cache.get_or_create("team-a", "-5m", TIMEOUT);
        match second {
            Anchor::Existing(entry) => {
                assert_eq!(entry.fake_time, "+1h");
                assert_eq!(&entry, first.entry());
            }
            other => panic!("expected existing anchor, got {:?}", other),
        }
        assert_eq!(cache.len(), 1);
    }

    /// Story: Pods racing into an empty namespace agree on one anchor
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn story_concurrent_admissions_create_one_anchor() {
        let cache = NamespaceDelayCache::new();

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    cache.get_or_create("game", &format!("+{}s", i), TIMEOUT)
                })
            })
            .collect();

        let mut anchors = Vec::new();
        for task in tasks {
            anchors.push(task.await.unwrap());
        }

        let created = anchors
            .iter()
            .filter(|a| matches!(a, Anchor::Created(_)))
            .count();
        assert_eq!(created, 1);

        let winner = cache.get("game").unwrap();
        assert!(anchors.iter().all(|a| a.entry() == &winner));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn namespaces_are_independent() {
        let cache = NamespaceDelayCache::new();
        cache.get_or_create("team-a", "+1h", TIMEOUT);
        cache.get_or_create("team-b", "+2h", TIMEOUT);

        assert_eq!(cache.get("team-a").unwrap().fake_time, "+1h");
        assert_eq!(cache.get("team-b").unwrap().fake_time, "+2h");
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_timeout() {
        let cache = NamespaceDelayCache::new();
        cache.get_or_create("team-a", "+1h", TIMEOUT);

        tokio::time::sleep(TIMEOUT - Duration::from_secs(1)).await;
        assert!(cache.get("team-a").is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(cache.get("team-a").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reads_do_not_extend_lifetime() {
        let cache = NamespaceDelayCache::new();
        cache.get_or_create("team-a", "+1h", TIMEOUT);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(matches!(
            cache.get_or_create("team-a", "+1h", TIMEOUT),
            Anchor::Existing(_)
        ));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(cache.get("team-a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn remove_cancels_pending_expiry() {
        let cache = NamespaceDelayCache::new();
        cache.get_or_create("team-a", "+1h", TIMEOUT);

        let removed = cache.remove("team-a").unwrap();
        assert_eq!(removed.fake_time, "+1h");
        assert!(cache.remove("team-a").is_none());

        // The replacement outlives the cancelled timer's deadline
        tokio::time::sleep(Duration::from_secs(20)).await;
        cache.get_or_create("team-a", "+2h", TIMEOUT);
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(cache.get("team-a").unwrap().fake_time, "+2h");

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(cache.get("team-a").is_none());
    }

    /// Story: An expired namespace re-anchors on the next pod
    ///
    /// Once the anchor is gone the next admission sees no stale value and
    /// anchors its own annotation instead.
    #[tokio::test(start_paused = true)]
    async fn story_expired_namespace_reanchors() {
        let cache = NamespaceDelayCache::new();
        cache.get_or_create("game", "2024-01-01 00:00:00", TIMEOUT);

        tokio::time::sleep(TIMEOUT + Duration::from_secs(1)).await;

        let anchor = cache.get_or_create("game", "2025-06-01 00:00:00", TIMEOUT);
        match anchor {
            Anchor::Created(entry) => assert_eq!(entry.fake_time, "2025-06-01 00:00:00"),
            other => panic!("expected a fresh anchor, got {:?}", other),
        }
    }

    /// Story: Pods admitted five seconds apart see clocks five seconds apart
    #[test]
    fn story_absolute_anchor_advances_with_wall_clock() {
        let created_at = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
            .and_utc();
        let entry = NamespaceDelayEntry {
            namespace: "game".to_string(),
            fake_time: "2020-01-01 00:00:00".to_string(),
            created_at,
        };

        let first = entry.fake_time_at(created_at).unwrap();
        let second = entry.fake_time_at(created_at + TimeDelta::seconds(5)).unwrap();

        match (first, second) {
            (FakeTimeSpec::Absolute(a), FakeTimeSpec::Absolute(b)) => {
                assert_eq!(b - a, TimeDelta::seconds(5));
                assert_eq!(a.to_string(), "2020-01-01 00:00:00");
            }
            other => panic!("expected absolute times, got {:?}", other),
        }
    }

    #[test]
    fn offset_anchor_is_reevaluated_identically() {
        let entry = NamespaceDelayEntry {
            namespace: "game".to_string(),
            fake_time: "+1d2h".to_string(),
            created_at: Utc::now(),
        };
        let later = entry.created_at + TimeDelta::seconds(30);
        assert_eq!(
            entry.fake_time_at(later).unwrap(),
            FakeTimeSpec::Offset(TimeDelta::seconds(93_600))
        );
    }
}
