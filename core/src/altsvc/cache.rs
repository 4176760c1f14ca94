//! Process-wide store of Alt-Svc advertisements.
//!
//! # Design
//! One mutex covers the whole store. This is the only state shared between
//! sessions that may run on different threads; everything a session owns is
//! single-threaded. Entries are never rewritten after insertion except for the
//! noop flag, and expiry is lazy: stale entries are pruned by the lookup that
//! finds them.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::origin::Origin;

/// An alternate service for some origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AltSvcEntry {
    /// The alternate origin traffic may be moved to.
    pub origin: Origin,
    pub params: BTreeMap<String, String>,
    #[serde(skip)]
    pub expires_at: Option<Instant>,
    /// Set once the alternate turned out to be unusable.
    pub noop: bool,
}

impl AltSvcEntry {
    pub fn new(origin: Origin, params: BTreeMap<String, String>) -> Self {
        Self {
            origin,
            params,
            expires_at: None,
            noop: false,
        }
    }

    /// The `ma` (max-age) parameter in seconds, when present and numeric.
    pub fn max_age(&self) -> Option<Duration> {
        self.params
            .get("ma")
            .and_then(|ma| ma.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

type Store = HashMap<Origin, Vec<AltSvcEntry>>;

/// Shared handle to an Alt-Svc store. Clones point at the same entries.
#[derive(Debug, Clone, Default)]
pub struct AltSvcCache {
    inner: Arc<Mutex<Store>>,
}

static GLOBAL: OnceLock<AltSvcCache> = OnceLock::new();

impl AltSvcCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache, created on first use and kept until exit.
    pub fn global() -> AltSvcCache {
        GLOBAL.get_or_init(AltSvcCache::new).clone()
    }

    /// Usable alternates for `origin`.
    pub fn get(&self, origin: &Origin) -> Vec<AltSvcEntry> {
        self.get_at(origin, Instant::now())
    }

    /// Like [`get`](Self::get) with an explicit clock. Expired entries seen
    /// here are dropped for good; noop entries are kept but not returned.
    pub fn get_at(&self, origin: &Origin, now: Instant) -> Vec<AltSvcEntry> {
        let mut store = self.lock();
        let Some(entries) = store.get_mut(origin) else {
            return Vec::new();
        };
        entries.retain(|entry| entry.is_live(now));
        entries.iter().filter(|entry| !entry.noop).cloned().collect()
    }

    /// Record `entry` as an alternate for `origin`.
    pub fn set(&self, origin: &Origin, entry: AltSvcEntry) -> Option<AltSvcEntry> {
        self.set_at(origin, entry, Instant::now())
    }

    /// Like [`set`](Self::set) with an explicit clock. Returns `None` when the
    /// alternate is already known for `origin`, expired or not.
    pub fn set_at(&self, origin: &Origin, mut entry: AltSvcEntry, now: Instant) -> Option<AltSvcEntry> {
        let mut store = self.lock();
        let entries = store.entry(origin.clone()).or_default();
        if entries.iter().any(|known| known.origin == entry.origin) {
            return None;
        }
        // an `ma` past the clock's range never expires
        entry.expires_at = entry.max_age().and_then(|ma| now.checked_add(ma));
        entries.push(entry.clone());
        Some(entry)
    }

    /// Flag the `alternate` of `origin` as unusable. Returns whether an entry
    /// was found.
    pub fn mark_noop(&self, origin: &Origin, alternate: &Origin) -> bool {
        let mut store = self.lock();
        let Some(entry) = store
            .get_mut(origin)
            .and_then(|entries| entries.iter_mut().find(|e| &e.origin == alternate))
        else {
            return false;
        };
        entry.noop = true;
        true
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Origin {
        Origin::new("https", "example.com", 443)
    }

    fn entry(host: &str, ma: Option<&str>) -> AltSvcEntry {
        let mut params = BTreeMap::new();
        if let Some(ma) = ma {
            params.insert("ma".to_string(), ma.to_string());
        }
        AltSvcEntry::new(Origin::new("h2", host, 443), params)
    }

    #[test]
    fn second_set_for_same_alternate_is_rejected() {
        let cache = AltSvcCache::new();
        assert!(cache.set(&origin(), entry("alt.example.com", Some("3600"))).is_some());
        assert!(cache.set(&origin(), entry("alt.example.com", Some("60"))).is_none());
        assert_eq!(cache.get(&origin()).len(), 1);
    }

    #[test]
    fn distinct_alternates_coexist() {
        let cache = AltSvcCache::new();
        cache.set(&origin(), entry("a.example.com", None));
        cache.set(&origin(), entry("b.example.com", None));
        assert_eq!(cache.get(&origin()).len(), 2);
    }

    #[test]
    fn zero_max_age_is_expired_immediately() {
        let cache = AltSvcCache::new();
        let t = Instant::now();
        let stored = cache.set_at(&origin(), entry("alt.example.com", Some("0")), t).unwrap();
        assert_eq!(stored.expires_at, Some(t));
        assert!(cache.get_at(&origin(), t).is_empty());
        assert!(cache.get_at(&origin(), t + Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn expired_entries_are_pruned_on_read() {
        let cache = AltSvcCache::new();
        let t = Instant::now();
        cache.set_at(&origin(), entry("alt.example.com", Some("10")), t);
        assert_eq!(cache.get_at(&origin(), t + Duration::from_secs(9)).len(), 1);
        assert!(cache.get_at(&origin(), t + Duration::from_secs(10)).is_empty());

        // pruned, so the same alternate can be advertised again
        assert!(cache.set_at(&origin(), entry("alt.example.com", Some("10")), t).is_some());
    }

    #[test]
    fn entries_without_max_age_never_expire() {
        let cache = AltSvcCache::new();
        let t = Instant::now();
        cache.set_at(&origin(), entry("alt.example.com", None), t);
        let later = t + Duration::from_secs(365 * 24 * 3600);
        assert_eq!(cache.get_at(&origin(), later).len(), 1);
    }

    #[test]
    fn non_numeric_max_age_is_ignored() {
        let stored = AltSvcCache::new()
            .set(&origin(), entry("alt.example.com", Some("soon")))
            .unwrap();
        assert_eq!(stored.expires_at, None);
    }

    #[test]
    fn noop_entries_are_hidden_but_retained() {
        let cache = AltSvcCache::new();
        let alt = entry("alt.example.com", None);
        cache.set(&origin(), alt.clone());
        assert!(cache.mark_noop(&origin(), &alt.origin));
        assert!(cache.get(&origin()).is_empty());
        assert!(cache.set(&origin(), alt).is_none());
    }

    #[test]
    fn mark_noop_on_unknown_entry() {
        let cache = AltSvcCache::new();
        assert!(!cache.mark_noop(&origin(), &Origin::new("h2", "x", 443)));
    }

    #[test]
    fn unknown_origin_is_a_miss() {
        assert!(AltSvcCache::new().get(&origin()).is_empty());
    }

    #[test]
    fn clones_share_the_store() {
        let cache = AltSvcCache::new();
        let other = cache.clone();
        cache.set(&origin(), entry("alt.example.com", None));
        assert_eq!(other.get(&origin()).len(), 1);
        other.clear();
        assert!(cache.get(&origin()).is_empty());
    }

    #[test]
    fn global_is_a_single_store() {
        let shared = Origin::new("https", "global-cache.invalid", 443);
        AltSvcCache::global().set(&shared, entry("alt.global-cache.invalid", None));
        assert_eq!(AltSvcCache::global().get(&shared).len(), 1);
    }

    #[test]
    fn concurrent_sets_keep_one_entry() {
        let cache = AltSvcCache::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.set(&origin(), entry("alt.example.com", None)).is_some())
            })
            .collect();
        let accepted = handles.into_iter().map(|h| h.join().unwrap()).filter(|won| *won).count();
        assert_eq!(accepted, 1);
        assert_eq!(cache.get(&origin()).len(), 1);
    }

    #[test]
    fn serialized_entry_omits_clock_state() {
        let cache = AltSvcCache::new();
        let stored = cache.set(&origin(), entry("alt.example.com", Some("60"))).unwrap();
        let json: serde_json::Value = serde_json::to_value(&stored).unwrap();
        assert_eq!(json["origin"]["host"], "alt.example.com");
        assert_eq!(json["params"]["ma"], "60");
        assert_eq!(json["noop"], false);
        assert!(json.get("expires_at").is_none());
    }

    #[test]
    fn max_age_beyond_the_clock_never_expires() {
        let cache = AltSvcCache::new();
        let ma = u64::MAX.to_string();
        let stored = cache.set(&origin(), entry("alt.example.com", Some(&ma))).unwrap();
        assert_eq!(stored.expires_at, None);
        assert_eq!(cache.get(&origin()).len(), 1);
    }
}
