//! Process-local tag index.
//!
//! Filled on every successful write of a tagged entry. Keys written by
//! other processes are not reachable through it. Each key remembers when
//! its entry expires; expired keys are swept on every `PRUNE_EVERY`th
//! write, skipped by `take`, and dropped by `prune_expired`.

use recall_core::CacheKey;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const PRUNE_EVERY: u64 = 256;

#[derive(Debug, Clone)]
struct Tagged {
    tiers: Vec<String>,
    expires_at: Option<Instant>,
}

impl Tagged {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Default)]
struct TagState {
    /// tag -> key -> where and until when the key was written
    tags: HashMap<String, HashMap<CacheKey, Tagged>>,
    writes: u64,
}

impl TagState {
    fn prune(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        self.tags.retain(|_, keys| {
            let before = keys.len();
            keys.retain(|_, tagged| !tagged.is_expired(now));
            removed += before - keys.len();
            !keys.is_empty()
        });
        removed
    }
}

#[derive(Debug, Default)]
pub struct TagIndex {
    state: Mutex<TagState>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tags: &BTreeSet<String>, key: &CacheKey, tiers: &[String], ttl: Option<Duration>) {
        if tags.is_empty() {
            return;
        }
        let now = Instant::now();
        let tagged = Tagged {
            tiers: tiers.to_vec(),
            expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
        };
        if let Ok(mut state) = self.state.lock() {
            state.writes += 1;
            if state.writes % PRUNE_EVERY == 0 {
                state.prune(now);
            }
            for tag in tags {
                state
                    .tags
                    .entry(tag.clone())
                    .or_default()
                    .insert(key.clone(), tagged.clone());
            }
        }
    }

    /// Remove a tag and return its live keys with the tiers they were written to.
    pub fn take(&self, tag: &str) -> Vec<(CacheKey, Vec<String>)> {
        let taken = match self.state.lock() {
            Ok(mut state) => state.tags.remove(tag).unwrap_or_default(),
            Err(_) => return Vec::new(),
        };
        let now = Instant::now();
        let mut keys: Vec<_> = taken
            .into_iter()
            .filter(|(_, tagged)| !tagged.is_expired(now))
            .map(|(key, tagged)| (key, tagged.tiers))
            .collect();
        keys.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        keys
    }

    /// Drop `key` from every tag.
    pub fn forget(&self, key: &CacheKey) {
        if let Ok(mut state) = self.state.lock() {
            state.tags.retain(|_, keys| {
                keys.remove(key);
                !keys.is_empty()
            });
        }
    }

    /// Forget that keys live in `tiers`. Keys left with no tier are dropped.
    pub fn forget_tiers(&self, tiers: &[String]) {
        if let Ok(mut state) = self.state.lock() {
            state.tags.retain(|_, keys| {
                keys.retain(|_, tagged| {
                    tagged.tiers.retain(|tier| !tiers.contains(tier));
                    !tagged.tiers.is_empty()
                });
                !keys.is_empty()
            });
        }
    }

    /// Drop keys whose entries have expired. Returns how many tag links went.
    pub fn prune_expired(&self) -> usize {
        self.state
            .lock()
            .map(|mut state| state.prune(Instant::now()))
            .unwrap_or(0)
    }

    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .state
            .lock()
            .map(|state| state.tags.keys().cloned().collect())
            .unwrap_or_default();
        tags.sort();
        tags
    }

    pub fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.tags.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_record_and_take() {
        let index = TagIndex::new();
        let tiers = vec!["memory".to_string()];
        index.record(&tags(&["users", "hot"]), &CacheKey::new("recall:a"), &tiers, None);
        index.record(&tags(&["users"]), &CacheKey::new("recall:b"), &tiers, None);

        let users = index.take("users");
        let keys: Vec<&str> = users.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["recall:a", "recall:b"]);
        assert!(index.take("users").is_empty());
        assert_eq!(index.tags(), vec!["hot".to_string()]);
    }

    #[test]
    fn test_forget_drops_empty_tags() {
        let index = TagIndex::new();
        let key = CacheKey::new("recall:a");
        index.record(&tags(&["t"]), &key, &["memory".to_string()], None);
        index.forget(&key);
        assert!(index.tags().is_empty());
    }

    #[test]
    fn test_untagged_writes_are_ignored() {
        let index = TagIndex::new();
        index.record(&BTreeSet::new(), &CacheKey::new("recall:a"), &["memory".to_string()], None);
        assert!(index.tags().is_empty());
    }

    #[test]
    fn test_expired_keys_leave_the_index() {
        let index = TagIndex::new();
        let memory = vec!["memory".to_string()];
        index.record(&tags(&["t"]), &CacheKey::new("recall:short"), &memory, Some(Duration::from_millis(10)));
        index.record(&tags(&["t"]), &CacheKey::new("recall:long"), &memory, None);
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(index.prune_expired(), 1);
        assert_eq!(index.prune_expired(), 0);
        let live = index.take("t");
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].0.as_str(), "recall:long");
    }

    #[test]
    fn test_take_skips_expired_keys() {
        let index = TagIndex::new();
        index.record(
            &tags(&["t"]),
            &CacheKey::new("recall:a"),
            &["memory".to_string()],
            Some(Duration::from_millis(5)),
        );
        std::thread::sleep(Duration::from_millis(15));
        assert!(index.take("t").is_empty());
        assert!(index.tags().is_empty());
    }

    #[test]
    fn test_writes_sweep_expired_keys() {
        let index = TagIndex::new();
        let memory = vec!["memory".to_string()];
        index.record(&tags(&["old"]), &CacheKey::new("recall:old"), &memory, Some(Duration::from_millis(5)));
        std::thread::sleep(Duration::from_millis(15));
        for i in 1..PRUNE_EVERY {
            index.record(&tags(&["new"]), &CacheKey::new(format!("recall:{i}")), &memory, None);
        }
        assert_eq!(index.tags(), vec!["new".to_string()]);
    }

    #[test]
    fn test_forget_tiers() {
        let index = TagIndex::new();
        let both = vec!["memory".to_string(), "disk".to_string()];
        index.record(&tags(&["t"]), &CacheKey::new("recall:both"), &both, None);
        index.record(&tags(&["t"]), &CacheKey::new("recall:mem"), &both[..1], None);

        index.forget_tiers(&["memory".to_string()]);
        let left = index.take("t");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].0.as_str(), "recall:both");
        assert_eq!(left[0].1, vec!["disk".to_string()]);
    }
}
