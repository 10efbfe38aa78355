use std::collections::HashMap;

/// Incrementally maintained materialized collection, deduplicated by domain
/// key, fed by historical and live streams at once.
///
/// Conflict rule: highest order wins; an equal order is taken as a newer
/// observation of the same entity, so the later write replaces. `remove`
/// leaves no tombstone: a stale upsert arriving after a removal re-inserts
/// the entry. That matches the source system, which has no causal ordering
/// for the removal event (see DESIGN.md).
#[derive(Debug, Clone)]
pub struct LiveMergeCollection<V> {
    entries: HashMap<String, Entry<V>>,
}

#[derive(Debug, Clone)]
struct Entry<V> {
    order: i64,
    value: V,
}

impl<V> Default for LiveMergeCollection<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> LiveMergeCollection<V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Insert or replace. Returns true when the value was taken, false when
    /// it was ignored as stale.
    pub fn upsert(&mut self, key: &str, value: V, order: i64) -> bool {
        match self.entries.get(key) {
            Some(existing) if existing.order > order => false,
            _ => {
                self.entries
                    .insert(key.to_string(), Entry { order, value });
                true
            }
        }
    }

    /// Delete if present. No tombstone is kept.
    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &V)> {
        self.entries.iter().map(|(k, e)| (k, &e.value))
    }

    /// Entries sorted by a caller-supplied key (e.g. an event's start date).
    pub fn sorted_by<K: Ord>(&self, sort_key: impl Fn(&V) -> K) -> Vec<(&String, &V)> {
        let mut out: Vec<(&String, &V)> = self.iter().collect();
        out.sort_by_key(|(_, v)| sort_key(v));
        out
    }
}

impl<V: Default> LiveMergeCollection<V> {
    /// Binary participation driven by `{key, remove}` events. Adding an
    /// existing member or removing an absent one is a no-op.
    pub fn set_membership(&mut self, key: &str, present: bool) {
        let has = self.entries.contains_key(key);
        if present && !has {
            self.entries.insert(
                key.to_string(),
                Entry {
                    order: 0,
                    value: V::default(),
                },
            );
        } else if !present && has {
            self.entries.remove(key);
        }
    }
}
