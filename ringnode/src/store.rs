//! Entry storage for the range a node owns.
//!
//! A hash map keyed by the full entry key. Ranges move in bulk on join and
//! leave, so the map tracks removals since the last insert and shrinks once
//! enough of it has been drained.

use hashbrown::HashMap;

use crate::types::{Entry, Key};

/// Removals without an intervening insert before the map is shrunk.
const SHRINK_AFTER_REMOVALS: usize = 64;

#[derive(Default)]
pub struct EntryStore {
    entries: HashMap<Key, (Vec<u8>, Vec<u8>)>,
    removals_since_insert: usize,
}

impl EntryStore {
    /// Create an empty store.
    pub fn create() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `entry.key`.
    pub fn insert(&mut self, entry: Entry) {
        self.removals_since_insert = 0;
        self.entries.insert(entry.key, (entry.name, entry.email));
    }

    /// Remove by exact key. Returns the removed entry, if any.
    pub fn remove_by_key(&mut self, key: &Key) -> Option<Entry> {
        let (name, email) = self.entries.remove(key)?;
        self.note_removals(1);
        Some(Entry {
            key: *key,
            name,
            email,
        })
    }

    pub fn find_by_key(&self, key: &Key) -> Option<Entry> {
        self.entries.get(key).map(|(name, email)| Entry {
            key: *key,
            name: name.clone(),
            email: email.clone(),
        })
    }

    /// Copies of every stored entry, in no particular order.
    pub fn entries(&self) -> impl Iterator<Item = Entry> + '_ {
        self.entries.iter().map(|(key, (name, email))| Entry {
            key: *key,
            name: name.clone(),
            email: email.clone(),
        })
    }

    /// Remove and return every entry whose key satisfies `pred`, ordered by key.
    pub fn drain_matching<F>(&mut self, mut pred: F) -> Vec<Entry>
    where
        F: FnMut(&Key) -> bool,
    {
        let mut drained: Vec<Entry> = self
            .entries
            .extract_if(|k, _| pred(k))
            .map(|(key, (name, email))| Entry { key, name, email })
            .collect();
        drained.sort_by(|a, b| a.key.cmp(&b.key));
        self.note_removals(drained.len());
        drained
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.entries.shrink_to_fit();
        self.removals_since_insert = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn note_removals(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.removals_since_insert = self.removals_since_insert.saturating_add(n);
        if self.removals_since_insert >= SHRINK_AFTER_REMOVALS {
            self.entries.shrink_to_fit();
            self.removals_since_insert = 0;
        }
    }
}
