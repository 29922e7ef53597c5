//! Ephemeral session cache.
//!
//! The client keeps no durable local state: the only cached values are the
//! auth-token snapshot and the recent-search list, both process-lifetime.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{de::DeserializeOwned, Serialize};

const RECENT_SEARCH_LIMIT: usize = 10;

pub struct SessionCache {
    entries: Mutex<HashMap<String, String>>,
    searches: Mutex<Vec<String>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            searches: Mutex::new(Vec::new()),
        }
    }

    /// Save a value under a key. Returns `true` if the value serialized.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => {
                self.entries.lock().unwrap().insert(key.to_string(), json);
                true
            }
            Err(_) => false,
        }
    }

    /// Load a value by key. `None` if the key is absent or fails to decode.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entries = self.entries.lock().unwrap();
        let json = entries.get(key)?;
        serde_json::from_str(json).ok()
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    pub fn exists(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    /// Record a search term, most recent first, deduplicated, bounded.
    pub fn remember_search(&self, term: &str) {
        let term = term.trim();
        if term.is_empty() {
            return;
        }
        let mut searches = self.searches.lock().unwrap();
        searches.retain(|s| s != term);
        searches.insert(0, term.to_string());
        searches.truncate(RECENT_SEARCH_LIMIT);
    }

    pub fn recent_searches(&self) -> Vec<String> {
        self.searches.lock().unwrap().clone()
    }

    /// Drop everything; used on logout.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
        self.searches.lock().unwrap().clear();
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}
