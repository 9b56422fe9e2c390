//! Transactional key/value façade.
//!
//! Every persistent object in the controller lives here under the key
//! conventions of the data model (`devices:…`, `event:…`, `cmd:…`,
//! `changeset:…`, `roaming:…`). The engine is a deterministic in-process
//! BTree so that iteration order is stable and in-memory caches can be
//! reconstructed on restart by replaying storage.

mod error;
pub mod keys;

pub use error::{StorageError, StorageResult};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

type Bytes = Vec<u8>;
type Projection = Box<dyn Fn(&str, &[u8]) -> Option<String> + Send + Sync>;
type Comparator = Box<dyn Fn(&str, &str) -> std::cmp::Ordering + Send + Sync>;

/// A named secondary index: keys matching `prefix` are projected to a
/// derived key; queries scan derived keys in comparator order.
struct Index {
    prefix: String,
    project: Projection,
    compare: Option<Comparator>,
    entries: BTreeMap<String, BTreeSet<String>>,
}

struct Inner {
    data: BTreeMap<String, Bytes>,
    indices: HashMap<String, Index>,
}

/// The storage façade shared by every component.
#[derive(Clone)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
}

/// Read-only view of the store inside a `view` transaction.
pub struct ViewTx<'a> {
    inner: &'a Inner,
}

impl ViewTx<'_> {
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.inner.data.get(key).cloned()
    }

    pub fn iterate_prefix(&self, prefix: &str) -> Vec<(String, Bytes)> {
        self.inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Half-open range `[start, end)` in lexicographic key order.
    pub fn iterate_range(&self, start: &str, end: &str) -> Vec<(String, Bytes)> {
        self.inner
            .data
            .range(start.to_string()..end.to_string())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Mutable transaction. Writes are staged and only applied if the closure
/// returns `Ok`; on error the store is untouched.
pub struct UpdateTx<'a> {
    base: &'a Inner,
    staged: BTreeMap<String, Option<Bytes>>,
}

impl UpdateTx<'_> {
    pub fn get(&self, key: &str) -> Option<Bytes> {
        match self.staged.get(key) {
            Some(Some(v)) => Some(v.clone()),
            Some(None) => None,
            None => self.base.data.get(key).cloned(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Bytes) {
        self.staged.insert(key.into(), Some(value));
    }

    pub fn delete(&mut self, key: &str) {
        self.staged.insert(key.to_string(), None);
    }

    pub fn iterate_prefix(&self, prefix: &str) -> Vec<(String, Bytes)> {
        let mut merged: BTreeMap<String, Option<Bytes>> = self
            .base
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), Some(v.clone())))
            .collect();
        for (k, v) in self.staged.range(prefix.to_string()..) {
            if !k.starts_with(prefix) {
                break;
            }
            merged.insert(k.clone(), v.clone());
        }
        merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                data: BTreeMap::new(),
                indices: HashMap::new(),
            })),
        }
    }

    /// Register a named secondary index over keys starting with `prefix`.
    /// `project` derives the index key from `(key, value)`; returning
    /// `None` leaves the record out of the index. An optional comparator
    /// orders query results; the default is lexicographic.
    pub fn register_index(
        &self,
        name: impl Into<String>,
        prefix: impl Into<String>,
        project: Projection,
        compare: Option<Comparator>,
    ) {
        let name = name.into();
        let prefix = prefix.into();
        let mut inner = self.inner.write().expect("storage lock poisoned");

        let mut entries: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (k, v) in inner
            .data
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
        {
            if let Some(derived) = project(k, v) {
                entries.entry(derived).or_default().insert(k.clone());
            }
        }

        inner.indices.insert(
            name,
            Index {
                prefix,
                project,
                compare,
                entries,
            },
        );
    }

    /// Run a read-only transaction.
    pub fn view<T>(&self, f: impl FnOnce(&ViewTx<'_>) -> StorageResult<T>) -> StorageResult<T> {
        let inner = self.inner.read().expect("storage lock poisoned");
        f(&ViewTx { inner: &inner })
    }

    /// Run a mutable transaction. Staged writes commit atomically when the
    /// closure succeeds and are discarded when it fails.
    pub fn update<T>(
        &self,
        f: impl FnOnce(&mut UpdateTx<'_>) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut inner = self.inner.write().expect("storage lock poisoned");
        let (out, staged) = {
            let mut tx = UpdateTx {
                base: &*inner,
                staged: BTreeMap::new(),
            };
            let out = f(&mut tx)?;
            (out, tx.staged)
        };

        for (key, value) in staged {
            Self::reindex(&mut inner, &key, value.as_deref());
            match value {
                Some(v) => {
                    inner.data.insert(key, v);
                }
                None => {
                    inner.data.remove(&key);
                }
            }
        }
        Ok(out)
    }

    fn reindex(inner: &mut Inner, key: &str, value: Option<&[u8]>) {
        for index in inner.indices.values_mut() {
            if !key.starts_with(&index.prefix) {
                continue;
            }
            // Remove any stale projection of this key.
            index.entries.retain(|_, keys| {
                keys.remove(key);
                !keys.is_empty()
            });
            if let Some(v) = value {
                if let Some(derived) = (index.project)(key, v) {
                    index
                        .entries
                        .entry(derived)
                        .or_default()
                        .insert(key.to_string());
                }
            }
        }
    }

    // Single-key convenience wrappers; each is its own atomic transaction.

    pub fn get(&self, key: &str) -> Option<Bytes> {
        let inner = self.inner.read().expect("storage lock poisoned");
        inner.data.get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Bytes) -> StorageResult<()> {
        let key = key.into();
        self.update(|tx| {
            tx.set(key.clone(), value.clone());
            Ok(())
        })
    }

    pub fn delete(&self, key: &str) -> StorageResult<()> {
        self.update(|tx| {
            tx.delete(key);
            Ok(())
        })
    }

    pub fn iterate_prefix(&self, prefix: &str) -> Vec<(String, Bytes)> {
        let inner = self.inner.read().expect("storage lock poisoned");
        ViewTx { inner: &inner }.iterate_prefix(prefix)
    }

    pub fn iterate_range(&self, start: &str, end: &str) -> Vec<(String, Bytes)> {
        let inner = self.inner.read().expect("storage lock poisoned");
        ViewTx { inner: &inner }.iterate_range(start, end)
    }

    /// Scan a named index over the half-open derived-key range
    /// `[start, end)`, returning `(derived_key, primary_key)` pairs in the
    /// index's comparator order.
    pub fn index_range(
        &self,
        name: &str,
        start: Option<&str>,
        end: Option<&str>,
    ) -> StorageResult<Vec<(String, String)>> {
        let inner = self.inner.read().expect("storage lock poisoned");
        let index = inner
            .indices
            .get(name)
            .ok_or_else(|| StorageError::UnknownIndex(name.to_string()))?;

        let mut out: Vec<(String, String)> = index
            .entries
            .iter()
            .filter(|(derived, _)| {
                start.map_or(true, |s| derived.as_str() >= s)
                    && end.map_or(true, |e| derived.as_str() < e)
            })
            .flat_map(|(derived, keys)| {
                keys.iter().map(move |k| (derived.clone(), k.clone()))
            })
            .collect();

        if let Some(cmp) = &index.compare {
            out.sort_by(|a, b| cmp(&a.0, &b.0));
        }
        Ok(out)
    }

    // Typed JSON helpers.

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        match self.get(key) {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_json<T: Serialize>(&self, key: impl Into<String>, value: &T) -> StorageResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, bytes)
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_commits_atomically() {
        let store = Store::new();
        store
            .update(|tx| {
                tx.set("a:1", b"one".to_vec());
                tx.set("a:2", b"two".to_vec());
                Ok(())
            })
            .unwrap();
        assert_eq!(store.get("a:1"), Some(b"one".to_vec()));
        assert_eq!(store.get("a:2"), Some(b"two".to_vec()));
    }

    #[test]
    fn failed_update_rolls_back() {
        let store = Store::new();
        store.set("a:1", b"one".to_vec()).unwrap();
        let res: StorageResult<()> = store.update(|tx| {
            tx.set("a:1", b"clobbered".to_vec());
            tx.set("a:2", b"two".to_vec());
            Err(StorageError::Aborted("test".into()))
        });
        assert!(res.is_err());
        assert_eq!(store.get("a:1"), Some(b"one".to_vec()));
        assert_eq!(store.get("a:2"), None);
    }

    #[test]
    fn prefix_and_range_iteration_are_ordered() {
        let store = Store::new();
        for (k, v) in [("event:001:x", "a"), ("event:002:y", "b"), ("cmd:1", "c")] {
            store.set(k, v.as_bytes().to_vec()).unwrap();
        }
        let events = store.iterate_prefix("event:");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "event:001:x");

        let range = store.iterate_range("event:001", "event:002");
        assert_eq!(range.len(), 1);
        assert_eq!(range[0].0, "event:001:x");
    }

    #[test]
    fn staged_reads_see_own_writes() {
        let store = Store::new();
        store.set("k", b"old".to_vec()).unwrap();
        store
            .update(|tx| {
                tx.set("k", b"new".to_vec());
                assert_eq!(tx.get("k"), Some(b"new".to_vec()));
                tx.delete("k");
                assert_eq!(tx.get("k"), None);
                Ok(())
            })
            .unwrap();
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn secondary_index_tracks_updates() {
        let store = Store::new();
        store.register_index(
            "events_by_type",
            "event:",
            Box::new(|_k, v| {
                serde_json::from_slice::<serde_json::Value>(v)
                    .ok()
                    .and_then(|j| j["event_type"].as_str().map(str::to_string))
            }),
            None,
        );
        store
            .put_json("event:001:a", &serde_json::json!({"event_type": "boot"}))
            .unwrap();
        store
            .put_json("event:002:b", &serde_json::json!({"event_type": "roam"}))
            .unwrap();

        let boots = store.index_range("events_by_type", Some("boot"), Some("boot\u{10FFFF}"));
        assert_eq!(boots.unwrap().len(), 1);

        store.delete("event:001:a").unwrap();
        let boots = store
            .index_range("events_by_type", Some("boot"), Some("boot\u{10FFFF}"))
            .unwrap();
        assert!(boots.is_empty());
    }
}
