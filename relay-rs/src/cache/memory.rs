use super::{Error, KeyValueCache};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

#[derive(Debug, Clone)]
enum Value {
    Raw(Vec<u8>),
    Hash(HashMap<String, Vec<u8>>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Single-process stand-in for the shared key-value server, with the same
/// operation semantics (create-only fields, compare-and-set, TTL expiry).
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryCache {
    fn with_live_entry<T>(
        &self,
        key: &str,
        f: impl FnOnce(Option<&mut Entry>) -> T,
    ) -> T {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(key);
        }
        f(entries.get_mut(key))
    }

    fn insert(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let mut entries = self.entries.lock();
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        entries.insert(key.to_string(), Entry { value, expires_at });
    }

    fn hash_entry<T>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        f: impl FnOnce(&mut HashMap<String, Vec<u8>>) -> T,
    ) -> Result<T, Error> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(key);
        }
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        if let Some(ttl) = ttl {
            entry.expires_at = Some(now + ttl);
        }
        match &mut entry.value {
            Value::Hash(fields) => Ok(f(fields)),
            Value::Raw(..) => {
                Err(Error::Backend(format!("key `{key}` holds a plain value, not a hash")))
            }
        }
    }
}

#[async_trait]
impl KeyValueCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.with_live_entry(key, |entry| {
            entry.and_then(|entry| match &entry.value {
                Value::Raw(raw) => Some(raw.clone()),
                Value::Hash(..) => None,
            })
        }))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), Error> {
        self.insert(key, Value::Raw(value.to_vec()), ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, Error> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(key);
        }
        let current = entries.get(key).and_then(|entry| match &entry.value {
            Value::Raw(raw) => Some(raw.as_slice()),
            Value::Hash(..) => None,
        });
        if current != expected {
            return Ok(false)
        }
        let expires_at = ttl.map(|ttl| now + ttl);
        entries.insert(key.to_string(), Entry { value: Value::Raw(value.to_vec()), expires_at });
        Ok(true)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.with_live_entry(key, |entry| {
            entry.and_then(|entry| match &entry.value {
                Value::Hash(fields) => fields.get(field).cloned(),
                Value::Raw(..) => None,
            })
        }))
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, Error> {
        Ok(self.with_live_entry(key, |entry| {
            entry
                .map(|entry| match &entry.value {
                    Value::Hash(fields) => fields.clone(),
                    Value::Raw(..) => HashMap::new(),
                })
                .unwrap_or_default()
        }))
    }

    async fn hset(
        &self,
        key: &str,
        field: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), Error> {
        self.hash_entry(key, ttl, |fields| {
            fields.insert(field.to_string(), value.to_vec());
        })
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &[u8]) -> Result<bool, Error> {
        self.hash_entry(key, None, |fields| {
            if fields.contains_key(field) {
                false
            } else {
                fields.insert(field.to_string(), value.to_vec());
                true
            }
        })
    }

    async fn hcompare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> Result<bool, Error> {
        self.hash_entry(key, None, |fields| {
            let current = fields.get(field).map(|raw| raw.as_slice());
            if current != expected {
                return false
            }
            fields.insert(field.to_string(), value.to_vec());
            true
        })
    }

    async fn hlen(&self, key: &str) -> Result<usize, Error> {
        Ok(self.with_live_entry(key, |entry| {
            entry
                .map(|entry| match &entry.value {
                    Value::Hash(fields) => fields.len(),
                    Value::Raw(..) => 0,
                })
                .unwrap_or_default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn compare_and_set_guards_concurrent_writers() {
        let cache = InMemoryCache::default();
        // create-if-absent
        assert!(cache.compare_and_set("k", None, b"a", None).await.unwrap());
        // stale expectation loses
        assert!(!cache.compare_and_set("k", None, b"b", None).await.unwrap());
        assert!(!cache.compare_and_set("k", Some(b"x"), b"b", None).await.unwrap());
        // correct expectation wins
        assert!(cache.compare_and_set("k", Some(b"a"), b"b", None).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), Some(b"b".to_vec()));
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = InMemoryCache::default();
        cache.set("k", b"v", Some(Duration::from_millis(10))).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        // an expired key can be re-created with compare-and-set against absence
        assert!(cache.compare_and_set("k", None, b"w", None).await.unwrap());
    }

    #[tokio::test]
    async fn hash_fields_are_independent() {
        let cache = InMemoryCache::default();
        assert!(cache.hset_nx("h", "a", b"1").await.unwrap());
        assert!(!cache.hset_nx("h", "a", b"2").await.unwrap());
        cache.hset("h", "b", b"3", None).await.unwrap();
        assert_eq!(cache.hget("h", "a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(cache.hlen("h").await.unwrap(), 2);
        assert!(cache.hcompare_and_set("h", "a", Some(b"1"), b"9").await.unwrap());
        assert!(!cache.hcompare_and_set("h", "a", Some(b"1"), b"0").await.unwrap());
        assert_eq!(cache.hget("h", "a").await.unwrap(), Some(b"9".to_vec()));
    }
}
