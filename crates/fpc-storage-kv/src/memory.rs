//! In-process [`KvStore`].

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::store::{KvError, KvStore};

#[derive(Debug)]
enum Value {
    Hash(HashMap<String, Vec<u8>>),
    Plain { data: Vec<u8>, expires: Instant },
}

/// Thread-safe in-memory store with Redis semantics for the commands in
/// [`KvStore`].
#[derive(Debug, Default)]
pub struct MemoryKv {
    data: RwLock<HashMap<String, Value>>,
}

impl MemoryKv {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|v| !matches!(v, Value::Plain { expires, .. } if *expires <= now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_hash<T>(
        &self,
        key: &str,
        f: impl FnOnce(Option<&HashMap<String, Vec<u8>>>) -> T,
    ) -> Result<T, KvError> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        match data.get(key) {
            None => Ok(f(None)),
            Some(Value::Hash(hash)) => Ok(f(Some(hash))),
            Some(Value::Plain { .. }) => Err(KvError::WrongType(key.to_owned())),
        }
    }

    fn with_hash_mut<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut HashMap<String, Vec<u8>>) -> T,
    ) -> Result<T, KvError> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let value = data
            .entry(key.to_owned())
            .or_insert_with(|| Value::Hash(HashMap::new()));
        let Value::Hash(hash) = value else {
            return Err(KvError::WrongType(key.to_owned()));
        };
        let result = f(hash);
        if hash.is_empty() {
            data.remove(key);
        }
        Ok(result)
    }
}

impl KvStore for MemoryKv {
    fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, KvError> {
        self.with_hash(key, |h| h.and_then(|h| h.get(field).cloned()))
    }

    fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<(), KvError> {
        self.with_hash_mut(key, |h| {
            h.insert(field.to_owned(), value.to_vec());
        })
    }

    fn hset_nx(&self, key: &str, field: &str, value: &[u8]) -> Result<bool, KvError> {
        self.with_hash_mut(key, |h| {
            if h.contains_key(field) {
                false
            } else {
                h.insert(field.to_owned(), value.to_vec());
                true
            }
        })
    }

    fn hdel(&self, key: &str, fields: &[&str]) -> Result<usize, KvError> {
        self.with_hash_mut(key, |h| {
            fields.iter().filter(|f| h.remove(**f).is_some()).count()
        })
    }

    fn hexists(&self, key: &str, field: &str) -> Result<bool, KvError> {
        self.with_hash(key, |h| h.is_some_and(|h| h.contains_key(field)))
    }

    fn hlen(&self, key: &str) -> Result<usize, KvError> {
        self.with_hash(key, |h| h.map_or(0, HashMap::len))
    }

    fn hkeys(&self, key: &str) -> Result<Vec<String>, KvError> {
        self.with_hash(key, |h| {
            h.map(|h| h.keys().cloned().collect()).unwrap_or_default()
        })
    }

    fn del(&self, key: &str) -> Result<bool, KvError> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        Ok(data.remove(key).is_some())
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), KvError> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let value = data
            .remove(from)
            .ok_or_else(|| KvError::Unavailable(format!("no such key: {from}")))?;
        data.insert(to.to_owned(), value);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        Ok(data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn set_nx_px(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, KvError> {
        let now = Instant::now();
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        match data.get(key) {
            Some(Value::Plain { expires, .. }) if *expires > now => Ok(false),
            Some(Value::Hash(_)) => Ok(false),
            _ => {
                data.insert(
                    key.to_owned(),
                    Value::Plain {
                        data: value.to_vec(),
                        expires: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }
}
