use crate::{
    error::{Error, Result},
    lock_utilities::MappedMutex,
};
use clippy_utilities::Cast;
use parking_lot::Mutex;
use std::{fmt, mem, sync::Arc};
use tracing::warn;

/// Bucket counts the registry can be sized to
pub const PRIME_LADDER: [usize; 4] = [1543, 3079, 6151, 12289];

/// One chained entry
struct Item<V> {
    /// Endpoint id
    key: u32,
    /// Associated value
    value: V,
    /// Next entry of the same bucket
    next: Option<Box<Item<V>>>,
}

/// Map from endpoint id to connection, chained buckets indexed by `key % bucket_count`.
///
/// Sized once from the expected number of connections: the bucket count is the first
/// prime of `PRIME_LADDER` not below `expected * 3 / 2`.
pub struct ConnectionRegistry<V> {
    /// Bucket heads
    buckets: Vec<Option<Box<Item<V>>>>,
    /// Number of entries
    len: usize,
}

impl<V: Copy> ConnectionRegistry<V> {
    /// Size a registry for `expected` connections
    pub fn with_expected(expected: usize) -> Result<Self> {
        let wanted = expected.saturating_mul(3) / 2;
        let size = PRIME_LADDER
            .iter()
            .copied()
            .find(|&prime| prime >= wanted)
            .ok_or_else(|| {
                Error::Resource(format!(
                    "no registry size for {expected} connections, at most {} buckets",
                    PRIME_LADDER[PRIME_LADDER.len().saturating_sub(1)]
                ))
            })?;
        let mut buckets = Vec::with_capacity(size);
        buckets.resize_with(size, || None);
        Ok(Self { buckets, len: 0 })
    }

    /// Bucket of a key
    fn bucket_of(&self, key: u32) -> usize {
        let key: usize = key.cast();
        key % self.buckets.len()
    }

    /// Insert or replace the value of `key`, returning the replaced value
    pub fn insert(&mut self, key: u32, value: V) -> Option<V> {
        let idx = self.bucket_of(key);
        let mut cursor = self.buckets[idx].as_deref_mut();
        while let Some(item) = cursor {
            if item.key == key {
                warn!("endpoint {} registered twice", key);
                return Some(mem::replace(&mut item.value, value));
            }
            cursor = item.next.as_deref_mut();
        }
        let next = self.buckets[idx].take();
        self.buckets[idx] = Some(Box::new(Item { key, value, next }));
        self.len = self.len.saturating_add(1);
        None
    }

    /// Look up the value of `key`
    #[must_use]
    pub fn lookup(&self, key: u32) -> Option<V> {
        let mut cursor = self.buckets[self.bucket_of(key)].as_deref();
        while let Some(item) = cursor {
            if item.key == key {
                return Some(item.value);
            }
            cursor = item.next.as_deref();
        }
        None
    }

    /// Remove `key`, returning its value
    pub fn remove(&mut self, key: u32) -> Option<V> {
        let idx = self.bucket_of(key);
        // relink the chain without the removed entry; chains are short
        let mut rest = self.buckets[idx].take();
        let mut kept: Option<Box<Item<V>>> = None;
        let mut removed = None;
        while let Some(mut item) = rest {
            rest = item.next.take();
            if removed.is_none() && item.key == key {
                removed = Some(item.value);
            } else {
                item.next = kept;
                kept = Some(item);
            }
        }
        self.buckets[idx] = kept;
        if removed.is_some() {
            self.len = self.len.saturating_sub(1);
        }
        removed
    }

    /// Number of entries
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether there are no entries
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of buckets
    #[inline]
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

impl<V> Drop for ConnectionRegistry<V> {
    fn drop(&mut self) {
        // unlink iteratively so long chains never recurse
        for bucket in &mut self.buckets {
            let mut rest = bucket.take();
            while let Some(mut item) = rest {
                rest = item.next.take();
            }
        }
    }
}

impl<V> fmt::Debug for ConnectionRegistry<V> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("buckets", &self.buckets.len())
            .field("len", &self.len)
            .finish()
    }
}

/// A registry shared by the workers that consume one shared receive queue
#[derive(Debug)]
pub struct SharedRegistry<V> {
    /// The registry behind its lock
    inner: Arc<Mutex<ConnectionRegistry<V>>>,
}

impl<V> Clone for SharedRegistry<V> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Copy> SharedRegistry<V> {
    /// Size a shared registry for `expected` connections
    pub fn with_expected(expected: usize) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(ConnectionRegistry::with_expected(expected)?)),
        })
    }

    /// Insert or replace the value of `key`
    #[inline]
    pub fn insert(&self, key: u32, value: V) -> Option<V> {
        self.inner.map_write(|registry| registry.insert(key, value))
    }

    /// Look up the value of `key`
    #[inline]
    #[must_use]
    pub fn lookup(&self, key: u32) -> Option<V> {
        self.inner.map_read(|registry| registry.lookup(key))
    }

    /// Remove `key`
    #[inline]
    pub fn remove(&self, key: u32) -> Option<V> {
        self.inner.map_write(|registry| registry.remove(key))
    }

    /// Number of entries
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.map_read(|registry| registry.len())
    }

    /// Whether there are no entries
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
