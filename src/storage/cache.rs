//! Write-back object cache
//!
//! One [`Cache`] per object kind keeps recently used objects resident,
//! loads misses from the [`KvStore`] and writes dirty objects back before
//! dropping them. Entries are handed out as `Arc<Entry<T>>`; an entry that
//! someone still holds is never evicted, so an object is never resident
//! twice and in-flight readers keep a valid view.
//!
//! Lock order: the entry map lock is never held while waiting on an
//! entry's value lock or on the store, apart from the non-blocking dirty /
//! size checks.

use crate::storage::codec::{decode_record, encode_record, Kind};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::kv::KvStore;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// An object the cache can persist
pub trait Persist: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: Kind;

    /// Approximate in-memory footprint in bytes
    fn size_hint(&self) -> usize;

    fn encode(&self) -> StorageResult<Vec<u8>> {
        encode_record(Self::KIND, self)
    }

    fn decode(bytes: &[u8]) -> StorageResult<Self> {
        decode_record(Self::KIND, bytes)
    }
}

/// A resident object plus its write-back state
pub struct Entry<T> {
    value: RwLock<T>,
    dirty: AtomicBool,
    size: AtomicUsize,
}

impl<T: Persist> Entry<T> {
    fn new(value: T, dirty: bool) -> Self {
        let size = value.size_hint();
        Self {
            value: RwLock::new(value),
            dirty: AtomicBool::new(dirty),
            size: AtomicUsize::new(size),
        }
    }

    /// Run `f` with shared access
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.value.read())
    }

    /// Run `f` with exclusive access and mark the entry dirty
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut value = self.value.write();
        let result = f(&mut value);
        self.mark_dirty(&value);
        result
    }

    /// Like [`Entry::update`], but only marks dirty when `f` reports a change
    pub fn update_if(&self, f: impl FnOnce(&mut T) -> bool) -> bool {
        let mut value = self.value.write();
        let changed = f(&mut value);
        if changed {
            self.mark_dirty(&value);
        }
        changed
    }

    /// Like [`Entry::update`], but leaves the entry untouched on error
    ///
    /// `f` must not have mutated the value when it returns `Err`.
    pub fn try_update<R>(&self, f: impl FnOnce(&mut T) -> StorageResult<R>) -> StorageResult<R> {
        let mut value = self.value.write();
        let result = f(&mut value)?;
        self.mark_dirty(&value);
        Ok(result)
    }

    fn mark_dirty(&self, value: &T) {
        self.size.store(value.size_hint(), Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
    }

    /// True when the resident value differs from the persisted one
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Footprint recorded at the last write
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Encode the value and clear the dirty flag atomically with respect
    /// to writers
    fn snapshot(&self) -> StorageResult<Vec<u8>> {
        let value = self.value.read();
        self.dirty.store(false, Ordering::Release);
        value.encode().map_err(|e| {
            self.dirty.store(true, Ordering::Release);
            e
        })
    }
}

/// Cache of one object kind
pub struct Cache<T: Persist> {
    kv: Arc<KvStore>,
    entries: Mutex<LruCache<String, Arc<Entry<T>>>>,
    /// Bumped under the map lock whenever entries are evicted
    evictions: AtomicU64,
    /// Serializes write-back so an older snapshot never lands after a newer one
    flush_lock: Mutex<()>,
}

impl<T: Persist> Cache<T> {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self {
            kv,
            entries: Mutex::new(LruCache::unbounded()),
            evictions: AtomicU64::new(0),
            flush_lock: Mutex::new(()),
        }
    }

    /// Fetch an object, loading it from the store on a miss
    pub fn get(&self, id: &str) -> StorageResult<Option<Arc<Entry<T>>>> {
        self.load(id, None::<fn() -> T>)
    }

    /// Fetch an object that must exist
    ///
    /// Fails with [`StorageError::NotFound`] when it is neither resident
    /// nor persisted.
    pub fn require(&self, id: &str) -> StorageResult<Arc<Entry<T>>> {
        self.get(id)?
            .ok_or_else(|| StorageError::NotFound(format!("{} {}", T::KIND, id)))
    }

    /// Fetch an object, creating it with `make` if it exists nowhere
    pub fn get_or_create(&self, id: &str, make: impl FnOnce() -> T) -> StorageResult<Arc<Entry<T>>> {
        self.load(id, Some(make))?
            .ok_or_else(|| StorageError::NotFound(format!("{} {}", T::KIND, id)))
    }

    /// Resident entry for `id`, else the persisted value, else `make()`
    ///
    /// The store is read without holding the map lock. A load that raced
    /// an eviction may have read a value older than the one evicted, so it
    /// is discarded and retried.
    fn load<F>(&self, id: &str, mut make: Option<F>) -> StorageResult<Option<Arc<Entry<T>>>>
    where
        F: FnOnce() -> T,
    {
        let store_key = T::KIND.store_key(id);
        loop {
            let epoch = {
                let mut entries = self.entries.lock();
                if let Some(entry) = entries.get(id) {
                    return Ok(Some(Arc::clone(entry)));
                }
                self.evictions.load(Ordering::Acquire)
            };

            let persisted = match self.kv.get(&store_key)? {
                Some(bytes) => Some(T::decode(&bytes)?),
                None => None,
            };

            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get(id) {
                return Ok(Some(Arc::clone(entry)));
            }
            if self.evictions.load(Ordering::Acquire) != epoch {
                continue;
            }

            let entry = match (persisted, make.take()) {
                (Some(value), _) => Entry::new(value, false),
                (None, Some(make)) => Entry::new(make(), true),
                (None, None) => return Ok(None),
            };
            let entry = Arc::new(entry);
            entries.put(id.to_string(), Arc::clone(&entry));
            return Ok(Some(entry));
        }
    }

    /// Insert or replace an object, marking it dirty
    pub fn put(&self, id: &str, value: T) -> Arc<Entry<T>> {
        let entry = Arc::new(Entry::new(value, true));
        self.entries.lock().put(id.to_string(), Arc::clone(&entry));
        entry
    }

    /// True when the object is currently resident
    pub fn is_resident(&self, id: &str) -> bool {
        self.entries.lock().contains(id)
    }

    /// Number of resident objects
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate footprint of resident objects
    pub fn resident_bytes(&self) -> usize {
        self.entries.lock().iter().map(|(_, e)| e.size()).sum()
    }

    /// Write every dirty object back to the store
    ///
    /// Returns the number of objects written. On failure the affected
    /// objects stay dirty.
    pub fn flush(&self) -> StorageResult<usize> {
        let _guard = self.flush_lock.lock();

        let dirty: Vec<(String, Arc<Entry<T>>)> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.is_dirty())
            .map(|(id, e)| (id.clone(), Arc::clone(e)))
            .collect();
        if dirty.is_empty() {
            return Ok(0);
        }

        let restore = |dirty: &[(String, Arc<Entry<T>>)]| {
            for (_, entry) in dirty {
                entry.dirty.store(true, Ordering::Release);
            }
        };

        let mut batch = Vec::with_capacity(dirty.len());
        for (id, entry) in &dirty {
            match entry.snapshot() {
                Ok(bytes) => batch.push((T::KIND.store_key(id), bytes)),
                Err(e) => {
                    restore(&dirty);
                    return Err(e);
                }
            }
        }

        if let Err(e) = self
            .kv
            .put_batch(batch.iter().map(|(k, v)| (k.as_slice(), v.as_slice())))
        {
            restore(&dirty);
            return Err(e);
        }

        let kind = T::KIND;
        tracing::debug!(kind = %kind, count = batch.len(), "Flushed dirty objects");
        Ok(batch.len())
    }

    /// Drop least recently used objects until about `bytes` are freed
    ///
    /// Only clean objects nobody else holds are dropped; write dirty ones
    /// back with [`Cache::flush`] first. Returns the bytes actually freed.
    pub fn shed(&self, bytes: usize) -> usize {
        if bytes == 0 {
            return 0;
        }

        let mut entries = self.entries.lock();
        let mut freed = 0;
        let mut victims = Vec::new();
        for (id, entry) in entries.iter().rev() {
            if freed >= bytes {
                break;
            }
            if entry.is_dirty() || Arc::strong_count(entry) > 1 {
                continue;
            }
            freed += entry.size();
            victims.push(id.clone());
        }
        for id in &victims {
            entries.pop(id);
        }

        if !victims.is_empty() {
            self.evictions.fetch_add(1, Ordering::AcqRel);
            let kind = T::KIND;
            tracing::debug!(kind = %kind, count = victims.len(), freed, "Evicted objects");
        }
        freed
    }
}

/// Kind-erased view of a cache for the eviction cycle
pub trait Evict: Send + Sync {
    fn kind(&self) -> Kind;
    fn len(&self) -> usize;
    fn resident_bytes(&self) -> usize;
    fn flush(&self) -> StorageResult<usize>;
    fn shed(&self, bytes: usize) -> usize;
}

impl<T: Persist> Evict for Cache<T> {
    fn kind(&self) -> Kind {
        T::KIND
    }

    fn len(&self) -> usize {
        Cache::len(self)
    }

    fn resident_bytes(&self) -> usize {
        Cache::resident_bytes(self)
    }

    fn flush(&self) -> StorageResult<usize> {
        Cache::flush(self)
    }

    fn shed(&self, bytes: usize) -> usize {
        Cache::shed(self, bytes)
    }
}
