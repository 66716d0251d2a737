//! Object-store-backed block device (`vfs=r2`).
//!
//! The embedded engine assumes random-access, block-oriented, lockable
//! storage; the object store offers none of that. This backend bridges the
//! gap with a per-handle sector cache (64 KiB granules, ranged GETs on miss),
//! a dirty-sector set, whole-object writeback on sync, and the shared
//! in-process lock emulation.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use sqlite_vfs::error::Error;
use sqlite_vfs::{DatabaseHandle, DeviceCharacteristics, LockKind, OpenAccess, OpenKind, OpenOptions, Vfs};

use crate::storage::client::{ObjectStore, StoreError};
use crate::storage::lock::{LockHandle, LockRegistry};

/// Cache granule. Must be at least the engine's maximum page size and a
/// multiple of 64 KiB.
pub const SECTOR_SIZE: usize = 64 * 1024;

/// Monotone counter used as the cache's recency stamp.
fn next_tick() -> u64 {
    static TICK: AtomicU64 = AtomicU64::new(0);
    TICK.fetch_add(1, Ordering::Relaxed)
}

struct Sector {
    data: Vec<u8>,
    dirty: bool,
    last_used: AtomicU64,
}

impl Sector {
    fn touch(&self) {
        self.last_used.store(next_tick(), Ordering::Relaxed);
    }
}

/// Register the remote backend under the `r2` VFS name. Idempotent.
pub fn register(
    store: Arc<dyn ObjectStore>,
    max_cache_bytes: usize,
) -> Result<(), sqlite_vfs::RegisterError> {
    static REGISTERED: Mutex<bool> = Mutex::new(false);
    let mut done = REGISTERED.lock().unwrap();
    if !*done {
        sqlite_vfs::register("r2", RemoteVfs::new(store, max_cache_bytes), false)?;
        *done = true;
    }
    Ok(())
}

pub struct RemoteVfs {
    store: Arc<dyn ObjectStore>,
    locks: Arc<LockRegistry>,
    max_sectors: usize,
}

impl RemoteVfs {
    pub fn new(store: Arc<dyn ObjectStore>, max_cache_bytes: usize) -> Self {
        Self {
            store,
            locks: LockRegistry::new(),
            max_sectors: (max_cache_bytes / SECTOR_SIZE).max(1),
        }
    }
}

pub struct RemoteFile {
    store: Arc<dyn ObjectStore>,
    key: String,
    size: u64,
    read_only: bool,
    lock: LockHandle,
    cache: RwLock<HashMap<u64, Sector>>,
    dirty: Mutex<BTreeSet<u64>>,
    max_sectors: usize,
}

impl Vfs for RemoteVfs {
    type Handle = RemoteFile;
    type Error = StoreError;

    fn open(&self, db: &str, opts: OpenOptions) -> Result<Self::Handle, Error<Self::Error>> {
        match opts.kind {
            OpenKind::MainDb
            | OpenKind::MainJournal
            | OpenKind::TempDb
            | OpenKind::TransientDb
            | OpenKind::SubJournal
            | OpenKind::SuperJournal => {}
            OpenKind::TempJournal | OpenKind::Wal => return Err(Error::UnsupportedOpenKind),
        }

        let size = match self.store.head(db)? {
            Some(size) => {
                if opts.access == OpenAccess::CreateNew {
                    return Err(Error::PermissionDenied);
                }
                size
            }
            None => match opts.access {
                OpenAccess::Create | OpenAccess::CreateNew => 0,
                _ => return Err(Error::NotFound),
            },
        };

        Ok(RemoteFile {
            store: Arc::clone(&self.store),
            key: db.to_string(),
            size,
            read_only: opts.access == OpenAccess::Read,
            lock: self.locks.acquire(db),
            cache: RwLock::new(HashMap::new()),
            dirty: Mutex::new(BTreeSet::new()),
            max_sectors: self.max_sectors,
        })
    }

    fn delete(&self, db: &str) -> Result<(), Error<Self::Error>> {
        if self.store.head(db)?.is_none() {
            return Err(Error::NotFound);
        }
        self.store.delete(db)?;
        Ok(())
    }

    fn exists(&self, db: &str) -> Result<bool, Error<Self::Error>> {
        Ok(self.store.head(db)?.is_some())
    }

    fn temporary_name(&self) -> String {
        format!("temp_{}.db", uuid::Uuid::new_v4())
    }

    fn random(&self, buffer: &mut [u8]) {
        use rand::Rng;
        rand::thread_rng().fill(buffer);
    }

    fn sleep(&self, duration: Duration) -> Duration {
        std::thread::sleep(duration);
        duration
    }
}

impl RemoteFile {
    /// Run `f` over a resident sector. A cache hit only refreshes the recency
    /// stamp under the read lock; a miss upgrades to the write lock,
    /// re-checks, and fetches.
    fn with_sector<R>(
        &self,
        index: u64,
        f: impl FnOnce(&Sector) -> R,
    ) -> Result<R, Error<StoreError>> {
        {
            let cache = self.cache.read().unwrap();
            if let Some(sector) = cache.get(&index) {
                sector.touch();
                return Ok(f(sector));
            }
        }

        let mut cache = self.cache.write().unwrap();
        if !cache.contains_key(&index) {
            if cache.len() >= self.max_sectors {
                evict_clean_lru(&mut cache);
            }
            let sector = self.fetch(index)?;
            cache.insert(index, sector);
        }
        let sector = &cache[&index];
        sector.touch();
        Ok(f(sector))
    }

    /// Mutate a resident sector, marking it dirty.
    fn update_sector(
        &self,
        index: u64,
        f: impl FnOnce(&mut Vec<u8>),
    ) -> Result<(), Error<StoreError>> {
        let mut cache = self.cache.write().unwrap();
        if !cache.contains_key(&index) {
            if cache.len() >= self.max_sectors {
                evict_clean_lru(&mut cache);
            }
            let sector = self.fetch(index)?;
            cache.insert(index, sector);
        }
        let sector = cache.get_mut(&index).unwrap();
        f(&mut sector.data);
        sector.dirty = true;
        sector.touch();
        self.dirty.lock().unwrap().insert(index);
        Ok(())
    }

    /// Materialize one sector. Sectors past the object's tail never touch the
    /// network; partial tail sectors come back zero-filled.
    fn fetch(&self, index: u64) -> Result<Sector, Error<StoreError>> {
        let start = index * SECTOR_SIZE as u64;
        let mut data = vec![0u8; SECTOR_SIZE];
        if start < self.size {
            let end = (start + SECTOR_SIZE as u64 - 1).min(self.size - 1);
            let bytes = self.store.get_range(&self.key, start, end)?;
            let n = bytes.len().min(SECTOR_SIZE);
            data[..n].copy_from_slice(&bytes[..n]);
        }
        Ok(Sector {
            data,
            dirty: false,
            last_used: AtomicU64::new(next_tick()),
        })
    }

    #[cfg(test)]
    fn cached_sectors(&self) -> usize {
        self.cache.read().unwrap().len()
    }

    #[cfg(test)]
    fn dirty_sectors(&self) -> usize {
        self.dirty.lock().unwrap().len()
    }
}

/// Drop the least recently used clean sector. Dirty sectors are never
/// evicted, so under heavy write the cache may temporarily exceed capacity.
fn evict_clean_lru(cache: &mut HashMap<u64, Sector>) {
    let victim = cache
        .iter()
        .filter(|(_, sector)| !sector.dirty)
        .min_by_key(|(_, sector)| sector.last_used.load(Ordering::Relaxed))
        .map(|(index, _)| *index);
    if let Some(index) = victim {
        cache.remove(&index);
    }
}

impl DatabaseHandle for RemoteFile {
    type Error = StoreError;

    fn size(&mut self) -> Result<u64, Error<Self::Error>> {
        Ok(self.size)
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, Error<Self::Error>> {
        if offset >= self.size {
            return Ok(0);
        }
        let end = (offset + buf.len() as u64).min(self.size);
        let mut produced = 0usize;
        let mut pos = offset;
        while pos < end {
            let index = pos / SECTOR_SIZE as u64;
            let within = (pos % SECTOR_SIZE as u64) as usize;
            let n = ((SECTOR_SIZE - within) as u64).min(end - pos) as usize;
            self.with_sector(index, |sector| {
                buf[produced..produced + n].copy_from_slice(&sector.data[within..within + n]);
            })?;
            produced += n;
            pos += n as u64;
        }
        Ok(produced)
    }

    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> Result<(), Error<Self::Error>> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let mut consumed = 0usize;
        let mut pos = offset;
        while consumed < buf.len() {
            let index = pos / SECTOR_SIZE as u64;
            let within = (pos % SECTOR_SIZE as u64) as usize;
            let n = (SECTOR_SIZE - within).min(buf.len() - consumed);
            self.update_sector(index, |data| {
                data[within..within + n].copy_from_slice(&buf[consumed..consumed + n]);
            })?;
            consumed += n;
            pos += n as u64;
        }
        self.size = self.size.max(offset + buf.len() as u64);
        Ok(())
    }

    fn sync(&mut self, _data_only: bool) -> Result<(), Error<Self::Error>> {
        let dirty_indices: Vec<u64> = {
            let dirty = self.dirty.lock().unwrap();
            if dirty.is_empty() {
                return Ok(());
            }
            dirty.iter().copied().collect()
        };

        // The store has no partial-update primitive, so writeback replaces
        // the whole object: current contents, resized to the handle's view,
        // with every dirty sector overlaid.
        let mut base = if self.size > 0 {
            match self.store.get(&self.key) {
                Ok(bytes) => bytes,
                Err(StoreError::NotFound { .. }) => Vec::new(),
                Err(err) => return Err(err.into()),
            }
        } else {
            Vec::new()
        };
        base.resize(self.size as usize, 0);

        {
            let cache = self.cache.read().unwrap();
            for &index in &dirty_indices {
                if let Some(sector) = cache.get(&index) {
                    let start = index as usize * SECTOR_SIZE;
                    if start >= base.len() {
                        continue;
                    }
                    let end = (start + SECTOR_SIZE).min(base.len());
                    base[start..end].copy_from_slice(&sector.data[..end - start]);
                }
            }
        }

        // On failure the dirty set stays intact and the next sync retries.
        self.store.put(&self.key, base)?;

        let mut cache = self.cache.write().unwrap();
        for &index in &dirty_indices {
            if let Some(sector) = cache.get_mut(&index) {
                sector.dirty = false;
            }
        }
        let mut dirty = self.dirty.lock().unwrap();
        for index in dirty_indices {
            dirty.remove(&index);
        }
        Ok(())
    }

    fn set_len(&mut self, size: u64) -> Result<(), Error<Self::Error>> {
        self.size = size;
        let keep = size.div_ceil(SECTOR_SIZE as u64);
        {
            let mut cache = self.cache.write().unwrap();
            cache.retain(|&index, _| index < keep);
            let mut dirty = self.dirty.lock().unwrap();
            dirty.retain(|&index| index < keep);
        }

        let tail = (size % SECTOR_SIZE as u64) as usize;
        if tail != 0 {
            self.update_sector(keep - 1, |data| data[tail..].fill(0))?;
        }
        Ok(())
    }

    fn lock(&mut self, lock: LockKind) -> Result<bool, Error<Self::Error>> {
        Ok(self.lock.lock(lock))
    }

    fn unlock(&mut self, lock: LockKind) -> Result<bool, Error<Self::Error>> {
        Ok(self.lock.unlock(lock))
    }

    fn reserved(&mut self) -> Result<bool, Error<Self::Error>> {
        Ok(self.lock.reserved())
    }

    fn current_lock(&self) -> Result<LockKind, Error<Self::Error>> {
        Ok(self.lock.level())
    }

    fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn device_characteristics(&self) -> DeviceCharacteristics {
        // Writeback replaces the object in one PUT, so the engine may treat
        // writes as atomic and ordered. Power-safe overwrite is NOT granted:
        // the whole object is rewritten on sync.
        DeviceCharacteristics {
            atomic: true,
            sequential: true,
            safe_append: true,
            ..Default::default()
        }
    }

    fn close(&mut self) -> Result<(), Error<Self::Error>> {
        self.sync(false)?;
        self.lock.unlock(LockKind::None);
        Ok(())
    }
}
