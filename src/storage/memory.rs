//! In-process page-array backend (`vfs=memory`). Pure scratch space, never a
//! persistence target.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use sqlite_vfs::error::Error;
use sqlite_vfs::{DatabaseHandle, DeviceCharacteristics, LockKind, OpenAccess, OpenOptions, Vfs};

use crate::storage::lock::{LockHandle, LockRegistry};

type FileMap = HashMap<String, Arc<RwLock<Vec<u8>>>>;

fn files() -> &'static Mutex<FileMap> {
    static FILES: OnceLock<Mutex<FileMap>> = OnceLock::new();
    FILES.get_or_init(Default::default)
}

/// Drop a key from the in-memory store. Used when a database vacates the
/// memory tier.
pub fn remove(key: &str) -> bool {
    files().lock().unwrap().remove(key).is_some()
}

pub fn exists(key: &str) -> bool {
    files().lock().unwrap().contains_key(key)
}

/// Every key currently held by the memory tier.
pub fn list() -> Vec<String> {
    files().lock().unwrap().keys().cloned().collect()
}

/// Register the memory backend under the `memory` VFS name. Idempotent.
pub fn register() -> Result<(), sqlite_vfs::RegisterError> {
    static REGISTERED: Mutex<bool> = Mutex::new(false);
    let mut done = REGISTERED.lock().unwrap();
    if !*done {
        sqlite_vfs::register("memory", MemoryVfs::new(), false)?;
        *done = true;
    }
    Ok(())
}

pub struct MemoryVfs {
    locks: Arc<LockRegistry>,
}

impl MemoryVfs {
    pub fn new() -> Self {
        Self {
            locks: LockRegistry::new(),
        }
    }
}

impl Default for MemoryVfs {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MemoryFile {
    data: Arc<RwLock<Vec<u8>>>,
    lock: LockHandle,
    read_only: bool,
}

impl Vfs for MemoryVfs {
    type Handle = MemoryFile;
    type Error = std::io::Error;

    fn open(&self, db: &str, opts: OpenOptions) -> Result<Self::Handle, Error<Self::Error>> {
        let data = {
            let mut files = files().lock().unwrap();
            match files.get(db) {
                Some(data) => Arc::clone(data),
                None => match opts.access {
                    OpenAccess::Create | OpenAccess::CreateNew => {
                        let data = Arc::new(RwLock::new(Vec::new()));
                        files.insert(db.to_string(), Arc::clone(&data));
                        data
                    }
                    _ => return Err(Error::NotFound),
                },
            }
        };

        Ok(MemoryFile {
            data,
            lock: self.locks.acquire(db),
            read_only: opts.access == OpenAccess::Read,
        })
    }

    fn delete(&self, db: &str) -> Result<(), Error<Self::Error>> {
        if remove(db) {
            Ok(())
        } else {
            Err(Error::NotFound)
        }
    }

    fn exists(&self, db: &str) -> Result<bool, Error<Self::Error>> {
        Ok(exists(db))
    }

    fn temporary_name(&self) -> String {
        format!("/temp_{}", uuid::Uuid::new_v4())
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

impl DatabaseHandle for MemoryFile {
    type Error = std::io::Error;

    fn size(&mut self) -> Result<u64, Error<Self::Error>> {
        Ok(self.data.read().unwrap().len() as u64)
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, Error<Self::Error>> {
        let data = self.data.read().unwrap();
        if offset >= data.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> Result<(), Error<Self::Error>> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let mut data = self.data.write().unwrap();
        let end = offset as usize + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&mut self, _data_only: bool) -> Result<(), Error<Self::Error>> {
        Ok(())
    }

    fn set_len(&mut self, size: u64) -> Result<(), Error<Self::Error>> {
        self.data.write().unwrap().resize(size as usize, 0);
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

    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics {
            atomic: true,
            sequential: true,
            safe_append: true,
            ..Default::default()
        }
    }

    fn close(&mut self) -> Result<(), Error<Self::Error>> {
        self.lock.unlock(LockKind::None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlite_vfs::OpenKind;

    fn open(vfs: &MemoryVfs, key: &str, access: OpenAccess) -> MemoryFile {
        vfs.open(
            key,
            OpenOptions {
                kind: OpenKind::MainDb,
                access,
                delete_on_close: false,
            },
        )
        .unwrap()
    }

    #[test]
    fn write_read_roundtrip() {
        let vfs = MemoryVfs::new();
        let mut file = open(&vfs, "/roundtrip", OpenAccess::Create);
        file.write_all_at(b"hello world", 3).unwrap();

        let mut buf = [0u8; 11];
        assert_eq!(file.read_at(&mut buf, 3).unwrap(), 11);
        assert_eq!(&buf, b"hello world");
        assert_eq!(file.size().unwrap(), 14);

        remove("/roundtrip");
    }

    #[test]
    fn read_past_end_is_empty() {
        let vfs = MemoryVfs::new();
        let mut file = open(&vfs, "/eof", OpenAccess::Create);
        file.write_all_at(b"abc", 0).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(file.read_at(&mut buf, 3).unwrap(), 0);
        assert_eq!(file.read_at(&mut buf, 100).unwrap(), 0);

        remove("/eof");
    }

    #[test]
    fn truncate_shrinks_and_extends() {
        let vfs = MemoryVfs::new();
        let mut file = open(&vfs, "/trunc", OpenAccess::Create);
        file.write_all_at(b"0123456789", 0).unwrap();
        file.set_len(4).unwrap();
        assert_eq!(file.size().unwrap(), 4);
        file.set_len(8).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(file.read_at(&mut buf, 0).unwrap(), 8);
        assert_eq!(&buf, b"0123\0\0\0\0");

        remove("/trunc");
    }

    #[test]
    fn missing_file_without_create_fails() {
        let vfs = MemoryVfs::new();
        assert!(matches!(
            vfs.open(
                "/missing",
                OpenOptions {
                    kind: OpenKind::MainDb,
                    access: OpenAccess::Write,
                    delete_on_close: false,
                }
            ),
            Err(Error::NotFound)
        ));
    }
}
