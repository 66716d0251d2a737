//! Local filesystem backend (`vfs=disk`).
//!
//! The configured directory is an exclusively managed scratch area: it is
//! created and emptied on startup, and every database on this tier lives in
//! it as `<name>.db`.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlite_vfs::error::Error;
use sqlite_vfs::{DatabaseHandle, DeviceCharacteristics, LockKind, OpenAccess, OpenOptions, Vfs};

use crate::storage::lock::{LockHandle, LockRegistry};

/// Register the local backend under the `disk` VFS name. Idempotent.
pub fn register() -> Result<(), sqlite_vfs::RegisterError> {
    static REGISTERED: Mutex<bool> = Mutex::new(false);
    let mut done = REGISTERED.lock().unwrap();
    if !*done {
        sqlite_vfs::register("disk", LocalVfs::new(), false)?;
        *done = true;
    }
    Ok(())
}

/// Ensure the storage directory exists and is empty, returning its canonical
/// absolute form.
pub fn prepare_directory(path: &Path) -> std::io::Result<PathBuf> {
    fs::create_dir_all(path)?;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    path.canonicalize()
}

pub struct LocalVfs {
    locks: Arc<LockRegistry>,
}

impl LocalVfs {
    pub fn new() -> Self {
        Self {
            locks: LockRegistry::new(),
        }
    }
}

impl Default for LocalVfs {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LocalFile {
    file: fs::File,
    lock: LockHandle,
    read_only: bool,
}

impl Vfs for LocalVfs {
    type Handle = LocalFile;
    type Error = std::io::Error;

    fn open(&self, db: &str, opts: OpenOptions) -> Result<Self::Handle, Error<Self::Error>> {
        let mut options = fs::OpenOptions::new();
        options.read(true);
        match opts.access {
            OpenAccess::Read => {}
            OpenAccess::Write => {
                options.write(true);
            }
            OpenAccess::Create => {
                options.write(true).create(true);
            }
            OpenAccess::CreateNew => {
                options.write(true).create_new(true);
            }
        }

        let file = options.open(db).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound
            } else {
                err.into()
            }
        })?;

        Ok(LocalFile {
            file,
            lock: self.locks.acquire(db),
            read_only: opts.access == OpenAccess::Read,
        })
    }

    fn delete(&self, db: &str) -> Result<(), Error<Self::Error>> {
        fs::remove_file(db).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound
            } else {
                err.into()
            }
        })
    }

    fn exists(&self, db: &str) -> Result<bool, Error<Self::Error>> {
        Ok(Path::new(db).try_exists().map_err(Error::from)?)
    }

    fn temporary_name(&self) -> String {
        std::env::temp_dir()
            .join(format!("temp_{}.db", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .into_owned()
    }

    fn random(&self, buffer: &mut [u8]) {
        use rand::Rng;
        rand::thread_rng().fill(buffer);
    }

    fn sleep(&self, duration: Duration) -> Duration {
        std::thread::sleep(duration);
        duration
    }

    fn access(&self, db: &str, _write: bool) -> Result<bool, Error<Self::Error>> {
        Ok(Path::new(db).try_exists().map_err(Error::from)?)
    }
}

impl DatabaseHandle for LocalFile {
    type Error = std::io::Error;

    fn size(&mut self) -> Result<u64, Error<Self::Error>> {
        Ok(self.file.metadata().map_err(Error::from)?.len())
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, Error<Self::Error>> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(Error::from)?;
        let mut produced = 0;
        while produced < buf.len() {
            match self.file.read(&mut buf[produced..]) {
                Ok(0) => break,
                Ok(n) => produced += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(produced)
    }

    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> Result<(), Error<Self::Error>> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(Error::from)?;
        self.file.write_all(buf).map_err(Error::from)?;
        Ok(())
    }

    fn sync(&mut self, data_only: bool) -> Result<(), Error<Self::Error>> {
        if data_only {
            self.file.sync_data().map_err(Error::from)?;
        } else {
            self.file.sync_all().map_err(Error::from)?;
        }
        Ok(())
    }

    fn set_len(&mut self, size: u64) -> Result<(), Error<Self::Error>> {
        self.file.set_len(size).map_err(Error::from)?;
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
            atomic1k: cfg!(unix),
            atomic2k: cfg!(unix),
            atomic4k: cfg!(unix),
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

    fn open(vfs: &LocalVfs, path: &Path, access: OpenAccess) -> LocalFile {
        vfs.open(
            &path.to_string_lossy(),
            OpenOptions {
                kind: OpenKind::MainDb,
                access,
                delete_on_close: false,
            },
        )
        .unwrap()
    }

    #[test]
    fn prepare_directory_empties_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("stale.db"), b"old").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let canonical = prepare_directory(dir.path()).unwrap();
        assert!(canonical.is_absolute());
        assert_eq!(fs::read_dir(&canonical).unwrap().count(), 0);
    }

    #[test]
    fn write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.db");
        let vfs = LocalVfs::new();

        let mut file = open(&vfs, &path, OpenAccess::Create);
        file.write_all_at(b"content", 16).unwrap();
        file.sync(false).unwrap();

        let mut buf = [0u8; 7];
        assert_eq!(file.read_at(&mut buf, 16).unwrap(), 7);
        assert_eq!(&buf, b"content");
        assert_eq!(file.size().unwrap(), 23);
    }

    #[test]
    fn missing_file_without_create_fails() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = LocalVfs::new();
        let missing = dir.path().join("missing.db");
        assert!(matches!(
            vfs.open(
                &missing.to_string_lossy(),
                OpenOptions {
                    kind: OpenKind::MainDb,
                    access: OpenAccess::Write,
                    delete_on_close: false,
                }
            ),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn lock_state_shared_between_handles_on_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.db");
        let vfs = LocalVfs::new();

        let mut a = open(&vfs, &path, OpenAccess::Create);
        let mut b = open(&vfs, &path, OpenAccess::Write);

        assert!(a.lock(LockKind::Shared).unwrap());
        assert!(a.lock(LockKind::Reserved).unwrap());
        assert!(b.lock(LockKind::Shared).unwrap());
        assert!(!b.lock(LockKind::Reserved).unwrap());
        assert!(b.reserved().unwrap());
    }
}
