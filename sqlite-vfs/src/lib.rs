//! Create a custom SQLite virtual file system by implementing the [Vfs] trait and registering it
//! using [register].
//!
//! The trait surface is synchronous; backends that talk to asynchronous storage are expected to
//! resolve their own blocking strategy (SQLite itself drives the VFS from blocking threads).

pub mod error;
pub mod io;
pub mod state;
pub mod vfs;

use std::ffi::CString;
use std::mem::size_of;
use std::ptr::null_mut;
use std::sync::Arc;
use std::time::Duration;

use state::{FileState, State};

/// A file opened by a [Vfs].
pub trait DatabaseHandle: Send {
    type Error: std::error::Error;

    /// Return the current size in bytes of the file.
    fn size(&mut self) -> Result<u64, error::Error<Self::Error>>;

    /// Read up to `buf.len()` bytes starting at `offset`. Returns the number of bytes actually
    /// produced; anything short of `buf.len()` is treated as a read past the end of the file and
    /// reported to SQLite as a short read (with the remainder of `buf` zero-filled by the
    /// bridge).
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, error::Error<Self::Error>>;

    /// Write the entire `buf` starting at `offset`, extending the file if needed.
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> Result<(), error::Error<Self::Error>>;

    /// Make sure all writes are committed to the underlying storage. If `data_only` is set,
    /// only the data and not the metadata (like size, access time, etc) needs to be synced.
    fn sync(&mut self, data_only: bool) -> Result<(), error::Error<Self::Error>>;

    /// Truncate or extend the file to the specified `size`.
    fn set_len(&mut self, size: u64) -> Result<(), error::Error<Self::Error>>;

    /// Lock the file. Returns whether the requested lock could be acquired.
    /// Locking sequence:
    /// - The lock is never moved from [LockKind::None] to anything higher than [LockKind::Shared].
    /// - A [LockKind::Pending] is never requested explicitly.
    /// - A [LockKind::Shared] is always held when a [LockKind::Reserved] lock is requested.
    fn lock(&mut self, lock: LockKind) -> Result<bool, error::Error<Self::Error>>;

    /// Unlock the file.
    fn unlock(&mut self, lock: LockKind) -> Result<bool, error::Error<Self::Error>> {
        self.lock(lock)
    }

    /// Check if the file this handle points to holds a [LockKind::Reserved],
    /// [LockKind::Pending] or [LockKind::Exclusive] lock.
    fn reserved(&mut self) -> Result<bool, error::Error<Self::Error>>;

    /// Return the current [LockKind] of this handle.
    fn current_lock(&self) -> Result<LockKind, error::Error<Self::Error>>;

    /// The sector size of the underlying device.
    fn sector_size(&self) -> usize {
        4096
    }

    /// The device characteristics advertised to SQLite.
    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::default()
    }

    /// Called right before the handle is dropped; a place for final writeback and lock release.
    fn close(&mut self) -> Result<(), error::Error<Self::Error>> {
        Ok(())
    }
}

/// A virtual file system for SQLite.
pub trait Vfs: Send + Sync {
    /// The file returned by [Vfs::open].
    type Handle: DatabaseHandle<Error = Self::Error>;

    type Error: std::error::Error;

    /// Open the database `db` (of type `opts.kind`).
    fn open(&self, db: &str, opts: OpenOptions) -> Result<Self::Handle, error::Error<Self::Error>>;

    /// Delete the database `db`.
    fn delete(&self, db: &str) -> Result<(), error::Error<Self::Error>>;

    /// Check if a database `db` already exists.
    fn exists(&self, db: &str) -> Result<bool, error::Error<Self::Error>>;

    /// Generate and return a path for a temporary database.
    fn temporary_name(&self) -> String;

    /// Populate the `buffer` with random data.
    fn random(&self, buffer: &mut [u8]);

    /// Sleep for `duration`. Return the duration actually slept.
    fn sleep(&self, duration: Duration) -> Duration;

    /// Check access to `db`. The default implementation always returns `true`.
    fn access(&self, _db: &str, _write: bool) -> Result<bool, error::Error<Self::Error>> {
        Ok(true)
    }

    /// Retrieve the full pathname of a database `db`.
    fn full_pathname<'a>(
        &self,
        db: &'a str,
    ) -> Result<std::borrow::Cow<'a, str>, error::Error<Self::Error>> {
        Ok(db.into())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenOptions {
    /// The object type that is being opened.
    pub kind: OpenKind,

    /// The access an object is opened with.
    pub access: OpenAccess,

    /// The file should be deleted when it is closed.
    pub delete_on_close: bool,
}

/// The object type that is being opened.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpenKind {
    MainDb,
    MainJournal,
    TempDb,
    TempJournal,
    TransientDb,
    SubJournal,
    SuperJournal,
    Wal,
}

/// The access an object is opened with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpenAccess {
    /// Read access.
    Read,

    /// Write access (includes read access).
    Write,

    /// Create the file if it does not exist (includes write and read access).
    Create,

    /// Create the file, but throw if it it already exist (includes write and read access).
    CreateNew,
}

/// The lock states of the SQLite advisory locking protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// No locks are held. The database may be neither read nor written. Any internally cached data
    /// is considered suspect and subject to verification against the database file before being
    /// used. This is the default state.
    None,

    /// The database may be read but not written. Any number of handles can hold
    /// [LockKind::Shared] locks at the same time.
    Shared,

    /// The handle is planning on writing to the database at some point in the future, but is
    /// currently just reading. Only a single [LockKind::Reserved] lock may be active at one time,
    /// though multiple [LockKind::Shared] locks can coexist with it.
    Reserved,

    /// The handle wants to write as soon as possible and is waiting on all current
    /// [LockKind::Shared] locks to clear. No new [LockKind::Shared] locks are granted while a
    /// [LockKind::Pending] lock is active.
    Pending,

    /// Needed in order to write to the database. Only one [LockKind::Exclusive] lock is allowed
    /// on the file and no other locks of any kind are allowed to coexist with it.
    Exclusive,
}

/// The device characteristics a [DatabaseHandle] advertises, translated by the bridge into
/// `SQLITE_IOCAP_*` bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCharacteristics {
    /// All writes of any size are atomic.
    pub atomic: bool,
    /// Aligned 1 KiB writes are atomic.
    pub atomic1k: bool,
    /// Aligned 2 KiB writes are atomic.
    pub atomic2k: bool,
    /// Aligned 4 KiB writes are atomic.
    pub atomic4k: bool,
    /// Writes occur in the order they are issued.
    pub sequential: bool,
    /// Appends never write garbage past the old end of file.
    pub safe_append: bool,
    /// Overwrites do not disturb adjacent bytes after a power loss.
    pub powersafe_overwrite: bool,
}

impl DeviceCharacteristics {
    pub(crate) fn to_flags(self) -> i32 {
        let mut flags = 0;
        if self.atomic {
            flags |= libsqlite3_sys::SQLITE_IOCAP_ATOMIC;
        }
        if self.atomic1k {
            flags |= libsqlite3_sys::SQLITE_IOCAP_ATOMIC1K;
        }
        if self.atomic2k {
            flags |= libsqlite3_sys::SQLITE_IOCAP_ATOMIC2K;
        }
        if self.atomic4k {
            flags |= libsqlite3_sys::SQLITE_IOCAP_ATOMIC4K;
        }
        if self.sequential {
            flags |= libsqlite3_sys::SQLITE_IOCAP_SEQUENTIAL;
        }
        if self.safe_append {
            flags |= libsqlite3_sys::SQLITE_IOCAP_SAFE_APPEND;
        }
        if self.powersafe_overwrite {
            flags |= libsqlite3_sys::SQLITE_IOCAP_POWERSAFE_OVERWRITE;
        }
        flags
    }
}

/// Register a virtual file system ([Vfs]) to SQLite.
pub fn register<V: Vfs>(name: &str, vfs: V, as_default: bool) -> Result<(), RegisterError> {
    let io_methods = libsqlite3_sys::sqlite3_io_methods {
        iVersion: 1,
        xClose: Some(io::close::<V>),
        xRead: Some(io::read::<V>),
        xWrite: Some(io::write::<V>),
        xTruncate: Some(io::truncate::<V>),
        xSync: Some(io::sync::<V>),
        xFileSize: Some(io::file_size::<V>),
        xLock: Some(io::lock::<V>),
        xUnlock: Some(io::unlock::<V>),
        xCheckReservedLock: Some(io::check_reserved_lock::<V>),
        xFileControl: Some(io::file_control::<V>),
        xSectorSize: Some(io::sector_size::<V>),
        xDeviceCharacteristics: Some(io::device_characteristics::<V>),
        xShmMap: None,
        xShmLock: None,
        xShmBarrier: None,
        xShmUnmap: None,
        xFetch: None,
        xUnfetch: None,
    };
    let name = CString::new(name)?;
    let name_ptr = name.as_ptr();
    let ptr = Box::into_raw(Box::new(State {
        name,
        vfs: Arc::new(vfs),
        io_methods,
        last_error: Default::default(),
        next_id: 0,
    }));
    let vfs = Box::into_raw(Box::new(libsqlite3_sys::sqlite3_vfs {
        iVersion: 2,
        szOsFile: size_of::<FileState<V>>() as i32,
        mxPathname: MAX_PATH_LENGTH as i32, // max path length supported by VFS
        pNext: null_mut(),
        zName: name_ptr,
        pAppData: ptr as _,
        xOpen: Some(vfs::open::<V>),
        xDelete: Some(vfs::delete::<V>),
        xAccess: Some(vfs::access::<V>),
        xFullPathname: Some(vfs::full_pathname::<V>),
        xDlOpen: Some(vfs::dlopen::<V>),
        xDlError: Some(vfs::dlerror::<V>),
        xDlSym: Some(vfs::dlsym::<V>),
        xDlClose: Some(vfs::dlclose::<V>),
        xRandomness: Some(vfs::randomness::<V>),
        xSleep: Some(vfs::sleep::<V>),
        xCurrentTime: Some(vfs::current_time::<V>),
        xGetLastError: Some(vfs::get_last_error::<V>),
        xCurrentTimeInt64: Some(vfs::current_time_int64::<V>),
        xSetSystemCall: None,
        xGetSystemCall: None,
        xNextSystemCall: None,
    }));

    let result = unsafe { libsqlite3_sys::sqlite3_vfs_register(vfs, as_default as i32) };
    if result != libsqlite3_sys::SQLITE_OK {
        return Err(RegisterError::Register(result));
    }

    Ok(())
}

const MAX_PATH_LENGTH: usize = 512;

impl OpenOptions {
    fn from_flags(flags: i32) -> Option<Self> {
        Some(OpenOptions {
            kind: OpenKind::from_flags(flags)?,
            access: OpenAccess::from_flags(flags)?,
            delete_on_close: flags & libsqlite3_sys::SQLITE_OPEN_DELETEONCLOSE > 0,
        })
    }

    fn to_flags(&self) -> i32 {
        self.kind.to_flags()
            | self.access.to_flags()
            | if self.delete_on_close {
                libsqlite3_sys::SQLITE_OPEN_DELETEONCLOSE
            } else {
                0
            }
    }
}

impl OpenKind {
    fn from_flags(flags: i32) -> Option<Self> {
        match flags {
            flags if flags & libsqlite3_sys::SQLITE_OPEN_MAIN_DB > 0 => Some(Self::MainDb),
            flags if flags & libsqlite3_sys::SQLITE_OPEN_MAIN_JOURNAL > 0 => {
                Some(Self::MainJournal)
            }
            flags if flags & libsqlite3_sys::SQLITE_OPEN_TEMP_DB > 0 => Some(Self::TempDb),
            flags if flags & libsqlite3_sys::SQLITE_OPEN_TEMP_JOURNAL > 0 => {
                Some(Self::TempJournal)
            }
            flags if flags & libsqlite3_sys::SQLITE_OPEN_TRANSIENT_DB > 0 => {
                Some(Self::TransientDb)
            }
            flags if flags & libsqlite3_sys::SQLITE_OPEN_SUBJOURNAL > 0 => Some(Self::SubJournal),
            flags if flags & libsqlite3_sys::SQLITE_OPEN_SUPER_JOURNAL > 0 => {
                Some(Self::SuperJournal)
            }
            flags if flags & libsqlite3_sys::SQLITE_OPEN_WAL > 0 => Some(Self::Wal),
            _ => None,
        }
    }

    fn to_flags(self) -> i32 {
        match self {
            OpenKind::MainDb => libsqlite3_sys::SQLITE_OPEN_MAIN_DB,
            OpenKind::MainJournal => libsqlite3_sys::SQLITE_OPEN_MAIN_JOURNAL,
            OpenKind::TempDb => libsqlite3_sys::SQLITE_OPEN_TEMP_DB,
            OpenKind::TempJournal => libsqlite3_sys::SQLITE_OPEN_TEMP_JOURNAL,
            OpenKind::TransientDb => libsqlite3_sys::SQLITE_OPEN_TRANSIENT_DB,
            OpenKind::SubJournal => libsqlite3_sys::SQLITE_OPEN_SUBJOURNAL,
            OpenKind::SuperJournal => libsqlite3_sys::SQLITE_OPEN_SUPER_JOURNAL,
            OpenKind::Wal => libsqlite3_sys::SQLITE_OPEN_WAL,
        }
    }
}

impl OpenAccess {
    fn from_flags(flags: i32) -> Option<Self> {
        match flags {
            flags
                if (flags & libsqlite3_sys::SQLITE_OPEN_CREATE > 0)
                    && (flags & libsqlite3_sys::SQLITE_OPEN_EXCLUSIVE > 0) =>
            {
                Some(Self::CreateNew)
            }
            flags if flags & libsqlite3_sys::SQLITE_OPEN_CREATE > 0 => Some(Self::Create),
            flags if flags & libsqlite3_sys::SQLITE_OPEN_READWRITE > 0 => Some(Self::Write),
            flags if flags & libsqlite3_sys::SQLITE_OPEN_READONLY > 0 => Some(Self::Read),
            _ => None,
        }
    }

    fn to_flags(self) -> i32 {
        match self {
            OpenAccess::Read => libsqlite3_sys::SQLITE_OPEN_READONLY,
            OpenAccess::Write => libsqlite3_sys::SQLITE_OPEN_READWRITE,
            OpenAccess::Create => {
                libsqlite3_sys::SQLITE_OPEN_READWRITE | libsqlite3_sys::SQLITE_OPEN_CREATE
            }
            OpenAccess::CreateNew => {
                libsqlite3_sys::SQLITE_OPEN_READWRITE
                    | libsqlite3_sys::SQLITE_OPEN_CREATE
                    | libsqlite3_sys::SQLITE_OPEN_EXCLUSIVE
            }
        }
    }
}

impl LockKind {
    fn from_i32(lock: i32) -> Option<Self> {
        Some(match lock {
            libsqlite3_sys::SQLITE_LOCK_NONE => Self::None,
            libsqlite3_sys::SQLITE_LOCK_SHARED => Self::Shared,
            libsqlite3_sys::SQLITE_LOCK_RESERVED => Self::Reserved,
            libsqlite3_sys::SQLITE_LOCK_PENDING => Self::Pending,
            libsqlite3_sys::SQLITE_LOCK_EXCLUSIVE => Self::Exclusive,
            _ => return None,
        })
    }

    fn to_i32(self) -> i32 {
        match self {
            Self::None => libsqlite3_sys::SQLITE_LOCK_NONE,
            Self::Shared => libsqlite3_sys::SQLITE_LOCK_SHARED,
            Self::Reserved => libsqlite3_sys::SQLITE_LOCK_RESERVED,
            Self::Pending => libsqlite3_sys::SQLITE_LOCK_PENDING,
            Self::Exclusive => libsqlite3_sys::SQLITE_LOCK_EXCLUSIVE,
        }
    }
}

impl PartialOrd for LockKind {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.to_i32().partial_cmp(&other.to_i32())
    }
}

impl Default for LockKind {
    fn default() -> Self {
        Self::None
    }
}

#[derive(Debug)]
pub enum RegisterError {
    Nul(std::ffi::NulError),
    Register(i32),
}

impl std::error::Error for RegisterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Nul(err) => Some(err),
            Self::Register(_) => None,
        }
    }
}

impl std::fmt::Display for RegisterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nul(_) => f.write_str("interior nul byte in name found"),
            Self::Register(code) => {
                write!(f, "registering sqlite vfs failed with error code: {}", code)
            }
        }
    }
}

impl From<std::ffi::NulError> for RegisterError {
    fn from(err: std::ffi::NulError) -> Self {
        Self::Nul(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_order() {
        assert!(LockKind::None < LockKind::Shared);
        assert!(LockKind::Shared < LockKind::Reserved);
        assert!(LockKind::Reserved < LockKind::Pending);
        assert!(LockKind::Pending < LockKind::Exclusive);
    }

    #[test]
    fn test_open_kind_from_flags() {
        let opts = OpenOptions::from_flags(
            libsqlite3_sys::SQLITE_OPEN_MAIN_DB
                | libsqlite3_sys::SQLITE_OPEN_READWRITE
                | libsqlite3_sys::SQLITE_OPEN_CREATE,
        )
        .unwrap();
        assert_eq!(opts.kind, OpenKind::MainDb);
        assert_eq!(opts.access, OpenAccess::Create);
        assert!(!opts.delete_on_close);

        assert!(OpenOptions::from_flags(0).is_none());
    }

    #[test]
    fn test_device_characteristics_flags() {
        let caps = DeviceCharacteristics {
            atomic: true,
            sequential: true,
            safe_append: true,
            ..Default::default()
        };
        let flags = caps.to_flags();
        assert!(flags & libsqlite3_sys::SQLITE_IOCAP_ATOMIC > 0);
        assert!(flags & libsqlite3_sys::SQLITE_IOCAP_SEQUENTIAL > 0);
        assert!(flags & libsqlite3_sys::SQLITE_IOCAP_SAFE_APPEND > 0);
        assert_eq!(flags & libsqlite3_sys::SQLITE_IOCAP_POWERSAFE_OVERWRITE, 0);
    }
}
