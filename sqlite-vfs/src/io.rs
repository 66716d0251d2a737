use std::ffi::{c_char, c_int, c_void, CString};
use std::mem::{self, ManuallyDrop, MaybeUninit};
use std::slice;

use crate::error::Error;
use crate::state::{file_state, null_ptr_error, FileState};
use crate::{DatabaseHandle, LockKind, Vfs};

/// Close a file.
pub unsafe extern "C" fn close<V: Vfs>(p_file: *mut libsqlite3_sys::sqlite3_file) -> c_int {
    let mut rc = libsqlite3_sys::SQLITE_OK;

    if let Some(f) = (p_file as *mut FileState<V>).as_mut() {
        let ext = f.ext.assume_init_mut();

        if let Err(err) = ext.file.close() {
            log::error!("[{}] close failed: {} ({})", ext.id, err, ext.db_name);
            rc = libsqlite3_sys::SQLITE_IOERR_CLOSE;
        }

        if ext.delete_on_close {
            if let Err(err) = ext.vfs.delete(&ext.db_name) {
                rc = ext.set_last_error(libsqlite3_sys::SQLITE_DELETE, err);
            }
        }

        let ext = mem::replace(&mut f.ext, MaybeUninit::uninit());
        let ext = ext.assume_init(); // extract the value to drop it
        log::trace!("[{}] close ({})", ext.id, ext.db_name);
    }

    rc
}

/// Read data from a file.
pub unsafe extern "C" fn read<V: Vfs>(
    p_file: *mut libsqlite3_sys::sqlite3_file,
    z_buf: *mut c_void,
    i_amt: c_int,
    i_ofst: libsqlite3_sys::sqlite3_int64,
) -> c_int {
    let state = match file_state::<V>(p_file) {
        Ok(f) => f,
        Err(_) => return libsqlite3_sys::SQLITE_IOERR_READ,
    };
    log::trace!(
        "[{}] read offset={} len={} ({})",
        state.id,
        i_ofst,
        i_amt,
        state.db_name
    );

    let out = slice::from_raw_parts_mut(z_buf as *mut u8, i_amt as usize);
    match state.file.read_at(out, i_ofst as u64) {
        Ok(n) if n == out.len() => libsqlite3_sys::SQLITE_OK,
        Ok(n) => {
            // Short read: SQLite requires the unread remainder to be zero-filled.
            out[n..].fill(0);
            libsqlite3_sys::SQLITE_IOERR_SHORT_READ
        }
        Err(err) => state.set_last_error(libsqlite3_sys::SQLITE_IOERR_READ, err),
    }
}

/// Write data to a file.
pub unsafe extern "C" fn write<V: Vfs>(
    p_file: *mut libsqlite3_sys::sqlite3_file,
    z: *const c_void,
    i_amt: c_int,
    i_ofst: libsqlite3_sys::sqlite3_int64,
) -> c_int {
    let state = match file_state::<V>(p_file) {
        Ok(f) => f,
        Err(_) => return libsqlite3_sys::SQLITE_IOERR_WRITE,
    };
    log::trace!(
        "[{}] write offset={} len={} ({})",
        state.id,
        i_ofst,
        i_amt,
        state.db_name
    );

    let data = slice::from_raw_parts(z as *mut u8, i_amt as usize);
    match state.file.write_all_at(data, i_ofst as u64) {
        Ok(()) => libsqlite3_sys::SQLITE_OK,
        Err(Error::ReadOnly) => libsqlite3_sys::SQLITE_READONLY,
        Err(err) => state.set_last_error(libsqlite3_sys::SQLITE_IOERR_WRITE, err),
    }
}

/// Truncate a file.
pub unsafe extern "C" fn truncate<V: Vfs>(
    p_file: *mut libsqlite3_sys::sqlite3_file,
    size: libsqlite3_sys::sqlite3_int64,
) -> c_int {
    let state = match file_state::<V>(p_file) {
        Ok(f) => f,
        Err(_) => return libsqlite3_sys::SQLITE_IOERR_TRUNCATE,
    };
    log::trace!("[{}] truncate size={} ({})", state.id, size, state.db_name);

    if let Err(err) = state.file.set_len(size as u64) {
        return state.set_last_error(libsqlite3_sys::SQLITE_IOERR_TRUNCATE, err);
    }

    libsqlite3_sys::SQLITE_OK
}

/// Persist changes to a file.
pub unsafe extern "C" fn sync<V: Vfs>(
    p_file: *mut libsqlite3_sys::sqlite3_file,
    flags: c_int,
) -> c_int {
    let state = match file_state::<V>(p_file) {
        Ok(f) => f,
        Err(_) => return libsqlite3_sys::SQLITE_IOERR_FSYNC,
    };
    log::trace!("[{}] sync ({})", state.id, state.db_name);

    match state
        .file
        .sync(flags & libsqlite3_sys::SQLITE_SYNC_DATAONLY > 0)
    {
        Ok(()) => libsqlite3_sys::SQLITE_OK,
        Err(err) => state.set_last_error(libsqlite3_sys::SQLITE_IOERR_FSYNC, err),
    }
}

/// Return the current file-size of a file.
pub unsafe extern "C" fn file_size<V: Vfs>(
    p_file: *mut libsqlite3_sys::sqlite3_file,
    p_size: *mut libsqlite3_sys::sqlite3_int64,
) -> c_int {
    let state = match file_state::<V>(p_file) {
        Ok(f) => f,
        Err(_) => return libsqlite3_sys::SQLITE_IOERR_FSTAT,
    };
    log::trace!("[{}] file_size ({})", state.id, state.db_name);

    if let Err(err) = state.file.size().and_then(|n| {
        let p_size: &mut libsqlite3_sys::sqlite3_int64 =
            p_size.as_mut().ok_or_else(null_ptr_error::<V::Error>)?;
        *p_size = n as libsqlite3_sys::sqlite3_int64;
        Ok(())
    }) {
        return state.set_last_error(libsqlite3_sys::SQLITE_IOERR_FSTAT, err);
    }

    libsqlite3_sys::SQLITE_OK
}

/// Lock a file.
pub unsafe extern "C" fn lock<V: Vfs>(
    p_file: *mut libsqlite3_sys::sqlite3_file,
    e_lock: c_int,
) -> c_int {
    let state = match file_state::<V>(p_file) {
        Ok(f) => f,
        Err(_) => return libsqlite3_sys::SQLITE_IOERR_LOCK,
    };

    let lock = match LockKind::from_i32(e_lock) {
        Some(lock) => lock,
        None => return libsqlite3_sys::SQLITE_IOERR_LOCK,
    };
    match state.file.lock(lock) {
        Ok(true) => {
            log::trace!("[{}] lock={:?} ({})", state.id, lock, state.db_name);
            libsqlite3_sys::SQLITE_OK
        }
        Ok(false) => {
            log::trace!(
                "[{}] busy (denied {:?}) ({})",
                state.id,
                lock,
                state.db_name
            );
            libsqlite3_sys::SQLITE_BUSY
        }
        Err(err) => state.set_last_error(libsqlite3_sys::SQLITE_IOERR_LOCK, err),
    }
}

/// Unlock a file.
pub unsafe extern "C" fn unlock<V: Vfs>(
    p_file: *mut libsqlite3_sys::sqlite3_file,
    e_lock: c_int,
) -> c_int {
    let state = match file_state::<V>(p_file) {
        Ok(f) => f,
        Err(_) => return libsqlite3_sys::SQLITE_IOERR_UNLOCK,
    };

    let lock = match LockKind::from_i32(e_lock) {
        Some(lock) => lock,
        None => return libsqlite3_sys::SQLITE_IOERR_UNLOCK,
    };
    match state.file.unlock(lock) {
        Ok(true) => {
            log::trace!("[{}] unlock={:?} ({})", state.id, lock, state.db_name);
            libsqlite3_sys::SQLITE_OK
        }
        Ok(false) => libsqlite3_sys::SQLITE_BUSY,
        Err(err) => state.set_last_error(libsqlite3_sys::SQLITE_IOERR_UNLOCK, err),
    }
}

/// Check if another file-handle holds a [LockKind::Reserved] lock on a file.
pub unsafe extern "C" fn check_reserved_lock<V: Vfs>(
    p_file: *mut libsqlite3_sys::sqlite3_file,
    p_res_out: *mut c_int,
) -> c_int {
    let state = match file_state::<V>(p_file) {
        Ok(f) => f,
        Err(_) => return libsqlite3_sys::SQLITE_IOERR_CHECKRESERVEDLOCK,
    };
    log::trace!("[{}] check_reserved_lock ({})", state.id, state.db_name);

    if let Err(err) = state.file.reserved().and_then(|is_reserved| {
        let p_res_out: &mut c_int = p_res_out.as_mut().ok_or_else(null_ptr_error)?;
        *p_res_out = is_reserved as c_int;
        Ok(())
    }) {
        return state.set_last_error(libsqlite3_sys::SQLITE_IOERR_CHECKRESERVEDLOCK, err);
    }

    libsqlite3_sys::SQLITE_OK
}

/// File control method. For custom operations on a mem-file.
pub unsafe extern "C" fn file_control<V: Vfs>(
    p_file: *mut libsqlite3_sys::sqlite3_file,
    op: c_int,
    p_arg: *mut c_void,
) -> c_int {
    let state = match file_state::<V>(p_file) {
        Ok(f) => f,
        Err(_) => return libsqlite3_sys::SQLITE_NOTFOUND,
    };
    log::trace!("[{}] file_control op={} ({})", state.id, op, state.db_name);

    match op {
        // Write current state of the lock into (int)pArg; used for debugging.
        libsqlite3_sys::SQLITE_FCNTL_LOCKSTATE => match state.file.current_lock() {
            Ok(lock) => {
                if let Some(p_arg) = (p_arg as *mut i32).as_mut() {
                    *p_arg = lock.to_i32();
                }
                libsqlite3_sys::SQLITE_OK
            }
            Err(err) => state.set_last_error(libsqlite3_sys::SQLITE_ERROR, err),
        },

        // Write last error number into (int)pArg.
        libsqlite3_sys::SQLITE_FCNTL_LAST_ERRNO => {
            if let Some(p_arg) = (p_arg as *mut i32).as_mut() {
                *p_arg = state.last_errno;
            }
            libsqlite3_sys::SQLITE_OK
        }

        // Set or query the persistent "powersafe-overwrite" or "PSOW" setting.
        libsqlite3_sys::SQLITE_FCNTL_POWERSAFE_OVERWRITE => {
            if let Some(p_arg) = (p_arg as *mut i32).as_mut() {
                if *p_arg < 0 {
                    *p_arg = state.powersafe_overwrite as i32;
                } else {
                    state.powersafe_overwrite = *p_arg == 1;
                }
            };

            libsqlite3_sys::SQLITE_OK
        }

        // Used to obtain the names of all VFSes in the VFS stack.
        libsqlite3_sys::SQLITE_FCNTL_VFSNAME => {
            if let Some(p_arg) = (p_arg as *mut *const c_char).as_mut() {
                let name = ManuallyDrop::new(state.vfs_name.clone());
                *p_arg = name.as_ptr();
            };

            libsqlite3_sys::SQLITE_OK
        }

        // Generate a temporary filename.
        libsqlite3_sys::SQLITE_FCNTL_TEMPFILENAME => {
            if let Some(p_arg) = (p_arg as *mut *const c_char).as_mut() {
                let name = state.vfs.temporary_name();
                // unwrap() is fine as os strings are an arbitrary sequences of non-zero bytes
                let name = CString::new(name.as_bytes()).unwrap();
                let name = ManuallyDrop::new(name);
                *p_arg = name.as_ptr();
            };

            libsqlite3_sys::SQLITE_OK
        }

        // Advisory hints sent around xSync and transaction commit. Silently ignored.
        libsqlite3_sys::SQLITE_FCNTL_SYNC | libsqlite3_sys::SQLITE_FCNTL_COMMIT_PHASETWO => {
            libsqlite3_sys::SQLITE_OK
        }

        _ => libsqlite3_sys::SQLITE_NOTFOUND,
    }
}

/// Return the sector-size in bytes for a file.
pub unsafe extern "C" fn sector_size<V: Vfs>(p_file: *mut libsqlite3_sys::sqlite3_file) -> c_int {
    let state = match file_state::<V>(p_file) {
        Ok(f) => f,
        Err(_) => return 4096,
    };
    log::trace!("[{}] sector_size ({})", state.id, state.db_name);

    state.file.sector_size() as c_int
}

/// Return the device characteristic flags supported by a file.
pub unsafe extern "C" fn device_characteristics<V: Vfs>(
    p_file: *mut libsqlite3_sys::sqlite3_file,
) -> c_int {
    let state = match file_state::<V>(p_file) {
        Ok(f) => f,
        Err(_) => return 0,
    };
    log::trace!("[{}] device_characteristics ({})", state.id, state.db_name);

    let mut caps = state.file.device_characteristics();
    caps.powersafe_overwrite = caps.powersafe_overwrite || state.powersafe_overwrite;
    caps.to_flags()
}
