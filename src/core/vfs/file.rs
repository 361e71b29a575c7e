//! SQLite file I/O methods
//!
//! Every file SQLite opens through the pagecask VFS is a [`CaskFile`]: the
//! `sqlite3_file` header followed by a pointer to a [`PagedFile`] session
//! over the file the lower VFS opened. Main databases get an engine session;
//! journals, WAL and temp files get a pass-through one.

use super::vfs::CaskVfs;
use crate::error::CaskError;
use crate::session::{OpenFlags, PagedFile, ReadOutcome};
use crate::storage::Storage;
use libsqlite3_sys as ffi;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::io;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use tracing::{debug, warn};

/// Pagecask-backed SQLite file
#[repr(C)]
pub struct CaskFile {
    /// Base sqlite3_file structure (MUST be first field)
    pub base: ffi::sqlite3_file,
    /// Owned session, null until open succeeds
    session: *mut PagedFile<LowerFile>,
}

/// Result code from the lower VFS, carried through `io::Error` so it can be
/// handed back to SQLite unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LowerIoError(pub c_int);

impl fmt::Display for LowerIoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lower VFS returned {}", self.0)
    }
}

impl std::error::Error for LowerIoError {}

fn lower_error(rc: c_int) -> io::Error {
    io::Error::new(io::ErrorKind::Other, LowerIoError(rc))
}

fn lower_rc(err: &io::Error) -> Option<c_int> {
    err.get_ref()
        .and_then(|e| e.downcast_ref::<LowerIoError>())
        .map(|e| e.0)
}

/// SQLite result code for an engine error
pub(crate) fn error_code(err: &CaskError, fallback: c_int) -> c_int {
    match err {
        e if e.is_corruption() => ffi::SQLITE_CORRUPT,
        e if e.is_out_of_space() => ffi::SQLITE_FULL,
        CaskError::ReadOnly => ffi::SQLITE_READONLY,
        CaskError::Io(io) => lower_rc(io).unwrap_or(fallback),
        _ => fallback,
    }
}

/// A file opened by the lower VFS, used as the session's storage
pub struct LowerFile {
    file: *mut ffi::sqlite3_file,
    layout: Layout,
    /// Flags for the next `xSync`
    sync_flags: c_int,
    open: bool,
}

impl LowerFile {
    unsafe fn open(
        lower: *mut ffi::sqlite3_vfs,
        z_name: *const c_char,
        flags: c_int,
        p_out_flags: *mut c_int,
    ) -> Result<Self, c_int> {
        let x_open = (*lower).xOpen.ok_or(ffi::SQLITE_ERROR)?;

        let size = ((*lower).szOsFile as usize).max(std::mem::size_of::<ffi::sqlite3_file>());
        let layout = Layout::from_size_align(size, 8).map_err(|_| ffi::SQLITE_NOMEM)?;
        let file = alloc_zeroed(layout) as *mut ffi::sqlite3_file;
        if file.is_null() {
            return Err(ffi::SQLITE_NOMEM);
        }

        let rc = x_open(lower, z_name, file, flags, p_out_flags);
        if rc != ffi::SQLITE_OK {
            // A lower file that installed its methods must still be closed
            if let Some(close) = (*file).pMethods.as_ref().and_then(|m| m.xClose) {
                close(file);
            }
            dealloc(file as *mut u8, layout);
            return Err(rc);
        }

        Ok(LowerFile {
            file,
            layout,
            sync_flags: ffi::SQLITE_SYNC_NORMAL,
            open: true,
        })
    }

    pub(crate) fn raw(&self) -> *mut ffi::sqlite3_file {
        self.file
    }

    fn methods(&self) -> io::Result<&ffi::sqlite3_io_methods> {
        // SAFETY: `file` was opened by the lower VFS and stays valid until drop
        unsafe { (*self.file).pMethods.as_ref() }.ok_or_else(|| lower_error(ffi::SQLITE_MISUSE))
    }

    pub(crate) fn set_sync_flags(&mut self, flags: c_int) {
        self.sync_flags = flags;
    }
}

fn check(rc: c_int) -> io::Result<()> {
    if rc == ffi::SQLITE_OK {
        Ok(())
    } else {
        Err(lower_error(rc))
    }
}

impl Storage for LowerFile {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let x_read = self.methods()?.xRead.ok_or_else(|| lower_error(ffi::SQLITE_IOERR_READ))?;
        // SAFETY: `buf` is valid for `buf.len()` bytes
        let rc = unsafe {
            x_read(
                self.file,
                buf.as_mut_ptr() as *mut c_void,
                buf.len() as c_int,
                offset as ffi::sqlite3_int64,
            )
        };
        match rc {
            ffi::SQLITE_OK => Ok(buf.len()),
            ffi::SQLITE_IOERR_SHORT_READ => {
                let size = self.size()?;
                Ok((size.saturating_sub(offset) as usize).min(buf.len()))
            }
            rc => Err(lower_error(rc)),
        }
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        let x_write = self.methods()?.xWrite.ok_or_else(|| lower_error(ffi::SQLITE_IOERR_WRITE))?;
        // SAFETY: `buf` is valid for `buf.len()` bytes
        check(unsafe {
            x_write(
                self.file,
                buf.as_ptr() as *const c_void,
                buf.len() as c_int,
                offset as ffi::sqlite3_int64,
            )
        })
    }

    fn truncate(&mut self, size: u64) -> io::Result<()> {
        let x_truncate = self
            .methods()?
            .xTruncate
            .ok_or_else(|| lower_error(ffi::SQLITE_IOERR_TRUNCATE))?;
        check(unsafe { x_truncate(self.file, size as ffi::sqlite3_int64) })
    }

    fn sync(&mut self) -> io::Result<()> {
        let x_sync = self.methods()?.xSync.ok_or_else(|| lower_error(ffi::SQLITE_IOERR_FSYNC))?;
        check(unsafe { x_sync(self.file, self.sync_flags) })
    }

    fn size(&mut self) -> io::Result<u64> {
        let x_file_size = self
            .methods()?
            .xFileSize
            .ok_or_else(|| lower_error(ffi::SQLITE_IOERR_FSTAT))?;
        let mut size: ffi::sqlite3_int64 = 0;
        check(unsafe { x_file_size(self.file, &mut size) })?;
        Ok(size.max(0) as u64)
    }

    fn close(&mut self) -> io::Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let x_close = self.methods()?.xClose.ok_or_else(|| lower_error(ffi::SQLITE_IOERR_CLOSE))?;
        check(unsafe { x_close(self.file) })
    }
}

impl Drop for LowerFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close lower file: {}", e);
        }
        // SAFETY: allocated in `open` with this layout
        unsafe { dealloc(self.file as *mut u8, self.layout) };
    }
}

static IO_METHODS: ffi::sqlite3_io_methods = ffi::sqlite3_io_methods {
    iVersion: 3,
    xClose: Some(file_close),
    xRead: Some(file_read),
    xWrite: Some(file_write),
    xTruncate: Some(file_truncate),
    xSync: Some(file_sync),
    xFileSize: Some(file_file_size),
    xLock: Some(file_lock),
    xUnlock: Some(file_unlock),
    xCheckReservedLock: Some(file_check_reserved_lock),
    xFileControl: Some(file_file_control),
    xSectorSize: Some(file_sector_size),
    xDeviceCharacteristics: Some(file_device_characteristics),
    xShmMap: Some(file_shm_map),
    xShmLock: Some(file_shm_lock),
    xShmBarrier: Some(file_shm_barrier),
    xShmUnmap: Some(file_shm_unmap),
    xFetch: Some(file_fetch),
    xUnfetch: Some(file_unfetch),
};

unsafe fn session<'a>(file: *mut ffi::sqlite3_file) -> &'a mut PagedFile<LowerFile> {
    &mut *(*(file as *mut CaskFile)).session
}

/// The lower file and its method table
unsafe fn lower<'a>(file: *mut ffi::sqlite3_file) -> (*mut ffi::sqlite3_file, Option<&'a ffi::sqlite3_io_methods>) {
    let raw = session(file).storage_mut().raw();
    (raw, (*raw).pMethods.as_ref())
}

// File I/O method implementations

unsafe extern "C" fn file_close(file: *mut ffi::sqlite3_file) -> c_int {
    let cask_file = &mut *(file as *mut CaskFile);
    if cask_file.session.is_null() {
        return ffi::SQLITE_OK;
    }

    let session = Box::from_raw(cask_file.session);
    cask_file.session = ptr::null_mut();

    match session.close() {
        Ok(_) => ffi::SQLITE_OK,
        Err(e) => {
            warn!("Close failed: {}", e);
            error_code(&e, ffi::SQLITE_IOERR_CLOSE)
        }
    }
}

unsafe extern "C" fn file_read(
    file: *mut ffi::sqlite3_file,
    buf: *mut c_void,
    amt: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    if offset < 0 || amt < 0 {
        return ffi::SQLITE_IOERR_READ;
    }

    let out = std::slice::from_raw_parts_mut(buf as *mut u8, amt as usize);
    match session(file).read(out, offset as u64) {
        Ok(ReadOutcome::Complete) => ffi::SQLITE_OK,
        Ok(ReadOutcome::Short) => ffi::SQLITE_IOERR_SHORT_READ,
        Err(e) => {
            debug!("Read of {} bytes at {} failed: {}", amt, offset, e);
            error_code(&e, ffi::SQLITE_IOERR_READ)
        }
    }
}

unsafe extern "C" fn file_write(
    file: *mut ffi::sqlite3_file,
    buf: *const c_void,
    amt: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    if offset < 0 || amt < 0 {
        return ffi::SQLITE_IOERR_WRITE;
    }

    let data = std::slice::from_raw_parts(buf as *const u8, amt as usize);
    match session(file).write(data, offset as u64) {
        Ok(()) => ffi::SQLITE_OK,
        Err(e) => {
            debug!("Write of {} bytes at {} failed: {}", amt, offset, e);
            error_code(&e, ffi::SQLITE_IOERR_WRITE)
        }
    }
}

unsafe extern "C" fn file_truncate(file: *mut ffi::sqlite3_file, size: ffi::sqlite3_int64) -> c_int {
    if size < 0 {
        return ffi::SQLITE_IOERR_TRUNCATE;
    }

    match session(file).truncate(size as u64) {
        Ok(()) => ffi::SQLITE_OK,
        Err(e) => error_code(&e, ffi::SQLITE_IOERR_TRUNCATE),
    }
}

unsafe extern "C" fn file_sync(file: *mut ffi::sqlite3_file, flags: c_int) -> c_int {
    let session = session(file);
    session.storage_mut().set_sync_flags(flags);

    match session.sync() {
        Ok(()) => ffi::SQLITE_OK,
        Err(e) => {
            warn!("Sync failed: {}", e);
            error_code(&e, ffi::SQLITE_IOERR_FSYNC)
        }
    }
}

unsafe extern "C" fn file_file_size(
    file: *mut ffi::sqlite3_file,
    p_size: *mut ffi::sqlite3_int64,
) -> c_int {
    match session(file).file_size() {
        Ok(size) => {
            *p_size = size as ffi::sqlite3_int64;
            ffi::SQLITE_OK
        }
        Err(e) => error_code(&e, ffi::SQLITE_IOERR_FSTAT),
    }
}

unsafe extern "C" fn file_lock(file: *mut ffi::sqlite3_file, lock_type: c_int) -> c_int {
    match lower(file) {
        (raw, Some(methods)) => methods.xLock.map_or(ffi::SQLITE_OK, |f| f(raw, lock_type)),
        _ => ffi::SQLITE_IOERR_LOCK,
    }
}

unsafe extern "C" fn file_unlock(file: *mut ffi::sqlite3_file, lock_type: c_int) -> c_int {
    match lower(file) {
        (raw, Some(methods)) => methods.xUnlock.map_or(ffi::SQLITE_OK, |f| f(raw, lock_type)),
        _ => ffi::SQLITE_IOERR_UNLOCK,
    }
}

unsafe extern "C" fn file_check_reserved_lock(
    file: *mut ffi::sqlite3_file,
    p_res_out: *mut c_int,
) -> c_int {
    match lower(file) {
        (raw, Some(methods)) => match methods.xCheckReservedLock {
            Some(f) => f(raw, p_res_out),
            None => {
                *p_res_out = 0;
                ffi::SQLITE_OK
            }
        },
        _ => ffi::SQLITE_IOERR_CHECKRESERVEDLOCK,
    }
}

unsafe extern "C" fn file_file_control(
    file: *mut ffi::sqlite3_file,
    op: c_int,
    p_arg: *mut c_void,
) -> c_int {
    // Pre-sizing the lower file would only create slack the allocator
    // does not know about
    if session(file).is_engine_file()
        && (op == ffi::SQLITE_FCNTL_SIZE_HINT || op == ffi::SQLITE_FCNTL_CHUNK_SIZE)
    {
        return ffi::SQLITE_NOTFOUND;
    }

    match lower(file) {
        (raw, Some(methods)) => methods
            .xFileControl
            .map_or(ffi::SQLITE_NOTFOUND, |f| f(raw, op, p_arg)),
        _ => ffi::SQLITE_NOTFOUND,
    }
}

unsafe extern "C" fn file_sector_size(file: *mut ffi::sqlite3_file) -> c_int {
    match lower(file) {
        (raw, Some(methods)) => methods.xSectorSize.map_or(4096, |f| f(raw)),
        _ => 4096,
    }
}

unsafe extern "C" fn file_device_characteristics(file: *mut ffi::sqlite3_file) -> c_int {
    match lower(file) {
        (raw, Some(methods)) => methods.xDeviceCharacteristics.map_or(0, |f| f(raw)),
        _ => 0,
    }
}

unsafe extern "C" fn file_shm_map(
    file: *mut ffi::sqlite3_file,
    region: c_int,
    region_size: c_int,
    extend: c_int,
    pp: *mut *mut c_void,
) -> c_int {
    match lower(file) {
        (raw, Some(methods)) if methods.iVersion >= 2 => methods
            .xShmMap
            .map_or(ffi::SQLITE_IOERR_SHMMAP, |f| f(raw, region, region_size, extend, pp)),
        _ => ffi::SQLITE_IOERR_SHMMAP,
    }
}

unsafe extern "C" fn file_shm_lock(
    file: *mut ffi::sqlite3_file,
    offset: c_int,
    n: c_int,
    flags: c_int,
) -> c_int {
    match lower(file) {
        (raw, Some(methods)) if methods.iVersion >= 2 => methods
            .xShmLock
            .map_or(ffi::SQLITE_IOERR_SHMLOCK, |f| f(raw, offset, n, flags)),
        _ => ffi::SQLITE_IOERR_SHMLOCK,
    }
}

unsafe extern "C" fn file_shm_barrier(file: *mut ffi::sqlite3_file) {
    if let (raw, Some(methods)) = lower(file) {
        if methods.iVersion >= 2 {
            if let Some(f) = methods.xShmBarrier {
                f(raw);
            }
        }
    }
}

unsafe extern "C" fn file_shm_unmap(file: *mut ffi::sqlite3_file, delete_flag: c_int) -> c_int {
    match lower(file) {
        (raw, Some(methods)) if methods.iVersion >= 2 => {
            methods.xShmUnmap.map_or(ffi::SQLITE_OK, |f| f(raw, delete_flag))
        }
        _ => ffi::SQLITE_OK,
    }
}

/// Memory-mapped reads would bypass the codec, so every fetch is refused
/// and SQLite falls back to `xRead`
unsafe extern "C" fn file_fetch(
    _file: *mut ffi::sqlite3_file,
    _offset: ffi::sqlite3_int64,
    _amt: c_int,
    pp: *mut *mut c_void,
) -> c_int {
    *pp = ptr::null_mut();
    ffi::SQLITE_OK
}

unsafe extern "C" fn file_unfetch(
    _file: *mut ffi::sqlite3_file,
    _offset: ffi::sqlite3_int64,
    _p: *mut c_void,
) -> c_int {
    ffi::SQLITE_OK
}

// VFS open callback

pub(crate) unsafe extern "C" fn file_open(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    file: *mut ffi::sqlite3_file,
    flags: c_int,
    p_out_flags: *mut c_int,
) -> c_int {
    let app_data = (*vfs).pAppData as *const CaskVfs;
    if app_data.is_null() {
        return ffi::SQLITE_ERROR;
    }
    let vfs_impl = &*app_data;

    // SQLite hands us uninitialised memory of szOsFile bytes
    let cask_file = file as *mut CaskFile;
    ptr::write(
        cask_file,
        CaskFile {
            base: ffi::sqlite3_file {
                pMethods: ptr::null(),
            },
            session: ptr::null_mut(),
        },
    );

    let lower = match LowerFile::open(vfs_impl.lower(), z_name, flags, p_out_flags) {
        Ok(lower) => lower,
        Err(rc) => return rc,
    };

    let effective = if p_out_flags.is_null() { flags } else { *p_out_flags };
    let mut open_flags = OpenFlags::empty();
    if effective & ffi::SQLITE_OPEN_READONLY != 0 {
        open_flags |= OpenFlags::READ_ONLY;
    }
    if flags & ffi::SQLITE_OPEN_CREATE != 0 {
        open_flags |= OpenFlags::CREATE;
    }

    let session = if flags & ffi::SQLITE_OPEN_MAIN_DB != 0 {
        match PagedFile::open(lower, vfs_impl.config().clone(), open_flags) {
            Ok(session) => session,
            Err(e) => {
                warn!("Cannot open main database through '{}': {}", vfs_impl.name(), e);
                return ffi::SQLITE_CANTOPEN;
            }
        }
    } else {
        PagedFile::passthrough(lower, open_flags)
    };

    debug!(
        "Opened {} file (flags {:#x})",
        if session.is_engine_file() { "engine" } else { "pass-through" },
        flags
    );

    (*cask_file).session = Box::into_raw(Box::new(session));
    (*cask_file).base.pMethods = &IO_METHODS;
    ffi::SQLITE_OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            error_code(&CaskError::corrupt(3, "bad"), ffi::SQLITE_IOERR_READ),
            ffi::SQLITE_CORRUPT
        );
        assert_eq!(
            error_code(&CaskError::NoSpace("full".into()), ffi::SQLITE_IOERR_WRITE),
            ffi::SQLITE_FULL
        );
        assert_eq!(
            error_code(
                &CaskError::IndexOverflow {
                    needed: 48,
                    capacity: 24
                },
                ffi::SQLITE_IOERR_WRITE
            ),
            ffi::SQLITE_FULL
        );
        assert_eq!(
            error_code(&CaskError::ReadOnly, ffi::SQLITE_IOERR_WRITE),
            ffi::SQLITE_READONLY
        );
        assert_eq!(
            error_code(&CaskError::BadConfig("no key".into()), ffi::SQLITE_IOERR_READ),
            ffi::SQLITE_IOERR_READ
        );
    }

    #[test]
    fn test_lower_rc_survives_io_error() {
        let err = CaskError::Io(lower_error(ffi::SQLITE_IOERR_FSYNC));
        assert_eq!(error_code(&err, ffi::SQLITE_IOERR), ffi::SQLITE_IOERR_FSYNC);

        let plain = CaskError::Io(io::Error::new(io::ErrorKind::Other, "disk"));
        assert_eq!(error_code(&plain, ffi::SQLITE_IOERR_WRITE), ffi::SQLITE_IOERR_WRITE);
    }
}
