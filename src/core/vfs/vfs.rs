//! SQLite VFS implementation
//!
//! Implements the sqlite3_vfs interface as a shim over the default VFS.
//! Path handling, locking, time and randomness are delegated unchanged;
//! only file I/O on main database files goes through the page engine.

use super::file::{file_open, CaskFile};
use crate::config::EngineConfig;
use crate::error::{CaskError, Result};
use libsqlite3_sys as ffi;
use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use tracing::info;

/// Name the VFS is registered under when the caller has no preference
pub const VFS_NAME: &str = "pagecask";

/// Pagecask VFS instance, stored in `pAppData`
pub struct CaskVfs {
    /// VFS name (C string)
    name: CString,
    /// Default VFS at registration time
    lower: *mut ffi::sqlite3_vfs,
    /// Configuration every session opened through this VFS starts from
    config: EngineConfig,
}

impl CaskVfs {
    pub(crate) fn name(&self) -> &str {
        self.name.to_str().unwrap_or(VFS_NAME)
    }

    pub(crate) fn lower(&self) -> *mut ffi::sqlite3_vfs {
        self.lower
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }
}

fn vfs_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|e| CaskError::BadConfig(format!("Invalid VFS name: {}", e)))
}

/// Register a pagecask VFS named `name` on top of the current default VFS.
///
/// With `make_default` every connection that does not name a VFS uses it.
pub fn register_vfs(name: &str, config: EngineConfig, make_default: bool) -> Result<()> {
    config.validate()?;
    let c_name = vfs_name(name)?;

    // SAFETY: sqlite3_vfs_find initialises SQLite and returns a registered
    // VFS (or null) that stays valid while registered
    let lower = unsafe {
        if !ffi::sqlite3_vfs_find(c_name.as_ptr()).is_null() {
            return Err(CaskError::VFSRegistrationFailed(ffi::SQLITE_MISUSE));
        }
        ffi::sqlite3_vfs_find(ptr::null())
    };
    if lower.is_null() {
        return Err(CaskError::VFSRegistrationFailed(ffi::SQLITE_ERROR));
    }

    let vfs_ptr = Box::into_raw(Box::new(CaskVfs {
        name: c_name,
        lower,
        config,
    }));

    let sqlite_vfs = Box::new(ffi::sqlite3_vfs {
        iVersion: 3,
        szOsFile: std::mem::size_of::<CaskFile>() as c_int,
        mxPathname: unsafe { (*lower).mxPathname },
        pNext: ptr::null_mut(),
        zName: unsafe { (*vfs_ptr).name.as_ptr() },
        pAppData: vfs_ptr as *mut c_void,
        xOpen: Some(vfs_open),
        xDelete: Some(vfs_delete),
        xAccess: Some(vfs_access),
        xFullPathname: Some(vfs_full_pathname),
        xDlOpen: None,
        xDlError: None,
        xDlSym: None,
        xDlClose: None,
        xRandomness: Some(vfs_randomness),
        xSleep: Some(vfs_sleep),
        xCurrentTime: Some(vfs_current_time),
        xGetLastError: Some(vfs_get_last_error),
        xCurrentTimeInt64: Some(vfs_current_time_int64),
        xSetSystemCall: None,
        xGetSystemCall: None,
        xNextSystemCall: None,
    });

    let vfs_box_ptr = Box::into_raw(sqlite_vfs);

    unsafe {
        let rc = ffi::sqlite3_vfs_register(vfs_box_ptr, make_default as c_int);
        if rc != ffi::SQLITE_OK {
            // Clean up on failure
            drop(Box::from_raw(vfs_box_ptr));
            drop(Box::from_raw(vfs_ptr));
            return Err(CaskError::VFSRegistrationFailed(rc));
        }
    }

    info!("Registered VFS '{}' (default: {})", name, make_default);
    Ok(())
}

/// Unregister the VFS named `name`.
///
/// Every connection opened through it must be closed first. Unknown names
/// are ignored; names that belong to another VFS are refused.
pub fn unregister_vfs(name: &str) -> Result<()> {
    let c_name = vfs_name(name)?;

    unsafe {
        let vfs_ptr = ffi::sqlite3_vfs_find(c_name.as_ptr());
        if vfs_ptr.is_null() {
            return Ok(()); // Already unregistered
        }

        if (*vfs_ptr).xOpen.map(|f| f as usize) != Some(vfs_open as usize) {
            return Err(CaskError::BadConfig(format!(
                "VFS '{}' is not a pagecask VFS",
                name
            )));
        }

        let rc = ffi::sqlite3_vfs_unregister(vfs_ptr);
        if rc != ffi::SQLITE_OK {
            return Err(CaskError::VFSRegistrationFailed(rc));
        }

        // Clean up allocated memory
        let app_data = (*vfs_ptr).pAppData;
        if !app_data.is_null() {
            drop(Box::from_raw(app_data as *mut CaskVfs));
        }
        drop(Box::from_raw(vfs_ptr));
    }

    info!("Unregistered VFS '{}'", name);
    Ok(())
}

/// Whether a VFS with this name is currently registered
pub fn is_registered(name: &str) -> bool {
    match vfs_name(name) {
        Ok(c_name) => unsafe { !ffi::sqlite3_vfs_find(c_name.as_ptr()).is_null() },
        Err(_) => false,
    }
}

unsafe fn lower_vfs(vfs: *mut ffi::sqlite3_vfs) -> Option<*mut ffi::sqlite3_vfs> {
    let app_data = (*vfs).pAppData as *const CaskVfs;
    if app_data.is_null() {
        return None;
    }
    Some((*app_data).lower)
}

// VFS callback functions

unsafe extern "C" fn vfs_open(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    file: *mut ffi::sqlite3_file,
    flags: c_int,
    p_out_flags: *mut c_int,
) -> c_int {
    file_open(vfs, z_name, file, flags, p_out_flags)
}

unsafe extern "C" fn vfs_delete(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    sync_dir: c_int,
) -> c_int {
    match lower_vfs(vfs) {
        Some(lower) => (*lower)
            .xDelete
            .map_or(ffi::SQLITE_IOERR_DELETE, |f| f(lower, z_name, sync_dir)),
        None => ffi::SQLITE_ERROR,
    }
}

unsafe extern "C" fn vfs_access(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    flags: c_int,
    p_res_out: *mut c_int,
) -> c_int {
    match lower_vfs(vfs) {
        Some(lower) => (*lower)
            .xAccess
            .map_or(ffi::SQLITE_IOERR_ACCESS, |f| f(lower, z_name, flags, p_res_out)),
        None => ffi::SQLITE_ERROR,
    }
}

unsafe extern "C" fn vfs_full_pathname(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    n_out: c_int,
    z_out: *mut c_char,
) -> c_int {
    match lower_vfs(vfs) {
        Some(lower) => (*lower)
            .xFullPathname
            .map_or(ffi::SQLITE_CANTOPEN, |f| f(lower, z_name, n_out, z_out)),
        None => ffi::SQLITE_ERROR,
    }
}

unsafe extern "C" fn vfs_randomness(
    vfs: *mut ffi::sqlite3_vfs,
    n_byte: c_int,
    z_out: *mut c_char,
) -> c_int {
    match lower_vfs(vfs).and_then(|lower| (*lower).xRandomness.map(|f| (lower, f))) {
        Some((lower, f)) => f(lower, n_byte, z_out),
        None => {
            let bytes = std::slice::from_raw_parts_mut(z_out as *mut u8, n_byte.max(0) as usize);
            rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, bytes);
            n_byte
        }
    }
}

unsafe extern "C" fn vfs_sleep(vfs: *mut ffi::sqlite3_vfs, microseconds: c_int) -> c_int {
    match lower_vfs(vfs).and_then(|lower| (*lower).xSleep.map(|f| (lower, f))) {
        Some((lower, f)) => f(lower, microseconds),
        None => {
            std::thread::sleep(std::time::Duration::from_micros(microseconds.max(0) as u64));
            microseconds
        }
    }
}

unsafe extern "C" fn vfs_current_time(vfs: *mut ffi::sqlite3_vfs, p_time_out: *mut f64) -> c_int {
    let mut ms: ffi::sqlite3_int64 = 0;
    let rc = vfs_current_time_int64(vfs, &mut ms);
    if rc == ffi::SQLITE_OK {
        *p_time_out = ms as f64 / 86_400_000.0;
    }
    rc
}

unsafe extern "C" fn vfs_current_time_int64(
    vfs: *mut ffi::sqlite3_vfs,
    p_time_out: *mut ffi::sqlite3_int64,
) -> c_int {
    if let Some(lower) = lower_vfs(vfs) {
        if (*lower).iVersion >= 2 {
            if let Some(f) = (*lower).xCurrentTimeInt64 {
                return f(lower, p_time_out);
            }
        }
        if let Some(f) = (*lower).xCurrentTime {
            let mut days = 0.0f64;
            let rc = f(lower, &mut days);
            *p_time_out = (days * 86_400_000.0) as ffi::sqlite3_int64;
            return rc;
        }
    }

    // Julian day in milliseconds
    let unix_ms = chrono::Utc::now().timestamp_millis();
    *p_time_out = 210_866_760_000_000i64 + unix_ms;
    ffi::SQLITE_OK
}

unsafe extern "C" fn vfs_get_last_error(
    vfs: *mut ffi::sqlite3_vfs,
    n_byte: c_int,
    z_err_msg: *mut c_char,
) -> c_int {
    match lower_vfs(vfs).and_then(|lower| (*lower).xGetLastError.map(|f| (lower, f))) {
        Some((lower, f)) => f(lower, n_byte, z_err_msg),
        None => 0,
    }
}
