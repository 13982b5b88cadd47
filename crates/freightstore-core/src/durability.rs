//! Platform durable sync.
//!
//! sync=true writes and index saves must survive power loss, and each
//! platform exposes a different strongest primitive for that:
//!
//! - Linux: `fdatasync()` — file data without metadata
//! - macOS/iOS: `fcntl(F_FULLFSYNC)` — past the drive's volatile cache
//! - Windows: `FlushFileBuffers()`
//! - everything else: `File::sync_data`

use std::fs::File;
use std::io;

/// Block until the file's data is on persistent storage.
///
/// Callers must not hold locks that the sync could deadlock against; on a
/// loaded HDD this can take milliseconds.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fdatasync on a descriptor borrowed from an open File.
        let rc = unsafe { libc::fdatasync(fd) };
        if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fcntl(F_FULLFSYNC) on a descriptor borrowed from an open
        // File. Plain fsync on Apple platforms stops at the drive cache.
        let rc = unsafe { libc::fcntl(fd, libc::F_FULLFSYNC) };
        if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(all(unix, not(any(target_os = "linux", target_os = "macos", target_os = "ios"))))]
    {
        file.sync_data()
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        let handle = file.as_raw_handle();
        // SAFETY: FlushFileBuffers on a handle borrowed from an open File.
        let rc = unsafe { FlushFileBuffers(handle as *mut _) };
        if rc != 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(not(any(unix, target_os = "windows")))]
    {
        file.sync_data()
    }
}
