//! # Advisory Range Locks
//!
//! The single-writer invariant across processes is enforced with an
//! advisory write lock over the file header bytes. The blocking form is
//! taken by `Database::begin` and held until commit or abort; the
//! non-blocking form is a probe that reports "not acquired" instead of an
//! error when another process holds the lock.
//!
//! On unix this uses `fcntl(F_SETLK/F_SETLKW)` byte-range locks, which are
//! released automatically when the file is closed. Platforms without range
//! locks fall back to succeeding unconditionally, which preserves the
//! in-process guarantees (the writer token) but not the cross-process one.

use std::fs::File;
use std::io;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Byte range of the file covered by the writer lock.
pub const LOCK_OFFSET: u64 = 0;
pub const LOCK_LEN: u64 = super::file::FILE_HEADER_SIZE as u64;

#[cfg(unix)]
fn flock_arg(ty: libc::c_int) -> libc::flock {
    // SAFETY: flock is a plain C struct; an all-zero value is valid.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = ty as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = LOCK_OFFSET as libc::off_t;
    fl.l_len = LOCK_LEN as libc::off_t;
    fl
}

/// Blocks until the writer range lock is acquired.
#[cfg(unix)]
pub fn lock_range(file: &File) -> io::Result<()> {
    let fl = flock_arg(libc::F_WRLCK);
    // SAFETY: fd is owned by `file` and fl points at a valid flock value.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLKW, &fl) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Attempts the writer range lock; returns `false` if another process
/// holds it.
#[cfg(unix)]
pub fn try_lock_range(file: &File) -> io::Result<bool> {
    let fl = flock_arg(libc::F_WRLCK);
    // SAFETY: as in lock_range.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &fl) };
    if rc == -1 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EACCES) => Ok(false),
            _ => Err(err),
        };
    }
    Ok(true)
}

/// Releases the writer range lock.
#[cfg(unix)]
pub fn unlock_range(file: &File) -> io::Result<()> {
    let fl = flock_arg(libc::F_UNLCK);
    // SAFETY: as in lock_range.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &fl) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn lock_range(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
pub fn try_lock_range(_file: &File) -> io::Result<bool> {
    Ok(true)
}

#[cfg(not(unix))]
pub fn unlock_range(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_then_unlock_succeeds() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let file = tmp.reopen().unwrap();
        lock_range(&file).unwrap();
        unlock_range(&file).unwrap();
    }

    #[test]
    fn probe_succeeds_within_one_process() {
        // fcntl locks do not exclude the owning process, so the probe must
        // report acquired here; cross-process exclusion needs two
        // processes and is exercised by the writer-lock semantics itself.
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let file = tmp.reopen().unwrap();
        lock_range(&file).unwrap();
        assert!(try_lock_range(&file).unwrap());
        unlock_range(&file).unwrap();
    }
}
