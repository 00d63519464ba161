//! Translation of failures into the errno values handed back to the kernel.

use std::io;

/// Errors that can be reported to the kernel as a single errno.
pub trait Errno {
    fn errno(&self) -> i32;
}

/// Map an I/O error coming out of a backend to an errno.
///
/// A raw OS error passes through untouched. `UnexpectedEof` maps to 0: running off the
/// end of a file is a successful zero-byte transfer, not a failure.
#[allow(clippy::wildcard_enum_match_arm)]
pub fn errno_of(err: &io::Error) -> i32 {
    if let Some(code) = err.raw_os_error() {
        return code;
    }

    match err.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::UnexpectedEof => 0,
        _ => libc::EIO,
    }
}

impl Errno for io::Error {
    fn errno(&self) -> i32 {
        errno_of(self)
    }
}

/// Error returned by a resource that was already closed.
pub(crate) fn already_closed() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}
