//! The kernel's error taxonomy.
//!
//! Every fallible kernel operation returns `Result<T, KError>` instead of a
//! negative integer; `KError::to_errno` is the only place that translation
//! happens, at the syscall boundary.

use core::fmt;

/// A tagged kernel error, one variant per entry in the spec's error domain.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KError {
    /// fd out of range, slot empty, or wrong mode for the operation.
    Ebadf,
    /// Bad flag/mode/whence, ".", negative seek result, null where disallowed.
    Einval,
    /// Descriptor table full.
    Emfile,
    /// Allocator failure.
    Enomem,
    /// Path >= MAXPATHLEN or a component >= NAMELEN.
    Enametoolong,
    /// No such path component.
    Enoent,
    /// Target already exists.
    Eexist,
    /// Component used as a directory is not one, or lookup on a non-directory.
    Enotdir,
    /// Write to a directory, or unlink on a directory.
    Eisdir,
    /// rmdir whose final component is "..".
    Enotempty,
    /// Device special with no registered driver.
    Enxio,
    /// User address outside mapped range, or permission denied on a fault.
    Efault,
    /// waitpid with no matching child.
    Echild,
    /// A cancellable sleep was cancelled.
    Eintr,
}

impl KError {
    /// The negative errno a syscall trampoline would hand back to user space.
    pub const fn to_errno(self) -> i32 {
        -(match self {
            KError::Ebadf => 9,
            KError::Einval => 22,
            KError::Emfile => 24,
            KError::Enomem => 12,
            KError::Enametoolong => 36,
            KError::Enoent => 2,
            KError::Eexist => 17,
            KError::Enotdir => 20,
            KError::Eisdir => 21,
            KError::Enotempty => 39,
            KError::Enxio => 6,
            KError::Efault => 14,
            KError::Echild => 10,
            KError::Eintr => 4,
        })
    }
}

impl fmt::Display for KError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KError::Ebadf => "bad file descriptor",
            KError::Einval => "invalid argument",
            KError::Emfile => "too many open files",
            KError::Enomem => "out of memory",
            KError::Enametoolong => "path too long",
            KError::Enoent => "no such file or directory",
            KError::Eexist => "file exists",
            KError::Enotdir => "not a directory",
            KError::Eisdir => "is a directory",
            KError::Enotempty => "directory not empty",
            KError::Enxio => "no such device",
            KError::Efault => "bad address",
            KError::Echild => "no child processes",
            KError::Eintr => "interrupted",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for KError {}

pub type KResult<T> = Result<T, KError>;
