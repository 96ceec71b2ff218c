//! Error taxonomy for process inspection and adjustment

use thiserror::Error;

pub type ProcessResult<T> = Result<T, ProcessError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// The process went away between discovery and inspection.
    #[error("process {0} has exited")]
    Exited(u32),

    #[error("access denied to process {0}")]
    AccessDenied(u32),

    #[error("process {0} not found")]
    NotFound(u32),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("I/O error on process {pid}: {message}")]
    Io { pid: u32, message: String },
}

impl ProcessError {
    /// Classify a raw OS error for `pid`.
    pub fn from_io(pid: u32, err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ESRCH) => ProcessError::Exited(pid),
            Some(libc::EPERM) | Some(libc::EACCES) => ProcessError::AccessDenied(pid),
            Some(libc::ENOSYS) => ProcessError::Unsupported("syscall unavailable"),
            _ => match err.kind() {
                std::io::ErrorKind::NotFound => ProcessError::Exited(pid),
                std::io::ErrorKind::PermissionDenied => ProcessError::AccessDenied(pid),
                _ => ProcessError::Io {
                    pid,
                    message: err.to_string(),
                },
            },
        }
    }

    /// Capture `errno` after a failed libc call.
    pub fn last_os_error(pid: u32) -> Self {
        Self::from_io(pid, std::io::Error::last_os_error())
    }

    /// Races with process exit are part of normal operation.
    pub fn is_exited(&self) -> bool {
        matches!(self, ProcessError::Exited(_) | ProcessError::NotFound(_))
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, ProcessError::AccessDenied(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errno() {
        let exited = ProcessError::from_io(7, std::io::Error::from_raw_os_error(libc::ESRCH));
        assert_eq!(exited, ProcessError::Exited(7));
        assert!(exited.is_exited());

        let denied = ProcessError::from_io(7, std::io::Error::from_raw_os_error(libc::EPERM));
        assert!(denied.is_access_denied());

        let missing = ProcessError::from_io(7, std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(missing.is_exited());
    }
}
