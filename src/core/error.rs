use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const ELEVATE_HINT: &str = "try running with sudo";

/// Errors raised while querying or reading a device or image file.
#[derive(Error, Debug)]
pub enum DeviceIoError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Permission denied: {path}: {source}")]
    PermissionDenied { path: PathBuf, source: io::Error },

    #[error("Device not found: {path}")]
    NotFound { path: PathBuf },

    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("ioctl {request} failed on {path}: {source}")]
    Ioctl {
        path: PathBuf,
        request: &'static str,
        source: io::Error,
    },

    #[error(
        "Range {offset}+{requested} exceeds available data on {path} ({available} bytes available)"
    )]
    RangeExhausted {
        path: PathBuf,
        offset: u64,
        requested: u64,
        available: u64,
        partial: Vec<u8>,
    },
}

impl DeviceIoError {
    /// Classifies an OS error raised while opening or reading `path`.
    pub fn from_io(path: &Path, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                path: path.to_path_buf(),
                source,
            },
            io::ErrorKind::NotFound => Self::NotFound {
                path: path.to_path_buf(),
            },
            _ => Self::Io {
                path: path.to_path_buf(),
                source,
            },
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParameter(message.into())
    }

    pub fn is_range_exhausted(&self) -> bool {
        matches!(self, Self::RangeExhausted { .. })
    }

    /// Bytes that were read before the range ran out. Empty for any other error.
    pub fn into_partial(self) -> Vec<u8> {
        match self {
            Self::RangeExhausted { partial, .. } => partial,
            _ => Vec::new(),
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidParameter(msg) => format!("Invalid request: {msg}"),
            Self::PermissionDenied { path, .. } => {
                format!("Cannot access {} - {ELEVATE_HINT}", path.display())
            }
            Self::NotFound { path } => format!("{} does not exist", path.display()),
            Self::Io { path, .. } | Self::Ioctl { path, .. } => {
                format!("Error accessing device {}", path.display())
            }
            Self::RangeExhausted { path, .. } => {
                format!("Requested range is past the end of {}", path.display())
            }
        }
    }
}

/// Errors raised while enumerating block devices.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Failed to read mount table {path}: {source}")]
    MountTable { path: PathBuf, source: io::Error },

    #[error("Failed to list block devices in {path}: {source}")]
    DeviceList { path: PathBuf, source: io::Error },
}

impl DiscoveryError {
    pub fn user_message(&self) -> String {
        match self {
            Self::MountTable { .. } => "Unable to read the list of mounted filesystems".into(),
            Self::DeviceList { .. } => "Unable to list block devices on this system".into(),
        }
    }
}

/// Errors that terminate a streaming scan.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Invalid scan configuration: {0}")]
    InvalidConfig(String),

    #[error("Permission denied opening {path}: {source}")]
    PermissionDenied { path: PathBuf, source: io::Error },

    #[error("Failed to open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("Read error on {path} at offset {offset}: {source}")]
    Read {
        path: PathBuf,
        offset: u64,
        source: io::Error,
    },
}

impl ScanError {
    pub(crate) fn open(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::PermissionDenied {
            Self::PermissionDenied {
                path: path.to_path_buf(),
                source,
            }
        } else {
            Self::Open {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    pub(crate) fn read(path: &Path, offset: u64, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::PermissionDenied {
            Self::PermissionDenied {
                path: path.to_path_buf(),
                source,
            }
        } else {
            Self::Read {
                path: path.to_path_buf(),
                offset,
                source,
            }
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidConfig(msg) => format!("Invalid scan settings: {msg}"),
            Self::PermissionDenied { path, .. } => {
                format!("Cannot read {} - {ELEVATE_HINT}", path.display())
            }
            Self::Open { path, .. } => format!("Cannot open {}", path.display()),
            Self::Read { path, offset, .. } => {
                format!("Read error on {} near offset {offset}", path.display())
            }
        }
    }
}

/// Errors raised by the multi-line validator.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Invalid search parameters: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Device(#[from] DeviceIoError),
}

impl ValidationError {
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidParams(msg) => format!("Invalid search: {msg}"),
            Self::Device(e) => e.user_message(),
        }
    }
}

/// Errors returned by the search engine's control surface.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("A search has already been started on this engine")]
    AlreadyStarted,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("Failed to spawn {name} thread: {source}")]
    Spawn { name: &'static str, source: io::Error },
}

impl EngineError {
    pub fn user_message(&self) -> String {
        match self {
            Self::AlreadyStarted => "A search is already running".into(),
            Self::Validation(e) => e.user_message(),
            Self::Scan(e) => e.user_message(),
            Self::Spawn { .. } => "Unable to start the search".into(),
        }
    }
}

/// Errors raised while persisting blocks or results.
#[derive(Error, Debug)]
pub enum SaveError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("I/O error writing {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Device(#[from] DeviceIoError),
}

impl SaveError {
    pub(crate) fn from_io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::PermissionDenied {
            Self::PermissionDenied(path.display().to_string())
        } else {
            Self::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::PermissionDenied(path) => format!("Cannot write to {path} - {ELEVATE_HINT}"),
            Self::Io { path, .. } => format!("Failed to save {}", path.display()),
            Self::Device(e) => e.user_message(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_permission_and_not_found() {
        let path = Path::new("/dev/sdz");
        let err = DeviceIoError::from_io(path, io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, DeviceIoError::PermissionDenied { .. }));
        assert!(err.user_message().contains("sudo"));

        let err = DeviceIoError::from_io(path, io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(err, DeviceIoError::NotFound { .. }));

        let err = DeviceIoError::from_io(path, io::Error::from_raw_os_error(libc::EIO));
        assert!(matches!(err, DeviceIoError::Io { .. }));
        assert_eq!(err.user_message(), "Error accessing device /dev/sdz");
    }

    #[test]
    fn partial_bytes_survive_range_exhaustion() {
        let err = DeviceIoError::RangeExhausted {
            path: PathBuf::from("img"),
            offset: 10,
            requested: 8,
            available: 3,
            partial: vec![1, 2, 3],
        };
        assert!(err.is_range_exhausted());
        assert_eq!(err.into_partial(), vec![1, 2, 3]);
    }

    #[test]
    fn scan_errors_keep_internal_and_user_messages_apart() {
        let err = ScanError::read(
            Path::new("/dev/sdb"),
            4096,
            io::Error::from_raw_os_error(libc::EIO),
        );
        assert!(err.to_string().contains("4096"));
        assert!(err.to_string().contains("/dev/sdb"));
        assert_eq!(err.user_message(), "Read error on /dev/sdb near offset 4096");
    }
}
