use fuser::Errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Operation not permitted: {0}")]
    NotPermitted(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("Remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Authorization failed: {0}")]
    Auth(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PanError {
    /// The POSIX error code reported to the kernel for this error.
    pub fn errno(&self) -> Errno {
        match self {
            PanError::NotFound(_) => Errno::ENOENT,
            PanError::PermissionDenied(_) => Errno::EACCES,
            PanError::NotPermitted(_) => Errno::EPERM,
            PanError::AlreadyExists(_) => Errno::EEXIST,
            PanError::Unavailable(_) | PanError::Remote { .. } | PanError::Http(_) => Errno::EAGAIN,
            PanError::Io(e) => match e.raw_os_error() {
                Some(code) => Errno::from(std::io::Error::from_raw_os_error(code)),
                None => match e.kind() {
                    std::io::ErrorKind::NotFound => Errno::ENOENT,
                    std::io::ErrorKind::PermissionDenied => Errno::EACCES,
                    std::io::ErrorKind::AlreadyExists => Errno::EEXIST,
                    _ => Errno::EIO,
                },
            },
            PanError::Auth(_) | PanError::Json(_) | PanError::Config(_) => Errno::EIO,
        }
    }

    /// Whether the error is a missing remote object rather than a transport failure.
    pub fn is_not_found(&self) -> bool {
        match self {
            PanError::NotFound(_) => true,
            PanError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PanError>;
