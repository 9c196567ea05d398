use std::io;
use std::sync::Arc;

/// Errors from sandbox operations.
///
/// Backends map their internal errors into these variants. The type is
/// `Clone` so that a single boot/mount failure can be handed to every
/// caller waiting on the same single-flight request.
#[derive(thiserror::Error, Debug, Clone)]
pub enum SandboxError {
    /// The host cannot run sandboxes at all. Fatal for the session.
    #[error("sandbox runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("mount failed: {0}")]
    Mount(String),

    #[error("write failed for {path}: {reason}")]
    Write { path: String, reason: String },

    #[error("read failed for {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("path escapes workspace: {0}")]
    PathEscape(String),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("io: {0}")]
    Io(Arc<io::Error>),
}

impl SandboxError {
    /// Fatal errors must not be retried for the remainder of the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SandboxError::RuntimeUnavailable(_))
    }
}

impl From<io::Error> for SandboxError {
    fn from(err: io::Error) -> Self {
        SandboxError::Io(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_unavailable_is_fatal() {
        let err = SandboxError::RuntimeUnavailable("no pty support".into());
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "sandbox runtime unavailable: no pty support"
        );
    }

    #[test]
    fn transient_errors_are_not_fatal() {
        assert!(!SandboxError::Mount("disk full".into()).is_fatal());
        assert!(
            !SandboxError::Write {
                path: "a.ts".into(),
                reason: "busy".into()
            }
            .is_fatal()
        );
    }

    #[test]
    fn read_write_display_path() {
        let err = SandboxError::Read {
            path: "src/index.ts".into(),
            reason: "missing".into(),
        };
        assert_eq!(err.to_string(), "read failed for src/index.ts: missing");
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err: SandboxError = io_err.into();
        assert!(err.to_string().contains("file missing"));
        assert!(matches!(err, SandboxError::Io(_)));
    }

    #[test]
    fn clones_share_io_source() {
        let err: SandboxError = io::Error::other("boom").into();
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SandboxError>();
    }
}
