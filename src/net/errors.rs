use std::{fmt, io};

/// Classification of a socket failure.
///
/// An OS error is mapped to one of these exactly once, where it is first
/// observed, and travels unchanged to the error callback afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorKind {
    #[default]
    Success,
    /// The peer closed the stream in an orderly way.
    Eof,
    Timeout,
    Refused,
    /// Host name resolution failed.
    Dns,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Success => "success",
            ErrorKind::Eof => "end of stream",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Refused => "connection refused",
            ErrorKind::Dns => "name resolution failure",
            ErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// A classified socket error plus a human-readable message.
///
/// `SockError::default()` is the success value; [`SockError::is_error`]
/// is false exactly for it.
#[derive(Debug, Clone, PartialEq, Eq, Default, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SockError {
    kind: ErrorKind,
    message: String,
}

impl SockError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn success() -> Self {
        Self::default()
    }

    pub fn eof(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Eof, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Refused, message)
    }

    pub fn dns(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Dns, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other, message)
    }

    /// Maps an OS-level error onto the taxonomy.
    pub fn from_io(err: &io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::ConnectionRefused => ErrorKind::Refused,
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            io::ErrorKind::UnexpectedEof => ErrorKind::Eof,
            _ => match err.raw_os_error() {
                Some(libc::ETIMEDOUT) => ErrorKind::Timeout,
                Some(libc::ECONNREFUSED) => ErrorKind::Refused,
                _ => ErrorKind::Other,
            },
        };
        Self::new(kind, err.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_error(&self) -> bool {
        self.kind != ErrorKind::Success
    }

    pub fn is_success(&self) -> bool {
        !self.is_error()
    }

    pub fn reset(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.kind = kind;
        self.message = message.into();
    }
}

impl From<io::Error> for SockError {
    fn from(err: io::Error) -> Self {
        SockError::from_io(&err)
    }
}

impl From<&SockError> for bool {
    fn from(err: &SockError) -> bool {
        err.is_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_is_not_an_error() {
        let ok = SockError::success();
        assert!(!ok.is_error());
        assert!(!bool::from(&ok));
        assert_eq!(ok.kind(), ErrorKind::Success);
    }

    #[test]
    fn test_io_classification() {
        let cases = [
            (io::ErrorKind::ConnectionRefused, ErrorKind::Refused),
            (io::ErrorKind::TimedOut, ErrorKind::Timeout),
            (io::ErrorKind::UnexpectedEof, ErrorKind::Eof),
            (io::ErrorKind::ConnectionReset, ErrorKind::Other),
            (io::ErrorKind::PermissionDenied, ErrorKind::Other),
        ];
        for (io_kind, expected) in cases {
            let err = SockError::from_io(&io::Error::from(io_kind));
            assert_eq!(err.kind(), expected, "{io_kind:?}");
            assert!(err.is_error());
        }
    }

    #[test]
    fn test_raw_errno_classification() {
        let refused = SockError::from(io::Error::from_raw_os_error(libc::ECONNREFUSED));
        assert_eq!(refused.kind(), ErrorKind::Refused);
        let timeout = SockError::from(io::Error::from_raw_os_error(libc::ETIMEDOUT));
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_display_and_reset() {
        let mut err = SockError::dns("no such host");
        assert_eq!(err.to_string(), "name resolution failure: no such host");
        err.reset(ErrorKind::Success, "");
        assert!(err.is_success());
    }
}
