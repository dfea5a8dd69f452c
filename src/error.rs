use std::io;

use thiserror::Error;

/// Unified error type for the pathpin application
#[derive(Error, Debug)]
pub enum ProxyError {
    // Listener errors
    #[error(transparent)]
    Bind(#[from] BindError),

    // Egress path errors
    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Dial(#[from] DialError),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for pathpin operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Failure to set up the listening socket
#[derive(Error, Debug)]
#[error("Failed to bind proxy listener on {addr}: {source}")]
pub struct BindError {
    pub addr: String,
    #[source]
    pub source: io::Error,
}

impl BindError {
    pub fn new(addr: impl Into<String>, source: io::Error) -> Self {
        Self {
            addr: addr.into(),
            source,
        }
    }

    /// Whether another socket already holds the address
    pub fn is_addr_in_use(&self) -> bool {
        self.source.kind() == io::ErrorKind::AddrInUse
    }
}

/// Failure to read a usable request line from a client
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Malformed request line: {0}")]
    Malformed(String),

    #[error("Request line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("Client closed the connection before sending a request line")]
    Closed,

    #[error("IO error while reading request line: {0}")]
    Io(#[from] io::Error),
}

/// Failure to open an egress connection over the pinned path
#[derive(Error, Debug)]
pub enum DialError {
    #[error("Egress path unavailable: {0}")]
    PathUnavailable(String),

    #[error("Connect to {target} failed: {reason}")]
    ConnectFailed { target: String, reason: String },

    #[error("Connect to {target} timed out")]
    Timeout { target: String },
}

impl DialError {
    /// A missing path never recovers within the same session
    pub fn is_retriable(&self) -> bool {
        !matches!(self, DialError::PathUnavailable(_))
    }
}

/// Failure while writing the mode-specific handshake
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Handshake write failed: {0}")]
    IoFailure(#[from] io::Error),
}

/// Why one relay direction stopped early. Informational only.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Read failed: {0}")]
    Read(#[source] io::Error),

    #[error("Write failed: {0}")]
    Write(#[source] io::Error),

    #[error("Relay task aborted")]
    Aborted,
}

/// Errors raised by an egress path provider
#[derive(Error, Debug)]
pub enum PathError {
    #[error("Egress path provider shut down")]
    ProviderClosed,

    #[error("Failed to enumerate network interfaces: {0}")]
    Interfaces(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dial_error_retriable() {
        assert!(!DialError::PathUnavailable("lost".into()).is_retriable());
        assert!(DialError::Timeout {
            target: "example.com:443".into()
        }
        .is_retriable());
        assert!(DialError::ConnectFailed {
            target: "example.com:80".into(),
            reason: "refused".into()
        }
        .is_retriable());
    }

    #[test]
    fn test_bind_error_addr_in_use() {
        let err = BindError::new(
            "0.0.0.0:8080",
            io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        );
        assert!(err.is_addr_in_use());
        assert!(err.to_string().contains("0.0.0.0:8080"));

        let err = BindError::new(
            "0.0.0.0:80",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!err.is_addr_in_use());
    }

    #[test]
    fn test_errors_convert_into_proxy_error() {
        let err: ProxyError = DialError::PathUnavailable("gone".into()).into();
        assert!(matches!(err, ProxyError::Dial(_)));
        assert_eq!(err.to_string(), "Egress path unavailable: gone");

        let err: ProxyError = PathError::ProviderClosed.into();
        assert!(matches!(err, ProxyError::Path(_)));
    }
}
