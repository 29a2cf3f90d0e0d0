//! Error types for sockstun

use thiserror::Error;

/// Main error type for sockstun
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration data is invalid: {0}")]
    InvalidConfiguration(String),

    #[error("Configuration file corrupted: {0}")]
    ConfigurationCorrupted(String),

    #[error("Network connection unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Authentication process failed")]
    AuthenticationFailed,

    #[error("Connection timeout exceeded")]
    ConnectionTimeout,

    #[error("System resources exhausted")]
    ResourceExhausted,

    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("Proxy server unreachable: {0}")]
    ServerUnreachable(String),

    #[error("Malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Engine is already running")]
    AlreadyRunning,

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Process-style exit code reported by `Engine::start`.
    ///
    /// | code | meaning                   |
    /// |------|---------------------------|
    /// | -1   | no interface descriptor   |
    /// | 1    | invalid configuration     |
    /// | 2    | configuration unreadable  |
    /// | 3    | device / socket I/O       |
    /// | 4    | authentication failed     |
    /// | 5    | protocol mismatch         |
    /// | 6    | server unreachable        |
    /// | 7    | connection timeout        |
    /// | 8    | resources exhausted       |
    /// | 9    | engine already running    |
    /// | 10   | anything else             |
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NetworkUnavailable(_) => -1,
            Error::InvalidConfiguration(_) => 1,
            Error::ConfigurationCorrupted(_) => 2,
            Error::Io(_) => 3,
            Error::AuthenticationFailed => 4,
            Error::ProtocolMismatch(_) => 5,
            Error::ServerUnreachable(_) => 6,
            Error::ConnectionTimeout => 7,
            Error::ResourceExhausted => 8,
            Error::AlreadyRunning => 9,
            Error::MalformedPacket(_) | Error::ConnectionClosed | Error::Metrics(_) => 10,
        }
    }

    /// Short label used for per-kind failure counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::InvalidConfiguration(_) => "invalid_configuration",
            Error::ConfigurationCorrupted(_) => "configuration_corrupted",
            Error::NetworkUnavailable(_) => "network_unavailable",
            Error::AuthenticationFailed => "authentication_failed",
            Error::ConnectionTimeout => "connection_timeout",
            Error::ResourceExhausted => "resource_exhausted",
            Error::ProtocolMismatch(_) => "protocol_mismatch",
            Error::ServerUnreachable(_) => "server_unreachable",
            Error::MalformedPacket(_) => "malformed_packet",
            Error::ConnectionClosed => "connection_closed",
            Error::AlreadyRunning => "already_running",
            Error::Metrics(_) => "metrics",
        }
    }
}

/// Result type alias for sockstun
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::NetworkUnavailable("none".into()).exit_code(), -1);
        assert_eq!(Error::InvalidConfiguration("x".into()).exit_code(), 1);
        assert_eq!(Error::ConnectionTimeout.exit_code(), 7);
        assert!(Error::ResourceExhausted.exit_code() > 0);
    }
}
