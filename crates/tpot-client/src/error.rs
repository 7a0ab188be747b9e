//! Tunnel client errors

use thiserror::Error;
use tpot_proto::CodecError;

/// Why the persistent connection could not be established
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectFailure {
    #[error("The server {0} could not be reached.")]
    Unreachable(String),

    #[error("The server did not authorize your request. Please check your authentication key.")]
    Unauthorized,

    #[error("The server returned a 404 Not Found. Please check your server URL.")]
    NotFound,

    #[error("The server returned a 409 Conflict. This likely means the subdomain you requested is already in use.")]
    SubdomainConflict,

    #[error("The server rejected the connection with HTTP status {0}.")]
    Rejected(u16),

    #[error("The connection handshake failed: {0}")]
    Handshake(String),
}

impl ConnectFailure {
    /// Classify an HTTP status returned instead of a WebSocket upgrade
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => ConnectFailure::Unauthorized,
            404 => ConnectFailure::NotFound,
            409 => ConnectFailure::SubdomainConflict,
            other => ConnectFailure::Rejected(other),
        }
    }
}

/// Tunnel client errors. Every variant is fatal to the session.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("{0}")]
    ConnectionError(ConnectFailure),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Disconnected from server: {0}")]
    Disconnected(String),
}

impl From<CodecError> for TunnelError {
    fn from(err: CodecError) -> Self {
        TunnelError::ProtocolError(err.to_string())
    }
}

impl From<ConnectFailure> for TunnelError {
    fn from(failure: ConnectFailure) -> Self {
        TunnelError::ConnectionError(failure)
    }
}

impl TunnelError {
    /// Process exit status for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            TunnelError::ConfigError(_) => 2,
            TunnelError::ConnectionError(_) | TunnelError::ProtocolError(_) => 3,
            TunnelError::Disconnected(_) => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(ConnectFailure::from_status(401), ConnectFailure::Unauthorized);
        assert_eq!(ConnectFailure::from_status(404), ConnectFailure::NotFound);
        assert_eq!(
            ConnectFailure::from_status(409),
            ConnectFailure::SubdomainConflict
        );
        assert_eq!(
            ConnectFailure::from_status(502),
            ConnectFailure::Rejected(502)
        );
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let config = TunnelError::ConfigError("bad".into()).exit_code();
        let protocol = TunnelError::ProtocolError("desync".into()).exit_code();
        let connection = TunnelError::from(ConnectFailure::NotFound).exit_code();
        let disconnected = TunnelError::Disconnected("gone".into()).exit_code();

        assert_eq!(protocol, connection);
        assert_ne!(config, protocol);
        assert_ne!(config, disconnected);
        assert_ne!(protocol, disconnected);
        assert!(config != 0 && protocol != 0 && disconnected != 0);
    }

    #[test]
    fn test_codec_errors_are_protocol_errors() {
        let err: TunnelError = CodecError::UnknownMessageType(0xff).into();
        assert!(matches!(err, TunnelError::ProtocolError(_)));
    }
}
