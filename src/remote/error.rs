//! Error taxonomy and classification for tunnels, sessions and the vault.
//!
//! Transport errors reach us as free-form messages (russh, io, helper
//! processes). [`classify_error`] maps them onto [`ErrorKind`] so the
//! connection retry loop can tell a terminal authentication failure from a
//! transient transport or protocol hiccup.
//!
//! # Classification Strategy
//!
//! 1. **Authentication failures (terminal)**: wrong password, denied access.
//!    Never retried, reported distinctly so callers can re-prompt.
//! 2. **Transport unreachable (retryable)**: refused, reset, timed out,
//!    unreachable network.
//! 3. **Protocol errors (retryable within budget)**: banner, handshake, key
//!    exchange problems. USB tunnels often drop the first banner while the
//!    device side spins up.
//! 4. **Everything else**: retried until the attempt budget is exhausted.
//!
//! Authentication patterns take precedence: "Connection timeout during
//! authentication failed" is an authentication failure.

use thiserror::Error;

/// Authentication error patterns that indicate permanent failures.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "password authentication failed",
    "permission denied",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
];

/// Transport error patterns that indicate an unreachable endpoint.
const UNREACHABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timed out",
    "timeout",
    "network is unreachable",
    "no route to host",
    "host is down",
    "not reachable",
    "temporary failure",
    "resource temporarily unavailable",
    "failed to connect",
    "broken pipe",
];

/// SSH protocol error patterns.
const PROTOCOL_ERRORS: &[&str] = &[
    "banner",
    "handshake",
    "kex",
    "key exchange",
    "protocol",
    "version",
    "disconnect",
    "ssh",
];

/// Coarse category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransportUnreachable,
    AuthenticationFailed,
    Protocol,
    Other,
}

/// Classify a transport error message.
pub(crate) fn classify_error(error: &str) -> ErrorKind {
    let error_lower = error.to_lowercase();

    if AUTH_ERRORS.iter().any(|p| error_lower.contains(p)) {
        return ErrorKind::AuthenticationFailed;
    }

    if UNREACHABLE_ERRORS.iter().any(|p| error_lower.contains(p)) {
        return ErrorKind::TransportUnreachable;
    }

    if PROTOCOL_ERRORS.iter().any(|p| error_lower.contains(p)) {
        return ErrorKind::Protocol;
    }

    ErrorKind::Other
}

/// Failure of a single connection attempt or of a whole connect call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Port {port} on {host} is not reachable")]
    TransportUnreachable { host: String, port: u16 },

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("SSH error: {0}")]
    Protocol(String),

    #[error("Connection failed: {0}")]
    Other(String),
}

impl SessionError {
    /// Build an error from a transport message using [`classify_error`].
    pub(crate) fn from_message(host: &str, port: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match classify_error(&message) {
            ErrorKind::AuthenticationFailed => SessionError::AuthenticationFailed,
            ErrorKind::TransportUnreachable => SessionError::TransportUnreachable {
                host: host.to_string(),
                port,
            },
            ErrorKind::Protocol => SessionError::Protocol(message),
            ErrorKind::Other => SessionError::Other(message),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::TransportUnreachable { .. } => ErrorKind::TransportUnreachable,
            SessionError::AuthenticationFailed => ErrorKind::AuthenticationFailed,
            SessionError::Protocol(_) => ErrorKind::Protocol,
            SessionError::Other(_) => ErrorKind::Other,
        }
    }

    /// Only authentication failures are terminal.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SessionError::AuthenticationFailed)
    }
}

/// Failure while bringing up a device tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    #[error("No free port in range {start}..{end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("Failed to start tunnel: {0}")]
    Start(String),

    #[error("Port {0} not ready after starting tunnel")]
    NotReady(u16),
}

/// Credential vault failures.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("vault file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("encryption key file is invalid: {0}")]
    InvalidKey(String),

    #[error("secret store error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    mod classification {
        use super::*;

        #[test]
        fn test_authentication_failures() {
            assert_eq!(
                classify_error("Authentication failed"),
                ErrorKind::AuthenticationFailed
            );
            assert_eq!(
                classify_error("Permission denied (password)"),
                ErrorKind::AuthenticationFailed
            );
            assert_eq!(
                classify_error("password authentication failed: wrong password"),
                ErrorKind::AuthenticationFailed
            );
        }

        #[test]
        fn test_unreachable() {
            assert_eq!(
                classify_error("Connection refused (os error 111)"),
                ErrorKind::TransportUnreachable
            );
            assert_eq!(
                classify_error("No route to host"),
                ErrorKind::TransportUnreachable
            );
            assert_eq!(
                classify_error("Connection timed out after 15s"),
                ErrorKind::TransportUnreachable
            );
        }

        #[test]
        fn test_protocol() {
            assert_eq!(
                classify_error("Error reading SSH protocol banner"),
                ErrorKind::Protocol
            );
            assert_eq!(classify_error("Kex failure"), ErrorKind::Protocol);
        }

        #[test]
        fn test_unknown_is_other() {
            assert_eq!(classify_error("Something went wrong"), ErrorKind::Other);
            assert_eq!(classify_error(""), ErrorKind::Other);
        }

        #[test]
        fn test_auth_takes_precedence() {
            assert_eq!(
                classify_error("Connection timeout during authentication failed"),
                ErrorKind::AuthenticationFailed
            );
        }

        #[test]
        fn test_case_insensitive() {
            assert_eq!(
                classify_error("PERMISSION DENIED"),
                ErrorKind::AuthenticationFailed
            );
            assert_eq!(
                classify_error("CONNECTION REFUSED"),
                ErrorKind::TransportUnreachable
            );
        }
    }

    mod session_error {
        use super::*;

        #[test]
        fn test_only_auth_is_terminal() {
            assert!(!SessionError::AuthenticationFailed.is_retryable());
            assert!(SessionError::Protocol("banner".into()).is_retryable());
            assert!(SessionError::Other("boom".into()).is_retryable());
            assert!(
                SessionError::TransportUnreachable {
                    host: "localhost".into(),
                    port: 2222
                }
                .is_retryable()
            );
        }

        #[test]
        fn test_from_message_maps_kind() {
            let err = SessionError::from_message("10.0.0.2", 22, "Connection refused");
            assert_eq!(
                err,
                SessionError::TransportUnreachable {
                    host: "10.0.0.2".into(),
                    port: 22
                }
            );
            assert_eq!(
                SessionError::from_message("h", 22, "Permission denied").kind(),
                ErrorKind::AuthenticationFailed
            );
            assert_eq!(
                SessionError::from_message("h", 22, "handshake failed").kind(),
                ErrorKind::Protocol
            );
        }

        #[test]
        fn test_display_messages() {
            assert_eq!(
                SessionError::AuthenticationFailed.to_string(),
                "Authentication failed"
            );
            assert_eq!(
                SessionError::TransportUnreachable {
                    host: "localhost".into(),
                    port: 2222
                }
                .to_string(),
                "Port 2222 on localhost is not reachable"
            );
        }
    }

    #[test]
    fn test_tunnel_error_display() {
        assert_eq!(
            TunnelError::NoFreePort {
                start: 2222,
                end: 2250
            }
            .to_string(),
            "No free port in range 2222..2250"
        );
    }
}
