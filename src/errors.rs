//! Crate-wide error hierarchy.
//!
//! Per-concern errors are defined alongside their modules; this module
//! composes them into the single top-level error a connection task
//! needs to decide whether a failure is fatal (close the session) or
//! a warning (log and continue).

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::deploy::DeployError;
use crate::device::ProtocolError;
use crate::session::HandshakeError;

/// Top-level error for a single device connection.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("auth failure: {0}")]
    Auth(#[from] HandshakeError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("deploy error: {0}")]
    Deploy(#[from] DeployError),

    #[error("collaborator error: {0}")]
    Collaborator(String),
}

impl From<CryptoError> for GatewayError {
    fn from(e: CryptoError) -> Self {
        GatewayError::Auth(HandshakeError::Crypto(e))
    }
}

impl GatewayError {
    /// Whether this error must end the session: transport/auth errors
    /// are fatal; protocol/deploy/collaborator errors are warnings.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GatewayError::Transport(_) | GatewayError::Auth(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_auth_errors_are_fatal() {
        assert!(GatewayError::Transport("closed".into()).is_fatal());
        assert!(GatewayError::Auth(HandshakeError::BadAuth).is_fatal());
    }

    #[test]
    fn protocol_deploy_and_collaborator_errors_are_not_fatal() {
        assert!(!GatewayError::Protocol(ProtocolError::FrameTooShort).is_fatal());
        assert!(!GatewayError::Deploy(DeployError::Backoff).is_fatal());
        assert!(!GatewayError::Collaborator("storage unavailable".into()).is_fatal());
    }
}
