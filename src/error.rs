//! Error types for the bus access-control layer.
//!
//! Remote endpoints (the access-control service and bus servers) report
//! failures as one of a small, fixed set of [`RejectCode`]s. Each code maps
//! to exactly one [`BusError`] variant so callers can match on kinds without
//! caring whether the failure was produced locally or on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Wire-level rejection codes shared by every bus endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectCode {
    AccessDenied,
    MissingCertificate,
    NoLogin,
    UnknownBus,
    UnverifiedLogin,
    InvalidRemote,
    InvalidCredential,
    InvalidChain,
    InvalidPublicKey,
    NoCredential,
    UnavailableBus,
    InvalidTarget,
    InvalidLogin,
}

impl RejectCode {
    /// Numeric minor code carried next to the rejection ("BUS" prefix).
    pub const fn minor(self) -> u32 {
        const BASE: u32 = 0x4255_5300;
        BASE | match self {
            Self::AccessDenied => 0x01,
            Self::MissingCertificate => 0x02,
            Self::NoLogin => 0x03,
            Self::UnknownBus => 0x04,
            Self::UnverifiedLogin => 0x05,
            Self::InvalidRemote => 0x06,
            Self::InvalidCredential => 0x07,
            Self::InvalidChain => 0x08,
            Self::InvalidPublicKey => 0x09,
            Self::NoCredential => 0x0A,
            Self::UnavailableBus => 0x0B,
            Self::InvalidTarget => 0x0C,
            Self::InvalidLogin => 0x0D,
        }
    }
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:08x})", self, self.minor())
    }
}

/// Errors produced by the bus access-control layer.
#[derive(Debug, Error)]
pub enum BusError {
    /// Authentication refused (bad password, bad challenge answer, ...).
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Certificate login attempted for an entity with no registered key.
    #[error("no certificate registered for entity '{0}'")]
    MissingCertificate(String),

    /// The connection (or the caller) is not logged in.
    #[error("not logged in")]
    NoLogin,

    /// No connection is logged into the bus named by a request.
    #[error("unknown bus '{0}'")]
    UnknownBus(String),

    /// The access-control service could not verify the login.
    #[error("unverified login '{0}'")]
    UnverifiedLogin(String),

    /// The remote endpoint misbehaved (malformed reply, unexpected reset).
    #[error("invalid remote: {0}")]
    InvalidRemote(String),

    /// Credential did not validate (unknown session, replayed ticket, bad MAC).
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// Call chain failed verification or is not addressed to this login.
    #[error("invalid call chain: {0}")]
    InvalidChain(String),

    /// A public key could not be decoded.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// An authenticated operation arrived without credential context.
    #[error("request carries no credential")]
    NoCredential,

    /// The bus could not be reached.
    #[error("bus unavailable: {0}")]
    UnavailableBus(String),

    /// The requested chain target is not a known login.
    #[error("invalid target '{0}'")]
    InvalidTarget(String),

    /// The login is no longer valid (expired lease, logged out).
    #[error("invalid login '{0}'")]
    InvalidLogin(String),

    /// A login was attempted on a connection that is already logged in
    /// (or has a login in progress).
    #[error("connection already logged in")]
    AlreadyLoggedIn,

    /// Shared authentication secret unknown, expired or already redeemed.
    #[error("invalid shared authentication secret: {0}")]
    InvalidSharedAuth(String),

    /// Sealing, key agreement or signature failure.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Wire encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Transport-level failure unrelated to credentials.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote handler ran and failed.
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
}

impl BusError {
    /// The wire code for this error, if it is one the endpoints report.
    pub fn code(&self) -> Option<RejectCode> {
        Some(match self {
            Self::AccessDenied(_) => RejectCode::AccessDenied,
            Self::MissingCertificate(_) => RejectCode::MissingCertificate,
            Self::NoLogin => RejectCode::NoLogin,
            Self::UnknownBus(_) => RejectCode::UnknownBus,
            Self::UnverifiedLogin(_) => RejectCode::UnverifiedLogin,
            Self::InvalidRemote(_) => RejectCode::InvalidRemote,
            Self::InvalidCredential(_) => RejectCode::InvalidCredential,
            Self::InvalidChain(_) => RejectCode::InvalidChain,
            Self::InvalidPublicKey(_) => RejectCode::InvalidPublicKey,
            Self::NoCredential => RejectCode::NoCredential,
            Self::UnavailableBus(_) => RejectCode::UnavailableBus,
            Self::InvalidTarget(_) => RejectCode::InvalidTarget,
            Self::InvalidLogin(_) => RejectCode::InvalidLogin,
            _ => return None,
        })
    }

    /// Rebuild the local error kind for a code received from a remote endpoint.
    pub fn from_code(code: RejectCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            RejectCode::AccessDenied => Self::AccessDenied(message),
            RejectCode::MissingCertificate => Self::MissingCertificate(message),
            RejectCode::NoLogin => Self::NoLogin,
            RejectCode::UnknownBus => Self::UnknownBus(message),
            RejectCode::UnverifiedLogin => Self::UnverifiedLogin(message),
            RejectCode::InvalidRemote => Self::InvalidRemote(message),
            RejectCode::InvalidCredential => Self::InvalidCredential(message),
            RejectCode::InvalidChain => Self::InvalidChain(message),
            RejectCode::InvalidPublicKey => Self::InvalidPublicKey(message),
            RejectCode::NoCredential => Self::NoCredential,
            RejectCode::UnavailableBus => Self::UnavailableBus(message),
            RejectCode::InvalidTarget => Self::InvalidTarget(message),
            RejectCode::InvalidLogin => Self::InvalidLogin(message),
        }
    }

    /// Whether this failure means the login itself is gone.
    ///
    /// The lease renewer and the client stub treat these as terminal for the
    /// connection; everything else is per-call.
    pub fn is_login_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidLogin(_) | Self::NoLogin | Self::AccessDenied(_) | Self::InvalidCredential(_)
        )
    }

    /// Whether this failure is a reachability problem worth retrying later.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::UnavailableBus(_) | Self::Transport(_))
    }
}

/// Result type alias for bus operations.
pub type BusResult<T> = std::result::Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_CODES: [RejectCode; 13] = [
        RejectCode::AccessDenied,
        RejectCode::MissingCertificate,
        RejectCode::NoLogin,
        RejectCode::UnknownBus,
        RejectCode::UnverifiedLogin,
        RejectCode::InvalidRemote,
        RejectCode::InvalidCredential,
        RejectCode::InvalidChain,
        RejectCode::InvalidPublicKey,
        RejectCode::NoCredential,
        RejectCode::UnavailableBus,
        RejectCode::InvalidTarget,
        RejectCode::InvalidLogin,
    ];

    #[test]
    fn test_codes_map_one_to_one() {
        for code in ALL_CODES {
            let err = BusError::from_code(code, "x");
            assert_eq!(err.code(), Some(code), "{code} did not survive the mapping");
        }
    }

    #[test]
    fn test_minor_codes_are_distinct() {
        let mut minors: Vec<u32> = ALL_CODES.iter().map(|c| c.minor()).collect();
        minors.sort_unstable();
        minors.dedup();
        assert_eq!(minors.len(), ALL_CODES.len());
    }

    #[test]
    fn test_local_errors_have_no_code() {
        assert_eq!(BusError::AlreadyLoggedIn.code(), None);
        assert_eq!(BusError::Crypto("x".into()).code(), None);
    }
}
