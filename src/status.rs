//! Validation status taxonomy and the crate error type.
//!
//! The first two bands of [`Status`] mirror the Yubico Validation Protocol
//! V2.0 wire statuses; the trailing codes extend it for self-hosted
//! validation. A server can serialize a status by name and a client can
//! parse it back symmetrically.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of an OTP validation, shared by the offline validator and the
/// Yubico cloud client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    UnknownStatus,
    /// The OTP is valid.
    Ok,
    /// The OTP has invalid format.
    BadOtp,
    /// The OTP has already been seen by the service.
    ReplayedOtp,
    /// HMAC signature verification failed.
    BadSignature,
    /// The request lacks a parameter.
    MissingParameter,
    /// The request id does not exist.
    NoSuchClient,
    /// The request id is not allowed to verify OTPs.
    OperationNotAllowed,
    /// Unexpected error in the backing service or store.
    BackendError,
    /// The server could not get the requested number of syncs before timeout.
    NotEnoughAnswers,
    /// The server has seen the OTP/nonce combination before.
    ReplayedRequest,
    /// The decrypted plaintext failed the CRC residue check.
    CrcFailure,
    /// The provided OTP is empty.
    EmptyYubiToken,
    /// The yubikey is not registered, or its record is disabled.
    UnregisteredUser,
}

impl Status {
    /// The upper-snake wire name, as carried in a `status=` response line.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::UnknownStatus => "UNKNOWN_STATUS",
            Status::Ok => "OK",
            Status::BadOtp => "BAD_OTP",
            Status::ReplayedOtp => "REPLAYED_OTP",
            Status::BadSignature => "BAD_SIGNATURE",
            Status::MissingParameter => "MISSING_PARAMETER",
            Status::NoSuchClient => "NO_SUCH_CLIENT",
            Status::OperationNotAllowed => "OPERATION_NOT_ALLOWED",
            Status::BackendError => "BACKEND_ERROR",
            Status::NotEnoughAnswers => "NOT_ENOUGH_ANSWERS",
            Status::ReplayedRequest => "REPLAYED_REQUEST",
            Status::CrcFailure => "CRC_FAILURE",
            Status::EmptyYubiToken => "EMPTY_YUBI_TOKEN",
            Status::UnregisteredUser => "UNREGISTERED_USER",
        }
    }

    /// Parse a wire name. Unrecognized names map to `UnknownStatus`.
    pub fn from_wire(s: &str) -> Status {
        match s {
            "OK" => Status::Ok,
            "BAD_OTP" => Status::BadOtp,
            "REPLAYED_OTP" => Status::ReplayedOtp,
            "BAD_SIGNATURE" => Status::BadSignature,
            "MISSING_PARAMETER" => Status::MissingParameter,
            "NO_SUCH_CLIENT" => Status::NoSuchClient,
            "OPERATION_NOT_ALLOWED" => Status::OperationNotAllowed,
            "BACKEND_ERROR" => Status::BackendError,
            "NOT_ENOUGH_ANSWERS" => Status::NotEnoughAnswers,
            "REPLAYED_REQUEST" => Status::ReplayedRequest,
            "CRC_FAILURE" => Status::CrcFailure,
            "EMPTY_YUBI_TOKEN" => Status::EmptyYubiToken,
            "UNREGISTERED_USER" => Status::UnregisteredUser,
            _ => Status::UnknownStatus,
        }
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            Status::BackendError
                | Status::BadOtp
                | Status::BadSignature
                | Status::NoSuchClient
                | Status::MissingParameter
        )
    }

    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Status::BadOtp | Status::NoSuchClient | Status::MissingParameter
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for Status {}

/// A validation failure: a tagged [`Status`] plus an optional cause chain.
///
/// No other error type crosses the crate boundary; transport and store
/// failures arrive here as `BackendError` with the underlying cause attached.
#[derive(Debug)]
pub struct AuthError {
    status: Status,
    source: Option<anyhow::Error>,
}

impl AuthError {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            source: None,
        }
    }

    pub fn with_source(status: Status, source: impl Into<anyhow::Error>) -> Self {
        Self {
            status,
            source: Some(source.into()),
        }
    }

    /// Shorthand for a `BackendError` wrapping the underlying cause.
    pub fn backend(source: impl Into<anyhow::Error>) -> Self {
        Self::with_source(Status::BackendError, source)
    }

    pub fn status(&self) -> Status {
        self.status
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {source}", self.status),
            None => fmt::Display::fmt(&self.status, f),
        }
    }
}

impl std::error::Error for AuthError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| {
            let e: &(dyn std::error::Error + 'static) = e.as_ref();
            e
        })
    }
}

impl From<Status> for AuthError {
    fn from(status: Status) -> Self {
        AuthError::new(status)
    }
}

pub type Result<T, E = AuthError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_round_trip() {
        let all = [
            Status::UnknownStatus,
            Status::Ok,
            Status::BadOtp,
            Status::ReplayedOtp,
            Status::BadSignature,
            Status::MissingParameter,
            Status::NoSuchClient,
            Status::OperationNotAllowed,
            Status::BackendError,
            Status::NotEnoughAnswers,
            Status::ReplayedRequest,
            Status::CrcFailure,
            Status::EmptyYubiToken,
            Status::UnregisteredUser,
        ];
        for status in all {
            assert_eq!(Status::from_wire(status.as_str()), status);
        }
    }

    #[test]
    fn unknown_wire_name_parses_lossy() {
        assert_eq!(Status::from_wire("NO_SUCH_STATUS"), Status::UnknownStatus);
        assert_eq!(Status::from_wire(""), Status::UnknownStatus);
    }

    #[test]
    fn error_classification() {
        assert!(Status::BackendError.is_error());
        assert!(Status::BadSignature.is_error());
        assert!(!Status::ReplayedOtp.is_error());
        assert!(!Status::Ok.is_error());

        assert!(Status::BadOtp.is_retryable());
        assert!(Status::MissingParameter.is_retryable());
        assert!(!Status::ReplayedOtp.is_retryable());
        assert!(!Status::BackendError.is_retryable());
    }

    #[test]
    fn auth_error_carries_cause() {
        let err = AuthError::backend(anyhow::anyhow!("connection refused"));
        assert_eq!(err.status(), Status::BackendError);
        assert!(err.to_string().contains("BACKEND_ERROR"));
        assert!(err.to_string().contains("connection refused"));
        assert!(std::error::Error::source(&err).is_some());

        let bare = AuthError::from(Status::ReplayedOtp);
        assert_eq!(bare.to_string(), "REPLAYED_OTP");
        assert!(std::error::Error::source(&bare).is_none());
    }

    #[test]
    fn status_serializes_as_wire_name() {
        let json = serde_json::to_string(&Status::NoSuchClient).unwrap();
        assert_eq!(json, "\"NO_SUCH_CLIENT\"");
        let back: Status = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Status::NoSuchClient);
    }
}
