//! Error types for the reversed-role probe.
//!
//! Every phase of a probe (identity issuance, connect, handshake, field
//! extraction) reports failure through [`ProbeError`]. The variant tells the
//! caller which phase gave up; none of them are retried.

use std::io;

use serde::Serialize;
use strum_macros::{AsRefStr, Display};
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ProbeError>;

/// Error returned when a probe cannot produce the device certificate fields.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The throwaway local server identity could not be created
    #[error("failed to generate ephemeral identity: {reason}")]
    IdentityGeneration {
        /// What went wrong while generating or storing the key pair
        reason: String,
    },

    /// DNS resolution, TCP connect or connect timeout
    #[error("could not connect to {address}: {source}")]
    Connect {
        /// The address (host:port) that could not be reached
        address: String,
        /// The underlying I/O error
        #[source]
        source: io::Error,
    },

    /// The peer did not complete the TLS negotiation within the time budget
    #[error("TLS handshake with {address} timed out")]
    HandshakeTimeout {
        /// The peer address
        address: String,
    },

    /// The peer presented no certificate, or one that does not chain to the
    /// trust anchors
    #[error("peer certificate rejected: {reason}")]
    PeerValidation {
        /// Why validation failed
        reason: String,
    },

    /// The TLS negotiation failed for a reason unrelated to time or to the
    /// peer certificate (protocol mismatch, peer hung up, non-TLS service)
    #[error("TLS handshake failed: {details}")]
    HandshakeFailed {
        /// OpenSSL's description of the failure
        details: String,
    },

    /// Handshake succeeded but the certificate lacks an expected field
    #[error("no information from device: certificate {field} is missing or empty")]
    IncompleteCertificate {
        /// Name of the missing field
        field: &'static str,
    },

    /// Trust anchor data could not be parsed
    #[error("trust anchors unusable: {reason}")]
    TrustStore {
        /// Description of what went wrong
        reason: String,
    },

    /// Invalid input provided to the API
    #[error("invalid input for '{field}': {reason}")]
    InvalidInput {
        /// Which field/parameter was invalid
        field: &'static str,
        /// Why it was invalid
        reason: String,
    },
}

/// Discriminant of [`ProbeError`], for reporting the failure kind without the
/// payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
pub enum ErrorKind {
    IdentityGenerationError,
    ConnectError,
    HandshakeTimeoutError,
    PeerValidationError,
    HandshakeError,
    IncompleteCertificateError,
    TrustStoreError,
    InvalidInputError,
}

impl ProbeError {
    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IdentityGeneration { .. } => ErrorKind::IdentityGenerationError,
            Self::Connect { .. } => ErrorKind::ConnectError,
            Self::HandshakeTimeout { .. } => ErrorKind::HandshakeTimeoutError,
            Self::PeerValidation { .. } => ErrorKind::PeerValidationError,
            Self::HandshakeFailed { .. } => ErrorKind::HandshakeError,
            Self::IncompleteCertificate { .. } => ErrorKind::IncompleteCertificateError,
            Self::TrustStore { .. } => ErrorKind::TrustStoreError,
            Self::InvalidInput { .. } => ErrorKind::InvalidInputError,
        }
    }

    pub(crate) fn identity(e: impl std::fmt::Display) -> Self {
        Self::IdentityGeneration {
            reason: e.to_string(),
        }
    }

    pub(crate) fn trust(e: impl std::fmt::Display) -> Self {
        Self::TrustStore {
            reason: e.to_string(),
        }
    }
}
