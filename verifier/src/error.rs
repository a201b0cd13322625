// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use hyper::StatusCode;
use sovereign_types::{protocol::VerificationErrorKind, EncodingError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("malformed evidence: {0}")]
    Malformed(#[from] EncodingError),

    #[error("unsupported hash algorithm {0:?}")]
    UnsupportedHashAlgorithm(String),

    #[error("certificate chain invalid: {0}")]
    CertificateChainInvalid(String),

    #[error("quote signature mismatch: {0}")]
    SignatureMismatch(String),

    #[error("invalid nonce: {0}")]
    InvalidNonce(String),

    #[error("fact source unavailable: {0}")]
    UpstreamUnavailable(String),
}

impl VerifyError {
    pub fn kind(&self) -> VerificationErrorKind {
        match self {
            VerifyError::Malformed(EncodingError::Missing(_)) => {
                VerificationErrorKind::MissingEvidence
            }
            VerifyError::Malformed(_) | VerifyError::UnsupportedHashAlgorithm(_) => {
                VerificationErrorKind::MalformedEvidence
            }
            VerifyError::CertificateChainInvalid(_) => {
                VerificationErrorKind::CertificateChainInvalid
            }
            VerifyError::SignatureMismatch(_) => VerificationErrorKind::SignatureMismatch,
            VerifyError::InvalidNonce(_) => VerificationErrorKind::InvalidNonce,
            VerifyError::UpstreamUnavailable(_) => VerificationErrorKind::UpstreamUnavailable,
        }
    }

    /// 400 before any cryptographic work, 403 for failed verification, 503
    /// when facts cannot be resolved.
    pub fn status(&self) -> StatusCode {
        match self {
            VerifyError::Malformed(_) | VerifyError::UnsupportedHashAlgorithm(_) => {
                StatusCode::BAD_REQUEST
            }
            VerifyError::CertificateChainInvalid(_)
            | VerifyError::SignatureMismatch(_)
            | VerifyError::InvalidNonce(_) => StatusCode::FORBIDDEN,
            VerifyError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}
