// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use attester::TpmError;
use sovereign_types::{
    evidence::{MAX_NONCE_LEN, MIN_NONCE_LEN},
    protocol::CertifyErrorKind,
    EncodingError,
};
use thiserror::Error;

/// Why an evidence bundle could not be built. No bundle is returned alongside
/// any of these.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Tpm(#[from] TpmError),

    #[error("nonce must be between {MIN_NONCE_LEN} and {MAX_NONCE_LEN} bytes, got {0}")]
    InvalidNonce(usize),

    /// The certifier answered with a structured error.
    #[error("delegated certification rejected ({kind}): {message}")]
    Certification {
        kind: CertifyErrorKind,
        message: String,
    },

    #[error("delegated certifier unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

impl AgentError {
    /// Certifier error kind, when the certifier produced one.
    pub fn certify_error_kind(&self) -> Option<CertifyErrorKind> {
        match self {
            AgentError::Certification { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
