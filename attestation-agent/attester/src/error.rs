// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use thiserror::Error;

/// Errors of the TPM evidence generation side. Every one of them is fatal to
/// the attestation attempt that hit it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TpmError {
    #[error("TPM unavailable: {0}")]
    TpmUnavailable(String),

    #[error("App Key creation failed: {0}")]
    KeyCreationFailed(String),

    #[error("quote failed: {0}")]
    QuoteFailed(String),

    #[error("certify failed: {0}")]
    CertifyFailed(String),

    #[error("invalid PCR selection: {0}")]
    InvalidSelection(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),
}

pub type Result<T> = std::result::Result<T, TpmError>;
