// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Delegated certification of App Keys.
//!
//! The certifier runs as a separate, privileged process and is the only
//! holder of the platform AK. The agent asks it over a Unix socket to run
//! `TPM2_Certify` on its App Key; the answer is an [`AppKeyCertificate`]
//! binding the App Key to the AK.
//!
//! [`AppKeyCertificate`]: sovereign_types::AppKeyCertificate

use attester::TpmError;
use sovereign_types::protocol::CertifyErrorKind;
use thiserror::Error;

pub mod client;
pub mod rate_limit;
pub mod server;

pub use client::CertificationClient;
pub use server::CertificationService;

/// Structured refusal of the certifier, sent back to the caller as is.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct CertifyError {
    pub kind: CertifyErrorKind,
    pub message: String,
}

impl CertifyError {
    pub fn new(kind: CertifyErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<TpmError> for CertifyError {
    fn from(e: TpmError) -> Self {
        let kind = match e {
            TpmError::KeyNotFound(_) => CertifyErrorKind::KeyNotFound,
            TpmError::TpmUnavailable(_) => CertifyErrorKind::TpmUnavailable,
            _ => CertifyErrorKind::CertifyFailed,
        };
        Self::new(kind, e.to_string())
    }
}
