// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use sovereign_types::protocol::{VerificationErrorKind, VerificationFailure};
use thiserror::Error;

use crate::gate::GateState;

/// Why an identity was not issued. A rejected attestation and a policy
/// denial are always reported as different errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IssuanceError {
    /// The evidence could not be verified.
    #[error("attestation rejected ({}): {}", .0.kind, .0.message)]
    Rejected(VerificationFailure),

    /// The evidence was valid but did not satisfy the policy.
    #[error("issuance denied by policy: {}", .0.join("; "))]
    Denied(Vec<String>),

    #[error("identity issuer failed: {0}")]
    Issuer(String),
}

impl IssuanceError {
    pub fn rejected(kind: VerificationErrorKind, message: impl Into<String>) -> Self {
        IssuanceError::Rejected(VerificationFailure {
            kind,
            message: message.into(),
        })
    }

    /// Terminal gate state of this outcome.
    pub fn state(&self) -> Option<GateState> {
        match self {
            IssuanceError::Rejected(_) => Some(GateState::Rejected),
            IssuanceError::Denied(_) => Some(GateState::Denied),
            IssuanceError::Issuer(_) => None,
        }
    }
}
