// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Attestation and policy gate of the identity issuance server.
//!
//! The issuance server hands each request to [`IssuanceService`]. Requests
//! may carry a [`SovereignAttestation`] bundle; responses carry the verified
//! claims that were embedded into the issued identity. Both fields are
//! optional so legacy callers are unaffected.

use anyhow::Result;
use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use sovereign_types::{AttestedClaims, SovereignAttestation};

pub mod challenge;
pub mod claims;
pub mod config;
pub mod error;
pub mod gate;
pub mod policy;
pub mod verifier_client;

pub use error::IssuanceError;
pub use gate::{Admission, GateState, IssuanceGate};

use claims::ClaimsDocument;
use config::IssuanceConfig;
use verifier_client::HttpVerifierClient;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct IssuanceRequest {
    /// Identity to issue, e.g. a SPIFFE ID.
    pub workload_id: String,

    /// SubjectPublicKeyInfo PEM of the key to certify.
    pub public_key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sovereign_attestation: Option<SovereignAttestation>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct IssuanceResponse {
    /// Issued identity document, e.g. a PEM certificate.
    pub identity: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attested_claims: Option<AttestedClaims>,
}

/// Signer of identity documents.
#[async_trait]
pub trait IdentityIssuer: Send + Sync {
    /// Issue an identity for `workload_id` over `public_key`. `claims` is the
    /// unified identity claims document to embed, if any.
    async fn issue(
        &self,
        workload_id: &str,
        public_key: &str,
        claims: Option<Vec<u8>>,
    ) -> Result<String>;
}

pub struct IssuanceService {
    gate: IssuanceGate,
    issuer: Box<dyn IdentityIssuer>,
}

impl IssuanceService {
    pub fn new(gate: IssuanceGate, issuer: Box<dyn IdentityIssuer>) -> Self {
        Self { gate, issuer }
    }

    /// Gate backed by the verifier named in `config`. No verifier client is
    /// set up while Unified-Identity is disabled.
    pub fn from_config(config: &IssuanceConfig, issuer: Box<dyn IdentityIssuer>) -> Result<Self> {
        if !config.feature_flags.unified_identity() {
            return Ok(Self::new(IssuanceGate::legacy(config), issuer));
        }

        let verifier = HttpVerifierClient::new(
            &config.verifier_url,
            config.timeout(),
            config.verifier_ca_path.as_deref(),
        )?;
        info!(
            "Unified-Identity enabled, verifying evidence at {}",
            config.verifier_url
        );
        Ok(Self::new(IssuanceGate::new(config, Box::new(verifier)), issuer))
    }

    pub fn gate(&self) -> &IssuanceGate {
        &self.gate
    }

    /// Challenge a workload must quote over before requesting an identity.
    pub fn challenge(&self) -> String {
        self.gate.mint_challenge()
    }

    pub async fn issue(&self, request: &IssuanceRequest) -> Result<IssuanceResponse, IssuanceError> {
        let bundle = request.sovereign_attestation.as_ref();
        let audit_id = if self.gate.unified_identity() {
            uuid::Uuid::new_v4().to_string()
        } else {
            String::new()
        };
        let admission = self.gate.admit(bundle, &audit_id).await?;

        let document = match (bundle, &admission.claims) {
            (Some(bundle), Some(claims)) => Some(
                ClaimsDocument::new(&request.workload_id, bundle, claims)
                    .to_vec()
                    .map_err(|e| IssuanceError::Issuer(e.to_string()))?,
            ),
            _ => None,
        };

        let identity = self
            .issuer
            .issue(&request.workload_id, &request.public_key, document)
            .await
            .map_err(|e| IssuanceError::Issuer(format!("{e:#}")))?;

        Ok(IssuanceResponse {
            identity,
            attested_claims: admission.claims,
        })
    }
}
