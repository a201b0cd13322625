// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use sovereign_types::{
    protocol::{
        EvidenceData, EvidenceMetadata, VerificationErrorKind, VerificationFailure,
        VerifyEvidenceRequest, VerifyEvidenceResponse, VERIFY_EVIDENCE_PATH,
    },
    AttestedClaims, SovereignAttestation,
};
use std::{path::Path, time::Duration};

pub const SUBMISSION_SOURCE: &str = "issuance-gate";
pub const SUBMISSION_TYPE: &str = "issuance";

/// Remote evidence verification.
#[async_trait]
pub trait EvidenceVerifier: Send + Sync {
    /// Claims about the platform that produced `bundle`, or the reason it
    /// could not be verified.
    async fn verify(
        &self,
        bundle: &SovereignAttestation,
        audit_id: &str,
    ) -> std::result::Result<AttestedClaims, VerificationFailure>;
}

fn unavailable(message: String) -> VerificationFailure {
    VerificationFailure {
        kind: VerificationErrorKind::UpstreamUnavailable,
        message,
    }
}

/// Client of the verifier's `POST /v2.4/verify/evidence`. Calls are never
/// retried.
pub struct HttpVerifierClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpVerifierClient {
    pub fn new(base_url: &str, timeout: Duration, ca_path: Option<&Path>) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(path) = ca_path {
            let pem = std::fs::read(path)
                .with_context(|| format!("read verifier CA {}", path.display()))?;
            builder = builder.add_root_certificate(
                reqwest::Certificate::from_pem(&pem).context("parse verifier CA")?,
            );
        }

        Ok(Self {
            client: builder.build()?,
            endpoint: format!("{}{VERIFY_EVIDENCE_PATH}", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl EvidenceVerifier for HttpVerifierClient {
    async fn verify(
        &self,
        bundle: &SovereignAttestation,
        audit_id: &str,
    ) -> std::result::Result<AttestedClaims, VerificationFailure> {
        let request = VerifyEvidenceRequest {
            data: EvidenceData::from(bundle),
            metadata: EvidenceMetadata {
                source: SUBMISSION_SOURCE.to_string(),
                submission_type: SUBMISSION_TYPE.to_string(),
                audit_id: Some(audit_id.to_string()),
            },
        };

        let res = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| unavailable(format!("verifier unreachable: {e}")))?;

        let status = res.status();
        debug!("Verifier answered {status} for audit_id={audit_id}");
        if status.is_server_error() {
            return Err(unavailable(format!("verifier answered {status}")));
        }

        let response: VerifyEvidenceResponse = res
            .json()
            .await
            .map_err(|e| unavailable(format!("unreadable verifier response ({status}): {e}")))?;
        let results = response.results;

        match (results.verified, results.attested_claims, results.failure) {
            (true, Some(claims), _) if status.is_success() => Ok(claims),
            (_, _, Some(failure)) => Err(failure),
            _ => Err(unavailable(format!(
                "verifier answered {status} without claims or failure"
            ))),
        }
    }
}
