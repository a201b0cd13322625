// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use hyper::{body::HttpBody, Body, Method, Request, Response, StatusCode};
use log::{info, warn};
use sovereign_types::{
    protocol::{
        VerificationDetails, VerificationErrorKind, VerificationFailure, VerificationResults,
        VerifyEvidenceRequest, VerifyEvidenceResponse,
    },
    EncodingError,
};
use std::net::SocketAddr;

use crate::{
    error::VerifyError,
    router::{json_response, ApiHandler},
    verify::EvidenceVerifier,
};

/// ROOT path of the verification API
pub const VERIFY_ROOT: &str = "/v2.4/verify";

const EVIDENCE_URL: &str = "/evidence";

/// Evidence bundles are a few KiB. Quotes alone are capped at 64 KiB.
const MAX_REQUEST_SIZE: u64 = 256 * 1024;

pub struct VerifyApi {
    verifier: EvidenceVerifier,
}

impl VerifyApi {
    pub fn new(verifier: EvidenceVerifier) -> Self {
        Self { verifier }
    }

    /// Run one verification and build its response. Claims are only ever
    /// attached to a successful verification.
    pub async fn verify_evidence(
        &self,
        request: VerifyEvidenceRequest,
    ) -> (StatusCode, VerifyEvidenceResponse) {
        let audit_id = request
            .metadata
            .audit_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut details = VerificationDetails {
            timestamp: Utc::now().timestamp(),
            ..Default::default()
        };

        let outcome = self.verifier.verify(&request.data, &mut details).await;
        let (status, attested_claims, failure) = match outcome {
            Ok(verified) => {
                info!(
                    "audit_id={audit_id} source={} verified=true platform={}",
                    request.metadata.source, verified.platform_id
                );
                (StatusCode::OK, Some(verified.claims), None)
            }
            Err(e) => {
                warn!(
                    "audit_id={audit_id} source={} verified=false kind={} reason={e}",
                    request.metadata.source,
                    e.kind()
                );
                let failure = VerificationFailure {
                    kind: e.kind(),
                    message: e.to_string(),
                };
                (e.status(), None, Some(failure))
            }
        };

        let response = VerifyEvidenceResponse {
            results: VerificationResults {
                verified: failure.is_none(),
                verification_details: details,
                attested_claims,
                failure,
                audit_id,
            },
        };
        (status, response)
    }
}

fn malformed_request(reason: String) -> VerifyEvidenceResponse {
    VerifyEvidenceResponse {
        results: VerificationResults {
            verified: false,
            verification_details: VerificationDetails {
                timestamp: Utc::now().timestamp(),
                ..Default::default()
            },
            attested_claims: None,
            failure: Some(VerificationFailure {
                kind: VerificationErrorKind::MalformedEvidence,
                message: reason,
            }),
            audit_id: uuid::Uuid::new_v4().to_string(),
        },
    }
}

#[async_trait]
impl ApiHandler for VerifyApi {
    async fn handle_request(
        &self,
        remote_addr: SocketAddr,
        url_path: &str,
        req: Request<Body>,
    ) -> Result<Response<Body>> {
        if url_path != EVIDENCE_URL {
            return self.not_found();
        }
        if req.method() != Method::POST {
            return self.not_allowed();
        }
        if req.body().size_hint().lower() > MAX_REQUEST_SIZE {
            return self.payload_too_large();
        }

        let body = hyper::body::to_bytes(req.into_body()).await?;
        if body.len() as u64 > MAX_REQUEST_SIZE {
            return self.payload_too_large();
        }

        let request: VerifyEvidenceRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(source) => {
                warn!("Unparseable verification request from {remote_addr}: {source}");
                let e = VerifyError::Malformed(EncodingError::Json {
                    field: "request",
                    source,
                });
                return json_response(e.status(), &malformed_request(e.to_string()));
            }
        };

        let (status, response) = self.verify_evidence(request).await;
        json_response(status, &response)
    }
}
