// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Request and response bodies of the delegated certification and evidence
//! verification endpoints.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

use crate::{claims::AttestedClaims, evidence::SovereignAttestation};

pub const CERTIFY_APP_KEY_PATH: &str = "/v2.2/delegated_certification/certify_app_key";
pub const CERTIFY_API_VERSION: &str = "v1";
pub const CERTIFY_APP_KEY_COMMAND: &str = "certify_app_key";

pub const VERIFY_EVIDENCE_PATH: &str = "/v2.4/verify/evidence";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CertifyAppKeyRequest {
    pub api_version: String,
    pub command: String,
    pub app_key_public: String,
    /// Persistent handle of the App Key, e.g. `0x8101000B`.
    pub app_key_context_path: String,
}

impl CertifyAppKeyRequest {
    pub fn new(app_key_public: String, app_key_context_path: String) -> Self {
        Self {
            api_version: CERTIFY_API_VERSION.to_string(),
            command: CERTIFY_APP_KEY_COMMAND.to_string(),
            app_key_public,
            app_key_context_path,
        }
    }
}

#[derive(Serialize, Deserialize, Display, AsRefStr, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CertifyErrorKind {
    BadRequest,
    KeyNotFound,
    CertifyFailed,
    Unauthorized,
    Unsupported,
    TpmUnavailable,
    RateLimited,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertifyAppKeyResponse {
    Success {
        app_key_certificate: String,
    },
    Error {
        error: String,
        error_kind: CertifyErrorKind,
    },
}

/// Evidence fields of a verification request, all in their text encodings.
///
/// Required fields default to empty so that a missing field and an empty one
/// are reported the same way by the verifier.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct EvidenceData {
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub quote: String,
    #[serde(default)]
    pub hash_alg: String,
    #[serde(default)]
    pub app_key_public: String,
    #[serde(default)]
    pub app_key_certificate: String,
    /// Hint naming the AK the certificate claims to be signed with. Only used
    /// to narrow the registry lookup, never as a verification key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm_ak: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm_ek: Option<String>,
}

impl From<&SovereignAttestation> for EvidenceData {
    fn from(bundle: &SovereignAttestation) -> Self {
        Self {
            nonce: bundle.nonce.clone(),
            quote: bundle.quote.clone(),
            hash_alg: "sha256".to_string(),
            app_key_public: bundle.app_key_public.clone(),
            app_key_certificate: bundle.app_key_certificate.clone(),
            tpm_ak: None,
            tpm_ek: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct EvidenceMetadata {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub submission_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct VerifyEvidenceRequest {
    pub data: EvidenceData,
    #[serde(default)]
    pub metadata: EvidenceMetadata,
}

/// Verification failure kinds, surfaced by the issuance gate as REJECTED.
#[derive(Serialize, Deserialize, Display, AsRefStr, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerificationErrorKind {
    MalformedEvidence,
    MissingEvidence,
    InvalidNonce,
    SignatureMismatch,
    CertificateChainInvalid,
    UpstreamUnavailable,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct VerificationDetails {
    pub app_key_certificate_valid: bool,
    pub app_key_public_matches_cert: bool,
    pub quote_signature_valid: bool,
    pub nonce_valid: bool,
    /// Unix time of the verification, in seconds.
    pub timestamp: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct VerificationFailure {
    pub kind: VerificationErrorKind,
    pub message: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct VerificationResults {
    pub verified: bool,
    pub verification_details: VerificationDetails,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attested_claims: Option<AttestedClaims>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<VerificationFailure>,
    pub audit_id: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct VerifyEvidenceResponse {
    pub results: VerificationResults,
}
