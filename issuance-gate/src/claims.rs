// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Unified identity claims document, embedded by the identity issuer as a
//! certificate extension.

use serde::Serialize;
use sovereign_types::{AttestedClaims, HostIntegrityStatus, SovereignAttestation};

pub const KEY_SOURCE_TPM_APP: &str = "tpm-app-key";

#[derive(Serialize, Debug, PartialEq)]
pub struct ClaimsDocument<'a> {
    #[serde(rename = "grc.workload")]
    pub workload: Workload<'a>,

    #[serde(rename = "grc.tpm-attestation")]
    pub tpm_attestation: TpmAttestation<'a>,

    #[serde(rename = "grc.geolocation", skip_serializing_if = "Option::is_none")]
    pub geolocation: Option<Geolocation<'a>>,
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Workload<'a> {
    pub workload_id: &'a str,
    pub key_source: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workload_code_hash: Option<&'a str>,
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct TpmAttestation<'a> {
    pub app_key_public: &'a str,
    pub app_key_certificate: &'a str,
    pub quote: &'a str,
    pub challenge_nonce: &'a str,
    pub verified_claims: VerifiedClaims<'a>,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct VerifiedClaims<'a> {
    #[serde(skip_serializing_if = "str::is_empty")]
    pub geolocation: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_integrity_status: Option<String>,
    pub gpu_metrics_health: GpuMetricsHealth<'a>,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct GpuMetricsHealth<'a> {
    pub status: &'a str,
    pub utilization_pct: f64,
    pub memory_mb: u64,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct Geolocation<'a> {
    pub raw: &'a str,
}

impl<'a> ClaimsDocument<'a> {
    pub fn new(
        workload_id: &'a str,
        bundle: &'a SovereignAttestation,
        claims: &'a AttestedClaims,
    ) -> Self {
        let gpu = &claims.gpu_metrics;
        Self {
            workload: Workload {
                workload_id,
                key_source: KEY_SOURCE_TPM_APP,
                workload_code_hash: bundle
                    .workload_code_hash
                    .as_deref()
                    .filter(|hash| !hash.is_empty()),
            },
            tpm_attestation: TpmAttestation {
                app_key_public: &bundle.app_key_public,
                app_key_certificate: &bundle.app_key_certificate,
                quote: &bundle.quote,
                challenge_nonce: &bundle.nonce,
                verified_claims: VerifiedClaims {
                    geolocation: &claims.geolocation,
                    host_integrity_status: (claims.host_integrity_status
                        != HostIntegrityStatus::Unspecified)
                        .then(|| claims.host_integrity_status.to_string()),
                    gpu_metrics_health: GpuMetricsHealth {
                        status: &gpu.status,
                        utilization_pct: gpu.utilization_pct,
                        memory_mb: gpu.memory_mb,
                    },
                },
            },
            geolocation: (!claims.geolocation.is_empty()).then_some(Geolocation {
                raw: &claims.geolocation,
            }),
        }
    }

    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
