// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Result of the host integrity evaluation performed by the verifier.
///
/// Serialized in snake case on the wire (`passed_all_checks`); the upper case
/// form is accepted too and used for display.
#[derive(
    EnumString, AsRefStr, Display, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum HostIntegrityStatus {
    #[default]
    #[serde(alias = "UNSPECIFIED", alias = "HOST_INTEGRITY_UNSPECIFIED")]
    Unspecified,

    #[serde(alias = "PASSED_ALL_CHECKS")]
    PassedAllChecks,

    #[serde(alias = "FAILED")]
    Failed,

    #[serde(alias = "PARTIAL")]
    Partial,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct GpuMetrics {
    /// Free-form health status reported by the fact source, e.g. `healthy`.
    pub status: String,

    /// Utilization in percent, `0.0..=100.0`.
    pub utilization_pct: f64,

    pub memory_mb: u64,
}

impl GpuMetrics {
    pub fn is_healthy(&self) -> bool {
        self.status.eq_ignore_ascii_case("healthy")
    }
}

/// Facts about an attested platform, resolved by the verifier from its own
/// trusted sources. Never built from claimant input.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct AttestedClaims {
    pub geolocation: String,
    pub host_integrity_status: HostIntegrityStatus,
    pub gpu_metrics: GpuMetrics,
}

impl AttestedClaims {
    /// Clamp values reported by a fact source into their documented ranges.
    pub fn normalized(mut self) -> Self {
        let pct = self.gpu_metrics.utilization_pct;
        self.gpu_metrics.utilization_pct = if pct.is_nan() {
            100.0
        } else {
            pct.clamp(0.0, 100.0)
        };
        self
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("\"passed_all_checks\"", HostIntegrityStatus::PassedAllChecks)]
    #[case("\"PASSED_ALL_CHECKS\"", HostIntegrityStatus::PassedAllChecks)]
    #[case("\"failed\"", HostIntegrityStatus::Failed)]
    #[case("\"PARTIAL\"", HostIntegrityStatus::Partial)]
    #[case("\"HOST_INTEGRITY_UNSPECIFIED\"", HostIntegrityStatus::Unspecified)]
    fn test_host_integrity_wire_forms(#[case] raw: &str, #[case] expected: HostIntegrityStatus) {
        let parsed: HostIntegrityStatus = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_host_integrity_display() {
        assert_eq!(
            HostIntegrityStatus::PassedAllChecks.to_string(),
            "PASSED_ALL_CHECKS"
        );
        assert_eq!(
            "failed".parse::<HostIntegrityStatus>().unwrap(),
            HostIntegrityStatus::Failed
        );
    }

    #[test]
    fn test_claims_json_shape() {
        let claims = AttestedClaims {
            geolocation: "Spain: N40.4168, W3.7038".into(),
            host_integrity_status: HostIntegrityStatus::PassedAllChecks,
            gpu_metrics: GpuMetrics {
                status: "healthy".into(),
                utilization_pct: 15.0,
                memory_mb: 10240,
            },
        };
        let value = serde_json::to_value(&claims).unwrap();
        assert_eq!(value["host_integrity_status"], "passed_all_checks");
        assert_eq!(value["gpu_metrics"]["memory_mb"], 10240);
        assert!(claims.gpu_metrics.is_healthy());
    }

    #[test]
    fn test_normalized_clamps_utilization() {
        let mut claims = AttestedClaims::default();
        claims.gpu_metrics.utilization_pct = 140.0;
        assert_eq!(claims.normalized().gpu_metrics.utilization_pct, 100.0);
    }
}
