// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Policy evaluation of attested claims.
//!
//! [`evaluate`] is pure: no I/O, no logging, and the same inputs always give
//! the same result with the same reason order. Every check runs, so a result
//! lists every violation rather than the first one.

use serde::{Deserialize, Serialize};
use sovereign_types::{AttestedClaims, HostIntegrityStatus};

pub const HOST_INTEGRITY_FAILED: &str = "host integrity check failed";
pub const NO_CLAIMS: &str = "no attested claims available";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PolicyConfig {
    /// Exact geolocations, or prefixes ending in `*`. Empty allows any.
    #[serde(default)]
    pub allowed_geolocation_patterns: Vec<String>,

    #[serde(default = "default_true")]
    pub require_host_integrity: bool,

    #[serde(default = "default_max_gpu_utilization_pct")]
    pub max_gpu_utilization_pct: f64,

    #[serde(default)]
    pub min_gpu_memory_mb: u64,

    #[serde(default)]
    pub require_healthy_gpu: bool,
}

fn default_true() -> bool {
    true
}

fn default_max_gpu_utilization_pct() -> f64 {
    100.0
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_geolocation_patterns: Vec::new(),
            require_host_integrity: default_true(),
            max_gpu_utilization_pct: default_max_gpu_utilization_pct(),
            min_gpu_memory_mb: 0,
            require_healthy_gpu: false,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PolicyResult {
    pub passed: bool,
    pub reasons: Vec<String>,
}

impl PolicyResult {
    fn from_reasons(reasons: Vec<String>) -> Self {
        Self {
            passed: reasons.is_empty(),
            reasons,
        }
    }
}

/// `Spain:*` and `Spain: *` both match `Spain: N40.4168, W3.7038`.
pub fn matches_geolocation(geolocation: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => geolocation.starts_with(prefix.trim_end()),
        None => geolocation == pattern,
    }
}

pub fn evaluate(claims: Option<&AttestedClaims>, config: &PolicyConfig) -> PolicyResult {
    let Some(claims) = claims else {
        return PolicyResult::from_reasons(vec![NO_CLAIMS.to_string()]);
    };
    let gpu = &claims.gpu_metrics;
    let mut reasons = Vec::new();

    if !config.allowed_geolocation_patterns.is_empty()
        && !config
            .allowed_geolocation_patterns
            .iter()
            .any(|pattern| matches_geolocation(&claims.geolocation, pattern))
    {
        reasons.push(format!(
            "geolocation {:?} not in allowed list",
            claims.geolocation
        ));
    }

    if config.require_host_integrity
        && claims.host_integrity_status != HostIntegrityStatus::PassedAllChecks
    {
        reasons.push(HOST_INTEGRITY_FAILED.to_string());
    }

    if config.require_healthy_gpu && !gpu.is_healthy() {
        reasons.push(format!("GPU status is {:?}, required healthy", gpu.status));
    }

    if gpu.utilization_pct > config.max_gpu_utilization_pct {
        reasons.push(format!(
            "GPU utilization {:.2}% exceeds maximum {:.2}%",
            gpu.utilization_pct, config.max_gpu_utilization_pct
        ));
    }

    if gpu.memory_mb < config.min_gpu_memory_mb {
        reasons.push(format!(
            "GPU memory {} MB is below minimum {} MB",
            gpu.memory_mb, config.min_gpu_memory_mb
        ));
    }

    PolicyResult::from_reasons(reasons)
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};
    use sovereign_types::GpuMetrics;

    use super::*;

    #[fixture]
    fn claims() -> AttestedClaims {
        AttestedClaims {
            geolocation: "Spain: N40.4168, W3.7038".to_string(),
            host_integrity_status: HostIntegrityStatus::PassedAllChecks,
            gpu_metrics: GpuMetrics {
                status: "healthy".to_string(),
                utilization_pct: 15.0,
                memory_mb: 10240,
            },
        }
    }

    #[fixture]
    fn policy() -> PolicyConfig {
        PolicyConfig {
            allowed_geolocation_patterns: vec!["Spain:*".to_string(), "Germany: Berlin".to_string()],
            require_host_integrity: true,
            max_gpu_utilization_pct: 80.0,
            min_gpu_memory_mb: 8192,
            require_healthy_gpu: false,
        }
    }

    #[rstest]
    #[case("Spain: N40.4168, W3.7038", "Spain:*", true)]
    #[case("Spain: N40.4168, W3.7038", "Spain: *", true)]
    #[case("Spain: N40.4168, W3.7038", "*", true)]
    #[case("Germany: Berlin", "Germany: Berlin", true)]
    #[case("Germany: Munich", "Germany: Berlin", false)]
    #[case("France: Paris", "Spain:*", false)]
    #[case("Spain", "Spain", true)]
    fn test_geolocation_patterns(#[case] geolocation: &str, #[case] pattern: &str, #[case] matched: bool) {
        assert_eq!(matches_geolocation(geolocation, pattern), matched);
    }

    #[rstest]
    fn test_passing_claims(claims: AttestedClaims, policy: PolicyConfig) {
        let result = evaluate(Some(&claims), &policy);
        assert!(result.passed);
        assert!(result.reasons.is_empty());
    }

    #[rstest]
    fn test_absent_claims_single_reason(policy: PolicyConfig) {
        let result = evaluate(None, &policy);
        assert!(!result.passed);
        assert_eq!(result.reasons, vec![NO_CLAIMS.to_string()]);
    }

    #[rstest]
    fn test_failed_integrity(mut claims: AttestedClaims, policy: PolicyConfig) {
        claims.host_integrity_status = HostIntegrityStatus::Failed;
        let result = evaluate(Some(&claims), &policy);
        assert_eq!(
            result,
            PolicyResult {
                passed: false,
                reasons: vec![HOST_INTEGRITY_FAILED.to_string()],
            }
        );
    }

    #[rstest]
    fn test_utilization_reason_independent_of_other_checks(mut claims: AttestedClaims, policy: PolicyConfig) {
        claims.gpu_metrics.utilization_pct = 95.0;
        let result = evaluate(Some(&claims), &policy);
        assert_eq!(result.reasons.len(), 1);
        assert!(result.reasons[0].contains("GPU utilization"));

        claims.geolocation = "France: Paris".to_string();
        claims.host_integrity_status = HostIntegrityStatus::Partial;
        let result = evaluate(Some(&claims), &policy);
        assert_eq!(result.reasons.len(), 3);
        assert!(result.reasons[2].contains("GPU utilization"));
    }

    #[rstest]
    fn test_every_violation_reported_in_order(mut claims: AttestedClaims, mut policy: PolicyConfig) {
        policy.require_healthy_gpu = true;
        claims.geolocation = "France: Paris".to_string();
        claims.host_integrity_status = HostIntegrityStatus::Failed;
        claims.gpu_metrics = GpuMetrics {
            status: "degraded".to_string(),
            utilization_pct: 99.5,
            memory_mb: 1024,
        };

        let result = evaluate(Some(&claims), &policy);
        assert!(!result.passed);
        assert_eq!(
            result.reasons,
            vec![
                "geolocation \"France: Paris\" not in allowed list".to_string(),
                HOST_INTEGRITY_FAILED.to_string(),
                "GPU status is \"degraded\", required healthy".to_string(),
                "GPU utilization 99.50% exceeds maximum 80.00%".to_string(),
                "GPU memory 1024 MB is below minimum 8192 MB".to_string(),
            ]
        );
        assert_eq!(evaluate(Some(&claims), &policy), result);
    }

    #[rstest]
    fn test_empty_patterns_allow_any_location(mut claims: AttestedClaims, mut policy: PolicyConfig) {
        policy.allowed_geolocation_patterns.clear();
        claims.geolocation = "Anywhere".to_string();
        assert!(evaluate(Some(&claims), &policy).passed);
    }

    #[test]
    fn test_default_policy_only_requires_integrity() {
        let policy = PolicyConfig::default();
        let claims = AttestedClaims::default();
        assert_eq!(
            evaluate(Some(&claims), &policy).reasons,
            vec![HOST_INTEGRITY_FAILED.to_string()]
        );
    }
}
