// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Attestation and policy gate in front of identity issuance.
//!
//! ```text
//! IDLE -> EVIDENCE_RECEIVED -> VERIFYING -> VERIFIED -> POLICY_EVALUATING -> CLAIMS_EMBEDDED
//!                                        \-> REJECTED                     \-> DENIED
//! ```
//!
//! With Unified-Identity disabled the gate goes straight from `IDLE` to
//! `CLAIMS_EMBEDDED` with no claims, without touching the verifier, the
//! policy or the log.

use log::{debug, info, warn};
use sovereign_types::{
    protocol::{VerificationErrorKind, VerificationFailure},
    AttestedClaims, FeatureFlags, SovereignAttestation,
};
use std::sync::Arc;
use strum::{AsRefStr, Display};
use tokio::sync::RwLock;

use crate::{
    challenge::ChallengeRegistry,
    config::IssuanceConfig,
    error::IssuanceError,
    policy::{self, PolicyConfig},
    verifier_client::EvidenceVerifier,
};

#[derive(Display, AsRefStr, Clone, Copy, Debug, PartialEq, Eq)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum GateState {
    Idle,
    EvidenceReceived,
    Verifying,
    Verified,
    Rejected,
    PolicyEvaluating,
    ClaimsEmbedded,
    Denied,
}

/// Successful passage through the gate.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    /// Verified claims to embed, `None` on the legacy path.
    pub claims: Option<AttestedClaims>,

    /// States visited, from `IDLE` to `CLAIMS_EMBEDDED`.
    pub states: Vec<GateState>,
}

impl Admission {
    fn legacy() -> Self {
        Self {
            claims: None,
            states: vec![GateState::Idle, GateState::ClaimsEmbedded],
        }
    }
}

pub struct IssuanceGate {
    flags: FeatureFlags,
    require_attestation: bool,
    verifier: Option<Box<dyn EvidenceVerifier>>,
    challenges: ChallengeRegistry,
    policy: RwLock<Arc<PolicyConfig>>,
}

impl IssuanceGate {
    pub fn new(config: &IssuanceConfig, verifier: Box<dyn EvidenceVerifier>) -> Self {
        Self::with_verifier(config, Some(verifier))
    }

    /// Gate without a verifier, for servers running with Unified-Identity
    /// disabled. Evidence reaching it is rejected as unverifiable.
    pub fn legacy(config: &IssuanceConfig) -> Self {
        Self::with_verifier(config, None)
    }

    fn with_verifier(config: &IssuanceConfig, verifier: Option<Box<dyn EvidenceVerifier>>) -> Self {
        Self {
            flags: config.feature_flags,
            require_attestation: config.require_attestation,
            verifier,
            challenges: ChallengeRegistry::new(config.timeout()),
            policy: RwLock::new(Arc::new(config.policy.clone())),
        }
    }

    pub fn unified_identity(&self) -> bool {
        self.flags.unified_identity()
    }

    /// Challenge nonce for the next attestation of a workload.
    pub fn mint_challenge(&self) -> String {
        self.challenges.mint()
    }

    /// Swap in a new policy. Evaluations in flight keep the one they started
    /// with.
    pub async fn reload_policy(&self, policy: PolicyConfig) {
        *self.policy.write().await = Arc::new(policy);
        info!("Issuance policy reloaded");
    }

    pub async fn policy(&self) -> Arc<PolicyConfig> {
        self.policy.read().await.clone()
    }

    pub async fn admit(
        &self,
        bundle: Option<&SovereignAttestation>,
        audit_id: &str,
    ) -> Result<Admission, IssuanceError> {
        if !self.flags.unified_identity() {
            return Ok(Admission::legacy());
        }

        let Some(bundle) = bundle else {
            if self.require_attestation {
                warn!("audit_id={audit_id} state={} reason=no evidence", GateState::Rejected);
                return Err(IssuanceError::rejected(
                    VerificationErrorKind::MissingEvidence,
                    "attestation is required but no evidence was supplied",
                ));
            }
            debug!("audit_id={audit_id} no evidence, legacy issuance");
            return Ok(Admission::legacy());
        };

        let mut states = vec![GateState::Idle, GateState::EvidenceReceived];
        if !self.challenges.consume(&bundle.nonce) {
            warn!("audit_id={audit_id} state={} reason=unknown challenge", GateState::Rejected);
            return Err(IssuanceError::rejected(
                VerificationErrorKind::InvalidNonce,
                "nonce was not issued by this server or was already used",
            ));
        }

        states.push(GateState::Verifying);
        let verified = match &self.verifier {
            Some(verifier) => verifier.verify(bundle, audit_id).await,
            None => Err(VerificationFailure {
                kind: VerificationErrorKind::UpstreamUnavailable,
                message: "no verifier configured".to_string(),
            }),
        };
        let claims = match verified {
            Ok(claims) => claims,
            Err(failure) => {
                warn!(
                    "audit_id={audit_id} state={} kind={} reason={}",
                    GateState::Rejected,
                    failure.kind,
                    failure.message
                );
                return Err(IssuanceError::Rejected(failure));
            }
        };
        states.push(GateState::Verified);

        states.push(GateState::PolicyEvaluating);
        let policy = self.policy().await;
        let result = policy::evaluate(Some(&claims), &policy);
        if !result.passed {
            warn!(
                "audit_id={audit_id} state={} reasons={:?}",
                GateState::Denied,
                result.reasons
            );
            return Err(IssuanceError::Denied(result.reasons));
        }

        states.push(GateState::ClaimsEmbedded);
        info!(
            "audit_id={audit_id} state={} geolocation={:?} integrity={}",
            GateState::ClaimsEmbedded,
            claims.geolocation,
            claims.host_integrity_status
        );
        Ok(Admission {
            claims: Some(claims),
            states,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use async_trait::async_trait;
    use sovereign_types::{protocol::VerificationFailure, GpuMetrics, HostIntegrityStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Returns fixed claims and counts its calls.
    pub struct FixedVerifier {
        pub claims: Result<AttestedClaims, VerificationFailure>,
        pub calls: Arc<AtomicUsize>,
    }

    impl FixedVerifier {
        pub fn new(claims: Result<AttestedClaims, VerificationFailure>) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    claims,
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl EvidenceVerifier for FixedVerifier {
        async fn verify(
            &self,
            _bundle: &SovereignAttestation,
            _audit_id: &str,
        ) -> Result<AttestedClaims, VerificationFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.claims.clone()
        }
    }

    pub fn madrid() -> AttestedClaims {
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

    pub fn config(enabled: bool) -> IssuanceConfig {
        IssuanceConfig {
            feature_flags: FeatureFlags::with_unified_identity(enabled),
            policy: PolicyConfig {
                allowed_geolocation_patterns: vec!["Spain: *".to_string()],
                max_gpu_utilization_pct: 80.0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn bundle(nonce: &str) -> SovereignAttestation {
        SovereignAttestation {
            quote: "rAA==:AA==:AA==".to_string(),
            app_key_public: "app-key-pem".to_string(),
            app_key_certificate: "cert".to_string(),
            nonce: nonce.to_string(),
            workload_code_hash: None,
        }
    }

    fn gate(enabled: bool, claims: Result<AttestedClaims, VerificationFailure>) -> (IssuanceGate, Arc<AtomicUsize>) {
        let (verifier, calls) = FixedVerifier::new(claims);
        (IssuanceGate::new(&config(enabled), Box::new(verifier)), calls)
    }

    #[tokio::test]
    async fn test_flag_off_skips_pipeline() {
        let (gate, calls) = gate(false, Ok(madrid()));
        let bundle = bundle("not-a-challenge");

        let admission = gate.admit(Some(&bundle), "audit").await.unwrap();
        assert_eq!(admission.claims, None);
        assert_eq!(admission.states, vec![GateState::Idle, GateState::ClaimsEmbedded]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_claims_embedded() {
        let (gate, calls) = gate(true, Ok(madrid()));
        let bundle = bundle(&gate.mint_challenge());

        let admission = gate.admit(Some(&bundle), "audit").await.unwrap();
        assert_eq!(admission.claims, Some(madrid()));
        assert_eq!(
            admission.states,
            vec![
                GateState::Idle,
                GateState::EvidenceReceived,
                GateState::Verifying,
                GateState::Verified,
                GateState::PolicyEvaluating,
                GateState::ClaimsEmbedded,
            ]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_integrity_is_denied() {
        let mut claims = madrid();
        claims.host_integrity_status = HostIntegrityStatus::Failed;
        let (gate, _) = gate(true, Ok(claims));
        let bundle = bundle(&gate.mint_challenge());

        let err = gate.admit(Some(&bundle), "audit").await.unwrap_err();
        assert_eq!(
            err,
            IssuanceError::Denied(vec![policy::HOST_INTEGRITY_FAILED.to_string()])
        );
        assert_eq!(err.state(), Some(GateState::Denied));
    }

    #[tokio::test]
    async fn test_busy_gpu_is_denied() {
        let mut claims = madrid();
        claims.gpu_metrics.utilization_pct = 95.0;
        let (gate, _) = gate(true, Ok(claims));
        let bundle = bundle(&gate.mint_challenge());

        let IssuanceError::Denied(reasons) = gate.admit(Some(&bundle), "audit").await.unwrap_err() else {
            panic!("expected a policy denial");
        };
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("GPU utilization"));
    }

    #[tokio::test]
    async fn test_verification_failure_is_rejected() {
        let failure = VerificationFailure {
            kind: VerificationErrorKind::CertificateChainInvalid,
            message: "not signed by a registered AK".to_string(),
        };
        let (gate, _) = gate(true, Err(failure.clone()));
        let bundle = bundle(&gate.mint_challenge());

        let err = gate.admit(Some(&bundle), "audit").await.unwrap_err();
        assert_eq!(err, IssuanceError::Rejected(failure));
        assert_eq!(err.state(), Some(GateState::Rejected));
    }

    #[tokio::test]
    async fn test_unknown_challenge_rejected_before_verifier() {
        let (gate, calls) = gate(true, Ok(madrid()));
        let bundle = bundle(&"11".repeat(32));

        let err = gate.admit(Some(&bundle), "audit").await.unwrap_err();
        let IssuanceError::Rejected(failure) = err else {
            panic!("expected a rejection");
        };
        assert_eq!(failure.kind, VerificationErrorKind::InvalidNonce);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_gate_without_verifier() {
        let gate = IssuanceGate::legacy(&config(false));
        let legacy_bundle = bundle(&gate.mint_challenge());
        assert_eq!(
            gate.admit(Some(&legacy_bundle), "").await.unwrap(),
            Admission::legacy()
        );

        let gate = IssuanceGate::legacy(&config(true));
        let attested = bundle(&gate.mint_challenge());
        let IssuanceError::Rejected(failure) = gate.admit(Some(&attested), "audit").await.unwrap_err()
        else {
            panic!("expected a rejection");
        };
        assert_eq!(failure.kind, VerificationErrorKind::UpstreamUnavailable);
    }

    #[tokio::test]
    async fn test_missing_evidence() {
        let (gate, _) = gate(true, Ok(madrid()));
        assert_eq!(gate.admit(None, "audit").await.unwrap(), Admission::legacy());

        let mut config = config(true);
        config.require_attestation = true;
        let (verifier, calls) = FixedVerifier::new(Ok(madrid()));
        let gate = IssuanceGate::new(&config, Box::new(verifier));
        let IssuanceError::Rejected(failure) = gate.admit(None, "audit").await.unwrap_err() else {
            panic!("expected a rejection");
        };
        assert_eq!(failure.kind, VerificationErrorKind::MissingEvidence);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reuse_of_one_challenge() {
        let (gate, calls) = gate(true, Ok(madrid()));
        let gate = Arc::new(gate);
        let nonce = gate.mint_challenge();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                let bundle = bundle(&nonce);
                tokio::spawn(async move { gate.admit(Some(&bundle), "audit").await.is_ok() })
            })
            .collect();
        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_policy_reload_swaps() {
        let (gate, _) = gate(true, Ok(madrid()));
        let before = gate.policy().await;

        gate.reload_policy(PolicyConfig {
            allowed_geolocation_patterns: vec!["Germany: *".to_string()],
            ..Default::default()
        })
        .await;

        assert_eq!(before.allowed_geolocation_patterns, vec!["Spain: *".to_string()]);
        let bundle = bundle(&gate.mint_challenge());
        assert!(matches!(
            gate.admit(Some(&bundle), "audit").await,
            Err(IssuanceError::Denied(_))
        ));
    }
}
