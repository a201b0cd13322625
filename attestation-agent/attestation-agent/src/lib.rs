// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::{Context, Result};
use async_trait::async_trait;
use attester::EvidenceGenerator;
use log::{info, warn};
use sovereign_types::SovereignAttestation;

pub mod assembler;
pub mod certification;
pub mod config;
pub mod error;

use crate::{assembler::EvidenceAssembler, certification::CertificationClient, config::Config};
pub use error::AgentError;

/// Attestation Agent (AA for short) is the low-privilege, node side of the
/// sovereign attestation pipeline. It owns the App Key, quotes the platform
/// PCRs over a challenge and obtains the App Key certificate from the
/// delegated certifier, producing the evidence bundle attached to identity
/// issuance requests.
///
/// # Example
///
/// ```no_run
/// use attestation_agent::{AttestationAgent, AttestationAPIs};
///
/// # async fn run() -> anyhow::Result<()> {
/// let aa = AttestationAgent::new(Some("/etc/sovereign-attestation/agent.toml"))?;
/// let _bundle = aa.get_sovereign_attestation(&[0; 32]).await?;
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait AttestationAPIs {
    /// Evidence bundle bound to `nonce`, or `None` when the Unified-Identity
    /// flag is off and issuance must proceed unattested.
    async fn get_sovereign_attestation(
        &self,
        nonce: &[u8],
    ) -> std::result::Result<Option<SovereignAttestation>, AgentError>;

    fn unified_identity(&self) -> bool;
}

pub struct AttestationAgent {
    pub config: Config,
    /// Only constructed when the Unified-Identity flag is on.
    assembler: Option<EvidenceAssembler>,
}

impl AttestationAgent {
    /// Create a new instance of [AttestationAgent].
    pub fn new(config_path: Option<&str>) -> Result<Self> {
        let config = match config_path {
            Some(config_path) => {
                info!("Using AA config file: {config_path}");
                Config::try_from(config_path)?
            }
            None => {
                warn!("No AA config file specified. Using a default configuration.");
                Config::default()
            }
        };
        Self::from_config(config)
    }

    pub fn from_config(config: Config) -> Result<Self> {
        if !config.feature_flags.unified_identity() {
            return Ok(Self {
                config,
                assembler: None,
            });
        }

        let backend = config.tpm.app_key_backend().context("open TPM backend")?;
        let certifier = CertificationClient::new(config.certifier_socket_path()?, config.timeout());
        let assembler = EvidenceAssembler::new(
            EvidenceGenerator::new(backend, config.timeout()),
            certifier,
            config.app_key_handle,
            config.pcr_selection.clone(),
            config.app_key_validity(),
        );

        Ok(Self {
            config,
            assembler: Some(assembler),
        })
    }
}

#[async_trait]
impl AttestationAPIs for AttestationAgent {
    async fn get_sovereign_attestation(
        &self,
        nonce: &[u8],
    ) -> std::result::Result<Option<SovereignAttestation>, AgentError> {
        match &self.assembler {
            Some(assembler) => assembler.build_evidence(nonce).await.map(Some),
            None => Ok(None),
        }
    }

    fn unified_identity(&self) -> bool {
        self.assembler.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, sync::Arc, time::Duration};

    use attester::{sample::SampleTpm, TpmBackendKind, TpmConfig};
    use sovereign_types::FeatureFlags;

    use super::*;
    use crate::certification::{server, CertificationService};

    #[tokio::test]
    async fn test_flag_off_never_touches_tpm() {
        // The hardware backend is unusable here; the flag must keep it closed.
        let config = Config::try_from("tests/agent.flag-off.toml").unwrap();
        let aa = AttestationAgent::from_config(config).unwrap();
        assert!(!aa.unified_identity());
        assert_eq!(aa.get_sovereign_attestation(&[0; 32]).await.unwrap(), None);
        // Even an invalid nonce yields nothing rather than an error.
        assert_eq!(aa.get_sovereign_attestation(&[]).await.unwrap(), None);
    }

    fn sample_config(dir: &Path) -> Config {
        Config {
            feature_flags: FeatureFlags::with_unified_identity(true),
            tpm: TpmConfig {
                backend: TpmBackendKind::Sample,
                sample_state_dir: dir.to_path_buf(),
                sample_key_bits: 1024,
                tcti: None,
                key_state_dir: dir.to_path_buf(),
            },
            certifier_socket: format!("unix://{}", dir.join("certifier.sock").display()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_flag_on_builds_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config(dir.path());

        let backend = SampleTpm::open(dir.path()).unwrap().with_key_bits(1024);
        let service = Arc::new(CertificationService::new(
            config.feature_flags,
            vec![],
            Box::new(backend),
            Duration::from_secs(30),
        ));
        let listener = server::bind(
            &config.certifier_socket_path().unwrap(),
            server::SocketAccess::default(),
        )
        .unwrap();
        tokio::spawn(server::serve(listener, service));

        let aa = AttestationAgent::from_config(config).unwrap();
        assert!(aa.unified_identity());
        let bundle = aa
            .get_sovereign_attestation(&[9u8; 32])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bundle.nonce, hex::encode([9u8; 32]));
    }

    #[cfg(not(feature = "tpm-attester"))]
    #[test]
    fn test_flag_on_requires_backend() {
        let config = Config {
            feature_flags: FeatureFlags::with_unified_identity(true),
            ..Default::default()
        };
        assert!(AttestationAgent::from_config(config).is_err());
    }
}
