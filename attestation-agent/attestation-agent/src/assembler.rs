// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use attester::{AppKeyMaterial, EvidenceGenerator, PersistentHandle};
use chrono::Utc;
use log::{debug, info};
use sovereign_types::{
    evidence::{MAX_NONCE_LEN, MIN_NONCE_LEN},
    SovereignAttestation,
};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::{certification::CertificationClient, error::AgentError};

/// App Key with the certificate the certifier issued for it.
struct CertifiedAppKey {
    material: AppKeyMaterial,
    certificate: String,
}

/// Builds [`SovereignAttestation`] bundles: App Key, quote over the
/// challenge, delegated certificate of the App Key.
pub struct EvidenceAssembler {
    generator: EvidenceGenerator,
    certifier: CertificationClient,
    handle: PersistentHandle,
    pcr_selection: Vec<u8>,
    validity: Duration,
    app_key: Mutex<Option<CertifiedAppKey>>,
}

impl EvidenceAssembler {
    pub fn new(
        generator: EvidenceGenerator,
        certifier: CertificationClient,
        handle: PersistentHandle,
        pcr_selection: Vec<u8>,
        validity: Duration,
    ) -> Self {
        Self {
            generator,
            certifier,
            handle,
            pcr_selection,
            validity,
            app_key: Mutex::new(None),
        }
    }

    /// Build a bundle bound to `nonce`. Any failure aborts the attempt; no
    /// partial bundle is ever returned.
    pub async fn build_evidence(&self, nonce: &[u8]) -> Result<SovereignAttestation, AgentError> {
        if !(MIN_NONCE_LEN..=MAX_NONCE_LEN).contains(&nonce.len()) {
            return Err(AgentError::InvalidNonce(nonce.len()));
        }

        // Held until the quote is taken so that a key rotation cannot split
        // the quote from the certificate.
        let mut app_key = self.app_key.lock().await;
        let key = match app_key.take() {
            Some(key) if self.is_fresh(&key.material) => key,
            Some(_) => self.rotate_app_key().await?,
            // First bundle of this process: a key persisted by an earlier run
            // is kept while it is still valid.
            None => match self.persisted_app_key().await {
                Some(material) => self.certify(material).await?,
                None => self.rotate_app_key().await?,
            },
        };
        let key = app_key.insert(key);

        let quote = self
            .generator
            .generate_quote(self.handle, nonce, &self.pcr_selection)
            .await?;
        debug!("Quoted PCRs {:?} with App Key {}", self.pcr_selection, self.handle);

        Ok(SovereignAttestation {
            quote: quote.to_string(),
            app_key_public: key.material.public_pem.clone(),
            app_key_certificate: key.certificate.clone(),
            nonce: hex::encode(nonce),
            workload_code_hash: None,
        })
    }

    fn is_fresh(&self, material: &AppKeyMaterial) -> bool {
        match (Utc::now() - material.created_at).to_std() {
            Ok(age) => age < self.validity,
            // Creation time in the future: clock went backwards, rotate.
            Err(_) => false,
        }
    }

    async fn persisted_app_key(&self) -> Option<AppKeyMaterial> {
        match self.generator.read_app_key(self.handle).await {
            Ok(material) if self.is_fresh(&material) => {
                info!(
                    "Reusing App Key at {} created {}",
                    self.handle, material.created_at
                );
                Some(material)
            }
            Ok(_) => {
                debug!("App Key at {} expired", self.handle);
                None
            }
            Err(e) => {
                debug!("No reusable App Key at {}: {e}", self.handle);
                None
            }
        }
    }

    async fn rotate_app_key(&self) -> Result<CertifiedAppKey, AgentError> {
        let material = self.generator.generate_app_key(self.handle).await?;
        info!("New App Key created at {}", self.handle);
        self.certify(material).await
    }

    async fn certify(&self, material: AppKeyMaterial) -> Result<CertifiedAppKey, AgentError> {
        let certificate = self
            .certifier
            .certify_app_key(&material.public_pem, self.handle)
            .await?
            .encode()?;
        debug!("App Key at {} certified", self.handle);
        Ok(CertifiedAppKey {
            material,
            certificate,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, sync::Arc};

    use attester::sample::SampleTpm;
    use rstest::rstest;
    use sovereign_types::{protocol::CertifyErrorKind, FeatureFlags, Quote};

    use super::*;
    use crate::certification::{server, CertificationService};

    fn new_assembler(dir: &Path, socket: &Path, validity: Duration) -> EvidenceAssembler {
        let backend = SampleTpm::open(dir).unwrap().with_key_bits(1024);
        EvidenceAssembler::new(
            EvidenceGenerator::new(Box::new(backend), Duration::from_secs(30)),
            CertificationClient::new(socket.to_path_buf(), Duration::from_secs(30)),
            PersistentHandle::default(),
            vec![0, 1, 2, 3, 4, 5, 6, 7],
            validity,
        )
    }

    fn start_certifier(dir: &Path, enabled: bool) -> std::path::PathBuf {
        let socket = dir.join("certifier.sock");
        let backend = SampleTpm::open(dir).unwrap().with_key_bits(1024);
        let service = Arc::new(CertificationService::new(
            FeatureFlags::with_unified_identity(enabled),
            vec![],
            Box::new(backend),
            Duration::from_secs(30),
        ));
        tokio::spawn(server::serve(server::bind(&socket, server::SocketAccess::default()).unwrap(), service));
        socket
    }

    #[tokio::test]
    async fn test_build_evidence() {
        let dir = tempfile::tempdir().unwrap();
        let socket = start_certifier(dir.path(), true);
        let assembler = new_assembler(dir.path(), &socket, Duration::from_secs(3600));

        let nonce = [0x42u8; 32];
        let bundle = assembler.build_evidence(&nonce).await.unwrap();
        assert_eq!(bundle.nonce, hex::encode(nonce));
        assert!(bundle.quote.parse::<Quote>().is_ok());
        let cert = sovereign_types::AppKeyCertificate::decode(&bundle.app_key_certificate).unwrap();
        assert_eq!(cert.app_key_public, bundle.app_key_public);
    }

    #[tokio::test]
    async fn test_app_key_reused_within_validity() {
        let dir = tempfile::tempdir().unwrap();
        let socket = start_certifier(dir.path(), true);
        let assembler = new_assembler(dir.path(), &socket, Duration::from_secs(3600));

        let first = assembler.build_evidence(&[1u8; 32]).await.unwrap();
        let second = assembler.build_evidence(&[2u8; 32]).await.unwrap();
        assert_eq!(first.app_key_public, second.app_key_public);
        assert_eq!(first.app_key_certificate, second.app_key_certificate);
        assert_ne!(first.quote, second.quote);
    }

    #[tokio::test]
    async fn test_app_key_rotated_after_validity() {
        let dir = tempfile::tempdir().unwrap();
        let socket = start_certifier(dir.path(), true);
        let assembler = new_assembler(dir.path(), &socket, Duration::ZERO);

        let first = assembler.build_evidence(&[1u8; 32]).await.unwrap();
        let second = assembler.build_evidence(&[2u8; 32]).await.unwrap();
        assert_ne!(first.app_key_public, second.app_key_public);
    }

    #[tokio::test]
    async fn test_app_key_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let socket = start_certifier(dir.path(), true);

        let first = new_assembler(dir.path(), &socket, Duration::from_secs(3600))
            .build_evidence(&[1u8; 32])
            .await
            .unwrap();
        let restarted = new_assembler(dir.path(), &socket, Duration::from_secs(3600))
            .build_evidence(&[2u8; 32])
            .await
            .unwrap();
        assert_eq!(first.app_key_public, restarted.app_key_public);

        // Past its validity, the persisted key is replaced.
        let expired = new_assembler(dir.path(), &socket, Duration::ZERO)
            .build_evidence(&[3u8; 32])
            .await
            .unwrap();
        assert_ne!(first.app_key_public, expired.app_key_public);
    }

    #[rstest]
    #[case(0)]
    #[case(15)]
    #[case(65)]
    #[tokio::test]
    async fn test_nonce_length_checked_before_tpm(#[case] len: usize) {
        let dir = tempfile::tempdir().unwrap();
        // Nothing listens here; reaching the certifier would fail differently.
        let assembler = new_assembler(dir.path(), &dir.path().join("none.sock"), Duration::ZERO);
        let err = assembler.build_evidence(&vec![0u8; len]).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidNonce(l) if l == len));
    }

    #[tokio::test]
    async fn test_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = new_assembler(dir.path(), &dir.path().join("none.sock"), Duration::ZERO);
        let err = assembler.build_evidence(&[3u8; 32]).await.unwrap_err();
        assert!(matches!(err, AgentError::UpstreamUnavailable(_)));

        let socket = start_certifier(dir.path(), false);
        let assembler = new_assembler(dir.path(), &socket, Duration::ZERO);
        let err = assembler.build_evidence(&[3u8; 32]).await.unwrap_err();
        assert_eq!(err.certify_error_kind(), Some(CertifyErrorKind::Unsupported));
    }
}
