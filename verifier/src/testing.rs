// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Evidence produced by a sample TPM, for tests.

use attester::{
    sample::SampleTpm, utils::sha256_selection, AppKeyOperations, AttestationKeyOperations,
    PersistentHandle,
};
use sovereign_types::{
    evidence::public_key_to_pem, protocol::EvidenceData, AppKeyCertificate, HashAlgorithm,
};
use std::sync::Mutex;
use tempfile::TempDir;

use crate::registry::RegisteredPlatform;

pub struct SamplePlatform {
    id: String,
    tpm: Mutex<SampleTpm>,
    _state: TempDir,
}

impl SamplePlatform {
    pub fn new(id: &str) -> Self {
        let state = tempfile::tempdir().unwrap();
        let tpm = SampleTpm::open(state.path()).unwrap().with_key_bits(1024);
        Self {
            id: id.to_string(),
            tpm: Mutex::new(tpm),
            _state: state,
        }
    }

    pub fn registered(&self) -> RegisteredPlatform {
        RegisteredPlatform {
            id: self.id.clone(),
            ak: self.tpm.lock().unwrap().ak_public().unwrap(),
        }
    }

    pub fn ak_pem(&self) -> String {
        public_key_to_pem(&self.registered().ak).unwrap()
    }

    /// Fresh App Key, certified by the AK, quoting PCRs 0..=7 over `nonce`.
    pub fn evidence(&self, nonce: &[u8]) -> EvidenceData {
        let handle = PersistentHandle::default();
        let mut tpm = self.tpm.lock().unwrap();

        let app_key = tpm.create_app_key(handle).unwrap();
        let selection = sha256_selection(&[0, 1, 2, 3, 4, 5, 6, 7]).unwrap();
        let quote = tpm.quote(handle, nonce, &selection).unwrap();
        let certification = tpm
            .certify(
                handle,
                &AppKeyCertificate::qualifying_data(&app_key.public_pem),
            )
            .unwrap();
        let certificate = AppKeyCertificate {
            app_key_public: app_key.public_pem.clone(),
            app_key_tpm_public: app_key.tpm_public,
            certify_data: certification.certify_data,
            signature: certification.signature,
            hash_alg: HashAlgorithm::Sha256,
        };

        EvidenceData {
            nonce: hex::encode(nonce),
            quote: quote.to_string(),
            hash_alg: "sha256".to_string(),
            app_key_public: app_key.public_pem,
            app_key_certificate: certificate.encode().unwrap(),
            tpm_ak: None,
            tpm_ek: None,
        }
    }
}
