// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::time::Duration;

use sovereign_types::{evidence::MAX_NONCE_LEN, Quote};

use crate::{
    error::{Result, TpmError},
    executor::SerializedTpm,
    types::{AppKeyMaterial, PersistentHandle},
    utils::sha256_selection,
    AppKeyOperations,
};

/// App Key and quote generation on top of a serialized TPM backend.
///
/// Holds no AK material: only [`AppKeyOperations`] are reachable from here.
#[derive(Clone)]
pub struct EvidenceGenerator {
    tpm: SerializedTpm<dyn AppKeyOperations>,
}

impl EvidenceGenerator {
    pub fn new(backend: Box<dyn AppKeyOperations>, timeout: Duration) -> Self {
        Self {
            tpm: SerializedTpm::new(backend, timeout),
        }
    }

    pub async fn generate_app_key(&self, handle: PersistentHandle) -> Result<AppKeyMaterial> {
        self.tpm
            .run(
                move |tpm| tpm.create_app_key(handle),
                TpmError::KeyCreationFailed,
            )
            .await
    }

    pub async fn read_app_key(&self, handle: PersistentHandle) -> Result<AppKeyMaterial> {
        self.tpm
            .run(
                move |tpm| tpm.read_app_key(handle),
                TpmError::TpmUnavailable,
            )
            .await
    }

    /// Quote the selected SHA-256 PCRs with the App Key at `handle`, binding
    /// `nonce` as qualifying data.
    pub async fn generate_quote(
        &self,
        handle: PersistentHandle,
        nonce: &[u8],
        pcrs: &[u8],
    ) -> Result<Quote> {
        let selection = sha256_selection(pcrs)?;
        if nonce.is_empty() || nonce.len() > MAX_NONCE_LEN {
            return Err(TpmError::QuoteFailed(format!(
                "nonce must be 1 to {MAX_NONCE_LEN} bytes, got {}",
                nonce.len()
            )));
        }
        let nonce = nonce.to_vec();

        self.tpm
            .run(
                move |tpm| tpm.quote(handle, &nonce, &selection),
                TpmError::QuoteFailed,
            )
            .await
    }
}
