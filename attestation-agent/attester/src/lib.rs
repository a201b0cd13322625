// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! TPM evidence generation: App Keys, quotes and, for the certifier only,
//! AK certification. Two backends sit behind the same traits: a hardware TPM
//! reached through tss-esapi (`tpm-attester` feature) and a software sample
//! TPM that keeps its state in a directory.

use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use sovereign_types::{tpm_structs::PcrSelection, Quote};
use std::path::PathBuf;
use strum::{AsRefStr, Display, EnumString};

pub mod error;
pub mod executor;
pub mod generator;
pub mod sample;
pub mod types;
pub mod utils;

#[cfg(feature = "tpm-attester")]
pub mod tpm;

pub use error::TpmError;
pub use executor::SerializedTpm;
pub use generator::EvidenceGenerator;
pub use types::{AkSource, AppKeyMaterial, Certification, PersistentHandle};

/// Operations of the low-privilege evidence generator.
pub trait AppKeyOperations: Send {
    /// Create an App Key and persist it at `handle`, replacing a stale one.
    fn create_app_key(&mut self, handle: PersistentHandle) -> error::Result<AppKeyMaterial>;

    fn read_app_key(&mut self, handle: PersistentHandle) -> error::Result<AppKeyMaterial>;

    fn quote(
        &mut self,
        handle: PersistentHandle,
        nonce: &[u8],
        selection: &PcrSelection,
    ) -> error::Result<Quote>;
}

/// Operations reserved to the delegated certifier, the only AK holder.
pub trait AttestationKeyOperations: Send {
    fn ak_public(&mut self) -> error::Result<RsaPublicKey>;

    /// PEM of the EK certificate, when the platform has one.
    fn ek_certificate(&mut self) -> error::Result<Option<String>> {
        Ok(None)
    }

    fn load_app_key(&mut self, handle: PersistentHandle) -> error::Result<AppKeyMaterial>;

    /// `TPM2_Certify` of the key at `handle` by the AK.
    fn certify(
        &mut self,
        handle: PersistentHandle,
        qualifying_data: &[u8],
    ) -> error::Result<Certification>;
}

#[derive(
    Serialize, Deserialize, EnumString, AsRefStr, Display, Clone, Copy, Debug, PartialEq, Eq, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TpmBackendKind {
    #[default]
    Tpm,
    Sample,
}

/// TPM section shared by the agent and certifier configurations.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TpmConfig {
    #[serde(default)]
    pub backend: TpmBackendKind,

    /// State directory of the sample backend.
    #[serde(default = "default_sample_state_dir")]
    pub sample_state_dir: PathBuf,

    /// Modulus size of keys the sample backend creates.
    #[serde(default = "default_sample_key_bits")]
    pub sample_key_bits: usize,

    /// TCTI configuration string, e.g. `device:/dev/tpmrm0`.
    #[serde(default)]
    pub tcti: Option<String>,

    /// Where creation times of hardware App Keys are recorded.
    #[serde(default = "default_key_state_dir")]
    pub key_state_dir: PathBuf,
}

fn default_sample_state_dir() -> PathBuf {
    PathBuf::from(sample::SAMPLE_STATE_DIR)
}

fn default_key_state_dir() -> PathBuf {
    PathBuf::from(KEY_STATE_DIR)
}

pub const KEY_STATE_DIR: &str = "/var/lib/sovereign-attestation";

fn default_sample_key_bits() -> usize {
    2048
}

impl Default for TpmConfig {
    fn default() -> Self {
        Self {
            backend: TpmBackendKind::default(),
            sample_state_dir: default_sample_state_dir(),
            sample_key_bits: default_sample_key_bits(),
            tcti: None,
            key_state_dir: default_key_state_dir(),
        }
    }
}

impl TpmConfig {
    fn sample(&self) -> error::Result<sample::SampleTpm> {
        Ok(sample::SampleTpm::open(self.sample_state_dir.clone())?
            .with_key_bits(self.sample_key_bits))
    }

    pub fn app_key_backend(&self) -> error::Result<Box<dyn AppKeyOperations>> {
        match self.backend {
            TpmBackendKind::Sample => Ok(Box::new(self.sample()?)),
            TpmBackendKind::Tpm => hardware_app_key_backend(self),
        }
    }

    pub fn attestation_key_backend(
        &self,
        ak_source: &AkSource,
    ) -> error::Result<Box<dyn AttestationKeyOperations>> {
        match self.backend {
            TpmBackendKind::Sample => Ok(Box::new(self.sample()?)),
            TpmBackendKind::Tpm => hardware_attestation_key_backend(self, ak_source),
        }
    }
}

#[cfg(feature = "tpm-attester")]
fn hardware_app_key_backend(config: &TpmConfig) -> error::Result<Box<dyn AppKeyOperations>> {
    // App Key operations never touch the AK.
    Ok(Box::new(tpm::TpmDevice::new(
        config.tcti.clone(),
        AkSource::Generated,
        config.key_state_dir.clone(),
    )?))
}

#[cfg(feature = "tpm-attester")]
fn hardware_attestation_key_backend(
    config: &TpmConfig,
    ak_source: &AkSource,
) -> error::Result<Box<dyn AttestationKeyOperations>> {
    Ok(Box::new(tpm::TpmDevice::new(
        config.tcti.clone(),
        ak_source.clone(),
        config.key_state_dir.clone(),
    )?))
}

#[cfg(not(feature = "tpm-attester"))]
fn hardware_app_key_backend(_config: &TpmConfig) -> error::Result<Box<dyn AppKeyOperations>> {
    Err(TpmError::TpmUnavailable(
        "built without the tpm-attester feature".into(),
    ))
}

#[cfg(not(feature = "tpm-attester"))]
fn hardware_attestation_key_backend(
    _config: &TpmConfig,
    _ak_source: &AkSource,
) -> error::Result<Box<dyn AttestationKeyOperations>> {
    Err(TpmError::TpmUnavailable(
        "built without the tpm-attester feature".into(),
    ))
}
