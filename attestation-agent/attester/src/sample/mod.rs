// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Software stand-in for a TPM.
//!
//! Keys are RSA keys in PKCS#8 PEM files named after their persistent handle
//! inside a state directory, next to the AK (`ak.pem`) and a SHA-256 PCR
//! bank. Two processes pointed at the same directory share keys the way two
//! processes share a real TPM. The structures it emits use the same
//! encodings as a hardware TPM, so the verifier cannot tell them apart;
//! trust comes from registering the AK, not from the backend.

use chrono::{DateTime, Utc};
use log::{debug, info};
use rsa::{
    pkcs1v15::SigningKey,
    pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding},
    signature::{RandomizedSigner, SignatureEncoding},
    RsaPrivateKey, RsaPublicKey,
};
use sha2::Sha256;
use sovereign_types::{
    evidence::public_key_to_pem,
    tpm_structs::{
        Attested, ClockInfo, PcrBank, PcrSelection, RsaPublicArea, RsaSignature, TpmsAttest,
        APP_KEY_ATTRIBUTES, ATTESTATION_KEY_ATTRIBUTES, TPM_ALG_SHA256,
    },
    HashAlgorithm, Quote,
};
use std::{
    fs,
    io::Write,
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

use crate::{
    error::{Result, TpmError},
    types::{AppKeyMaterial, Certification, PersistentHandle},
    AppKeyOperations, AttestationKeyOperations,
};

mod measure_register;
use measure_register::{PcrRegisters, MEASURE_DIGEST_LEN};

/// Default state directory of the sample backend.
pub const SAMPLE_STATE_DIR: &str = "/run/sovereign-attestation/sample-tpm";

const AK_FILE: &str = "ak.pem";
const PCR_FILE: &str = "pcrs";
const DEFAULT_KEY_BITS: usize = 2048;
const SAMPLE_FIRMWARE_VERSION: u64 = 0x0001_0000_0000_0000;
/// `TPM_RH_OWNER`, the parent every sample key is created under.
const OWNER_HIERARCHY: u32 = 0x4000_0001;

// Sample backend is always supported
pub fn detect_platform() -> bool {
    true
}

#[derive(Debug)]
pub struct SampleTpm {
    state_dir: PathBuf,
    key_bits: usize,
    pcrs: PcrRegisters,
    ak: Option<RsaPrivateKey>,
}

impl SampleTpm {
    pub fn open(state_dir: impl Into<PathBuf>) -> Result<Self> {
        let state_dir = state_dir.into();
        fs::create_dir_all(&state_dir).map_err(|e| {
            TpmError::TpmUnavailable(format!(
                "create sample TPM state dir {}: {e}",
                state_dir.display()
            ))
        })?;
        let pcrs = PcrRegisters::open(state_dir.join(PCR_FILE))
            .map_err(|e| TpmError::TpmUnavailable(format!("{e:#}")))?;

        Ok(Self {
            state_dir,
            key_bits: DEFAULT_KEY_BITS,
            pcrs,
            ak: None,
        })
    }

    /// Modulus size of keys created from now on.
    pub fn with_key_bits(mut self, key_bits: usize) -> Self {
        self.key_bits = key_bits;
        self
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Extend a SHA-256 PCR of the sample bank with an event digest.
    pub fn extend_pcr(&self, index: u8, event_digest: &[u8]) -> Result<Vec<u8>> {
        let digest: &[u8; MEASURE_DIGEST_LEN] = event_digest.try_into().map_err(|_| {
            TpmError::InvalidSelection(format!(
                "event digest must be {MEASURE_DIGEST_LEN} bytes, got {}",
                event_digest.len()
            ))
        })?;
        self.pcrs
            .extend(index, digest)
            .map_err(|e| TpmError::InvalidSelection(format!("{e:#}")))
    }

    fn key_path(&self, handle: PersistentHandle) -> PathBuf {
        self.state_dir.join(format!("{:08x}.pem", handle.raw()))
    }

    fn load_key(&self, handle: PersistentHandle) -> Result<(RsaPrivateKey, DateTime<Utc>)> {
        let path = self.key_path(handle);
        let pem = fs::read_to_string(&path)
            .map_err(|_| TpmError::KeyNotFound(format!("no key persisted at {handle}")))?;
        let key = RsaPrivateKey::from_pkcs8_pem(&pem)
            .map_err(|e| TpmError::KeyNotFound(format!("key at {handle} is unreadable: {e}")))?;
        let created_at = fs::metadata(&path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok((key, created_at))
    }

    fn attestation_key(&mut self) -> Result<&RsaPrivateKey> {
        if self.ak.is_none() {
            let path = self.state_dir.join(AK_FILE);
            let ak = match fs::read_to_string(&path) {
                Ok(pem) => RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|e| {
                    TpmError::TpmUnavailable(format!("AK at {} is unreadable: {e}", path.display()))
                })?,
                Err(_) => {
                    info!("Creating sample AK at {}", path.display());
                    let ak = generate_key(self.key_bits)
                        .map_err(|e| TpmError::TpmUnavailable(format!("create AK: {e}")))?;
                    store_key(&path, &ak).map_err(TpmError::TpmUnavailable)?;
                    ak
                }
            };
            self.ak = Some(ak);
        }

        self.ak
            .as_ref()
            .ok_or_else(|| TpmError::TpmUnavailable("AK not loaded".into()))
    }
}

fn generate_key(bits: usize) -> std::result::Result<RsaPrivateKey, rsa::Error> {
    RsaPrivateKey::new(&mut rand::thread_rng(), bits)
}

fn store_key(path: &Path, key: &RsaPrivateKey) -> std::result::Result<(), String> {
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| format!("encode key: {e}"))?;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| format!("create {}: {e}", path.display()))?;
    file.write_all(pem.as_bytes())
        .map_err(|e| format!("write {}: {e}", path.display()))
}

fn public_area(key: &RsaPublicKey, attributes: u32) -> RsaPublicArea {
    RsaPublicArea::signing_key(key, attributes)
}

fn material(
    handle: PersistentHandle,
    key: &RsaPrivateKey,
    created_at: DateTime<Utc>,
) -> Result<AppKeyMaterial> {
    let public = key.to_public_key();
    let tpm_public = public_area(&public, APP_KEY_ATTRIBUTES)
        .marshal()
        .map_err(|e| TpmError::KeyCreationFailed(e.to_string()))?;
    let public_pem =
        public_key_to_pem(&public).map_err(|e| TpmError::KeyCreationFailed(e.to_string()))?;

    Ok(AppKeyMaterial {
        handle,
        public_pem,
        tpm_public,
        created_at,
    })
}

/// Sign like `TPM2_Sign` with an RSASSA/SHA-256 key and marshal the
/// resulting `TPMT_SIGNATURE`.
fn sign(key: &RsaPrivateKey, message: &[u8]) -> std::result::Result<Vec<u8>, String> {
    let signature = SigningKey::<Sha256>::new(key.clone())
        .try_sign_with_rng(&mut rand::thread_rng(), message)
        .map_err(|e| e.to_string())?;
    RsaSignature {
        hash: TPM_ALG_SHA256,
        signature: signature.to_vec(),
    }
    .marshal()
    .map_err(|e| e.to_string())
}

fn clock_info() -> ClockInfo {
    ClockInfo {
        clock: Utc::now().timestamp_millis().max(0) as u64,
        reset_count: 0,
        restart_count: 0,
        safe: true,
    }
}

impl AppKeyOperations for SampleTpm {
    fn create_app_key(&mut self, handle: PersistentHandle) -> Result<AppKeyMaterial> {
        let key = generate_key(self.key_bits)
            .map_err(|e| TpmError::KeyCreationFailed(e.to_string()))?;
        // Evicts whatever was persisted at this handle.
        store_key(&self.key_path(handle), &key).map_err(TpmError::KeyCreationFailed)?;
        debug!("Sample App Key persisted at {handle}");
        material(handle, &key, Utc::now())
    }

    fn read_app_key(&mut self, handle: PersistentHandle) -> Result<AppKeyMaterial> {
        let (key, created_at) = self.load_key(handle)?;
        material(handle, &key, created_at)
    }

    fn quote(
        &mut self,
        handle: PersistentHandle,
        nonce: &[u8],
        selection: &PcrSelection,
    ) -> Result<Quote> {
        let (key, _) = self.load_key(handle)?;
        let signer_name = public_area(&key.to_public_key(), APP_KEY_ATTRIBUTES)
            .name()
            .map_err(|e| TpmError::QuoteFailed(e.to_string()))?;
        let values = self
            .pcrs
            .read(&selection.pcrs)
            .map_err(|e| TpmError::QuoteFailed(format!("{e:#}")))?;
        let bank = PcrBank {
            selection: selection.clone(),
            values,
        };

        let attest = TpmsAttest {
            qualified_signer: signer_name,
            extra_data: nonce.to_vec(),
            clock_info: clock_info(),
            firmware_version: SAMPLE_FIRMWARE_VERSION,
            attested: Attested::Quote {
                pcr_select: vec![selection.clone()],
                pcr_digest: bank.composite_digest(HashAlgorithm::Sha256),
            },
        };
        let message = attest
            .marshal()
            .map_err(|e| TpmError::QuoteFailed(e.to_string()))?;
        let signature = sign(&key, &message).map_err(TpmError::QuoteFailed)?;
        let pcr_digest_set = bank
            .marshal()
            .map_err(|e| TpmError::QuoteFailed(e.to_string()))?;

        Ok(Quote {
            message,
            signature,
            pcr_digest_set,
        })
    }
}

impl AttestationKeyOperations for SampleTpm {
    fn ak_public(&mut self) -> Result<RsaPublicKey> {
        Ok(self.attestation_key()?.to_public_key())
    }

    fn load_app_key(&mut self, handle: PersistentHandle) -> Result<AppKeyMaterial> {
        self.read_app_key(handle)
    }

    fn certify(&mut self, handle: PersistentHandle, qualifying_data: &[u8]) -> Result<Certification> {
        let (key, _) = self.load_key(handle)?;
        let name = public_area(&key.to_public_key(), APP_KEY_ATTRIBUTES)
            .name()
            .map_err(|e| TpmError::CertifyFailed(e.to_string()))?;
        let mut qualified = OWNER_HIERARCHY.to_be_bytes().to_vec();
        qualified.extend_from_slice(&name);
        let mut qualified_name = TPM_ALG_SHA256.to_be_bytes().to_vec();
        qualified_name.extend(HashAlgorithm::Sha256.digest(&qualified));

        let ak = self.attestation_key()?.clone();
        let signer_name = public_area(&ak.to_public_key(), ATTESTATION_KEY_ATTRIBUTES)
            .name()
            .map_err(|e| TpmError::CertifyFailed(e.to_string()))?;

        let attest = TpmsAttest {
            qualified_signer: signer_name,
            extra_data: qualifying_data.to_vec(),
            clock_info: clock_info(),
            firmware_version: SAMPLE_FIRMWARE_VERSION,
            attested: Attested::Certify {
                name,
                qualified_name,
            },
        };
        let certify_data = attest
            .marshal()
            .map_err(|e| TpmError::CertifyFailed(e.to_string()))?;
        let signature = sign(&ak, &certify_data).map_err(TpmError::CertifyFailed)?;

        Ok(Certification {
            certify_data,
            signature,
        })
    }
}
