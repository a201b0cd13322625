// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//
use crate::error::{Result, TpmError};
use crate::tpm::utils::*;
use crate::types::{AkSource, AppKeyMaterial, AppKeyStamp, Certification, PersistentHandle};
use crate::{AppKeyOperations, AttestationKeyOperations};
use chrono::{DateTime, Utc};
use rsa::RsaPublicKey;
use sovereign_types::evidence::public_key_to_pem;
use sovereign_types::tpm_structs::{PcrBank, PcrSelection, TPM_ALG_SHA256};
use sovereign_types::Quote;
use std::fs::File;
use std::path::{Path, PathBuf};
use tss_esapi::handles::KeyHandle;
use tss_esapi::structures::{Private, Public};
use tss_esapi::traits::UnMarshall;
use tss_esapi::Context as TssContext;

mod utils;

#[derive(serde::Deserialize)]
struct AgentDataFile {
    ak_hash_alg: String,
    ak_sign_alg: String,
    ak_public: Vec<u8>,
    ak_private: Vec<u8>,
    #[allow(dead_code)]
    ek_hash: Vec<u8>,
}

pub fn detect_platform() -> bool {
    Path::new("/dev/tpmrm0").exists() || Path::new("/dev/tpm0").exists()
}

/// Hardware TPM reached through tss-esapi. A fresh ESYS context is opened
/// per operation, callers serialise operations.
pub struct TpmDevice {
    tcti: Option<String>,
    ak_source: AkSource,
    key_state_dir: PathBuf,
    generated_ak: Option<AttestationKey>,
}

impl TpmDevice {
    pub fn new(tcti: Option<String>, ak_source: AkSource, key_state_dir: PathBuf) -> Result<Self> {
        if tcti.is_none() && std::env::var("TEST_TCTI").is_err() && !detect_platform() {
            return Err(TpmError::TpmUnavailable("no TPM device found".into()));
        }
        Ok(Self {
            tcti,
            ak_source,
            key_state_dir,
            generated_ak: None,
        })
    }

    fn context(&self) -> Result<TssContext> {
        create_ctx(self.tcti.as_deref()).map_err(|e| TpmError::TpmUnavailable(format!("{e:#}")))
    }

    fn load_ak(&mut self, ctx: &mut TssContext) -> anyhow::Result<KeyHandle> {
        match &self.ak_source {
            AkSource::Persistent { handle } => Ok(persistent_object(ctx, handle.raw())?.into()),
            AkSource::KeylimeAgentData { path } => {
                let file = File::open(path)
                    .map_err(|e| anyhow::anyhow!("Open {} failed: {e}", path.display()))?;
                let ad: AgentDataFile = serde_json::from_reader(file)
                    .map_err(|e| anyhow::anyhow!("Parse {} failed: {e}", path.display()))?;
                if ad.ak_hash_alg != "Sha256" || ad.ak_sign_alg != "RsaSsa" {
                    anyhow::bail!(
                        "Unexpected ak params hash/sign: {}/{}",
                        ad.ak_hash_alg,
                        ad.ak_sign_alg
                    );
                }
                let ak = AttestationKey {
                    ak_private: Private::try_from(ad.ak_private)?,
                    ak_public: Public::unmarshall(&ad.ak_public)?,
                };
                load_attestation_key(ctx, ak)
            }
            AkSource::Generated => {
                let ak = match &self.generated_ak {
                    Some(ak) => ak.clone(),
                    None => {
                        log::info!("Creating a new AK under the EK");
                        let ak = generate_rsa_ak(ctx)?;
                        self.generated_ak = Some(ak.clone());
                        ak
                    }
                };
                load_attestation_key(ctx, ak)
            }
        }
    }

    fn app_key(&self, ctx: &mut TssContext, handle: PersistentHandle) -> Result<AppKeyMaterial> {
        let object = persistent_object(ctx, handle.raw())
            .map_err(|e| TpmError::KeyNotFound(format!("{e:#}")))?;
        let (public, tpm_public) =
            read_public(ctx, object).map_err(|e| TpmError::KeyNotFound(format!("{e:#}")))?;
        let public_pem =
            public_key_to_pem(&public).map_err(|e| TpmError::KeyNotFound(e.to_string()))?;

        // Keys without a matching stamp are of unknown age and count as stale.
        let created_at = AppKeyStamp::created_at(&self.key_state_dir, handle, &public_pem)
            .unwrap_or_else(|| DateTime::<Utc>::from(std::time::UNIX_EPOCH));

        Ok(AppKeyMaterial {
            handle,
            public_pem,
            tpm_public,
            created_at,
        })
    }
}

impl AppKeyOperations for TpmDevice {
    fn create_app_key(&mut self, handle: PersistentHandle) -> Result<AppKeyMaterial> {
        let mut ctx = self.context()?;
        create_persistent_app_key(&mut ctx, handle.raw())
            .map_err(|e| TpmError::KeyCreationFailed(format!("{e:#}")))?;
        let mut material = self.app_key(&mut ctx, handle)?;
        material.created_at = Utc::now();
        if let Err(e) = AppKeyStamp::store(
            &self.key_state_dir,
            handle,
            &material.public_pem,
            material.created_at,
        ) {
            log::warn!("App Key at {handle} will not survive a restart: {e}");
        }
        Ok(material)
    }

    fn read_app_key(&mut self, handle: PersistentHandle) -> Result<AppKeyMaterial> {
        let mut ctx = self.context()?;
        self.app_key(&mut ctx, handle)
    }

    fn quote(
        &mut self,
        handle: PersistentHandle,
        nonce: &[u8],
        selection: &PcrSelection,
    ) -> Result<Quote> {
        if selection.hash != TPM_ALG_SHA256 {
            return Err(TpmError::InvalidSelection(
                "only the SHA-256 bank is quoted".into(),
            ));
        }
        let mut ctx = self.context()?;
        let key = persistent_object(&mut ctx, handle.raw())
            .map_err(|e| TpmError::KeyNotFound(format!("{e:#}")))?;

        let (message, signature) = quote(&mut ctx, key.into(), nonce, &selection.pcrs)
            .map_err(|e| TpmError::QuoteFailed(format!("{e:#}")))?;
        let values = read_pcrs(&mut ctx, &selection.pcrs)
            .map_err(|e| TpmError::QuoteFailed(format!("{e:#}")))?;
        let pcr_digest_set = PcrBank {
            selection: selection.clone(),
            values,
        }
        .marshal()
        .map_err(|e| TpmError::QuoteFailed(e.to_string()))?;

        Ok(Quote {
            message,
            signature,
            pcr_digest_set,
        })
    }
}

impl AttestationKeyOperations for TpmDevice {
    fn ak_public(&mut self) -> Result<RsaPublicKey> {
        let mut ctx = self.context()?;
        let ak = self
            .load_ak(&mut ctx)
            .map_err(|e| TpmError::TpmUnavailable(format!("load AK: {e:#}")))?;
        let (public, _) = read_public(&mut ctx, ak.into())
            .map_err(|e| TpmError::TpmUnavailable(format!("read AK: {e:#}")))?;
        Ok(public)
    }

    fn ek_certificate(&mut self) -> Result<Option<String>> {
        let mut ctx = self.context()?;
        match dump_ek_cert_pem(&mut ctx) {
            Ok(pem) => Ok(Some(pem)),
            Err(e) => {
                log::warn!("Read EK certificate failed: {e:#}");
                Ok(None)
            }
        }
    }

    fn load_app_key(&mut self, handle: PersistentHandle) -> Result<AppKeyMaterial> {
        let mut ctx = self.context()?;
        self.app_key(&mut ctx, handle)
    }

    fn certify(&mut self, handle: PersistentHandle, qualifying_data: &[u8]) -> Result<Certification> {
        let mut ctx = self.context()?;
        let object = persistent_object(&mut ctx, handle.raw())
            .map_err(|e| TpmError::KeyNotFound(format!("{e:#}")))?;
        let ak = self
            .load_ak(&mut ctx)
            .map_err(|e| TpmError::CertifyFailed(format!("load AK: {e:#}")))?;

        let (certify_data, signature) = certify(&mut ctx, object, ak, qualifying_data)
            .map_err(|e| TpmError::CertifyFailed(format!("{e:#}")))?;
        if !matches!(self.ak_source, AkSource::Persistent { .. }) {
            if let Err(e) = ctx.flush_context(ak.into()) {
                log::warn!("Flush AK context failed: {e}");
            }
        }

        Ok(Certification {
            certify_data,
            signature,
        })
    }
}
