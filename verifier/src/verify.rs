// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Evidence verification.
//!
//! Steps run strictly in order and the first failure ends the verification:
//! 1. the App Key certificate was produced by a registered AK and names the
//!    App Key of the bundle,
//! 2. the quote is signed by that App Key over the supplied PCR values,
//! 3. the quote is bound to the request nonce, which was not seen before,
//! 4. the facts about the platform resolve.
//!
//! Everything is decoded before step 1, so malformed input never reaches the
//! cryptographic checks.

use log::debug;
use rsa::{
    pkcs1v15::{Signature, VerifyingKey},
    signature::Verifier,
    RsaPublicKey,
};
use sha2::Sha256;
use sovereign_types::{
    evidence::{decode_nonce, parse_public_key_pem},
    protocol::{EvidenceData, VerificationDetails},
    tpm_structs::{
        Attested, PcrBank, RsaPublicArea, RsaSignature, TpmsAttest, OBJECT_FIXED_TPM,
        OBJECT_RESTRICTED, OBJECT_SIGN, TPM_ALG_SHA256,
    },
    AppKeyCertificate, AttestedClaims, HashAlgorithm, Quote,
};
use std::str::FromStr;

use crate::{
    error::VerifyError,
    facts::FactProvider,
    nonce_cache::NonceCache,
    registry::{PlatformRegistry, RegisteredPlatform},
};

/// Outcome of a successful verification.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedEvidence {
    pub platform_id: String,
    pub claims: AttestedClaims,
}

/// The evidence fields in decoded form.
struct ParsedEvidence {
    nonce: Vec<u8>,
    quote: Quote,
    app_key_public: RsaPublicKey,
    certificate: AppKeyCertificate,
    ak_hint: Option<RsaPublicKey>,
}

impl TryFrom<&EvidenceData> for ParsedEvidence {
    type Error = VerifyError;

    fn try_from(data: &EvidenceData) -> Result<Self, Self::Error> {
        if !data.hash_alg.is_empty() {
            match HashAlgorithm::from_str(&data.hash_alg.to_lowercase()) {
                Ok(HashAlgorithm::Sha256) => {}
                _ => return Err(VerifyError::UnsupportedHashAlgorithm(data.hash_alg.clone())),
            }
        }
        let nonce = decode_nonce(&data.nonce)?;
        let quote = Quote::from_str(&data.quote)?;
        let app_key_public = parse_public_key_pem("app_key_public", &data.app_key_public)?;
        let certificate = AppKeyCertificate::decode(&data.app_key_certificate)?;
        let ak_hint = data
            .tpm_ak
            .as_deref()
            .filter(|pem| !pem.trim().is_empty())
            .map(|pem| parse_public_key_pem("tpm_ak", pem))
            .transpose()?;

        Ok(Self {
            nonce,
            quote,
            app_key_public,
            certificate,
            ak_hint,
        })
    }
}

/// PKCS#1 v1.5 / SHA-256 check of a marshalled RSASSA `TPMT_SIGNATURE`.
fn verify_rsassa(key: &RsaPublicKey, message: &[u8], signature: &RsaSignature) -> bool {
    if signature.hash != TPM_ALG_SHA256 {
        return false;
    }
    let Ok(signature) = Signature::try_from(signature.signature.as_slice()) else {
        return false;
    };
    VerifyingKey::<Sha256>::new(key.clone())
        .verify(message, &signature)
        .is_ok()
}

pub struct EvidenceVerifier {
    registry: PlatformRegistry,
    nonces: NonceCache,
    facts: Box<dyn FactProvider>,
}

impl EvidenceVerifier {
    pub fn new(registry: PlatformRegistry, nonces: NonceCache, facts: Box<dyn FactProvider>) -> Self {
        Self {
            registry,
            nonces,
            facts,
        }
    }

    /// Verify `data`, recording in `details` every check that passed.
    pub async fn verify(
        &self,
        data: &EvidenceData,
        details: &mut VerificationDetails,
    ) -> Result<VerifiedEvidence, VerifyError> {
        let evidence = ParsedEvidence::try_from(data)?;

        let (platform, app_key) = self.verify_certificate(&evidence, details)?;
        let attest = self.verify_quote(&evidence, &app_key)?;
        details.quote_signature_valid = true;

        if attest.extra_data != evidence.nonce {
            return Err(VerifyError::InvalidNonce(
                "quote is bound to a different nonce".to_string(),
            ));
        }
        if !self.nonces.insert(&evidence.nonce) {
            return Err(VerifyError::InvalidNonce(
                "nonce was already used".to_string(),
            ));
        }
        details.nonce_valid = true;

        let claims = self
            .facts
            .claims(&platform.id)
            .await
            .map_err(|e| VerifyError::UpstreamUnavailable(e.to_string()))?;

        Ok(VerifiedEvidence {
            platform_id: platform.id.clone(),
            claims: claims.normalized(),
        })
    }

    /// Step 1. Returns the platform whose AK signed the certificate and the
    /// App Key the certificate vouches for.
    fn verify_certificate(
        &self,
        evidence: &ParsedEvidence,
        details: &mut VerificationDetails,
    ) -> Result<(&RegisteredPlatform, RsaPublicKey), VerifyError> {
        let invalid = |reason: &str| VerifyError::CertificateChainInvalid(reason.to_string());
        let certificate = &evidence.certificate;

        let signature = RsaSignature::unmarshal(&certificate.signature)
            .map_err(|e| invalid(&format!("certificate signature: {e}")))?;
        let platform = self
            .registry
            .candidates(evidence.ak_hint.as_ref())
            .into_iter()
            .find(|p| verify_rsassa(&p.ak, &certificate.certify_data, &signature))
            .ok_or_else(|| invalid("not signed by a registered AK"))?;
        debug!("App Key certificate signed by the AK of {}", platform.id);

        let attest = TpmsAttest::unmarshal(&certificate.certify_data)
            .map_err(|e| invalid(&format!("certify data: {e}")))?;
        let Attested::Certify { name, .. } = &attest.attested else {
            return Err(invalid("certify data is not a certification"));
        };
        if attest.extra_data != AppKeyCertificate::qualifying_data(&certificate.app_key_public) {
            return Err(invalid("certify data does not bind the App Key"));
        }

        let area = RsaPublicArea::unmarshal(&certificate.app_key_tpm_public)
            .map_err(|e| invalid(&format!("App Key public area: {e}")))?;
        let area_name = area
            .name()
            .map_err(|e| invalid(&format!("App Key name: {e}")))?;
        if &area_name != name {
            return Err(invalid("certified name is not the App Key's"));
        }
        if area.object_attributes & (OBJECT_FIXED_TPM | OBJECT_SIGN) != (OBJECT_FIXED_TPM | OBJECT_SIGN)
            || area.object_attributes & OBJECT_RESTRICTED != 0
        {
            return Err(invalid("App Key is not a TPM-bound unrestricted signing key"));
        }

        let certified_key = area
            .rsa_public_key()
            .map_err(|e| invalid(&format!("App Key public area: {e}")))?;
        let named_key = parse_public_key_pem("certificate app_key_public", &certificate.app_key_public)
            .map_err(|e| invalid(&e.to_string()))?;
        if certified_key != named_key {
            return Err(invalid("certified key differs from the certificate's App Key"));
        }
        details.app_key_certificate_valid = true;

        if named_key != evidence.app_key_public {
            return Err(invalid("app_key_public differs from the certified App Key"));
        }
        details.app_key_public_matches_cert = true;

        Ok((platform, certified_key))
    }

    /// Step 2. Returns the attested quote structure.
    fn verify_quote(
        &self,
        evidence: &ParsedEvidence,
        app_key: &RsaPublicKey,
    ) -> Result<TpmsAttest, VerifyError> {
        let mismatch = |reason: String| VerifyError::SignatureMismatch(reason);
        let quote = &evidence.quote;

        let signature = RsaSignature::unmarshal(&quote.signature)
            .map_err(|e| mismatch(format!("quote signature: {e}")))?;
        if !verify_rsassa(app_key, &quote.message, &signature) {
            return Err(mismatch("quote is not signed by the App Key".to_string()));
        }

        let attest = TpmsAttest::unmarshal(&quote.message)
            .map_err(|e| mismatch(format!("quote message: {e}")))?;
        let Attested::Quote {
            pcr_select,
            pcr_digest,
        } = &attest.attested
        else {
            return Err(mismatch("quote message is not a quote".to_string()));
        };

        let bank = PcrBank::unmarshal(&quote.pcr_digest_set)
            .map_err(|e| mismatch(format!("PCR values: {e}")))?;
        if pcr_select.as_slice() != std::slice::from_ref(&bank.selection) {
            return Err(mismatch("PCR values do not match the quoted selection".to_string()));
        }
        if &bank.composite_digest(HashAlgorithm::Sha256) != pcr_digest {
            return Err(mismatch("PCR values do not match the quoted digest".to_string()));
        }

        Ok(attest)
    }
}
