// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Evidence produced on the attested node and the encodings it travels in.

use std::{fmt, str::FromStr};

use base64::{engine::general_purpose::STANDARD, Engine};
use rsa::{
    pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding},
    RsaPublicKey,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{algorithms::HashAlgorithm, tpm_structs::StructError};

/// Upper bound of the textual quote accepted by any decoder.
pub const MAX_QUOTE_LEN: usize = 64 * 1024;

/// Shortest nonce, in bytes, an attestation attempt may be bound to.
pub const MIN_NONCE_LEN: usize = 16;

/// Longest nonce, in bytes, that fits `TPMS_ATTEST.extraData`.
pub const MAX_NONCE_LEN: usize = 64;

#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("{field} is not valid base64")]
    Base64 {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    #[error("{field} is not valid hex")]
    Hex {
        field: &'static str,
        #[source]
        source: hex::FromHexError,
    },

    #[error("{field} is not valid JSON")]
    Json {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} is not an RSA SubjectPublicKeyInfo PEM")]
    Pem(&'static str),

    #[error("quote is not in the `r<message>:<signature>:<pcrs>` form")]
    QuoteFormat,

    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{0} exceeds the maximum size")]
    TooLarge(&'static str),

    #[error("nonce must be between {MIN_NONCE_LEN} and {MAX_NONCE_LEN} bytes, got {0}")]
    NonceLength(usize),

    #[error(transparent)]
    Struct(#[from] StructError),
}

pub fn decode_base64(field: &'static str, value: &str) -> Result<Vec<u8>, EncodingError> {
    STANDARD
        .decode(value.trim())
        .map_err(|source| EncodingError::Base64 { field, source })
}

/// Decode a hex nonce and check its length.
pub fn decode_nonce(value: &str) -> Result<Vec<u8>, EncodingError> {
    if value.is_empty() {
        return Err(EncodingError::Missing("nonce"));
    }
    let nonce = hex::decode(value).map_err(|source| EncodingError::Hex {
        field: "nonce",
        source,
    })?;
    if !(MIN_NONCE_LEN..=MAX_NONCE_LEN).contains(&nonce.len()) {
        return Err(EncodingError::NonceLength(nonce.len()));
    }
    Ok(nonce)
}

pub fn parse_public_key_pem(field: &'static str, pem: &str) -> Result<RsaPublicKey, EncodingError> {
    if pem.trim().is_empty() {
        return Err(EncodingError::Missing(field));
    }
    RsaPublicKey::from_public_key_pem(pem.trim()).map_err(|_| EncodingError::Pem(field))
}

pub fn public_key_to_pem(key: &RsaPublicKey) -> Result<String, EncodingError> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|_| EncodingError::Pem("public key"))
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw).map_err(serde::de::Error::custom)
    }
}

/// A TPM quote over a PCR selection, bound to a nonce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Quote {
    /// Marshalled `TPMS_ATTEST` of type `TPM_ST_ATTEST_QUOTE`.
    pub message: Vec<u8>,
    /// Marshalled `TPMT_SIGNATURE`.
    pub signature: Vec<u8>,
    /// Marshalled [`crate::tpm_structs::PcrBank`].
    pub pcr_digest_set: Vec<u8>,
}

impl fmt::Display for Quote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "r{}:{}:{}",
            STANDARD.encode(&self.message),
            STANDARD.encode(&self.signature),
            STANDARD.encode(&self.pcr_digest_set)
        )
    }
}

impl FromStr for Quote {
    type Err = EncodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(EncodingError::Missing("quote"));
        }
        if s.len() > MAX_QUOTE_LEN {
            return Err(EncodingError::TooLarge("quote"));
        }
        let body = s.strip_prefix('r').ok_or(EncodingError::QuoteFormat)?;
        let parts: Vec<&str> = body.split(':').collect();
        let [message, signature, pcrs] = parts[..] else {
            return Err(EncodingError::QuoteFormat);
        };
        Ok(Self {
            message: decode_base64("quote message", message)?,
            signature: decode_base64("quote signature", signature)?,
            pcr_digest_set: decode_base64("quote PCR blob", pcrs)?,
        })
    }
}

/// Statement by the platform AK that an App Key lives in the same TPM.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AppKeyCertificate {
    /// SubjectPublicKeyInfo PEM of the certified App Key.
    pub app_key_public: String,

    /// Marshalled `TPMT_PUBLIC` of the App Key, the preimage of its TPM Name.
    #[serde(with = "base64_bytes")]
    pub app_key_tpm_public: Vec<u8>,

    /// Marshalled `TPMS_ATTEST` returned by `TPM2_Certify`.
    #[serde(with = "base64_bytes")]
    pub certify_data: Vec<u8>,

    /// Marshalled `TPMT_SIGNATURE` of the AK over `certify_data`.
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,

    pub hash_alg: HashAlgorithm,
}

impl AppKeyCertificate {
    /// Wire form: base64 of the JSON object.
    pub fn encode(&self) -> Result<String, EncodingError> {
        let json = serde_json::to_vec(self).map_err(|source| EncodingError::Json {
            field: "app_key_certificate",
            source,
        })?;
        Ok(STANDARD.encode(json))
    }

    pub fn decode(encoded: &str) -> Result<Self, EncodingError> {
        if encoded.is_empty() {
            return Err(EncodingError::Missing("app_key_certificate"));
        }
        let json = decode_base64("app_key_certificate", encoded)?;
        serde_json::from_slice(&json).map_err(|source| EncodingError::Json {
            field: "app_key_certificate",
            source,
        })
    }

    /// The value `TPM2_Certify` is asked to embed as qualifying data.
    pub fn qualifying_data(app_key_public: &str) -> Vec<u8> {
        HashAlgorithm::Sha256.digest(app_key_public.trim().as_bytes())
    }
}

/// Evidence bundle attached to an issuance request. Built once per attempt.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SovereignAttestation {
    /// [`Quote`] in its text form.
    pub quote: String,

    pub app_key_public: String,

    /// [`AppKeyCertificate`] in its wire form.
    pub app_key_certificate: String,

    /// Hex encoded challenge the quote is bound to.
    pub nonce: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_code_hash: Option<String>,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_quote_text_form() {
        let quote = Quote {
            message: vec![1, 2, 3],
            signature: vec![4, 5],
            pcr_digest_set: vec![6],
        };
        let text = quote.to_string();
        assert_eq!(text, "rAQID:BAU=:Bg==");
        assert_eq!(text.parse::<Quote>().unwrap(), quote);
    }

    #[rstest]
    #[case("")]
    #[case("AQID:BAU=:Bg==")]
    #[case("rAQID:BAU=")]
    #[case("rAQID:BAU=:Bg==:AA==")]
    #[case("r!!!:BAU=:Bg==")]
    fn test_quote_rejects_malformed(#[case] raw: &str) {
        assert!(raw.parse::<Quote>().is_err());
    }

    #[test]
    fn test_quote_size_limit() {
        let raw = format!("r{}:AA==:AA==", "A".repeat(MAX_QUOTE_LEN));
        assert!(matches!(
            raw.parse::<Quote>(),
            Err(EncodingError::TooLarge("quote"))
        ));
    }

    #[rstest]
    #[case("", false)]
    #[case("zz", false)]
    #[case("00112233445566778899aabbccddee", false)]
    #[case("00112233445566778899aabbccddeeff", true)]
    fn test_decode_nonce(#[case] raw: &str, #[case] ok: bool) {
        assert_eq!(decode_nonce(raw).is_ok(), ok);
    }

    #[test]
    fn test_certificate_wire_form() {
        let cert = AppKeyCertificate {
            app_key_public: "-----BEGIN PUBLIC KEY-----".into(),
            app_key_tpm_public: vec![0, 1],
            certify_data: vec![0xff, 0x54, 0x43, 0x47],
            signature: vec![7; 4],
            hash_alg: HashAlgorithm::Sha256,
        };
        let encoded = cert.encode().unwrap();
        let json = STANDARD.decode(&encoded).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["certify_data"], "/1RDRw==");
        assert_eq!(value["hash_alg"], "sha256");
        assert_eq!(AppKeyCertificate::decode(&encoded).unwrap(), cert);
        assert!(AppKeyCertificate::decode("not base64!").is_err());
    }

    #[test]
    fn test_parse_public_key_pem_rejects_garbage() {
        assert!(matches!(
            parse_public_key_pem("app_key_public", "  "),
            Err(EncodingError::Missing("app_key_public"))
        ));
        assert!(matches!(
            parse_public_key_pem("app_key_public", "-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----"),
            Err(EncodingError::Pem("app_key_public"))
        ));
    }
}
