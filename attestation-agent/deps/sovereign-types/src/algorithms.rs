// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};
use strum::{AsRefStr, Display, EnumString};

use crate::tpm_structs::{TPM_ALG_SHA256, TPM_ALG_SHA384, TPM_ALG_SHA512};

/// Hash algorithms a quote, a certify structure or a TPM Name may be computed with.
#[derive(
    EnumString, AsRefStr, Serialize, Deserialize, Clone, Debug, Display, Copy, PartialEq, Eq, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    #[strum(serialize = "sha256")]
    Sha256,

    #[strum(serialize = "sha384")]
    Sha384,

    #[strum(serialize = "sha512")]
    Sha512,
}

fn hash_material<D: Digest>(material: &[u8]) -> Vec<u8> {
    D::new().chain_update(material).finalize().to_vec()
}

impl HashAlgorithm {
    /// Return the hash value length in bytes
    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    pub fn digest(&self, material: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => hash_material::<Sha256>(material),
            HashAlgorithm::Sha384 => hash_material::<Sha384>(material),
            HashAlgorithm::Sha512 => hash_material::<Sha512>(material),
        }
    }

    /// The `TPM_ALG_ID` of this algorithm.
    pub fn tpm_alg_id(&self) -> u16 {
        match self {
            HashAlgorithm::Sha256 => TPM_ALG_SHA256,
            HashAlgorithm::Sha384 => TPM_ALG_SHA384,
            HashAlgorithm::Sha512 => TPM_ALG_SHA512,
        }
    }

    pub fn from_tpm_alg_id(id: u16) -> Option<Self> {
        match id {
            TPM_ALG_SHA256 => Some(HashAlgorithm::Sha256),
            TPM_ALG_SHA384 => Some(HashAlgorithm::Sha384),
            TPM_ALG_SHA512 => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }
}
