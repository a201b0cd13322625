// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::error::TpmError;

/// First and last handle of the TPM persistent object range.
const PERSISTENT_FIRST: u32 = 0x8100_0000;
const PERSISTENT_LAST: u32 = 0x81FF_FFFF;

/// A TPM persistent object handle (`0x81000000..=0x81FFFFFF`).
///
/// Accepted as an integer or as a (`0x` prefixed) hex string, displayed as
/// `0x8101000B`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PersistentHandle(u32);

impl PersistentHandle {
    pub const DEFAULT_APP_KEY: PersistentHandle = PersistentHandle(0x8101_000B);

    pub fn new(raw: u32) -> Result<Self, TpmError> {
        if !(PERSISTENT_FIRST..=PERSISTENT_LAST).contains(&raw) {
            return Err(TpmError::KeyNotFound(format!(
                "{raw:#010X} is not a persistent handle"
            )));
        }
        Ok(Self(raw))
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl Default for PersistentHandle {
    fn default() -> Self {
        Self::DEFAULT_APP_KEY
    }
}

impl fmt::Display for PersistentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl FromStr for PersistentHandle {
    type Err = TpmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => s.parse::<u32>(),
        };
        let raw = parsed.map_err(|_| TpmError::KeyNotFound(format!("{s:?} is not a handle")))?;
        Self::new(raw)
    }
}

impl<'de> Deserialize<'de> for PersistentHandle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u32),
            Str(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(raw) => PersistentHandle::new(raw),
            Raw::Str(s) => s.parse(),
        }
        .map_err(serde::de::Error::custom)
    }
}

impl Serialize for PersistentHandle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Public view of an App Key. The private part stays in the TPM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppKeyMaterial {
    pub handle: PersistentHandle,
    /// SubjectPublicKeyInfo PEM.
    pub public_pem: String,
    /// Marshalled `TPMT_PUBLIC`.
    pub tpm_public: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Creation time of the App Key at a handle, kept beside the TPM since the
/// TPM does not record it. Bound to the key by its public PEM digest so a key
/// replaced behind our back is not mistaken for a fresh one.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct AppKeyStamp {
    pub public_sha256: String,
    pub created_at: String,
}

impl AppKeyStamp {
    fn path(dir: &Path, handle: PersistentHandle) -> PathBuf {
        dir.join(format!("{:08x}.created", handle.raw()))
    }

    fn digest(public_pem: &str) -> String {
        hex::encode(Sha256::digest(public_pem.as_bytes()))
    }

    pub fn store(
        dir: &Path,
        handle: PersistentHandle,
        public_pem: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), TpmError> {
        let stamp = AppKeyStamp {
            public_sha256: Self::digest(public_pem),
            created_at: created_at.to_rfc3339(),
        };
        let path = Self::path(dir, handle);
        fs::create_dir_all(dir)
            .and_then(|_| {
                fs::write(
                    &path,
                    serde_json::to_vec(&stamp).map_err(std::io::Error::other)?,
                )
            })
            .map_err(|e| {
                TpmError::KeyCreationFailed(format!("record {}: {e}", path.display()))
            })
    }

    /// Recorded creation time of the key whose public PEM is `public_pem`,
    /// if one was recorded for that very key.
    pub fn created_at(
        dir: &Path,
        handle: PersistentHandle,
        public_pem: &str,
    ) -> Option<DateTime<Utc>> {
        let raw = fs::read(Self::path(dir, handle)).ok()?;
        let stamp: AppKeyStamp = serde_json::from_slice(&raw).ok()?;
        if stamp.public_sha256 != Self::digest(public_pem) {
            return None;
        }
        DateTime::parse_from_rfc3339(&stamp.created_at)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Output of `TPM2_Certify`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certification {
    /// Marshalled `TPMS_ATTEST` of type `TPM_ST_ATTEST_CERTIFY`.
    pub certify_data: Vec<u8>,
    /// Marshalled `TPMT_SIGNATURE`.
    pub signature: Vec<u8>,
}

/// Where the certifier finds the platform Attestation Key.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AkSource {
    /// AK already persisted in the TPM.
    Persistent { handle: PersistentHandle },

    /// AK blobs written by the keylime agent.
    KeylimeAgentData {
        #[serde(default = "default_keylime_agent_data")]
        path: PathBuf,
    },

    /// Fresh AK created under the EK when the backend is opened.
    Generated,
}

pub const KEYLIME_AGENT_DATA_PATH: &str = "/var/lib/keylime/agent_data.json";

fn default_keylime_agent_data() -> PathBuf {
    PathBuf::from(KEYLIME_AGENT_DATA_PATH)
}

impl Default for AkSource {
    fn default() -> Self {
        AkSource::KeylimeAgentData {
            path: default_keylime_agent_data(),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("0x8101000B", Some(0x8101_000B))]
    #[case("0x8101000b", Some(0x8101_000B))]
    #[case("2164326411", Some(0x8101_000B))]
    #[case("0x40000001", None)]
    #[case("handle", None)]
    fn test_parse_handle(#[case] raw: &str, #[case] expected: Option<u32>) {
        assert_eq!(raw.parse::<PersistentHandle>().ok().map(|h| h.raw()), expected);
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(PersistentHandle::default().to_string(), "0x8101000B");
    }

    #[test]
    fn test_handle_deserialize_int_or_string() {
        let from_int: PersistentHandle = serde_json::from_str("2164326411").unwrap();
        let from_str: PersistentHandle = serde_json::from_str("\"0x8101000B\"").unwrap();
        assert_eq!(from_int, from_str);
        assert!(serde_json::from_str::<PersistentHandle>("1").is_err());
    }

    #[test]
    fn test_app_key_stamp_bound_to_key() {
        let dir = tempfile::tempdir().unwrap();
        let handle = PersistentHandle::default();
        let created_at = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        assert_eq!(AppKeyStamp::created_at(dir.path(), handle, "pem-a"), None);
        AppKeyStamp::store(dir.path(), handle, "pem-a", created_at).unwrap();
        assert_eq!(
            AppKeyStamp::created_at(dir.path(), handle, "pem-a"),
            Some(created_at)
        );
        assert_eq!(AppKeyStamp::created_at(dir.path(), handle, "pem-b"), None);
    }

    #[test]
    fn test_ak_source_forms() {
        let src: AkSource =
            serde_json::from_str(r#"{"kind": "persistent", "handle": "0x81010002"}"#).unwrap();
        assert_eq!(
            src,
            AkSource::Persistent {
                handle: PersistentHandle::new(0x8101_0002).unwrap()
            }
        );
        let src: AkSource = serde_json::from_str(r#"{"kind": "keylime_agent_data"}"#).unwrap();
        assert_eq!(src, AkSource::default());
    }
}
