// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::{Context, Result};
use rsa::RsaPublicKey;
use sovereign_types::evidence::parse_public_key_pem;

use crate::config::PlatformConfig;

/// A platform whose AK is trusted to certify App Keys.
#[derive(Debug, Clone)]
pub struct RegisteredPlatform {
    pub id: String,
    pub ak: RsaPublicKey,
}

/// Known AKs. Verification keys only ever come from here, never from the
/// evidence.
#[derive(Debug, Clone, Default)]
pub struct PlatformRegistry {
    platforms: Vec<RegisteredPlatform>,
}

impl PlatformRegistry {
    pub fn new(platforms: Vec<RegisteredPlatform>) -> Self {
        Self { platforms }
    }

    pub fn from_config(platforms: &[PlatformConfig]) -> Result<Self> {
        let platforms = platforms
            .iter()
            .map(|p| {
                let pem = p.ak_public_pem()?;
                let ak = parse_public_key_pem("ak_public", &pem)
                    .with_context(|| format!("AK of platform {}", p.id))?;
                Ok(RegisteredPlatform {
                    id: p.id.clone(),
                    ak,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { platforms })
    }

    /// Platforms worth trying for a certificate. The `hint` narrows the
    /// search to the registered platform holding that AK.
    pub fn candidates(&self, hint: Option<&RsaPublicKey>) -> Vec<&RegisteredPlatform> {
        self.platforms
            .iter()
            .filter(|p| hint.map_or(true, |ak| &p.ak == ak))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.platforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use rsa::RsaPrivateKey;

    use super::*;

    fn platform(id: &str) -> RegisteredPlatform {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        RegisteredPlatform {
            id: id.to_string(),
            ak: key.to_public_key(),
        }
    }

    #[test]
    fn test_hint_narrows_candidates() {
        let registry = PlatformRegistry::new(vec![platform("a"), platform("b")]);
        assert_eq!(registry.candidates(None).len(), 2);

        let b = registry.candidates(None)[1].ak.clone();
        let ids: Vec<_> = registry
            .candidates(Some(&b))
            .into_iter()
            .map(|p| p.id.as_str())
            .collect();
        assert_eq!(ids, vec!["b"]);

        let stranger = platform("c").ak;
        assert_eq!(registry.candidates(Some(&stranger)).len(), 0);
    }

    #[test]
    fn test_from_config_rejects_bad_pem() {
        let platforms = vec![PlatformConfig {
            id: "broken".to_string(),
            ak_public: Some("-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----".into()),
            ak_public_path: None,
            facts: None,
        }];
        assert!(PlatformRegistry::from_config(&platforms).is_err());
    }
}
