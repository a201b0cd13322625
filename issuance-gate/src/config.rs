// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::{Context, Result};
use serde::Deserialize;
use sovereign_types::FeatureFlags;
use std::{path::PathBuf, time::Duration};

use crate::policy::PolicyConfig;

pub const DEFAULT_ISSUANCE_CONFIG_PATH: &str = "/etc/sovereign-attestation/issuance.toml";
pub const DEFAULT_VERIFIER_URL: &str = "https://127.0.0.1:8443";

/// Environment variables with this prefix override file values, e.g.
/// `SOVEREIGN_ISSUANCE__VERIFIER_URL`.
pub const ISSUANCE_ENV_PREFIX: &str = "SOVEREIGN_ISSUANCE";

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct IssuanceConfig {
    #[serde(default)]
    pub feature_flags: FeatureFlags,

    /// Base URL of the evidence verifier.
    #[serde(default = "default_verifier_url")]
    pub verifier_url: String,

    /// Extra root certificate (PEM) trusted for the verifier's TLS endpoint.
    #[serde(default)]
    pub verifier_ca_path: Option<PathBuf>,

    /// Bounds the verifier call and the lifetime of minted challenges.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Reject requests without evidence while Unified-Identity is enabled.
    #[serde(default)]
    pub require_attestation: bool,

    #[serde(default)]
    pub policy: PolicyConfig,
}

fn default_verifier_url() -> String {
    DEFAULT_VERIFIER_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            feature_flags: FeatureFlags::default(),
            verifier_url: default_verifier_url(),
            verifier_ca_path: None,
            timeout_secs: default_timeout_secs(),
            require_attestation: false,
            policy: PolicyConfig::default(),
        }
    }
}

impl IssuanceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl TryFrom<&str> for IssuanceConfig {
    type Error = anyhow::Error;

    fn try_from(config_path: &str) -> Result<Self, Self::Error> {
        let c = config::Config::builder()
            .add_source(config::File::with_name(config_path))
            .add_source(
                config::Environment::with_prefix(ISSUANCE_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("failed to load issuance config: {config_path}"))?;

        c.try_deserialize()
            .context("failed to deserialize issuance config")
    }
}
