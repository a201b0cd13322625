// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::{Context, Result};
use serde::Deserialize;
use sovereign_types::{AttestedClaims, FeatureFlags};
use std::{path::PathBuf, time::Duration};
use strum::{AsRefStr, Display, EnumString};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sovereign-attestation/verifier.toml";
pub const DEFAULT_BIND: &str = "127.0.0.1:8443";

/// Matches the attestation request timeout of the issuance gate.
const DEFAULT_NONCE_TTL_SECS: u64 = 30;

#[derive(Debug, Deserialize, Clone)]
pub struct VerifierConfig {
    #[serde(default)]
    pub feature_flags: FeatureFlags,

    #[serde(default = "default_bind")]
    pub bind: String,

    /// Serve HTTPS when set.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    #[serde(default = "default_nonce_ttl_secs")]
    pub nonce_ttl_secs: u64,

    #[serde(default)]
    pub fact_provider: FactProviderKind,

    /// Platforms whose AK is trusted to certify App Keys.
    #[serde(default)]
    pub platforms: Vec<PlatformConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Deserialize, EnumString, AsRefStr, Display, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FactProviderKind {
    /// Fixed claims for every platform.
    #[default]
    Stub,

    /// Per-platform facts from the `platforms` table.
    Registry,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlatformConfig {
    pub id: String,

    /// AK public key PEM, as exported by `delegated-certifier --export-ak`.
    #[serde(default)]
    pub ak_public: Option<String>,

    #[serde(default)]
    pub ak_public_path: Option<PathBuf>,

    /// Facts served by the registry fact provider.
    #[serde(default)]
    pub facts: Option<AttestedClaims>,
}

impl PlatformConfig {
    pub fn ak_public_pem(&self) -> Result<String> {
        match (&self.ak_public, &self.ak_public_path) {
            (Some(pem), _) => Ok(pem.clone()),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("read AK of platform {}: {}", self.id, path.display())),
            (None, None) => anyhow::bail!("platform {} has no AK configured", self.id),
        }
    }
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

fn default_nonce_ttl_secs() -> u64 {
    DEFAULT_NONCE_TTL_SECS
}

impl VerifierConfig {
    pub fn nonce_ttl(&self) -> Duration {
        Duration::from_secs(self.nonce_ttl_secs)
    }
}

pub fn load_config(path: &str) -> Result<VerifierConfig> {
    let settings = ::config::Config::builder()
        .add_source(::config::File::with_name(path).required(false))
        .build()
        .context(format!("failed to load verifier config: {}", path))?;

    let cfg: VerifierConfig = settings
        .try_deserialize()
        .context("failed to deserialize verifier config")?;

    Ok(cfg)
}
