// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::Result;
use attester::{AkSource, TpmConfig};
use serde::Deserialize;
use sovereign_types::FeatureFlags;
use std::{path::PathBuf, time::Duration};

use super::{unix_socket_path, DEFAULT_CERTIFIER_SOCKET};
use crate::certification::server::{SocketAccess, DEFAULT_SOCKET_MODE};

pub const DEFAULT_CERTIFIER_CONFIG_PATH: &str = "/etc/sovereign-attestation/certifier.toml";

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 10;

/// Configuration of the delegated certifier, the only process holding the AK.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CertifierConfig {
    #[serde(default)]
    pub feature_flags: FeatureFlags,

    #[serde(default = "default_socket")]
    pub socket: String,

    /// Mode of the socket file, e.g. `0o660`.
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,

    /// Group owning the socket file, so that a non-root agent in that group
    /// can connect.
    #[serde(default)]
    pub socket_gid: Option<u32>,

    /// Certification requests allowed per peer uid and minute. 0 disables
    /// the limit.
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,

    /// Peer uids allowed to request a certification. Empty allows any peer
    /// that can open the socket.
    #[serde(default)]
    pub allowed_uids: Vec<u32>,

    #[serde(default)]
    pub tpm: TpmConfig,

    #[serde(default)]
    pub ak: AkSource,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_socket() -> String {
    DEFAULT_CERTIFIER_SOCKET.to_string()
}

fn default_socket_mode() -> u32 {
    DEFAULT_SOCKET_MODE
}

fn default_rate_limit_per_minute() -> u32 {
    DEFAULT_RATE_LIMIT_PER_MINUTE
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Default for CertifierConfig {
    fn default() -> Self {
        Self {
            feature_flags: FeatureFlags::default(),
            socket: default_socket(),
            socket_mode: DEFAULT_SOCKET_MODE,
            socket_gid: None,
            rate_limit_per_minute: DEFAULT_RATE_LIMIT_PER_MINUTE,
            allowed_uids: Vec::new(),
            tpm: TpmConfig::default(),
            ak: AkSource::default(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl CertifierConfig {
    pub fn socket_path(&self) -> Result<PathBuf> {
        unix_socket_path(&self.socket)
    }

    pub fn socket_access(&self) -> SocketAccess {
        SocketAccess {
            mode: self.socket_mode,
            gid: self.socket_gid,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl TryFrom<&str> for CertifierConfig {
    type Error = anyhow::Error;

    fn try_from(config_path: &str) -> Result<Self, Self::Error> {
        let c = config::Config::builder()
            .add_source(config::File::with_name(config_path))
            .build()?;

        let cfg: CertifierConfig = c.try_deserialize()?;
        cfg.socket_path()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attester::{PersistentHandle, TpmBackendKind};

    #[test]
    fn parse_certifier_config() {
        let config = CertifierConfig::try_from("tests/certifier.example.toml").unwrap();
        assert!(config.feature_flags.unified_identity());
        assert_eq!(config.allowed_uids, vec![0, 1000]);
        assert_eq!(
            config.socket_access(),
            SocketAccess {
                mode: 0o660,
                gid: Some(1000)
            }
        );
        assert_eq!(config.rate_limit_per_minute, 5);
        assert_eq!(config.tpm.backend, TpmBackendKind::Sample);
        assert_eq!(
            config.ak,
            AkSource::Persistent {
                handle: PersistentHandle::new(0x8101_0002).unwrap()
            }
        );
    }

    #[test]
    fn test_certifier_config_default() {
        let config = CertifierConfig::default();
        assert!(!config.feature_flags.unified_identity());
        assert!(config.allowed_uids.is_empty());
        assert_eq!(config.socket_access(), SocketAccess::default());
        assert_eq!(config.rate_limit_per_minute, 10);
        assert!(matches!(config.ak, AkSource::KeylimeAgentData { .. }));
    }

    #[test]
    fn test_tcp_endpoint_rejected() {
        assert!(CertifierConfig::try_from("tests/certifier.tcp.toml").is_err());
    }
}
