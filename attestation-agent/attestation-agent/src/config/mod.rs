// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::{bail, Result};
use attester::{utils::default_pcr_selection, PersistentHandle, TpmConfig};
use serde::Deserialize;
use sovereign_types::FeatureFlags;
use std::{path::PathBuf, time::Duration};

pub mod certifier;

pub const DEFAULT_AGENT_CONFIG_PATH: &str = "/etc/sovereign-attestation/agent.toml";

/// Socket the delegated certifier listens on.
pub const DEFAULT_CERTIFIER_SOCKET: &str = "unix:///run/sovereign-attestation/certifier.sock";

/// Environment prefix overriding agent configuration entries, e.g.
/// `SOVEREIGN_AGENT__TPM__BACKEND=sample`.
pub const AGENT_ENV_PREFIX: &str = "SOVEREIGN_AGENT";

const DEFAULT_APP_KEY_VALIDITY_SECS: u64 = 3600;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// e.g. `["Unified-Identity"]`. Absent means every flag is off.
    #[serde(default)]
    pub feature_flags: FeatureFlags,

    #[serde(default)]
    pub tpm: TpmConfig,

    /// Persistent handle the App Key lives at.
    #[serde(default)]
    pub app_key_handle: PersistentHandle,

    /// SHA-256 PCR indices covered by every quote.
    #[serde(default = "default_pcr_selection")]
    pub pcr_selection: Vec<u8>,

    /// How long an App Key and its certificate are reused.
    #[serde(default = "default_app_key_validity_secs")]
    pub app_key_validity_secs: u64,

    #[serde(default = "default_certifier_socket")]
    pub certifier_socket: String,

    /// Upper bound of every TPM command and of the certification call.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_app_key_validity_secs() -> u64 {
    DEFAULT_APP_KEY_VALIDITY_SECS
}

fn default_certifier_socket() -> String {
    DEFAULT_CERTIFIER_SOCKET.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feature_flags: FeatureFlags::default(),
            tpm: TpmConfig::default(),
            app_key_handle: PersistentHandle::default(),
            pcr_selection: default_pcr_selection(),
            app_key_validity_secs: DEFAULT_APP_KEY_VALIDITY_SECS,
            certifier_socket: default_certifier_socket(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn app_key_validity(&self) -> Duration {
        Duration::from_secs(self.app_key_validity_secs)
    }

    pub fn certifier_socket_path(&self) -> Result<PathBuf> {
        unix_socket_path(&self.certifier_socket)
    }
}

impl TryFrom<&str> for Config {
    type Error = anyhow::Error;

    fn try_from(config_path: &str) -> Result<Self, Self::Error> {
        let c = config::Config::builder()
            .add_source(config::File::with_name(config_path))
            .add_source(
                config::Environment::with_prefix(AGENT_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Config = c.try_deserialize()?;
        // Fail at load time rather than on the first attestation.
        cfg.certifier_socket_path()?;
        Ok(cfg)
    }
}

/// Path of a Unix socket endpoint, given as `unix:///path` or a bare absolute
/// path. The certification interface is never reachable over the network, so
/// every other scheme is rejected.
pub fn unix_socket_path(endpoint: &str) -> Result<PathBuf> {
    let endpoint = endpoint.trim();
    let path = match endpoint.split_once("://") {
        Some(("unix", path)) => path,
        Some((scheme, _)) => bail!("certifier endpoint {endpoint:?} uses {scheme}, only unix sockets are allowed"),
        None => endpoint,
    };
    if !path.starts_with('/') {
        bail!("certifier endpoint {endpoint:?} is not an absolute unix socket path");
    }
    Ok(PathBuf::from(path))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serial_test::serial;

    use super::*;
    use attester::TpmBackendKind;

    #[rstest]
    #[case("tests/agent.example.toml")]
    #[case("tests/agent.example.json")]
    fn parse_config(#[case] config: &str) {
        let config = Config::try_from(config).expect("failed to parse config file");
        assert!(config.feature_flags.unified_identity());
        assert_eq!(config.tpm.backend, TpmBackendKind::Sample);
        assert_eq!(config.app_key_handle.raw(), 0x8101_000B);
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(!config.feature_flags.unified_identity());
        assert_eq!(config.pcr_selection, (0..8).collect::<Vec<u8>>());
        assert_eq!(config.app_key_validity_secs, 3600);
        assert_eq!(
            config.certifier_socket_path().unwrap(),
            PathBuf::from("/run/sovereign-attestation/certifier.sock")
        );
    }

    #[test]
    fn test_flag_off_config() {
        let config = Config::try_from("tests/agent.flag-off.toml").unwrap();
        assert!(!config.feature_flags.unified_identity());
    }

    #[rstest]
    #[case("tests/agent.unknown-flag.toml")]
    #[case("tests/agent.tcp-certifier.toml")]
    fn parse_config_rejects(#[case] config: &str) {
        assert!(Config::try_from(config).is_err());
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("SOVEREIGN_AGENT__APP_KEY_VALIDITY_SECS", "60");
        let config = Config::try_from("tests/agent.example.toml");
        std::env::remove_var("SOVEREIGN_AGENT__APP_KEY_VALIDITY_SECS");
        assert_eq!(config.unwrap().app_key_validity_secs, 60);
    }

    #[rstest]
    #[case("unix:///run/certifier.sock", Some("/run/certifier.sock"))]
    #[case("/run/certifier.sock", Some("/run/certifier.sock"))]
    #[case("tcp://127.0.0.1:9000", None)]
    #[case("127.0.0.1:9000", None)]
    #[case("unix://relative.sock", None)]
    fn test_unix_socket_path(#[case] endpoint: &str, #[case] expected: Option<&str>) {
        assert_eq!(
            unix_socket_path(endpoint).ok(),
            expected.map(PathBuf::from)
        );
    }
}
