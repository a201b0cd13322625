// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::*;
use attestation_agent::{
    certification::{server, CertificationService},
    config::certifier::{CertifierConfig, DEFAULT_CERTIFIER_CONFIG_PATH},
};
use clap::Parser;
use log::{info, warn};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::signal::unix::{signal, SignalKind};

#[derive(Debug, Parser)]
#[command(author, version)]
struct Cli {
    /// Configuration file for the delegated certifier
    ///
    /// Example:
    /// `--config /etc/sovereign-attestation/certifier.toml`
    #[arg(short, long)]
    config_file: Option<String>,

    /// Unix socket to listen on, overriding the configuration.
    ///
    /// Example:
    /// `--socket unix:///run/sovereign-attestation/certifier.sock`
    #[arg(short, long)]
    socket: Option<String>,

    /// Write the AK public key (PEM) to this path and exit. `-` writes to
    /// stdout. The exported key is what the verifier registers for this
    /// platform.
    #[arg(long)]
    export_ak: Option<PathBuf>,

    /// With `--export-ak`, also write the EK certificate (PEM) to this path
    /// when the TPM has one.
    #[arg(long, requires = "export_ak")]
    export_ek: Option<PathBuf>,
}

fn write_pem(path: &Path, pem: &str) -> Result<()> {
    if path.as_os_str() == "-" {
        print!("{pem}");
        return Ok(());
    }
    std::fs::write(path, pem).with_context(|| format!("write {}", path.display()))
}

#[tokio::main]
pub async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    let cli = Cli::parse();

    let mut config = match cli.config_file.as_deref() {
        Some(path) => {
            info!("Using certifier config file: {path}");
            CertifierConfig::try_from(path)?
        }
        None if Path::new(DEFAULT_CERTIFIER_CONFIG_PATH).exists() => {
            CertifierConfig::try_from(DEFAULT_CERTIFIER_CONFIG_PATH)?
        }
        None => {
            warn!("No certifier config file found. Using a default configuration.");
            CertifierConfig::default()
        }
    };
    if let Some(socket) = cli.socket {
        config.socket = socket;
    }
    let socket_path = config.socket_path()?;

    let backend = config
        .tpm
        .attestation_key_backend(&config.ak)
        .context("open TPM backend")?;
    let service = Arc::new(CertificationService::new(
        config.feature_flags,
        config.allowed_uids.clone(),
        backend,
        config.timeout(),
    )
    .with_rate_limit(config.rate_limit_per_minute));

    if let Some(path) = cli.export_ak {
        write_pem(&path, &service.ak_public_pem().await.context("read AK")?)?;
        if let Some(ek_path) = cli.export_ek {
            match service.ek_certificate_pem().await? {
                Some(pem) => write_pem(&ek_path, &pem)?,
                None => warn!("The TPM holds no EK certificate"),
            }
        }
        return Ok(());
    }

    if !config.feature_flags.unified_identity() {
        warn!("Unified-Identity is disabled: every certification request will be refused");
    }

    let listener = server::bind(&socket_path, config.socket_access())?;
    info!("Delegated certifier listening on {}", socket_path.display());

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let result = tokio::select! {
        _ = hangup.recv() => { info!("Client terminal disconnected."); Ok(()) }
        _ = interrupt.recv() => { info!("SIGINT received, gracefully shutdown."); Ok(()) }
        _ = terminate.recv() => { info!("SIGTERM received, gracefully shutdown."); Ok(()) }
        res = server::serve(listener, service) => res,
    };

    let _ = std::fs::remove_file(&socket_path);
    result
}
