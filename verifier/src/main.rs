// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::{Context, Result};
use clap::Parser;
use evidence_verifier::{
    build_router,
    config::{load_config, TlsConfig, DEFAULT_CONFIG_PATH},
    router::Router,
};
use hyper::{
    server::conn::{AddrStream, Http},
    service::{make_service_fn, service_fn},
    Server,
};
use log::{info, warn};
use std::{convert::Infallible, fs::File, io::BufReader, net::SocketAddr, sync::Arc};
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
};
use tokio_rustls::{
    rustls::{crypto::ring::default_provider, ServerConfig},
    TlsAcceptor,
};

/// Evidence verifier arguments info.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path for the verifier
    #[arg(default_value_t = DEFAULT_CONFIG_PATH.to_string(), short, long = "config")]
    config: String,

    /// Listen address, overriding the configuration.
    #[arg(short, long)]
    bind: Option<String>,
}

fn tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor> {
    let mut certs = BufReader::new(
        File::open(&tls.cert_path)
            .with_context(|| format!("open {}", tls.cert_path.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut certs)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("parse TLS certificate chain")?;

    let mut key = BufReader::new(
        File::open(&tls.key_path).with_context(|| format!("open {}", tls.key_path.display()))?,
    );
    let key = rustls_pemfile::private_key(&mut key)
        .context("parse TLS private key")?
        .context("no private key in TLS key file")?;

    let config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn serve_plain(address: SocketAddr, router: Arc<Router>) -> Result<()> {
    let service = make_service_fn(|conn: &AddrStream| {
        let remote_addr = conn.remote_addr();
        let router = router.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let router = router.clone();
                async move { router.route(remote_addr, req).await }
            }))
        }
    });

    info!("Evidence verifier listening on http://{address}");
    Server::bind(&address).serve(service).await?;
    Ok(())
}

async fn serve_tls(address: SocketAddr, acceptor: TlsAcceptor, router: Arc<Router>) -> Result<()> {
    let listener = TcpListener::bind(address).await?;
    info!("Evidence verifier listening on https://{address}");

    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let router = router.clone();
        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("TLS handshake with {remote_addr} failed: {e}");
                    return;
                }
            };
            let service = service_fn(move |req| {
                let router = router.clone();
                async move { router.route(remote_addr, req).await }
            });
            if let Err(e) = Http::new().serve_connection(stream, service).await {
                warn!("Connection from {remote_addr} failed: {e}");
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    let args = Args::parse();

    let mut config = load_config(&args.config)?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    info!("Starting evidence verifier with config {}", args.config);

    let address: SocketAddr = config
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind))?;
    let router = Arc::new(build_router(&config)?);

    let server = async {
        match &config.tls {
            Some(tls) => serve_tls(address, tls_acceptor(tls)?, router).await,
            None => {
                warn!("No TLS configured: serving plain HTTP");
                serve_plain(address, router).await
            }
        }
    };

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => { info!("SIGINT received, gracefully shutdown."); Ok(()) }
        _ = terminate.recv() => { info!("SIGTERM received, gracefully shutdown."); Ok(()) }
        res = server => res,
    }
}
