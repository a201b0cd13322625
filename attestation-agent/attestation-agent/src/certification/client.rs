// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use attester::PersistentHandle;
use hyper::{body, header, Body, Method, Request};
use log::debug;
use sovereign_types::{
    protocol::{CertifyAppKeyRequest, CertifyAppKeyResponse, CertifyErrorKind, CERTIFY_APP_KEY_PATH},
    AppKeyCertificate, EncodingError,
};
use std::{path::PathBuf, time::Duration};
use tokio::net::UnixStream;

use crate::error::AgentError;

/// Client side of the delegated certification socket.
#[derive(Clone, Debug)]
pub struct CertificationClient {
    socket: PathBuf,
    timeout: Duration,
}

impl CertificationClient {
    pub fn new(socket: PathBuf, timeout: Duration) -> Self {
        Self { socket, timeout }
    }

    /// Ask the certifier for a certificate of the App Key at `handle`.
    ///
    /// Not retried: a failed attempt is reported and the caller starts over.
    pub async fn certify_app_key(
        &self,
        app_key_public: &str,
        handle: PersistentHandle,
    ) -> Result<AppKeyCertificate, AgentError> {
        let request = CertifyAppKeyRequest::new(app_key_public.to_string(), handle.to_string());
        let response = tokio::time::timeout(self.timeout, self.send(&request))
            .await
            .map_err(|_| {
                AgentError::UpstreamUnavailable(format!(
                    "certifier did not answer within {:?}",
                    self.timeout
                ))
            })??;

        match response {
            CertifyAppKeyResponse::Success {
                app_key_certificate,
            } => {
                let certificate = AppKeyCertificate::decode(&app_key_certificate)?;
                if certificate.app_key_public.trim() != app_key_public.trim() {
                    return Err(AgentError::Certification {
                        kind: CertifyErrorKind::CertifyFailed,
                        message: "certificate names a different App Key".to_string(),
                    });
                }
                Ok(certificate)
            }
            CertifyAppKeyResponse::Error { error, error_kind } => Err(AgentError::Certification {
                kind: error_kind,
                message: error,
            }),
        }
    }

    async fn send(&self, request: &CertifyAppKeyRequest) -> Result<CertifyAppKeyResponse, AgentError> {
        let unavailable = |what: &str, e: &dyn std::fmt::Display| {
            AgentError::UpstreamUnavailable(format!("{what} {}: {e}", self.socket.display()))
        };

        let stream = UnixStream::connect(&self.socket)
            .await
            .map_err(|e| unavailable("connect", &e))?;
        let (mut sender, connection) = hyper::client::conn::handshake(stream)
            .await
            .map_err(|e| unavailable("handshake with", &e))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Certifier connection ended with error: {e}");
            }
        });

        let payload = serde_json::to_vec(request).map_err(|source| EncodingError::Json {
            field: "certify request",
            source,
        })?;
        let req = Request::builder()
            .method(Method::POST)
            .uri(CERTIFY_APP_KEY_PATH)
            .header(header::HOST, "localhost")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(payload))
            .map_err(|e| unavailable("build request for", &e))?;

        let response = sender
            .send_request(req)
            .await
            .map_err(|e| unavailable("send request to", &e))?;
        let status = response.status();
        let bytes = body::to_bytes(response.into_body())
            .await
            .map_err(|e| unavailable("read response from", &e))?;

        serde_json::from_slice(&bytes).map_err(|e| {
            AgentError::UpstreamUnavailable(format!("malformed certifier response ({status}): {e}"))
        })
    }
}
