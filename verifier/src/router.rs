// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::Result;
use async_trait::async_trait;
use hyper::{header, Body, Request, Response, StatusCode};
use log::error;
use serde::Serialize;
use std::{convert::Infallible, net::SocketAddr};

#[async_trait]
pub trait ApiHandler: Send + Sync {
    /// `url_path` is the request path with the handler root stripped.
    async fn handle_request(
        &self,
        remote_addr: SocketAddr,
        url_path: &str,
        req: Request<Body>,
    ) -> Result<Response<Body>>;

    fn not_allowed(&self) -> Result<Response<Body>> {
        empty(StatusCode::METHOD_NOT_ALLOWED)
    }

    fn not_found(&self) -> Result<Response<Body>> {
        empty(StatusCode::NOT_FOUND)
    }

    fn payload_too_large(&self) -> Result<Response<Body>> {
        empty(StatusCode::PAYLOAD_TOO_LARGE)
    }
}

fn empty(status: StatusCode) -> Result<Response<Body>> {
    Ok(Response::builder().status(status).body(Body::empty())?)
}

pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Result<Response<Body>> {
    Ok(Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(body)?))?)
}

/// Dispatches requests to the handler registered for the longest matching
/// path root.
#[derive(Default)]
pub struct Router {
    routes: Vec<(String, Box<dyn ApiHandler>)>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_route(&mut self, root: &str, handler: Box<dyn ApiHandler>) {
        self.routes.push((root.trim_end_matches('/').to_string(), handler));
        self.routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    pub async fn route(
        &self,
        remote_addr: SocketAddr,
        req: Request<Body>,
    ) -> std::result::Result<Response<Body>, Infallible> {
        let path = req.uri().path().to_string();
        let matched = self.routes.iter().find_map(|(root, handler)| {
            path.strip_prefix(root.as_str())
                .filter(|rest| rest.is_empty() || rest.starts_with('/'))
                .map(|rest| (rest, handler))
        });

        let response = match matched {
            Some((url_path, handler)) => handler.handle_request(remote_addr, url_path, req).await,
            None => empty(StatusCode::NOT_FOUND),
        };

        Ok(response.unwrap_or_else(|e| {
            error!("Request {path} from {remote_addr} failed: {e:#}");
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }))
    }
}
