// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::{Context, Result};
use attester::{AttestationKeyOperations, PersistentHandle, SerializedTpm, TpmError};
use hyper::{
    body::HttpBody,
    header::{self, HeaderValue},
    server::conn::Http,
    service::service_fn,
    Body, Method, Request, Response, StatusCode,
};
use log::{debug, info, warn};
use sovereign_types::{
    evidence::{parse_public_key_pem, public_key_to_pem},
    protocol::{
        CertifyAppKeyRequest, CertifyAppKeyResponse, CertifyErrorKind, CertifyErrorKind::*,
        CERTIFY_API_VERSION, CERTIFY_APP_KEY_COMMAND, CERTIFY_APP_KEY_PATH,
    },
    AppKeyCertificate, FeatureFlags, HashAlgorithm, UNIFIED_IDENTITY,
};
use std::{
    convert::Infallible,
    fs::Permissions,
    os::unix::fs::{chown, PermissionsExt},
    path::Path,
    sync::Arc,
    time::Duration,
};
use tokio::net::UnixListener;

use super::{
    rate_limit::{RateLimiter, RATE_LIMIT_WINDOW},
    CertifyError,
};

const MAX_REQUEST_SIZE: usize = 64 * 1024;

/// Certifies App Keys with the platform AK on behalf of local peers.
pub struct CertificationService {
    flags: FeatureFlags,
    allowed_uids: Vec<u32>,
    limiter: RateLimiter,
    tpm: SerializedTpm<dyn AttestationKeyOperations>,
}

impl CertificationService {
    pub fn new(
        flags: FeatureFlags,
        allowed_uids: Vec<u32>,
        backend: Box<dyn AttestationKeyOperations>,
        timeout: Duration,
    ) -> Self {
        Self {
            flags,
            allowed_uids,
            limiter: RateLimiter::unlimited(),
            tpm: SerializedTpm::new(backend, timeout),
        }
    }

    /// Allow each peer uid at most `per_minute` certification requests per
    /// minute. 0 lifts the limit.
    pub fn with_rate_limit(mut self, per_minute: u32) -> Self {
        self.limiter = RateLimiter::new(per_minute, RATE_LIMIT_WINDOW);
        self
    }

    /// SubjectPublicKeyInfo PEM of the AK, for registration with the verifier.
    pub async fn ak_public_pem(&self) -> Result<String> {
        let ak = self
            .tpm
            .run(|tpm| tpm.ak_public(), TpmError::TpmUnavailable)
            .await?;
        Ok(public_key_to_pem(&ak)?)
    }

    pub async fn ek_certificate_pem(&self) -> Result<Option<String>> {
        Ok(self
            .tpm
            .run(|tpm| tpm.ek_certificate(), TpmError::TpmUnavailable)
            .await?)
    }

    /// Certify the App Key named by `request` for a peer running as `peer_uid`.
    pub async fn certify(
        &self,
        peer_uid: Option<u32>,
        request: &CertifyAppKeyRequest,
    ) -> std::result::Result<AppKeyCertificate, CertifyError> {
        if !self.flags.unified_identity() {
            return Err(CertifyError::new(
                Unsupported,
                format!("{UNIFIED_IDENTITY} is disabled on this certifier"),
            ));
        }
        if !self.allowed_uids.is_empty() {
            match peer_uid {
                Some(uid) if self.allowed_uids.contains(&uid) => {}
                Some(uid) => {
                    return Err(CertifyError::new(
                        Unauthorized,
                        format!("uid {uid} may not request certifications"),
                    ))
                }
                None => {
                    return Err(CertifyError::new(
                        Unauthorized,
                        "peer credentials unavailable",
                    ))
                }
            }
        }
        if !self.limiter.check(peer_uid) {
            return Err(CertifyError::new(
                RateLimited,
                format!("uid {peer_uid:?} exceeded the certification rate limit"),
            ));
        }
        if request.command != CERTIFY_APP_KEY_COMMAND {
            return Err(CertifyError::new(
                BadRequest,
                format!("unknown command {:?}", request.command),
            ));
        }
        if request.api_version != CERTIFY_API_VERSION {
            return Err(CertifyError::new(
                BadRequest,
                format!("unsupported api_version {:?}", request.api_version),
            ));
        }

        let requested = parse_public_key_pem("app_key_public", &request.app_key_public)
            .map_err(|e| CertifyError::new(BadRequest, e.to_string()))?;
        let handle: PersistentHandle = request.app_key_context_path.parse()?;
        let qualifying_data = AppKeyCertificate::qualifying_data(&request.app_key_public);

        let (material, certification) = self
            .tpm
            .run(
                move |tpm| {
                    let material = tpm.load_app_key(handle)?;
                    let stored = parse_public_key_pem("stored App Key", &material.public_pem)
                        .map_err(|e| TpmError::KeyNotFound(e.to_string()))?;
                    if stored != requested {
                        return Err(TpmError::KeyNotFound(format!(
                            "key at {handle} is not the requested App Key"
                        )));
                    }
                    let certification = tpm.certify(handle, &qualifying_data)?;
                    Ok((material, certification))
                },
                TpmError::CertifyFailed,
            )
            .await?;

        Ok(AppKeyCertificate {
            app_key_public: request.app_key_public.clone(),
            app_key_tpm_public: material.tpm_public,
            certify_data: certification.certify_data,
            signature: certification.signature,
            hash_alg: HashAlgorithm::Sha256,
        })
    }

    async fn handle(&self, peer_uid: Option<u32>, req: Request<Body>) -> Response<Body> {
        if req.uri().path() != CERTIFY_APP_KEY_PATH {
            return error_response(
                StatusCode::NOT_FOUND,
                CertifyError::new(BadRequest, format!("no such endpoint {}", req.uri().path())),
            );
        }
        if req.method() != Method::POST {
            return error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                CertifyError::new(BadRequest, format!("{} is not allowed", req.method())),
            );
        }

        let body = match read_limited(req.into_body(), MAX_REQUEST_SIZE).await {
            Ok(Some(body)) => body,
            Ok(None) => {
                return error_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    CertifyError::new(BadRequest, "request body too large"),
                )
            }
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    CertifyError::new(BadRequest, format!("read request body: {e}")),
                )
            }
        };
        let request: CertifyAppKeyRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    CertifyError::new(BadRequest, format!("malformed request: {e}")),
                )
            }
        };

        let result = self
            .certify(peer_uid, &request)
            .await
            .and_then(|certificate| {
                certificate
                    .encode()
                    .map_err(|e| CertifyError::new(CertifyFailed, e.to_string()))
            });
        match result {
            Ok(app_key_certificate) => {
                info!(
                    "Certified App Key at {} for uid {peer_uid:?}",
                    request.app_key_context_path
                );
                json_response(
                    StatusCode::OK,
                    &CertifyAppKeyResponse::Success {
                        app_key_certificate,
                    },
                )
            }
            Err(e) => {
                warn!("Refused certification for uid {peer_uid:?}: {e}");
                error_response(status_of(e.kind), e)
            }
        }
    }
}

fn status_of(kind: CertifyErrorKind) -> StatusCode {
    match kind {
        BadRequest => StatusCode::BAD_REQUEST,
        Unauthorized => StatusCode::FORBIDDEN,
        KeyNotFound => StatusCode::NOT_FOUND,
        Unsupported => StatusCode::NOT_IMPLEMENTED,
        CertifyFailed => StatusCode::INTERNAL_SERVER_ERROR,
        TpmUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        RateLimited => StatusCode::TOO_MANY_REQUESTS,
    }
}

/// Read `body` unless it is longer than `limit` bytes, in which case `None`
/// is returned without buffering the rest.
async fn read_limited(mut body: Body, limit: usize) -> hyper::Result<Option<Vec<u8>>> {
    if body.size_hint().lower() > limit as u64 {
        return Ok(None);
    }
    let mut buf = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        if buf.len() + chunk.len() > limit {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Some(buf))
}

fn error_response(status: StatusCode, e: CertifyError) -> Response<Body> {
    json_response(
        status,
        &CertifyAppKeyResponse::Error {
            error: e.message,
            error_kind: e.kind,
        },
    )
}

fn json_response(status: StatusCode, body: &CertifyAppKeyResponse) -> Response<Body> {
    let mut response = match serde_json::to_vec(body) {
        Ok(bytes) => Response::new(Body::from(bytes)),
        Err(_) => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            return response;
        }
    };
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Ownership and mode applied to the socket file after binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SocketAccess {
    pub mode: u32,
    pub gid: Option<u32>,
}

pub const DEFAULT_SOCKET_MODE: u32 = 0o660;

impl Default for SocketAccess {
    fn default() -> Self {
        Self {
            mode: DEFAULT_SOCKET_MODE,
            gid: None,
        }
    }
}

/// Bind the certifier socket, replacing a stale socket file left behind by a
/// previous run, and restrict it to `access`.
pub fn bind(path: &Path, access: SocketAccess) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("remove stale socket {}", path.display()))?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create socket dir {}", parent.display()))?;
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("bind certifier socket {}", path.display()))?;

    if let Some(gid) = access.gid {
        chown(path, None, Some(gid))
            .with_context(|| format!("set group {gid} on {}", path.display()))?;
    }
    std::fs::set_permissions(path, Permissions::from_mode(access.mode))
        .with_context(|| format!("set mode {:o} on {}", access.mode, path.display()))?;
    Ok(listener)
}

/// Serve certification requests until accepting a connection fails.
pub async fn serve(listener: UnixListener, service: Arc<CertificationService>) -> Result<()> {
    loop {
        let (stream, _) = listener.accept().await.context("accept connection")?;
        let peer_uid = match stream.peer_cred() {
            Ok(cred) => Some(cred.uid()),
            Err(e) => {
                warn!("Read peer credentials failed: {e}");
                None
            }
        };

        let service = service.clone();
        tokio::spawn(async move {
            let handler = service_fn(move |req| {
                let service = service.clone();
                async move { Ok::<_, Infallible>(service.handle(peer_uid, req).await) }
            });
            if let Err(e) = Http::new().serve_connection(stream, handler).await {
                debug!("Certifier connection ended with error: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use attester::{sample::SampleTpm, AppKeyMaterial, AppKeyOperations};
    use rsa::{
        pkcs1v15::{Signature, VerifyingKey},
        signature::Verifier,
    };
    use sha2::Sha256;
    use sovereign_types::tpm_structs::{Attested, RsaPublicArea, RsaSignature, TpmsAttest};
    use tempfile::TempDir;

    use super::*;

    fn sample(dir: &Path) -> SampleTpm {
        SampleTpm::open(dir).unwrap().with_key_bits(1024)
    }

    fn setup(enabled: bool, allowed_uids: Vec<u32>) -> (TempDir, CertificationService, AppKeyMaterial) {
        let dir = tempfile::tempdir().unwrap();
        let key = sample(dir.path())
            .create_app_key(PersistentHandle::default())
            .unwrap();
        let service = CertificationService::new(
            FeatureFlags::with_unified_identity(enabled),
            allowed_uids,
            Box::new(sample(dir.path())),
            Duration::from_secs(30),
        );
        (dir, service, key)
    }

    fn request(key: &AppKeyMaterial) -> CertifyAppKeyRequest {
        CertifyAppKeyRequest::new(key.public_pem.clone(), key.handle.to_string())
    }

    #[tokio::test]
    async fn test_certificate_binds_app_key_to_ak() {
        let (_dir, service, key) = setup(true, vec![]);
        let cert = service.certify(Some(1000), &request(&key)).await.unwrap();

        let attest = TpmsAttest::unmarshal(&cert.certify_data).unwrap();
        assert_eq!(
            attest.extra_data,
            AppKeyCertificate::qualifying_data(&key.public_pem)
        );
        let Attested::Certify { name, .. } = attest.attested else {
            panic!("not a certify structure");
        };
        let app_key_area = RsaPublicArea::unmarshal(&cert.app_key_tpm_public).unwrap();
        assert_eq!(name, app_key_area.name().unwrap());

        let ak = parse_public_key_pem("ak", &service.ak_public_pem().await.unwrap()).unwrap();
        let signature = RsaSignature::unmarshal(&cert.signature).unwrap();
        VerifyingKey::<Sha256>::new(ak)
            .verify(
                &cert.certify_data,
                &Signature::try_from(signature.signature.as_slice()).unwrap(),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_disabled_flag_is_unsupported() {
        let (_dir, service, key) = setup(false, vec![]);
        let err = service.certify(Some(0), &request(&key)).await.unwrap_err();
        assert_eq!(err.kind, Unsupported);
    }

    #[tokio::test]
    async fn test_peer_uid_not_allowed() {
        let (_dir, service, key) = setup(true, vec![0]);
        let err = service.certify(Some(1000), &request(&key)).await.unwrap_err();
        assert_eq!(err.kind, Unauthorized);
        let err = service.certify(None, &request(&key)).await.unwrap_err();
        assert_eq!(err.kind, Unauthorized);
        assert!(service.certify(Some(0), &request(&key)).await.is_ok());
    }

    #[tokio::test]
    async fn test_handle_key_mismatch_is_key_not_found() {
        let (dir, service, key) = setup(true, vec![]);
        let other = sample(dir.path())
            .create_app_key(PersistentHandle::new(0x8101_0010).unwrap())
            .unwrap();

        let mismatched = CertifyAppKeyRequest::new(other.public_pem, key.handle.to_string());
        let err = service.certify(None, &mismatched).await.unwrap_err();
        assert_eq!(err.kind, KeyNotFound);

        let empty_handle =
            CertifyAppKeyRequest::new(key.public_pem.clone(), "0x81010020".to_string());
        let err = service.certify(None, &empty_handle).await.unwrap_err();
        assert_eq!(err.kind, KeyNotFound);

        let not_a_handle = CertifyAppKeyRequest::new(key.public_pem, "0x40000001".to_string());
        let err = service.certify(None, &not_a_handle).await.unwrap_err();
        assert_eq!(err.kind, KeyNotFound);
    }

    #[tokio::test]
    async fn test_malformed_requests() {
        let (_dir, service, key) = setup(true, vec![]);

        let mut wrong_command = request(&key);
        wrong_command.command = "certify_ak".to_string();
        let err = service.certify(None, &wrong_command).await.unwrap_err();
        assert_eq!(err.kind, BadRequest);

        let bad_pem = CertifyAppKeyRequest::new("not a key".to_string(), key.handle.to_string());
        let err = service.certify(None, &bad_pem).await.unwrap_err();
        assert_eq!(err.kind, BadRequest);
    }

    #[tokio::test]
    async fn test_rate_limited_within_window() {
        let (_dir, service, key) = setup(true, vec![]);
        let service = service.with_rate_limit(2);

        for _ in 0..2 {
            assert!(service.certify(Some(1000), &request(&key)).await.is_ok());
        }
        let err = service.certify(Some(1000), &request(&key)).await.unwrap_err();
        assert_eq!(err.kind, RateLimited);
        // Other peers keep their own budget.
        assert!(service.certify(Some(1001), &request(&key)).await.is_ok());

        let response = service
            .handle(
                Some(1000),
                Request::post(CERTIFY_APP_KEY_PATH)
                    .body(Body::from(serde_json::to_vec(&request(&key)).unwrap()))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let (_dir, service, _) = setup(true, vec![]);

        let sized = Request::post(CERTIFY_APP_KEY_PATH)
            .body(Body::from(vec![b' '; MAX_REQUEST_SIZE + 1]))
            .unwrap();
        assert_eq!(
            service.handle(None, sized).await.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );

        // Chunked, without a length up front.
        let (mut sender, body) = Body::channel();
        tokio::spawn(async move {
            for _ in 0..32 {
                if sender.send_data(vec![b' '; 4096].into()).await.is_err() {
                    break;
                }
            }
        });
        let chunked = Request::post(CERTIFY_APP_KEY_PATH).body(body).unwrap();
        assert_eq!(
            service.handle(None, chunked).await.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[tokio::test]
    async fn test_socket_mode_and_group() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("certifier.sock");
        let _listener = bind(&socket, SocketAccess::default()).unwrap();
        let meta = std::fs::metadata(&socket).unwrap();
        assert_eq!(meta.mode() & 0o777, DEFAULT_SOCKET_MODE);

        let gid = std::fs::metadata(dir.path()).unwrap().gid();
        let access = SocketAccess {
            mode: 0o600,
            gid: Some(gid),
        };
        let _listener = bind(&socket, access).unwrap();
        let meta = std::fs::metadata(&socket).unwrap();
        assert_eq!(meta.mode() & 0o777, 0o600);
        assert_eq!(meta.gid(), gid);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(status_of(Unauthorized), StatusCode::FORBIDDEN);
        assert_eq!(status_of(KeyNotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_of(Unsupported), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(status_of(RateLimited), StatusCode::TOO_MANY_REQUESTS);
    }
}
