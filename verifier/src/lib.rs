// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Evidence verifier.
//!
//! Checks sovereign attestation bundles against the AKs of registered
//! platforms and answers with the facts known about the platform that
//! produced them.

use anyhow::Result;
use log::{info, warn};

pub mod api;
pub mod config;
pub mod error;
pub mod facts;
pub mod nonce_cache;
pub mod registry;
pub mod router;
pub mod verify;

#[cfg(test)]
mod testing;

pub use error::VerifyError;
pub use verify::{EvidenceVerifier, VerifiedEvidence};

use api::{VerifyApi, VERIFY_ROOT};
use config::VerifierConfig;
use nonce_cache::NonceCache;
use registry::PlatformRegistry;
use router::Router;

/// Routes served for `config`. The verification API only exists while
/// Unified-Identity is enabled.
pub fn build_router(config: &VerifierConfig) -> Result<Router> {
    let mut router = Router::new();
    if !config.feature_flags.unified_identity() {
        info!("Unified-Identity is disabled: the verification API is not served");
        return Ok(router);
    }

    let registry = PlatformRegistry::from_config(&config.platforms)?;
    if registry.is_empty() {
        warn!("No platform registered: every certificate will be rejected");
    }
    info!(
        "{} platform(s) registered, facts from the {} provider",
        registry.len(),
        config.fact_provider
    );

    let verifier = EvidenceVerifier::new(
        registry,
        NonceCache::new(config.nonce_ttl()),
        facts::new_fact_provider(config.fact_provider, &config.platforms),
    );
    router.register_route(VERIFY_ROOT, Box::new(VerifyApi::new(verifier)));
    Ok(router)
}
