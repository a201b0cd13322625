// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Resolution of the facts attested about a verified platform.

use async_trait::async_trait;
use sovereign_types::{AttestedClaims, GpuMetrics, HostIntegrityStatus};
use std::collections::HashMap;
use thiserror::Error;

use crate::config::{FactProviderKind, PlatformConfig};

#[derive(Error, Debug)]
pub enum FactError {
    #[error("no facts registered for platform {0}")]
    UnknownPlatform(String),
}

#[async_trait]
pub trait FactProvider: Send + Sync {
    /// Claims about the platform whose AK certified the evidence.
    async fn claims(&self, platform_id: &str) -> Result<AttestedClaims, FactError>;
}

/// Same claims for every platform.
#[derive(Debug, Clone)]
pub struct StubFactProvider {
    claims: AttestedClaims,
}

impl Default for StubFactProvider {
    fn default() -> Self {
        Self {
            claims: AttestedClaims {
                geolocation: "Spain: N40.4168, W3.7038".to_string(),
                host_integrity_status: HostIntegrityStatus::PassedAllChecks,
                gpu_metrics: GpuMetrics {
                    status: "healthy".to_string(),
                    utilization_pct: 15.0,
                    memory_mb: 10240,
                },
            },
        }
    }
}

impl StubFactProvider {
    pub fn with_claims(claims: AttestedClaims) -> Self {
        Self { claims }
    }
}

#[async_trait]
impl FactProvider for StubFactProvider {
    async fn claims(&self, _platform_id: &str) -> Result<AttestedClaims, FactError> {
        Ok(self.claims.clone())
    }
}

/// Facts recorded per platform in the verifier configuration.
#[derive(Debug, Clone, Default)]
pub struct RegistryFactProvider {
    facts: HashMap<String, AttestedClaims>,
}

impl RegistryFactProvider {
    pub fn new(platforms: &[PlatformConfig]) -> Self {
        let facts = platforms
            .iter()
            .filter_map(|p| p.facts.clone().map(|facts| (p.id.clone(), facts)))
            .collect();
        Self { facts }
    }
}

#[async_trait]
impl FactProvider for RegistryFactProvider {
    async fn claims(&self, platform_id: &str) -> Result<AttestedClaims, FactError> {
        self.facts
            .get(platform_id)
            .cloned()
            .ok_or_else(|| FactError::UnknownPlatform(platform_id.to_string()))
    }
}

pub fn new_fact_provider(
    kind: FactProviderKind,
    platforms: &[PlatformConfig],
) -> Box<dyn FactProvider> {
    match kind {
        FactProviderKind::Stub => Box::<StubFactProvider>::default(),
        FactProviderKind::Registry => Box::new(RegistryFactProvider::new(platforms)),
    }
}
