// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Data model, wire types and TPM structure codec shared by the evidence
//! producing node, the delegated certifier, the verifier and the issuance gate.

pub mod algorithms;
pub mod claims;
pub mod evidence;
pub mod flag;
pub mod protocol;
pub mod tpm_structs;

pub use algorithms::HashAlgorithm;
pub use claims::{AttestedClaims, GpuMetrics, HostIntegrityStatus};
pub use evidence::{AppKeyCertificate, EncodingError, Quote, SovereignAttestation};
pub use flag::{FeatureFlags, UNIFIED_IDENTITY};
