// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Process-wide feature flags.
//!
//! Flags are read once from the `feature_flags` list of a service
//! configuration. A name enables the flag, the same name prefixed with `-`
//! disables it, later entries win, and unknown names are rejected so a typo
//! cannot silently leave the pipeline off. Everything defaults to off.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Gates the sovereign attestation pipeline end to end.
pub const UNIFIED_IDENTITY: &str = "Unified-Identity";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FlagError {
    #[error("unknown feature flag {0:?}")]
    Unknown(String),

    #[error("empty feature flag name")]
    Empty,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeatureFlags {
    unified_identity: bool,
}

impl FeatureFlags {
    pub fn from_names<I, S>(names: I) -> Result<Self, FlagError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut flags = Self::default();
        for name in names {
            let name = name.as_ref().trim();
            let (flag, enabled) = match name.strip_prefix('-') {
                Some(rest) => (rest, false),
                None => (name, true),
            };
            match flag {
                "" => return Err(FlagError::Empty),
                UNIFIED_IDENTITY => flags.unified_identity = enabled,
                other => return Err(FlagError::Unknown(other.to_string())),
            }
        }
        Ok(flags)
    }

    pub fn with_unified_identity(enabled: bool) -> Self {
        Self {
            unified_identity: enabled,
        }
    }

    pub fn unified_identity(&self) -> bool {
        self.unified_identity
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if self.unified_identity {
            names.push(UNIFIED_IDENTITY.to_string());
        }
        names
    }
}

impl<'de> Deserialize<'de> for FeatureFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        FeatureFlags::from_names(names).map_err(serde::de::Error::custom)
    }
}

impl Serialize for FeatureFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.names().serialize(serializer)
    }
}
