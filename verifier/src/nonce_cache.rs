// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Nonces accepted within the last `ttl`. Expired entries are evicted on
/// every insertion.
#[derive(Debug)]
pub struct NonceCache {
    ttl: Duration,
    seen: Mutex<HashMap<Vec<u8>, Instant>>,
}

impl NonceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record `nonce`. Returns false when it was already seen within the TTL.
    /// Check and insertion happen under one lock.
    pub fn insert(&self, nonce: &[u8]) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.retain(|_, at| now.duration_since(*at) < self.ttl);
        if seen.contains_key(nonce) {
            return false;
        }
        seen.insert(nonce.to_vec(), now);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
