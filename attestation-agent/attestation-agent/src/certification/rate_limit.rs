// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Fixed-window request counter per peer uid. Peers without credentials
/// share one counter. A limit of 0 disables limiting.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    peers: Mutex<HashMap<Option<u32>, (u32, Instant)>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, RATE_LIMIT_WINDOW)
    }

    /// Count one request of `peer`. Returns false once the peer went over its
    /// limit in the current window.
    pub fn check(&self, peer: Option<u32>) -> bool {
        if self.limit == 0 {
            return true;
        }

        let now = Instant::now();
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.retain(|_, (_, started)| now.duration_since(*started) < self.window);
        let (count, _) = peers.entry(peer).or_insert((0, now));
        *count = count.saturating_add(1);
        *count <= self.limit
    }
}
