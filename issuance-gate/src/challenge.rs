// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use rand::RngCore;
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

pub const CHALLENGE_LEN: usize = 32;

/// Challenge nonces handed out to attesting workloads. Each one can be
/// consumed once, within `ttl` of being minted.
#[derive(Debug)]
pub struct ChallengeRegistry {
    ttl: Duration,
    issued: Mutex<HashMap<String, Instant>>,
}

impl ChallengeRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            issued: Mutex::new(HashMap::new()),
        }
    }

    /// A fresh hex encoded challenge.
    pub fn mint(&self) -> String {
        let mut bytes = [0u8; CHALLENGE_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        let challenge = hex::encode(bytes);

        let now = Instant::now();
        let mut issued = self.issued.lock().unwrap_or_else(|e| e.into_inner());
        issued.retain(|_, at| now.duration_since(*at) < self.ttl);
        issued.insert(challenge.clone(), now);
        challenge
    }

    /// True when `challenge` was minted here, has not expired and was not
    /// consumed before.
    pub fn consume(&self, challenge: &str) -> bool {
        let now = Instant::now();
        let mut issued = self.issued.lock().unwrap_or_else(|e| e.into_inner());
        issued.retain(|_, at| now.duration_since(*at) < self.ttl);
        issued.remove(&challenge.to_ascii_lowercase()).is_some()
    }

    pub fn outstanding(&self) -> usize {
        self.issued.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
