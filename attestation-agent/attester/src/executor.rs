// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::error::{Result, TpmError};

/// Single owner of a TPM backend.
///
/// Commands run one at a time on the blocking pool. A command that outlives
/// the timeout is reported as failed; it keeps the lock until the TPM
/// answers, so the next command still cannot interleave with it.
pub struct SerializedTpm<B: ?Sized> {
    backend: Arc<Mutex<Box<B>>>,
    timeout: Duration,
}

impl<B: ?Sized> Clone for SerializedTpm<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            timeout: self.timeout,
        }
    }
}

impl<B: ?Sized + Send + 'static> SerializedTpm<B> {
    pub fn new(backend: Box<B>, timeout: Duration) -> Self {
        Self {
            backend: Arc::new(Mutex::new(backend)),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn run<T, F>(&self, op: F, on_timeout: fn(String) -> TpmError) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut B) -> Result<T> + Send + 'static,
    {
        let backend = self.backend.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = backend
                .lock()
                .map_err(|_| TpmError::TpmUnavailable("TPM context lock poisoned".into()))?;
            op(&mut **guard)
        });

        match tokio::time::timeout(self.timeout, task).await {
            Err(_) => Err(on_timeout(format!(
                "TPM command did not complete within {:?}",
                self.timeout
            ))),
            Ok(Err(e)) => Err(TpmError::TpmUnavailable(format!("TPM task failed: {e}"))),
            Ok(Ok(result)) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Counter: Send {
        fn bump(&mut self) -> u32;
    }

    struct Slow {
        count: u32,
        delay: Duration,
    }

    impl Counter for Slow {
        fn bump(&mut self) -> u32 {
            std::thread::sleep(self.delay);
            self.count += 1;
            self.count
        }
    }

    #[tokio::test]
    async fn test_commands_are_serialized() {
        let tpm = SerializedTpm::<dyn Counter>::new(
            Box::new(Slow {
                count: 0,
                delay: Duration::from_millis(10),
            }),
            Duration::from_secs(5),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let tpm = tpm.clone();
            handles.push(tokio::spawn(async move {
                tpm.run(|c| Ok(c.bump()), TpmError::QuoteFailed).await
            }));
        }
        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap().unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_timeout_maps_to_operation_error() {
        let tpm = SerializedTpm::<dyn Counter>::new(
            Box::new(Slow {
                count: 0,
                delay: Duration::from_millis(500),
            }),
            Duration::from_millis(20),
        );

        let result = tpm.run(|c| Ok(c.bump()), TpmError::QuoteFailed).await;
        assert!(matches!(result, Err(TpmError::QuoteFailed(_))));
    }
}
