// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::{bail, Context, Result};
use sovereign_types::{tpm_structs::PCR_COUNT, HashAlgorithm};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

pub const HASH_ALG: HashAlgorithm = HashAlgorithm::Sha256;
pub const MEASURE_DIGEST_LEN: usize = 32;

/// A software SHA-256 PCR bank, one hex encoded register per line.
#[derive(Debug)]
pub struct PcrRegisters {
    path: PathBuf,
}

impl PcrRegisters {
    /// Open the bank at `path`, creating it with all registers zeroed.
    pub fn open(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create PCR bank dir {}", parent.display()))?;
            }
            let zeros = vec![vec![0u8; MEASURE_DIGEST_LEN]; PCR_COUNT as usize];
            write_bank(&path, &zeros)?;
        }

        Ok(Self { path })
    }

    /// All registers, index order.
    pub fn values(&self) -> Result<Vec<Vec<u8>>> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("read PCR bank {}", self.path.display()))?;
        let values = content
            .lines()
            .map(|line| hex::decode(line.trim()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("decode PCR bank {}", self.path.display()))?;

        if values.len() != PCR_COUNT as usize
            || values.iter().any(|v| v.len() != MEASURE_DIGEST_LEN)
        {
            bail!(
                "PCR bank {} is corrupted. Delete it to reset all registers.",
                self.path.display()
            );
        }

        Ok(values)
    }

    pub fn read(&self, pcrs: &[u8]) -> Result<Vec<Vec<u8>>> {
        let values = self.values()?;
        pcrs.iter()
            .map(|i| {
                values
                    .get(*i as usize)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("Register index {i} out of bounds"))
            })
            .collect()
    }

    /// `PCR[index] = SHA256(PCR[index] || digest)`, persisted before returning.
    pub fn extend(&self, index: u8, event_digest: &[u8; MEASURE_DIGEST_LEN]) -> Result<Vec<u8>> {
        let mut values = self.values()?;
        let Some(current) = values.get_mut(index as usize) else {
            bail!("Register index {index} out of bounds");
        };

        let mut material = current.clone();
        material.extend_from_slice(event_digest);
        *current = HASH_ALG.digest(&material);
        let updated = current.clone();

        write_bank(&self.path, &values)?;
        Ok(updated)
    }
}

fn write_bank(path: &Path, values: &[Vec<u8>]) -> Result<()> {
    let encoded: Vec<String> = values.iter().map(hex::encode).collect();
    let mut file = fs::File::create(path)
        .with_context(|| format!("create PCR bank {}", path.display()))?;
    file.write_all(encoded.join("\n").as_bytes())
        .with_context(|| format!("write PCR bank {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync PCR bank {}", path.display()))?;
    Ok(())
}
