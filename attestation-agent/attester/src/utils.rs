// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use sovereign_types::tpm_structs::{PcrSelection, PCR_COUNT, TPM_ALG_SHA256};

use crate::error::TpmError;

/// PCRs quoted unless configured otherwise: the SRTM measurements 0..=7.
pub fn default_pcr_selection() -> Vec<u8> {
    (0..8).collect()
}

/// Turn a configured index set into a SHA-256 [`PcrSelection`].
///
/// Unlike [`PcrSelection::new`], duplicates are an error here: the selection
/// is operator policy and a repeated index is a configuration mistake.
pub fn sha256_selection(pcrs: &[u8]) -> Result<PcrSelection, TpmError> {
    if pcrs.is_empty() {
        return Err(TpmError::InvalidSelection("empty PCR selection".into()));
    }
    if let Some(out_of_range) = pcrs.iter().find(|i| **i >= PCR_COUNT) {
        return Err(TpmError::InvalidSelection(format!(
            "PCR {out_of_range} out of range 0..{PCR_COUNT}"
        )));
    }
    let mut seen = [false; PCR_COUNT as usize];
    for pcr in pcrs {
        if std::mem::replace(&mut seen[*pcr as usize], true) {
            return Err(TpmError::InvalidSelection(format!(
                "PCR {pcr} selected twice"
            )));
        }
    }

    PcrSelection::new(TPM_ALG_SHA256, pcrs)
        .map_err(|e| TpmError::InvalidSelection(e.to_string()))
}
