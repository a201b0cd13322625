// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Minimal big-endian codec for the TPM 2.0 structures that travel inside the
//! evidence bundle: `TPMS_ATTEST` (quote and certify flavours), RSA
//! `TPMT_PUBLIC`, RSASSA `TPMT_SIGNATURE` and PCR selections.
//!
//! The encodings are the ones produced by `Tss2_MU_*_Marshal`, so the
//! hardware backend can hand its marshalled buffers straight to a verifier
//! that only links this crate.

use rsa::{traits::PublicKeyParts, BigUint, RsaPublicKey};
use thiserror::Error;

use crate::algorithms::HashAlgorithm;

/// Every structure signed by a TPM starts with this magic.
pub const TPM_GENERATED_VALUE: u32 = 0xff54_4347;

pub const TPM_ST_ATTEST_CERTIFY: u16 = 0x8017;
pub const TPM_ST_ATTEST_QUOTE: u16 = 0x8018;

pub const TPM_ALG_RSA: u16 = 0x0001;
pub const TPM_ALG_SHA1: u16 = 0x0004;
pub const TPM_ALG_SHA256: u16 = 0x000B;
pub const TPM_ALG_SHA384: u16 = 0x000C;
pub const TPM_ALG_SHA512: u16 = 0x000D;
pub const TPM_ALG_NULL: u16 = 0x0010;
pub const TPM_ALG_RSASSA: u16 = 0x0014;

/// Number of PCRs in a bank of a PC client TPM.
pub const PCR_COUNT: u8 = 24;
const PCR_SELECT_SIZE: u8 = PCR_COUNT / 8;

pub const OBJECT_FIXED_TPM: u32 = 1 << 1;
pub const OBJECT_FIXED_PARENT: u32 = 1 << 4;
pub const OBJECT_SENSITIVE_DATA_ORIGIN: u32 = 1 << 5;
pub const OBJECT_USER_WITH_AUTH: u32 = 1 << 6;
pub const OBJECT_RESTRICTED: u32 = 1 << 16;
pub const OBJECT_SIGN: u32 = 1 << 18;

/// Attributes of an unrestricted signing key that never leaves the TPM.
pub const APP_KEY_ATTRIBUTES: u32 = OBJECT_FIXED_TPM
    | OBJECT_FIXED_PARENT
    | OBJECT_SENSITIVE_DATA_ORIGIN
    | OBJECT_USER_WITH_AUTH
    | OBJECT_SIGN;

/// Attributes of a restricted signing key (an AK).
pub const ATTESTATION_KEY_ATTRIBUTES: u32 = APP_KEY_ATTRIBUTES | OBJECT_RESTRICTED;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StructError {
    #[error("buffer truncated while reading {0}")]
    Truncated(&'static str),

    #[error("not a TPM generated structure (magic {0:#010x})")]
    NotTpmGenerated(u32),

    #[error("unsupported {field} {value:#06x}")]
    Unsupported { field: &'static str, value: u16 },

    #[error("{0} trailing bytes after structure")]
    TrailingBytes(usize),

    #[error("{0} does not fit in a sized buffer")]
    TooLarge(&'static str),

    #[error("PCR index {0} is out of range")]
    PcrOutOfRange(u8),
}

type Result<T> = std::result::Result<T, StructError>;

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(StructError::Truncated(what))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self, what: &'static str) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8, what)?);
        Ok(u64::from_be_bytes(raw))
    }

    fn tpm2b(&mut self, what: &'static str) -> Result<Vec<u8>> {
        let len = self.u16(what)? as usize;
        Ok(self.take(len, what)?.to_vec())
    }

    fn finish(self) -> Result<()> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            rest => Err(StructError::TrailingBytes(rest)),
        }
    }
}

fn put_tpm2b(out: &mut Vec<u8>, data: &[u8], what: &'static str) -> Result<()> {
    let len = u16::try_from(data.len()).map_err(|_| StructError::TooLarge(what))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    Ok(())
}

/// One `TPMS_PCR_SELECTION`: a hash bank and the PCR indices selected in it,
/// kept sorted and unique.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PcrSelection {
    pub hash: u16,
    pub pcrs: Vec<u8>,
}

impl PcrSelection {
    pub fn new(hash: u16, pcrs: &[u8]) -> Result<Self> {
        if let Some(bad) = pcrs.iter().find(|i| **i >= PCR_COUNT) {
            return Err(StructError::PcrOutOfRange(*bad));
        }
        let mut pcrs = pcrs.to_vec();
        pcrs.sort_unstable();
        pcrs.dedup();
        Ok(Self { hash, pcrs })
    }

    fn bitmap(&self) -> [u8; PCR_SELECT_SIZE as usize] {
        let mut map = [0u8; PCR_SELECT_SIZE as usize];
        for pcr in &self.pcrs {
            map[(*pcr / 8) as usize] |= 1 << (pcr % 8);
        }
        map
    }

    fn marshal_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.hash.to_be_bytes());
        out.push(PCR_SELECT_SIZE);
        out.extend_from_slice(&self.bitmap());
    }

    fn unmarshal_from(reader: &mut Reader<'_>) -> Result<Self> {
        let hash = reader.u16("TPMS_PCR_SELECTION.hash")?;
        let size = reader.u8("TPMS_PCR_SELECTION.sizeofSelect")?;
        let map = reader.take(size as usize, "TPMS_PCR_SELECTION.pcrSelect")?;
        let mut pcrs = Vec::new();
        for (byte_idx, byte) in map.iter().enumerate() {
            for bit in 0..8u8 {
                if byte & (1 << bit) != 0 {
                    let index = byte_idx as u32 * 8 + bit as u32;
                    let index = u8::try_from(index)
                        .ok()
                        .filter(|i| *i < PCR_COUNT)
                        .ok_or(StructError::PcrOutOfRange(u8::MAX))?;
                    pcrs.push(index);
                }
            }
        }
        Ok(Self { hash, pcrs })
    }
}

fn marshal_selection_list(out: &mut Vec<u8>, list: &[PcrSelection]) {
    out.extend_from_slice(&(list.len() as u32).to_be_bytes());
    for selection in list {
        selection.marshal_into(out);
    }
}

fn unmarshal_selection_list(reader: &mut Reader<'_>) -> Result<Vec<PcrSelection>> {
    let count = reader.u32("TPML_PCR_SELECTION.count")?;
    // TPM2_NUM_PCR_BANKS
    if count > 16 {
        return Err(StructError::TooLarge("TPML_PCR_SELECTION"));
    }
    (0..count)
        .map(|_| PcrSelection::unmarshal_from(reader))
        .collect()
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClockInfo {
    pub clock: u64,
    pub reset_count: u32,
    pub restart_count: u32,
    pub safe: bool,
}

/// The type-specific part of a `TPMS_ATTEST`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Attested {
    /// `TPMS_QUOTE_INFO`
    Quote {
        pcr_select: Vec<PcrSelection>,
        pcr_digest: Vec<u8>,
    },
    /// `TPMS_CERTIFY_INFO`
    Certify { name: Vec<u8>, qualified_name: Vec<u8> },
}

/// `TPMS_ATTEST`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TpmsAttest {
    pub qualified_signer: Vec<u8>,
    pub extra_data: Vec<u8>,
    pub clock_info: ClockInfo,
    pub firmware_version: u64,
    pub attested: Attested,
}

impl TpmsAttest {
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(&TPM_GENERATED_VALUE.to_be_bytes());
        let st = match self.attested {
            Attested::Quote { .. } => TPM_ST_ATTEST_QUOTE,
            Attested::Certify { .. } => TPM_ST_ATTEST_CERTIFY,
        };
        out.extend_from_slice(&st.to_be_bytes());
        put_tpm2b(&mut out, &self.qualified_signer, "qualifiedSigner")?;
        put_tpm2b(&mut out, &self.extra_data, "extraData")?;
        out.extend_from_slice(&self.clock_info.clock.to_be_bytes());
        out.extend_from_slice(&self.clock_info.reset_count.to_be_bytes());
        out.extend_from_slice(&self.clock_info.restart_count.to_be_bytes());
        out.push(self.clock_info.safe as u8);
        out.extend_from_slice(&self.firmware_version.to_be_bytes());
        match &self.attested {
            Attested::Quote {
                pcr_select,
                pcr_digest,
            } => {
                marshal_selection_list(&mut out, pcr_select);
                put_tpm2b(&mut out, pcr_digest, "pcrDigest")?;
            }
            Attested::Certify {
                name,
                qualified_name,
            } => {
                put_tpm2b(&mut out, name, "name")?;
                put_tpm2b(&mut out, qualified_name, "qualifiedName")?;
            }
        }
        Ok(out)
    }

    /// Parse a marshalled `TPMS_ATTEST`. Rejects structures that do not start
    /// with [`TPM_GENERATED_VALUE`], so a successfully parsed and signature
    /// checked structure is known to come from a TPM.
    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let magic = reader.u32("TPMS_ATTEST.magic")?;
        if magic != TPM_GENERATED_VALUE {
            return Err(StructError::NotTpmGenerated(magic));
        }
        let st = reader.u16("TPMS_ATTEST.type")?;
        let qualified_signer = reader.tpm2b("TPMS_ATTEST.qualifiedSigner")?;
        let extra_data = reader.tpm2b("TPMS_ATTEST.extraData")?;
        let clock_info = ClockInfo {
            clock: reader.u64("TPMS_CLOCK_INFO.clock")?,
            reset_count: reader.u32("TPMS_CLOCK_INFO.resetCount")?,
            restart_count: reader.u32("TPMS_CLOCK_INFO.restartCount")?,
            safe: reader.u8("TPMS_CLOCK_INFO.safe")? != 0,
        };
        let firmware_version = reader.u64("TPMS_ATTEST.firmwareVersion")?;
        let attested = match st {
            TPM_ST_ATTEST_QUOTE => Attested::Quote {
                pcr_select: unmarshal_selection_list(&mut reader)?,
                pcr_digest: reader.tpm2b("TPMS_QUOTE_INFO.pcrDigest")?,
            },
            TPM_ST_ATTEST_CERTIFY => Attested::Certify {
                name: reader.tpm2b("TPMS_CERTIFY_INFO.name")?,
                qualified_name: reader.tpm2b("TPMS_CERTIFY_INFO.qualifiedName")?,
            },
            other => {
                return Err(StructError::Unsupported {
                    field: "TPMS_ATTEST.type",
                    value: other,
                })
            }
        };
        reader.finish()?;

        Ok(Self {
            qualified_signer,
            extra_data,
            clock_info,
            firmware_version,
            attested,
        })
    }
}

/// RSA flavour of `TPMT_PUBLIC`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RsaPublicArea {
    pub name_alg: u16,
    pub object_attributes: u32,
    pub auth_policy: Vec<u8>,
    /// `(algorithm, keyBits, mode)` of the symmetric definition, `None` for `TPM_ALG_NULL`.
    pub symmetric: Option<(u16, u16, u16)>,
    pub scheme: u16,
    pub scheme_hash: Option<u16>,
    pub key_bits: u16,
    /// Zero encodes the default exponent 65537.
    pub exponent: u32,
    pub modulus: Vec<u8>,
}

const DEFAULT_RSA_EXPONENT: u32 = 65537;

impl RsaPublicArea {
    /// Describe an RSASSA/SHA-256 signing key with the given attributes.
    pub fn signing_key(key: &RsaPublicKey, object_attributes: u32) -> Self {
        let modulus = key.n().to_bytes_be();
        let exponent = match <[u8; 4]>::try_from(
            {
                let be = key.e().to_bytes_be();
                let mut padded = vec![0u8; 4usize.saturating_sub(be.len())];
                padded.extend_from_slice(&be);
                padded
            }
            .as_slice(),
        )
        .map(u32::from_be_bytes)
        {
            Ok(DEFAULT_RSA_EXPONENT) => 0,
            Ok(e) => e,
            Err(_) => 0,
        };
        Self {
            name_alg: TPM_ALG_SHA256,
            object_attributes,
            auth_policy: Vec::new(),
            symmetric: None,
            scheme: TPM_ALG_RSASSA,
            scheme_hash: Some(TPM_ALG_SHA256),
            key_bits: (modulus.len() * 8) as u16,
            exponent,
            modulus,
        }
    }

    pub fn marshal(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.modulus.len() + 32);
        out.extend_from_slice(&TPM_ALG_RSA.to_be_bytes());
        out.extend_from_slice(&self.name_alg.to_be_bytes());
        out.extend_from_slice(&self.object_attributes.to_be_bytes());
        put_tpm2b(&mut out, &self.auth_policy, "authPolicy")?;
        match self.symmetric {
            None => out.extend_from_slice(&TPM_ALG_NULL.to_be_bytes()),
            Some((alg, bits, mode)) => {
                out.extend_from_slice(&alg.to_be_bytes());
                out.extend_from_slice(&bits.to_be_bytes());
                out.extend_from_slice(&mode.to_be_bytes());
            }
        }
        out.extend_from_slice(&self.scheme.to_be_bytes());
        if let Some(hash) = self.scheme_hash {
            out.extend_from_slice(&hash.to_be_bytes());
        }
        out.extend_from_slice(&self.key_bits.to_be_bytes());
        out.extend_from_slice(&self.exponent.to_be_bytes());
        put_tpm2b(&mut out, &self.modulus, "unique.rsa")?;
        Ok(out)
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let alg = reader.u16("TPMT_PUBLIC.type")?;
        if alg != TPM_ALG_RSA {
            return Err(StructError::Unsupported {
                field: "TPMT_PUBLIC.type",
                value: alg,
            });
        }
        let name_alg = reader.u16("TPMT_PUBLIC.nameAlg")?;
        let object_attributes = reader.u32("TPMT_PUBLIC.objectAttributes")?;
        let auth_policy = reader.tpm2b("TPMT_PUBLIC.authPolicy")?;
        let symmetric = match reader.u16("TPMT_SYM_DEF_OBJECT.algorithm")? {
            TPM_ALG_NULL => None,
            sym => Some((
                sym,
                reader.u16("TPMT_SYM_DEF_OBJECT.keyBits")?,
                reader.u16("TPMT_SYM_DEF_OBJECT.mode")?,
            )),
        };
        let scheme = reader.u16("TPMT_RSA_SCHEME.scheme")?;
        let scheme_hash = match scheme {
            TPM_ALG_NULL => None,
            _ => Some(reader.u16("TPMT_RSA_SCHEME.hashAlg")?),
        };
        let key_bits = reader.u16("TPMS_RSA_PARMS.keyBits")?;
        let exponent = reader.u32("TPMS_RSA_PARMS.exponent")?;
        let modulus = reader.tpm2b("TPMT_PUBLIC.unique")?;
        reader.finish()?;

        Ok(Self {
            name_alg,
            object_attributes,
            auth_policy,
            symmetric,
            scheme,
            scheme_hash,
            key_bits,
            exponent,
            modulus,
        })
    }

    /// The TPM Name of the object: `nameAlg || H_nameAlg(TPMT_PUBLIC)`.
    pub fn name(&self) -> Result<Vec<u8>> {
        let alg = HashAlgorithm::from_tpm_alg_id(self.name_alg).ok_or(
            StructError::Unsupported {
                field: "TPMT_PUBLIC.nameAlg",
                value: self.name_alg,
            },
        )?;
        let mut name = self.name_alg.to_be_bytes().to_vec();
        name.extend(alg.digest(&self.marshal()?));
        Ok(name)
    }

    pub fn rsa_public_key(&self) -> std::result::Result<RsaPublicKey, rsa::Error> {
        let e = match self.exponent {
            0 => DEFAULT_RSA_EXPONENT,
            e => e,
        };
        RsaPublicKey::new(
            BigUint::from_bytes_be(&self.modulus),
            BigUint::from(e),
        )
    }
}

/// RSASSA flavour of `TPMT_SIGNATURE`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RsaSignature {
    pub hash: u16,
    pub signature: Vec<u8>,
}

impl RsaSignature {
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.signature.len() + 6);
        out.extend_from_slice(&TPM_ALG_RSASSA.to_be_bytes());
        out.extend_from_slice(&self.hash.to_be_bytes());
        put_tpm2b(&mut out, &self.signature, "TPMS_SIGNATURE_RSA.sig")?;
        Ok(out)
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let sig_alg = reader.u16("TPMT_SIGNATURE.sigAlg")?;
        if sig_alg != TPM_ALG_RSASSA {
            return Err(StructError::Unsupported {
                field: "TPMT_SIGNATURE.sigAlg",
                value: sig_alg,
            });
        }
        let hash = reader.u16("TPMS_SIGNATURE_RSA.hash")?;
        let signature = reader.tpm2b("TPMS_SIGNATURE_RSA.sig")?;
        reader.finish()?;
        Ok(Self { hash, signature })
    }
}

/// The PCR values a quote was taken over: one selection and the values of
/// the selected registers in ascending index order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PcrBank {
    pub selection: PcrSelection,
    pub values: Vec<Vec<u8>>,
}

impl PcrBank {
    /// `TPML_PCR_SELECTION || count || TPM2B_DIGEST*`
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        marshal_selection_list(&mut out, std::slice::from_ref(&self.selection));
        out.extend_from_slice(&(self.values.len() as u32).to_be_bytes());
        for value in &self.values {
            put_tpm2b(&mut out, value, "TPM2B_DIGEST")?;
        }
        Ok(out)
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let mut selections = unmarshal_selection_list(&mut reader)?;
        if selections.len() != 1 {
            return Err(StructError::TooLarge("PCR bank selection list"));
        }
        let selection = selections.remove(0);
        let count = reader.u32("TPML_DIGEST.count")?;
        if count as usize != selection.pcrs.len() {
            return Err(StructError::Truncated("TPML_DIGEST"));
        }
        let values = (0..count)
            .map(|_| reader.tpm2b("TPM2B_DIGEST"))
            .collect::<Result<Vec<_>>>()?;
        reader.finish()?;
        Ok(Self { selection, values })
    }

    /// Composite digest a TPM puts in `TPMS_QUOTE_INFO.pcrDigest`.
    pub fn composite_digest(&self, alg: HashAlgorithm) -> Vec<u8> {
        alg.digest(&self.values.concat())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_quote_info() -> TpmsAttest {
        TpmsAttest {
            qualified_signer: vec![0x00, 0x0b, 1, 2, 3],
            extra_data: vec![0xaa; 32],
            clock_info: ClockInfo {
                clock: 42,
                reset_count: 1,
                restart_count: 2,
                safe: true,
            },
            firmware_version: 7,
            attested: Attested::Quote {
                pcr_select: vec![PcrSelection::new(TPM_ALG_SHA256, &[0, 7, 16, 23]).unwrap()],
                pcr_digest: vec![0x55; 32],
            },
        }
    }

    #[test]
    fn test_attest_layout_and_parse() {
        let attest = sample_quote_info();
        let bytes = attest.marshal().unwrap();
        assert_eq!(&bytes[..4], &[0xff, 0x54, 0x43, 0x47]);
        assert_eq!(&bytes[4..6], &[0x80, 0x18]);
        assert_eq!(TpmsAttest::unmarshal(&bytes).unwrap(), attest);
    }

    #[test]
    fn test_attest_rejects_foreign_magic() {
        let mut bytes = sample_quote_info().marshal().unwrap();
        bytes[0] = 0x00;
        assert!(matches!(
            TpmsAttest::unmarshal(&bytes),
            Err(StructError::NotTpmGenerated(_))
        ));
    }

    #[test]
    fn test_attest_rejects_trailing_and_truncated() {
        let mut bytes = sample_quote_info().marshal().unwrap();
        bytes.push(0);
        assert_eq!(
            TpmsAttest::unmarshal(&bytes),
            Err(StructError::TrailingBytes(1))
        );
        bytes.truncate(20);
        assert!(matches!(
            TpmsAttest::unmarshal(&bytes),
            Err(StructError::Truncated(_))
        ));
    }

    #[test]
    fn test_pcr_selection_bitmap() {
        let selection = PcrSelection::new(TPM_ALG_SHA256, &[7, 0, 7, 23]).unwrap();
        assert_eq!(selection.pcrs, vec![0, 7, 23]);
        assert_eq!(selection.bitmap(), [0b1000_0001, 0, 0b1000_0000]);
        assert_eq!(
            PcrSelection::new(TPM_ALG_SHA256, &[24]),
            Err(StructError::PcrOutOfRange(24))
        );
    }

    #[test]
    fn test_public_area_name_is_stable() {
        let area = RsaPublicArea {
            name_alg: TPM_ALG_SHA256,
            object_attributes: APP_KEY_ATTRIBUTES,
            auth_policy: vec![],
            symmetric: None,
            scheme: TPM_ALG_RSASSA,
            scheme_hash: Some(TPM_ALG_SHA256),
            key_bits: 2048,
            exponent: 0,
            modulus: vec![0xc3; 256],
        };
        let bytes = area.marshal().unwrap();
        assert_eq!(RsaPublicArea::unmarshal(&bytes).unwrap(), area);

        let name = area.name().unwrap();
        assert_eq!(&name[..2], &[0x00, 0x0b]);
        assert_eq!(name.len(), 34);

        let mut other = area.clone();
        other.modulus[0] = 0xc4;
        assert_ne!(other.name().unwrap(), name);
    }

    #[test]
    fn test_storage_parent_with_symmetric_definition_parses() {
        let area = RsaPublicArea {
            name_alg: TPM_ALG_SHA256,
            object_attributes: 0x0003_0072,
            auth_policy: vec![],
            symmetric: Some((0x0006, 128, 0x0043)),
            scheme: TPM_ALG_NULL,
            scheme_hash: None,
            key_bits: 2048,
            exponent: 0,
            modulus: vec![0x01; 256],
        };
        let bytes = area.marshal().unwrap();
        assert_eq!(RsaPublicArea::unmarshal(&bytes).unwrap(), area);
    }

    #[test]
    fn test_pcr_bank_composite_digest() {
        let bank = PcrBank {
            selection: PcrSelection::new(TPM_ALG_SHA256, &[0, 1]).unwrap(),
            values: vec![vec![0u8; 32], vec![1u8; 32]],
        };
        let parsed = PcrBank::unmarshal(&bank.marshal().unwrap()).unwrap();
        assert_eq!(parsed, bank);

        let mut material = vec![0u8; 32];
        material.extend(vec![1u8; 32]);
        assert_eq!(
            bank.composite_digest(HashAlgorithm::Sha256),
            HashAlgorithm::Sha256.digest(&material)
        );
    }

    #[test]
    fn test_signature_rejects_ecdsa() {
        let sig = RsaSignature {
            hash: TPM_ALG_SHA256,
            signature: vec![9; 256],
        };
        let bytes = sig.marshal().unwrap();
        assert_eq!(RsaSignature::unmarshal(&bytes).unwrap(), sig);

        let mut ecdsa = bytes.clone();
        ecdsa[1] = 0x18;
        assert!(matches!(
            RsaSignature::unmarshal(&ecdsa),
            Err(StructError::Unsupported { .. })
        ));
    }
}
