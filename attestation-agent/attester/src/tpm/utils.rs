// Copyright (c) 2024 The Sovereign Attestation Authors
//
// SPDX-License-Identifier: Apache-2.0
//
use anyhow::Context;
use anyhow::*;
use openssl::x509::X509;
use rsa as rust_rsa;
use sovereign_types::tpm_structs::{RsaSignature, TPM_ALG_SHA256};
use std::str::FromStr;
use tss_esapi::abstraction::{
    ak::{create_ak, load_ak},
    ek::{create_ek_object, retrieve_ek_pubcert},
    pcr,
    public::DecodedKey,
    DefaultKey,
};
use tss_esapi::abstraction::AsymmetricAlgorithmSelection;
use tss_esapi::attributes::ObjectAttributes;
use tss_esapi::handles::{KeyHandle, ObjectHandle, PersistentTpmHandle, TpmHandle};
use tss_esapi::interface_types::algorithm::{
    AsymmetricAlgorithm, HashingAlgorithm, PublicAlgorithm, RsaSchemeAlgorithm,
    SignatureSchemeAlgorithm,
};
use tss_esapi::interface_types::dynamic_handles::Persistent;
use tss_esapi::interface_types::key_bits::RsaKeyBits;
use tss_esapi::interface_types::resource_handles::{Hierarchy, Provision};
use tss_esapi::interface_types::session_handles::AuthSession;
use tss_esapi::structures::{
    pcr_selection_list::PcrSelectionListBuilder, pcr_slot::PcrSlot, AttestInfo, Data,
    PcrSelectionList, Private, Public, PublicKeyRsa, PublicRsaParameters, RsaExponent, RsaScheme,
    Signature, SignatureScheme, SymmetricDefinitionObject,
};
use tss_esapi::tcti_ldr::{DeviceConfig, TctiNameConf};
use tss_esapi::traits::Marshall;
use tss_esapi::Context as TssContext;

const TPM_QUOTE_PCR_SLOTS: [PcrSlot; 24] = [
    PcrSlot::Slot0,
    PcrSlot::Slot1,
    PcrSlot::Slot2,
    PcrSlot::Slot3,
    PcrSlot::Slot4,
    PcrSlot::Slot5,
    PcrSlot::Slot6,
    PcrSlot::Slot7,
    PcrSlot::Slot8,
    PcrSlot::Slot9,
    PcrSlot::Slot10,
    PcrSlot::Slot11,
    PcrSlot::Slot12,
    PcrSlot::Slot13,
    PcrSlot::Slot14,
    PcrSlot::Slot15,
    PcrSlot::Slot16,
    PcrSlot::Slot17,
    PcrSlot::Slot18,
    PcrSlot::Slot19,
    PcrSlot::Slot20,
    PcrSlot::Slot21,
    PcrSlot::Slot22,
    PcrSlot::Slot23,
];

/// TCTI from configuration, then `TEST_TCTI`, then the default device.
pub fn create_tcti(tcti: Option<&str>) -> Result<TctiNameConf> {
    let configured = tcti
        .map(str::to_string)
        .or_else(|| std::env::var("TEST_TCTI").ok());
    match configured {
        None => Ok(TctiNameConf::Device(DeviceConfig::default())),
        Some(tctistr) => Ok(TctiNameConf::from_str(&tctistr)?),
    }
}

pub fn create_ctx(tcti: Option<&str>) -> Result<TssContext> {
    let tcti = create_tcti(tcti)?;
    let ctx = TssContext::new(tcti)?;
    Ok(ctx)
}

pub fn create_pcr_selection_list(pcrs: &[u8]) -> Result<PcrSelectionList> {
    let slots = pcrs
        .iter()
        .map(|i| {
            TPM_QUOTE_PCR_SLOTS
                .get(*i as usize)
                .copied()
                .ok_or_else(|| anyhow!("PCR {i} out of range"))
        })
        .collect::<Result<Vec<_>>>()?;

    PcrSelectionListBuilder::new()
        .with_selection(HashingAlgorithm::Sha256, &slots)
        .build()
        .context("Build PCR selection list failed")
}

/// SHA-256 values of the selected PCRs, ascending index order.
pub fn read_pcrs(ctx: &mut TssContext, pcrs: &[u8]) -> Result<Vec<Vec<u8>>> {
    let selection_list = create_pcr_selection_list(pcrs)?;
    let pcr_data = pcr::read_all(ctx, selection_list)?;
    let pcr_bank = pcr_data
        .pcr_bank(HashingAlgorithm::Sha256)
        .ok_or(anyhow!("PCR bank not found"))?;

    Ok(pcr_bank
        .into_iter()
        .map(|(_, digest)| digest.value().to_vec())
        .collect())
}

fn storage_primary(ctx: &mut TssContext) -> Result<KeyHandle> {
    let object_attributes = ObjectAttributes::builder()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_restricted(true)
        .with_decrypt(true)
        .build()?;
    let rsa_params = PublicRsaParameters::builder()
        .with_symmetric(SymmetricDefinitionObject::AES_128_CFB)
        .with_scheme(RsaScheme::Null)
        .with_key_bits(RsaKeyBits::Rsa2048)
        .with_exponent(RsaExponent::default())
        .build()?;
    let template = Public::builder()
        .with_public_algorithm(PublicAlgorithm::Rsa)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(object_attributes)
        .with_rsa_parameters(rsa_params)
        .with_rsa_unique_identifier(PublicKeyRsa::default())
        .build()?;

    let primary = ctx
        .execute_with_nullauth_session(|ctx| {
            ctx.create_primary(Hierarchy::Owner, template, None, None, None, None)
        })
        .context("Create storage primary failed")?;
    Ok(primary.key_handle)
}

/// Unrestricted RSA-2048 RSASSA/SHA-256 signing key.
fn app_key_template() -> Result<Public> {
    let object_attributes = ObjectAttributes::builder()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_sign_encrypt(true)
        .build()?;
    let rsa_params = PublicRsaParameters::builder()
        .with_scheme(RsaScheme::create(
            RsaSchemeAlgorithm::RsaSsa,
            Some(HashingAlgorithm::Sha256),
        )?)
        .with_key_bits(RsaKeyBits::Rsa2048)
        .with_exponent(RsaExponent::default())
        .build()?;

    Ok(Public::builder()
        .with_public_algorithm(PublicAlgorithm::Rsa)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(object_attributes)
        .with_rsa_parameters(rsa_params)
        .with_rsa_unique_identifier(PublicKeyRsa::default())
        .build()?)
}

pub fn persistent_object(ctx: &mut TssContext, handle: u32) -> Result<ObjectHandle> {
    let persistent = PersistentTpmHandle::new(handle)?;
    ctx.tr_from_tpm_public(TpmHandle::Persistent(persistent))
        .with_context(|| format!("No object persisted at {handle:#010X}"))
}

/// Create an App Key under the owner storage primary and persist it at
/// `handle`, evicting any stale key found there.
pub fn create_persistent_app_key(ctx: &mut TssContext, handle: u32) -> Result<()> {
    let persistent = PersistentTpmHandle::new(handle)?;
    let template = app_key_template()?;
    let primary = storage_primary(ctx)?;

    let created = ctx
        .execute_with_nullauth_session(|ctx| ctx.create(primary, template, None, None, None, None))
        .context("Create App Key failed")?;
    let key_handle = ctx
        .execute_with_nullauth_session(|ctx| {
            ctx.load(primary, created.out_private, created.out_public)
        })
        .context("Load App Key failed")?;

    let stale = ctx.tr_from_tpm_public(TpmHandle::Persistent(persistent));
    if let std::result::Result::Ok(stale) = stale {
        log::info!("Evicting stale key at {handle:#010X}");
        ctx.execute_with_session(Some(AuthSession::Password), |ctx| {
            ctx.evict_control(Provision::Owner, stale, Persistent::Persistent(persistent))
        })?;
    }
    ctx.execute_with_session(Some(AuthSession::Password), |ctx| {
        ctx.evict_control(
            Provision::Owner,
            key_handle.into(),
            Persistent::Persistent(persistent),
        )
    })
    .context("Persist App Key failed")?;

    ctx.flush_context(key_handle.into())?;
    ctx.flush_context(primary.into())?;
    Ok(())
}

pub fn rsa_public_key(public: Public) -> Result<rust_rsa::RsaPublicKey> {
    let decoded_key: DecodedKey = public.try_into()?;
    let DecodedKey::RsaPublicKey(rsa_pk) = decoded_key else {
        bail!("unexpected key type");
    };

    let bytes = rsa_pk.modulus.as_unsigned_bytes_be();
    let n = rust_rsa::BigUint::from_bytes_be(bytes);
    let bytes = rsa_pk.public_exponent.as_unsigned_bytes_be();
    let e = rust_rsa::BigUint::from_bytes_be(bytes);

    let pkey = rust_rsa::RsaPublicKey::new(n, e)?;
    Ok(pkey)
}

/// Public key of a loaded object and its marshalled `TPMT_PUBLIC`.
pub fn read_public(
    ctx: &mut TssContext,
    object: ObjectHandle,
) -> Result<(rust_rsa::RsaPublicKey, Vec<u8>)> {
    let (public, _, _) = ctx.read_public(object.into())?;
    let tpm_public = public.marshall()?;
    Ok((rsa_public_key(public)?, tpm_public))
}

fn rsassa_signature(signature: Signature) -> Result<Vec<u8>> {
    let Signature::RsaSsa(rsa_sig) = signature else {
        bail!("Wrong Signature");
    };
    if rsa_sig.hashing_algorithm() != HashingAlgorithm::Sha256 {
        bail!("Signature is not over SHA-256");
    }

    Ok(RsaSignature {
        hash: TPM_ALG_SHA256,
        signature: rsa_sig.signature().value().to_vec(),
    }
    .marshal()?)
}

/// `TPM2_Quote` with the key's own scheme. Returns the marshalled
/// `TPMS_ATTEST` and `TPMT_SIGNATURE`.
pub fn quote(
    ctx: &mut TssContext,
    key: KeyHandle,
    nonce: &[u8],
    pcrs: &[u8],
) -> Result<(Vec<u8>, Vec<u8>)> {
    let selection_list = create_pcr_selection_list(pcrs)?;
    let qualifying_data = Data::try_from(nonce.to_vec())?;

    let (attest, signature) = ctx
        .execute_with_nullauth_session(|ctx| {
            ctx.quote(key, qualifying_data, SignatureScheme::Null, selection_list)
        })
        .context("Call TPM Quote API failed")?;

    let AttestInfo::Quote { .. } = attest.attested() else {
        bail!("Get Quote failed");
    };

    Ok((attest.marshall()?, rsassa_signature(signature)?))
}

/// `TPM2_Certify` of `object` by `ak`.
pub fn certify(
    ctx: &mut TssContext,
    object: ObjectHandle,
    ak: KeyHandle,
    qualifying_data: &[u8],
) -> Result<(Vec<u8>, Vec<u8>)> {
    let qualifying_data = Data::try_from(qualifying_data.to_vec())?;

    let (attest, signature) = ctx
        .execute_with_sessions(
            (
                Some(AuthSession::Password),
                Some(AuthSession::Password),
                None,
            ),
            |ctx| ctx.certify(object, ak, qualifying_data, SignatureScheme::Null),
        )
        .context("Call TPM Certify API failed")?;

    let AttestInfo::Certify { .. } = attest.attested() else {
        bail!("Get Certify failed");
    };

    Ok((attest.marshall()?, rsassa_signature(signature)?))
}

pub fn dump_ek_cert_pem(ctx: &mut TssContext) -> Result<String> {
    let ek_cert_bytes = retrieve_ek_pubcert(
        ctx,
        AsymmetricAlgorithmSelection::Rsa(RsaKeyBits::Rsa2048),
    )?;
    let ek_cert_x509 = X509::from_der(&ek_cert_bytes)?;
    let ek_cert_pem_bytes = ek_cert_x509.to_pem()?;
    let ek_cert = String::from_utf8(ek_cert_pem_bytes)?;

    Ok(ek_cert)
}

#[derive(Clone)]
pub struct AttestationKey {
    pub ak_private: Private,
    pub ak_public: Public,
}

pub fn generate_rsa_ak(ctx: &mut TssContext) -> Result<AttestationKey> {
    let ek_handle = create_ek_object(ctx, AsymmetricAlgorithm::Rsa, DefaultKey)?;

    let ak = create_ak(
        ctx,
        ek_handle,
        HashingAlgorithm::Sha256,
        SignatureSchemeAlgorithm::RsaSsa,
        None,
        DefaultKey,
    )?;
    ctx.flush_context(ek_handle.into())?;

    Ok(AttestationKey {
        ak_private: ak.out_private,
        ak_public: ak.out_public,
    })
}

pub fn load_attestation_key(ctx: &mut TssContext, ak: AttestationKey) -> Result<KeyHandle> {
    let ek_handle = create_ek_object(ctx, AsymmetricAlgorithm::Rsa, DefaultKey)?;
    let key_handle = load_ak(ctx, ek_handle, None, ak.ak_private, ak.ak_public)?;
    ctx.flush_context(ek_handle.into())?;
    Ok(key_handle)
}
