// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Conversions from a TPM public area to standard public key encodings

use anyhow::{anyhow, bail, Context, Result};
use tpm_types::{EcGroup, KeySpec};
use tss_esapi::{
    interface_types::{ecc::EccCurve, key_bits::RsaKeyBits},
    structures::Public,
};

/// Exponent used by the TPM when the public area carries 0
const DEFAULT_RSA_EXPONENT: u32 = 65537;

pub(crate) fn ec_group(curve: EccCurve) -> Result<EcGroup> {
    match curve {
        EccCurve::NistP256 => Ok(EcGroup::P256),
        EccCurve::NistP384 => Ok(EcGroup::P384),
        other => bail!("unsupported ECC curve: {other:?}"),
    }
}

pub(crate) fn ecc_curve(group: EcGroup) -> EccCurve {
    match group {
        EcGroup::P256 => EccCurve::NistP256,
        EcGroup::P384 => EccCurve::NistP384,
    }
}

/// Recover the key spec a public area was generated from
pub(crate) fn key_spec(public: &Public) -> Result<KeySpec> {
    match public {
        Public::Rsa { parameters, .. } => {
            let bits: u16 = match parameters.key_bits() {
                RsaKeyBits::Rsa1024 => 1024,
                RsaKeyBits::Rsa2048 => 2048,
                RsaKeyBits::Rsa3072 => 3072,
                RsaKeyBits::Rsa4096 => 4096,
            };
            Ok(KeySpec::rsa(bits)?)
        }
        Public::Ecc { parameters, .. } => Ok(KeySpec::ec(ec_group(parameters.ecc_curve())?)),
        _ => bail!("TPM object is neither an RSA nor an ECC key"),
    }
}

fn rsa_public_key(public: &Public) -> Result<Option<rsa::RsaPublicKey>> {
    let Public::Rsa {
        parameters, unique, ..
    } = public
    else {
        return Ok(None);
    };
    let exponent = match parameters.exponent().value() {
        0 => DEFAULT_RSA_EXPONENT,
        e => e,
    };
    let key = rsa::RsaPublicKey::new(
        rsa::BigUint::from_bytes_be(unique.value()),
        rsa::BigUint::from(exponent),
    )
    .context("TPM returned an invalid RSA public key")?;
    Ok(Some(key))
}

/// Uncompressed SEC1 point `04 || x || y`, coordinates left padded
fn sec1_point(x: &[u8], y: &[u8], field_len: usize) -> Result<Vec<u8>> {
    if x.len() > field_len || y.len() > field_len {
        bail!("ECC point coordinate longer than {field_len} bytes");
    }
    let mut point = vec![0u8; 1 + field_len * 2];
    point[0] = 0x04;
    point[1 + field_len - x.len()..1 + field_len].copy_from_slice(x);
    point[1 + field_len * 2 - y.len()..].copy_from_slice(y);
    Ok(point)
}

/// SubjectPublicKeyInfo of a TPM public area, PEM encoded
pub(crate) fn spki_pem(public: &Public) -> Result<String> {
    use p256::pkcs8::{EncodePublicKey as _, LineEnding};

    if let Some(key) = rsa_public_key(public)? {
        return rsa::pkcs8::EncodePublicKey::to_public_key_pem(&key, rsa::pkcs8::LineEnding::LF)
            .map_err(|e| anyhow!("failed to encode RSA public key: {e}"));
    }

    let Public::Ecc {
        parameters, unique, ..
    } = public
    else {
        bail!("TPM object is neither an RSA nor an ECC key");
    };
    let group = ec_group(parameters.ecc_curve())?;
    let point = sec1_point(unique.x().value(), unique.y().value(), group.field_len())?;
    let pem = match group {
        EcGroup::P256 => p256::PublicKey::from_sec1_bytes(&point)
            .map_err(|e| anyhow!("TPM returned an invalid P-256 point: {e}"))?
            .to_public_key_pem(LineEnding::LF),
        EcGroup::P384 => p384::PublicKey::from_sec1_bytes(&point)
            .map_err(|e| anyhow!("TPM returned an invalid P-384 point: {e}"))?
            .to_public_key_pem(LineEnding::LF),
    };
    pem.map_err(|e| anyhow!("failed to encode EC public key: {e}"))
}
