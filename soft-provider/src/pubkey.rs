// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! SubjectPublicKeyInfo parsing and printing

use std::fmt;

use anyhow::{anyhow, bail, Context, Result};
use rsa::{pkcs1::DecodeRsaPublicKey, pkcs8::EncodePublicKey, traits::PublicKeyParts, RsaPublicKey};
use tpm_types::{EcGroup, KeyAlgorithm};
use tracing::debug;
use x509_parser::prelude::*;

const OID_RSA_ENCRYPTION: &[u64] = &[1, 2, 840, 113549, 1, 1, 1];
const OID_EC_PUBLIC_KEY: &[u64] = &[1, 2, 840, 10045, 2, 1];
const OID_PRIME256V1: &[u64] = &[1, 2, 840, 10045, 3, 1, 7];
const OID_SECP384R1: &[u64] = &[1, 3, 132, 0, 34];

const PUBLIC_KEY_PEM_TAG: &str = "PUBLIC KEY";

/// Public half of an RSA or EC key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SoftPublicKey {
    Rsa(RsaPublicKey),
    P256(p256::ecdsa::VerifyingKey),
    P384(p384::ecdsa::VerifyingKey),
}

impl SoftPublicKey {
    /// Parse a `PUBLIC KEY` PEM block
    pub fn from_pem(pem: &str) -> Result<Self> {
        let pem = ::pem::parse(pem).context("failed to parse public key PEM")?;
        if pem.tag() != PUBLIC_KEY_PEM_TAG {
            bail!("expected a {PUBLIC_KEY_PEM_TAG} PEM block, got {}", pem.tag());
        }
        Self::from_der(pem.contents())
    }

    /// Parse a DER encoded SubjectPublicKeyInfo
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, spki) =
            SubjectPublicKeyInfo::from_der(der).context("failed to parse SubjectPublicKeyInfo")?;

        let oid: Vec<u64> = spki
            .algorithm
            .algorithm
            .iter()
            .ok_or_else(|| anyhow!("invalid OID"))?
            .collect();
        let key_bytes = spki.subject_public_key.data.as_ref();

        if oid == OID_RSA_ENCRYPTION {
            let key = RsaPublicKey::from_pkcs1_der(key_bytes)
                .context("failed to decode RSA public key")?;
            debug!("parsed RSA public key ({} bits)", key.size() * 8);
            Ok(Self::Rsa(key))
        } else if oid == OID_EC_PUBLIC_KEY {
            let curve: Vec<u64> = spki
                .algorithm
                .parameters
                .as_ref()
                .and_then(|params| params.as_oid().ok())
                .and_then(|curve| curve.iter().map(|arcs| arcs.collect()))
                .ok_or_else(|| anyhow!("EC public key without a named curve"))?;

            // from_sec1_bytes takes both compressed and uncompressed points
            if curve == OID_PRIME256V1 {
                let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(key_bytes)
                    .context("failed to decode P-256 public key")?;
                debug!("parsed EC P-256 public key");
                Ok(Self::P256(key))
            } else if curve == OID_SECP384R1 {
                let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(key_bytes)
                    .context("failed to decode P-384 public key")?;
                debug!("parsed EC P-384 public key");
                Ok(Self::P384(key))
            } else {
                bail!("unsupported EC curve: {curve:?}");
            }
        } else {
            bail!("unsupported public key algorithm: {oid:?}");
        }
    }

    pub fn to_pem(&self) -> Result<String> {
        use rsa::pkcs8::LineEnding::LF;
        let pem = match self {
            Self::Rsa(key) => key.to_public_key_pem(LF),
            Self::P256(key) => p256::PublicKey::from(key).to_public_key_pem(LF),
            Self::P384(key) => p384::PublicKey::from(key).to_public_key_pem(LF),
        };
        pem.map_err(|e| anyhow!("failed to encode public key: {e}"))
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            Self::Rsa(_) => KeyAlgorithm::Rsa,
            Self::P256(_) | Self::P384(_) => KeyAlgorithm::Ec,
        }
    }

    pub fn ec_group(&self) -> Option<EcGroup> {
        match self {
            Self::Rsa(_) => None,
            Self::P256(_) => Some(EcGroup::P256),
            Self::P384(_) => Some(EcGroup::P384),
        }
    }

    pub fn bits(&self) -> usize {
        match self {
            Self::Rsa(key) => key.n().bits(),
            Self::P256(_) => EcGroup::P256.bits(),
            Self::P384(_) => EcGroup::P384.bits(),
        }
    }

    fn ec_point(&self) -> Option<Vec<u8>> {
        match self {
            Self::Rsa(_) => None,
            Self::P256(key) => Some(key.to_encoded_point(false).as_bytes().to_vec()),
            Self::P384(key) => Some(key.to_encoded_point(false).as_bytes().to_vec()),
        }
    }
}

/// Colon separated hex, 15 bytes per line
fn write_hex_block(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for (i, line) in bytes.chunks(15).enumerate() {
        let last = (i + 1) * 15 >= bytes.len();
        let hex: Vec<String> = line.iter().map(|b| format!("{b:02x}")).collect();
        write!(f, "    {}", hex.join(":"))?;
        if !last {
            f.write_str(":")?;
        }
        writeln!(f)?;
    }
    Ok(())
}

/// Text dump in the layout of `openssl pkey -pubin -text_pub`
impl fmt::Display for SoftPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Public-Key: ({} bit)", self.bits())?;
        match self {
            Self::Rsa(key) => {
                let mut modulus = key.n().to_bytes_be();
                if modulus.first().is_some_and(|b| b & 0x80 != 0) {
                    modulus.insert(0, 0);
                }
                writeln!(f, "Modulus:")?;
                write_hex_block(f, &modulus)?;
                let exponent = key
                    .e()
                    .to_bytes_be()
                    .iter()
                    .fold(0u64, |acc, b| (acc << 8) | *b as u64);
                writeln!(f, "Exponent: {exponent} (0x{exponent:x})")
            }
            Self::P256(_) | Self::P384(_) => {
                let point = self.ec_point().unwrap_or_default();
                writeln!(f, "pub:")?;
                write_hex_block(f, &point)?;
                if let Some(group) = self.ec_group() {
                    writeln!(f, "ASN1 OID: {}", group.asn1_name())?;
                    writeln!(f, "NIST CURVE: {}", group.nist_name())?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    /// DER encoded namedCurve OIDs
    const PRIME256V1_DER: &[u8] = &[0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];
    const SECP384R1_DER: &[u8] = &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x22];
    const SECP256K1_DER: &[u8] = &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x0a];

    fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
        assert!(content.len() < 0x80);
        let mut out = vec![tag, content.len() as u8];
        out.extend_from_slice(content);
        out
    }

    /// EC SubjectPublicKeyInfo with the given curve and raw point
    fn ec_spki(curve_oid: &[u8], point: &[u8]) -> Vec<u8> {
        let mut algorithm = vec![0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01];
        algorithm.extend_from_slice(curve_oid);
        let mut bits = vec![0x00];
        bits.extend_from_slice(point);

        let mut body = tlv(0x30, &algorithm);
        body.extend(tlv(0x03, &bits));
        tlv(0x30, &body)
    }

    #[test]
    fn test_rsa_from_pem() {
        let private = rsa::RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let pem = private
            .to_public_key()
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();

        let key = SoftPublicKey::from_pem(&pem).unwrap();
        assert_eq!(key.algorithm(), KeyAlgorithm::Rsa);
        assert_eq!(key.bits(), 1024);
        assert_eq!(key.to_pem().unwrap(), pem);

        let text = key.to_string();
        assert!(text.starts_with("Public-Key: (1024 bit)\nModulus:\n    00:"));
        assert!(text.ends_with("Exponent: 65537 (0x10001)\n"));
    }

    #[test]
    fn test_ec_from_pem() {
        let signing = p256::ecdsa::SigningKey::random(&mut OsRng);
        let pem = p256::PublicKey::from(signing.verifying_key())
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();

        let key = SoftPublicKey::from_pem(&pem).unwrap();
        assert_eq!(key.ec_group(), Some(EcGroup::P256));
        assert_eq!(key.bits(), 256);

        let text = key.to_string();
        assert!(text.contains("pub:\n    04:"));
        assert!(text.contains("ASN1 OID: prime256v1\nNIST CURVE: P-256\n"));
    }

    #[test]
    fn test_p384_from_der() {
        let signing = p384::ecdsa::SigningKey::random(&mut OsRng);
        let der = p384::PublicKey::from(signing.verifying_key())
            .to_public_key_der()
            .unwrap();
        let key = SoftPublicKey::from_der(der.as_bytes()).unwrap();
        assert!(matches!(key, SoftPublicKey::P384(vk) if &vk == signing.verifying_key()));

        let point = signing.verifying_key().to_encoded_point(false);
        assert_eq!(ec_spki(SECP384R1_DER, point.as_bytes()), der.as_bytes());
    }

    #[test]
    fn test_compressed_points() {
        let p256_key = p256::ecdsa::SigningKey::random(&mut OsRng);
        let point = p256_key.verifying_key().to_encoded_point(true);
        assert_eq!(point.len(), 33);
        let key = SoftPublicKey::from_der(&ec_spki(PRIME256V1_DER, point.as_bytes())).unwrap();
        assert!(matches!(key, SoftPublicKey::P256(vk) if &vk == p256_key.verifying_key()));

        let p384_key = p384::ecdsa::SigningKey::random(&mut OsRng);
        let point = p384_key.verifying_key().to_encoded_point(true);
        assert_eq!(point.len(), 49);
        let key = SoftPublicKey::from_der(&ec_spki(SECP384R1_DER, point.as_bytes())).unwrap();
        assert!(matches!(key, SoftPublicKey::P384(vk) if &vk == p384_key.verifying_key()));
    }

    #[test]
    fn test_curve_follows_named_curve() {
        let signing = p256::ecdsa::SigningKey::random(&mut OsRng);
        let point = signing.verifying_key().to_encoded_point(false);

        // A P-256 point labelled as P-384 is not silently taken as P-256
        assert!(SoftPublicKey::from_der(&ec_spki(SECP384R1_DER, point.as_bytes())).is_err());

        let err = SoftPublicKey::from_der(&ec_spki(SECP256K1_DER, point.as_bytes())).unwrap_err();
        assert!(err.to_string().contains("unsupported EC curve"));

        // No parameters at all
        let algorithm = tlv(0x30, &[0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01]);
        let mut bits = vec![0x00];
        bits.extend_from_slice(point.as_bytes());
        let mut body = algorithm;
        body.extend(tlv(0x03, &bits));
        let err = SoftPublicKey::from_der(&tlv(0x30, &body)).unwrap_err();
        assert!(err.to_string().contains("named curve"));
    }

    #[test]
    fn test_rejects_private_key_pem() {
        let pem = ::pem::encode(&::pem::Pem::new("TSS2 PRIVATE KEY", vec![0x30, 0x00]));
        let err = SoftPublicKey::from_pem(&pem).unwrap_err();
        assert!(err.to_string().contains("PUBLIC KEY"));
    }
}
