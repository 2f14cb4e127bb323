// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM Types - Common key and provider type definitions
//!
//! This crate contains type definitions shared across the provider crates:
//! - tpm-provider (hardware side - generates keys, signs, decrypts)
//! - soft-provider (software side - verifies, encrypts)
//! - tpm-demo (sequences both)

use std::{fmt, str::FromStr};

use anyhow::Result;
use sha2::{Digest, Sha256, Sha384};

/// Error returned when a name or parameter cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unsupported hash algorithm: {0}")]
    HashAlg(String),
    #[error("unsupported EC group: {0}")]
    EcGroup(String),
    #[error("unsupported RSA key size: {0}")]
    RsaBits(String),
    #[error("unknown key algorithm: {0}")]
    KeyAlgorithm(String),
    #[error("unknown key parameter `{name}` for {alg}")]
    UnknownParam { alg: KeyAlgorithm, name: String },
    #[error("unknown provider: {0}")]
    Provider(String),
    #[error("unsupported padding: {0}")]
    Padding(String),
}

/// Digest algorithm used for signing and OAEP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlg {
    Sha256,
    Sha384,
}

impl HashAlg {
    /// Digest length in bytes
    pub fn digest_len(self) -> usize {
        match self {
            HashAlg::Sha256 => 32,
            HashAlg::Sha384 => 48,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlg::Sha256 => Sha256::digest(data).to_vec(),
            HashAlg::Sha384 => Sha384::digest(data).to_vec(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HashAlg::Sha256 => "sha256",
            HashAlg::Sha384 => "sha384",
        }
    }
}

impl FromStr for HashAlg {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha2-256" | "sha-256" => Ok(HashAlg::Sha256),
            "sha384" | "sha2-384" | "sha-384" => Ok(HashAlg::Sha384),
            _ => Err(ParseError::HashAlg(s.to_string())),
        }
    }
}

impl fmt::Display for HashAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Named elliptic curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EcGroup {
    P256,
    P384,
}

impl EcGroup {
    pub fn bits(self) -> usize {
        match self {
            EcGroup::P256 => 256,
            EcGroup::P384 => 384,
        }
    }

    /// Size of one field element in bytes
    pub fn field_len(self) -> usize {
        self.bits() / 8
    }

    /// NIST name, e.g. "P-256"
    pub fn nist_name(self) -> &'static str {
        match self {
            EcGroup::P256 => "P-256",
            EcGroup::P384 => "P-384",
        }
    }

    /// ASN.1 short name, e.g. "prime256v1"
    pub fn asn1_name(self) -> &'static str {
        match self {
            EcGroup::P256 => "prime256v1",
            EcGroup::P384 => "secp384r1",
        }
    }

    /// Hash that matches the curve strength
    pub fn default_hash(self) -> HashAlg {
        match self {
            EcGroup::P256 => HashAlg::Sha256,
            EcGroup::P384 => HashAlg::Sha384,
        }
    }
}

impl FromStr for EcGroup {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "p-256" | "p256" | "prime256v1" | "secp256r1" => Ok(EcGroup::P256),
            "p-384" | "p384" | "secp384r1" => Ok(EcGroup::P384),
            _ => Err(ParseError::EcGroup(s.to_string())),
        }
    }
}

impl fmt::Display for EcGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.nist_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    Rsa,
    Ec,
}

impl FromStr for KeyAlgorithm {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RSA" => Ok(KeyAlgorithm::Rsa),
            "EC" | "ECC" | "ECDSA" => Ok(KeyAlgorithm::Ec),
            _ => Err(ParseError::KeyAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAlgorithm::Rsa => f.write_str("RSA"),
            KeyAlgorithm::Ec => f.write_str("EC"),
        }
    }
}

/// RSA modulus sizes a TPM can be asked for
pub const RSA_KEY_SIZES: &[u16] = &[1024, 2048, 3072, 4096];

/// What kind of key to generate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpec {
    Rsa { bits: u16 },
    Ec { group: EcGroup },
}

impl KeySpec {
    pub fn rsa(bits: u16) -> Result<Self, ParseError> {
        if !RSA_KEY_SIZES.contains(&bits) {
            return Err(ParseError::RsaBits(bits.to_string()));
        }
        Ok(KeySpec::Rsa { bits })
    }

    pub fn ec(group: EcGroup) -> Self {
        KeySpec::Ec { group }
    }

    /// Build a spec from `name=value` key generation parameters.
    ///
    /// RSA understands `bits` (default 2048), EC understands `group`
    /// (default P-256). Any other parameter is rejected.
    pub fn from_params<'a>(
        alg: KeyAlgorithm,
        params: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, ParseError> {
        let mut spec = match alg {
            KeyAlgorithm::Rsa => KeySpec::Rsa { bits: 2048 },
            KeyAlgorithm::Ec => KeySpec::Ec {
                group: EcGroup::P256,
            },
        };
        for (name, value) in params {
            spec = match (alg, name) {
                (KeyAlgorithm::Rsa, "bits") => {
                    let bits = value
                        .parse::<u16>()
                        .map_err(|_| ParseError::RsaBits(value.to_string()))?;
                    KeySpec::rsa(bits)?
                }
                (KeyAlgorithm::Ec, "group") => KeySpec::ec(value.parse()?),
                _ => {
                    return Err(ParseError::UnknownParam {
                        alg,
                        name: name.to_string(),
                    })
                }
            };
        }
        Ok(spec)
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            KeySpec::Rsa { .. } => KeyAlgorithm::Rsa,
            KeySpec::Ec { .. } => KeyAlgorithm::Ec,
        }
    }

    pub fn bits(&self) -> usize {
        match self {
            KeySpec::Rsa { bits } => *bits as usize,
            KeySpec::Ec { group } => group.bits(),
        }
    }
}

impl fmt::Display for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySpec::Rsa { bits } => write!(f, "RSA-{bits}"),
            KeySpec::Ec { group } => write!(f, "EC-{group}"),
        }
    }
}

/// Signature scheme applied to a prehashed digest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignScheme {
    RsaPss(HashAlg),
    RsaPkcs1v15(HashAlg),
    Ecdsa(HashAlg),
}

impl SignScheme {
    pub fn hash(&self) -> HashAlg {
        match self {
            SignScheme::RsaPss(h) | SignScheme::RsaPkcs1v15(h) | SignScheme::Ecdsa(h) => *h,
        }
    }

    /// Key algorithm this scheme can be used with
    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            SignScheme::RsaPss(_) | SignScheme::RsaPkcs1v15(_) => KeyAlgorithm::Rsa,
            SignScheme::Ecdsa(_) => KeyAlgorithm::Ec,
        }
    }

    /// Check that `digest` can be signed with this scheme by a key of `alg`
    pub fn check(&self, alg: KeyAlgorithm, digest: &[u8]) -> Result<()> {
        if self.algorithm() != alg {
            anyhow::bail!("signature scheme {self} cannot be used with an {alg} key");
        }
        let expected = self.hash().digest_len();
        if digest.len() != expected {
            anyhow::bail!(
                "digest length mismatch for {self}: expected {expected}, got {}",
                digest.len()
            );
        }
        Ok(())
    }
}

impl fmt::Display for SignScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignScheme::RsaPss(h) => write!(f, "RSA-PSS/{h}"),
            SignScheme::RsaPkcs1v15(h) => write!(f, "RSASSA-PKCS1-v1_5/{h}"),
            SignScheme::Ecdsa(h) => write!(f, "ECDSA/{h}"),
        }
    }
}

/// RSA encryption padding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptScheme {
    /// RSAES-PKCS1-v1_5 (TPM2_ALG_RSAES)
    RsaPkcs1v15,
    RsaOaep(HashAlg),
}

impl FromStr for DecryptScheme {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pkcs1" | "rsaes" => Ok(DecryptScheme::RsaPkcs1v15),
            "oaep" => Ok(DecryptScheme::RsaOaep(HashAlg::Sha256)),
            other => match other.strip_prefix("oaep-") {
                Some(hash) => Ok(DecryptScheme::RsaOaep(hash.parse()?)),
                None => Err(ParseError::Padding(s.to_string())),
            },
        }
    }
}

impl fmt::Display for DecryptScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecryptScheme::RsaPkcs1v15 => f.write_str("RSAES-PKCS1-v1_5"),
            DecryptScheme::RsaOaep(h) => write!(f, "RSAES-OAEP/{h}"),
        }
    }
}

/// Raw signature as returned by the hardware provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signature {
    Rsa(Vec<u8>),
    Ecdsa { r: Vec<u8>, s: Vec<u8> },
}

impl Signature {
    pub fn len(&self) -> usize {
        match self {
            Signature::Rsa(sig) => sig.len(),
            Signature::Ecdsa { r, s } => r.len() + s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fixed width `r || s` encoding, left padding each half to `field_len`
    pub fn ecdsa_fixed_bytes(r: &[u8], s: &[u8], field_len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; field_len * 2];
        for (half, value) in [r, s].into_iter().enumerate() {
            let value = strip_leading_zeros(value);
            if value.len() > field_len {
                anyhow::bail!(
                    "ECDSA signature component too long: {} > {field_len}",
                    value.len()
                );
            }
            let end = (half + 1) * field_len;
            out[end - value.len()..end].copy_from_slice(value);
        }
        Ok(out)
    }
}

fn strip_leading_zeros(value: &[u8]) -> &[u8] {
    let first = value.iter().position(|b| *b != 0).unwrap_or(value.len());
    &value[first..]
}

/// The two pluggable providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Hardware provider backed by a TPM 2.0
    Tpm2,
    /// Software provider
    Default,
}

impl ProviderKind {
    pub fn name(self) -> &'static str {
        match self {
            ProviderKind::Tpm2 => "tpm2",
            ProviderKind::Default => "default",
        }
    }

    /// Parse a property query such as `provider=tpm2`
    pub fn from_query(query: &str) -> Result<Self, ParseError> {
        query
            .split(',')
            .filter_map(|clause| clause.trim().split_once('='))
            .find(|(key, _)| key.trim() == "provider")
            .map(|(_, value)| value.trim().parse())
            .unwrap_or_else(|| Err(ParseError::Provider(query.to_string())))
    }
}

impl FromStr for ProviderKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tpm2" => Ok(ProviderKind::Tpm2),
            "default" => Ok(ProviderKind::Default),
            _ => Err(ParseError::Provider(s.to_string())),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A loadable crypto provider.
pub trait Provider {
    /// Which provider this is
    fn kind(&self) -> ProviderKind;

    /// Run the provider's self test.
    fn self_test(&mut self) -> Result<()>;

    /// Fill `buf` from the provider's random number generator.
    fn fill_random(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Get `N` random bytes.
    fn random<const N: usize>(&mut self) -> Result<[u8; N]>
    where
        Self: Sized,
    {
        let mut buf = [0u8; N];
        self.fill_random(&mut buf)?;
        Ok(buf)
    }
}
