// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Software Crypto Provider
//!
//! Public-key operations for keys whose private half lives in a TPM:
//! parsing and printing public keys, verifying signatures and encrypting
//! to RSA keys.

use anyhow::{bail, Context, Result};
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use rand::{rngs::OsRng, RngCore};
use tpm_types::{DecryptScheme, HashAlg, Provider, ProviderKind, SignScheme, Signature};
use tracing::debug;

mod pubkey;
mod verify;

pub use pubkey::SoftPublicKey;

/// SHA-256("abc"), FIPS 180-2 appendix B.1
const SHA256_ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

/// Software provider backed by RustCrypto and the OS RNG
#[derive(Debug, Default)]
pub struct SoftProvider {
    rng: OsRng,
}

impl SoftProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Import a SubjectPublicKeyInfo PEM, e.g. exported from a TPM key
    pub fn load_public_key(&self, pem: &str) -> Result<SoftPublicKey> {
        SoftPublicKey::from_pem(pem)
    }

    /// Verify a signature over a prehashed digest.
    ///
    /// Returns `Ok(false)` when the signature does not match, and an error
    /// when the scheme, key and digest do not fit together.
    pub fn verify(
        &self,
        key: &SoftPublicKey,
        digest: &[u8],
        signature: &Signature,
        scheme: SignScheme,
    ) -> Result<bool> {
        let valid = verify::verify_signature(key, digest, signature, scheme)?;
        debug!(valid, "verified {scheme} signature");
        Ok(valid)
    }

    /// Encrypt to an RSA public key
    pub fn encrypt(
        &mut self,
        key: &SoftPublicKey,
        plaintext: &[u8],
        scheme: DecryptScheme,
    ) -> Result<Vec<u8>> {
        verify::encrypt(&mut self.rng, key, plaintext, scheme)
    }
}

impl Provider for SoftProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Default
    }

    fn self_test(&mut self) -> Result<()> {
        let digest = hex::encode(HashAlg::Sha256.digest(b"abc"));
        if digest != SHA256_ABC {
            bail!("SHA-256 known answer test failed: {digest}");
        }

        let digest = HashAlg::Sha256.digest(b"pairwise consistency");
        let signing = p256::ecdsa::SigningKey::random(&mut self.rng);
        let sig: p256::ecdsa::Signature = signing
            .sign_prehash(&digest)
            .context("ECDSA pairwise test failed to sign")?;
        signing
            .verifying_key()
            .verify_prehash(&digest, &sig)
            .context("ECDSA pairwise test failed to verify")?;

        debug!("software provider self test passed");
        Ok(())
    }

    fn fill_random(&mut self, buf: &mut [u8]) -> Result<()> {
        self.rng
            .try_fill_bytes(buf)
            .context("failed to read from the OS RNG")
    }
}
