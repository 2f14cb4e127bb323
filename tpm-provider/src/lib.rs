// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 Key Provider
//!
//! The hardware half of the demo: keys are generated inside the TPM, stored
//! on disk as TSS2 key files and used for private-key operations (sign,
//! decrypt) through the TSS2 ESAPI.
//!
//! Public-key operations are left to a software provider; see the
//! soft-provider crate.

use anyhow::{bail, Context, Result};
use std::path::Path;
use tracing::{debug, info};

use tpm_types::{
    DecryptScheme, KeyAlgorithm, KeySpec, Provider, ProviderKind, SignScheme, Signature,
};

mod esapi;
mod key;
pub mod keyfile;
mod public;

use esapi::EsapiContext;
pub use esapi::{parse_tcti, TPM2_RH_OWNER};
pub use key::TpmKey;

/// Environment variable holding the TCTI, shared with the tpm2 OpenSSL provider
pub const TCTI_ENV: &str = "TPM2OPENSSL_TCTI";

/// Hardware provider backed by a TPM 2.0
pub struct TpmProvider {
    tcti: String,
    ctx: EsapiContext,
}

impl std::fmt::Debug for TpmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TpmProvider")
            .field("tcti", &self.tcti)
            .finish()
    }
}

impl TpmProvider {
    /// Open the TPM, resolving the TCTI from `tcti`, then `TPM2OPENSSL_TCTI`,
    /// then the default device nodes
    pub fn open(tcti: Option<&str>) -> Result<Self> {
        let tcti = match tcti {
            Some(t) => t.to_string(),
            None => match std::env::var(TCTI_ENV) {
                Ok(t) if !t.is_empty() => t,
                _ => Self::detect()?,
            },
        };
        Self::new(&tcti)
    }

    /// Detect an available TPM device
    pub fn detect() -> Result<String> {
        if Path::new("/dev/tpmrm0").exists() {
            Ok("device:/dev/tpmrm0".into())
        } else if Path::new("/dev/tpm0").exists() {
            Ok("device:/dev/tpm0".into())
        } else {
            bail!("TPM device not found (set {TCTI_ENV} to use a simulator)");
        }
    }

    /// Open the TPM at a specific TCTI
    pub fn new(tcti: &str) -> Result<Self> {
        let ctx = EsapiContext::new(tcti)
            .with_context(|| format!("failed to open TPM at {tcti}"))?;
        info!("opened TPM at {tcti}");
        Ok(Self {
            tcti: tcti.to_string(),
            ctx,
        })
    }

    /// Generate a key inside the TPM, parented to the owner SRK
    pub fn generate(&mut self, spec: &KeySpec) -> Result<TpmKey> {
        let (public, private) = self.ctx.create_key(spec)?;
        let key = TpmKey::new(TPM2_RH_OWNER, public, private)?;
        info!("generated {spec} key in the TPM");
        Ok(key)
    }

    /// Generate a key from `name=value` parameters, e.g. `bits=3072`
    pub fn generate_with_params<'a>(
        &mut self,
        alg: KeyAlgorithm,
        params: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<TpmKey> {
        let spec = KeySpec::from_params(alg, params)?;
        self.generate(&spec)
    }

    /// Sign a prehashed digest with a TPM key
    pub fn sign(&mut self, key: &TpmKey, digest: &[u8], scheme: SignScheme) -> Result<Signature> {
        scheme.check(key.algorithm(), digest)?;
        let signature = self
            .ctx
            .sign(key.parent, &key.public, &key.private, digest, scheme)?;
        debug!("signed digest {} with {scheme}", hex::encode(digest));
        Ok(signature)
    }

    /// Decrypt a ciphertext with a TPM RSA key
    pub fn decrypt(
        &mut self,
        key: &TpmKey,
        ciphertext: &[u8],
        scheme: DecryptScheme,
    ) -> Result<Vec<u8>> {
        if key.algorithm() != KeyAlgorithm::Rsa {
            bail!("{scheme} requires an RSA key, got {}", key.spec());
        }
        let modulus_len = key.spec().bits() / 8;
        if ciphertext.len() != modulus_len {
            bail!(
                "ciphertext length {} does not match the {modulus_len} byte modulus",
                ciphertext.len()
            );
        }
        let plain = self
            .ctx
            .rsa_decrypt(key.parent, &key.public, &key.private, ciphertext, scheme)?;
        debug!("decrypted {} bytes with {scheme}", plain.len());
        Ok(plain)
    }
}

impl Provider for TpmProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Tpm2
    }

    fn self_test(&mut self) -> Result<()> {
        self.ctx.self_test()
    }

    fn fill_random(&mut self, buf: &mut [u8]) -> Result<()> {
        self.ctx.fill_random(buf)
    }
}
