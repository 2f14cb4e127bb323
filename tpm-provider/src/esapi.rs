// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! tss-esapi implementation of the hardware key operations
//!
//! Every TPM command goes through the TSS2 ESAPI; this module only builds
//! templates and moves buffers in and out.

use anyhow::{bail, Context as _, Result};
use std::{collections::HashMap, str::FromStr};
use tracing::{debug, warn};
use tss_esapi::{
    attributes::ObjectAttributesBuilder,
    constants::tss::{TPM2_RH_NULL, TPM2_ST_HASHCHECK},
    handles::{KeyHandle, ObjectHandle, PersistentTpmHandle, TpmHandle},
    interface_types::{
        algorithm::{HashingAlgorithm, PublicAlgorithm},
        key_bits::RsaKeyBits,
        resource_handles::Hierarchy,
    },
    structures::{
        Data, Digest, EccPoint, EccScheme, HashScheme, HashcheckTicket,
        KeyDerivationFunctionScheme, Private, Public, PublicBuilder, PublicEccParametersBuilder,
        PublicKeyRsa, PublicRsaParametersBuilder, RsaDecryptionScheme, RsaExponent, RsaScheme,
        Signature as TpmSignature, SignatureScheme, SymmetricDefinitionObject,
    },
    tcti_ldr::TctiNameConf,
    tss2_esys::TPMT_TK_HASHCHECK,
    Context as TssContext,
};

use tpm_types::{DecryptScheme, HashAlg, KeySpec, SignScheme, Signature};

use crate::public::ecc_curve;

/// Owner hierarchy handle, used as parent of keys created under the SRK
pub const TPM2_RH_OWNER: u32 = 0x4000_0001;

/// Largest request TPM2_GetRandom is guaranteed to honour
const MAX_RANDOM_CHUNK: usize = 32;

fn hashing_algorithm(hash: HashAlg) -> HashingAlgorithm {
    match hash {
        HashAlg::Sha256 => HashingAlgorithm::Sha256,
        HashAlg::Sha384 => HashingAlgorithm::Sha384,
    }
}

/// Parse a TCTI string, accepting a bare device path as `device:<path>`
pub fn parse_tcti(tcti: &str) -> Result<TctiNameConf> {
    let conf = if tcti.starts_with('/') {
        format!("device:{tcti}")
    } else {
        tcti.to_string()
    };
    TctiNameConf::from_str(&conf).with_context(|| format!("invalid TCTI: {tcti}"))
}

/// TPM context using tss-esapi
pub struct EsapiContext {
    context: TssContext,
    /// Transient SRK shared by all keys parented to the owner hierarchy
    primary: Option<KeyHandle>,
    /// ESYS handles of persistent parents, by TPM handle
    persistent: HashMap<u32, KeyHandle>,
}

impl EsapiContext {
    /// Create a new ESAPI context with the given TCTI
    pub fn new(tcti: &str) -> Result<Self> {
        let tcti = parse_tcti(tcti)?;
        let context = TssContext::new(tcti).context("failed to create TSS context")?;
        Ok(Self {
            context,
            primary: None,
            persistent: HashMap::new(),
        })
    }

    // ==================== Testing ====================

    /// Run the full TPM self test
    pub fn self_test(&mut self) -> Result<()> {
        self.context
            .self_test(true)
            .context("TPM self test failed")?;
        debug!("TPM self test passed");
        Ok(())
    }

    // ==================== Random Number Generation ====================

    /// Fill `buf` using the TPM's hardware RNG
    pub fn fill_random(&mut self, buf: &mut [u8]) -> Result<()> {
        for chunk in buf.chunks_mut(MAX_RANDOM_CHUNK) {
            let random_bytes = self
                .context
                .get_random(chunk.len())
                .context("failed to get random bytes from TPM")?;
            let random_bytes = random_bytes.value();
            if random_bytes.len() != chunk.len() {
                bail!(
                    "insufficient random bytes from TPM: wanted {}, got {}",
                    chunk.len(),
                    random_bytes.len()
                );
            }
            chunk.copy_from_slice(random_bytes);
        }
        Ok(())
    }

    // ==================== Primary Key Operations ====================

    /// Create a primary key in the owner hierarchy
    /// Uses the RSA 2048 storage key template
    fn create_primary(&mut self) -> Result<KeyHandle> {
        let object_attributes = ObjectAttributesBuilder::new()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_sensitive_data_origin(true)
            .with_user_with_auth(true)
            .with_decrypt(true)
            .with_restricted(true)
            .build()
            .context("failed to build object attributes")?;

        let rsa_params = PublicRsaParametersBuilder::new()
            .with_symmetric(SymmetricDefinitionObject::AES_128_CFB)
            .with_scheme(RsaScheme::Null)
            .with_key_bits(RsaKeyBits::Rsa2048)
            .with_exponent(RsaExponent::default())
            .with_is_signing_key(false)
            .with_is_decryption_key(true)
            .with_restricted(true)
            .build()
            .context("failed to build RSA parameters")?;

        let public = PublicBuilder::new()
            .with_public_algorithm(PublicAlgorithm::Rsa)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(object_attributes)
            .with_rsa_parameters(rsa_params)
            .with_rsa_unique_identifier(PublicKeyRsa::default())
            .build()
            .context("failed to build public structure")?;

        let primary_key = self
            .context
            .execute_with_nullauth_session(|ctx| {
                ctx.create_primary(
                    Hierarchy::Owner,
                    public,
                    None, // auth_value
                    None, // sensitive_data
                    None, // outside_info
                    None, // creation_pcr
                )
            })
            .context("failed to create primary key")?;

        debug!("created primary key in owner hierarchy");
        Ok(primary_key.key_handle)
    }

    /// The owner SRK, created on first use
    fn primary(&mut self) -> Result<KeyHandle> {
        if let Some(handle) = self.primary {
            return Ok(handle);
        }
        let handle = self.create_primary()?;
        self.primary = Some(handle);
        Ok(handle)
    }

    /// Resolve the parent handle stored in a key file
    fn parent(&mut self, parent: u32) -> Result<KeyHandle> {
        if parent == TPM2_RH_OWNER {
            return self.primary();
        }
        if let Some(handle) = self.persistent.get(&parent) {
            return Ok(*handle);
        }
        let persistent = PersistentTpmHandle::new(parent)
            .with_context(|| format!("unsupported parent handle 0x{parent:08x}"))?;
        let object = self
            .context
            .tr_from_tpm_public(TpmHandle::Persistent(persistent))
            .with_context(|| format!("persistent parent 0x{parent:08x} not found"))?;
        let handle = KeyHandle::from(object);
        self.persistent.insert(parent, handle);
        Ok(handle)
    }

    // ==================== Key Operations ====================

    pub(crate) fn key_template(spec: &KeySpec) -> Result<Public> {
        let object_attributes = ObjectAttributesBuilder::new()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_sensitive_data_origin(true)
            .with_user_with_auth(true)
            .with_sign_encrypt(true)
            .with_decrypt(matches!(spec, KeySpec::Rsa { .. }))
            .with_restricted(false)
            .build()
            .context("failed to build object attributes")?;

        let builder = PublicBuilder::new()
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(object_attributes);

        let builder = match spec {
            KeySpec::Rsa { bits } => {
                let key_bits = RsaKeyBits::try_from(*bits)
                    .with_context(|| format!("invalid key size {bits}"))?;
                let rsa_params = PublicRsaParametersBuilder::new()
                    .with_symmetric(SymmetricDefinitionObject::Null)
                    .with_scheme(RsaScheme::Null)
                    .with_key_bits(key_bits)
                    .with_exponent(RsaExponent::default())
                    .with_is_signing_key(true)
                    .with_is_decryption_key(true)
                    .with_restricted(false)
                    .build()
                    .context("failed to build RSA parameters")?;
                builder
                    .with_public_algorithm(PublicAlgorithm::Rsa)
                    .with_rsa_parameters(rsa_params)
                    .with_rsa_unique_identifier(PublicKeyRsa::default())
            }
            KeySpec::Ec { group } => {
                let ecc_params = PublicEccParametersBuilder::new()
                    .with_symmetric(SymmetricDefinitionObject::Null)
                    .with_ecc_scheme(EccScheme::Null)
                    .with_curve(ecc_curve(*group))
                    .with_key_derivation_function_scheme(KeyDerivationFunctionScheme::Null)
                    .with_is_signing_key(true)
                    .with_is_decryption_key(false)
                    .with_restricted(false)
                    .build()
                    .context("failed to build ECC parameters")?;
                builder
                    .with_public_algorithm(PublicAlgorithm::Ecc)
                    .with_ecc_parameters(ecc_params)
                    .with_ecc_unique_identifier(EccPoint::default())
            }
        };

        builder.build().context("failed to build public structure")
    }

    /// Create a key under the owner SRK, returning its loadable parts
    pub fn create_key(&mut self, spec: &KeySpec) -> Result<(Public, Private)> {
        let public = Self::key_template(spec)?;
        let parent = self.primary()?;

        let create_result = self
            .context
            .execute_with_nullauth_session(|ctx| {
                ctx.create(
                    parent,
                    public,
                    None, // auth_value
                    None, // sensitive_data
                    None, // outside_info
                    None, // creation_pcr
                )
            })
            .with_context(|| format!("failed to create {spec} key"))?;

        debug!("created {spec} key under the owner SRK");
        Ok((create_result.out_public, create_result.out_private))
    }

    /// Load a key, run `f` with its transient handle, then flush it
    fn with_loaded_key<T>(
        &mut self,
        parent: u32,
        public: &Public,
        private: &Private,
        f: impl FnOnce(&mut TssContext, KeyHandle) -> Result<T>,
    ) -> Result<T> {
        let parent = self.parent(parent)?;
        let key_handle = self
            .context
            .execute_with_nullauth_session(|ctx| ctx.load(parent, private.clone(), public.clone()))
            .context("failed to load key into the TPM")?;

        let result = f(&mut self.context, key_handle);

        if let Err(e) = self.context.flush_context(key_handle.into()) {
            warn!("failed to flush key handle: {e}");
        }
        result
    }

    /// Sign a prehashed digest
    pub fn sign(
        &mut self,
        parent: u32,
        public: &Public,
        private: &Private,
        digest: &[u8],
        scheme: SignScheme,
    ) -> Result<Signature> {
        let hash_scheme = HashScheme::new(hashing_algorithm(scheme.hash()));
        let tpm_scheme = match scheme {
            SignScheme::RsaPss(_) => SignatureScheme::RsaPss {
                hash_scheme,
            },
            SignScheme::RsaPkcs1v15(_) => SignatureScheme::RsaSsa {
                hash_scheme,
            },
            SignScheme::Ecdsa(_) => SignatureScheme::EcDsa {
                hash_scheme,
            },
        };
        let digest = Digest::try_from(digest.to_vec()).context("invalid digest")?;

        // The digest was not produced by the TPM, so the ticket is the null ticket
        let validation = HashcheckTicket::try_from(TPMT_TK_HASHCHECK {
            tag: TPM2_ST_HASHCHECK,
            hierarchy: TPM2_RH_NULL,
            digest: Default::default(),
        })
        .context("failed to build hashcheck ticket")?;

        let signature = self.with_loaded_key(parent, public, private, |ctx, key| {
            ctx.execute_with_nullauth_session(|ctx| {
                ctx.sign(key, digest, tpm_scheme, validation)
            })
            .with_context(|| format!("TPM2_Sign with {scheme} failed"))
        })?;

        match signature {
            TpmSignature::RsaPss(sig) | TpmSignature::RsaSsa(sig) => {
                Ok(Signature::Rsa(sig.signature().value().to_vec()))
            }
            TpmSignature::EcDsa(sig) => Ok(Signature::Ecdsa {
                r: sig.signature_r().value().to_vec(),
                s: sig.signature_s().value().to_vec(),
            }),
            other => bail!("unexpected signature type from TPM: {other:?}"),
        }
    }

    /// Decrypt with `TPM2_RSA_Decrypt`
    pub fn rsa_decrypt(
        &mut self,
        parent: u32,
        public: &Public,
        private: &Private,
        ciphertext: &[u8],
        scheme: DecryptScheme,
    ) -> Result<Vec<u8>> {
        let in_scheme = match scheme {
            DecryptScheme::RsaPkcs1v15 => RsaDecryptionScheme::RsaEs,
            DecryptScheme::RsaOaep(hash) => {
                RsaDecryptionScheme::Oaep(HashScheme::new(hashing_algorithm(hash)))
            }
        };
        let cipher_text =
            PublicKeyRsa::try_from(ciphertext.to_vec()).context("ciphertext too large")?;

        let plain = self.with_loaded_key(parent, public, private, |ctx, key| {
            ctx.execute_with_nullauth_session(|ctx| {
                ctx.rsa_decrypt(key, cipher_text, in_scheme, Data::default())
            })
            .with_context(|| format!("TPM2_RSA_Decrypt with {scheme} failed"))
        })?;

        Ok(plain.value().to_vec())
    }
}

impl Drop for EsapiContext {
    fn drop(&mut self) {
        if let Some(primary) = self.primary.take() {
            if let Err(e) = self.context.flush_context(primary.into()) {
                warn!("failed to flush primary key: {e}");
            }
        }
        for (parent, handle) in self.persistent.drain() {
            let mut object = ObjectHandle::from(handle);
            if let Err(e) = self.context.tr_close(&mut object) {
                warn!("failed to close handle of parent 0x{parent:08x}: {e}");
            }
        }
    }
}
