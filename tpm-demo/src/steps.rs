// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! The individual demo steps. Progress goes to stdout, diagnostics to the
//! tracing subscriber.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use soft_provider::{SoftProvider, SoftPublicKey};
use tpm_provider::TpmKey;
use tpm_types::{DecryptScheme, EcGroup, HashAlg, KeyAlgorithm, KeySpec, Provider, SignScheme};
use tracing::debug;

use crate::Providers;

/// Plaintext round-tripped through encrypt and decrypt
const DEMO_PLAINTEXT: [u8; 3] = [1, 2, 3];

#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub tcti: Option<String>,
    pub rsa_key: PathBuf,
    pub ec_key: PathBuf,
    pub rsa_bits: u16,
    pub ec_group: EcGroup,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            tcti: None,
            rsa_key: "/tmp/rsa-key".into(),
            ec_key: "/tmp/ec-key".into(),
            rsa_bits: 3072,
            ec_group: EcGroup::P256,
        }
    }
}

impl DemoConfig {
    pub fn rsa_spec(&self) -> Result<KeySpec> {
        Ok(KeySpec::rsa(self.rsa_bits)?)
    }

    pub fn ec_spec(&self) -> KeySpec {
        KeySpec::ec(self.ec_group)
    }
}

/// Read 4 random bytes from a provider
pub fn gen_random(provider: &mut dyn Provider) -> Result<[u8; 4]> {
    let mut buf = [0u8; 4];
    provider
        .fill_random(&mut buf)
        .with_context(|| format!("failed to get random bytes from {}", provider.kind()))?;
    println!("Obtained random: {}", hex::encode(buf));
    Ok(buf)
}

fn public_key(soft: &SoftProvider, key: &TpmKey) -> Result<SoftPublicKey> {
    let pem = key.public_key_pem()?;
    soft.load_public_key(&pem).context("failed to import the TPM public key")
}

/// Split a `name=value` key generation parameter
pub fn parse_param(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got `{s}`"))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

/// Generate a key in the TPM, print its public part and store the blob
pub fn gen_key(providers: &mut Providers, spec: &KeySpec, path: &Path) -> Result<TpmKey> {
    let key = providers
        .tpm
        .generate(spec)
        .with_context(|| format!("failed to generate {} key", spec.algorithm()))?;
    save_key(&providers.soft, key, path)
}

/// Like [`gen_key`], with the key described by `name=value` parameters
/// such as `bits=3072` or `group=P-384`
pub fn gen_key_with_params(
    providers: &mut Providers,
    alg: KeyAlgorithm,
    params: &[(String, String)],
    path: &Path,
) -> Result<TpmKey> {
    let params = params.iter().map(|(name, value)| (name.as_str(), value.as_str()));
    let key = providers
        .tpm
        .generate_with_params(alg, params)
        .with_context(|| format!("failed to generate {alg} key"))?;
    save_key(&providers.soft, key, path)
}

fn save_key(soft: &SoftProvider, key: TpmKey, path: &Path) -> Result<TpmKey> {
    let alg = key.algorithm();
    print!("{}", public_key(soft, &key)?);
    key.write_pem(path).with_context(|| format!("failed to write {alg} key to disk"))?;
    println!("Generated {alg} key and saved to disk");
    Ok(key)
}

/// Load a key blob, checking it holds a key of `alg`
pub fn load_key(alg: KeyAlgorithm, path: &Path) -> Result<TpmKey> {
    let key = TpmKey::read_pem(path).with_context(|| format!("failed to read {alg} key"))?;
    if key.algorithm() != alg {
        bail!("{} holds an {} key, expected {alg}", path.display(), key.spec());
    }
    println!("Loaded {alg} key from disk");
    Ok(key)
}

/// Sign an all-zero digest in the TPM and verify it in software, then
/// check that a corrupted digest is rejected
pub fn sign_verify(providers: &mut Providers, key: &TpmKey, scheme: SignScheme) -> Result<()> {
    let alg = key.algorithm();
    let mut digest = vec![0u8; scheme.hash().digest_len()];

    println!("{alg} signing");
    println!("{alg} generating signature");
    let signature = providers
        .tpm
        .sign(key, &digest, scheme)
        .with_context(|| format!("{alg} signing error"))?;
    debug!("{alg} signature is {} bytes", signature.len());

    println!("{alg} verify signature");
    let public = public_key(&providers.soft, key)?;
    if !providers.soft.verify(&public, &digest, &signature, scheme)? {
        bail!("{alg} signature verification error");
    }
    println!("{alg} signature verification ok");

    digest[3] = !digest[3];
    if providers.soft.verify(&public, &digest, &signature, scheme)? {
        bail!("{alg} signature verification of a corrupted digest succeeded");
    }
    println!("{alg} signature verification expected to fail, ok");
    Ok(())
}

/// Encrypt in software, decrypt in the TPM
pub fn encrypt_decrypt(
    providers: &mut Providers,
    key: &TpmKey,
    scheme: DecryptScheme,
) -> Result<()> {
    let public = public_key(&providers.soft, key)?;

    println!("Generating encryption blob");
    let ciphertext = providers
        .soft
        .encrypt(&public, &DEMO_PLAINTEXT, scheme)
        .context("encryption error")?;

    println!("Decrypting encrypted blob");
    let plaintext = providers
        .tpm
        .decrypt(key, &ciphertext, scheme)
        .context("decryption error")?;
    if plaintext != DEMO_PLAINTEXT {
        bail!("decryption error, value not the same");
    }
    println!("Decryption verification ok");
    Ok(())
}

/// Print what a key file holds. Does not need a TPM.
pub fn show_key(path: &Path) -> Result<()> {
    let key = TpmKey::read_pem(path)?;
    println!("{}: {} key, parent 0x{:08x}", path.display(), key.spec(), key.parent());
    print!("{}", public_key(&SoftProvider::new(), &key)?);
    Ok(())
}

/// The full demonstration sequence
pub fn run_all(config: &DemoConfig) -> Result<()> {
    println!("Starting...");
    let mut providers = Providers::load(config.tcti.as_deref())?;

    gen_random(&mut providers.tpm)?;
    gen_key(&mut providers, &config.rsa_spec()?, &config.rsa_key)?;
    gen_key(&mut providers, &config.ec_spec(), &config.ec_key)?;

    let rsa = load_key(KeyAlgorithm::Rsa, &config.rsa_key)?;
    let ec = load_key(KeyAlgorithm::Ec, &config.ec_key)?;

    sign_verify(&mut providers, &rsa, SignScheme::RsaPss(HashAlg::Sha256))?;
    sign_verify(&mut providers, &ec, SignScheme::Ecdsa(HashAlg::Sha256))?;
    encrypt_decrypt(&mut providers, &rsa, DecryptScheme::RsaPkcs1v15)?;

    println!("Completed without err...");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DemoConfig::default();
        assert_eq!(config.rsa_spec().unwrap(), KeySpec::Rsa { bits: 3072 });
        assert_eq!(config.ec_spec(), KeySpec::ec(EcGroup::P256));
        assert_eq!(config.rsa_key, Path::new("/tmp/rsa-key"));
    }

    #[test]
    fn test_invalid_rsa_bits() {
        let config = DemoConfig {
            rsa_bits: 1000,
            ..Default::default()
        };
        assert!(config.rsa_spec().is_err());
    }

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("bits=4096").unwrap(),
            ("bits".to_string(), "4096".to_string())
        );
        assert_eq!(parse_param("group = P-384").unwrap().1, "P-384");
        assert!(parse_param("bits").is_err());

        // Parsed parameters describe the same keys as the typed options
        let params = [parse_param("group=secp384r1").unwrap()];
        let spec = KeySpec::from_params(
            KeyAlgorithm::Ec,
            params.iter().map(|(n, v)| (n.as_str(), v.as_str())),
        )
        .unwrap();
        assert_eq!(spec, KeySpec::ec(EcGroup::P384));
    }

    #[test]
    fn test_random_from_software() {
        let mut soft = SoftProvider::new();
        gen_random(&mut soft).unwrap();
    }

    #[test]
    fn test_load_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_key(KeyAlgorithm::Rsa, &dir.path().join("rsa-key")).unwrap_err();
        assert!(format!("{err:#}").contains("failed to read RSA key"));
    }
}
