// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! End to end runs against a TPM. Point `TPM2OPENSSL_TCTI` at a simulator
//! (e.g. `swtpm:port=2321`) and run with `--ignored`.

use tpm_demo::{steps, DemoConfig, Providers};
use tpm_types::{DecryptScheme, EcGroup, HashAlg, KeyAlgorithm, KeySpec, SignScheme};

fn temp_config(dir: &tempfile::TempDir) -> DemoConfig {
    DemoConfig {
        rsa_key: dir.path().join("rsa-key"),
        ec_key: dir.path().join("ec-key"),
        rsa_bits: 2048,
        ..Default::default()
    }
}

#[test]
#[ignore = "requires a TPM"]
fn test_full_sequence() {
    let dir = tempfile::tempdir().unwrap();
    steps::run_all(&temp_config(&dir)).expect("demo sequence failed");
    assert!(dir.path().join("rsa-key").exists());
    assert!(dir.path().join("ec-key").exists());
}

#[test]
#[ignore = "requires a TPM"]
fn test_rsa_schemes() {
    let dir = tempfile::tempdir().unwrap();
    let config = temp_config(&dir);
    let mut providers = Providers::load(None).unwrap();

    steps::gen_key(&mut providers, &config.rsa_spec().unwrap(), &config.rsa_key).unwrap();
    let key = steps::load_key(KeyAlgorithm::Rsa, &config.rsa_key).unwrap();
    assert_eq!(key.spec(), KeySpec::Rsa { bits: 2048 });

    for scheme in [
        SignScheme::RsaPss(HashAlg::Sha384),
        SignScheme::RsaPkcs1v15(HashAlg::Sha256),
    ] {
        steps::sign_verify(&mut providers, &key, scheme).unwrap();
    }
    let oaep = DecryptScheme::RsaOaep(HashAlg::Sha256);
    steps::encrypt_decrypt(&mut providers, &key, oaep).unwrap();

    // A key of the other algorithm is refused before touching the TPM
    let ecdsa = SignScheme::Ecdsa(HashAlg::Sha256);
    assert!(steps::sign_verify(&mut providers, &key, ecdsa).is_err());
}

#[test]
#[ignore = "requires a TPM"]
fn test_p384_key() {
    let dir = tempfile::tempdir().unwrap();
    let config = DemoConfig {
        ec_group: EcGroup::P384,
        ..temp_config(&dir)
    };
    let mut providers = Providers::load(None).unwrap();

    steps::gen_key(&mut providers, &config.ec_spec(), &config.ec_key).unwrap();
    let key = steps::load_key(KeyAlgorithm::Ec, &config.ec_key).unwrap();
    steps::sign_verify(&mut providers, &key, SignScheme::Ecdsa(HashAlg::Sha384)).unwrap();

    assert!(steps::load_key(KeyAlgorithm::Rsa, &config.ec_key).is_err());
    assert!(steps::encrypt_decrypt(&mut providers, &key, DecryptScheme::RsaPkcs1v15).is_err());
}

#[test]
#[ignore = "requires a TPM"]
fn test_select_provider() {
    let mut providers = Providers::load(None).unwrap();
    steps::gen_random(providers.select("provider=tpm2").unwrap()).unwrap();
    steps::gen_random(providers.select("provider=default").unwrap()).unwrap();
    assert!(providers.select("fips=yes").is_err());
}

#[test]
#[ignore = "requires a TPM"]
fn test_gen_key_with_params() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ec-key");
    let mut providers = Providers::load(None).unwrap();

    let params = [steps::parse_param("group=P-384").unwrap()];
    let key = steps::gen_key_with_params(&mut providers, KeyAlgorithm::Ec, &params, &path).unwrap();
    assert_eq!(key.spec(), KeySpec::ec(EcGroup::P384));
    assert_eq!(steps::load_key(KeyAlgorithm::Ec, &path).unwrap().spec(), key.spec());

    let params = [steps::parse_param("bits=3000").unwrap()];
    assert!(steps::gen_key_with_params(&mut providers, KeyAlgorithm::Rsa, &params, &path).is_err());
}
