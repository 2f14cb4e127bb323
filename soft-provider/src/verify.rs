// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::{bail, Context, Result};
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use rand::{CryptoRng, RngCore};
use rsa::{traits::PublicKeyParts, Oaep, Pkcs1v15Encrypt, Pkcs1v15Sign, Pss, RsaPublicKey};
use sha2::{Sha256, Sha384};
use tpm_types::{DecryptScheme, HashAlg, SignScheme, Signature};
use tracing::debug;

use crate::SoftPublicKey;

pub(crate) fn verify_signature(
    key: &SoftPublicKey,
    digest: &[u8],
    signature: &Signature,
    scheme: SignScheme,
) -> Result<bool> {
    scheme.check(key.algorithm(), digest)?;
    debug!(
        "verifying {scheme} signature over digest {}",
        hex::encode(digest)
    );

    match (key, signature) {
        (SoftPublicKey::Rsa(key), Signature::Rsa(sig)) => {
            Ok(verify_rsa(key, digest, sig, scheme))
        }
        (SoftPublicKey::P256(key), Signature::Ecdsa { r, s }) => {
            let Some(fixed) = fixed_rs(r, s, 32) else {
                return Ok(false);
            };
            let Ok(sig) = p256::ecdsa::Signature::from_slice(&fixed) else {
                debug!("ECDSA signature out of range");
                return Ok(false);
            };
            Ok(key.verify_prehash(digest, &sig).is_ok())
        }
        (SoftPublicKey::P384(key), Signature::Ecdsa { r, s }) => {
            let Some(fixed) = fixed_rs(r, s, 48) else {
                return Ok(false);
            };
            let Ok(sig) = p384::ecdsa::Signature::from_slice(&fixed) else {
                debug!("ECDSA signature out of range");
                return Ok(false);
            };
            Ok(key.verify_prehash(digest, &sig).is_ok())
        }
        _ => bail!("signature type does not match the {} key", key.algorithm()),
    }
}

fn fixed_rs(r: &[u8], s: &[u8], field_len: usize) -> Option<Vec<u8>> {
    match Signature::ecdsa_fixed_bytes(r, s, field_len) {
        Ok(fixed) => Some(fixed),
        Err(err) => {
            debug!("malformed ECDSA signature: {err}");
            None
        }
    }
}

fn verify_rsa(key: &RsaPublicKey, digest: &[u8], sig: &[u8], scheme: SignScheme) -> bool {
    match scheme {
        SignScheme::RsaPss(hash) => {
            // TPMs differ on the PSS salt length: some use the digest length,
            // others the maximum the modulus allows
            let hash_len = hash.digest_len();
            let max_salt = key.size().saturating_sub(hash_len + 2);
            [hash_len, max_salt].into_iter().any(|salt| {
                let padding = match hash {
                    HashAlg::Sha256 => Pss::new_with_salt::<Sha256>(salt),
                    HashAlg::Sha384 => Pss::new_with_salt::<Sha384>(salt),
                };
                key.verify(padding, digest, sig).is_ok()
            })
        }
        SignScheme::RsaPkcs1v15(hash) => {
            let padding = match hash {
                HashAlg::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
                HashAlg::Sha384 => Pkcs1v15Sign::new::<Sha384>(),
            };
            key.verify(padding, digest, sig).is_ok()
        }
        SignScheme::Ecdsa(_) => false,
    }
}

pub(crate) fn encrypt<R: RngCore + CryptoRng>(
    rng: &mut R,
    key: &SoftPublicKey,
    plaintext: &[u8],
    scheme: DecryptScheme,
) -> Result<Vec<u8>> {
    let SoftPublicKey::Rsa(key) = key else {
        bail!("{scheme} requires an RSA key, got {}", key.algorithm());
    };
    let ciphertext = match scheme {
        DecryptScheme::RsaPkcs1v15 => key.encrypt(rng, Pkcs1v15Encrypt, plaintext),
        DecryptScheme::RsaOaep(HashAlg::Sha256) => {
            key.encrypt(rng, Oaep::new::<Sha256>(), plaintext)
        }
        DecryptScheme::RsaOaep(HashAlg::Sha384) => {
            key.encrypt(rng, Oaep::new::<Sha384>(), plaintext)
        }
    }
    .with_context(|| format!("failed to encrypt {} bytes with {scheme}", plaintext.len()))?;
    Ok(ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::hazmat::PrehashSigner;
    use rand::rngs::OsRng;
    use rsa::RsaPrivateKey;

    fn rsa_pair() -> (RsaPrivateKey, SoftPublicKey) {
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = SoftPublicKey::Rsa(private.to_public_key());
        (private, public)
    }

    #[test]
    fn test_rsa_pss() {
        let (private, public) = rsa_pair();
        let mut digest = [0u8; 32];
        let sig = private
            .sign_with_rng(&mut OsRng, Pss::new::<Sha256>(), &digest)
            .unwrap();
        let sig = Signature::Rsa(sig);
        let scheme = SignScheme::RsaPss(HashAlg::Sha256);

        assert!(verify_signature(&public, &digest, &sig, scheme).unwrap());
        digest[3] ^= 0xff;
        assert!(!verify_signature(&public, &digest, &sig, scheme).unwrap());
    }

    #[test]
    fn test_rsa_pss_max_salt() {
        let (private, public) = rsa_pair();
        let digest = HashAlg::Sha256.digest(b"max salt");
        let salt = 128 - 32 - 2;
        let sig = private
            .sign_with_rng(&mut OsRng, Pss::new_with_salt::<Sha256>(salt), &digest)
            .unwrap();
        let scheme = SignScheme::RsaPss(HashAlg::Sha256);
        assert!(verify_signature(&public, &digest, &Signature::Rsa(sig), scheme).unwrap());
    }

    #[test]
    fn test_rsa_pkcs1v15() {
        let (private, public) = rsa_pair();
        let digest = HashAlg::Sha384.digest(b"pkcs1");
        let sig = private.sign(Pkcs1v15Sign::new::<Sha384>(), &digest).unwrap();
        let scheme = SignScheme::RsaPkcs1v15(HashAlg::Sha384);
        let rsa_sig = Signature::Rsa(sig.clone());
        assert!(verify_signature(&public, &digest, &rsa_sig, scheme).unwrap());

        let pss = SignScheme::RsaPss(HashAlg::Sha384);
        assert!(!verify_signature(&public, &digest, &Signature::Rsa(sig), pss).unwrap());
    }

    #[test]
    fn test_ecdsa_p256() {
        let signing = p256::ecdsa::SigningKey::random(&mut OsRng);
        let public = SoftPublicKey::P256(p256::ecdsa::VerifyingKey::from(&signing));
        let mut digest = [0u8; 32];
        let sig: p256::ecdsa::Signature = signing.sign_prehash(&digest).unwrap();
        let bytes = sig.to_bytes();
        let (r, s) = bytes.split_at(32);
        let sig = Signature::Ecdsa {
            r: r.to_vec(),
            s: s.to_vec(),
        };
        let scheme = SignScheme::Ecdsa(HashAlg::Sha256);

        assert!(verify_signature(&public, &digest, &sig, scheme).unwrap());
        digest[3] ^= 0xff;
        assert!(!verify_signature(&public, &digest, &sig, scheme).unwrap());
    }

    #[test]
    fn test_invalid_requests() {
        let (_, public) = rsa_pair();
        let sig = Signature::Rsa(vec![0; 128]);
        // Wrong digest length
        let pss = SignScheme::RsaPss(HashAlg::Sha256);
        assert!(verify_signature(&public, &[0; 20], &sig, pss).is_err());
        // Wrong key algorithm
        let ecdsa = SignScheme::Ecdsa(HashAlg::Sha256);
        assert!(verify_signature(&public, &[0; 32], &sig, ecdsa).is_err());
        // Signature of the wrong shape
        let ec_sig = Signature::Ecdsa {
            r: vec![1],
            s: vec![1],
        };
        assert!(verify_signature(&public, &[0; 32], &ec_sig, pss).is_err());
    }

    #[test]
    fn test_encrypt() {
        let (private, public) = rsa_pair();
        let plain = [1u8, 2, 3];

        let ct = encrypt(&mut OsRng, &public, &plain, DecryptScheme::RsaPkcs1v15).unwrap();
        assert_eq!(ct.len(), 128);
        assert_eq!(private.decrypt(Pkcs1v15Encrypt, &ct).unwrap(), plain);

        let ct = encrypt(
            &mut OsRng,
            &public,
            &plain,
            DecryptScheme::RsaOaep(HashAlg::Sha256),
        )
        .unwrap();
        assert_eq!(private.decrypt(Oaep::new::<Sha256>(), &ct).unwrap(), plain);

        let signing = p256::ecdsa::SigningKey::random(&mut OsRng);
        let ec = SoftPublicKey::P256(p256::ecdsa::VerifyingKey::from(&signing));
        assert!(encrypt(&mut OsRng, &ec, &plain, DecryptScheme::RsaPkcs1v15).is_err());
    }
}
