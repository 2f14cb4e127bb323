// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TSS2 private key file
//!
//! Keys created inside the TPM never leave it in the clear. What is stored
//! on disk is the loadable blob returned by `TPM2_Create`, wrapped in the
//! ASN.1 structure shared by the tpm2 OpenSSL provider and engine:
//!
//! ```text
//! TPMKey ::= SEQUENCE {
//!     type        OBJECT IDENTIFIER,          -- 2.23.133.10.1.3 (loadable key)
//!     emptyAuth   [0] EXPLICIT BOOLEAN OPTIONAL,
//!     policy      [1] EXPLICIT SEQUENCE OF TPMPolicy OPTIONAL,
//!     secret      [2] EXPLICIT OCTET STRING OPTIONAL,
//!     parent      INTEGER,
//!     pubkey      OCTET STRING,               -- TPM2B_PUBLIC
//!     privkey     OCTET STRING                -- TPM2B_PRIVATE
//! }
//! ```

use anyhow::{bail, Context, Result};
use yasna::{models::ObjectIdentifier, Tag};

/// PEM label of a TSS2 key file
pub const TSS2_PEM_TAG: &str = "TSS2 PRIVATE KEY";

/// OID of a loadable key
pub const OID_LOADABLE_KEY: &[u64] = &[2, 23, 133, 10, 1, 3];
/// OID of an importable key
pub const OID_IMPORTABLE_KEY: &[u64] = &[2, 23, 133, 10, 1, 4];
/// OID of a sealed data blob
pub const OID_SEALED_DATA: &[u64] = &[2, 23, 133, 10, 1, 5];

/// Decoded TSS2 key file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFile {
    pub empty_auth: bool,
    /// Parent handle: a hierarchy or a persistent key handle
    pub parent: u32,
    /// Marshalled TPM2B_PUBLIC (size prefixed)
    pub public: Vec<u8>,
    /// Marshalled TPM2B_PRIVATE (size prefixed)
    pub private: Vec<u8>,
}

struct RawKeyFile {
    oid: ObjectIdentifier,
    empty_auth: Option<bool>,
    has_policy: bool,
    has_secret: bool,
    parent: u32,
    public: Vec<u8>,
    private: Vec<u8>,
}

impl KeyFile {
    pub fn to_der(&self) -> Vec<u8> {
        let oid = ObjectIdentifier::from_slice(OID_LOADABLE_KEY);
        yasna::construct_der(|writer| {
            writer.write_sequence(|writer| {
                writer.next().write_oid(&oid);
                if self.empty_auth {
                    writer
                        .next()
                        .write_tagged(Tag::context(0), |writer| writer.write_bool(true));
                }
                writer.next().write_u32(self.parent);
                writer.next().write_bytes(&self.public);
                writer.next().write_bytes(&self.private);
            })
        })
    }

    pub fn from_der(der: &[u8]) -> Result<Self> {
        let raw = yasna::parse_der(der, |reader| {
            reader.read_sequence(|reader| {
                let oid = reader.next().read_oid()?;
                let empty_auth = reader.read_optional(|reader| {
                    reader.read_tagged(Tag::context(0), |reader| reader.read_bool())
                })?;
                let policy = reader.read_optional(|reader| {
                    reader.read_tagged(Tag::context(1), |reader| reader.read_der())
                })?;
                let secret = reader.read_optional(|reader| {
                    reader.read_tagged(Tag::context(2), |reader| reader.read_der())
                })?;
                let parent = reader.next().read_u32()?;
                let public = reader.next().read_bytes()?;
                let private = reader.next().read_bytes()?;
                Ok(RawKeyFile {
                    oid,
                    empty_auth,
                    has_policy: policy.is_some(),
                    has_secret: secret.is_some(),
                    parent,
                    public,
                    private,
                })
            })
        })
        .context("failed to decode TSS2 key ASN.1")?;

        let oid = raw.oid.components().as_slice();
        if oid == OID_IMPORTABLE_KEY {
            bail!("importable TSS2 keys are not supported");
        }
        if oid == OID_SEALED_DATA {
            bail!("TSS2 sealed data is not a key");
        }
        if oid != OID_LOADABLE_KEY {
            bail!("unknown TSS2 key type: {oid:?}");
        }
        if raw.has_policy {
            bail!("TSS2 keys with an authorization policy are not supported");
        }
        if raw.has_secret {
            bail!("TSS2 keys with an imported secret are not supported");
        }

        // Both blobs must be well formed TPM2B structures
        tpm2b_unwrap(&raw.public).context("invalid pubkey field")?;
        tpm2b_unwrap(&raw.private).context("invalid privkey field")?;

        Ok(Self {
            empty_auth: raw.empty_auth.unwrap_or(false),
            parent: raw.parent,
            public: raw.public,
            private: raw.private,
        })
    }

    pub fn to_pem(&self) -> String {
        let config = pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF);
        pem::encode_config(&pem::Pem::new(TSS2_PEM_TAG, self.to_der()), config)
    }

    pub fn from_pem(data: &[u8]) -> Result<Self> {
        let pem = pem::parse(data).context("failed to parse PEM")?;
        if pem.tag() != TSS2_PEM_TAG {
            bail!(
                "unexpected PEM label: expected {TSS2_PEM_TAG}, got {}",
                pem.tag()
            );
        }
        Self::from_der(pem.contents())
    }
}

/// Prefix `data` with its big-endian u16 size, making it a TPM2B
pub fn tpm2b_wrap(data: &[u8]) -> Result<Vec<u8>> {
    let size = u16::try_from(data.len()).context("TPM2B payload exceeds 65535 bytes")?;
    let mut out = Vec::with_capacity(2 + data.len());
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(data);
    Ok(out)
}

/// Strip the size prefix of a TPM2B, checking it matches the buffer
pub fn tpm2b_unwrap(data: &[u8]) -> Result<&[u8]> {
    if data.len() < 2 {
        bail!("TPM2B too small: {} bytes", data.len());
    }
    let size = u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() != 2 + size {
        bail!(
            "TPM2B size mismatch: header says {size}, buffer holds {}",
            data.len() - 2
        );
    }
    Ok(&data[2..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> KeyFile {
        KeyFile {
            empty_auth: true,
            parent: 0x4000_0001,
            public: tpm2b_wrap(&[0x00, 0x01, 0x00, 0x0b]).unwrap(),
            private: tpm2b_wrap(&[0xAA; 40]).unwrap(),
        }
    }

    #[test]
    fn test_key_file_pem() {
        let key = sample();
        let pem = key.to_pem();
        assert!(pem.starts_with("-----BEGIN TSS2 PRIVATE KEY-----"));
        assert_eq!(KeyFile::from_pem(pem.as_bytes()).unwrap(), key);
    }

    #[test]
    fn test_key_file_der_layout() {
        let der = sample().to_der();
        // SEQUENCE, then the loadable key OID
        assert_eq!(der[0], 0x30);
        let oid = [0x06, 0x06, 0x67, 0x81, 0x05, 0x0a, 0x01, 0x03];
        assert_eq!(&der[2..2 + oid.len()], &oid);
        // emptyAuth [0] { TRUE }
        assert_eq!(&der[10..15], &[0xa0, 0x03, 0x01, 0x01, 0xff]);
        // parent INTEGER 0x40000001
        assert_eq!(&der[15..21], &[0x02, 0x04, 0x40, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_persistent_parent() {
        let key = KeyFile {
            parent: 0x8100_0001,
            empty_auth: false,
            ..sample()
        };
        let decoded = KeyFile::from_der(&key.to_der()).unwrap();
        assert_eq!(decoded.parent, 0x8100_0001);
        assert!(!decoded.empty_auth);
    }

    #[test]
    fn test_rejects_policy_key() {
        let key = sample();
        let der = yasna::construct_der(|writer| {
            writer.write_sequence(|writer| {
                writer
                    .next()
                    .write_oid(&ObjectIdentifier::from_slice(OID_LOADABLE_KEY));
                writer
                    .next()
                    .write_tagged(Tag::context(1), |writer| writer.write_sequence(|_| {}));
                writer.next().write_u32(key.parent);
                writer.next().write_bytes(&key.public);
                writer.next().write_bytes(&key.private);
            })
        });
        let err = KeyFile::from_der(&der).unwrap_err();
        assert!(err.to_string().contains("policy"));
    }

    #[test]
    fn test_rejects_other_key_types() {
        let key = sample();
        let der = yasna::construct_der(|writer| {
            writer.write_sequence(|writer| {
                writer
                    .next()
                    .write_oid(&ObjectIdentifier::from_slice(OID_SEALED_DATA));
                writer.next().write_u32(key.parent);
                writer.next().write_bytes(&key.public);
                writer.next().write_bytes(&key.private);
            })
        });
        assert!(KeyFile::from_der(&der).is_err());
    }

    #[test]
    fn test_rejects_wrong_label() {
        let pem = pem::encode(&pem::Pem::new("PRIVATE KEY", sample().to_der()));
        assert!(KeyFile::from_pem(pem.as_bytes()).is_err());
    }

    #[test]
    fn test_tpm2b_unwrap() {
        assert_eq!(tpm2b_unwrap(&[0x00, 0x02, 0x01, 0x02]).unwrap(), &[1, 2]);
        assert!(tpm2b_unwrap(&[0x00]).is_err());
        assert!(tpm2b_unwrap(&[0x00, 0x03, 0x01]).is_err());
    }
}
