// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use anyhow::{Context, Result};
use fs_err as fs;
use tpm_types::{KeyAlgorithm, KeySpec};
use tracing::debug;
use tss_esapi::{
    structures::{Private, Public},
    traits::{Marshall, UnMarshall},
};

use crate::{
    keyfile::{tpm2b_unwrap, tpm2b_wrap, KeyFile},
    public,
};

/// A key living inside the TPM, held as its loadable blob
#[derive(Debug, Clone)]
pub struct TpmKey {
    pub(crate) parent: u32,
    pub(crate) empty_auth: bool,
    pub(crate) public: Public,
    pub(crate) private: Private,
    spec: KeySpec,
}

impl TpmKey {
    pub(crate) fn new(parent: u32, public: Public, private: Private) -> Result<Self> {
        let spec = public::key_spec(&public)?;
        Ok(Self {
            parent,
            empty_auth: true,
            public,
            private,
            spec,
        })
    }

    pub fn spec(&self) -> KeySpec {
        self.spec
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.spec.algorithm()
    }

    pub fn parent(&self) -> u32 {
        self.parent
    }

    /// SubjectPublicKeyInfo of the key, PEM encoded
    pub fn public_key_pem(&self) -> Result<String> {
        public::spki_pem(&self.public)
    }

    pub fn to_key_file(&self) -> Result<KeyFile> {
        let public = self
            .public
            .marshall()
            .context("failed to marshal public part")?;
        Ok(KeyFile {
            empty_auth: self.empty_auth,
            parent: self.parent,
            public: tpm2b_wrap(&public)?,
            private: tpm2b_wrap(self.private.value())?,
        })
    }

    pub fn from_key_file(file: &KeyFile) -> Result<Self> {
        let public = Public::unmarshall(tpm2b_unwrap(&file.public)?)
            .context("failed to unmarshal public part")?;
        let private = Private::try_from(tpm2b_unwrap(&file.private)?.to_vec())
            .context("failed to create private structure")?;
        let mut key = Self::new(file.parent, public, private)?;
        key.empty_auth = file.empty_auth;
        Ok(key)
    }

    /// TSS2 PRIVATE KEY PEM of the key blob
    pub fn to_pem(&self) -> Result<String> {
        Ok(self.to_key_file()?.to_pem())
    }

    pub fn from_pem(data: &[u8]) -> Result<Self> {
        Self::from_key_file(&KeyFile::from_pem(data)?)
    }

    /// Store the key blob on disk
    pub fn write_pem(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_pem()?)?;
        debug!("wrote {} key to {}", self.spec, path.display());
        Ok(())
    }

    /// Load a key blob from disk
    pub fn read_pem(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        let key = Self::from_pem(&data)
            .with_context(|| format!("failed to read key from {}", path.display()))?;
        debug!("loaded {} key from {}", key.spec, path.display());
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{esapi::EsapiContext, TPM2_RH_OWNER};
    use tpm_types::EcGroup;

    fn unloaded_key(spec: &KeySpec) -> TpmKey {
        let public = EsapiContext::key_template(spec).unwrap();
        let private = Private::try_from(vec![0x5a; 64]).unwrap();
        TpmKey::new(TPM2_RH_OWNER, public, private).unwrap()
    }

    #[test]
    fn test_key_spec_from_public() {
        let key = unloaded_key(&KeySpec::Rsa { bits: 3072 });
        assert_eq!(key.spec(), KeySpec::Rsa { bits: 3072 });
        assert_eq!(key.algorithm(), KeyAlgorithm::Rsa);

        let key = unloaded_key(&KeySpec::ec(EcGroup::P384));
        assert_eq!(key.spec(), KeySpec::ec(EcGroup::P384));
    }

    #[test]
    fn test_key_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ec-key");

        let key = unloaded_key(&KeySpec::ec(EcGroup::P256));
        key.write_pem(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("-----BEGIN TSS2 PRIVATE KEY-----"));

        let loaded = TpmKey::read_pem(&path).unwrap();
        assert_eq!(loaded.parent(), TPM2_RH_OWNER);
        assert_eq!(loaded.spec(), key.spec());
        assert_eq!(loaded.private.value(), key.private.value());
        assert_eq!(loaded.to_pem().unwrap(), key.to_pem().unwrap());
    }

    #[test]
    fn test_read_missing_file() {
        let err = TpmKey::read_pem("/nonexistent/rsa-key").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/rsa-key"));
    }
}
