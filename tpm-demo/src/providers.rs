// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};
use soft_provider::SoftProvider;
use tpm_provider::TpmProvider;
use tpm_types::{Provider, ProviderKind};
use tracing::info;

/// The hardware and software providers, both self tested
pub struct Providers {
    pub tpm: TpmProvider,
    pub soft: SoftProvider,
}

impl Providers {
    pub fn load(tcti: Option<&str>) -> Result<Self> {
        let tpm = load(ProviderKind::Tpm2, || TpmProvider::open(tcti))?;
        let soft = load(ProviderKind::Default, || Ok(SoftProvider::new()))?;
        Ok(Self { tpm, soft })
    }

    /// Pick a provider by property query, e.g. `provider=default`
    pub fn select(&mut self, query: &str) -> Result<&mut dyn Provider> {
        let provider: &mut dyn Provider = match ProviderKind::from_query(query)? {
            ProviderKind::Tpm2 => &mut self.tpm,
            ProviderKind::Default => &mut self.soft,
        };
        Ok(provider)
    }
}

fn load<P: Provider>(kind: ProviderKind, open: impl FnOnce() -> Result<P>) -> Result<P> {
    let mut provider = open().with_context(|| format!("failed to load provider {kind}"))?;
    provider
        .self_test()
        .with_context(|| format!("provider {kind} failed its self test"))?;
    info!("loaded provider {kind}");
    Ok(provider)
}
