// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM key demo
//!
//! Drives the `tpm2` hardware provider and the `default` software provider
//! through key generation, signing, verification and decryption.

pub mod providers;
pub mod steps;

pub use providers::Providers;
pub use steps::DemoConfig;
