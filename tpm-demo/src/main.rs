// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM key demo CLI
//!
//! Without a subcommand the whole sequence runs: random bytes, RSA and EC
//! key generation, sign/verify with both keys and an RSA decrypt.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tpm_demo::{steps, DemoConfig, Providers};
use tpm_types::{DecryptScheme, EcGroup, HashAlg, KeyAlgorithm, KeySpec, SignScheme};

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct ConfigArgs {
    /// TCTI of the TPM, e.g. `device:/dev/tpmrm0` or `mssim:host=localhost,port=2321`
    #[arg(long, global = true, env = "TPM2OPENSSL_TCTI")]
    tcti: Option<String>,

    /// RSA key file
    #[arg(long, global = true, env = "TPM_DEMO_RSA_KEY", default_value = "/tmp/rsa-key")]
    rsa_key: PathBuf,

    /// EC key file
    #[arg(long, global = true, env = "TPM_DEMO_EC_KEY", default_value = "/tmp/ec-key")]
    ec_key: PathBuf,

    /// RSA modulus size
    #[arg(
        long,
        global = true,
        env = "TPM_DEMO_RSA_BITS",
        default_value_t = 3072,
        value_parser = parse_rsa_bits
    )]
    rsa_bits: u16,

    /// EC curve
    #[arg(long, global = true, env = "TPM_DEMO_EC_GROUP", default_value_t = EcGroup::P256)]
    ec_group: EcGroup,
}

impl From<ConfigArgs> for DemoConfig {
    fn from(args: ConfigArgs) -> Self {
        DemoConfig {
            tcti: args.tcti,
            rsa_key: args.rsa_key,
            ec_key: args.ec_key,
            rsa_bits: args.rsa_bits,
            ec_group: args.ec_group,
        }
    }
}

fn parse_rsa_bits(s: &str) -> Result<u16, String> {
    let bits: u16 = s.parse().map_err(|e| format!("{e}"))?;
    KeySpec::rsa(bits).map_err(|e| e.to_string())?;
    Ok(bits)
}

#[derive(Subcommand)]
enum Commands {
    /// Run the whole demo (default)
    All,
    /// Get 4 random bytes
    Random {
        /// Provider to ask, as a property query
        #[arg(long, default_value = "provider=tpm2")]
        propq: String,
    },
    /// Generate an RSA key in the TPM
    GenRsa {
        /// Key generation parameter, e.g. `bits=4096`; overrides --rsa-bits
        #[arg(long = "param", value_parser = steps::parse_param)]
        params: Vec<(String, String)>,
    },
    /// Generate an EC key in the TPM
    GenEc {
        /// Key generation parameter, e.g. `group=P-384`; overrides --ec-group
        #[arg(long = "param", value_parser = steps::parse_param)]
        params: Vec<(String, String)>,
    },
    /// Print the public part of a TSS2 key file
    ShowKey {
        /// Key file
        path: PathBuf,
    },
    /// Sign with the RSA key and verify in software
    RsaSign {
        /// Use RSASSA-PKCS1-v1_5 instead of RSA-PSS
        #[arg(long)]
        pkcs1: bool,
        /// Digest hash
        #[arg(long, default_value_t = HashAlg::Sha256)]
        hash: HashAlg,
    },
    /// Sign with the EC key and verify in software
    EcSign {
        /// Digest hash, defaults to the one matching the curve
        #[arg(long)]
        hash: Option<HashAlg>,
    },
    /// Encrypt to the RSA key in software and decrypt in the TPM
    RsaDecrypt {
        /// `pkcs1`, `oaep` or `oaep-sha384`
        #[arg(long, default_value = "pkcs1")]
        padding: DecryptScheme,
    },
}

fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    }

    let cli = Cli::parse();
    let config = DemoConfig::from(cli.config);
    let tcti = config.tcti.as_deref();

    match cli.command.unwrap_or(Commands::All) {
        Commands::All => steps::run_all(&config)?,
        Commands::Random { propq } => {
            let mut providers = Providers::load(tcti)?;
            steps::gen_random(providers.select(&propq)?)?;
        }
        Commands::GenRsa { params } => {
            let mut providers = Providers::load(tcti)?;
            if params.is_empty() {
                steps::gen_key(&mut providers, &config.rsa_spec()?, &config.rsa_key)?;
            } else {
                let alg = KeyAlgorithm::Rsa;
                steps::gen_key_with_params(&mut providers, alg, &params, &config.rsa_key)?;
            }
        }
        Commands::GenEc { params } => {
            let mut providers = Providers::load(tcti)?;
            if params.is_empty() {
                steps::gen_key(&mut providers, &config.ec_spec(), &config.ec_key)?;
            } else {
                let alg = KeyAlgorithm::Ec;
                steps::gen_key_with_params(&mut providers, alg, &params, &config.ec_key)?;
            }
        }
        Commands::ShowKey { path } => steps::show_key(&path)?,
        Commands::RsaSign { pkcs1, hash } => {
            let key = steps::load_key(KeyAlgorithm::Rsa, &config.rsa_key)?;
            let scheme = if pkcs1 {
                SignScheme::RsaPkcs1v15(hash)
            } else {
                SignScheme::RsaPss(hash)
            };
            let mut providers = Providers::load(tcti)?;
            steps::sign_verify(&mut providers, &key, scheme)?;
        }
        Commands::EcSign { hash } => {
            let key = steps::load_key(KeyAlgorithm::Ec, &config.ec_key)?;
            let hash = match (hash, key.spec()) {
                (Some(hash), _) => hash,
                (None, KeySpec::Ec { group }) => group.default_hash(),
                (None, KeySpec::Rsa { .. }) => HashAlg::Sha256,
            };
            let mut providers = Providers::load(tcti)?;
            steps::sign_verify(&mut providers, &key, SignScheme::Ecdsa(hash))?;
        }
        Commands::RsaDecrypt { padding } => {
            let key = steps::load_key(KeyAlgorithm::Rsa, &config.rsa_key)?;
            let mut providers = Providers::load(tcti)?;
            steps::encrypt_decrypt(&mut providers, &key, padding)?;
        }
    }
    Ok(())
}
