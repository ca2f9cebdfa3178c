//! Verifier configuration.
//!
//! Loaded once from a TOML file before the pipeline runs and passed to it by
//! reference. Key material is read eagerly so a bad path fails at startup.

use pgp::{Deserializable, SignedPublicKey, SignedSecretKey};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dkim::NameserverSource;
use crate::error::VerifyError;
use crate::parse::Address;
use crate::smtp::SmtpOptions;

pub const DEFAULT_CONFIG_PATH: &str = ".nyms/verify_config";
pub const DEFAULT_PUBLIC_KEY: &str = ".nyms/verify_key.pub";
pub const DEFAULT_PRIVATE_KEY: &str = ".nyms/verify_key.sec";
pub const DEFAULT_DKIM_PEM: &str = ".nyms/verify_dkim.pem";
pub const DEFAULT_LOG_PATH: &str = ".nyms/verify_log";

/// On-disk layout of the config file
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub verify_address: String,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub dkim_disabled: bool,
    #[serde(default)]
    pub dkim_selector: String,
    #[serde(default)]
    pub dkim_domain: String,
    #[serde(default)]
    pub public_key: Option<PathBuf>,
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    #[serde(default)]
    pub dkim_key_pem: Option<PathBuf>,
    #[serde(default)]
    pub network: NetworkConfig,
}

/// Network tunables
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub smtp_port: u16,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub dns_timeout_secs: u64,
    /// Name sent with EHLO; defaults to the verify address domain.
    pub helo_name: Option<String>,
    pub resolv_conf: PathBuf,
    /// Explicit `ip:port` for DKIM queries, overrides `resolv_conf`.
    pub nameserver: Option<SocketAddr>,
    /// PEM roots for STARTTLS peers; the system bundle is searched when unset.
    pub ca_bundle: Option<PathBuf>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            smtp_port: 25,
            connect_timeout_secs: 30,
            command_timeout_secs: 60,
            dns_timeout_secs: 5,
            helo_name: None,
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            nameserver: None,
            ca_bundle: None,
        }
    }
}

/// Material used to DKIM-sign outgoing reports.
#[derive(Debug, Clone)]
pub struct DkimSigning {
    pub domain: String,
    pub selector: String,
    pub private_pem: Vec<u8>,
}

/// Validated configuration handed to the pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    pub verify_address: Address,
    pub log_path: PathBuf,
    /// ASCII-armored PGP public key.
    pub public_key: Vec<u8>,
    /// ASCII-armored PGP secret key.
    pub private_key: Vec<u8>,
    pub dkim: Option<DkimSigning>,
    pub network: NetworkConfig,
}

impl Config {
    /// Loads `path`, or `~/.nyms/verify_config` when none is given.
    pub fn load(path: Option<&Path>) -> Result<Self, VerifyError> {
        let home = home_dir()?;
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| home.join(DEFAULT_CONFIG_PATH));
        let text = std::fs::read_to_string(&path)
            .map_err(|e| VerifyError::Config(format!("{}: {}", path.display(), e)))?;
        let file: ConfigFile = toml::from_str(&text)
            .map_err(|e| VerifyError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_file(file, &home)
    }

    /// Validates a parsed file, resolving relative defaults against `home`.
    pub fn from_file(file: ConfigFile, home: &Path) -> Result<Self, VerifyError> {
        let verify_address = Address::parse(&file.verify_address)
            .map_err(|e| VerifyError::Config(format!("verify_address: {}", e)))?;

        let public_key =
            load_pgp_key(file.public_key, &home.join(DEFAULT_PUBLIC_KEY), KeyKind::Public)?;
        let private_key =
            load_pgp_key(file.private_key, &home.join(DEFAULT_PRIVATE_KEY), KeyKind::Secret)?;

        let dkim = if file.dkim_disabled {
            None
        } else {
            let path = file
                .dkim_key_pem
                .unwrap_or_else(|| home.join(DEFAULT_DKIM_PEM));
            let private_pem = std::fs::read(&path).map_err(|e| {
                VerifyError::Config(format!(
                    "failed to load DKIM PEM file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
            Some(DkimSigning {
                domain: file.dkim_domain,
                selector: file.dkim_selector,
                private_pem,
            })
        };

        Ok(Self {
            verify_address,
            log_path: file.log_path.unwrap_or_else(|| home.join(DEFAULT_LOG_PATH)),
            public_key,
            private_key,
            dkim,
            network: file.network,
        })
    }

    pub fn smtp_options(&self) -> SmtpOptions {
        SmtpOptions {
            port: self.network.smtp_port,
            helo_name: self
                .network
                .helo_name
                .clone()
                .unwrap_or_else(|| self.verify_address.domain().to_string()),
            connect_timeout: Duration::from_secs(self.network.connect_timeout_secs),
            command_timeout: Duration::from_secs(self.network.command_timeout_secs),
        }
    }

    pub fn nameserver_source(&self) -> NameserverSource {
        match self.network.nameserver {
            Some(addr) => NameserverSource::Fixed(addr),
            None => NameserverSource::ResolvConf(self.network.resolv_conf.clone()),
        }
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_secs(self.network.dns_timeout_secs)
    }
}

fn home_dir() -> Result<PathBuf, VerifyError> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| VerifyError::Config("could not look up current user: HOME is not set".into()))
}

/// Which half of a PGP key pair a file must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyKind {
    Public,
    Secret,
}

/// Reads an armored key file that must decode to exactly one key of `kind`.
fn load_pgp_key(path: Option<PathBuf>, default: &Path, kind: KeyKind) -> Result<Vec<u8>, VerifyError> {
    let path = path.unwrap_or_else(|| default.to_path_buf());
    let data = std::fs::read(&path)
        .map_err(|e| VerifyError::Config(format!("{}: {}", path.display(), e)))?;
    let keys = count_armored_keys(&data, kind).map_err(|e| {
        VerifyError::Config(format!("failed to parse key file {}: {}", path.display(), e))
    })?;
    if keys != 1 {
        return Err(VerifyError::Config(format!(
            "Key file {} contained {} keys, expecting 1",
            path.display(),
            keys
        )));
    }
    Ok(data)
}

fn count_armored_keys(data: &[u8], kind: KeyKind) -> pgp::errors::Result<usize> {
    let count = match kind {
        KeyKind::Public => {
            let (keys, _headers) = SignedPublicKey::from_armor_many(data)?;
            keys.collect::<pgp::errors::Result<Vec<_>>>()?.len()
        }
        KeyKind::Secret => {
            let (keys, _headers) = SignedSecretKey::from_armor_many(data)?;
            keys.collect::<pgp::errors::Result<Vec<_>>>()?.len()
        }
    };
    Ok(count)
}
