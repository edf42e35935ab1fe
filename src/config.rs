use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ems_client::EmsClient;
use crate::identity::{CertificateEncoding, ClientIdentity};
use crate::shc_client::{DeviceIdentity, DevicePorts, ShcClient};
use crate::trust::TrustAnchor;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub shc: ShcConfig,
    #[serde(default)]
    pub ems: Option<EmsConfig>,
    // Relative file paths are resolved against the config file's directory.
    #[serde(skip)]
    base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ShcConfig {
    pub host: String,
    pub issuing_ca_file: PathBuf,
    #[serde(default)]
    pub client_cert_file: Option<PathBuf>,
    #[serde(default)]
    pub client_key_file: Option<PathBuf>,
    #[serde(default = "default_public_port")]
    pub public_port: u16,
    #[serde(default = "default_management_port")]
    pub management_port: u16,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default)]
    pub certificate_encoding: CertificateEncoding,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EmsConfig {
    pub hostport: String,
    pub access_token_file: PathBuf,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_public_port() -> u16 {
    crate::shc_client::PUBLIC_PORT
}

fn default_management_port() -> u16 {
    crate::shc_client::CLIENT_MGMT_PORT
}

fn default_api_port() -> u16 {
    crate::shc_client::API_PORT
}

fn default_timeout_secs() -> u64 {
    10
}

impl Config {
    /// Load a TOML config, or JSON when the file ends in `.json`.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("can't read config '{}'", path.display()))?;
        let mut config: Config = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&contents)
                .with_context(|| format!("can't parse config in '{}'", path.display()))?
        } else {
            toml::from_str(&contents)
                .with_context(|| format!("can't parse config in '{}'", path.display()))?
        };
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(config)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.base_dir.join(path)
    }

    pub fn trust_anchor(&self) -> Result<TrustAnchor> {
        let path = self.resolve(&self.shc.issuing_ca_file);
        let pem = std::fs::read(&path)
            .with_context(|| format!("can't read issuing ca file '{}'", path.display()))?;
        let anchor = TrustAnchor::from_pem(&pem)
            .with_context(|| format!("can't load issuing ca file '{}'", path.display()))?;
        info!("Loaded {} pinned CA certificate(s) from {}", anchor.len(), path.display());
        Ok(anchor)
    }

    pub fn client_identity(&self) -> Result<Option<ClientIdentity>> {
        match (&self.shc.client_cert_file, &self.shc.client_key_file) {
            (None, None) => Ok(None),
            (Some(cert), Some(key)) => {
                ClientIdentity::load(&self.resolve(cert), &self.resolve(key)).map(Some)
            }
            (Some(_), None) => bail!("client-cert-file is set but client-key-file is missing"),
            (None, Some(_)) => bail!("client-key-file is set but client-cert-file is missing"),
        }
    }

    pub fn device(&self) -> Result<DeviceIdentity> {
        Ok(DeviceIdentity {
            host: self.shc.host.clone(),
            ports: DevicePorts {
                public: self.shc.public_port,
                client_mgmt: self.shc.management_port,
                api: self.shc.api_port,
            },
            trust: self.trust_anchor()?,
        })
    }

    pub fn shc_client(&self) -> Result<ShcClient> {
        Ok(ShcClient::new(self.device()?, self.client_identity()?)
            .with_certificate_encoding(self.shc.certificate_encoding)
            .with_timeout(Duration::from_secs(self.shc.timeout_secs)))
    }

    pub fn ems_client(&self) -> Result<EmsClient> {
        let Some(ems) = &self.ems else {
            bail!("config has no [ems] section");
        };
        let path = self.resolve(&ems.access_token_file);
        let token = std::fs::read_to_string(&path)
            .with_context(|| format!("can't read '{}'", path.display()))?;
        Ok(EmsClient::new(&ems.hostport, &token)
            .with_timeout(Duration::from_secs(ems.timeout_secs)))
    }
}
