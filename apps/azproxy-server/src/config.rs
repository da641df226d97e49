//! Layered server configuration.
//!
//! Precedence, lowest first: struct defaults, the YAML file, the flat
//! environment names older deployments use (`AZURE_CLIENT_ID`, `PORT`, ...),
//! `AZPROXY__`-prefixed variables with `__` nesting, and CLI flags.

use std::path::Path;

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use llm_proxy::{
    AdmissionConfig, BackendConfig, IdentityConfig, ProxyConfig, RelayConfig, ServerConfig,
};
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "AZPROXY__";

/// Flat variable names mapped onto config paths.
const LEGACY_ENV: [(&str, &str); 10] = [
    ("AZURE_CLIENT_ID", "identity.client_id"),
    ("AZURE_CLIENT_SECRET", "identity.client_secret"),
    ("AZURE_TENANT_ID", "identity.tenant_id"),
    ("AZURE_OPENAI_ENDPOINT", "backend.endpoint"),
    ("AZURE_OPENAI_DEPLOYMENT", "backend.deployment"),
    ("AZURE_OPENAI_API_VERSION", "backend.api_version"),
    ("REQUEST_TIMEOUT", "backend.request_timeout"),
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("LOG_LEVEL", "logging.level"),
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub identity: IdentityConfig,
    pub backend: BackendConfig,
    pub admission: AdmissionConfig,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` wins when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Values given on the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub verbose: u8,
}

impl AppConfig {
    /// Load every layer. A missing `path` means defaults plus environment.
    ///
    /// # Errors
    /// Unreadable or malformed YAML, or values of the wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            if !path.is_file() {
                anyhow::bail!("config file does not exist: {}", path.display());
            }
            figment = figment.merge(Yaml::file(path));
        }
        figment
            .merge(legacy_env())
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("failed to load configuration")
    }

    pub fn apply_cli_overrides(&mut self, cli: CliOverrides) {
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        let level = match cli.verbose {
            0 => return,
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        self.logging.level = level.to_owned();
    }

    /// The sections the proxy itself consumes.
    #[must_use]
    pub fn proxy(&self) -> ProxyConfig {
        ProxyConfig {
            server: self.server.clone(),
            identity: self.identity.clone(),
            backend: self.backend.clone(),
            admission: self.admission.clone(),
            relay: self.relay.clone(),
        }
    }

    /// Effective configuration as YAML. Secrets are redacted.
    ///
    /// # Errors
    /// Serialization failures.
    pub fn to_yaml(&self) -> Result<String> {
        serde_saphyr::to_string(self).context("failed to render configuration")
    }
}

fn legacy_env() -> Env {
    let names = LEGACY_ENV.map(|(name, _)| name);
    Env::raw().only(&names).map(|key| {
        LEGACY_ENV
            .iter()
            .find(|(name, _)| key == *name)
            .map_or_else(|| key.as_str().into(), |(_, path)| (*path).into())
    })
}
