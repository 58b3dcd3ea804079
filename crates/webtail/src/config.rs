//! Configuration loading and validation.
//!
//! The config file is JSON: shared tailnet credentials plus one entry per
//! exposed service. Two historical spellings are accepted and
//! canonicalized here: `hostname` for `node_name`, and a bare
//! `local_port` instead of a full `target` URL.

use std::fmt;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Shared tailnet credentials, read-only after load.
#[derive(Clone, Deserialize)]
pub struct TailnetSettings {
    /// Pre-authorized key used to bring nodes online. Never logged.
    pub auth_key: String,

    /// Whether nodes deregister from the tailnet when their session ends.
    #[serde(default)]
    pub ephemeral: bool,

    /// Domain suffix the tailnet issues certificates under.
    #[serde(default)]
    pub tailnet_domain: Option<String>,
}

impl fmt::Debug for TailnetSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TailnetSettings")
            .field("auth_key", &"<redacted>")
            .field("ephemeral", &self.ephemeral)
            .field("tailnet_domain", &self.tailnet_domain)
            .finish()
    }
}

/// One exposed service: a node identity plus the backend it fronts.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSpec {
    /// Unique node identity on the tailnet.
    #[serde(alias = "hostname")]
    pub node_name: String,

    /// Backend as a `scheme://host[:port]` URL or bare `host:port`.
    #[serde(default)]
    pub target: Option<String>,

    /// Backend as a port on localhost; alternative to `target`.
    #[serde(default)]
    pub local_port: Option<u32>,

    /// Preserve the inbound Host header toward the backend instead of
    /// asserting the backend's own authority.
    #[serde(default)]
    pub pass_host_header: bool,

    /// Trust caller-supplied forwarding headers instead of overwriting
    /// them with the proxy's own values.
    #[serde(default)]
    pub trust_forward_header: bool,
}

impl ServiceSpec {
    /// Canonical target string; bare ports become `localhost:<port>`.
    pub fn target_str(&self) -> String {
        match (&self.target, self.local_port) {
            (Some(target), _) => target.clone(),
            (None, Some(port)) => format!("localhost:{}", port),
            (None, None) => String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub tailscale: TailnetSettings,
    pub services: Vec<ServiceSpec>,
}

impl Config {
    /// Read and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let config: Config =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Check the invariants that cannot be expressed in the schema.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tailscale.auth_key.is_empty() {
            return Err(ConfigError::Invalid(
                "tailscale.auth_key is required".to_string(),
            ));
        }

        if self.services.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one service must be configured".to_string(),
            ));
        }

        for (i, service) in self.services.iter().enumerate() {
            if service.node_name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "services[{}]: node_name is required",
                    i
                )));
            }

            match (&service.target, service.local_port) {
                (None, None) => {
                    return Err(ConfigError::Invalid(format!(
                        "services[{}]: either target or local_port is required",
                        i
                    )));
                }
                (Some(_), Some(_)) => {
                    return Err(ConfigError::Invalid(format!(
                        "services[{}]: target and local_port are mutually exclusive",
                        i
                    )));
                }
                (Some(target), None) => {
                    if target.is_empty() {
                        return Err(ConfigError::Invalid(format!(
                            "services[{}]: target must not be empty",
                            i
                        )));
                    }
                    // Bare host:port targets get the same http scheme the
                    // rewrite defaults in; a target that cannot produce an
                    // outbound URL is fatal here, not at request time.
                    let with_scheme = if target.contains("://") {
                        target.clone()
                    } else {
                        format!("http://{}", target)
                    };
                    let url = url::Url::parse(&with_scheme).map_err(|e| {
                        ConfigError::Invalid(format!(
                            "services[{}]: target '{}' is not a valid URL: {}",
                            i, target, e
                        ))
                    })?;
                    if !url.has_host() {
                        return Err(ConfigError::Invalid(format!(
                            "services[{}]: target '{}' has no host",
                            i, target
                        )));
                    }
                }
                (None, Some(port)) => {
                    if !(1..=65535).contains(&port) {
                        return Err(ConfigError::Invalid(format!(
                            "services[{}]: local_port must be between 1 and 65535",
                            i
                        )));
                    }
                }
            }

            if let Some(j) = self.services[..i]
                .iter()
                .position(|other| other.node_name == service.node_name)
            {
                return Err(ConfigError::Invalid(format!(
                    "services[{}]: node_name '{}' duplicates services[{}]",
                    i, service.node_name, j
                )));
            }
        }

        Ok(())
    }
}
