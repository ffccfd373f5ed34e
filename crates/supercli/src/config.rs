//! `config.toml` and the built-in provider catalog.
//!
//! ```toml
//! provider = "groq"
//! model = "llama-3.1-8b-instant"
//!
//! [engine]
//! max_tool_rounds = 25
//! command_timeout_secs = 30
//!
//! [retry]
//! max_attempts = 5
//!
//! [oauth_clients.gemini]
//! client_id = "1234.apps.googleusercontent.com"
//!
//! [[providers]]
//! id = "lmstudio"
//! auth = "none"
//! base_url = "http://localhost:1234/v1"
//!
//! [[mcp.servers]]
//! name = "github"
//! command = "npx"
//! args = ["-y", "@modelcontextprotocol/server-github"]
//! ```

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;
use supercli_auth::OAuthClientConfig;
use supercli_core::RetryPolicy;
use supercli_mcp::McpServerConfig;
use supercli_model::ProviderProfile;
use thiserror::Error;

const BUILTIN_PROVIDERS: &str = include_str!("./builtin_providers.toml");
const DEFAULT_PROVIDER: &str = "groq";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("built-in provider catalog is invalid: {0}")]
    Builtin(#[source] toml::de::Error),

    #[error("cannot determine the configuration directory of this platform")]
    NoHomeDirectory,
}

/// Where everything is stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Paths {
    pub config_file: PathBuf,
    pub credentials_dir: PathBuf,
    pub sessions_dir: PathBuf,
}

impl Paths {
    /// Returns the platform directories, e.g. `~/.config/supercli` and
    /// `~/.local/share/supercli` on Linux.
    pub fn discover() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from("", "", "supercli")
            .ok_or(ConfigError::NoHomeDirectory)?;
        Ok(Self {
            config_file: dirs.config_dir().join("config.toml"),
            credentials_dir: dirs.config_dir().join("credentials"),
            sessions_dir: dirs.data_dir().join("sessions"),
        })
    }

    /// Puts everything under one directory.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            config_file: root.join("config.toml"),
            credentials_dir: root.join("credentials"),
            sessions_dir: root.join("sessions"),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// The provider used at startup.
    pub provider: Option<String>,
    /// The model used at startup. Defaults to the provider's default model.
    pub model: Option<String>,
    /// Replaces the built-in system prompt.
    pub system_prompt: Option<String>,
    pub engine: EngineSettings,
    pub retry: RetrySettings,
    /// Extra providers, or replacements of built-in ones with the same id.
    pub providers: Vec<ProviderEntry>,
    /// OAuth client credentials, keyed by provider id.
    pub oauth_clients: BTreeMap<String, OAuthClientOverride>,
    pub mcp: McpSettings,
}

/// A provider profile plus its OAuth client settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ProviderEntry {
    #[serde(flatten)]
    pub profile: ProviderProfile,
    #[serde(default)]
    pub oauth: Option<OAuthClientConfig>,
}

#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OAuthClientOverride {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
}

impl Debug for OAuthClientOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthClientOverride")
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSettings {
    pub max_tool_rounds: usize,
    pub max_consecutive_tool_failures: usize,
    pub tool_timeout_secs: u64,
    pub command_timeout_secs: u64,
    /// How long a response stream may stay silent.
    pub idle_timeout_secs: u64,
    /// Messages kept verbatim by `/compress`.
    pub keep_recent: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_tool_rounds: 25,
            max_consecutive_tool_failures: 3,
            tool_timeout_secs: 300,
            command_timeout_secs: 30,
            idle_timeout_secs: 120,
            keep_recent: 10,
        }
    }
}

impl EngineSettings {
    #[inline]
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    #[inline]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    #[inline]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub base_delay_ms: u64,
    pub factor: f64,
    pub max_delay_secs: u64,
    pub max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            base_delay_ms: policy.base_delay.as_millis() as u64,
            factor: policy.factor,
            max_delay_secs: policy.max_delay.as_secs(),
            max_attempts: policy.max_attempts,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            factor: self.factor.max(1.0),
            max_delay: Duration::from_secs(self.max_delay_secs),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct McpSettings {
    pub servers: Vec<McpServerConfig>,
    pub request_timeout_secs: u64,
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            servers: vec![],
            request_timeout_secs: 30,
        }
    }
}

#[derive(Deserialize)]
struct Catalog {
    providers: Vec<ProviderEntry>,
}

impl Config {
    /// Loads the config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("no config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_owned(),
                    source,
                });
            }
        };
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Returns the provider used when none is chosen on the command line.
    pub fn default_provider(&self) -> &str {
        self.provider.as_deref().unwrap_or(DEFAULT_PROVIDER)
    }

    /// Returns every known provider: the built-in catalog overlaid with the
    /// providers and OAuth clients of this config.
    pub fn catalog(
        &self,
    ) -> Result<BTreeMap<String, ProviderEntry>, ConfigError> {
        let builtin: Catalog =
            toml::from_str(BUILTIN_PROVIDERS).map_err(ConfigError::Builtin)?;
        let mut catalog = BTreeMap::new();
        let overrides = self.providers.clone();
        for entry in builtin.providers.into_iter().chain(overrides) {
            catalog.insert(entry.profile.id.clone(), entry);
        }
        for (id, client) in &self.oauth_clients {
            let oauth = catalog.get_mut(id).and_then(|e| e.oauth.as_mut());
            let Some(oauth) = oauth else {
                warn!(
                    "OAuth client for `{id}` ignored, \
                     the provider has no OAuth settings"
                );
                continue;
            };
            oauth.client_id = client.client_id.clone();
            oauth.client_secret = client.client_secret.clone();
        }
        Ok(catalog)
    }
}
