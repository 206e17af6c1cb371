use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::RwLock;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 33775;

/// Factory passphrase. Works, but every device shipped with it shares keys.
pub const PLACEHOLDER_PASS: &str = "12345678";

pub const ENV_HOST: &str = "TELEMETRY_SERVER_HOST";
pub const ENV_PORT: &str = "TELEMETRY_SERVER_PORT";
pub const ENV_PASS: &str = "TELEMETRY_CRYPTO_PASS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: dotenvy::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("config lock poisoned")]
    LockPoisoned,
}

/// Where requests are posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Settings the engine re-reads at the start of every cycle.
#[derive(Clone, PartialEq, Eq)]
pub struct UplinkConfig {
    pub endpoint: Endpoint,
    pub crypto_pass: String,
}

impl UplinkConfig {
    pub fn uses_placeholder_pass(&self) -> bool {
        self.crypto_pass == PLACEHOLDER_PASS
    }
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint {
                host: DEFAULT_HOST.into(),
                port: DEFAULT_PORT,
            },
            crypto_pass: PLACEHOLDER_PASS.into(),
        }
    }
}

// Keep the passphrase out of logs.
impl fmt::Debug for UplinkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UplinkConfig")
            .field("endpoint", &self.endpoint)
            .field("crypto_pass", &"<redacted>")
            .finish()
    }
}

/// Supplier of the current uplink settings. Consulted once per cycle, so
/// edits take effect without restarting the engine.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<UplinkConfig, ConfigError>;
}

impl<C: ConfigSource + ?Sized> ConfigSource for std::sync::Arc<C> {
    fn load(&self) -> Result<UplinkConfig, ConfigError> {
        (**self).load()
    }
}

/// In-memory settings that can be swapped at runtime.
#[derive(Debug, Default)]
pub struct MemoryConfig {
    current: RwLock<UplinkConfig>,
}

impl MemoryConfig {
    pub fn new(config: UplinkConfig) -> Self {
        Self {
            current: RwLock::new(config),
        }
    }

    pub fn replace(&self, config: UplinkConfig) -> Result<(), ConfigError> {
        let mut current = self.current.write().map_err(|_| ConfigError::LockPoisoned)?;
        *current = config;
        Ok(())
    }
}

impl ConfigSource for MemoryConfig {
    fn load(&self) -> Result<UplinkConfig, ConfigError> {
        self.current
            .read()
            .map(|c| c.clone())
            .map_err(|_| ConfigError::LockPoisoned)
    }
}

/// Settings from a dotenv-style file, re-read on every load.
///
/// Precedence per key: the file, then the process environment, then the
/// built-in default. The file wins so that edits made after startup are
/// picked up even though `dotenvy::dotenv()` already copied it into the
/// environment.
#[derive(Debug, Clone)]
pub struct EnvFileConfig {
    path: PathBuf,
}

impl EnvFileConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_file(&self) -> Result<HashMap<String, String>, ConfigError> {
        let file_error = |source: dotenvy::Error| ConfigError::File {
            path: self.path.display().to_string(),
            source,
        };

        let iter = match dotenvy::from_path_iter(&self.path) {
            Ok(iter) => iter,
            Err(e) if e.not_found() => return Ok(HashMap::new()),
            Err(e) => return Err(file_error(e)),
        };

        let mut vars = HashMap::new();
        for item in iter {
            let (key, value) = item.map_err(file_error)?;
            vars.insert(key, value);
        }
        Ok(vars)
    }
}

impl ConfigSource for EnvFileConfig {
    fn load(&self) -> Result<UplinkConfig, ConfigError> {
        let file = self.read_file()?;
        let lookup = |key: &str| -> Option<String> {
            file.get(key)
                .cloned()
                .or_else(|| std::env::var(key).ok())
                .filter(|v| !v.trim().is_empty())
        };

        let defaults = UplinkConfig::default();
        let host = lookup(ENV_HOST).unwrap_or(defaults.endpoint.host);
        let port = match lookup(ENV_PORT) {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                key: ENV_PORT,
                value: raw,
            })?,
            None => defaults.endpoint.port,
        };
        let crypto_pass = lookup(ENV_PASS).unwrap_or(defaults.crypto_pass);

        Ok(UplinkConfig {
            endpoint: Endpoint { host, port },
            crypto_pass,
        })
    }
}
