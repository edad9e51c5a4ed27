//! Transport configuration.
//!
//! Every component receives its parameters from a `TransportConfig` at
//! construction; nothing is read from process-wide state after startup.
//!
//! # Resolution
//!
//! 1. `$KHALA_CONFIG` (path to a JSON file)
//! 2. `<config_dir>/khala/config.json` (`~/.config` on Linux)
//! 3. Built-in defaults for the role
//!
//! A file only needs the fields it changes; everything else falls back to
//! the role defaults. Environment variables are applied last:
//!
//! | Variable              | Field                 |
//! |-----------------------|-----------------------|
//! | `KHALA_REGION_PATH`   | `region.path`         |
//! | `KHALA_REGION_OFFSET` | `region.offset`       |
//! | `KHALA_REGION_SIZE`   | `region.capacity`     |
//! | `KHALA_CHUNK_SIZE`    | `chunk_size`          |
//! | `KHALA_MAX_MESSAGE`   | `max_message_size`    |
//! | `KHALA_CONTROL`       | `control`             |
//! | `KHALA_MODE`          | `session.mode`        |

use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::{
    Chunker, ControlEndpoint, TurnPolicy, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_MESSAGE,
};

/// Default region capacity (16 MiB).
pub const DEFAULT_CAPACITY: usize = 16 * 1024 * 1024;

/// Default control port.
pub const DEFAULT_PORT: u16 = 9000;

/// Address the guest reaches its host on.
pub const DEFAULT_HOST_IP: &str = "10.0.1.2";

/// Reply sent by the default host responder.
pub const DEFAULT_RESPONSE: &str = "Response From Host";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid.
    #[error("Failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// An environment override could not be parsed.
    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },

    /// Values parse but are inconsistent.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Which end of the transport this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Guest,
}

impl Role {
    /// Where each side usually finds the shared region: the host sees the
    /// backing file, the guest sees the device exposing it.
    pub fn default_region_path(&self) -> PathBuf {
        match self {
            Role::Host => PathBuf::from("/tmp/firecracker-shmem"),
            Role::Guest => PathBuf::from("/dev/khala-shmem"),
        }
    }

    /// Host listens on all interfaces; guest dials the host's address.
    pub fn default_control(&self) -> ControlEndpoint {
        match self {
            Role::Host => ControlEndpoint::Tcp(format!("0.0.0.0:{}", DEFAULT_PORT)),
            Role::Guest => ControlEndpoint::Tcp(format!("{}:{}", DEFAULT_HOST_IP, DEFAULT_PORT)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => f.write_str("host"),
            Role::Guest => f.write_str("guest"),
        }
    }
}

impl FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "host" => Ok(Role::Host),
            "guest" => Ok(Role::Guest),
            _ => Err(ConfigError::Invalid(format!(
                "Unknown role '{}' (expected 'host' or 'guest')",
                s
            ))),
        }
    }
}

/// How messages travel during a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// One message per region write.
    #[default]
    Region,
    /// Chunked region writes with a terminator frame.
    Chunked,
    /// Payload copied through the control stream.
    Inline,
}

impl FromStr for TransferMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "region" => Ok(TransferMode::Region),
            "chunked" => Ok(TransferMode::Chunked),
            "inline" => Ok(TransferMode::Inline),
            _ => Err(format!("Unknown transfer mode '{}'", s)),
        }
    }
}

/// Backing resource of the shared region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub path: PathBuf,
    pub offset: u64,
    pub capacity: usize,
}

/// Host/guest session parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub mode: TransferMode,
    /// Request/response rounds per connection; `None` runs until the peer
    /// closes.
    pub exchanges: Option<u32>,
    /// Guest pause between rounds.
    pub interval_ms: u64,
    /// Host reply payload.
    pub response: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: TransferMode::Region,
            exchanges: Some(4),
            interval_ms: 1000,
            response: DEFAULT_RESPONSE.to_string(),
        }
    }
}

/// Complete transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub region: RegionConfig,
    pub control: ControlEndpoint,
    /// Chunk size for chunked transfers; defaults to the region capacity.
    pub chunk_size: Option<usize>,
    pub acknowledge_chunks: bool,
    /// Largest message a chunked transfer may carry.
    pub max_message_size: usize,
    pub turn_policy: TurnPolicy,
    pub inline_buffer_size: usize,
    pub session: SessionConfig,
}

impl TransportConfig {
    /// Built-in defaults for `role`.
    pub fn defaults_for(role: Role) -> Self {
        Self {
            region: RegionConfig {
                path: role.default_region_path(),
                offset: 0,
                capacity: DEFAULT_CAPACITY,
            },
            control: role.default_control(),
            chunk_size: None,
            acknowledge_chunks: true,
            max_message_size: DEFAULT_MAX_MESSAGE,
            turn_policy: TurnPolicy::Strict,
            inline_buffer_size: DEFAULT_BUFFER_SIZE,
            session: SessionConfig::default(),
        }
    }

    /// Resolve the configuration for `role` from file, defaults, and the
    /// process environment, then validate it.
    pub fn load(role: Role) -> Result<Self, ConfigError> {
        let mut config = match config_file_path() {
            Some(path) => {
                tracing::info!("Using config file: {}", path.display());
                Self::from_file(&path, role)?
            }
            None => {
                tracing::info!("No config file found; using {} defaults", role);
                Self::defaults_for(role)
            }
        };

        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON file layered over the defaults for `role`.
    pub fn from_file(path: &Path, role: Role) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text, role).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse JSON text layered over the defaults for `role`.
    pub fn from_json_str(text: &str, role: Role) -> Result<Self, serde_json::Error> {
        let overlay: serde_json::Value = serde_json::from_str(text)?;
        let mut merged = serde_json::to_value(Self::defaults_for(role))?;
        merge_json(&mut merged, overlay);
        serde_json::from_value(merged)
    }

    /// Apply `KHALA_*` overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("KHALA_REGION_PATH") {
            self.region.path = PathBuf::from(path);
        }
        if let Some(value) = lookup("KHALA_REGION_OFFSET") {
            self.region.offset = parse_env("KHALA_REGION_OFFSET", value)?;
        }
        if let Some(value) = lookup("KHALA_REGION_SIZE") {
            self.region.capacity = parse_env("KHALA_REGION_SIZE", value)?;
        }
        if let Some(value) = lookup("KHALA_CHUNK_SIZE") {
            self.chunk_size = Some(parse_env("KHALA_CHUNK_SIZE", value)?);
        }
        if let Some(value) = lookup("KHALA_MAX_MESSAGE") {
            self.max_message_size = parse_env("KHALA_MAX_MESSAGE", value)?;
        }
        if let Some(value) = lookup("KHALA_CONTROL") {
            self.control = parse_env("KHALA_CONTROL", value)?;
        }
        if let Some(value) = lookup("KHALA_MODE") {
            self.session.mode = parse_env("KHALA_MODE", value)?;
        }
        Ok(())
    }

    /// Check the values are usable together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let capacity = self.region.capacity;
        if capacity == 0 {
            return Err(ConfigError::Invalid(
                "region capacity must be greater than 0".to_string(),
            ));
        }
        if u32::try_from(capacity).is_err() {
            return Err(ConfigError::Invalid(format!(
                "region capacity {} does not fit in a 4-byte frame",
                capacity
            )));
        }

        let chunk_size = self.effective_chunk_size();
        if chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "chunk size must be greater than 0".to_string(),
            ));
        }
        if chunk_size > capacity {
            return Err(ConfigError::Invalid(format!(
                "chunk size {} exceeds region capacity {}",
                chunk_size, capacity
            )));
        }

        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid(
                "max message size must be greater than 0".to_string(),
            ));
        }

        if self.inline_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "inline buffer size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Configured chunk size, or the region capacity when unset.
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.unwrap_or(self.region.capacity)
    }

    /// Chunker matching this configuration.
    pub fn chunker(&self) -> Result<Chunker, ConfigError> {
        let chunk_size = NonZeroUsize::new(self.effective_chunk_size())
            .ok_or_else(|| ConfigError::Invalid("chunk size must be greater than 0".to_string()))?;
        Ok(Chunker::new(chunk_size, self.acknowledge_chunks)
            .with_max_message(self.max_message_size))
    }

    /// Piece size for inline transfers.
    pub fn inline_buffer_size(&self) -> Result<NonZeroUsize, ConfigError> {
        NonZeroUsize::new(self.inline_buffer_size).ok_or_else(|| {
            ConfigError::Invalid("inline buffer size must be greater than 0".to_string())
        })
    }
}

/// Default configuration file location.
///
/// Returns `None` when the platform has no configuration directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("khala").join("config.json"))
}

fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("KHALA_CONFIG") {
        return Some(PathBuf::from(path));
    }
    default_config_path().filter(|path| path.exists())
}

fn parse_env<T: FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}

/// Recursively overlay `overlay` onto `base`; objects merge key by key,
/// anything else replaces.
fn merge_json(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_role_defaults() {
        let host = TransportConfig::defaults_for(Role::Host);
        assert_eq!(host.region.path, PathBuf::from("/tmp/firecracker-shmem"));
        assert_eq!(host.control.to_string(), "tcp:0.0.0.0:9000");
        assert_eq!(host.region.capacity, 16 * 1024 * 1024);
        assert_eq!(host.effective_chunk_size(), host.region.capacity);

        let guest = TransportConfig::defaults_for(Role::Guest);
        assert_eq!(guest.region.path, PathBuf::from("/dev/khala-shmem"));
        assert_eq!(guest.control.to_string(), "tcp:10.0.1.2:9000");
        assert_eq!(guest.session.exchanges, Some(4));
        assert_eq!(guest.session.response, "Response From Host");

        host.validate().unwrap();
        guest.validate().unwrap();
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("HOST".parse::<Role>().unwrap(), Role::Host);
        assert_eq!("guest".parse::<Role>().unwrap(), Role::Guest);
        assert!("server".parse::<Role>().is_err());
    }

    #[test]
    fn test_partial_json_layers_over_defaults() {
        let json = r#"{
            "region": { "capacity": 4096 },
            "control": "vsock:any:9000",
            "session": { "mode": "chunked", "exchanges": null }
        }"#;

        let config = TransportConfig::from_json_str(json, Role::Host).unwrap();
        assert_eq!(config.region.capacity, 4096);
        assert_eq!(config.region.path, PathBuf::from("/tmp/firecracker-shmem"));
        assert_eq!(
            config.control,
            ControlEndpoint::Vsock {
                cid: crate::transport::VMADDR_CID_ANY,
                port: 9000
            }
        );
        assert_eq!(config.session.mode, TransferMode::Chunked);
        assert_eq!(config.session.exchanges, None);
        assert_eq!(config.session.interval_ms, 1000);
        assert_eq!(config.turn_policy, TurnPolicy::Strict);
    }

    #[test]
    fn test_json_rejects_bad_endpoint() {
        let json = r#"{ "control": "carrier-pigeon" }"#;
        assert!(TransportConfig::from_json_str(json, Role::Guest).is_err());
    }

    #[test]
    fn test_from_file_errors_name_the_path() {
        let missing = Path::new("/nonexistent/khala/config.json");
        let err = TransportConfig::from_file(missing, Role::Host).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("/nonexistent/khala/config.json"));

        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "{ not json").unwrap();
        let err = TransportConfig::from_file(file.path(), Role::Host).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = TransportConfig::defaults_for(Role::Guest);
        config
            .apply_overrides(lookup_from(&[
                ("KHALA_REGION_PATH", "/dev/pmem0"),
                ("KHALA_REGION_OFFSET", "4096"),
                ("KHALA_REGION_SIZE", "65536"),
                ("KHALA_CHUNK_SIZE", "1024"),
                ("KHALA_MAX_MESSAGE", "1048576"),
                ("KHALA_CONTROL", "vsock:2:9000"),
                ("KHALA_MODE", "inline"),
            ]))
            .unwrap();

        assert_eq!(config.region.path, PathBuf::from("/dev/pmem0"));
        assert_eq!(config.region.offset, 4096);
        assert_eq!(config.region.capacity, 65536);
        assert_eq!(config.effective_chunk_size(), 1024);
        assert_eq!(config.max_message_size, 1024 * 1024);
        assert_eq!(config.control, ControlEndpoint::Vsock { cid: 2, port: 9000 });
        assert_eq!(config.session.mode, TransferMode::Inline);
        config.validate().unwrap();
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = TransportConfig::defaults_for(Role::Host);
        let err = config
            .apply_overrides(lookup_from(&[("KHALA_REGION_SIZE", "sixteen megs")]))
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Invalid value for KHALA_REGION_SIZE: sixteen megs"
        );
    }

    #[test]
    fn test_validate_rejects_inconsistent_values() {
        let mut config = TransportConfig::defaults_for(Role::Host);
        config.chunk_size = Some(config.region.capacity + 1);
        assert!(config.validate().is_err());

        let mut config = TransportConfig::defaults_for(Role::Host);
        config.chunk_size = Some(0);
        assert!(config.validate().is_err());
        assert!(config.chunker().is_err());

        let mut config = TransportConfig::defaults_for(Role::Host);
        config.region.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = TransportConfig::defaults_for(Role::Host);
        config.inline_buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = TransportConfig::defaults_for(Role::Host);
        config.max_message_size = 0;
        assert!(config.validate().is_err());

        #[cfg(target_pointer_width = "64")]
        {
            let mut config = TransportConfig::defaults_for(Role::Host);
            config.region.capacity = u32::MAX as usize + 1;
            config.chunk_size = Some(1024);
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_chunker_from_config() {
        let mut config = TransportConfig::defaults_for(Role::Host);
        config.chunk_size = Some(4096);
        config.acknowledge_chunks = false;
        config.max_message_size = 8192;

        let chunker = config.chunker().unwrap();
        assert_eq!(chunker.chunk_size(), 4096);
        assert!(!chunker.acknowledges());
        assert_eq!(chunker.max_message(), 8192);
        assert_eq!(
            TransportConfig::defaults_for(Role::Host).chunker().unwrap().max_message(),
            DEFAULT_MAX_MESSAGE
        );
    }

    #[test]
    fn test_default_config_path_shape() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("khala/config.json"));
        }
    }
}
