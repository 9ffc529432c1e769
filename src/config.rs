//! Configuration file management for fortiprobe.
//!
//! Settings are merged from three layers:
//!
//! 1. Default values (lowest priority)
//! 2. Configuration file (specified with --config)
//! 3. Command-line arguments (highest priority)
//!
//! # Example Configuration File
//!
//! ```toml
//! port = 541
//! timeout_secs = 3
//! key_bits = 2048
//! output = "text"
//! ca_file = "/etc/fortiprobe/fortinet-ca.pem"
//! identity_dir = "/run/fortiprobe"
//!
//! [tls]
//! cipher_list = "ALL:@SECLEVEL=0"
//! security_level = 0
//! ```
//!
//! Peer certificate verification is not configurable.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use thiserror::Error;

use crate::handshake::{CipherPolicy, DEFAULT_PORT, LEGACY_CIPHER_LIST};
use crate::identity::{DEFAULT_KEY_BITS, MIN_KEY_BITS};
use crate::ProbeSettings;

/// Output format of the command line tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum OutputFormat {
    Text,
    Json,
}

/// Main configuration structure.
///
/// All fields are optional to support partial configuration and merging.
#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    /// TCP port of the appliance management service
    pub port: Option<u16>,
    /// Budget for connect plus handshake, in seconds
    pub timeout_secs: Option<u64>,
    /// RSA key size of the ephemeral server identity
    pub key_bits: Option<u32>,
    /// Output format: text, json
    pub output: Option<String>,
    /// PEM bundle replacing the embedded Fortinet CA certificates
    pub ca_file: Option<PathBuf>,
    /// Where the ephemeral identity directory is created
    pub identity_dir: Option<PathBuf>,
    /// Cipher negotiation settings
    pub tls: Option<TlsConfig>,
}

/// Cipher floor of the local TLS server.
#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
pub struct TlsConfig {
    /// OpenSSL cipher list
    pub cipher_list: Option<String>,
    /// OpenSSL security level (0-5)
    pub security_level: Option<u32>,
}

impl Config {
    /// Loads configuration from a TOML file.
    ///
    /// ```no_run
    /// # use fortiprobe::config::Config;
    /// let config = Config::from_file("fortiprobe.toml")?;
    /// # Ok::<(), fortiprobe::config::ConfigError>(())
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        Ok(config)
    }

    /// Configuration with every default filled in.
    ///
    /// - `port`: 541
    /// - `timeout_secs`: 3
    /// - `key_bits`: 2048
    /// - `output`: "text"
    /// - `ca_file`: None (embedded Fortinet anchors)
    /// - `identity_dir`: None (system temporary directory)
    /// - `tls.cipher_list`: "ALL:@SECLEVEL=0"
    /// - `tls.security_level`: 0
    pub fn defaults() -> Self {
        Config {
            port: Some(DEFAULT_PORT),
            timeout_secs: Some(3),
            key_bits: Some(DEFAULT_KEY_BITS),
            output: Some(OutputFormat::Text.to_string()),
            ca_file: None,
            identity_dir: None,
            tls: Some(TlsConfig {
                cipher_list: Some(LEGACY_CIPHER_LIST.to_string()),
                security_level: Some(0),
            }),
        }
    }

    /// Merges this configuration with another, prioritizing the other's values.
    ///
    /// # Arguments
    ///
    /// * `other` - Higher priority layer; its `Some` values win
    ///
    /// # Returns
    ///
    /// The combined configuration. `tls` is merged field by field.
    ///
    /// # Example
    ///
    /// ```
    /// # use fortiprobe::config::Config;
    /// let file = Config { port: Some(10541), ..Config::default() };
    /// let cli = Config { timeout_secs: Some(5), ..Config::default() };
    /// let merged = file.merge_with(cli);
    /// assert_eq!(merged.port, Some(10541));
    /// assert_eq!(merged.timeout_secs, Some(5));
    /// ```
    pub fn merge_with(mut self, other: Config) -> Self {
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.timeout_secs.is_some() {
            self.timeout_secs = other.timeout_secs;
        }
        if other.key_bits.is_some() {
            self.key_bits = other.key_bits;
        }
        if other.output.is_some() {
            self.output = other.output;
        }
        if other.ca_file.is_some() {
            self.ca_file = other.ca_file;
        }
        if other.identity_dir.is_some() {
            self.identity_dir = other.identity_dir;
        }
        if let Some(other_tls) = other.tls {
            if let Some(ref mut self_tls) = self.tls {
                if other_tls.cipher_list.is_some() {
                    self_tls.cipher_list = other_tls.cipher_list;
                }
                if other_tls.security_level.is_some() {
                    self_tls.security_level = other_tls.security_level;
                }
            } else {
                self.tls = Some(other_tls);
            }
        }
        self
    }

    /// Creates a Config from command-line arguments for merging.
    ///
    /// Only provided arguments (Some values) override other layers.
    ///
    /// # Arguments
    ///
    /// * `port` - `--port`
    /// * `timeout_secs` - `--timeout`
    /// * `key_bits` - `--key-bits`
    /// * `output` - `--output`, validated later by [`Config::resolve`]
    /// * `ca_file` - `--ca-file`
    /// * `identity_dir` - `--identity-dir`
    ///
    /// # Returns
    ///
    /// A partial configuration without a `[tls]` section.
    ///
    /// # Example
    ///
    /// ```
    /// # use fortiprobe::config::Config;
    /// let cli = Config::from_cli_args(Some(10541), None, None, Some("json".into()), None, None);
    /// assert_eq!(cli.port, Some(10541));
    /// assert!(cli.tls.is_none());
    /// ```
    pub fn from_cli_args(
        port: Option<u16>,
        timeout_secs: Option<u64>,
        key_bits: Option<u32>,
        output: Option<String>,
        ca_file: Option<PathBuf>,
        identity_dir: Option<PathBuf>,
    ) -> Self {
        Config {
            port,
            timeout_secs,
            key_bits,
            output,
            ca_file,
            identity_dir,
            tls: None,
        }
    }

    /// Validates the merged configuration and turns it into runtime settings.
    ///
    /// Missing values fall back to [`Config::defaults`].
    ///
    /// # Returns
    ///
    /// The probe settings and the output format of the command line tool, or
    /// [`ConfigError::Validation`] when a value is out of range: port 0, a
    /// zero timeout, a key under 512 bits, a security level above 5 or an
    /// unknown output format.
    ///
    /// # Example
    ///
    /// ```
    /// # use fortiprobe::config::{Config, OutputFormat};
    /// let (settings, output) = Config::default().resolve()?;
    /// assert_eq!(settings.port, 541);
    /// assert_eq!(output, OutputFormat::Text);
    /// # Ok::<(), fortiprobe::config::ConfigError>(())
    /// ```
    pub fn resolve(self) -> Result<(ProbeSettings, OutputFormat), ConfigError> {
        let config = Config::defaults().merge_with(self);
        let tls = config.tls.unwrap_or_default();

        let port = config.port.unwrap_or(DEFAULT_PORT);
        if port == 0 {
            return Err(ConfigError::Validation(
                "port must be between 1 and 65535".to_string(),
            ));
        }

        let timeout_secs = config.timeout_secs.unwrap_or(3);
        if timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "timeout_secs must be positive".to_string(),
            ));
        }

        let key_bits = config.key_bits.unwrap_or(DEFAULT_KEY_BITS);
        if key_bits < MIN_KEY_BITS {
            return Err(ConfigError::Validation(format!(
                "key_bits must be at least {}",
                MIN_KEY_BITS
            )));
        }

        let security_level = tls.security_level.unwrap_or(0);
        if security_level > 5 {
            return Err(ConfigError::Validation(
                "tls.security_level must be between 0 and 5".to_string(),
            ));
        }

        let output = match config.output {
            Some(value) => OutputFormat::from_str(&value).map_err(|_| {
                ConfigError::Validation(format!("unknown output format '{}'", value))
            })?,
            None => OutputFormat::Text,
        };

        let settings = ProbeSettings {
            port,
            timeout: Duration::from_secs(timeout_secs),
            key_bits,
            ciphers: CipherPolicy {
                cipher_list: tls
                    .cipher_list
                    .unwrap_or_else(|| LEGACY_CIPHER_LIST.to_string()),
                security_level,
            },
            ca_file: config.ca_file,
            identity_dir: config.identity_dir,
        };
        Ok((settings, output))
    }

    /// Generates an example configuration file in TOML format.
    pub fn example_toml() -> String {
        let example = Config {
            ca_file: Some(PathBuf::from("/etc/fortiprobe/fortinet-ca.pem")),
            ..Config::defaults()
        };

        toml::to_string_pretty(&example)
            .unwrap_or_else(|_| "# Error generating example".to_string())
    }
}

/// Errors that can occur during configuration loading and parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error (file not found, permission denied, etc.)
    #[error("IO Error: {0}")]
    Io(String),
    /// TOML parsing error (invalid syntax, type mismatch, etc.)
    #[error("Parse Error: {0}")]
    Parse(String),
    /// Validation error (out of range or unknown values)
    #[error("Validation Error: {0}")]
    Validation(String),
}
