//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared configuration and logging for the gateway runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

/// Number of bytes in the sensor readings block (sonar ft/in, microwave, IR ft/in).
pub const READINGS_LEN: usize = 5;

fn default_image_header_len() -> usize {
    7
}

fn default_readings_offset() -> usize {
    2
}

fn default_failure_count_offset() -> Option<usize> {
    Some(1)
}

fn default_access_keys_offset() -> usize {
    1
}

fn default_settings_offset() -> usize {
    2
}

fn default_transfer_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_capture_retries() -> u32 {
    3
}

fn default_image_output_dir() -> PathBuf {
    PathBuf::from("target/images")
}

fn default_command_delimiter() -> String {
    ";".to_owned()
}

fn default_link_buffer() -> usize {
    64
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9899))
}

/// Primary configuration object for the gateway daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub protocol: ProtocolLayout,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub mail: MailConfig,
    #[serde(default)]
    pub radio: RadioConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where a [`GatewayConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedGatewayConfig {
    pub config: GatewayConfig,
    pub source: PathBuf,
}

impl GatewayConfig {
    pub const ENV_CONFIG_PATH: &str = "UGATE_CONFIG";

    /// Load configuration from disk, respecting the `UGATE_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedGatewayConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedGatewayConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedGatewayConfig {
                    config,
                    source: path.to_path_buf(),
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<GatewayConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.protocol.validate()?;
        self.image.validate()?;
        self.mail.validate()?;
        self.radio.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for GatewayConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: GatewayConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Positional offsets of the remote node's data frame.
///
/// Protocol revisions differ mainly in where these fields sit, so every
/// decoder reads its offsets from here rather than hard-coding them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolLayout {
    /// Number of leading bytes in an image chunk before image data begins.
    #[serde(default = "default_image_header_len")]
    pub image_header_len: usize,
    /// Index of the first sensor readings byte.
    #[serde(default = "default_readings_offset")]
    pub readings_offset: usize,
    /// Index of the failure-count byte, absent on older node firmware.
    #[serde(default = "default_failure_count_offset")]
    pub failure_count_offset: Option<usize>,
    /// Index of the first of three access keys in an access code change frame.
    #[serde(default = "default_access_keys_offset")]
    pub access_keys_offset: usize,
    /// Index of the first settings field in a settings snapshot frame.
    #[serde(default = "default_settings_offset")]
    pub settings_offset: usize,
}

impl Default for ProtocolLayout {
    fn default() -> Self {
        Self {
            image_header_len: default_image_header_len(),
            readings_offset: default_readings_offset(),
            failure_count_offset: default_failure_count_offset(),
            access_keys_offset: default_access_keys_offset(),
            settings_offset: default_settings_offset(),
        }
    }
}

impl ProtocolLayout {
    /// Exclusive end of the sensor readings block.
    pub fn readings_end(&self) -> usize {
        self.readings_offset + READINGS_LEN
    }

    pub fn validate(&self) -> Result<()> {
        if self.image_header_len < self.readings_end() {
            return Err(anyhow!(
                "protocol image_header_len {} overlaps the readings block ending at {}",
                self.image_header_len,
                self.readings_end()
            ));
        }
        if self.readings_offset == 0 || self.settings_offset == 0 || self.access_keys_offset == 0
        {
            return Err(anyhow!("protocol offsets must not overlap the command byte"));
        }
        if self.failure_count_offset == Some(0) {
            return Err(anyhow!(
                "protocol failure_count_offset must not overlap the command byte"
            ));
        }
        Ok(())
    }
}

/// Rule deciding whether the most recent chunk completes an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", tag = "rule")]
pub enum EofRule {
    /// The concatenated stream ends with the JPEG trailer `FF D9`.
    #[default]
    JpegTrailer,
    /// The chunk carries fewer image bytes than a full chunk.
    ShortChunk { nominal_chunk_len: usize },
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_transfer_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub transfer_timeout: Duration,
    #[serde(default = "default_capture_retries")]
    pub capture_retries: u32,
    #[serde(default)]
    pub eof: EofRule,
    #[serde(default = "default_image_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            transfer_timeout: default_transfer_timeout(),
            capture_retries: default_capture_retries(),
            eof: EofRule::default(),
            output_dir: default_image_output_dir(),
        }
    }
}

impl ImageConfig {
    pub fn validate(&self) -> Result<()> {
        if self.transfer_timeout.is_zero() {
            return Err(anyhow!("image transfer_timeout must be greater than zero"));
        }
        if let EofRule::ShortChunk {
            nominal_chunk_len: 0,
        } = self.eof
        {
            return Err(anyhow!(
                "image eof rule short-chunk requires a non-zero nominal_chunk_len"
            ));
        }
        Ok(())
    }
}

/// How the subject line of an inbound command mail is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubjectRole {
    /// Subject tokens are commands, just like the body.
    #[default]
    Commands,
    /// Subject tokens name the node addresses the body's commands target.
    Destinations,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    #[serde(default = "default_command_delimiter")]
    pub command_delimiter: String,
    #[serde(default)]
    pub allow_list: Vec<String>,
    #[serde(default)]
    pub subject_role: SubjectRole,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            command_delimiter: default_command_delimiter(),
            allow_list: Vec::new(),
            subject_role: SubjectRole::default(),
        }
    }
}

impl MailConfig {
    pub fn validate(&self) -> Result<()> {
        if self.command_delimiter.is_empty() {
            return Err(anyhow!("mail command_delimiter must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioConfig {
    /// Known remote node addresses as four hex digits, e.g. `3333`.
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default = "default_link_buffer")]
    pub link_buffer: usize,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            link_buffer: default_link_buffer(),
        }
    }
}

impl RadioConfig {
    pub fn validate(&self) -> Result<()> {
        for node in &self.nodes {
            if node.len() != 4 || u16::from_str_radix(node, 16).is_err() {
                return Err(anyhow!(
                    "radio node '{}' is not a 16-bit hex address",
                    node
                ));
            }
        }
        if self.link_buffer == 0 {
            return Err(anyhow!("radio link_buffer must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// Log file name stem; the service name when unset.
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// `EnvFilter` directive used when neither `UGATE_LOG` nor `RUST_LOG` is set.
    #[serde(default)]
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            filter: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}
