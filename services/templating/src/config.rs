use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the templating service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Staging area configuration
    #[serde(default)]
    pub staging: StagingConfig,
    /// Rendering configuration
    #[serde(default)]
    pub rendering: RenderingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket holding template archives and context blobs
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Upper bound for a context request body
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Upper bound for a multipart template upload
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

/// Staging area configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StagingConfig {
    /// Shared root under which per-request directories are created
    #[serde(default = "default_staging_root")]
    pub root_dir: PathBuf,
    /// Name of the context file handed to the rendering engine
    #[serde(default = "default_context_file_name")]
    pub context_file_name: String,
    /// Size of each chunk of the streamed zip
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,
    /// Number of chunks buffered between the encoder and the client
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Where the render context comes from for this deployment
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextSource {
    /// JSON body of the processing request
    #[default]
    RequestBody,
    /// Context blob uploaded alongside the template archive
    Stored,
}

/// Rendering configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RenderingConfig {
    /// Upper bound on a single render, in seconds
    #[serde(default = "default_render_timeout_secs")]
    pub timeout_secs: u64,
    /// Input mode for the render context
    #[serde(default)]
    pub context_source: ContextSource,
    /// Directory name the bundled engine renders into
    #[serde(default = "default_output_dir_name")]
    pub output_dir_name: String,
}

// Default value functions
fn default_service_name() -> String {
    "templating-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_max_body_bytes() -> usize {
    2 * 1024 * 1024 // 2MB
}

fn default_max_upload_bytes() -> usize {
    50 * 1024 * 1024 // 50MB
}

fn default_staging_root() -> PathBuf {
    std::env::temp_dir().join("template_processing")
}

fn default_context_file_name() -> String {
    "templater.json".to_string()
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_channel_capacity() -> usize {
    8
}

fn default_render_timeout_secs() -> u64 {
    120
}

fn default_output_dir_name() -> String {
    "rendered".to_string()
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "templating-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(
                config::File::with_name("config/templating")
                    .required(false)
            )
            .add_source(
                config::File::with_name("/etc/codegen/templating")
                    .required(false)
            )
            // Override with environment variables
            // TEMPLATING__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("TEMPLATING")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that deserialize fine but cannot be served
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.s3.bucket.trim().is_empty() {
            return Err(ConfigError::MissingRequired("s3.bucket".to_string()));
        }

        if self.database.url.trim().is_empty() {
            return Err(ConfigError::MissingRequired("database.url".to_string()));
        }

        if self.staging.chunk_size_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "staging.chunk_size_bytes".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.staging.channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "staging.channel_capacity".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.rendering.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "rendering.timeout_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    /// Get render timeout as Duration
    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.rendering.timeout_secs)
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            max_body_bytes: default_max_body_bytes(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            root_dir: default_staging_root(),
            context_file_name: default_context_file_name(),
            chunk_size_bytes: default_chunk_size(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for RenderingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_render_timeout_secs(),
            context_source: ContextSource::default(),
            output_dir_name: default_output_dir_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            service: ServiceConfig::default(),
            s3: S3Config {
                bucket: "codegen".to_string(),
                region: default_region(),
                endpoint_url: Some("http://localhost:9000".to_string()),
                force_path_style: true,
            },
            database: DatabaseConfig {
                url: "postgres://localhost/codegen".to_string(),
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout_secs(),
                idle_timeout_secs: default_idle_timeout_secs(),
            },
            api: ApiConfig::default(),
            staging: StagingConfig::default(),
            rendering: RenderingConfig::default(),
        }
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_context_file_name(), "templater.json");
        assert_eq!(default_chunk_size(), 65536);
        assert_eq!(default_render_timeout_secs(), 120);
        assert_eq!(RenderingConfig::default().context_source, ContextSource::RequestBody);
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_bucket() {
        let mut config = test_config();
        config.s3.bucket = "  ".to_string();

        match config.validate() {
            Err(ConfigError::MissingRequired(key)) => assert_eq!(key, "s3.bucket"),
            other => panic!("Expected MissingRequired, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = test_config();
        config.rendering.timeout_secs = 0;

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_database_durations() {
        let config = test_config();

        assert_eq!(
            config.database.connect_timeout(),
            Duration::from_secs(default_connect_timeout_secs())
        );
        assert_eq!(
            config.database.idle_timeout(),
            Duration::from_secs(default_idle_timeout_secs())
        );
        assert_eq!(config.render_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_context_source_deserializes_snake_case() {
        let source: ContextSource = serde_json::from_str("\"stored\"").unwrap();
        assert_eq!(source, ContextSource::Stored);
    }
}
