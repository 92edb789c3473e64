use config::{Config, ConfigError, FileFormat};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub paths: PathsConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub storage: Option<S3Config>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Input and output roots. Either a local directory or an `s3://bucket/prefix` URL.
#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    pub input: String,
    pub output: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourcesConfig {
    #[serde(default = "default_song_data")]
    pub song_data: String,
    #[serde(default = "default_log_data")]
    pub log_data: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3Config {
    pub endpoint: Option<String>,
    #[serde(default = "default_s3_region")]
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub allow_http: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_target_partitions")]
    pub target_partitions: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_schema_infer_max_records")]
    pub schema_infer_max_records: usize,
    #[serde(default)]
    pub user_dedup: UserDedupPolicy,
    /// Absent or zero means exact equality on song length.
    #[serde(default)]
    pub duration_tolerance: Option<f64>,
    #[serde(default)]
    pub write_mode: WriteMode,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UserDedupPolicy {
    /// Every qualifying log row yields a user row.
    #[default]
    None,
    /// Drop rows that are identical in every user column.
    Exact,
    /// One row per user id, taken from the user's most recent event.
    Latest,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    #[default]
    Overwrite,
    Append,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            song_data: default_song_data(),
            log_data: default_log_data(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_partitions: default_target_partitions(),
            batch_size: default_batch_size(),
            schema_infer_max_records: default_schema_infer_max_records(),
            user_dedup: UserDedupPolicy::default(),
            duration_tolerance: None,
            write_mode: WriteMode::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_song_data() -> String {
    "song_data".to_string()
}

fn default_log_data() -> String {
    "log_data".to_string()
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_target_partitions() -> usize {
    4
}

fn default_batch_size() -> usize {
    8192
}

fn default_schema_infer_max_records() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let settings = Self::deserialize_from(builder.build()?)?;
        debug!(
            input = %settings.paths.input,
            output = %settings.paths.output,
            "Loaded settings from {}",
            path
        );
        Ok(settings)
    }

    /// Builds settings from an in-memory TOML document, without environment overrides.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(config::File::from_str(contents, FileFormat::Toml))
            .build()?;
        Self::deserialize_from(config)
    }

    fn deserialize_from(config: Config) -> Result<Self, ConfigError> {
        let settings: Settings = config.try_deserialize()?;
        if let Some(tolerance) = settings.pipeline.duration_tolerance {
            if !(tolerance >= 0.0) {
                return Err(ConfigError::Message(format!(
                    "pipeline.duration_tolerance must be a non-negative number, got {}",
                    tolerance
                )));
            }
        }
        if settings.pipeline.target_partitions == 0 {
            return Err(ConfigError::Message(
                "pipeline.target_partitions must be at least 1".to_string(),
            ));
        }
        Ok(settings)
    }
}
