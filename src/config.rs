//! Configuration management.
//!
//! [`Settings`] holds resolved runtime values. [`Config`] is the on-disk
//! config file, discovered through `prefer` or given with `--config`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checkpoint::{CheckpointBackendKind, CheckpointResult, CheckpointStore};
use crate::llm::LlmConfig;
use crate::models::PartitionKey;
use crate::ocr::TextExtractor;
use crate::rate_limit::{PacerConfig, RateLimitDetector, RetryPolicy};
use crate::scrapers::{ArchiveClientConfig, CursorConfig, PartitionErrorPolicy, DEFAULT_SEARCH_TEMPLATE};
use crate::services::CorrectionConfig;
use crate::storage::{ArtifactStore, StorageResult};

/// Checkpoint subdirectory under the data directory.
const STATE_SUBDIR: &str = "state";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {format} config {path}: {reason}")]
    Parse {
        path: PathBuf,
        format: &'static str,
        reason: String,
    },
}

/// Application settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base data directory; artifacts live in per-kind subdirectories.
    pub data_dir: PathBuf,
    /// Checkpoint directory (file backend) or database location (sqlite).
    pub state_dir: PathBuf,
    pub checkpoint_backend: CheckpointBackendKind,
    /// User agent override for HTTP requests.
    pub user_agent: Option<String>,
    /// Request timeout in seconds.
    pub request_timeout: u64,
    /// Delay between requests to the same host in milliseconds.
    pub request_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        // ~/Documents/readingroom, falling back to home, then CWD
        let data_dir = dirs::document_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("readingroom");

        Self {
            state_dir: data_dir.join(STATE_SUBDIR),
            data_dir,
            checkpoint_backend: CheckpointBackendKind::default(),
            user_agent: None,
            request_timeout: 60,
            request_delay_ms: 1000,
        }
    }
}

impl Settings {
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            state_dir: data_dir.join(STATE_SUBDIR),
            data_dir,
            ..Default::default()
        }
    }

    fn set_data_dir(&mut self, data_dir: PathBuf) {
        self.state_dir = data_dir.join(STATE_SUBDIR);
        self.data_dir = data_dir;
    }

    /// Ensure the data, state and artifact directories exist.
    pub fn ensure_directories(&self) -> StorageResult<()> {
        self.artifact_store().ensure_dirs()?;
        std::fs::create_dir_all(&self.state_dir).map_err(|source| crate::storage::StorageError::Io {
            path: self.state_dir.clone(),
            source,
        })
    }

    pub fn artifact_store(&self) -> ArtifactStore {
        ArtifactStore::new(&self.data_dir)
    }

    pub fn checkpoint_store(&self) -> CheckpointResult<CheckpointStore> {
        CheckpointStore::open(self.checkpoint_backend, &self.state_dir)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

/// `[acquisition]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub first_partition: i32,
    /// Final year to traverse; unset keeps following the present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_partition: Option<i32>,
    pub on_partition_error: PartitionErrorPolicy,
    pub max_unavailable_pages: u32,
    /// Pages to fetch per run; unset runs until done or idle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,
    pub search_template: String,
    pub results_marker: String,
    pub link_selector: String,
    pub link_filter: String,
    pub unavailable_marker: String,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        let client = ArchiveClientConfig::default();
        Self {
            first_partition: 2012,
            last_partition: None,
            on_partition_error: PartitionErrorPolicy::default(),
            max_unavailable_pages: 3,
            max_pages: None,
            search_template: DEFAULT_SEARCH_TEMPLATE.to_string(),
            results_marker: client.results_marker,
            link_selector: client.link_selector,
            link_filter: client.link_filter,
            unavailable_marker: client.unavailable_marker,
        }
    }
}

impl AcquisitionConfig {
    pub fn cursor_config(&self) -> CursorConfig {
        CursorConfig {
            first_partition: PartitionKey(self.first_partition),
            last_partition: self.last_partition.map(PartitionKey),
            on_partition_error: self.on_partition_error,
            max_unavailable_pages: self.max_unavailable_pages,
        }
    }

    pub fn client_config(&self, settings: &Settings) -> ArchiveClientConfig {
        ArchiveClientConfig {
            search_template: self.search_template.clone(),
            results_marker: self.results_marker.clone(),
            link_selector: self.link_selector.clone(),
            link_filter: self.link_filter.clone(),
            unavailable_marker: self.unavailable_marker.clone(),
            user_agent: settings.user_agent.clone(),
            request_timeout: settings.request_timeout(),
        }
    }

    pub fn pacer_config(&self, settings: &Settings) -> PacerConfig {
        PacerConfig {
            base_delay: Duration::from_millis(settings.request_delay_ms),
            ..PacerConfig::default()
        }
    }
}

/// `[retry]` section. Durations are in milliseconds or seconds as named.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_secs: u64,
    pub rate_limit_cooldown_secs: u64,
    pub max_cooldown_secs: u64,
    pub call_timeout_secs: u64,
    /// Give up on an item after this many rate-limit waits; unset waits forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_rate_limit_waits: Option<u32>,
    /// Extra case-insensitive substrings that mark a failure as throttling.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rate_limit_signatures: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            max_delay_secs: policy.max_delay.as_secs(),
            rate_limit_cooldown_secs: policy.rate_limit_cooldown.as_secs(),
            max_cooldown_secs: policy.max_cooldown.as_secs(),
            call_timeout_secs: policy.call_timeout.as_secs(),
            max_rate_limit_waits: None,
            rate_limit_signatures: Vec::new(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_backoff(
                Duration::from_millis(self.base_delay_ms),
                self.multiplier,
                Duration::from_secs(self.max_delay_secs),
            )
            .with_cooldown(
                Duration::from_secs(self.rate_limit_cooldown_secs),
                Duration::from_secs(self.max_cooldown_secs),
            )
            .with_call_timeout(Duration::from_secs(self.call_timeout_secs))
            .with_max_rate_limit_waits(self.max_rate_limit_waits);
        if !self.rate_limit_signatures.is_empty() {
            let signatures = crate::rate_limit::DEFAULT_RATE_LIMIT_SIGNATURES
                .iter()
                .map(|s| s.to_string())
                .chain(self.rate_limit_signatures.iter().cloned());
            policy = policy.with_detector(RateLimitDetector::with_signatures(signatures));
        }
        policy
    }
}

/// `[ocr]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    /// Tesseract language code.
    pub language: String,
    pub dpi: u32,
    /// Pages with fewer text-layer characters than this are OCR'd.
    pub min_chars_per_page: usize,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            language: "eng".to_string(),
            dpi: 300,
            min_chars_per_page: 100,
        }
    }
}

impl OcrConfig {
    pub fn extractor(&self) -> TextExtractor {
        TextExtractor::new()
            .with_language(&self.language)
            .with_dpi(self.dpi)
            .with_min_chars(self.min_chars_per_page)
    }
}

/// `[runner]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub batch_size: usize,
    /// Pause between items in a stage run.
    pub item_delay_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            item_delay_ms: 0,
        }
    }
}

/// Configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Data directory path.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "target")]
    pub data_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_backend: Option<CheckpointBackendKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Request timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<u64>,
    /// Delay between requests in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_delay_ms: Option<u64>,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub correction: CorrectionConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    /// File this config was loaded from.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Discover a `readingroom` config file in the standard locations.
    pub async fn load() -> Result<Self, ConfigError> {
        match prefer::load("readingroom").await {
            Ok(found) => match found.source_path() {
                Some(path) => Self::load_from_path(path).await,
                None => Ok(Self::default_with_env()),
            },
            Err(_) => {
                tracing::debug!("No config file discovered; using defaults");
                Ok(Self::default_with_env())
            }
        }
    }

    /// Defaults with environment overrides applied.
    pub fn default_with_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration from a file; format follows the extension.
    pub async fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let mut config = Self::parse(path, &contents)?;
        config.source_path = Some(path.to_path_buf());
        config.apply_env_overrides();
        Ok(config)
    }

    fn parse(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");
        let parse_err = |format: &'static str, reason: String| ConfigError::Parse {
            path: path.to_path_buf(),
            format,
            reason,
        };
        match ext {
            "toml" => toml::from_str(contents).map_err(|e| parse_err("TOML", e.to_string())),
            "yaml" | "yml" => serde_yaml::from_str(contents).map_err(|e| parse_err("YAML", e.to_string())),
            _ => serde_json::from_str(contents).map_err(|e| parse_err("JSON", e.to_string())),
        }
    }

    fn apply_env_overrides(&mut self) {
        self.llm = std::mem::take(&mut self.llm).with_env_overrides();
    }

    /// Directory relative paths in this config resolve against.
    pub fn base_dir(&self) -> Option<PathBuf> {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
    }

    /// Expand `~` and resolve relative paths against `base_dir`.
    pub fn resolve_path(&self, path_str: &str, base_dir: &Path) -> PathBuf {
        let expanded = shellexpand::tilde(path_str);
        let path = Path::new(expanded.as_ref());

        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    }

    pub fn apply_to_settings(&self, settings: &mut Settings, base_dir: &Path) {
        if let Some(ref data_dir) = self.data_dir {
            settings.set_data_dir(self.resolve_path(data_dir, base_dir));
        }
        if let Some(backend) = self.checkpoint_backend {
            settings.checkpoint_backend = backend;
        }
        if let Some(ref user_agent) = self.user_agent {
            settings.user_agent = Some(user_agent.clone());
        }
        if let Some(timeout) = self.request_timeout {
            settings.request_timeout = timeout;
        }
        if let Some(delay) = self.request_delay_ms {
            settings.request_delay_ms = delay;
        }
    }
}

/// Options for loading settings.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit config file path (overrides discovery).
    pub config_path: Option<PathBuf>,
    /// Resolve relative paths against CWD instead of the config file directory.
    pub use_cwd: bool,
    /// Data directory override (--target).
    pub data: Option<PathBuf>,
}

fn current_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn absolute(path: &Path) -> PathBuf {
    let expanded = shellexpand::tilde(&path.to_string_lossy()).into_owned();
    let path = PathBuf::from(expanded);
    if path.is_absolute() {
        path
    } else {
        current_dir().join(path)
    }
}

/// Look for `readingroom.{toml,yaml,yml,json}` in a data directory.
fn find_config_in(data_dir: &Path) -> Option<PathBuf> {
    ["toml", "yaml", "yml", "json"]
        .iter()
        .map(|ext| data_dir.join(format!("readingroom.{}", ext)))
        .find(|path| path.is_file())
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

/// Load settings with explicit options.
///
/// Precedence, lowest first: defaults, config file, `READINGROOM_DATA_DIR`,
/// `--target`.
pub async fn load_settings_with_options(options: LoadOptions) -> Result<(Settings, Config), ConfigError> {
    let data_override = options
        .data
        .clone()
        .or_else(|| env_value("READINGROOM_DATA_DIR").map(PathBuf::from))
        .map(|dir| absolute(&dir));

    // Explicit --config, then a config inside the data dir, then discovery
    let config = match options.config_path {
        Some(ref path) => Config::load_from_path(path).await?,
        None => match data_override.as_deref().and_then(find_config_in) {
            Some(path) => {
                tracing::debug!("Found config in data dir: {}", path.display());
                Config::load_from_path(&path).await?
            }
            None => Config::load().await?,
        },
    };

    let base_dir = if options.use_cwd {
        current_dir()
    } else {
        config.base_dir().unwrap_or_else(current_dir)
    };

    let mut settings = Settings::default();
    config.apply_to_settings(&mut settings, &base_dir);

    if let Some(backend) = env_value("READINGROOM_CHECKPOINT_BACKEND") {
        match backend.parse::<CheckpointBackendKind>() {
            Ok(kind) => settings.checkpoint_backend = kind,
            Err(e) => tracing::warn!("Ignoring READINGROOM_CHECKPOINT_BACKEND: {}", e),
        }
    }

    if let Some(data_dir) = data_override {
        settings.set_data_dir(data_dir);
    }

    Ok((settings, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::SeamPolicy;
    use tempfile::tempdir;

    #[test]
    fn test_settings_default_layout() {
        let settings = Settings::with_data_dir(PathBuf::from("/data/rr"));
        assert_eq!(settings.state_dir, PathBuf::from("/data/rr/state"));
        assert_eq!(settings.checkpoint_backend, CheckpointBackendKind::File);
        assert_eq!(
            settings.artifact_store().dir(crate::models::ArtifactKind::Text),
            PathBuf::from("/data/rr/text")
        );
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempdir().unwrap();
        let settings = Settings::with_data_dir(dir.path().join("rr"));
        settings.ensure_directories().unwrap();
        assert!(settings.state_dir.is_dir());
        assert!(dir.path().join("rr/raw").is_dir());
        assert!(dir.path().join("rr/records").is_dir());
    }

    #[test]
    fn test_parse_toml_sections() {
        let toml = r#"
data_dir = "archive"
checkpoint_backend = "sqlite"

[acquisition]
first_partition = 1995
last_partition = 1999
on_partition_error = "skip"

[retry]
max_attempts = 5
max_rate_limit_waits = 4
rate_limit_signatures = ["server overloaded"]

[correction]
max_chunk_chars = 3000
overlap_chars = 200
seam_policy = "longest_match"

[runner]
item_delay_ms = 1000
"#;
        let config = Config::parse(Path::new("readingroom.toml"), toml).unwrap();
        assert_eq!(config.checkpoint_backend, Some(CheckpointBackendKind::Sqlite));

        let cursor = config.acquisition.cursor_config();
        assert_eq!(cursor.first_partition, PartitionKey(1995));
        assert_eq!(cursor.last_partition, Some(PartitionKey(1999)));
        assert_eq!(cursor.on_partition_error, PartitionErrorPolicy::Skip);
        assert_eq!(config.acquisition.max_unavailable_pages, 3);

        let policy = config.retry.policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.max_rate_limit_waits, Some(4));
        assert!(policy.detector.matches_message("Server overloaded, retry"));
        assert!(policy.detector.matches_message("Too Many Requests"));

        assert_eq!(config.correction.overlap_chars, 200);
        assert_eq!(config.correction.seam_policy, SeamPolicy::LongestMatch);
        assert_eq!(config.runner.item_delay_ms, 1000);
        assert_eq!(config.runner.batch_size, 50);
    }

    #[test]
    fn test_parse_yaml_and_json() {
        let yaml = "ocr:\n  language: deu\n  dpi: 200\n";
        let config = Config::parse(Path::new("c.yaml"), yaml).unwrap();
        assert_eq!(config.ocr.language, "deu");
        assert_eq!(config.ocr.min_chars_per_page, 100);

        let json = r#"{"target": "/srv/rr", "llm": {"model": "llama3"}}"#;
        let config = Config::parse(Path::new("c.json"), json).unwrap();
        assert_eq!(config.data_dir.as_deref(), Some("/srv/rr"));
        assert_eq!(config.llm.model, "llama3");

        assert!(matches!(
            Config::parse(Path::new("c.json"), "{not json"),
            Err(ConfigError::Parse { format: "JSON", .. })
        ));
    }

    #[test]
    fn test_relative_data_dir_resolves_against_config_dir() {
        let config = Config {
            data_dir: Some("archive".into()),
            request_timeout: Some(5),
            ..Default::default()
        };
        let mut settings = Settings::default();
        config.apply_to_settings(&mut settings, Path::new("/etc/readingroom"));
        assert_eq!(settings.data_dir, PathBuf::from("/etc/readingroom/archive"));
        assert_eq!(settings.state_dir, PathBuf::from("/etc/readingroom/archive/state"));
        assert_eq!(settings.request_timeout(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_load_explicit_config_with_target_override() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("readingroom.toml");
        std::fs::write(&path, "data_dir = \"from-config\"\n").unwrap();

        let (settings, config) = load_settings_with_options(LoadOptions {
            config_path: Some(path.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(config.source_path.as_deref(), Some(path.as_path()));
        if std::env::var("READINGROOM_DATA_DIR").is_err() {
            assert_eq!(settings.data_dir, dir.path().join("from-config"));
        }

        let (settings, _) = load_settings_with_options(LoadOptions {
            config_path: Some(path),
            data: Some(dir.path().join("cli")),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(settings.data_dir, dir.path().join("cli"));
    }

    #[tokio::test]
    async fn test_config_inside_target_dir_is_found() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("readingroom.yaml"),
            "runner:\n  batch_size: 7\n",
        )
        .unwrap();

        let (settings, config) = load_settings_with_options(LoadOptions {
            data: Some(dir.path().to_path_buf()),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(settings.data_dir, dir.path());
        assert_eq!(config.runner.batch_size, 7);
    }

    #[tokio::test]
    async fn test_missing_explicit_config_is_an_error() {
        let err = Config::load_from_path(Path::new("/nonexistent/readingroom.toml"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
