use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File pattern configuration for a source. Patterns are globs with `**`
/// support; `**/X` also matches `X` at the source root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilePatterns {
    #[serde(default = "default_include")]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

fn default_include() -> Vec<String> {
    vec!["**/*".to_string()]
}

impl Default for FilePatterns {
    fn default() -> Self {
        Self {
            include: default_include(),
            exclude: Vec::new(),
        }
    }
}

impl FilePatterns {
    /// Whitelist of common text/code files plus the standard build-artifact
    /// blacklist. Used for managed directories and discovered repositories.
    pub fn standard() -> Self {
        Self {
            include: [
                "**/*.md", "**/*.txt", "**/*.py", "**/*.js", "**/*.jsx", "**/*.ts", "**/*.tsx",
                "**/*.rs", "**/*.go", "**/*.java", "**/*.rb", "**/*.c", "**/*.cpp", "**/*.h",
                "**/*.dart", "**/*.json", "**/*.yaml", "**/*.yml", "**/*.toml", "**/*.xml",
                "**/*.html", "**/*.css", "**/*.sh", "**/*.sql",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            exclude: [
                "**/node_modules/**",
                "**/vendor/**",
                "**/.git/**",
                "**/venv/**",
                "**/.venv/**",
                "**/__pycache__/**",
                "**/.pytest_cache/**",
                "**/.mypy_cache/**",
                "**/dist/**",
                "**/build/**",
                "**/target/**",
                "**/.next/**",
                "**/.nuxt/**",
                "**/.dart_tool/**",
                "**/.gradle/**",
                "**/Pods/**",
                "**/coverage/**",
                "**/*.lock",
                "**/.*",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl Priority {
    /// Multiplier applied to fused scores.
    pub fn weight(&self) -> f32 {
        match self {
            Priority::High => 1.5,
            Priority::Medium => 1.0,
            Priority::Low => 0.7,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "high" => Some(Priority::High),
            "medium" => Some(Priority::Medium),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }
}

/// Configuration for a single repository source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub file_patterns: FilePatterns,
}

fn default_true() -> bool {
    true
}

impl RepositoryConfig {
    /// Enabled repositories must point at an existing directory.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("repository name must not be empty".into());
        }
        if self.enabled {
            if !self.path.exists() {
                return Err(format!(
                    "repository path does not exist: {}",
                    self.path.display()
                ));
            }
            if !self.path.is_dir() {
                return Err(format!(
                    "repository path is not a directory: {}",
                    self.path.display()
                ));
            }
        }
        for pattern in self
            .file_patterns
            .include
            .iter()
            .chain(self.file_patterns.exclude.iter())
        {
            glob::Pattern::new(pattern).map_err(|e| format!("bad glob '{pattern}': {e}"))?;
        }
        Ok(())
    }
}

/// The declarative `repositories.yaml` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoriesConfig {
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

impl RepositoriesConfig {
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| format!("failed to parse {}: {e}", path.display()))?;
        for repo in &config.repositories {
            repo.validate()?;
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    /// Directory containing `<model_name>/model.onnx` + `tokenizer.json`.
    /// When absent the deterministic hashing embedder is used.
    pub model_dir: Option<PathBuf>,
    pub model_name: String,
    pub device: String,
    pub dimension: usize,
    pub batch_size: usize,
}

/// Application-wide settings, loaded from environment variables with
/// documented defaults.
///
/// | Variable | Default |
/// |---|---|
/// | `SHODH_CODE_DATA_DIR` | `<local data dir>/shodh-code` |
/// | `SHODH_CODE_REPOSITORIES_CONFIG` | `config/repositories.yaml` |
/// | `SHODH_CODE_REWRITER_HOST` | `http://localhost` |
/// | `SHODH_CODE_REWRITER_PORT` | `8081` |
/// | `SHODH_CODE_REWRITER_ENABLED` | `true` |
/// | `SHODH_CODE_EMBEDDING_MODEL_DIR` | unset (hashing fallback) |
/// | `SHODH_CODE_EMBEDDING_MODEL` | `all-MiniLM-L6-v2` |
/// | `SHODH_CODE_EMBEDDING_DEVICE` | `cpu` |
/// | `SHODH_CODE_EMBEDDING_DIMENSION` | `384` |
/// | `SHODH_CODE_EMBEDDING_BATCH_SIZE` | `32` |
/// | `SHODH_CODE_CHUNK_SIZE` | `1000` |
/// | `SHODH_CODE_KEYWORD_BATCH_SIZE` | `50000` |
/// | `SHODH_CODE_VECTOR_BATCH_SIZE` | `16` |
/// | `SHODH_CODE_DEBOUNCE_SECONDS` | `5` |
/// | `SHODH_CODE_WATCH_ENABLED` | `false` |
/// | `SHODH_CODE_RETENTION_DAYS` | `30` |
/// | `SHODH_CODE_LOG_LEVEL` | `info` |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub repositories_config: PathBuf,
    pub rewriter_host: String,
    pub rewriter_port: u16,
    pub rewriter_enabled: bool,
    pub embedding: EmbeddingSettings,
    /// Maximum characters per vector chunk.
    pub chunk_size: usize,
    /// Keyword documents per backend flush.
    pub keyword_batch_size: usize,
    /// Files per vector backend flush.
    pub vector_batch_size: usize,
    pub debounce_seconds: u64,
    pub watch_enabled: bool,
    pub retention_days: i64,
    pub log_level: String,
}

impl Settings {
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(v) = env_var("SHODH_CODE_DATA_DIR") {
            settings.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env_var("SHODH_CODE_REPOSITORIES_CONFIG") {
            settings.repositories_config = PathBuf::from(v);
        }
        if let Some(v) = env_var("SHODH_CODE_REWRITER_HOST") {
            settings.rewriter_host = v;
        }
        if let Some(v) = env_var("SHODH_CODE_REWRITER_PORT").and_then(|v| v.parse().ok()) {
            settings.rewriter_port = v;
        }
        if let Some(v) = env_var("SHODH_CODE_REWRITER_ENABLED") {
            settings.rewriter_enabled = v == "true" || v == "1";
        }
        if let Some(v) = env_var("SHODH_CODE_EMBEDDING_MODEL_DIR") {
            settings.embedding.model_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env_var("SHODH_CODE_EMBEDDING_MODEL") {
            settings.embedding.model_name = v;
        }
        if let Some(v) = env_var("SHODH_CODE_EMBEDDING_DEVICE") {
            settings.embedding.device = v;
        }
        if let Some(v) = env_var("SHODH_CODE_EMBEDDING_DIMENSION").and_then(|v| v.parse().ok()) {
            settings.embedding.dimension = v;
        }
        if let Some(v) = env_var("SHODH_CODE_EMBEDDING_BATCH_SIZE").and_then(|v| v.parse().ok()) {
            settings.embedding.batch_size = v;
        }
        if let Some(v) = env_var("SHODH_CODE_CHUNK_SIZE").and_then(|v| v.parse().ok()) {
            settings.chunk_size = v;
        }
        if let Some(v) = env_var("SHODH_CODE_KEYWORD_BATCH_SIZE").and_then(|v| v.parse().ok()) {
            settings.keyword_batch_size = v;
        }
        if let Some(v) = env_var("SHODH_CODE_VECTOR_BATCH_SIZE").and_then(|v| v.parse().ok()) {
            settings.vector_batch_size = v;
        }
        if let Some(v) = env_var("SHODH_CODE_DEBOUNCE_SECONDS").and_then(|v| v.parse().ok()) {
            settings.debounce_seconds = v;
        }
        if let Some(v) = env_var("SHODH_CODE_WATCH_ENABLED") {
            settings.watch_enabled = v == "true" || v == "1";
        }
        if let Some(v) = env_var("SHODH_CODE_RETENTION_DAYS").and_then(|v| v.parse().ok()) {
            settings.retention_days = v;
        }
        if let Some(v) = env_var("SHODH_CODE_LOG_LEVEL") {
            settings.log_level = v;
        }
        settings
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size < 50 {
            return Err("chunk_size must be >= 50".into());
        }
        if self.keyword_batch_size == 0 || self.vector_batch_size == 0 {
            return Err("batch sizes must be > 0".into());
        }
        if self.embedding.dimension == 0 {
            return Err("embedding.dimension must be > 0".into());
        }
        if self.retention_days <= 0 {
            return Err("retention_days must be > 0".into());
        }
        Ok(())
    }

    pub fn metadata_db_path(&self) -> PathBuf {
        self.data_dir.join("metadata").join("shodh_code.sqlite")
    }

    pub fn observability_db_path(&self) -> PathBuf {
        self.data_dir.join("metadata").join("observability.sqlite")
    }

    pub fn keyword_index_dir(&self) -> PathBuf {
        self.data_dir.join("tantivy_index")
    }

    pub fn vector_index_dir(&self) -> PathBuf {
        self.data_dir.join("lance_data")
    }

    pub fn rewriter_endpoint(&self) -> String {
        format!(
            "{}:{}/v1/completions",
            self.rewriter_host, self.rewriter_port
        )
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_secs(self.debounce_seconds)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("shodh-code");

        Self {
            data_dir,
            repositories_config: PathBuf::from("config/repositories.yaml"),
            rewriter_host: "http://localhost".to_string(),
            rewriter_port: 8081,
            rewriter_enabled: true,
            embedding: EmbeddingSettings {
                model_dir: None,
                model_name: "all-MiniLM-L6-v2".to_string(),
                device: "cpu".to_string(),
                dimension: 384,
                batch_size: 32,
            },
            chunk_size: 1000,
            keyword_batch_size: 50_000,
            vector_batch_size: 16,
            debounce_seconds: 5,
            watch_enabled: false,
            retention_days: 30,
            log_level: "info".to_string(),
        }
    }
}
