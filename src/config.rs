//! Configuration parsing and validation.
//!
//! llmops is configured via a TOML file (default: `config/llmops.toml`).
//! Only `[db]` is required; every other section has defaults.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/llmops.sqlite"
//!
//! [storage]
//! provider = "fs"
//! root = "./data/blobs"
//! presign_secret = "change-me"
//!
//! [indexing]
//! vector_batch_size = 10
//! default_chunk_size = 500
//! default_chunk_overlap = 50
//!
//! [retrieval]
//! default_k = 4
//!
//! [llm]
//! provider = "openai"
//! model = "gpt-4o-mini"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [log]
//! level = "info"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use llmops_core::chunk::{DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE, DEFAULT_SEPARATORS};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub locks: LocksConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Defaults everywhere, with the database at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            storage: StorageConfig::default(),
            indexing: IndexingConfig::default(),
            retrieval: RetrievalConfig::default(),
            workflow: WorkflowConfig::default(),
            locks: LocksConfig::default(),
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            log: LogConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_provider")]
    pub provider: String,
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub presign_secret: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: default_storage_provider(),
            root: default_storage_root(),
            bucket: None,
            region: default_region(),
            endpoint_url: None,
            prefix: String::new(),
            presign_secret: String::new(),
        }
    }
}

fn default_storage_provider() -> String {
    "fs".to_string()
}
fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/blobs")
}
fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_vector_batch_size")]
    pub vector_batch_size: usize,
    #[serde(default = "default_max_keywords")]
    pub max_keywords: usize,
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub default_chunk_overlap: usize,
    #[serde(default = "default_separators")]
    pub default_separators: Vec<String>,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            vector_batch_size: default_vector_batch_size(),
            max_keywords: default_max_keywords(),
            default_chunk_size: default_chunk_size(),
            default_chunk_overlap: default_chunk_overlap(),
            default_separators: default_separators(),
        }
    }
}

fn default_vector_batch_size() -> usize {
    10
}
fn default_max_keywords() -> usize {
    10
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_chunk_overlap() -> usize {
    DEFAULT_CHUNK_OVERLAP
}
fn default_separators() -> Vec<String> {
    DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub default_k: usize,
    #[serde(default)]
    pub default_score: f64,
    #[serde(default = "default_keyword_top_n")]
    pub keyword_top_n: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            default_score: 0.0,
            keyword_top_n: default_keyword_top_n(),
        }
    }
}

fn default_k() -> usize {
    4
}
fn default_keyword_top_n() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkflowConfig {
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_max_http_timeout_secs")]
    pub max_http_timeout_secs: u64,
    #[serde(default = "default_debug_channel_capacity")]
    pub debug_channel_capacity: usize,
    #[serde(default = "default_code_timeout_secs")]
    pub code_timeout_secs: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: default_http_timeout_secs(),
            max_http_timeout_secs: default_max_http_timeout_secs(),
            debug_channel_capacity: default_debug_channel_capacity(),
            code_timeout_secs: default_code_timeout_secs(),
        }
    }
}

fn default_http_timeout_secs() -> u64 {
    30
}
fn default_max_http_timeout_secs() -> u64 {
    300
}
fn default_debug_channel_capacity() -> usize {
    100
}
fn default_code_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocksConfig {
    #[serde(default = "default_keyword_table_ttl_secs")]
    pub keyword_table_ttl_secs: u64,
    #[serde(default = "default_document_enabled_ttl_secs")]
    pub document_enabled_ttl_secs: u64,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            keyword_table_ttl_secs: default_keyword_table_ttl_secs(),
            document_enabled_ttl_secs: default_document_enabled_ttl_secs(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

fn default_keyword_table_ttl_secs() -> u64 {
    30
}
fn default_document_enabled_ttl_secs() -> u64 {
    600
}
fn default_acquire_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            base_url: None,
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_llm_max_retries(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    60
}
fn default_llm_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            base_url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Cross-field checks applied after parsing.
pub fn validate(config: &Config) -> Result<()> {
    // Validate indexing
    let idx = &config.indexing;
    if idx.default_chunk_size == 0 {
        anyhow::bail!("indexing.default_chunk_size must be > 0");
    }
    if idx.default_chunk_overlap >= idx.default_chunk_size {
        anyhow::bail!("indexing.default_chunk_overlap must be smaller than default_chunk_size");
    }
    if idx.vector_batch_size == 0 {
        anyhow::bail!("indexing.vector_batch_size must be > 0");
    }
    if idx.max_keywords == 0 {
        anyhow::bail!("indexing.max_keywords must be > 0");
    }

    // Validate retrieval
    if config.retrieval.default_k < 1 {
        anyhow::bail!("retrieval.default_k must be >= 1");
    }

    // Validate workflow
    let wf = &config.workflow;
    if wf.debug_channel_capacity == 0 {
        anyhow::bail!("workflow.debug_channel_capacity must be > 0");
    }
    if wf.http_timeout_secs == 0 || wf.http_timeout_secs > wf.max_http_timeout_secs {
        anyhow::bail!("workflow.http_timeout_secs must be in 1..=max_http_timeout_secs");
    }

    // Validate storage
    match config.storage.provider.as_str() {
        "fs" => {}
        "s3" => {
            if config.storage.bucket.is_none() {
                anyhow::bail!("storage.bucket must be specified when provider is 's3'");
            }
        }
        other => anyhow::bail!("Unknown storage provider: '{}'. Must be fs or s3.", other),
    }

    // Validate llm
    match config.llm.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.llm.model.is_none() {
                anyhow::bail!("llm.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hash" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                anyhow::bail!("embedding.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or hash.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = parse("[db]\npath = \"/tmp/x.sqlite\"\n").unwrap();
        assert_eq!(config.indexing.vector_batch_size, 10);
        assert_eq!(config.indexing.default_separators.len(), 8);
        assert_eq!(config.retrieval.default_k, 4);
        assert_eq!(config.workflow.http_timeout_secs, 30);
        assert_eq!(config.workflow.debug_channel_capacity, 100);
        assert_eq!(config.locks.keyword_table_ttl_secs, 30);
        assert_eq!(config.log.level, "info");
        assert!(!config.embedding.is_enabled());
    }

    #[test]
    fn test_overlap_must_be_below_chunk_size() {
        let err = parse(
            "[db]\npath = \"x\"\n[indexing]\ndefault_chunk_size = 10\ndefault_chunk_overlap = 10\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn test_embedding_requires_dims() {
        let err = parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"hash\"\n").unwrap_err();
        assert!(err.to_string().contains("dims"));
        assert!(parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"hash\"\ndims = 64\n").is_ok());
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = parse(include_str!("../config/llmops.example.toml")).unwrap();
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.locks.document_enabled_ttl_secs, 600);
    }

    #[test]
    fn test_unknown_providers_rejected() {
        assert!(parse("[db]\npath = \"x\"\n[storage]\nprovider = \"ftp\"\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[llm]\nprovider = \"magic\"\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[storage]\nprovider = \"s3\"\n").is_err());
    }
}
