use serde::Deserialize;
use std::path::PathBuf;
use tracing::info;

use crate::fs_util::home_dir;
use crate::memory::tier::Tier;

/// Top-level configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MemoriaConfig {
    pub storage: StorageConfig,
    pub memory: MemoryConfig,
    pub context: ContextConfig,
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the memory snapshot. Defaults to `~/.memoria/data`.
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolve_data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => dir.clone(),
            None => state_dir().join("data"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_recent_messages")]
    pub recent_messages: usize,
    #[serde(default = "default_relevant_messages")]
    pub relevant_messages: usize,
    #[serde(default)]
    pub default_tier: Tier,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            recent_messages: default_recent_messages(),
            relevant_messages: default_relevant_messages(),
            default_tier: Tier::default(),
        }
    }
}

fn default_similarity_threshold() -> f32 {
    0.7
}
fn default_recent_messages() -> usize {
    10
}
fn default_relevant_messages() -> usize {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextConfig {
    /// One exchange = one user message plus one assistant reply.
    #[serde(default = "default_max_exchanges")]
    pub max_exchanges: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_exchanges: default_max_exchanges(),
        }
    }
}

fn default_max_exchanges() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_dimension")]
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
        }
    }
}

fn default_dimension() -> usize {
    384
}

/// Load configuration from file or use defaults.
///
/// Search order:
/// 1. `MEMORIA_CONFIG` env var
/// 2. `~/.memoria/config.toml`
/// 3. Zero-config defaults (no file needed)
pub fn load() -> anyhow::Result<MemoriaConfig> {
    let path = config_path();

    if path.exists() {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
        let config = parse(&content)
            .map_err(|e| anyhow::anyhow!("invalid config at {}: {e}", path.display()))?;

        info!("loaded config from {}", path.display());
        Ok(config)
    } else {
        info!("no config file found, using zero-config defaults");
        Ok(MemoriaConfig::default())
    }
}

/// Parse and validate a TOML document.
pub fn parse(content: &str) -> anyhow::Result<MemoriaConfig> {
    let config: MemoriaConfig = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("MEMORIA_CONFIG") {
        return PathBuf::from(path);
    }
    state_dir().join("config.toml")
}

fn state_dir() -> PathBuf {
    home_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".memoria")
}

/// Validate the config and return clear error messages.
pub fn validate(config: &MemoriaConfig) -> anyhow::Result<()> {
    let threshold = config.memory.similarity_threshold;
    if !(-1.0..=1.0).contains(&threshold) {
        anyhow::bail!("memory.similarity_threshold must be within [-1, 1], got {threshold}");
    }
    if config.memory.recent_messages == 0 {
        anyhow::bail!("memory.recent_messages must be > 0");
    }
    if config.memory.relevant_messages == 0 {
        anyhow::bail!("memory.relevant_messages must be > 0");
    }
    if config.context.max_exchanges == 0 {
        anyhow::bail!("context.max_exchanges must be > 0");
    }
    if config.embedding.dimension == 0 {
        anyhow::bail!("embedding.dimension must be > 0");
    }
    Ok(())
}
