use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;
const DEFAULT_CONFIG_PATH: &str = "runwatch.toml";

/// Resolved configuration, passed explicitly to whatever needs it. There is
/// no module-level backend URL: tests substitute their own and two backends
/// can coexist in one process.
#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    pub poll_interval: u64,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    backend: BackendSection,
}

#[derive(Debug, Default, Deserialize)]
struct BackendSection {
    base_url: Option<String>,
    poll_interval: Option<u64>,
}

impl Config {
    /// Load configuration. Precedence for the backend URL: `--backend` flag,
    /// then `RUNWATCH_BACKEND_URL`, then the config file, then the default.
    /// An explicitly given config path must exist; the default path is
    /// optional.
    pub fn load(path: Option<&Path>, backend_flag: Option<String>) -> Result<Self> {
        let file = match path {
            Some(p) => Some(FileConfig::read(p)?),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Some(FileConfig::read(default)?)
                } else {
                    None
                }
            }
        };
        let env = std::env::var("RUNWATCH_BACKEND_URL").ok();
        Ok(Self::resolve(file, backend_flag, env))
    }

    fn resolve(file: Option<FileConfig>, flag: Option<String>, env: Option<String>) -> Self {
        let file = file.unwrap_or_default();
        let base_url = flag
            .filter(|v| !v.is_empty())
            .or_else(|| env.filter(|v| !v.is_empty()))
            .or(file.backend.base_url)
            .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_interval: file
                .backend
                .poll_interval
                .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
        }
    }
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "failed to parse runwatch.toml")
    }
}
