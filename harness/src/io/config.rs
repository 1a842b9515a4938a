//! Harness configuration stored in `harness.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "harness.toml";

/// Harness configuration (TOML).
///
/// Missing fields fall back to the defaults below, so an absent or partial
/// file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HarnessConfig {
    /// Wall-clock ceiling in seconds for executing all blocks of one document.
    pub timeout_secs: u64,

    /// Keep at most this many bytes of each block's stdout and stderr.
    pub output_limit_bytes: usize,

    /// Interpreter command. The driver script (persistent mode) or the
    /// block's script file (per-block mode) is appended as last argument.
    pub interpreter: Vec<String>,

    /// How blocks share an interpreter.
    pub kernel: KernelMode,

    pub service: ServiceConfig,

    /// Extra variables exported to every block.
    pub env: BTreeMap<String, String>,
}

/// Interpreter lifetime for one document run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KernelMode {
    /// One Python process runs every block in a shared namespace.
    #[default]
    Persistent,
    /// Each block runs as its own script; any interpreter works.
    PerBlock,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Base URL of the benchmarking service, exported to blocks.
    pub base_url: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://tau-bench.turing.com".to_string(),
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            output_limit_bytes: 1_000_000,
            interpreter: vec!["python3".to_string()],
            kernel: KernelMode::default(),
            service: ServiceConfig::default(),
            env: BTreeMap::new(),
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(anyhow!("timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.interpreter.is_empty() || self.interpreter[0].trim().is_empty() {
            return Err(anyhow!("interpreter must be a non-empty array"));
        }
        if let Some(key) = self
            .env
            .keys()
            .find(|key| key.is_empty() || key.contains('='))
        {
            return Err(anyhow!("invalid env variable name '{key}'"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `HarnessConfig::default()`.
pub fn load_config(path: &Path) -> Result<HarnessConfig> {
    if !path.exists() {
        let cfg = HarnessConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: HarnessConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, HarnessConfig::default());
        assert_eq!(cfg.timeout_secs, 600);
        assert_eq!(cfg.kernel, KernelMode::Persistent);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("harness.toml");
        fs::write(
            &path,
            "interpreter = [\"sh\"]\nkernel = \"per_block\"\n\n[service]\nbase_url = \"http://localhost:8000\"\n\n[env]\nAPI_KEY = \"k\"\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.interpreter, vec!["sh"]);
        assert_eq!(cfg.kernel, KernelMode::PerBlock);
        assert_eq!(cfg.service.base_url, "http://localhost:8000");
        assert_eq!(cfg.env.get("API_KEY").map(String::as_str), Some("k"));
        assert_eq!(cfg.timeout_secs, 600);
    }

    #[test]
    fn rejects_zero_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("harness.toml");
        fs::write(&path, "timeout_secs = 0\n").expect("write");
        let err = load_config(&path).expect_err("should fail");
        assert!(format!("{err:#}").contains("timeout_secs must be > 0"));
    }

    #[test]
    fn rejects_empty_interpreter() {
        let cfg = HarnessConfig {
            interpreter: Vec::new(),
            ..HarnessConfig::default()
        };
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("interpreter"));
    }
}
