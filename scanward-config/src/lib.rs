//! Configuration loading for the scanward engine.
//!
//! Settings come from a file or inline JSON named by the environment, a
//! well-known file in the working directory, or the built-in defaults. A
//! `.env` file in the working directory is read first so both variables can
//! live there.

pub mod telemetry;

use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, anyhow};
use scanward_core::orchestration::{
    DefaultTargetResolver, OrchestrationContext, OrchestrationContextBuilder, OrchestratorConfig,
};
use serde::{Deserialize, Serialize};

/// Names a file (TOML or JSON) holding an [`EngineConfig`].
pub const CONFIG_PATH_VAR: &str = "SCANWARD_CONFIG_PATH";
/// Inline JSON [`EngineConfig`].
pub const CONFIG_JSON_VAR: &str = "SCANWARD_CONFIG_JSON";

/// Where the effective configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    /// Built-in defaults.
    #[default]
    Default,
    /// File named by `SCANWARD_CONFIG_PATH`.
    EnvPath(PathBuf),
    /// JSON from `SCANWARD_CONFIG_JSON`.
    EnvInline,
    /// Well-known file found in the working directory.
    File(PathBuf),
}

/// Everything a host process needs to stand up the engine.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Scheduler, pool, cache and timeout tuning.
    pub orchestrator: OrchestratorConfig,
    /// `tracing` filter used when `RUST_LOG` is unset, e.g. `info,scanward_core=debug`.
    pub log_filter: Option<String>,
    /// Directory for repository clones. Defaults to a `scanward` folder in the
    /// system temp dir.
    pub work_dir: Option<PathBuf>,
}

impl EngineConfig {
    /// Evaluation order:
    /// 1) `$SCANWARD_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$SCANWARD_CONFIG_JSON` (inline JSON),
    /// 3) `scanward.toml` / `config/scanward.toml` in the working directory,
    /// 4) defaults.
    pub fn load_from_env() -> anyhow::Result<(Self, ConfigSource)> {
        // A missing .env is the normal case.
        let _ = dotenvy::dotenv();

        if let Ok(path_str) = env::var(CONFIG_PATH_VAR)
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str);
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::EnvPath(path)));
        }

        if let Ok(raw) = env::var(CONFIG_JSON_VAR)
            && !raw.trim().is_empty()
        {
            let parsed = Self::parse_json(&raw)
                .with_context(|| format!("failed to parse {CONFIG_JSON_VAR}"))?;
            return Ok((parsed, ConfigSource::EnvInline));
        }

        if let Some(path) = Self::find_default_file(Path::new(".")) {
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        Ok((Self::default(), ConfigSource::Default))
    }

    /// Parses by extension; anything other than `.json`/`.toml` goes through
    /// [`Self::parse_from_str`].
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| {
            format!("failed to read engine config from {}", path.display())
        })?;

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents)
                .with_context(|| format!("invalid engine config {}", path.display()))?,
            Some("toml") => toml::from_str(&contents)
                .map_err(|err| anyhow!("invalid engine config {}: {}", path.display(), err))?,
            _ => Self::parse_from_str(&contents, &path.display().to_string())?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Tries TOML first, then JSON.
    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse engine config {}: toml error: {}; json error: {}",
                    origin,
                    toml_err,
                    json_err
                )
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parses inline JSON and validates it.
    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| anyhow!("invalid engine config json: {err}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Delegates to [`OrchestratorConfig::validate`].
    pub fn validate(&self) -> anyhow::Result<()> {
        self.orchestrator
            .validate()
            .context("engine config failed validation")
    }

    /// `work_dir`, or the default clone location.
    pub fn effective_work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| env::temp_dir().join("scanward"))
    }

    /// Installs the global subscriber, with `log_filter` as the fallback
    /// when `RUST_LOG` is unset.
    pub fn init_tracing(&self) -> anyhow::Result<()> {
        telemetry::init_tracing(self.log_filter.as_deref())
    }

    /// Resolver that clones repositories into [`Self::effective_work_dir`].
    pub fn target_resolver(&self) -> DefaultTargetResolver {
        DefaultTargetResolver::new(self.effective_work_dir())
    }

    /// Context builder seeded with these settings and [`Self::target_resolver`].
    pub fn context_builder(&self) -> OrchestrationContextBuilder {
        OrchestrationContext::builder(self.orchestrator.clone())
            .resolver(Arc::new(self.target_resolver()))
    }

    fn find_default_file(base: &Path) -> Option<PathBuf> {
        const CANDIDATES: &[&str] = &[
            "scanward.toml",
            "scanward.json",
            "config/scanward.toml",
            "config/scanward.json",
        ];

        CANDIDATES
            .iter()
            .map(|candidate| base.join(candidate))
            .find(|path| path.exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_file_prefers_the_root_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("config")).expect("config dir");
        fs::write(dir.path().join("config/scanward.toml"), "").expect("nested");
        assert_eq!(
            EngineConfig::find_default_file(dir.path()),
            Some(dir.path().join("config/scanward.toml"))
        );

        fs::write(dir.path().join("scanward.toml"), "").expect("root");
        assert_eq!(
            EngineConfig::find_default_file(dir.path()),
            Some(dir.path().join("scanward.toml"))
        );
    }

    #[test]
    fn clones_land_in_the_configured_work_dir() {
        let config = EngineConfig {
            work_dir: Some(PathBuf::from("/var/lib/scanward/clones")),
            ..EngineConfig::default()
        };
        assert_eq!(
            config.target_resolver().work_dir(),
            Path::new("/var/lib/scanward/clones")
        );

        let fallback = EngineConfig::default().target_resolver();
        assert_eq!(fallback.work_dir(), env::temp_dir().join("scanward"));
    }

    #[test]
    fn context_builder_carries_the_orchestrator_settings() {
        let mut config = EngineConfig::default();
        config.orchestrator.scheduler.lookahead = 3;
        let ctx = config
            .context_builder()
            .resource_probe(Arc::new(
                scanward_core::orchestration::StaticResourceProbe::idle(2, 2048),
            ))
            .build()
            .expect("context builds");
        assert_eq!(ctx.config.scheduler.lookahead, 3);
    }

    #[test]
    fn nothing_on_disk_finds_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(EngineConfig::find_default_file(dir.path()).is_none());
    }
}
