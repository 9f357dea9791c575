use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Dotted keys that must be present in every configuration file.
const REQUIRED_KEYS: &[&str] = &["project.video_source", "batching.max_per_batch"];

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub project: ProjectConfig,
    pub batching: BatchingConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub reconstruction: ReconstructionConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    #[serde(default = "default_project_name")]
    pub name: String,
    pub video_source: PathBuf,
}

fn default_project_name() -> String {
    "transects".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchingConfig {
    pub max_per_batch: usize,
    #[serde(default)]
    pub allow_partial_sites: bool,
    #[serde(default)]
    pub multi_pass: MultiPassPolicy,
}

/// How several passes over the same transect become work items.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MultiPassPolicy {
    /// All passes merge into one work item before extraction.
    #[default]
    Merge,
    /// Every pass is its own work item (`<id>_P<pass>`).
    Independent,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_frames_per_transect")]
    pub frames_per_transect: u32,
    #[serde(default = "default_video_globs")]
    pub video_globs: Vec<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            frames_per_transect: default_frames_per_transect(),
            video_globs: default_video_globs(),
        }
    }
}

fn default_frames_per_transect() -> u32 {
    1200
}
fn default_video_globs() -> Vec<String> {
    vec!["*.mp4".to_string(), "*.mov".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconstructionConfig {
    #[serde(default = "default_downscale")]
    pub downscale: u32,
    #[serde(default = "default_reconstruction_uncertainty")]
    pub reconstruction_uncertainty: f64,
    #[serde(default = "default_reprojection_error")]
    pub reprojection_error: f64,
    #[serde(default = "default_projection_accuracy")]
    pub projection_accuracy: f64,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            downscale: default_downscale(),
            reconstruction_uncertainty: default_reconstruction_uncertainty(),
            reprojection_error: default_reprojection_error(),
            projection_accuracy: default_projection_accuracy(),
        }
    }
}

fn default_downscale() -> u32 {
    2
}
fn default_reconstruction_uncertainty() -> f64 {
    50.0
}
fn default_reprojection_error() -> f64 {
    1.0
}
fn default_projection_accuracy() -> f64 {
    10.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct PublishConfig {
    #[serde(default = "default_decimated_vertices")]
    pub decimated_vertices: u64,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub api_token_env: Option<String>,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            decimated_vertices: default_decimated_vertices(),
            api_token: None,
            api_token_env: None,
        }
    }
}

fn default_decimated_vertices() -> u64 {
    3_000_000
}

impl PublishConfig {
    /// Resolve the upload token, preferring the environment variable when one is named.
    pub fn token(&self) -> Result<String, ConfigError> {
        if let Some(var) = &self.api_token_env {
            return match std::env::var(var) {
                Ok(value) if !value.trim().is_empty() => Ok(value),
                _ => Err(ConfigError::MissingKey {
                    key: format!("publish.api_token_env (environment variable {} is not set)", var),
                }),
            };
        }
        match &self.api_token {
            Some(token) if !token.trim().is_empty() => Ok(token.clone()),
            _ => Err(ConfigError::MissingKey {
                key: "publish.api_token".to_string(),
            }),
        }
    }
}

/// Overrides for the artifact roots. Relative paths resolve against the project directory.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct PathsConfig {
    pub frames: Option<PathBuf>,
    pub batch_projects: Option<PathBuf>,
    pub site_projects: Option<PathBuf>,
    pub orthomosaics: Option<PathBuf>,
    pub models: Option<PathBuf>,
    pub reports: Option<PathBuf>,
    pub published: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default)]
    pub kind: EngineKind,
    /// Command templates keyed by collaborator operation
    /// (`extract`, `align`, `filter`, `build_mesh`, `texture`, `report`,
    /// `merge_by_site`, `export_ortho`, `export_model`, `export_report`,
    /// `decimate`, `upload`).
    #[serde(default)]
    pub commands: HashMap<String, CommandTemplate>,
    /// `op:id` failure rules for the stub engine.
    #[serde(default)]
    pub stub_failures: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::Command,
            commands: HashMap::new(),
            stub_failures: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    #[default]
    Command,
    Stub,
}

/// An external program plus argument template. Arguments may contain
/// `{placeholders}` that are filled in per invocation.
#[derive(Debug, Deserialize, Clone)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content, path)
}

pub fn parse_config(content: &str, path: &Path) -> Result<Config, ConfigError> {
    let table: toml::Table = toml::from_str(content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    // Check required keys first so the error names the key, not a serde path.
    for key in REQUIRED_KEYS {
        if lookup(&table, key).is_none() {
            return Err(ConfigError::MissingKey {
                key: key.to_string(),
            });
        }
    }

    let config: Config = toml::from_str(content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    if config.batching.max_per_batch == 0 {
        return Err(ConfigError::Invalid {
            key: "batching.max_per_batch".to_string(),
            reason: "must be > 0".to_string(),
        });
    }

    if config.extraction.frames_per_transect == 0 {
        return Err(ConfigError::Invalid {
            key: "extraction.frames_per_transect".to_string(),
            reason: "must be > 0".to_string(),
        });
    }

    if config.extraction.video_globs.is_empty() {
        return Err(ConfigError::Invalid {
            key: "extraction.video_globs".to_string(),
            reason: "at least one pattern is required".to_string(),
        });
    }

    if config.reconstruction.downscale == 0 {
        return Err(ConfigError::Invalid {
            key: "reconstruction.downscale".to_string(),
            reason: "must be >= 1".to_string(),
        });
    }

    for (name, template) in &config.engine.commands {
        if template.program.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: format!("engine.commands.{}.program", name),
                reason: "must not be empty".to_string(),
            });
        }
    }

    Ok(config)
}

fn lookup<'a>(table: &'a toml::Table, dotted: &str) -> Option<&'a toml::Value> {
    let mut parts = dotted.split('.');
    let first = parts.next()?;
    let mut current = table.get(first)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Result<Config, ConfigError> {
        parse_config(content, Path::new("pipeline.toml"))
    }

    const MINIMAL: &str = r#"
[project]
video_source = "/videos"

[batching]
max_per_batch = 5
"#;

    #[test]
    fn minimal_config_applies_defaults() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.project.name, "transects");
        assert_eq!(config.batching.max_per_batch, 5);
        assert_eq!(config.batching.multi_pass, MultiPassPolicy::Merge);
        assert!(!config.batching.allow_partial_sites);
        assert_eq!(config.extraction.frames_per_transect, 1200);
        assert_eq!(config.reconstruction.downscale, 2);
        assert_eq!(config.publish.decimated_vertices, 3_000_000);
        assert_eq!(config.engine.kind, EngineKind::Command);
    }

    #[test]
    fn missing_key_is_named() {
        let err = parse("[project]\nvideo_source = \"/v\"\n").unwrap_err();
        match err {
            ConfigError::MissingKey { key } => assert_eq!(key, "batching.max_per_batch"),
            other => panic!("unexpected error: {other}"),
        }

        let err = parse("[batching]\nmax_per_batch = 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey { ref key } if key == "project.video_source"));
    }

    #[test]
    fn zero_batch_size_rejected() {
        let content = MINIMAL.replace("max_per_batch = 5", "max_per_batch = 0");
        let err = parse(&content).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "batching.max_per_batch"));
    }

    #[test]
    fn independent_passes_and_stub_engine() {
        let content = format!(
            "{}\nmulti_pass = \"independent\"\n\n[engine]\nkind = \"stub\"\n",
            MINIMAL.trim_end()
        );
        let config = parse(&content).unwrap();
        assert_eq!(config.batching.multi_pass, MultiPassPolicy::Independent);
        assert_eq!(config.engine.kind, EngineKind::Stub);
    }

    #[test]
    fn publish_token_required_only_on_demand() {
        let config = parse(MINIMAL).unwrap();
        let err = config.publish.token().unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey { ref key } if key == "publish.api_token"));

        let content = format!("{}\n[publish]\napi_token = \"abc\"\n", MINIMAL);
        let config = parse(&content).unwrap();
        assert_eq!(config.publish.token().unwrap(), "abc");
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = parse("[project\nvideo_source = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn example_config_parses() {
        let config = parse(include_str!("../config/pipeline.example.toml")).unwrap();
        assert_eq!(config.batching.max_per_batch, 10);
        assert_eq!(config.engine.kind, EngineKind::Command);
        assert_eq!(config.engine.commands.len(), 12);
        assert_eq!(config.publish.api_token_env.as_deref(), Some("SKETCHFAB_TOKEN"));
    }
}
