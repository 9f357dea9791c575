//! Error taxonomy for the orchestration core.
//!
//! Every variant of [`PipelineError`] is fatal for the invocation that
//! raises it, with one exception: [`PipelineError::IncompleteSite`] is an
//! advisory that callers may choose to act on or ignore. Per-member engine
//! failures never show up here; the Stage Runner records them in the
//! status file instead.

use std::path::PathBuf;
use thiserror::Error;

use crate::models::Stage;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Cannot parse transect name '{name}': {reason}")]
    Parse { name: String, reason: String },

    #[error("Duplicate work item id '{id}': '{first}' and '{second}' resolve to the same transect")]
    DuplicateId {
        id: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("Status file '{path}' is corrupt: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    #[error("Invalid transition for '{id}': {from} -> {to} (record is at {actual})")]
    InvalidTransition {
        id: String,
        from: Stage,
        to: Stage,
        actual: Stage,
    },

    #[error("Incomplete sites: {}", .sites.join(", "))]
    IncompleteSite { sites: Vec<String> },

    #[error("Artifact '{artifact}' is claimed by more than one unresolved batch: {}", .batches.join(", "))]
    AmbiguousState {
        artifact: PathBuf,
        batches: Vec<String>,
    },

    #[error("Cannot reset to '{0}': the target must be a stage of the processing sequence")]
    InvalidResetTarget(Stage),

    #[error("Unknown work item '{0}'")]
    UnknownItem(String),

    #[error("Batch '{batch_id}' artifact '{path}' is unreadable: {reason}")]
    ArtifactUnreadable {
        batch_id: String,
        path: PathBuf,
        reason: String,
    },

    #[error("Refusing to delete '{path}': outside declared artifact root '{root}'")]
    OutsideArtifactRoot { path: PathBuf, root: PathBuf },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Missing required config key '{key}'")]
    MissingKey { key: String },

    #[error("Invalid value for config key '{key}': {reason}")]
    Invalid { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, PipelineError>;
