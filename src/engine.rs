//! Capability interfaces for the external collaborators.
//!
//! The orchestration core never extracts a frame or aligns a photo itself.
//! Each stage transition is bound to one of the traits below, and the Stage
//! Runner only sees their results.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 Collaborators                 │
//! │  ┌──────────┐ ┌──────────────┐ ┌────────────┐ │
//! │  │Extractor │ │Reconstruction│ │Consolidator│ │
//! │  └──────────┘ └──────────────┘ └────────────┘ │
//! │  ┌──────────┐ ┌──────────┐                    │
//! │  │ Exporter │ │Publisher │                    │
//! │  └──────────┘ └──────────┘                    │
//! └──────────────┬────────────────────────────────┘
//!                ▼
//!         run_stage() → status store
//! ```
//!
//! Two implementations ship with the crate: [`crate::engine_cmd`] shells
//! out to configured external programs, and [`crate::engine_stub`] fakes
//! every artifact locally for tests and dry runs.
//!
//! # Error contract
//!
//! Every method returns [`anyhow::Result`]. An `Err` is an engine-reported
//! failure for the member (or the whole batch, for batch operations) and is
//! recorded in the status file. It never aborts the invocation.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{Config, EngineKind, ReconstructionConfig};
use crate::engine_cmd::CommandEngine;
use crate::engine_stub::StubEngine;
use crate::models::WorkItem;

// ═══════════════════════════════════════════════════════════════════════
// Extraction
// ═══════════════════════════════════════════════════════════════════════

/// Turns a transect's source videos into still frames.
///
/// Consumed at `Discovered → Extracted`. Returning an empty frame list is
/// treated as a failure by the runner.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, item: &WorkItem, frames_dir: &Path, frame_count: u32)
        -> Result<Vec<PathBuf>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Reconstruction
// ═══════════════════════════════════════════════════════════════════════

/// One member of a reconstruction batch with the frames it was extracted to.
#[derive(Debug, Clone)]
pub struct MemberInput {
    pub item: WorkItem,
    pub frames_dir: PathBuf,
}

/// Everything a reconstruction sub-step needs to know about its batch.
#[derive(Debug, Clone)]
pub struct ReconstructionJob {
    pub batch_id: String,
    /// Batch project file the engine reads and writes.
    pub project_path: PathBuf,
    /// Members still in play. Members that failed an earlier sub-step are removed.
    pub members: Vec<MemberInput>,
    pub params: ReconstructionConfig,
}

impl ReconstructionJob {
    pub fn member_ids(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.item.id.as_str()).collect()
    }
}

/// Per-member failures reported by one batch operation.
///
/// Members not listed succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    pub failed: BTreeMap<String, String>,
}

impl StepReport {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_failure(mut self, id: &str, reason: &str) -> Self {
        self.failed.insert(id.to_string(), reason.to_string());
        self
    }
}

/// The reconstruction sub-steps, in the order the runner drives them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconstructionStep {
    Align,
    Filter,
    BuildMesh,
    Texture,
    Report,
}

impl ReconstructionStep {
    pub const ALL: [ReconstructionStep; 5] = [
        ReconstructionStep::Align,
        ReconstructionStep::Filter,
        ReconstructionStep::BuildMesh,
        ReconstructionStep::Texture,
        ReconstructionStep::Report,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReconstructionStep::Align => "align",
            ReconstructionStep::Filter => "filter",
            ReconstructionStep::BuildMesh => "build_mesh",
            ReconstructionStep::Texture => "texture",
            ReconstructionStep::Report => "report",
        }
    }
}

impl fmt::Display for ReconstructionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Photogrammetry engine driven once per early batch.
///
/// Consumed at `Extracted → Reconstructed`. Each sub-step returns the
/// members it failed; those members are dropped from later sub-steps.
/// An `Err` fails every member still in the job.
#[async_trait]
pub trait ReconstructionEngine: Send + Sync {
    /// Add frames and align cameras.
    async fn align(&self, job: &ReconstructionJob) -> Result<StepReport>;
    /// Gradual selection on the sparse cloud.
    async fn filter(&self, job: &ReconstructionJob) -> Result<StepReport>;
    async fn build_mesh(&self, job: &ReconstructionJob) -> Result<StepReport>;
    async fn texture(&self, job: &ReconstructionJob) -> Result<StepReport>;
    /// Per-member processing report.
    async fn report(&self, job: &ReconstructionJob) -> Result<StepReport>;

    async fn run_step(&self, step: ReconstructionStep, job: &ReconstructionJob) -> Result<StepReport> {
        match step {
            ReconstructionStep::Align => self.align(job).await,
            ReconstructionStep::Filter => self.filter(job).await,
            ReconstructionStep::BuildMesh => self.build_mesh(job).await,
            ReconstructionStep::Texture => self.texture(job).await,
            ReconstructionStep::Report => self.report(job).await,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Consolidation
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct ConsolidationJob {
    pub batch_id: String,
    pub site: String,
    /// Site project file to create or extend.
    pub project_path: PathBuf,
    pub members: Vec<WorkItem>,
    /// Members merged into the site project by earlier runs. They must
    /// survive the merge.
    pub consolidated: Vec<WorkItem>,
    /// Early batch projects holding the members' reconstructions.
    pub sources: Vec<PathBuf>,
}

/// Merges reconstructed transects of one site into a single project.
///
/// Consumed at `Reconstructed → Consolidated`. The manual straighten and
/// scale checkpoint edits the returned project in place afterwards.
#[async_trait]
pub trait Consolidator: Send + Sync {
    async fn merge_by_site(&self, job: &ConsolidationJob) -> Result<PathBuf>;
}

// ═══════════════════════════════════════════════════════════════════════
// Export & publish
// ═══════════════════════════════════════════════════════════════════════

/// Writes per-transect deliverables out of a site project.
///
/// Consumed at `Consolidated → Exported`.
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn export_ortho(&self, item: &WorkItem, project: &Path, dest: &Path) -> Result<Vec<PathBuf>>;
    async fn export_model(&self, item: &WorkItem, project: &Path, dest: &Path) -> Result<Vec<PathBuf>>;
    async fn export_report(&self, item: &WorkItem, project: &Path, dest: &Path) -> Result<Vec<PathBuf>>;
}

/// Decimates an exported model and uploads it.
///
/// Consumed at `Exported → Published`.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn decimate(
        &self,
        item: &WorkItem,
        model_dir: &Path,
        target_vertices: u64,
        dest: &Path,
    ) -> Result<PathBuf>;

    /// Returns the remote id of the uploaded model.
    async fn upload(&self, item: &WorkItem, decimated_model: &Path, token: &str) -> Result<String>;
}

// ═══════════════════════════════════════════════════════════════════════
// Bundle
// ═══════════════════════════════════════════════════════════════════════

/// One implementation of every collaborator, handed to the Stage Runner.
#[derive(Clone)]
pub struct Collaborators {
    pub extractor: Arc<dyn Extractor>,
    pub reconstruction: Arc<dyn ReconstructionEngine>,
    pub consolidator: Arc<dyn Consolidator>,
    pub exporter: Arc<dyn Exporter>,
    pub publisher: Arc<dyn Publisher>,
}

impl Collaborators {
    /// Use a single object that implements every capability.
    pub fn from_engine<E>(engine: Arc<E>) -> Self
    where
        E: Extractor + ReconstructionEngine + Consolidator + Exporter + Publisher + 'static,
    {
        Self {
            extractor: engine.clone(),
            reconstruction: engine.clone(),
            consolidator: engine.clone(),
            exporter: engine.clone(),
            publisher: engine,
        }
    }

    /// Build the collaborators selected by `[engine] kind`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        match config.engine.kind {
            EngineKind::Command => {
                let engine = CommandEngine::from_config(&config.engine)?;
                Ok(Self::from_engine(Arc::new(engine)))
            }
            EngineKind::Stub => {
                let engine = StubEngine::with_rules(&config.engine.stub_failures)?;
                Ok(Self::from_engine(Arc::new(engine)))
            }
        }
    }
}
