//! Stage Runner: drives one batch through one stage transition.
//!
//! For every member, in batch order:
//!
//! 1. skip it if it is already past `stage`, or not yet at it;
//! 2. call the collaborator bound to `stage`;
//! 3. on success, advance it to the next stage;
//! 4. on an engine-reported failure, record the failure and move on.
//!
//! The status file is loaded to compute the work list and released before
//! any engine call. Outcomes are applied through a fresh load → mutate →
//! save cycle afterwards, once per member for per-item stages and once per
//! batch for batch stages, so an interrupted run leaves every member at its
//! last successfully recorded stage.
//!
//! Only infrastructure problems (corrupt status, an unreadable batch
//! artifact, a contract violation) are returned as errors. Member failures
//! are part of the [`StageResult`].

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::artifacts::ArtifactLayout;
use crate::config::{Config, ReconstructionConfig};
use crate::engine::{Collaborators, ConsolidationJob, MemberInput, ReconstructionJob, ReconstructionStep};
use crate::error::{ConfigError, PipelineError, Result};
use crate::models::{Batch, Phase, Stage, WorkItem};
use crate::progress::{StageProgressEvent, StageProgressReporter};
use crate::status::{ProjectStatus, StatusStore};

/// Engine parameters a stage run needs, resolved from configuration.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub frames_per_transect: u32,
    pub reconstruction: ReconstructionConfig,
    pub decimated_vertices: u64,
    /// Only required by the publish transition.
    pub upload_token: Option<String>,
}

impl RunSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            frames_per_transect: config.extraction.frames_per_transect,
            reconstruction: config.reconstruction.clone(),
            decimated_vertices: config.publish.decimated_vertices,
            upload_token: None,
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            frames_per_transect: 1200,
            reconstruction: ReconstructionConfig::default(),
            decimated_vertices: 3_000_000,
            upload_token: None,
        }
    }
}

/// Everything a stage run borrows from the invocation.
pub struct StageContext<'a> {
    pub store: &'a StatusStore,
    pub layout: &'a ArtifactLayout,
    pub engine: &'a Collaborators,
    pub settings: &'a RunSettings,
    pub progress: &'a dyn StageProgressReporter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The member is already past the stage being run.
    AlreadyDone(Stage),
    /// The member has not reached the stage being run.
    NotReady(Stage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberOutcome {
    Advanced,
    Failed { error: String },
    Skipped(SkipReason),
}

/// Per-member outcomes of one batch run, in batch order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResult {
    pub batch_id: String,
    /// The stage members were expected to be at.
    pub stage: Stage,
    pub outcomes: Vec<(String, MemberOutcome)>,
}

impl StageResult {
    pub fn advanced(&self) -> usize {
        self.count(|o| matches!(o, MemberOutcome::Advanced))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, MemberOutcome::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, MemberOutcome::Skipped(_)))
    }

    pub fn not_ready(&self) -> usize {
        self.count(|o| matches!(o, MemberOutcome::Skipped(SkipReason::NotReady(_))))
    }

    pub fn outcome(&self, id: &str) -> Option<&MemberOutcome> {
        self.outcomes.iter().find(|(m, _)| m == id).map(|(_, o)| o)
    }

    fn count(&self, f: impl Fn(&MemberOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| f(o)).count()
    }
}

/// Written under the published root once an upload succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub id: String,
    pub remote_id: String,
    pub decimated_model: PathBuf,
    pub uploaded_at: DateTime<Utc>,
}

/// `Ok` advances the member, `Err` records the message as its failure.
type Delta = std::result::Result<(), String>;

/// Drive `batch` through the transition out of `stage`.
pub async fn run_stage(ctx: &StageContext<'_>, batch: &Batch, stage: Stage) -> Result<StageResult> {
    let span = info_span!("run_stage", batch = %batch.batch_id, %stage);
    run_stage_inner(ctx, batch, stage).instrument(span).await
}

async fn run_stage_inner(ctx: &StageContext<'_>, batch: &Batch, stage: Stage) -> Result<StageResult> {
    let Some(next) = stage.next() else {
        return Err(no_successor(batch, stage));
    };

    let plan = {
        let snapshot = ctx.store.load()?;
        WorkList::build(&snapshot, ctx.layout, batch, stage)?
    };

    if plan.pending.is_empty() {
        debug!(skipped = plan.skipped.len(), "nothing to do");
        return Ok(plan.into_result(batch, stage, HashMap::new()));
    }

    info!(pending = plan.pending.len(), skipped = plan.skipped.len(), "running {} -> {}", stage, next);

    let deltas = match stage {
        Stage::Discovered => extract(ctx, batch, &plan.pending, next).await?,
        Stage::Extracted => reconstruct(ctx, batch, &plan.pending, next).await?,
        Stage::Reconstructed => consolidate(ctx, batch, &plan, next).await?,
        Stage::Consolidated => export(ctx, batch, &plan.pending, next).await?,
        Stage::Exported => publish(ctx, batch, &plan.pending, next).await?,
        Stage::Published | Stage::Failed => return Err(no_successor(batch, stage)),
    };

    let result = plan.into_result(batch, stage, deltas);
    if result.failed() == 0 && result.not_ready() == 0 {
        ctx.store.update(|status| {
            status.mark_resolved(&batch.batch_id);
            Ok(())
        })?;
    }

    info!(
        advanced = result.advanced(),
        failed = result.failed(),
        skipped = result.skipped(),
        "batch finished"
    );
    Ok(result)
}

/// Running out of `Published` or `Failed` is a caller bug.
fn no_successor(batch: &Batch, stage: Stage) -> PipelineError {
    PipelineError::InvalidTransition {
        id: batch.batch_id.clone(),
        from: stage,
        to: stage,
        actual: stage,
    }
}

/// Members to process, skip decisions, and resolved inputs, computed from
/// one snapshot of the status file.
struct WorkList {
    pending: Vec<WorkItem>,
    /// Members already past the stage, in batch order.
    done: Vec<WorkItem>,
    skipped: HashMap<String, SkipReason>,
    /// Early batch projects feeding a consolidation, deduplicated.
    sources: Vec<PathBuf>,
}

impl WorkList {
    fn build(snapshot: &ProjectStatus, layout: &ArtifactLayout, batch: &Batch, stage: Stage) -> Result<Self> {
        let mut pending = Vec::new();
        let mut done = Vec::new();
        let mut skipped = HashMap::new();
        for id in &batch.members {
            let record = snapshot
                .get(id)
                .ok_or_else(|| PipelineError::UnknownItem(id.clone()))?;
            let current = record.effective_stage();
            if current.is_after(stage) {
                skipped.insert(id.clone(), SkipReason::AlreadyDone(current));
                done.push(record.item.clone());
            } else if current != stage {
                skipped.insert(id.clone(), SkipReason::NotReady(current));
            } else {
                pending.push(record.item.clone());
            }
        }

        let mut sources = Vec::new();
        if !pending.is_empty() {
            match stage {
                Stage::Reconstructed => {
                    for item in &pending {
                        let source = early_project(snapshot, layout, &batch.batch_id, &item.id)?;
                        if !sources.contains(&source) {
                            sources.push(source);
                        }
                    }
                }
                Stage::Consolidated | Stage::Exported => {
                    ensure_readable(&batch.batch_id, &batch.artifact_path)?;
                }
                _ => {}
            }
        }

        Ok(Self {
            pending,
            done,
            skipped,
            sources,
        })
    }

    fn into_result(self, batch: &Batch, stage: Stage, mut deltas: HashMap<String, Delta>) -> StageResult {
        let mut skipped = self.skipped;
        let outcomes = batch
            .members
            .iter()
            .filter_map(|id| {
                let outcome = if let Some(reason) = skipped.remove(id) {
                    MemberOutcome::Skipped(reason)
                } else {
                    match deltas.remove(id)? {
                        Ok(()) => MemberOutcome::Advanced,
                        Err(error) => MemberOutcome::Failed { error },
                    }
                };
                Some((id.clone(), outcome))
            })
            .collect();
        StageResult {
            batch_id: batch.batch_id.clone(),
            stage,
            outcomes,
        }
    }
}

/// The most recently planned early batch project holding `id`.
fn early_project(snapshot: &ProjectStatus, layout: &ArtifactLayout, batch_id: &str, id: &str) -> Result<PathBuf> {
    let Some(record) = snapshot.batches_containing(id, Phase::Early).pop() else {
        return Err(PipelineError::ArtifactUnreadable {
            batch_id: batch_id.to_string(),
            path: layout.batch_projects.clone(),
            reason: format!("no early batch recorded for '{}'", id),
        });
    };
    ensure_readable(&record.batch_id, &record.artifact_path)?;
    Ok(record.artifact_path.clone())
}

fn ensure_readable(batch_id: &str, path: &Path) -> Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(PipelineError::ArtifactUnreadable {
            batch_id: batch_id.to_string(),
            path: path.to_path_buf(),
            reason: "not a file".to_string(),
        }),
        Err(e) => Err(PipelineError::ArtifactUnreadable {
            batch_id: batch_id.to_string(),
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

/// Record outcomes in one load → mutate → save cycle.
fn apply(store: &StatusStore, stage: Stage, next: Stage, deltas: &[(&str, &Delta)]) -> Result<()> {
    store.update(|status| {
        for (id, delta) in deltas {
            match delta {
                Ok(()) => status.advance(id, stage, next)?,
                Err(error) => {
                    warn!(id = %id, %error, "member failed");
                    status.record_failure(id, error)?
                }
            }
        }
        Ok(())
    })
}

fn step_event(stage: Stage, batch: &Batch, id: Option<&str>, step: &str, n: usize, total: usize) -> StageProgressEvent {
    StageProgressEvent::Step {
        stage,
        batch_id: batch.batch_id.clone(),
        id: id.map(str::to_string),
        step: step.to_string(),
        n: n as u64,
        total: total as u64,
    }
}

// ── Per-item transitions ────────────────────────────────────────────────

async fn extract(
    ctx: &StageContext<'_>,
    batch: &Batch,
    pending: &[WorkItem],
    next: Stage,
) -> Result<HashMap<String, Delta>> {
    let mut deltas = HashMap::new();
    for (i, item) in pending.iter().enumerate() {
        ctx.progress.report(step_event(Stage::Discovered, batch, Some(&item.id), "extract", i + 1, pending.len()));
        let frames_dir = ctx.layout.frames_dir(&item.id);
        let delta = match ctx
            .engine
            .extractor
            .extract(item, &frames_dir, ctx.settings.frames_per_transect)
            .await
        {
            Ok(frames) if frames.is_empty() => Err(format!(
                "extract: no frames written to {}",
                frames_dir.display()
            )),
            Ok(frames) => {
                debug!(id = %item.id, frames = frames.len(), "extracted");
                Ok(())
            }
            Err(e) => Err(format!("extract: {:#}", e)),
        };
        apply(ctx.store, Stage::Discovered, next, &[(item.id.as_str(), &delta)])?;
        deltas.insert(item.id.clone(), delta);
    }
    Ok(deltas)
}

async fn export(
    ctx: &StageContext<'_>,
    batch: &Batch,
    pending: &[WorkItem],
    next: Stage,
) -> Result<HashMap<String, Delta>> {
    let project = &batch.artifact_path;
    let exporter = &ctx.engine.exporter;
    let mut deltas = HashMap::new();
    for (i, item) in pending.iter().enumerate() {
        ctx.progress.report(step_event(Stage::Consolidated, batch, Some(&item.id), "export", i + 1, pending.len()));
        let layout = ctx.layout;
        let outcome: anyhow::Result<()> = async {
            exporter
                .export_ortho(item, project, &layout.ortho_dir(&item.id))
                .await
                .context("export_ortho")?;
            exporter
                .export_model(item, project, &layout.model_dir(&item.id))
                .await
                .context("export_model")?;
            exporter
                .export_report(item, project, &layout.report_file(&item.id))
                .await
                .context("export_report")?;
            Ok(())
        }
        .await;
        let delta = outcome.map_err(|e| format!("{:#}", e));
        apply(ctx.store, Stage::Consolidated, next, &[(item.id.as_str(), &delta)])?;
        deltas.insert(item.id.clone(), delta);
    }
    Ok(deltas)
}

async fn publish(
    ctx: &StageContext<'_>,
    batch: &Batch,
    pending: &[WorkItem],
    next: Stage,
) -> Result<HashMap<String, Delta>> {
    let token = ctx
        .settings
        .upload_token
        .as_deref()
        .ok_or_else(|| ConfigError::MissingKey {
            key: "publish.api_token".to_string(),
        })?;
    let publisher = &ctx.engine.publisher;
    let mut deltas = HashMap::new();
    for (i, item) in pending.iter().enumerate() {
        ctx.progress.report(step_event(Stage::Exported, batch, Some(&item.id), "publish", i + 1, pending.len()));
        let layout = ctx.layout;
        let outcome: anyhow::Result<()> = async {
            let decimated = publisher
                .decimate(
                    item,
                    &layout.model_dir(&item.id),
                    ctx.settings.decimated_vertices,
                    &layout.decimated_dir(&item.id),
                )
                .await
                .context("decimate")?;
            let remote_id = publisher
                .upload(item, &decimated, token)
                .await
                .context("upload")?;
            let receipt = PublishReceipt {
                id: item.id.clone(),
                remote_id,
                decimated_model: decimated,
                uploaded_at: Utc::now(),
            };
            write_receipt(&layout.receipt_file(&item.id), &receipt).context("writing receipt")
        }
        .await;
        let delta = outcome.map_err(|e| format!("{:#}", e));
        apply(ctx.store, Stage::Exported, next, &[(item.id.as_str(), &delta)])?;
        deltas.insert(item.id.clone(), delta);
    }
    Ok(deltas)
}

fn write_receipt(path: &Path, receipt: &PublishReceipt) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(receipt)?;
    std::fs::write(path, json)?;
    Ok(())
}

// ── Batch transitions ───────────────────────────────────────────────────

async fn reconstruct(
    ctx: &StageContext<'_>,
    batch: &Batch,
    pending: &[WorkItem],
    next: Stage,
) -> Result<HashMap<String, Delta>> {
    let mut failed: BTreeMap<String, String> = BTreeMap::new();
    let mut members = Vec::new();
    for item in pending {
        let frames_dir = ctx.layout.frames_dir(&item.id);
        if frames_dir.is_dir() {
            members.push(MemberInput {
                item: item.clone(),
                frames_dir,
            });
        } else {
            failed.insert(
                item.id.clone(),
                format!("frames missing at {}", frames_dir.display()),
            );
        }
    }

    let mut job = ReconstructionJob {
        batch_id: batch.batch_id.clone(),
        project_path: batch.artifact_path.clone(),
        members,
        params: ctx.settings.reconstruction.clone(),
    };

    let total = ReconstructionStep::ALL.len();
    for (n, step) in ReconstructionStep::ALL.into_iter().enumerate() {
        if job.members.is_empty() {
            break;
        }
        ctx.progress.report(step_event(Stage::Extracted, batch, None, step.as_str(), n + 1, total));
        match ctx.engine.reconstruction.run_step(step, &job).await {
            Ok(report) => {
                for (id, reason) in report.failed {
                    if job.members.iter().any(|m| m.item.id == id) {
                        failed.insert(id, format!("{}: {}", step, reason));
                    }
                }
            }
            Err(e) => {
                for m in &job.members {
                    failed.insert(m.item.id.clone(), format!("{}: {:#}", step, e));
                }
            }
        }
        job.members.retain(|m| !failed.contains_key(&m.item.id));
        debug!(%step, remaining = job.members.len(), "reconstruction step finished");
    }

    let deltas: HashMap<String, Delta> = pending
        .iter()
        .map(|item| {
            let delta = match failed.remove(&item.id) {
                Some(error) => Err(error),
                None => Ok(()),
            };
            (item.id.clone(), delta)
        })
        .collect();
    apply_batch(ctx.store, Stage::Extracted, next, pending, &deltas)?;
    Ok(deltas)
}

async fn consolidate(
    ctx: &StageContext<'_>,
    batch: &Batch,
    plan: &WorkList,
    next: Stage,
) -> Result<HashMap<String, Delta>> {
    let pending = &plan.pending;
    let site = pending
        .first()
        .map(|item| item.site.clone())
        .unwrap_or_default();
    let job = ConsolidationJob {
        batch_id: batch.batch_id.clone(),
        site,
        project_path: batch.artifact_path.clone(),
        members: pending.clone(),
        consolidated: plan.done.clone(),
        sources: plan.sources.clone(),
    };

    ctx.progress.report(step_event(Stage::Reconstructed, batch, None, "merge_by_site", 1, 1));
    let outcome: Delta = match ctx.engine.consolidator.merge_by_site(&job).await {
        Ok(path) => {
            if path != batch.artifact_path {
                warn!(
                    expected = %batch.artifact_path.display(),
                    actual = %path.display(),
                    "consolidator wrote the site project somewhere else"
                );
            }
            Ok(())
        }
        Err(e) => Err(format!("merge_by_site: {:#}", e)),
    };

    let deltas: HashMap<String, Delta> = pending
        .iter()
        .map(|item| (item.id.clone(), outcome.clone()))
        .collect();
    apply_batch(ctx.store, Stage::Reconstructed, next, pending, &deltas)?;
    Ok(deltas)
}

fn apply_batch(
    store: &StatusStore,
    stage: Stage,
    next: Stage,
    pending: &[WorkItem],
    deltas: &HashMap<String, Delta>,
) -> Result<()> {
    let ordered: Vec<(&str, &Delta)> = pending
        .iter()
        .filter_map(|item| deltas.get(&item.id).map(|d| (item.id.as_str(), d)))
        .collect();
    apply(store, stage, next, &ordered)
}
