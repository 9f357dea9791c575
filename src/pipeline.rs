//! Command-level orchestration.
//!
//! Glues the registry, planner, runner, and status store together for one
//! CLI invocation: discover, plan, and run one stage over every batch.
//! Each function prints a short summary on stdout, ending with `ok` when
//! nothing failed.
//!
//! Early stages (extract, reconstruct) run over count-based batches. Items
//! keep the early batch they were first planned into; only items without
//! one are planned, so later discoveries never reshuffle existing batch
//! projects. Late stages (consolidate, export, publish) replan by site on
//! every invocation from the current status snapshot.

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::artifacts::ArtifactLayout;
use crate::config::Config;
use crate::engine::Collaborators;
use crate::models::{Batch, Phase, Stage};
use crate::planner::{plan_by_count_from, plan_by_site};
use crate::progress::{StageProgressEvent, StageProgressReporter};
use crate::registry::{discover, DiscoverOptions};
use crate::runner::{run_stage, MemberOutcome, RunSettings, SkipReason, StageContext, StageResult};
use crate::status::{ProjectStatus, RegisterReport, StatusStore};

/// One project directory with its configuration resolved.
pub struct Project {
    pub dir: PathBuf,
    pub config: Config,
    pub store: StatusStore,
    pub layout: ArtifactLayout,
}

impl Project {
    pub fn open(dir: &Path, config: Config) -> Result<Self> {
        let layout = ArtifactLayout::from_config(dir, &config.paths)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            store: StatusStore::new(dir),
            layout,
            config,
        })
    }

    /// Video source directory, relative paths resolved against the project.
    pub fn video_source(&self) -> PathBuf {
        let source = &self.config.project.video_source;
        if source.is_absolute() {
            source.clone()
        } else {
            self.dir.join(source)
        }
    }
}

/// CLI verb for the transition out of `stage`.
pub fn command_name(stage: Stage) -> &'static str {
    match stage {
        Stage::Discovered => "extract",
        Stage::Extracted => "reconstruct",
        Stage::Reconstructed => "consolidate",
        Stage::Consolidated => "export",
        Stage::Exported => "publish",
        Stage::Published | Stage::Failed => "none",
    }
}

/// Scan the video source and merge the result into the status file.
pub fn run_discover(project: &Project) -> Result<RegisterReport> {
    let source = project.video_source();
    let items = discover(&source, &DiscoverOptions::from_config(&project.config))?;
    let found = items.len();
    let report = project.store.update(|status| {
        if status.project.is_empty() {
            status.project = project.config.project.name.clone();
        }
        Ok(status.register(items))
    })?;

    for id in &report.late_passes {
        warn!(id = %id, "new pass found after extraction started; not added");
    }

    println!("discover {}", source.display());
    println!("  found: {} items", found);
    println!("  added: {}", report.added.len());
    println!("  extended: {}", report.extended.len());
    println!("  unchanged: {}", report.unchanged);
    if !report.late_passes.is_empty() {
        println!("  late passes ignored: {}", report.late_passes.join(", "));
    }
    println!("ok");
    Ok(report)
}

/// Batches a stage would run, and what planning had to leave out.
#[derive(Debug, Clone, Default)]
pub struct StagePlan {
    pub batches: Vec<Batch>,
    /// Early batches that are not yet recorded in the status file.
    pub new_batches: usize,
    /// Incomplete sites left out of this run.
    pub deferred_sites: Vec<String>,
    /// Incomplete sites run anyway.
    pub partial_sites: Vec<String>,
    pub ineligible: Vec<(String, Stage)>,
}

/// Plan the batches for the transition out of `stage`, without recording them.
pub fn plan_stage(project: &Project, status: &ProjectStatus, stage: Stage, allow_partial: bool) -> StagePlan {
    match stage.phase() {
        Some(Phase::Early) => plan_early(project, status),
        Some(Phase::Site) => plan_site(project, status, stage, allow_partial),
        None => StagePlan::default(),
    }
}

fn plan_early(project: &Project, status: &ProjectStatus) -> StagePlan {
    let mut existing: Vec<Batch> = status
        .batches
        .values()
        .filter(|b| b.phase == Phase::Early)
        .map(|b| b.to_batch())
        .collect();
    existing.sort_by(|a, b| a.batch_id.cmp(&b.batch_id));

    let unassigned: Vec<&str> = status
        .records()
        .filter(|r| status.batches_containing(r.id(), Phase::Early).is_empty())
        .map(|r| r.id())
        .collect();
    let next_index = existing
        .iter()
        .filter_map(|b| early_index(&b.batch_id))
        .max()
        .unwrap_or(0)
        + 1;
    let fresh = plan_by_count_from(
        unassigned,
        project.config.batching.max_per_batch,
        next_index,
        &project.layout,
    );

    let new_batches = fresh.len();
    existing.extend(fresh);
    StagePlan {
        batches: existing,
        new_batches,
        ..Default::default()
    }
}

/// The `NNN` of an early batch id `b<NNN>-<hash8>`.
fn early_index(batch_id: &str) -> Option<usize> {
    let (number, _) = batch_id.strip_prefix('b')?.split_once('-')?;
    number.parse().ok()
}

fn plan_site(project: &Project, status: &ProjectStatus, stage: Stage, allow_partial: bool) -> StagePlan {
    let plan = plan_by_site(status.records(), stage, &project.layout);
    let allow_partial = allow_partial || project.config.batching.allow_partial_sites;

    if let Err(advisory) = plan.check_complete() {
        if allow_partial {
            warn!("{}; running them with the members that are ready", advisory);
        } else {
            warn!("{}; deferring them until every transect is ready", advisory);
        }
    }

    let (batches, deferred_sites, partial_sites) = if allow_partial {
        (plan.batches.clone(), Vec::new(), plan.incomplete_sites.clone())
    } else {
        let (batches, deferred) = plan.complete_only();
        (batches, deferred, Vec::new())
    };

    StagePlan {
        batches,
        new_batches: 0,
        deferred_sites,
        partial_sites,
        ineligible: plan.ineligible,
    }
}

/// Print the batches `phase` would run, without recording or running anything.
pub fn run_plan(project: &Project, phase: Phase) -> Result<StagePlan> {
    let status = project.store.load()?;
    let stage = match phase {
        Phase::Early => Stage::Discovered,
        Phase::Site => Stage::Reconstructed,
    };
    let plan = plan_stage(project, &status, stage, false);

    println!("plan {}", phase);
    for batch in &plan.batches {
        println!(
            "  {}  {} members  {}",
            batch.batch_id,
            batch.members.len(),
            batch.artifact_path.display()
        );
        for member in &batch.members {
            println!("    {}", member);
        }
    }
    if phase == Phase::Early {
        println!("  new batches: {}", plan.new_batches);
    }
    if !plan.deferred_sites.is_empty() {
        println!("  incomplete sites: {}", plan.deferred_sites.join(", "));
    }
    if !plan.ineligible.is_empty() {
        println!("  not ready: {}", plan.ineligible.len());
    }
    println!("ok");
    Ok(plan)
}

/// Totals over every batch a stage command ran.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub stage: Stage,
    pub results: Vec<StageResult>,
    pub deferred_sites: Vec<String>,
    /// Members held back from this run by a `Failed` record left by an
    /// earlier one, with their last error.
    pub still_failed: Vec<(String, String)>,
}

impl RunSummary {
    pub fn advanced(&self) -> usize {
        self.results.iter().map(StageResult::advanced).sum()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().map(StageResult::failed).sum()
    }

    pub fn skipped(&self) -> usize {
        self.results.iter().map(StageResult::skipped).sum()
    }

    /// Whether any member of the run ended `Failed`, now or earlier.
    pub fn has_failures(&self) -> bool {
        self.failed() > 0 || !self.still_failed.is_empty()
    }

    pub fn failures(&self) -> Vec<(&str, &str)> {
        self.results
            .iter()
            .flat_map(|r| r.outcomes.iter())
            .filter_map(|(id, outcome)| match outcome {
                MemberOutcome::Failed { error } => Some((id.as_str(), error.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn print(&self) {
        println!("{}", command_name(self.stage));
        println!("  batches: {}", self.results.len());
        println!("  advanced: {}", self.advanced());
        println!("  failed: {}", self.failed());
        println!("  skipped: {}", self.skipped());
        if !self.deferred_sites.is_empty() {
            println!("  deferred sites: {}", self.deferred_sites.join(", "));
        }
        if !self.still_failed.is_empty() {
            println!("  still failed: {}", self.still_failed.len());
        }
        if !self.has_failures() {
            println!("ok");
            return;
        }
        for (id, error) in self.failures() {
            println!("  ! {}: {}", id, error);
        }
        for (id, error) in &self.still_failed {
            println!("  ! {}: {} (earlier run)", id, error);
        }
        println!("finished with failures");
    }
}

/// Whether `batch` is already in the status file. A site batch also needs
/// every member pointing at it; early members move on to their site batch.
fn is_recorded(status: &ProjectStatus, batch: &Batch) -> bool {
    if !status.batches.contains_key(&batch.batch_id) {
        return false;
    }
    batch.phase == Phase::Early
        || batch.members.iter().all(|id| {
            status
                .get(id)
                .is_some_and(|r| r.batch_id.as_deref() == Some(batch.batch_id.as_str()))
        })
}

/// Members held back from this stage by a `Failed` record, in batch order.
/// A member that failed at a later stage is already past this one.
fn carried_failures(status: &ProjectStatus, results: &[StageResult]) -> Vec<(String, String)> {
    let mut carried: Vec<(String, String)> = Vec::new();
    for (id, outcome) in results.iter().flat_map(|r| r.outcomes.iter()) {
        let blocked = matches!(outcome, MemberOutcome::Skipped(SkipReason::NotReady(_)));
        if !blocked || carried.iter().any(|(c, _)| c == id) {
            continue;
        }
        if let Some(record) = status.get(id).filter(|r| r.is_failed()) {
            let error = record.last_error.clone().unwrap_or_else(|| "unknown error".to_string());
            carried.push((id.clone(), error));
        }
    }
    carried
}

/// Run the transition out of `stage` over every planned batch.
pub async fn run_stage_command(
    project: &Project,
    stage: Stage,
    engine: &Collaborators,
    progress: &dyn StageProgressReporter,
    allow_partial: bool,
) -> Result<RunSummary> {
    let mut settings = RunSettings::from_config(&project.config);
    if stage == Stage::Exported {
        settings.upload_token = Some(project.config.publish.token()?);
    }

    let (plan, unrecorded) = {
        let status = project.store.load()?;
        let plan = plan_stage(project, &status, stage, allow_partial);
        let unrecorded: Vec<Batch> = plan
            .batches
            .iter()
            .filter(|batch| !is_recorded(&status, batch))
            .cloned()
            .collect();
        (plan, unrecorded)
    };
    if !unrecorded.is_empty() {
        project.store.update(|status| {
            for batch in &unrecorded {
                status.assign_batch(batch)?;
            }
            Ok(())
        })?;
    }
    info!(
        stage = command_name(stage),
        batches = plan.batches.len(),
        recorded = unrecorded.len(),
        "planned"
    );

    let ctx = StageContext {
        store: &project.store,
        layout: &project.layout,
        engine,
        settings: &settings,
        progress,
    };

    let total = plan.batches.len() as u64;
    let mut results = Vec::with_capacity(plan.batches.len());
    for (n, batch) in plan.batches.iter().enumerate() {
        progress.report(StageProgressEvent::Batch {
            stage,
            batch_id: batch.batch_id.clone(),
            n: n as u64 + 1,
            total,
            members: batch.members.len() as u64,
        });
        results.push(run_stage(&ctx, batch, stage).await?);
    }

    let still_failed = {
        let status = project.store.load()?;
        carried_failures(&status, &results)
    };
    let summary = RunSummary {
        stage,
        results,
        deferred_sites: plan.deferred_sites,
        still_failed,
    };
    summary.print();
    Ok(summary)
}
