//! Local stand-in for every collaborator.
//!
//! Writes small placeholder files where the real tools would write frames,
//! projects, and deliverables, so the full state machine can be exercised
//! without a photogrammetry install. Failures are injected per operation
//! and member with `op:id` rules (`align:TCRMP20241014_3D_BWR_T2`), or for
//! a whole batch operation with `op:*`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::artifacts::sidecar;
use crate::engine::{
    ConsolidationJob, Consolidator, Exporter, Extractor, Publisher, ReconstructionEngine,
    ReconstructionJob, StepReport,
};
use crate::models::WorkItem;

/// Frames written per item regardless of the configured count.
const STUB_FRAMES: u32 = 3;

#[derive(Debug, Default)]
pub struct StubEngine {
    failures: HashSet<(String, String)>,
    calls: Mutex<Vec<String>>,
}

impl StubEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `op:id` rules. Malformed rules are rejected.
    pub fn with_rules<I, S>(rules: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut engine = Self::new();
        for rule in rules {
            let rule = rule.as_ref();
            let Some((op, id)) = rule.split_once(':') else {
                bail!("stub failure rule '{}' must look like op:id", rule);
            };
            engine = engine.fail_on(op.trim(), id.trim());
        }
        Ok(engine)
    }

    /// Make `op` fail for member `id` (`*` for the whole batch call).
    pub fn fail_on(mut self, op: &str, id: &str) -> Self {
        self.failures.insert((op.to_string(), id.to_string()));
        self
    }

    /// Every call made so far, as `op:id` (batch calls use the batch id).
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, op: &str, subject: &str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(format!("{}:{}", op, subject));
        }
    }

    fn fails(&self, op: &str, id: &str) -> bool {
        self.failures.contains(&(op.to_string(), id.to_string()))
    }

    fn check_member(&self, op: &str, id: &str) -> Result<()> {
        self.record(op, id);
        if self.fails(op, id) {
            bail!("stub {} failed for {}", op, id);
        }
        Ok(())
    }

    fn batch_step(&self, op: &str, job: &ReconstructionJob) -> Result<StepReport> {
        self.record(op, &job.batch_id);
        if self.fails(op, "*") {
            bail!("stub {} failed for batch {}", op, job.batch_id);
        }
        let mut report = StepReport::ok();
        for id in job.member_ids() {
            if self.fails(op, id) {
                report = report.with_failure(id, &format!("stub {} rejected member", op));
            }
        }
        Ok(report)
    }
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))
}

fn write_project(project: &Path, members: &[&str]) -> Result<()> {
    write_file(project, &members.join("\n"))?;
    std::fs::create_dir_all(sidecar(project))
        .with_context(|| format!("creating {}", sidecar(project).display()))
}

#[async_trait]
impl Extractor for StubEngine {
    async fn extract(&self, item: &WorkItem, frames_dir: &Path, frame_count: u32) -> Result<Vec<PathBuf>> {
        self.check_member("extract", &item.id)?;
        let mut frames = Vec::new();
        for n in 1..=frame_count.min(STUB_FRAMES) {
            let frame = frames_dir.join(format!("{}_{:04}.jpg", item.id, n));
            write_file(&frame, "frame")?;
            frames.push(frame);
        }
        Ok(frames)
    }
}

#[async_trait]
impl ReconstructionEngine for StubEngine {
    async fn align(&self, job: &ReconstructionJob) -> Result<StepReport> {
        let report = self.batch_step("align", job)?;
        write_project(&job.project_path, &job.member_ids())?;
        Ok(report)
    }

    async fn filter(&self, job: &ReconstructionJob) -> Result<StepReport> {
        self.batch_step("filter", job)
    }

    async fn build_mesh(&self, job: &ReconstructionJob) -> Result<StepReport> {
        self.batch_step("build_mesh", job)
    }

    async fn texture(&self, job: &ReconstructionJob) -> Result<StepReport> {
        self.batch_step("texture", job)
    }

    async fn report(&self, job: &ReconstructionJob) -> Result<StepReport> {
        let report = self.batch_step("report", job)?;
        for id in job.member_ids() {
            if !report.failed.contains_key(id) {
                let path = sidecar(&job.project_path).join(format!("{}_report.txt", id));
                write_file(&path, "processing report")?;
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl Consolidator for StubEngine {
    async fn merge_by_site(&self, job: &ConsolidationJob) -> Result<PathBuf> {
        self.record("merge_by_site", &job.batch_id);
        if self.fails("merge_by_site", "*")
            || job.members.iter().any(|m| self.fails("merge_by_site", &m.id))
        {
            bail!("stub merge_by_site failed for site {}", job.site);
        }
        let existing = std::fs::read_to_string(&job.project_path).unwrap_or_default();
        let mut ids: Vec<&str> = existing.lines().filter(|l| !l.is_empty()).collect();
        for id in job
            .consolidated
            .iter()
            .chain(job.members.iter())
            .map(|m| m.id.as_str())
        {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        write_project(&job.project_path, &ids)?;
        Ok(job.project_path.clone())
    }
}

#[async_trait]
impl Exporter for StubEngine {
    async fn export_ortho(&self, item: &WorkItem, _project: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
        self.check_member("export_ortho", &item.id)?;
        let path = dest.join(format!("{}_ortho.tif", item.id));
        write_file(&path, "orthomosaic")?;
        Ok(vec![path])
    }

    async fn export_model(&self, item: &WorkItem, _project: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
        self.check_member("export_model", &item.id)?;
        let path = dest.join(format!("{}.obj", item.id));
        write_file(&path, "model")?;
        Ok(vec![path])
    }

    async fn export_report(&self, item: &WorkItem, _project: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
        self.check_member("export_report", &item.id)?;
        write_file(dest, "report")?;
        Ok(vec![dest.to_path_buf()])
    }
}

#[async_trait]
impl Publisher for StubEngine {
    async fn decimate(
        &self,
        item: &WorkItem,
        _model_dir: &Path,
        target_vertices: u64,
        dest: &Path,
    ) -> Result<PathBuf> {
        self.check_member("decimate", &item.id)?;
        let path = dest.join(format!("{}_{}.obj", item.id, target_vertices));
        write_file(&path, "decimated model")?;
        Ok(path)
    }

    async fn upload(&self, item: &WorkItem, _decimated_model: &Path, token: &str) -> Result<String> {
        self.check_member("upload", &item.id)?;
        if token.is_empty() {
            bail!("empty upload token");
        }
        Ok(format!("stub-{}", item.id.to_ascii_lowercase()))
    }
}
