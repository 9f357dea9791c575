//! Durable, crash-safe status store.
//!
//! One JSON file per project directory holds every [`StatusRecord`] and
//! every planned [`BatchRecord`]. The file is the only cross-run contract:
//! it stays human-readable, unknown fields are ignored, and fields added
//! after schema version 1 carry serde defaults so older files keep loading.
//!
//! Writes go to a temporary file in the project directory that is then
//! renamed over the previous status file, so a reader sees either the old
//! or the new version and never a torn write.
//!
//! The store assumes a single writer per project directory. Callers run a
//! load → mutate → save cycle ([`StatusStore::update`]) around each change
//! and never hold the file across a long engine call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::models::{Batch, BatchRecord, Phase, Stage, StatusRecord, WorkItem};

pub const STATUS_FILE_NAME: &str = "pipeline-status.json";

/// Highest schema version this build can read.
pub const SCHEMA_VERSION: u32 = 1;

/// In-memory snapshot of a project's status file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectStatus {
    pub schema_version: u32,
    #[serde(default)]
    pub project: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub items: BTreeMap<String, StatusRecord>,
    #[serde(default)]
    pub batches: BTreeMap<String, BatchRecord>,
}

/// What [`ProjectStatus::register`] did with a discovery result.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegisterReport {
    pub added: Vec<String>,
    /// Items still at `Discovered` that picked up new source passes.
    pub extended: Vec<String>,
    /// Items past `Discovered` whose newly found passes were not applied.
    pub late_passes: Vec<String>,
    pub unchanged: usize,
}

impl ProjectStatus {
    pub fn new(project: &str) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            project: project.to_string(),
            created_at: now,
            updated_at: now,
            items: BTreeMap::new(),
            batches: BTreeMap::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&StatusRecord> {
        self.items.get(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &StatusRecord> {
        self.items.values()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn record_mut(&mut self, id: &str) -> Result<&mut StatusRecord> {
        self.items
            .get_mut(id)
            .ok_or_else(|| PipelineError::UnknownItem(id.to_string()))
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Merge a discovery result into the store.
    ///
    /// New items start at `Discovered`. Source paths of an existing item
    /// only change while it has not been extracted yet.
    pub fn register(&mut self, items: Vec<WorkItem>) -> RegisterReport {
        let mut report = RegisterReport::default();
        for item in items {
            match self.items.get_mut(&item.id) {
                None => {
                    report.added.push(item.id.clone());
                    self.items
                        .insert(item.id.clone(), StatusRecord::discovered(item));
                }
                Some(record) => {
                    let new_paths: Vec<PathBuf> = item
                        .source_paths
                        .iter()
                        .filter(|p| !record.item.source_paths.contains(p))
                        .cloned()
                        .collect();
                    if new_paths.is_empty() {
                        report.unchanged += 1;
                    } else if record.effective_stage() == Stage::Discovered {
                        let mut merged = item.source_paths.clone();
                        for old in &record.item.source_paths {
                            if !merged.contains(old) {
                                merged.push(old.clone());
                            }
                        }
                        record.item.source_paths = merged;
                        record.updated_at = Utc::now();
                        report.extended.push(item.id.clone());
                    } else {
                        report.late_passes.push(item.id.clone());
                    }
                }
            }
        }
        self.touch();
        report
    }

    /// Move `id` from `from` to its immediate successor `to`.
    ///
    /// `from` must match the record's current stage (for a failed record,
    /// the stage it resumes from). Anything else is a caller bug and the
    /// record is left untouched.
    pub fn advance(&mut self, id: &str, from: Stage, to: Stage) -> Result<()> {
        let record = self.record_mut(id)?;
        let current = record.effective_stage();
        if current != from || from.next() != Some(to) {
            return Err(PipelineError::InvalidTransition {
                id: id.to_string(),
                from,
                to,
                actual: record.stage,
            });
        }
        record.stage = to;
        record.attempting = None;
        record.attempts = 0;
        record.last_error = None;
        record.updated_at = Utc::now();
        self.touch();
        Ok(())
    }

    /// Mark `id` as failed while producing its next stage.
    ///
    /// The attempted stage is kept so a retry resumes from the stage before
    /// it. Failing an already failed record keeps the original attempt.
    pub fn record_failure(&mut self, id: &str, error: &str) -> Result<()> {
        let record = self.record_mut(id)?;
        let attempting = match record.stage {
            Stage::Failed => record.attempting,
            stage => stage.next(),
        };
        let Some(attempting) = attempting else {
            return Err(PipelineError::InvalidTransition {
                id: id.to_string(),
                from: record.stage,
                to: Stage::Failed,
                actual: record.stage,
            });
        };
        record.stage = Stage::Failed;
        record.attempting = Some(attempting);
        record.attempts += 1;
        record.last_error = Some(error.to_string());
        record.updated_at = Utc::now();
        self.touch();
        Ok(())
    }

    /// Roll `id` back to `target`. Only the recovery controller calls this.
    ///
    /// Returns `false` when the record is not past `target`.
    pub fn regress_to(&mut self, id: &str, target: Stage) -> Result<bool> {
        let record = self.record_mut(id)?;
        if !record.effective_stage().is_after(target) {
            return Ok(false);
        }
        record.stage = target;
        record.attempting = None;
        record.attempts = 0;
        record.last_error = None;
        record.updated_at = Utc::now();
        self.touch();
        Ok(true)
    }

    /// Remember a freshly planned batch and point its members at it.
    ///
    /// Re-planning the same membership yields the same batch id, so this is
    /// an upsert that keeps the original `planned_at`. A site batch replaces
    /// any earlier site batch for the same project file whose members it
    /// all carries over.
    pub fn assign_batch(&mut self, batch: &Batch) -> Result<()> {
        for member in &batch.members {
            if !self.items.contains_key(member) {
                return Err(PipelineError::UnknownItem(member.clone()));
            }
        }
        if batch.phase == Phase::Site {
            let superseded: Vec<String> = self
                .batches
                .values()
                .filter(|b| {
                    b.phase == Phase::Site
                        && b.batch_id != batch.batch_id
                        && b.artifact_path == batch.artifact_path
                        && b.members.iter().all(|m| batch.members.contains(m))
                })
                .map(|b| b.batch_id.clone())
                .collect();
            for old in superseded {
                debug!(old = %old, new = %batch.batch_id, "site batch superseded");
                self.batches.remove(&old);
            }
        }
        for member in &batch.members {
            if let Some(record) = self.items.get_mut(member) {
                record.batch_id = Some(batch.batch_id.clone());
            }
        }
        self.batches
            .entry(batch.batch_id.clone())
            .or_insert_with(|| BatchRecord::from_batch(batch));
        self.touch();
        Ok(())
    }

    pub fn mark_resolved(&mut self, batch_id: &str) {
        if let Some(record) = self.batches.get_mut(batch_id) {
            if record.resolved_at.is_none() {
                record.resolved_at = Some(Utc::now());
            }
        }
        self.touch();
    }

    pub fn remove_batch(&mut self, batch_id: &str) -> Option<BatchRecord> {
        let removed = self.batches.remove(batch_id);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    /// Batches of `phase` that list `id` as a member, oldest plan first.
    pub fn batches_containing(&self, id: &str, phase: Phase) -> Vec<&BatchRecord> {
        let mut found: Vec<&BatchRecord> = self
            .batches
            .values()
            .filter(|b| b.phase == phase && b.members.iter().any(|m| m == id))
            .collect();
        found.sort_by(|a, b| a.planned_at.cmp(&b.planned_at).then(a.batch_id.cmp(&b.batch_id)));
        found
    }

    /// Count of records per stage, in sequence order with `Failed` last.
    pub fn stage_counts(&self) -> Vec<(Stage, usize)> {
        Stage::SEQUENCE
            .iter()
            .chain(std::iter::once(&Stage::Failed))
            .map(|stage| {
                let n = self.items.values().filter(|r| r.stage == *stage).count();
                (*stage, n)
            })
            .collect()
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let corrupt = |reason: String| PipelineError::CorruptState {
            path: path.to_path_buf(),
            reason,
        };

        if self.schema_version > SCHEMA_VERSION {
            return Err(corrupt(format!(
                "schema version {} is newer than supported version {}",
                self.schema_version, SCHEMA_VERSION
            )));
        }

        for (key, record) in &self.items {
            if key != record.id() {
                return Err(corrupt(format!(
                    "item key '{}' does not match record id '{}'",
                    key,
                    record.id()
                )));
            }
            if record.stage == Stage::Failed {
                match record.attempting {
                    Some(s) if s.prev().is_some() => {}
                    _ => {
                        return Err(corrupt(format!(
                            "failed item '{}' has no valid attempted stage",
                            key
                        )))
                    }
                }
            }
        }

        for (key, batch) in &self.batches {
            if key != &batch.batch_id {
                return Err(corrupt(format!(
                    "batch key '{}' does not match batch id '{}'",
                    key, batch.batch_id
                )));
            }
        }
        Ok(())
    }
}

/// Handle on the status file of one project directory.
#[derive(Debug, Clone)]
pub struct StatusStore {
    project_dir: PathBuf,
    path: PathBuf,
}

impl StatusStore {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            path: project_dir.join(STATUS_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn project_name(&self) -> String {
        self.project_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Load the status file. A missing file is an empty, not-yet-started project.
    pub fn load(&self) -> Result<ProjectStatus> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no status file yet");
                return Ok(ProjectStatus::new(&self.project_name()));
            }
            Err(e) => return Err(PipelineError::io(&self.path, e)),
        };

        let status: ProjectStatus =
            serde_json::from_str(&content).map_err(|e| PipelineError::CorruptState {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        status.validate(&self.path)?;
        Ok(status)
    }

    /// Atomically replace the status file with `status`.
    pub fn save(&self, status: &ProjectStatus) -> Result<()> {
        std::fs::create_dir_all(&self.project_dir)
            .map_err(|e| PipelineError::io(&self.project_dir, e))?;

        let mut tmp =
            NamedTempFile::new_in(&self.project_dir).map_err(|e| PipelineError::io(&self.project_dir, e))?;
        let json = serde_json::to_string_pretty(status)
            .map_err(|e| PipelineError::io(tmp.path(), std::io::Error::other(e)))?;
        tmp.write_all(json.as_bytes())
            .and_then(|_| tmp.write_all(b"\n"))
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| PipelineError::io(tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| PipelineError::io(&self.path, e.error))?;
        Ok(())
    }

    /// Load, apply `f`, and save only if `f` succeeds.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut ProjectStatus) -> Result<T>,
    {
        let mut status = self.load()?;
        let value = f(&mut status)?;
        self.save(&status)?;
        Ok(value)
    }

    /// Delete the status file (full project reset).
    pub fn remove(&self) -> Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PipelineError::io(&self.path, e)),
        }
    }
}
