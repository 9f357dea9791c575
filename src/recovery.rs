//! Reset/Recovery Controller.
//!
//! Rolls work items back to a stage boundary and deletes the artifacts of
//! every later stage. Deletion is driven only by the declared manifest in
//! [`crate::artifacts`]: item-scoped outputs are looked up per stage, and
//! batch project files are found through the batch records in the status
//! file. Nothing at or before the target stage is touched.
//!
//! Every check runs before the first deletion. A reset either fails without
//! side effects or deletes artifacts first and then saves the regressed
//! status, so a crash in between leaves records pointing at stages whose
//! outputs are gone, which the next stage run simply regenerates.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::artifacts::ArtifactLayout;
use crate::error::{PipelineError, Result};
use crate::models::{BatchRecord, Phase, Stage, StatusRecord};
use crate::status::{ProjectStatus, StatusStore};

#[derive(Debug, Clone, Default)]
pub struct ResetOptions {
    /// Restrict the reset to these items. `None` resets every item past the target.
    pub ids: Option<Vec<String>>,
    /// Report what would happen without touching anything.
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetReport {
    pub target: Stage,
    /// Items rolled back, with the stage they were effectively at.
    pub regressed: Vec<(String, Stage)>,
    /// Artifacts deleted (or, on a dry run, that would be deleted).
    pub deleted: Vec<PathBuf>,
    /// Batch projects kept because members outside the reset still need them.
    pub retained: Vec<PathBuf>,
    /// Batch records dropped from the status file.
    pub dropped_batches: Vec<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullResetReport {
    pub removed_roots: Vec<PathBuf>,
    pub status_removed: bool,
    pub dry_run: bool,
}

/// One batch project slated for deletion and the batch records claiming it.
struct BatchArtifact<'a> {
    phase: Phase,
    claimants: Vec<&'a BatchRecord>,
}

/// Roll every item past `target` back to it, deleting later artifacts.
pub fn reset_to(
    store: &StatusStore,
    layout: &ArtifactLayout,
    target: Stage,
    options: &ResetOptions,
) -> Result<ResetReport> {
    if target.position().is_none() {
        return Err(PipelineError::InvalidResetTarget(target));
    }

    let mut status = store.load()?;
    let candidates = select_candidates(&status, target, options.ids.as_deref())?;
    let reset_ids: BTreeSet<&str> = candidates.iter().map(|r| r.id()).collect();

    let mut item_paths: BTreeMap<PathBuf, &Path> = BTreeMap::new();
    let mut batch_paths: BTreeMap<PathBuf, BatchArtifact<'_>> = BTreeMap::new();

    for record in &candidates {
        for stage in stages_to_undo(record, target) {
            for (path, root) in layout.item_artifacts(stage, record.id()) {
                item_paths.insert(path, root);
            }
            for phase in [Phase::Early, Phase::Site] {
                if phase.produces() != stage {
                    continue;
                }
                for batch in status.batches_containing(record.id(), phase) {
                    batch_paths
                        .entry(batch.artifact_path.clone())
                        .or_insert_with(|| BatchArtifact {
                            phase,
                            claimants: claimants_of(&status, &batch.artifact_path),
                        });
                }
            }
        }
    }

    for (path, root) in &item_paths {
        layout.ensure_within(path, root)?;
    }

    let mut deletions: Vec<(PathBuf, &Path)> = item_paths
        .iter()
        .map(|(path, root)| (path.clone(), *root))
        .collect();
    let mut retained = Vec::new();
    let mut dropped: BTreeSet<String> = BTreeSet::new();

    // Every check runs here, before the first deletion below.
    for (path, artifact) in &batch_paths {
        let produced = artifact.phase.produces();
        let still_needed = artifact.claimants.iter().any(|batch| {
            batch.members.iter().any(|m| {
                !reset_ids.contains(m.as_str())
                    && status
                        .get(m)
                        .is_some_and(|r| r.effective_stage().is_at_or_after(produced))
            })
        });
        if still_needed {
            warn!(artifact = %path.display(), "kept: shared with items outside the reset");
            retained.push(path.clone());
            continue;
        }

        let unresolved: Vec<String> = artifact
            .claimants
            .iter()
            .filter(|b| !b.is_resolved() && is_live(&status, b))
            .map(|b| b.batch_id.clone())
            .collect();
        if unresolved.len() > 1 {
            return Err(PipelineError::AmbiguousState {
                artifact: path.clone(),
                batches: unresolved,
            });
        }

        let root = layout.batch_root(artifact.phase);
        for file in layout.batch_artifacts(path) {
            layout.ensure_within(&file, root)?;
            deletions.push((file, root));
        }
        dropped.extend(
            artifact
                .claimants
                .iter()
                .filter(|b| b.members.iter().any(|m| reset_ids.contains(m.as_str())))
                .map(|b| b.batch_id.clone()),
        );
    }

    let regressed: Vec<(String, Stage)> = candidates
        .iter()
        .map(|r| (r.id().to_string(), r.effective_stage()))
        .collect();
    let dropped_batches: Vec<String> = dropped.into_iter().collect();

    let deleted = if options.dry_run {
        deletions
            .iter()
            .filter(|(path, _)| path.exists())
            .map(|(path, _)| path.clone())
            .collect()
    } else {
        let mut deleted = Vec::new();
        for (path, root) in &deletions {
            if layout.remove(path, root)? {
                deleted.push(path.clone());
            }
        }
        deleted
    };

    let report = ResetReport {
        target,
        regressed,
        deleted,
        retained,
        dropped_batches,
        dry_run: options.dry_run,
    };

    if !options.dry_run {
        for batch_id in &report.dropped_batches {
            status.remove_batch(batch_id);
        }
        for (id, _) in &report.regressed {
            status.regress_to(id, target)?;
            let early = status
                .batches_containing(id, Phase::Early)
                .last()
                .map(|b| b.batch_id.clone());
            if let Some(record) = status.items.get_mut(id) {
                if !target.is_after(Stage::Reconstructed) {
                    record.batch_id = early;
                }
            }
        }
        store.save(&status)?;
        info!(
            target = %target,
            regressed = report.regressed.len(),
            deleted = report.deleted.len(),
            "reset complete"
        );
    }

    Ok(report)
}

/// Delete the status file and every declared artifact root.
pub fn reset_full(store: &StatusStore, layout: &ArtifactLayout, dry_run: bool) -> Result<FullResetReport> {
    let roots: BTreeSet<&Path> = layout.roots().into_iter().map(|(_, root)| root).collect();
    let mut removed_roots = Vec::new();

    if dry_run {
        removed_roots.extend(roots.iter().filter(|r| r.exists()).map(|r| r.to_path_buf()));
        return Ok(FullResetReport {
            removed_roots,
            status_removed: store.exists(),
            dry_run,
        });
    }

    for root in roots {
        if layout.remove_root(root)? {
            removed_roots.push(root.to_path_buf());
        }
    }
    let status_removed = store.remove()?;
    info!(roots = removed_roots.len(), status_removed, "full reset complete");
    Ok(FullResetReport {
        removed_roots,
        status_removed,
        dry_run,
    })
}

fn select_candidates<'a>(
    status: &'a ProjectStatus,
    target: Stage,
    ids: Option<&[String]>,
) -> Result<Vec<&'a StatusRecord>> {
    match ids {
        Some(ids) => {
            let mut selected = Vec::new();
            for id in ids {
                let record = status
                    .get(id)
                    .ok_or_else(|| PipelineError::UnknownItem(id.clone()))?;
                if record.effective_stage().is_after(target) && !selected.contains(&record) {
                    selected.push(record);
                }
            }
            Ok(selected)
        }
        None => Ok(status
            .records()
            .filter(|r| r.effective_stage().is_after(target))
            .collect()),
    }
}

/// Stages whose outputs must go: everything after `target` up to the
/// effective stage, plus a failed attempt's partial output.
fn stages_to_undo(record: &StatusRecord, target: Stage) -> Vec<Stage> {
    let upto = match record.attempting {
        Some(attempted) if record.is_failed() => attempted,
        _ => record.effective_stage(),
    };
    Stage::SEQUENCE
        .iter()
        .copied()
        .filter(|s| s.is_after(target) && upto.is_at_or_after(*s))
        .collect()
}

fn claimants_of<'a>(status: &'a ProjectStatus, artifact: &Path) -> Vec<&'a BatchRecord> {
    status
        .batches
        .values()
        .filter(|b| b.artifact_path == artifact)
        .collect()
}

/// A batch some member still points at. Replanned site batches leave the
/// old record behind with no member referring to it.
fn is_live(status: &ProjectStatus, batch: &BatchRecord) -> bool {
    batch.members.iter().any(|m| {
        status
            .get(m)
            .is_some_and(|r| r.batch_id.as_deref() == Some(batch.batch_id.as_str()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Batch, WorkItem};
    use chrono::NaiveDate;
    use tempfile::TempDir;

    struct Project {
        tmp: TempDir,
        store: StatusStore,
        layout: ArtifactLayout,
        status: ProjectStatus,
    }

    impl Project {
        fn new(items: &[(&str, &str, Stage)]) -> Self {
            let tmp = TempDir::new().unwrap();
            let store = StatusStore::new(tmp.path());
            let layout = ArtifactLayout::with_defaults(tmp.path());
            let mut status = ProjectStatus::new("test");
            status.register(
                items
                    .iter()
                    .map(|(id, site, _)| WorkItem {
                        id: id.to_string(),
                        source_paths: vec![PathBuf::from(format!("/videos/{}.mp4", id))],
                        site: site.to_string(),
                        transect: "T1".to_string(),
                        date: NaiveDate::from_ymd_opt(2024, 10, 14).unwrap(),
                        demographic: "3D".to_string(),
                        pass: None,
                    })
                    .collect(),
            );
            for (id, _, stage) in items {
                status.items.get_mut(*id).unwrap().stage = *stage;
            }
            Self {
                tmp,
                store,
                layout,
                status,
            }
        }

        fn batch(&mut self, batch_id: &str, phase: Phase, artifact: PathBuf, members: &[&str], resolved: bool) {
            let batch = Batch {
                batch_id: batch_id.to_string(),
                phase,
                members: members.iter().map(|s| s.to_string()).collect(),
                artifact_path: artifact.clone(),
            };
            self.status.assign_batch(&batch).unwrap();
            if resolved {
                self.status.mark_resolved(batch_id);
            }
            touch(&artifact);
            std::fs::create_dir_all(crate::artifacts::sidecar(&artifact)).unwrap();
        }

        fn save(&self) {
            self.store.save(&self.status).unwrap();
        }
    }

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "x").unwrap();
    }

    fn touch_dir(path: &Path) {
        std::fs::create_dir_all(path).unwrap();
        std::fs::write(path.join("content"), "x").unwrap();
    }

    /// Lay down every artifact an item owns up to `stage`.
    fn item_outputs(layout: &ArtifactLayout, id: &str, stage: Stage) {
        for s in Stage::SEQUENCE.iter().filter(|s| stage.is_at_or_after(**s)) {
            for (path, _) in layout.item_artifacts(*s, id) {
                if path.extension().is_some() {
                    touch(&path);
                } else {
                    touch_dir(&path);
                }
            }
        }
    }

    #[test]
    fn reset_published_item_to_extracted_keeps_frames() {
        let mut p = Project::new(&[("X", "BWR", Stage::Published)]);
        let early = p.layout.batch_project("b001-x");
        let site = p.layout.site_project("BWR");
        p.batch("b001-x", Phase::Early, early.clone(), &["X"], true);
        p.batch("site-BWR-x", Phase::Site, site.clone(), &["X"], true);
        item_outputs(&p.layout, "X", Stage::Published);
        p.save();

        let report = reset_to(&p.store, &p.layout, Stage::Extracted, &ResetOptions::default()).unwrap();
        assert_eq!(report.regressed, vec![("X".to_string(), Stage::Published)]);

        assert!(p.layout.frames_dir("X").join("content").is_file());
        for gone in [
            early.clone(),
            crate::artifacts::sidecar(&early),
            site.clone(),
            p.layout.ortho_dir("X"),
            p.layout.model_dir("X"),
            p.layout.report_file("X"),
            p.layout.receipt_file("X"),
            p.layout.decimated_dir("X"),
        ] {
            assert!(!gone.exists(), "{} should be deleted", gone.display());
            assert!(report.deleted.contains(&gone));
        }

        let status = p.store.load().unwrap();
        let x = status.get("X").unwrap();
        assert_eq!(x.stage, Stage::Extracted);
        assert!(x.batch_id.is_none());
        assert!(status.batches.is_empty());
    }

    #[test]
    fn items_at_or_before_target_are_untouched() {
        let mut p = Project::new(&[
            ("A", "BWR", Stage::Extracted),
            ("B", "BWR", Stage::Reconstructed),
        ]);
        let early = p.layout.batch_project("b001-ab");
        p.batch("b001-ab", Phase::Early, early.clone(), &["A", "B"], false);
        item_outputs(&p.layout, "A", Stage::Extracted);
        item_outputs(&p.layout, "B", Stage::Reconstructed);
        p.save();

        let report = reset_to(&p.store, &p.layout, Stage::Reconstructed, &ResetOptions::default()).unwrap();
        assert!(report.regressed.is_empty());
        assert!(report.deleted.is_empty());
        assert!(early.is_file());
        assert_eq!(p.store.load().unwrap().get("B").unwrap().stage, Stage::Reconstructed);
    }

    #[test]
    fn two_unresolved_claimants_are_ambiguous() {
        let mut p = Project::new(&[
            ("X", "BWR", Stage::Consolidated),
            ("Y", "BWR", Stage::Consolidated),
        ]);
        let site = p.layout.site_project("BWR");
        // Two plans that each claim the site project for different members.
        p.batch("site-BWR-1111", Phase::Site, site.clone(), &["X"], false);
        p.batch("site-BWR-2222", Phase::Site, site.clone(), &["Y"], false);
        p.save();
        let before = std::fs::read(p.store.path()).unwrap();

        let err = reset_to(&p.store, &p.layout, Stage::Reconstructed, &ResetOptions::default()).unwrap_err();
        match err {
            PipelineError::AmbiguousState { artifact, batches } => {
                assert_eq!(artifact, site);
                assert_eq!(batches, vec!["site-BWR-1111".to_string(), "site-BWR-2222".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(site.is_file());
        assert_eq!(std::fs::read(p.store.path()).unwrap(), before);
    }

    #[test]
    fn one_unresolved_claimant_is_not_ambiguous() {
        let mut p = Project::new(&[
            ("X", "BWR", Stage::Consolidated),
            ("Y", "BWR", Stage::Consolidated),
        ]);
        let site = p.layout.site_project("BWR");
        p.batch("site-BWR-1111", Phase::Site, site.clone(), &["X"], true);
        p.batch("site-BWR-2222", Phase::Site, site.clone(), &["Y"], false);
        p.save();

        let report = reset_to(&p.store, &p.layout, Stage::Reconstructed, &ResetOptions::default()).unwrap();
        assert!(!site.exists());
        assert_eq!(report.dropped_batches.len(), 2);
    }

    #[test]
    fn reset_after_failed_merge_of_a_grown_site() {
        let mut p = Project::new(&[
            ("A", "BWR", Stage::Reconstructed),
            ("B", "BWR", Stage::Reconstructed),
            ("C", "BWR", Stage::Discovered),
        ]);
        let site = p.layout.site_project("BWR");

        // The first merge fails for both members.
        p.batch("site-BWR-1111", Phase::Site, site.clone(), &["A", "B"], false);
        p.status.record_failure("A", "merge failed").unwrap();
        p.status.record_failure("B", "merge failed").unwrap();

        // C arrives and catches up; the replanned site batch fails again.
        p.status.items.get_mut("C").unwrap().stage = Stage::Reconstructed;
        p.batch("site-BWR-2222", Phase::Site, site.clone(), &["A", "B", "C"], false);
        for id in ["A", "B", "C"] {
            p.status.record_failure(id, "merge failed").unwrap();
        }
        p.save();

        let report = reset_to(&p.store, &p.layout, Stage::Extracted, &ResetOptions::default()).unwrap();
        assert!(!site.exists());
        assert_eq!(report.regressed.len(), 3);
        let status = p.store.load().unwrap();
        assert!(status.batches.is_empty());
        for id in ["A", "B", "C"] {
            assert_eq!(status.get(id).unwrap().stage, Stage::Extracted);
        }
    }

    #[test]
    fn stale_site_batch_does_not_make_reset_ambiguous() {
        let mut p = Project::new(&[
            ("A", "BWR", Stage::Consolidated),
            ("B", "BWR", Stage::Consolidated),
        ]);
        let site = p.layout.site_project("BWR");
        p.batch("site-BWR-2222", Phase::Site, site.clone(), &["A", "B"], false);
        // A record left behind by an earlier plan that no member points at.
        let stale = BatchRecord::from_batch(&Batch {
            batch_id: "site-BWR-1111".to_string(),
            phase: Phase::Site,
            members: vec!["A".to_string()],
            artifact_path: site.clone(),
        });
        p.status.batches.insert(stale.batch_id.clone(), stale);
        p.save();

        let report = reset_to(&p.store, &p.layout, Stage::Reconstructed, &ResetOptions::default()).unwrap();
        assert!(!site.exists());
        assert_eq!(
            report.dropped_batches,
            vec!["site-BWR-1111".to_string(), "site-BWR-2222".to_string()]
        );
    }

    #[test]
    fn selective_reset_keeps_shared_site_project() {
        let mut p = Project::new(&[
            ("A", "BWR", Stage::Exported),
            ("B", "BWR", Stage::Exported),
        ]);
        let site = p.layout.site_project("BWR");
        p.batch("site-BWR-ab", Phase::Site, site.clone(), &["A", "B"], true);
        item_outputs(&p.layout, "A", Stage::Exported);
        item_outputs(&p.layout, "B", Stage::Exported);
        p.save();

        let options = ResetOptions {
            ids: Some(vec!["B".to_string()]),
            dry_run: false,
        };
        let report = reset_to(&p.store, &p.layout, Stage::Reconstructed, &options).unwrap();

        assert_eq!(report.retained, vec![site.clone()]);
        assert!(site.is_file());
        assert!(!p.layout.model_dir("B").exists());
        assert!(p.layout.model_dir("A").exists());

        let status = p.store.load().unwrap();
        assert_eq!(status.get("A").unwrap().stage, Stage::Exported);
        assert_eq!(status.get("B").unwrap().stage, Stage::Reconstructed);
        assert!(status.batches.contains_key("site-BWR-ab"));
    }

    #[test]
    fn failed_item_loses_partial_output_of_attempted_stage() {
        let mut p = Project::new(&[("X", "BWR", Stage::Failed)]);
        p.status.items.get_mut("X").unwrap().attempting = Some(Stage::Exported);
        p.status.items.get_mut("X").unwrap().attempts = 2;
        let site = p.layout.site_project("BWR");
        p.batch("site-BWR-x", Phase::Site, site.clone(), &["X"], false);
        touch_dir(&p.layout.ortho_dir("X"));
        p.save();

        let report = reset_to(&p.store, &p.layout, Stage::Reconstructed, &ResetOptions::default()).unwrap();
        assert_eq!(report.regressed, vec![("X".to_string(), Stage::Consolidated)]);
        assert!(!p.layout.ortho_dir("X").exists());
        assert!(!site.exists());

        let x = p.store.load().unwrap().get("X").unwrap().clone();
        assert_eq!(x.stage, Stage::Reconstructed);
        assert_eq!(x.attempts, 0);
        assert!(x.attempting.is_none());
    }

    #[test]
    fn dry_run_changes_nothing() {
        let mut p = Project::new(&[("X", "BWR", Stage::Exported)]);
        let site = p.layout.site_project("BWR");
        p.batch("site-BWR-x", Phase::Site, site.clone(), &["X"], true);
        item_outputs(&p.layout, "X", Stage::Exported);
        p.save();
        let before = std::fs::read(p.store.path()).unwrap();

        let options = ResetOptions {
            ids: None,
            dry_run: true,
        };
        let report = reset_to(&p.store, &p.layout, Stage::Extracted, &options).unwrap();
        assert!(report.dry_run);
        assert!(report.deleted.contains(&site));
        assert!(report.deleted.contains(&p.layout.report_file("X")));
        assert!(site.exists());
        assert!(p.layout.report_file("X").exists());
        assert_eq!(std::fs::read(p.store.path()).unwrap(), before);
    }

    #[test]
    fn unknown_ids_and_failed_target_are_rejected() {
        let p = Project::new(&[("X", "BWR", Stage::Exported)]);
        p.save();
        let options = ResetOptions {
            ids: Some(vec!["NOPE".to_string()]),
            dry_run: false,
        };
        assert!(matches!(
            reset_to(&p.store, &p.layout, Stage::Extracted, &options),
            Err(PipelineError::UnknownItem(_))
        ));
        assert!(matches!(
            reset_to(&p.store, &p.layout, Stage::Failed, &ResetOptions::default()),
            Err(PipelineError::InvalidResetTarget(Stage::Failed))
        ));
    }

    #[test]
    fn full_reset_removes_roots_and_status_only() {
        let p = Project::new(&[("X", "BWR", Stage::Exported)]);
        item_outputs(&p.layout, "X", Stage::Exported);
        p.save();
        let config = p.tmp.path().join("pipeline.toml");
        std::fs::write(&config, "[project]").unwrap();

        let dry = reset_full(&p.store, &p.layout, true).unwrap();
        assert!(dry.status_removed);
        assert!(p.layout.frames.exists());

        let report = reset_full(&p.store, &p.layout, false).unwrap();
        assert!(report.status_removed);
        assert!(report.removed_roots.contains(&p.layout.frames));
        assert!(!p.layout.frames.exists());
        assert!(!p.layout.reports.exists());
        assert!(!p.store.exists());
        assert!(config.is_file());
    }
}
