//! Declared artifact manifest and project directory layout.
//!
//! Every stage writes its outputs under a fixed root. The recovery
//! controller only ever deletes paths this module declares for a stage,
//! and refuses anything that does not sit strictly inside its root.
//!
//! | Stage produced | Artifact | Scope | Default root |
//! |----------------|----------|-------|--------------|
//! | Extracted | `<id>/` frames | item | `processing/frames` |
//! | Reconstructed | `<batch>.psx` + `<batch>.files/` | batch | `processing/psxraw` |
//! | Consolidated | `<SITE>.psx` + `<SITE>.files/` | site batch | `output/psx` |
//! | Exported | `<id>/`, `<id>/`, `<id>.pdf` | item | `output/orthomosaics`, `output/models`, `output/reports` |
//! | Published | `<id>.json`, `<id>/` | item | `output/published` |

use std::path::{Component, Path, PathBuf};

use crate::config::PathsConfig;
use crate::error::{ConfigError, PipelineError, Result};
use crate::models::{Phase, Stage};

const PROJECT_EXTENSION: &str = "psx";
const SIDECAR_EXTENSION: &str = "files";

/// Resolved artifact roots for one project directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    project_dir: PathBuf,
    pub frames: PathBuf,
    pub batch_projects: PathBuf,
    pub site_projects: PathBuf,
    pub orthomosaics: PathBuf,
    pub models: PathBuf,
    pub reports: PathBuf,
    pub published: PathBuf,
}

impl ArtifactLayout {
    /// Layout with every root at its default location.
    pub fn with_defaults(project_dir: &Path) -> Self {
        let p = project_dir;
        Self {
            project_dir: p.to_path_buf(),
            frames: p.join("processing").join("frames"),
            batch_projects: p.join("processing").join("psxraw"),
            site_projects: p.join("output").join("psx"),
            orthomosaics: p.join("output").join("orthomosaics"),
            models: p.join("output").join("models"),
            reports: p.join("output").join("reports"),
            published: p.join("output").join("published"),
        }
    }

    /// Apply `[paths]` overrides. Relative overrides resolve against the
    /// project directory. A root may not be the project directory itself
    /// or one of its ancestors, since a full reset deletes every root.
    pub fn from_config(project_dir: &Path, paths: &PathsConfig) -> Result<Self> {
        let mut layout = Self::with_defaults(project_dir);
        let resolve = |p: &PathBuf| {
            if p.is_absolute() {
                p.clone()
            } else {
                project_dir.join(p)
            }
        };

        let overrides: [(&str, &Option<PathBuf>, &mut PathBuf); 7] = [
            ("paths.frames", &paths.frames, &mut layout.frames),
            ("paths.batch_projects", &paths.batch_projects, &mut layout.batch_projects),
            ("paths.site_projects", &paths.site_projects, &mut layout.site_projects),
            ("paths.orthomosaics", &paths.orthomosaics, &mut layout.orthomosaics),
            ("paths.models", &paths.models, &mut layout.models),
            ("paths.reports", &paths.reports, &mut layout.reports),
            ("paths.published", &paths.published, &mut layout.published),
        ];
        for (key, value, slot) in overrides {
            if let Some(p) = value {
                let root = resolve(p);
                if has_parent_component(&root) || project_dir.starts_with(&root) {
                    return Err(ConfigError::Invalid {
                        key: key.to_string(),
                        reason: format!(
                            "'{}' must be a dedicated directory, not the project directory or above it",
                            root.display()
                        ),
                    }
                    .into());
                }
                *slot = root;
            }
        }
        Ok(layout)
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Every declared root with a short label, in stage order.
    pub fn roots(&self) -> Vec<(&'static str, &Path)> {
        vec![
            ("frames", self.frames.as_path()),
            ("batch_projects", self.batch_projects.as_path()),
            ("site_projects", self.site_projects.as_path()),
            ("orthomosaics", self.orthomosaics.as_path()),
            ("models", self.models.as_path()),
            ("reports", self.reports.as_path()),
            ("published", self.published.as_path()),
        ]
    }

    pub fn frames_dir(&self, id: &str) -> PathBuf {
        self.frames.join(id)
    }

    pub fn batch_project(&self, batch_id: &str) -> PathBuf {
        self.batch_projects
            .join(format!("{}.{}", batch_id, PROJECT_EXTENSION))
    }

    pub fn site_project(&self, site: &str) -> PathBuf {
        self.site_projects
            .join(format!("{}.{}", site, PROJECT_EXTENSION))
    }

    pub fn ortho_dir(&self, id: &str) -> PathBuf {
        self.orthomosaics.join(id)
    }

    pub fn model_dir(&self, id: &str) -> PathBuf {
        self.models.join(id)
    }

    pub fn report_file(&self, id: &str) -> PathBuf {
        self.reports.join(format!("{}.pdf", id))
    }

    pub fn receipt_file(&self, id: &str) -> PathBuf {
        self.published.join(format!("{}.json", id))
    }

    /// Working directory for the decimated upload copy of a model.
    pub fn decimated_dir(&self, id: &str) -> PathBuf {
        self.published.join(id)
    }

    /// Root that holds project files for batches of `phase`.
    pub fn batch_root(&self, phase: Phase) -> &Path {
        match phase {
            Phase::Early => &self.batch_projects,
            Phase::Site => &self.site_projects,
        }
    }

    /// Item-scoped outputs of `stage`, each paired with its root.
    pub fn item_artifacts(&self, stage: Stage, id: &str) -> Vec<(PathBuf, &Path)> {
        match stage {
            Stage::Extracted => vec![(self.frames_dir(id), self.frames.as_path())],
            Stage::Exported => vec![
                (self.ortho_dir(id), self.orthomosaics.as_path()),
                (self.model_dir(id), self.models.as_path()),
                (self.report_file(id), self.reports.as_path()),
            ],
            Stage::Published => vec![
                (self.receipt_file(id), self.published.as_path()),
                (self.decimated_dir(id), self.published.as_path()),
            ],
            _ => Vec::new(),
        }
    }

    /// Files making up one batch project: the project file and its sidecar directory.
    pub fn batch_artifacts(&self, artifact_path: &Path) -> Vec<PathBuf> {
        vec![artifact_path.to_path_buf(), sidecar(artifact_path)]
    }

    /// Fail unless `path` sits strictly inside `root`.
    pub fn ensure_within(&self, path: &Path, root: &Path) -> Result<()> {
        let inside = !has_parent_component(path) && path.starts_with(root) && path != root;
        if inside {
            Ok(())
        } else {
            Err(PipelineError::OutsideArtifactRoot {
                path: path.to_path_buf(),
                root: root.to_path_buf(),
            })
        }
    }

    /// Delete a declared artifact. Returns `false` when it was already gone.
    pub fn remove(&self, path: &Path, root: &Path) -> Result<bool> {
        self.ensure_within(path, root)?;
        remove_path(path)
    }

    /// Delete a whole root directory (full reset only).
    pub fn remove_root(&self, root: &Path) -> Result<bool> {
        if self.project_dir.starts_with(root) {
            return Err(PipelineError::OutsideArtifactRoot {
                path: root.to_path_buf(),
                root: self.project_dir.clone(),
            });
        }
        remove_path(root)
    }
}

/// `<name>.psx` → `<name>.files`
pub fn sidecar(project_file: &Path) -> PathBuf {
    project_file.with_extension(SIDECAR_EXTENSION)
}

fn has_parent_component(path: &Path) -> bool {
    path.components().any(|c| matches!(c, Component::ParentDir))
}

fn remove_path(path: &Path) -> Result<bool> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(PipelineError::io(path, e)),
    };
    let removed = if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    removed.map_err(|e| PipelineError::io(path, e))?;
    Ok(true)
}
