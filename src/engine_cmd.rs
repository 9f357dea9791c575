//! Collaborators backed by external programs.
//!
//! Every operation maps to a command template from `[engine.commands]`:
//!
//! ```toml
//! [engine.commands.extract]
//! program = "ffmpeg-frames"
//! args = ["--count", "{frame_count}", "--out", "{frames_dir}", "{sources}"]
//! ```
//!
//! Placeholders are substituted per invocation. An argument that is exactly
//! `{sources}` expands to one argument per source video. Batch operations
//! receive a JSON request file through `{request}`, and report per-member
//! failures on stdout as `{"failed": {"<id>": "<reason>"}}`. The upload
//! token is passed in the `TPIPE_UPLOAD_TOKEN` environment variable, never
//! on the command line.
//!
//! A non-zero exit status is an engine failure for the member (or batch).

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::debug;

use crate::config::{CommandTemplate, EngineConfig};
use crate::engine::{
    ConsolidationJob, Consolidator, Exporter, Extractor, Publisher, ReconstructionEngine,
    ReconstructionJob, StepReport,
};
use crate::error::ConfigError;
use crate::models::WorkItem;

/// Operations that need a command template.
pub const OPERATIONS: [&str; 12] = [
    "extract",
    "align",
    "filter",
    "build_mesh",
    "texture",
    "report",
    "merge_by_site",
    "export_ortho",
    "export_model",
    "export_report",
    "decimate",
    "upload",
];

/// Characters of stderr kept in a failure message.
const STDERR_TAIL: usize = 2000;

pub const TOKEN_ENV: &str = "TPIPE_UPLOAD_TOKEN";

fn placeholder() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{([a-z_]+)\}").expect("placeholder pattern is valid"))
}

/// Values substituted into a command template.
#[derive(Debug, Default)]
struct Vars {
    values: BTreeMap<&'static str, Vec<String>>,
}

impl Vars {
    fn for_item(item: &WorkItem) -> Self {
        let mut vars = Self::default();
        vars.set("id", &item.id);
        vars.set("site", &item.site);
        vars.set("transect", &item.transect);
        vars.set("date", item.date.format("%Y-%m-%d"));
        vars.values.insert(
            "sources",
            item.source_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
        );
        vars
    }

    fn set(&mut self, key: &'static str, value: impl ToString) -> &mut Self {
        self.values.insert(key, vec![value.to_string()]);
        self
    }

    fn path(&mut self, key: &'static str, value: &Path) -> &mut Self {
        self.set(key, value.display())
    }

    fn expand(&self, args: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            if let Some(key) = arg.strip_prefix('{').and_then(|a| a.strip_suffix('}')) {
                if let Some(values) = self.values.get(key) {
                    out.extend(values.iter().cloned());
                    continue;
                }
            }
            let expanded = placeholder().replace_all(arg, |caps: &regex::Captures<'_>| {
                match self.values.get(&caps[1]) {
                    Some(values) => values.join(" "),
                    None => caps[0].to_string(),
                }
            });
            out.push(expanded.into_owned());
        }
        out
    }
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    operation: &'a str,
    batch_id: &'a str,
    project: &'a Path,
    members: Vec<RequestMember<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    site: Option<&'a str>,
    /// Ids already merged into the site project.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    consolidated: Vec<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    sources: Vec<&'a Path>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct RequestMember<'a> {
    id: &'a str,
    sources: &'a [PathBuf],
    #[serde(skip_serializing_if = "Option::is_none")]
    frames_dir: Option<&'a Path>,
}

#[derive(Debug, Default, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    failed: BTreeMap<String, String>,
}

pub struct CommandEngine {
    templates: HashMap<String, CommandTemplate>,
}

impl CommandEngine {
    /// Every operation must have a template, so a misconfigured engine
    /// fails before any member is touched.
    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        for op in OPERATIONS {
            if !config.commands.contains_key(op) {
                return Err(ConfigError::MissingKey {
                    key: format!("engine.commands.{}", op),
                });
            }
        }
        Ok(Self {
            templates: config.commands.clone(),
        })
    }

    fn template(&self, op: &str) -> Result<&CommandTemplate> {
        self.templates
            .get(op)
            .ok_or_else(|| anyhow!("no command configured for '{}'", op))
    }

    /// Run the template for `op` and return its stdout.
    async fn invoke(&self, op: &str, vars: &Vars, env: &[(&str, &str)]) -> Result<String> {
        let template = self.template(op)?;
        let args = vars.expand(&template.args);
        debug!(op, program = %template.program, ?args, "running engine command");

        let mut cmd = Command::new(&template.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let output = cmd
            .output()
            .await
            .with_context(|| format!("failed to start '{}' for {}", template.program, op))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .chars()
                .rev()
                .take(STDERR_TAIL)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            bail!(
                "{} exited with {}: {}",
                template.program,
                output.status,
                tail.trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn invoke_batch(&self, op: &str, request: &BatchRequest<'_>) -> Result<BatchResponse> {
        let mut file = NamedTempFile::new().context("creating request file")?;
        serde_json::to_writer_pretty(&mut file, request).context("writing request file")?;
        file.flush().context("writing request file")?;

        let mut vars = Vars::default();
        vars.set("batch_id", request.batch_id)
            .path("project", request.project)
            .path("request", file.path());
        if let Some(site) = request.site {
            vars.set("site", site);
        }

        let stdout = self.invoke(op, &vars, &[]).await?;
        if stdout.trim().is_empty() {
            return Ok(BatchResponse::default());
        }
        serde_json::from_str(stdout.trim())
            .with_context(|| format!("{} printed an unreadable response", op))
    }

    async fn reconstruction_step(&self, op: &str, job: &ReconstructionJob) -> Result<StepReport> {
        let request = BatchRequest {
            operation: op,
            batch_id: &job.batch_id,
            project: &job.project_path,
            members: job
                .members
                .iter()
                .map(|m| RequestMember {
                    id: &m.item.id,
                    sources: &m.item.source_paths,
                    frames_dir: Some(&m.frames_dir),
                })
                .collect(),
            site: None,
            consolidated: Vec::new(),
            sources: Vec::new(),
            params: Some(serde_json::json!({
                "downscale": job.params.downscale,
                "reconstruction_uncertainty": job.params.reconstruction_uncertainty,
                "reprojection_error": job.params.reprojection_error,
                "projection_accuracy": job.params.projection_accuracy,
            })),
        };
        let response = self.invoke_batch(op, &request).await?;
        Ok(StepReport {
            failed: response.failed,
        })
    }

    async fn export(&self, op: &str, item: &WorkItem, project: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
        let mut vars = Vars::for_item(item);
        vars.path("project", project).path("dest", dest);
        self.invoke(op, &vars, &[]).await?;
        Ok(vec![dest.to_path_buf()])
    }
}

/// Last non-empty stdout line, if any.
fn last_line(stdout: &str) -> Option<&str> {
    stdout.lines().map(str::trim).filter(|l| !l.is_empty()).last()
}

#[async_trait]
impl Extractor for CommandEngine {
    async fn extract(&self, item: &WorkItem, frames_dir: &Path, frame_count: u32) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(frames_dir)
            .with_context(|| format!("creating {}", frames_dir.display()))?;
        let mut vars = Vars::for_item(item);
        vars.path("frames_dir", frames_dir).set("frame_count", frame_count);
        self.invoke("extract", &vars, &[]).await?;

        let mut frames: Vec<PathBuf> = std::fs::read_dir(frames_dir)
            .with_context(|| format!("listing {}", frames_dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        frames.sort();
        Ok(frames)
    }
}

#[async_trait]
impl ReconstructionEngine for CommandEngine {
    async fn align(&self, job: &ReconstructionJob) -> Result<StepReport> {
        self.reconstruction_step("align", job).await
    }

    async fn filter(&self, job: &ReconstructionJob) -> Result<StepReport> {
        self.reconstruction_step("filter", job).await
    }

    async fn build_mesh(&self, job: &ReconstructionJob) -> Result<StepReport> {
        self.reconstruction_step("build_mesh", job).await
    }

    async fn texture(&self, job: &ReconstructionJob) -> Result<StepReport> {
        self.reconstruction_step("texture", job).await
    }

    async fn report(&self, job: &ReconstructionJob) -> Result<StepReport> {
        self.reconstruction_step("report", job).await
    }
}

#[async_trait]
impl Consolidator for CommandEngine {
    async fn merge_by_site(&self, job: &ConsolidationJob) -> Result<PathBuf> {
        let request = BatchRequest {
            operation: "merge_by_site",
            batch_id: &job.batch_id,
            project: &job.project_path,
            members: job
                .members
                .iter()
                .map(|m| RequestMember {
                    id: &m.id,
                    sources: &m.source_paths,
                    frames_dir: None,
                })
                .collect(),
            site: Some(&job.site),
            consolidated: job.consolidated.iter().map(|m| m.id.as_str()).collect(),
            sources: job.sources.iter().map(PathBuf::as_path).collect(),
            params: None,
        };
        let response = self.invoke_batch("merge_by_site", &request).await?;
        if let Some((id, reason)) = response.failed.iter().next() {
            bail!("merge_by_site rejected {}: {}", id, reason);
        }
        Ok(job.project_path.clone())
    }
}

#[async_trait]
impl Exporter for CommandEngine {
    async fn export_ortho(&self, item: &WorkItem, project: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
        self.export("export_ortho", item, project, dest).await
    }

    async fn export_model(&self, item: &WorkItem, project: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
        self.export("export_model", item, project, dest).await
    }

    async fn export_report(&self, item: &WorkItem, project: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
        self.export("export_report", item, project, dest).await
    }
}

#[async_trait]
impl Publisher for CommandEngine {
    async fn decimate(
        &self,
        item: &WorkItem,
        model_dir: &Path,
        target_vertices: u64,
        dest: &Path,
    ) -> Result<PathBuf> {
        let mut vars = Vars::for_item(item);
        vars.path("model_dir", model_dir)
            .path("dest", dest)
            .set("target_vertices", target_vertices);
        let stdout = self.invoke("decimate", &vars, &[]).await?;
        Ok(last_line(&stdout)
            .map(PathBuf::from)
            .unwrap_or_else(|| dest.to_path_buf()))
    }

    async fn upload(&self, item: &WorkItem, decimated_model: &Path, token: &str) -> Result<String> {
        let mut vars = Vars::for_item(item);
        vars.path("model", decimated_model);
        let stdout = self.invoke("upload", &vars, &[(TOKEN_ENV, token)]).await?;
        last_line(&stdout)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("upload printed no remote id"))
    }
}
