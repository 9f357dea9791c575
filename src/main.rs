//! # Transect Pipeline CLI (`tpipe`)
//!
//! The `tpipe` binary drives a transect project from raw survey videos to
//! published 3D models, one stage per command. Every command reads the
//! project's status file, does its work, and writes the file back, so any
//! command can be interrupted and rerun.
//!
//! ## Usage
//!
//! ```bash
//! tpipe [--config <file>] <command> [PROJECT]
//! ```
//!
//! When `PROJECT` is omitted the project directory is read from stdin.
//! The configuration defaults to `<PROJECT>/pipeline.toml`.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tpipe discover` | Scan the video source and register new transects |
//! | `tpipe extract` | Extract frames for discovered transects |
//! | `tpipe reconstruct` | Align, filter, mesh, texture, and report per batch |
//! | `tpipe consolidate` | Merge reconstructed batches into one project per site |
//! | `tpipe export` | Export orthomosaics, models, and reports |
//! | `tpipe publish` | Decimate and upload exported models |
//! | `tpipe plan <early\|site>` | Show the batches a stage would run |
//! | `tpipe status` | Summarize stage counts, sites, and failures |
//! | `tpipe reset <STAGE\|full>` | Roll items back and delete what they produced |
//!
//! ## Exit codes
//!
//! `0` when everything succeeded, `2` when a stage finished but some items
//! failed, `1` on a fatal error (nothing partial was recorded).

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use transect_pipeline::config::load_config;
use transect_pipeline::engine::Collaborators;
use transect_pipeline::logging::{self, LogFormat};
use transect_pipeline::models::{Phase, Stage};
use transect_pipeline::pipeline::{run_discover, run_plan, run_stage_command, Project};
use transect_pipeline::progress::ProgressMode;
use transect_pipeline::recovery::{reset_full, reset_to, FullResetReport, ResetOptions, ResetReport};
use transect_pipeline::stats::run_status;

/// Configuration file looked up inside the project directory.
const DEFAULT_CONFIG_NAME: &str = "pipeline.toml";

/// Transect Pipeline: batch orchestration for video-to-3D reef transects.
///
/// Each command advances the project by one stage. See
/// `config/pipeline.example.toml` for a full configuration.
#[derive(Parser)]
#[command(
    name = "tpipe",
    about = "Transect Pipeline: batch orchestration for video-to-3D reef transect reconstruction",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `<PROJECT>/pipeline.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Progress on stderr: human, json, or off.
    ///
    /// Defaults to human when stderr is a terminal, otherwise off.
    #[arg(long, global = true, value_parser = ["human", "json", "off"])]
    progress: Option<String>,

    /// Diagnostic log format on stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// More diagnostics (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Scan the video source and register new transects.
    ///
    /// Rerunning only adds what is new; existing items keep their progress.
    Discover { project: Option<PathBuf> },

    /// Extract frames for every discovered transect.
    Extract { project: Option<PathBuf> },

    /// Reconstruct each early batch.
    ///
    /// Runs align, filter, mesh, texture, and report. A member that fails
    /// one step is dropped from the later steps of its batch.
    Reconstruct { project: Option<PathBuf> },

    /// Merge reconstructed batches into one project per site.
    Consolidate {
        project: Option<PathBuf>,

        /// Consolidate sites even when some of their transects are not ready.
        #[arg(long)]
        allow_partial: bool,
    },

    /// Export orthomosaics, models, and reports per transect.
    Export {
        project: Option<PathBuf>,

        #[arg(long)]
        allow_partial: bool,
    },

    /// Decimate exported models and upload them.
    ///
    /// Requires `publish.api_token` or the variable named by `publish.api_token_env`.
    Publish {
        project: Option<PathBuf>,

        #[arg(long)]
        allow_partial: bool,
    },

    /// Show the batches a planning phase would produce, without running them.
    Plan {
        /// `early` (count batches) or `site` (one batch per site).
        phase: Phase,

        project: Option<PathBuf>,
    },

    /// Summarize stage counts, sites, and failures.
    Status { project: Option<PathBuf> },

    /// Roll items back to a stage and delete what they produced after it.
    ///
    /// Shared batch artifacts are kept while any other member still
    /// depends on them. Prompts for confirmation unless `--yes` or
    /// `--dry-run` is given.
    Reset {
        /// Stage to return to (discovered, extracted, reconstructed, ...),
        /// or `full` to remove every artifact root and the status file.
        target: ResetTarget,

        project: Option<PathBuf>,

        /// Only reset these items (comma-separated ids).
        #[arg(long, value_delimiter = ',')]
        ids: Option<Vec<String>>,

        /// Report what would be deleted without touching anything.
        #[arg(long)]
        dry_run: bool,

        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
}

/// What `tpipe reset` rolls back to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ResetTarget {
    Stage(Stage),
    Full,
}

impl std::str::FromStr for ResetTarget {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "full" => Ok(ResetTarget::Full),
            other => other.parse().map(ResetTarget::Stage),
        }
    }
}

impl Commands {
    fn project_arg(&self) -> Option<&Path> {
        match self {
            Commands::Discover { project }
            | Commands::Extract { project }
            | Commands::Reconstruct { project }
            | Commands::Consolidate { project, .. }
            | Commands::Export { project, .. }
            | Commands::Publish { project, .. }
            | Commands::Plan { project, .. }
            | Commands::Status { project }
            | Commands::Reset { project, .. } => project.as_deref(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_format);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let project_dir = match cli.command.project_arg() {
        Some(dir) => dir.to_path_buf(),
        None => prompt_project_dir()?,
    };
    if !project_dir.is_dir() {
        bail!("project directory not found: {}", project_dir.display());
    }

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| project_dir.join(DEFAULT_CONFIG_NAME));
    let config = load_config(&config_path)?;
    let project = Project::open(&project_dir, config)?;

    let progress_mode = match cli.progress.as_deref() {
        Some("human") => ProgressMode::Human,
        Some("json") => ProgressMode::Json,
        Some(_) => ProgressMode::Off,
        None => ProgressMode::default_for_tty(),
    };

    let (stage, allow_partial) = match &cli.command {
        Commands::Discover { .. } => {
            run_discover(&project)?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Plan { phase, .. } => {
            run_plan(&project, *phase)?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Status { .. } => {
            run_status(&project)?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Reset {
            target,
            ids,
            dry_run,
            yes,
            ..
        } => {
            run_reset(&project, *target, ids.clone(), *dry_run, *yes)?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Extract { .. } => (Stage::Discovered, false),
        Commands::Reconstruct { .. } => (Stage::Extracted, false),
        Commands::Consolidate { allow_partial, .. } => (Stage::Reconstructed, *allow_partial),
        Commands::Export { allow_partial, .. } => (Stage::Consolidated, *allow_partial),
        Commands::Publish { allow_partial, .. } => (Stage::Exported, *allow_partial),
    };

    let engine = Collaborators::from_config(&project.config)?;
    let reporter = progress_mode.reporter();
    let summary =
        run_stage_command(&project, stage, &engine, reporter.as_ref(), allow_partial).await?;

    if summary.has_failures() {
        Ok(ExitCode::from(2))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

/// Read the project directory from stdin, as pasted from a file manager.
fn prompt_project_dir() -> Result<PathBuf> {
    eprint!("Project directory: ");
    std::io::stderr().flush().ok();
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read project directory from stdin")?;
    let dir = clean_path_input(&line);
    if dir.is_empty() {
        bail!("no project directory given");
    }
    Ok(PathBuf::from(dir))
}

/// Strip whitespace, surrounding quotes, and a trailing separator.
fn clean_path_input(raw: &str) -> &str {
    let trimmed = raw.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| {
            trimmed
                .strip_prefix('\'')
                .and_then(|s| s.strip_suffix('\''))
        })
        .unwrap_or(trimmed);
    match unquoted.trim_end_matches(['/', '\\']) {
        "" if !unquoted.is_empty() => "/",
        cleaned => cleaned,
    }
}

fn run_reset(
    project: &Project,
    target: ResetTarget,
    ids: Option<Vec<String>>,
    dry_run: bool,
    yes: bool,
) -> Result<()> {
    if !dry_run && !yes {
        let what = match target {
            ResetTarget::Full => "every artifact and the status file".to_string(),
            ResetTarget::Stage(stage) => format!("progress after '{}'", stage),
        };
        if !confirm(&format!(
            "This deletes {} in {}. Type YES to continue: ",
            what,
            project.dir.display()
        ))? {
            println!("reset cancelled");
            return Ok(());
        }
    }

    let target = match target {
        ResetTarget::Full => {
            if ids.is_some() {
                bail!("--ids cannot be combined with a full reset");
            }
            let report = reset_full(&project.store, &project.layout, dry_run)?;
            print_full_reset(&report);
            return Ok(());
        }
        ResetTarget::Stage(stage) => stage,
    };
    let report = reset_to(
        &project.store,
        &project.layout,
        target,
        &ResetOptions { ids, dry_run },
    )?;
    print_reset(&report);
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{}", prompt);
    std::io::stderr().flush().ok();
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read confirmation")?;
    Ok(line.trim() == "YES")
}

fn print_reset(report: &ResetReport) {
    let verb = if report.dry_run { "would delete" } else { "deleted" };
    println!("reset to {}{}", report.target, dry_run_tag(report.dry_run));
    println!("  items: {}", report.regressed.len());
    for (id, from) in &report.regressed {
        println!("    {}  {} -> {}", id, from, report.target);
    }
    println!("  {}: {}", verb, report.deleted.len());
    for path in &report.deleted {
        println!("    {}", path.display());
    }
    if !report.retained.is_empty() {
        println!("  kept (still needed): {}", report.retained.len());
        for path in &report.retained {
            println!("    {}", path.display());
        }
    }
    if !report.dropped_batches.is_empty() {
        println!("  batches dropped: {}", report.dropped_batches.join(", "));
    }
    println!("ok");
}

fn print_full_reset(report: &FullResetReport) {
    let verb = if report.dry_run { "would remove" } else { "removed" };
    println!("reset full{}", dry_run_tag(report.dry_run));
    for root in &report.removed_roots {
        println!("  {} {}", verb, root.display());
    }
    println!(
        "  status file: {}",
        if report.status_removed { verb } else { "absent" }
    );
    println!("ok");
}

fn dry_run_tag(dry_run: bool) -> &'static str {
    if dry_run {
        " (dry run)"
    } else {
        ""
    }
}
