//! Work-item registry: turns a directory of source videos into transects.
//!
//! Source files follow a fixed naming grammar:
//!
//! ```text
//! [PREFIX]YYYYMMDD_DEMO_SITE_T<n>[_<pass>|_part<pass>].<ext>
//! TCRMP20241014_3D_BWR_T2.mp4
//! TCRMP20240215_3ddemo_FLC_T5_part2.MOV
//! ```
//!
//! Discovery is a pure scan. Persisting the result is the status store's
//! job (new items enter it as `Discovered` records).

use chrono::NaiveDate;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;
use walkdir::WalkDir;

use crate::config::{Config, MultiPassPolicy};
use crate::error::{PipelineError, Result};
use crate::models::WorkItem;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)^(?P<prefix>[a-z]*)(?P<date>\d{8})_(?P<demo>[a-z0-9]+)_(?P<site>[a-z0-9]+)_(?P<transect>t\d+)(?:_(?:part)?(?P<pass>\d+))?$",
        )
        .expect("transect name pattern is valid")
    })
}

/// Facets parsed out of one source filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransectName {
    /// Identifier shared by every pass of the transect.
    pub base_id: String,
    pub date: NaiveDate,
    pub demographic: String,
    pub site: String,
    pub transect: String,
    pub pass: Option<u32>,
}

/// Parse a file stem (no extension) against the naming grammar.
pub fn parse_transect_name(stem: &str) -> Result<TransectName> {
    let caps = name_pattern()
        .captures(stem)
        .ok_or_else(|| PipelineError::Parse {
            name: stem.to_string(),
            reason: "expected [PREFIX]YYYYMMDD_DEMO_SITE_T<n>[_<pass>]".to_string(),
        })?;

    let date_str = &caps["date"];
    let date = NaiveDate::parse_from_str(date_str, "%Y%m%d").map_err(|_| PipelineError::Parse {
        name: stem.to_string(),
        reason: format!("'{}' is not a valid acquisition date", date_str),
    })?;

    let pass = match caps.name("pass") {
        Some(m) => Some(m.as_str().parse::<u32>().map_err(|_| PipelineError::Parse {
            name: stem.to_string(),
            reason: format!("pass number '{}' is out of range", m.as_str()),
        })?),
        None => None,
    };

    // Every facet is case-folded so `tcrmp..._bwr_t2` and `TCRMP..._BWR_T2` name one transect.
    let prefix = caps["prefix"].to_ascii_uppercase();
    let demographic = caps["demo"].to_ascii_uppercase();
    let site = caps["site"].to_ascii_uppercase();
    let transect = caps["transect"].to_ascii_uppercase();
    let base_id = format!("{}{}_{}_{}_{}", prefix, date_str, demographic, site, transect);

    Ok(TransectName {
        base_id,
        date,
        demographic,
        site,
        transect,
        pass,
    })
}

/// Scan settings derived from configuration.
#[derive(Debug, Clone)]
pub struct DiscoverOptions {
    pub video_globs: Vec<String>,
    pub multi_pass: MultiPassPolicy,
}

impl DiscoverOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            video_globs: config.extraction.video_globs.clone(),
            multi_pass: config.batching.multi_pass,
        }
    }
}

impl Default for DiscoverOptions {
    fn default() -> Self {
        Self {
            video_globs: vec!["*.mp4".to_string(), "*.mov".to_string()],
            multi_pass: MultiPassPolicy::Merge,
        }
    }
}

/// Scan `source_dir` for videos and resolve them into work items, sorted by id.
///
/// Fails with [`PipelineError::Parse`] on the first video whose name does
/// not follow the grammar, and with [`PipelineError::DuplicateId`] when two
/// files resolve to the same item without being distinct passes of it.
pub fn discover(source_dir: &Path, options: &DiscoverOptions) -> Result<Vec<WorkItem>> {
    if !source_dir.is_dir() {
        return Err(PipelineError::io(
            source_dir,
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "video source directory does not exist",
            ),
        ));
    }

    let globs = build_globset(&options.video_globs)?;

    let mut videos = Vec::new();
    for entry in WalkDir::new(source_dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(source_dir).to_path_buf();
            PipelineError::io(path, std::io::Error::other(e.to_string()))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();
        if !globs.is_match(&file_name) {
            debug!(file = %file_name, "ignoring non-video file");
            continue;
        }
        videos.push(entry.path().to_path_buf());
    }

    // Sort for deterministic ordering
    videos.sort();

    let mut parsed = Vec::with_capacity(videos.len());
    for path in videos {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        parsed.push((parse_transect_name(&stem)?, path));
    }

    match options.multi_pass {
        MultiPassPolicy::Merge => merge_passes(parsed),
        MultiPassPolicy::Independent => independent_passes(parsed),
    }
}

fn merge_passes(parsed: Vec<(TransectName, PathBuf)>) -> Result<Vec<WorkItem>> {
    let mut groups: BTreeMap<String, Vec<(TransectName, PathBuf)>> = BTreeMap::new();
    for (name, path) in parsed {
        groups.entry(name.base_id.clone()).or_default().push((name, path));
    }

    let mut items = Vec::with_capacity(groups.len());
    for (id, mut passes) in groups {
        // A file without a pass number sorts as the first pass.
        passes.sort_by_key(|(name, _)| name.pass.map_or(0, |p| u64::from(p) + 1));
        for pair in passes.windows(2) {
            if pair[0].0.pass == pair[1].0.pass {
                return Err(PipelineError::DuplicateId {
                    id,
                    first: pair[0].1.clone(),
                    second: pair[1].1.clone(),
                });
            }
        }

        let first = &passes[0].0;
        items.push(WorkItem {
            id,
            site: first.site.clone(),
            transect: first.transect.clone(),
            date: first.date,
            demographic: first.demographic.clone(),
            pass: None,
            source_paths: passes.iter().map(|(_, p)| p.clone()).collect(),
        });
    }
    Ok(items)
}

fn independent_passes(parsed: Vec<(TransectName, PathBuf)>) -> Result<Vec<WorkItem>> {
    let mut items: BTreeMap<String, WorkItem> = BTreeMap::new();
    for (name, path) in parsed {
        let id = match name.pass {
            Some(pass) => format!("{}_P{}", name.base_id, pass),
            None => name.base_id.clone(),
        };
        if let Some(existing) = items.get(&id) {
            return Err(PipelineError::DuplicateId {
                id,
                first: existing.source_paths[0].clone(),
                second: path,
            });
        }
        items.insert(
            id.clone(),
            WorkItem {
                id,
                site: name.site,
                transect: name.transect,
                date: name.date,
                demographic: name.demographic,
                pass: name.pass,
                source_paths: vec![path],
            },
        );
    }
    Ok(items.into_values().collect())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let invalid = |pattern: &str, reason: String| {
        PipelineError::Config(crate::error::ConfigError::Invalid {
            key: "extraction.video_globs".to_string(),
            reason: format!("'{}': {}", pattern, reason),
        })
    };

    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| invalid(pattern, e.to_string()))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| invalid(&patterns.join(","), e.to_string()))
}
