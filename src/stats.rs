//! Project status overview.
//!
//! Summarizes the status file: how many items sit at each stage, how far
//! each site has progressed, and which items failed and why. Used by
//! `tpipe status` to check a project before the next stage command.

use anyhow::Result;
use std::collections::BTreeMap;

use crate::models::{Phase, Stage};
use crate::pipeline::{command_name, Project};
use crate::status::ProjectStatus;

/// Per-site breakdown of item stages.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SiteStats {
    pub site: String,
    pub items: usize,
    /// Lowest effective stage among the site's items.
    pub slowest: Option<Stage>,
    pub failed: usize,
}

pub fn site_stats(status: &ProjectStatus) -> Vec<SiteStats> {
    let mut sites: BTreeMap<&str, SiteStats> = BTreeMap::new();
    for record in status.records() {
        let entry = sites
            .entry(record.item.site.as_str())
            .or_insert_with(|| SiteStats {
                site: record.item.site.clone(),
                ..Default::default()
            });
        entry.items += 1;
        if record.is_failed() {
            entry.failed += 1;
        }
        let stage = record.effective_stage();
        entry.slowest = match entry.slowest {
            Some(current) if !current.is_after(stage) => Some(current),
            _ => Some(stage),
        };
    }
    sites.into_values().collect()
}

/// Run the status command: load the status file and print a summary.
pub fn run_status(project: &Project) -> Result<()> {
    let status = project.store.load()?;

    println!("Transect Pipeline: Project Status");
    println!("=================================");
    println!();
    println!("  Project:     {}", display_name(&status, project));
    println!("  Status file: {}", project.store.path().display());
    if project.store.exists() {
        println!(
            "  Updated:     {}",
            status.updated_at.format("%Y-%m-%d %H:%M")
        );
    } else {
        println!("  Updated:     never");
    }
    println!();
    println!("  Items:       {}", status.items.len());
    let early = status
        .batches
        .values()
        .filter(|b| b.phase == Phase::Early)
        .count();
    println!(
        "  Batches:     {} early, {} site",
        early,
        status.batches.len() - early
    );

    println!();
    println!("  By stage:");
    for (stage, count) in status.stage_counts() {
        println!("  {:<16} {:>6}", stage.as_str(), count);
    }

    let sites = site_stats(&status);
    if !sites.is_empty() {
        println!();
        println!("  By site:");
        println!(
            "  {:<12} {:>6} {:>7}   {}",
            "SITE", "ITEMS", "FAILED", "NEXT"
        );
        println!("  {}", "-".repeat(44));
        for s in &sites {
            let next = s.slowest.map(command_name).unwrap_or("none");
            println!("  {:<12} {:>6} {:>7}   {}", s.site, s.items, s.failed, next);
        }
    }

    let failed: Vec<_> = status.records().filter(|r| r.is_failed()).collect();
    if !failed.is_empty() {
        println!();
        println!("  Failed:");
        for record in failed {
            let attempting = record.attempting.map(Stage::as_str).unwrap_or("unknown");
            println!(
                "  {}  ({} attempt{} at {})",
                record.id(),
                record.attempts,
                if record.attempts == 1 { "" } else { "s" },
                attempting
            );
            if let Some(error) = &record.last_error {
                println!("      {}", error);
            }
        }
    }

    println!();
    Ok(())
}

fn display_name<'a>(status: &'a ProjectStatus, project: &'a Project) -> &'a str {
    if status.project.is_empty() {
        &project.config.project.name
    } else {
        &status.project
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StatusRecord, WorkItem};
    use chrono::NaiveDate;

    fn item(id: &str, site: &str) -> WorkItem {
        WorkItem {
            id: id.to_string(),
            source_paths: Vec::new(),
            site: site.to_string(),
            transect: "T1".to_string(),
            date: NaiveDate::from_ymd_opt(2023, 5, 1).unwrap(),
            demographic: String::new(),
            pass: None,
        }
    }

    #[test]
    fn site_stats_track_slowest_stage_and_failures() {
        let mut status = ProjectStatus::new("p");
        let mut a = StatusRecord::discovered(item("A", "BWR"));
        a.stage = Stage::Reconstructed;
        let mut b = StatusRecord::discovered(item("B", "BWR"));
        b.stage = Stage::Failed;
        b.attempting = Some(Stage::Extracted);
        let mut c = StatusRecord::discovered(item("C", "CBR"));
        c.stage = Stage::Exported;
        for r in [a, b, c] {
            status.items.insert(r.id().to_string(), r);
        }

        let stats = site_stats(&status);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].site, "BWR");
        assert_eq!(stats[0].items, 2);
        assert_eq!(stats[0].failed, 1);
        assert_eq!(stats[0].slowest, Some(Stage::Discovered));
        assert_eq!(stats[1].slowest, Some(Stage::Exported));
    }
}
