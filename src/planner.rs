//! Batch planning.
//!
//! Two pure functions over immutable snapshots:
//!
//! - [`plan_by_count`] chunks work items into near-equal, size-capped
//!   batches for extraction and reconstruction.
//! - [`plan_by_site`] regroups status records by site for consolidation,
//!   export, and publish.
//!
//! Neither function touches the status store. Callers record the result
//! with [`crate::status::ProjectStatus::assign_batch`].
//!
//! Batch ids are derived from membership, so replanning the same input
//! yields the same ids: `b<NNN>-<hash8>` for early batches and
//! `site-<SITE>-<hash8>` for site batches, where `hash8` is the first
//! eight hex digits of SHA-256 over the ordered member ids.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use crate::artifacts::ArtifactLayout;
use crate::error::PipelineError;
use crate::models::{Batch, Phase, Stage, StatusRecord};

/// Chunk `ids` into `ceil(n / max_per_batch)` batches of near-equal size.
///
/// Ids are deduplicated and sorted first, so the result depends only on
/// the set of ids. Batches are numbered from 1.
pub fn plan_by_count<I, S>(ids: I, max_per_batch: usize, layout: &ArtifactLayout) -> Vec<Batch>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    plan_by_count_from(ids, max_per_batch, 1, layout)
}

/// Like [`plan_by_count`], numbering batches from `first_index`.
pub fn plan_by_count_from<I, S>(
    ids: I,
    max_per_batch: usize,
    first_index: usize,
    layout: &ArtifactLayout,
) -> Vec<Batch>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let sorted: Vec<String> = ids
        .into_iter()
        .map(|s| s.as_ref().to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if sorted.is_empty() {
        return Vec::new();
    }

    let max = max_per_batch.max(1);
    let count = sorted.len().div_ceil(max);
    let base = sorted.len() / count;
    let extra = sorted.len() % count;

    let mut batches = Vec::with_capacity(count);
    let mut rest = sorted.as_slice();
    for i in 0..count {
        let size = if i < extra { base + 1 } else { base };
        let (chunk, tail) = rest.split_at(size);
        rest = tail;

        let members = chunk.to_vec();
        let batch_id = format!("b{:03}-{}", first_index + i, membership_hash(&members));
        batches.push(Batch {
            artifact_path: layout.batch_project(&batch_id),
            batch_id,
            phase: Phase::Early,
            members,
        });
    }
    batches
}

/// Result of grouping status records by site.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SitePlan {
    /// One batch per site with at least one eligible item, ordered by site.
    pub batches: Vec<Batch>,
    /// Items not yet at the required stage, with the stage they are at.
    pub ineligible: Vec<(String, Stage)>,
    /// Sites that have both eligible and ineligible items.
    pub incomplete_sites: Vec<String>,
}

impl SitePlan {
    /// The advisory error for incomplete sites, if there are any.
    pub fn check_complete(&self) -> Result<(), PipelineError> {
        if self.incomplete_sites.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::IncompleteSite {
                sites: self.incomplete_sites.clone(),
            })
        }
    }

    /// Batches for complete sites only, plus the names of deferred sites.
    pub fn complete_only(&self) -> (Vec<Batch>, Vec<String>) {
        let batches = self
            .batches
            .iter()
            .filter(|b| {
                !self
                    .incomplete_sites
                    .iter()
                    .any(|site| b.batch_id.starts_with(&format!("site-{}-", site)))
            })
            .cloned()
            .collect();
        (batches, self.incomplete_sites.clone())
    }
}

/// Group records at or past `required_stage` into one batch per site.
///
/// A failed record counts as being at the stage it resumes from. Items
/// that are not yet eligible are reported, never dropped silently.
pub fn plan_by_site<'a, I>(records: I, required_stage: Stage, layout: &ArtifactLayout) -> SitePlan
where
    I: IntoIterator<Item = &'a StatusRecord>,
{
    let mut eligible: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut waiting: BTreeMap<String, Vec<(String, Stage)>> = BTreeMap::new();

    for record in records {
        let stage = record.effective_stage();
        let site = record.item.site.clone();
        if stage.is_at_or_after(required_stage) {
            eligible.entry(site).or_default().insert(record.id().to_string());
        } else {
            waiting
                .entry(site)
                .or_default()
                .push((record.id().to_string(), record.stage));
        }
    }

    let batches = eligible
        .iter()
        .map(|(site, ids)| {
            let members: Vec<String> = ids.iter().cloned().collect();
            Batch {
                batch_id: format!("site-{}-{}", site, membership_hash(&members)),
                phase: Phase::Site,
                artifact_path: layout.site_project(site),
                members,
            }
        })
        .collect();

    let incomplete_sites = waiting
        .keys()
        .filter(|site| eligible.contains_key(*site))
        .cloned()
        .collect();

    let mut ineligible: Vec<(String, Stage)> = waiting.into_values().flatten().collect();
    ineligible.sort_by(|a, b| a.0.cmp(&b.0));

    SitePlan {
        batches,
        ineligible,
        incomplete_sites,
    }
}

fn membership_hash(members: &[String]) -> String {
    let mut hasher = Sha256::new();
    for id in members {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    digest[..4].iter().map(|b| format!("{:02x}", b)).collect()
}
