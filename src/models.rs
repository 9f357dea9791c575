//! Core data models used throughout the pipeline.
//!
//! These types represent the transects, batches, and per-item status
//! records that flow between the registry, planner, runner, and recovery
//! controller. Everything here is plain data; the invariants on how a
//! [`StatusRecord`] may change live in [`crate::status`].

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// One phase of the fixed processing sequence, plus the `Failed` marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovered,
    Extracted,
    Reconstructed,
    Consolidated,
    Exported,
    Published,
    Failed,
}

impl Stage {
    /// The forward sequence. `Failed` is not part of it.
    pub const SEQUENCE: [Stage; 6] = [
        Stage::Discovered,
        Stage::Extracted,
        Stage::Reconstructed,
        Stage::Consolidated,
        Stage::Exported,
        Stage::Published,
    ];

    pub fn position(self) -> Option<usize> {
        Self::SEQUENCE.iter().position(|s| *s == self)
    }

    /// Immediate successor in the sequence.
    pub fn next(self) -> Option<Stage> {
        self.position()
            .and_then(|i| Self::SEQUENCE.get(i + 1))
            .copied()
    }

    /// Immediate predecessor in the sequence.
    pub fn prev(self) -> Option<Stage> {
        match self.position() {
            Some(i) if i > 0 => Some(Self::SEQUENCE[i - 1]),
            _ => None,
        }
    }

    /// True when both stages are in the sequence and `self` comes later.
    pub fn is_after(self, other: Stage) -> bool {
        match (self.position(), other.position()) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        }
    }

    /// True when both stages are in the sequence and `self` is `other` or later.
    pub fn is_at_or_after(self, other: Stage) -> bool {
        self == other || self.is_after(other)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Discovered => "discovered",
            Stage::Extracted => "extracted",
            Stage::Reconstructed => "reconstructed",
            Stage::Consolidated => "consolidated",
            Stage::Exported => "exported",
            Stage::Published => "published",
            Stage::Failed => "failed",
        }
    }

    /// Planning phase whose batches drive the transition out of this stage.
    pub fn phase(self) -> Option<Phase> {
        match self {
            Stage::Discovered | Stage::Extracted => Some(Phase::Early),
            Stage::Reconstructed | Stage::Consolidated | Stage::Exported => Some(Phase::Site),
            Stage::Published | Stage::Failed => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "discovered" => Ok(Stage::Discovered),
            "extracted" => Ok(Stage::Extracted),
            "reconstructed" => Ok(Stage::Reconstructed),
            "consolidated" => Ok(Stage::Consolidated),
            "exported" => Ok(Stage::Exported),
            "published" => Ok(Stage::Published),
            "failed" => Ok(Stage::Failed),
            other => Err(format!(
                "unknown stage '{}'. Expected one of: discovered, extracted, reconstructed, consolidated, exported, published",
                other
            )),
        }
    }
}

/// Which planning pass produced a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Count-bounded groups used for extraction and reconstruction.
    Early,
    /// One batch per site used for consolidation, export, and publish.
    Site,
}

impl Phase {
    /// The stage whose artifact is the batch's project file.
    pub fn produces(self) -> Stage {
        match self {
            Phase::Early => Stage::Reconstructed,
            Phase::Site => Stage::Consolidated,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Early => f.write_str("early"),
            Phase::Site => f.write_str("site"),
        }
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "early" => Ok(Phase::Early),
            "site" => Ok(Phase::Site),
            other => Err(format!("unknown phase '{}'. Expected early or site", other)),
        }
    }
}

/// One transect: a unit of source footage reconstructed into one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    /// Source videos, ordered by pass number when several passes merge.
    pub source_paths: Vec<PathBuf>,
    pub site: String,
    pub transect: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub demographic: String,
    /// Set only when passes are tracked as independent items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<u32>,
}

/// A group of work items processed together as one engine project file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub batch_id: String,
    pub phase: Phase,
    /// Ordered, unique member ids. Insertion order is planning order.
    pub members: Vec<String>,
    pub artifact_path: PathBuf,
}

/// Durable progress record for one work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    #[serde(flatten)]
    pub item: WorkItem,
    pub stage: Stage,
    /// Stage that was being produced when the item entered `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempting: Option<Stage>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StatusRecord {
    pub fn discovered(item: WorkItem) -> Self {
        Self {
            item,
            stage: Stage::Discovered,
            attempting: None,
            batch_id: None,
            attempts: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.item.id
    }

    /// The last stage this item successfully reached.
    ///
    /// For a failed item this is the stage it will resume from on retry.
    pub fn effective_stage(&self) -> Stage {
        match self.stage {
            Stage::Failed => self
                .attempting
                .and_then(Stage::prev)
                .unwrap_or(Stage::Discovered),
            other => other,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.stage == Stage::Failed
    }
}

/// A planned batch as remembered in the status file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: String,
    pub phase: Phase,
    pub members: Vec<String>,
    pub artifact_path: PathBuf,
    pub planned_at: DateTime<Utc>,
    /// Set once a run over this batch finished with nothing left to do.
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl BatchRecord {
    pub fn from_batch(batch: &Batch) -> Self {
        Self {
            batch_id: batch.batch_id.clone(),
            phase: batch.phase,
            members: batch.members.clone(),
            artifact_path: batch.artifact_path.clone(),
            planned_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    pub fn to_batch(&self) -> Batch {
        Batch {
            batch_id: self.batch_id.clone(),
            phase: self.phase,
            members: self.members.clone(),
            artifact_path: self.artifact_path.clone(),
        }
    }
}
