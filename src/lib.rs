//! # Transect Pipeline
//!
//! Batch orchestration for turning underwater survey videos into published
//! 3D reef models.
//!
//! Each transect video becomes a work item that moves through a fixed
//! sequence of stages. Items are processed in batches: count-based batches
//! for frame extraction and reconstruction, one batch per site for
//! consolidation, export, and publishing. Progress is recorded in a single
//! status file per project so every command can be interrupted and rerun.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌────────────┐
//! │  Registry  │──▶│  Planner   │──▶│   Runner   │──▶ engine (external)
//! │ (discover) │   │ count/site │   │ per stage  │
//! └────────────┘   └────────────┘   └─────┬──────┘
//!                                         │
//!                      ┌──────────────────┤
//!                      ▼                  ▼
//!                ┌────────────┐     ┌────────────┐
//!                │   Status   │◀────│  Recovery  │
//!                │   (JSON)   │     │  (reset)   │
//!                └────────────┘     └────────────┘
//! ```
//!
//! ## Stages
//!
//! ```text
//! discovered → extracted → reconstructed → consolidated → exported → published
//! ```
//!
//! Any transition can fail; a failed item remembers the stage it was
//! attempting and is retried by the next run of that stage.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Stages, work items, batches, status records |
//! | [`error`] | Error types |
//! | [`registry`] | Video discovery and filename parsing |
//! | [`status`] | Durable status file |
//! | [`planner`] | Count-based and site-based batch planning |
//! | [`artifacts`] | Artifact directory layout |
//! | [`engine`] | Processing engine traits |
//! | [`engine_cmd`] | Engine backed by external commands |
//! | [`engine_stub`] | Placeholder engine for dry runs and tests |
//! | [`runner`] | Stage execution over one batch |
//! | [`recovery`] | Reset and artifact cleanup |
//! | [`pipeline`] | Command-level orchestration |
//! | [`progress`] | Progress reporting on stderr |
//! | [`stats`] | Project status overview |
//! | [`logging`] | Diagnostic logging setup |

pub mod artifacts;
pub mod config;
pub mod engine;
pub mod engine_cmd;
pub mod engine_stub;
pub mod error;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod planner;
pub mod progress;
pub mod recovery;
pub mod registry;
pub mod runner;
pub mod stats;
pub mod status;
