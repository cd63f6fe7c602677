//! Core domain model types for handoff.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Stage status and run outcome enums
//! - Artifacts and their typed store keys
//! - Run identifiers

mod artifact;
mod ids;
mod status;

pub use artifact::{checksum, Artifact, ArtifactKey, GeneratedArtifact};
pub use ids::{is_valid_identifier, RunId};
pub use status::{RunOutcome, StageStatus};
