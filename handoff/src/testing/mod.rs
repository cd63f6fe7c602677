//! Testing utilities for handoff pipelines.
//!
//! This module provides:
//! - A scripted generation port with failure scripts and call recording
//! - Document and orchestrator fixtures

mod fixtures;
mod mocks;

pub use fixtures::{fast_config, markdown_document, TestHarness};
pub use mocks::{ScriptedGenerationPort, Step};
