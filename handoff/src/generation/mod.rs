//! Generation port: the external capability that writes a stage's documents.
//!
//! The orchestrator treats a port as a black box that may be slow and may
//! fail. This module provides:
//! - The [`GenerationPort`] trait and its [`GenerationRequest`]
//! - [`CommandGenerationPort`], which delegates to an external process
//! - [`TemplateGenerationPort`], a deterministic offline generator

mod command;
mod port;
mod template;

pub use command::{split_outputs, CommandGenerationPort};
pub use port::{GenerationPort, GenerationRequest};
pub use template::TemplateGenerationPort;
