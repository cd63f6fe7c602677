//! Pipeline configuration loaded from TOML.
//!
//! ```toml
//! [pipeline]
//! name = "research"
//! max_concurrency = 4
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 500
//!
//! [generation]
//! timeout_secs = 600
//! command = ["report-writer", "--stdin"]
//!
//! [[stages]]
//! id = "structure_analysis"
//! role = "data_analyst"
//! outputs = ["report"]
//!
//! [[stages]]
//! id = "final_synthesis"
//! outputs = ["final_sales_report", "executive_dashboard"]
//! synthesis = true
//! ```

use crate::errors::{ConfigError, RegistryError};
use crate::orchestrator::{OrchestratorConfig, RetryConfig};
use crate::registry::{RegistryBuilder, StageRegistry, StageSpec, DEFAULT_ROLE};
use crate::validation::{ValidationGate, ValidationRules};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// The `[pipeline]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSection {
    /// Display name.
    pub name: String,
    /// Maximum number of stages in flight.
    pub max_concurrency: usize,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            name: "handoff".to_string(),
            max_concurrency: 4,
        }
    }
}

/// The `[generation]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GenerationSection {
    /// Deadline for one generation attempt, in seconds.
    pub timeout_secs: u64,
    /// Argv of the external generator, if any.
    pub command: Option<Vec<String>>,
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            command: None,
        }
    }
}

/// One `[[stages]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    /// Stage id.
    pub id: String,
    /// Owning role.
    #[serde(default)]
    pub role: Option<String>,
    /// Direct dependencies.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Declared output artifact names.
    pub outputs: Vec<String>,
    /// Instructions handed to the generation port.
    #[serde(default)]
    pub instructions: String,
    /// Depend on every other stage.
    #[serde(default)]
    pub synthesis: bool,
    /// Stage-specific validation rules.
    #[serde(default)]
    pub validation: Option<ValidationRules>,
}

impl StageConfig {
    fn new(id: &str, role: &str, depends_on: &[&str], outputs: &[&str], instructions: &str) -> Self {
        Self {
            id: id.to_string(),
            role: Some(role.to_string()),
            depends_on: depends_on.iter().map(ToString::to_string).collect(),
            outputs: outputs.iter().map(ToString::to_string).collect(),
            instructions: instructions.to_string(),
            synthesis: false,
            validation: None,
        }
    }

    fn to_spec(&self) -> StageSpec {
        let spec = StageSpec::new(&self.id)
            .with_role(self.role.as_deref().unwrap_or(DEFAULT_ROLE))
            .with_dependencies(self.depends_on.iter().cloned())
            .with_outputs(self.outputs.iter().cloned())
            .with_instructions(&self.instructions);
        match self.validation {
            Some(rules) => spec.with_validation(rules),
            None => spec,
        }
    }
}

/// A complete pipeline definition.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Name and scheduling.
    #[serde(default)]
    pub pipeline: PipelineSection,
    /// Retry policy for generation calls.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Generation backend settings.
    #[serde(default)]
    pub generation: GenerationSection,
    /// Default validation rules.
    #[serde(default)]
    pub validation: ValidationRules,
    /// Stage definitions, in declaration order.
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

impl PipelineConfig {
    /// Parses and checks a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.check()?;
        Ok(config)
    }

    /// Loads a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, and any error
    /// from [`PipelineConfig::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// The research pipeline: data analysis, then sales research, then a
    /// final synthesis.
    #[must_use]
    pub fn builtin() -> Self {
        let summary = ["data_analysis_summary"];
        let mut final_synthesis = StageConfig::new(
            "final_synthesis",
            "strategist",
            &[],
            &["final_sales_report", "executive_dashboard"],
            "Combine every finding into a final sales report with prioritized \
             recommendations, and a one-page executive dashboard of key metrics.",
        );
        final_synthesis.synthesis = true;

        Self {
            pipeline: PipelineSection {
                name: "research".to_string(),
                ..PipelineSection::default()
            },
            stages: vec![
                StageConfig::new(
                    "structure_analysis",
                    "data_analyst",
                    &[],
                    &["report"],
                    "Describe the dataset: columns, types, row counts, missing values and data quality issues.",
                ),
                StageConfig::new(
                    "insurance_metrics",
                    "data_analyst",
                    &["structure_analysis"],
                    &["report"],
                    "Compute the key insurance metrics: premiums, claims, loss ratios and their distributions by segment.",
                ),
                StageConfig::new(
                    "business_insights",
                    "data_analyst",
                    &["structure_analysis"],
                    &["report"],
                    "Identify customer segments, trends and anomalies with business impact.",
                ),
                StageConfig::new(
                    "data_analysis_summary",
                    "data_analyst",
                    &["insurance_metrics", "business_insights"],
                    &["report"],
                    "Summarize the analysis for the sales research team.",
                ),
                StageConfig::new(
                    "market_opportunities",
                    "sales_researcher",
                    &summary,
                    &["report"],
                    "Identify underserved segments and market opportunities.",
                ),
                StageConfig::new(
                    "sales_strategies",
                    "sales_researcher",
                    &summary,
                    &["report"],
                    "Propose sales strategies per segment with expected impact.",
                ),
                StageConfig::new(
                    "sales_intelligence_brief",
                    "sales_researcher",
                    &summary,
                    &["report"],
                    "Write a brief of the intelligence a sales team needs before outreach.",
                ),
                StageConfig::new(
                    "prospect_targeting",
                    "sales_researcher",
                    &summary,
                    &["report"],
                    "Define prospect profiles and targeting criteria.",
                ),
                final_synthesis,
            ],
            ..Self::default()
        }
    }

    /// Checks values the type system does not.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending value.
    pub fn check(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(message.to_string()))
        };
        if self.pipeline.max_concurrency == 0 {
            return invalid("pipeline.max_concurrency must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return invalid("retry.base_delay_ms must not exceed retry.max_delay_ms");
        }
        if self.generation.timeout_secs == 0 {
            return invalid("generation.timeout_secs must be at least 1");
        }
        if self
            .generation
            .command
            .as_ref()
            .is_some_and(|argv| argv.first().map_or(true, |p| p.trim().is_empty()))
        {
            return invalid("generation.command must name a program");
        }
        Ok(())
    }

    /// Builds the validated stage registry.
    ///
    /// # Errors
    ///
    /// Returns any [`RegistryError`] from graph construction.
    pub fn build_registry(&self) -> Result<StageRegistry, RegistryError> {
        self.stages
            .iter()
            .fold(RegistryBuilder::new(), |builder, stage| {
                if stage.synthesis {
                    builder.synthesis(stage.to_spec())
                } else {
                    builder.add(stage.to_spec())
                }
            })
            .build()
    }

    /// Scheduling settings for the orchestrator.
    #[must_use]
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_max_concurrency(self.pipeline.max_concurrency)
            .with_retry(self.retry)
            .with_call_timeout(Duration::from_secs(self.generation.timeout_secs))
    }

    /// The validation gate with the configured defaults.
    #[must_use]
    pub fn gate(&self) -> ValidationGate {
        ValidationGate::new(self.validation)
    }
}
