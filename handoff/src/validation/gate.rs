//! Structural checks applied to a stage's stored outputs.

use crate::core::Artifact;
use crate::errors::{ValidationError, ValidationIssue};
use crate::registry::StageSpec;
use serde::{Deserialize, Serialize};

/// Minimal structural requirements for an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationRules {
    /// Minimum number of markdown heading lines.
    pub min_sections: usize,
    /// Minimum number of non-whitespace characters.
    pub min_chars: usize,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            min_sections: 1,
            min_chars: 40,
        }
    }
}

impl ValidationRules {
    /// Rules that only reject missing or empty artifacts.
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            min_sections: 0,
            min_chars: 1,
        }
    }

    /// Sets the minimum section count.
    #[must_use]
    pub fn with_min_sections(mut self, min_sections: usize) -> Self {
        self.min_sections = min_sections;
        self
    }

    /// Sets the minimum non-whitespace length.
    #[must_use]
    pub fn with_min_chars(mut self, min_chars: usize) -> Self {
        self.min_chars = min_chars;
        self
    }
}

/// Counts markdown ATX headings (`#` through `######` followed by a space).
///
/// Lines inside fenced code blocks are ignored.
#[must_use]
pub fn count_sections(content: &str) -> usize {
    let mut in_fence = false;
    let mut sections = 0;

    for line in content.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        let hashes = trimmed.chars().take_while(|c| *c == '#').count();
        if (1..=6).contains(&hashes) && trimmed[hashes..].starts_with(' ') {
            sections += 1;
        }
    }

    sections
}

/// Counts characters that are not whitespace.
#[must_use]
pub fn non_whitespace_chars(content: &str) -> usize {
    content.chars().filter(|c| !c.is_whitespace()).count()
}

/// Checks that a stage's declared outputs exist and are structurally sound.
///
/// The gate never retries; a rejected stage is marked failed by the caller.
#[derive(Debug, Clone, Default)]
pub struct ValidationGate {
    defaults: ValidationRules,
}

impl ValidationGate {
    /// Creates a gate with the given default rules.
    #[must_use]
    pub fn new(defaults: ValidationRules) -> Self {
        Self { defaults }
    }

    /// The rules applied to stages without their own.
    #[must_use]
    pub fn defaults(&self) -> ValidationRules {
        self.defaults
    }

    /// Validates the artifacts a stage produced.
    ///
    /// Only declared outputs are checked; extra artifacts are ignored.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] listing every issue found.
    pub fn validate(&self, stage: &StageSpec, produced: &[Artifact]) -> Result<(), ValidationError> {
        let rules = stage.validation.unwrap_or(self.defaults);
        let mut issues = Vec::new();

        for name in &stage.outputs {
            let Some(artifact) = produced.iter().find(|a| &a.name == name) else {
                issues.push(ValidationIssue::MissingArtifact { name: name.clone() });
                continue;
            };

            let chars = non_whitespace_chars(&artifact.content);
            if chars == 0 {
                issues.push(ValidationIssue::EmptyArtifact { name: name.clone() });
                continue;
            }
            if chars < rules.min_chars {
                issues.push(ValidationIssue::TooShort {
                    name: name.clone(),
                    chars,
                    min_chars: rules.min_chars,
                });
            }

            let sections = count_sections(&artifact.content);
            if sections < rules.min_sections {
                issues.push(ValidationIssue::TooFewSections {
                    name: name.clone(),
                    sections,
                    min_sections: rules.min_sections,
                });
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError {
                stage: stage.id.clone(),
                issues,
            })
        }
    }
}
