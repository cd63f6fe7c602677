//! Mock generation ports for testing.

use super::markdown_document;
use crate::core::GeneratedArtifact;
use crate::errors::GenerationError;
use crate::generation::{GenerationPort, GenerationRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// One scripted response for a stage.
#[derive(Debug, Clone)]
pub enum Step {
    /// Return this error.
    Fail(GenerationError),
    /// Return these documents.
    Respond(Vec<GeneratedArtifact>),
    /// Never return (until the call is dropped).
    Hang,
    /// Panic inside the call.
    Panic,
}

/// A generation port driven by per-stage scripts.
///
/// Each call pops the next [`Step`] for its stage. Once a stage's script is
/// exhausted, the port answers with one valid markdown document per
/// declared output.
#[derive(Debug, Default)]
pub struct ScriptedGenerationPort {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    always_fail: HashMap<String, GenerationError>,
    stage_delays: HashMap<String, Duration>,
    delay: Option<Duration>,
    calls: Mutex<HashMap<String, u32>>,
    contexts: Mutex<HashMap<String, Vec<String>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedGenerationPort {
    /// Creates a port that succeeds for every stage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step to a stage's script.
    #[must_use]
    pub fn with_step(self, stage: impl Into<String>, step: Step) -> Self {
        self.scripts
            .lock()
            .entry(stage.into())
            .or_default()
            .push_back(step);
        self
    }

    /// Fails the next `times` calls for a stage with transient errors.
    #[must_use]
    pub fn fail_times(self, stage: &str, times: u32) -> Self {
        (1..=times).fold(self, |port, i| {
            port.with_step(
                stage,
                Step::Fail(GenerationError::failed(format!("scripted failure {i}"))),
            )
        })
    }

    /// Fails every call for a stage with a transient error.
    #[must_use]
    pub fn fail_always(mut self, stage: impl Into<String>) -> Self {
        self.always_fail
            .insert(stage.into(), GenerationError::failed("backend unavailable"));
        self
    }

    /// Fails every call for a stage with a non-retryable error.
    #[must_use]
    pub fn fail_permanently(mut self, stage: impl Into<String>) -> Self {
        self.always_fail.insert(
            stage.into(),
            GenerationError::Permanent("no backend for stage".into()),
        );
        self
    }

    /// Answers the next call for a stage with fixed documents.
    #[must_use]
    pub fn respond_with(self, stage: &str, documents: &[(&str, &str)]) -> Self {
        let documents = documents
            .iter()
            .map(|(name, content)| GeneratedArtifact::new(*name, *content))
            .collect();
        self.with_step(stage, Step::Respond(documents))
    }

    /// Makes the next call for a stage never return.
    #[must_use]
    pub fn hang(self, stage: &str) -> Self {
        self.with_step(stage, Step::Hang)
    }

    /// Makes the next call for a stage panic.
    #[must_use]
    pub fn panic_on(self, stage: &str) -> Self {
        self.with_step(stage, Step::Panic)
    }

    /// Delays every call.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Delays calls for one stage, overriding [`Self::with_delay`].
    #[must_use]
    pub fn with_stage_delay(mut self, stage: impl Into<String>, delay: Duration) -> Self {
        self.stage_delays.insert(stage.into(), delay);
        self
    }

    /// Number of calls made for a stage.
    #[must_use]
    pub fn calls(&self, stage: &str) -> u32 {
        self.calls.lock().get(stage).copied().unwrap_or(0)
    }

    /// Number of calls made across all stages.
    #[must_use]
    pub fn total_calls(&self) -> u32 {
        self.calls.lock().values().sum()
    }

    /// The context text each call for a stage received.
    #[must_use]
    pub fn contexts(&self, stage: &str) -> Vec<String> {
        self.contexts.lock().get(stage).cloned().unwrap_or_default()
    }

    /// Highest number of calls observed in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn default_documents(request: &GenerationRequest) -> Vec<GeneratedArtifact> {
        request
            .outputs
            .iter()
            .map(|name| {
                let body = format!(
                    "Produced by stage {} from {} source document(s).",
                    request.stage_id,
                    request.context.len()
                );
                GeneratedArtifact::new(
                    name,
                    markdown_document(&format!("{} {}", request.stage_id, name), &body),
                )
            })
            .collect()
    }
}

/// Tracks concurrent calls; decrements on drop, including cancellation.
struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl GenerationPort for ScriptedGenerationPort {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<Vec<GeneratedArtifact>, GenerationError> {
        let _in_flight = InFlight::enter(&self.in_flight, &self.max_in_flight);
        let stage = request.stage_id.as_str();
        *self.calls.lock().entry(stage.to_string()).or_insert(0) += 1;
        self.contexts
            .lock()
            .entry(stage.to_string())
            .or_default()
            .push(request.context_text());

        let delay = self.stage_delays.get(stage).copied().or(self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.always_fail.get(stage) {
            return Err(error.clone());
        }
        let step = self.scripts.lock().get_mut(stage).and_then(VecDeque::pop_front);
        match step {
            Some(Step::Fail(error)) => Err(error),
            Some(Step::Respond(documents)) => Ok(documents),
            Some(Step::Hang) => std::future::pending().await,
            Some(Step::Panic) => panic!("scripted panic in stage '{stage}'"),
            None => Ok(Self::default_documents(request)),
        }
    }
}
