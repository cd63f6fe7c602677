//! The coordinating loop that drives a pipeline run.

use super::report::{ArtifactRef, ErrorCategory, RunReport, StageFailure, StageReport};
use super::retry::{with_retry, RetryConfig};
use super::run::PipelineRun;
use crate::cancellation::CancellationToken;
use crate::core::{Artifact, GeneratedArtifact, RunId, RunOutcome, StageStatus};
use crate::errors::{DeadlockError, GenerationError, HandoffError};
use crate::events::{self, EventSink, NoOpEventSink};
use crate::generation::{GenerationPort, GenerationRequest};
use crate::registry::{StageRegistry, StageSpec};
use crate::store::ArtifactStore;
use crate::validation::ValidationGate;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Scheduling and retry settings for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Maximum number of stages in flight at once.
    pub max_concurrency: usize,
    /// Retry budget for each generation call.
    pub retry: RetryConfig,
    /// Deadline for a single generation attempt.
    pub call_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            retry: RetryConfig::default(),
            call_timeout: Duration::from_secs(600),
        }
    }
}

impl OrchestratorConfig {
    /// Sets the worker limit. Zero behaves as one.
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the per-attempt deadline.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// A request to execute the stage graph once.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// The run namespace.
    pub run_id: RunId,
    /// Run-level inputs forwarded to every generation call.
    pub inputs: BTreeMap<String, String>,
    /// Run-wide cancellation signal.
    pub cancel: Arc<CancellationToken>,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl RunRequest {
    /// Creates a request with a fresh run id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            run_id: RunId::generate(),
            inputs: BTreeMap::new(),
            cancel: Arc::new(CancellationToken::new()),
        }
    }

    /// Uses a caller-chosen run id.
    #[must_use]
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    /// Adds a run input.
    #[must_use]
    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    /// Shares a cancellation token with the caller.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }
}

/// What a stage task hands back to the coordinator.
#[derive(Debug)]
struct StageTaskResult {
    stage_id: String,
    attempts: u32,
    outcome: Result<Vec<GeneratedArtifact>, GenerationError>,
}

type StageTask = JoinHandle<StageTaskResult>;

/// Drives pipeline runs over one registry, store and generation port.
///
/// The coordinator is the single writer of stage status and the only caller
/// of [`ArtifactStore::put`]; stage tasks only call the generation port.
pub struct Orchestrator {
    registry: Arc<StageRegistry>,
    store: Arc<dyn ArtifactStore>,
    port: Arc<dyn GenerationPort>,
    gate: ValidationGate,
    config: OrchestratorConfig,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("stages", &self.registry.len())
            .field("port", &self.port.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator with default config, gate and a no-op sink.
    #[must_use]
    pub fn new(
        registry: StageRegistry,
        store: Arc<dyn ArtifactStore>,
        port: Arc<dyn GenerationPort>,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            store,
            port,
            gate: ValidationGate::default(),
            config: OrchestratorConfig::default(),
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the scheduling config.
    #[must_use]
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the validation gate.
    #[must_use]
    pub fn with_gate(mut self, gate: ValidationGate) -> Self {
        self.gate = gate;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The stage registry.
    #[must_use]
    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// The artifact store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// The scheduling config.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Executes every stage of the registry once.
    ///
    /// Stage failures are contained: they fail the stage, block its
    /// transitive dependents and are reported in the returned [`RunReport`].
    ///
    /// # Errors
    ///
    /// Returns a [`HandoffError`] for run-level failures (store integrity or
    /// I/O, a panicked stage task). In-flight stages are aborted first;
    /// artifacts already written stay in the store.
    pub async fn run(&self, request: RunRequest) -> Result<RunReport, HandoffError> {
        let started = Instant::now();
        let mut run = PipelineRun::new(request.run_id.clone(), &self.registry);
        let mut failures: Vec<StageFailure> = Vec::new();
        let mut tasks: FuturesUnordered<StageTask> = FuturesUnordered::new();
        let limit = self.config.max_concurrency.max(1);

        info!(
            run_id = %run.run_id(),
            stages = self.registry.len(),
            max_concurrency = limit,
            "Run started"
        );
        self.events
            .emit(
                events::RUN_STARTED,
                Some(json!({
                    "run_id": run.run_id(),
                    "stages": self.registry.topological_order(),
                })),
            )
            .await;

        loop {
            if !request.cancel.is_cancelled() {
                for stage_id in self.registry.runnable_stages(run.statuses()) {
                    if tasks.len() >= limit {
                        break;
                    }
                    match self.dispatch(&mut run, &stage_id, &request).await {
                        Ok(task) => tasks.push(task),
                        Err(e) => return Err(self.abort(&run, &tasks, e).await),
                    }
                }
            }

            let Some(joined) = tasks.next().await else {
                break;
            };
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    let e = HandoffError::Internal(format!("stage task failed: {e}"));
                    return Err(self.abort(&run, &tasks, e).await);
                }
            };
            if let Err(e) = self.apply(&mut run, &mut failures, result).await {
                return Err(self.abort(&run, &tasks, e).await);
            }
        }

        self.finish(run, failures, &request, started).await
    }

    /// Marks a runnable stage `Running` and spawns its generation task.
    async fn dispatch(
        &self,
        run: &mut PipelineRun,
        stage_id: &str,
        request: &RunRequest,
    ) -> Result<StageTask, HandoffError> {
        let spec = self
            .registry
            .get(stage_id)
            .ok_or_else(|| HandoffError::Internal(format!("unknown stage '{stage_id}'")))?;
        let context = self.context_for(run.run_id(), spec)?;

        run.transition(stage_id, StageStatus::Running)?;
        info!(
            run_id = %run.run_id(),
            stage = stage_id,
            role = %spec.role,
            context_artifacts = context.len(),
            "Stage running"
        );
        self.events
            .emit(
                events::STAGE_RUNNING,
                Some(json!({
                    "run_id": run.run_id(),
                    "stage": stage_id,
                    "role": spec.role,
                    "context_artifacts": context.len(),
                })),
            )
            .await;

        let generation = GenerationRequest::new(run.run_id(), spec)
            .with_inputs(request.inputs.clone())
            .with_context(context);
        let span = info_span!("stage", run_id = %run.run_id(), stage = stage_id);
        Ok(tokio::spawn(
            run_stage(
                self.port.clone(),
                self.events.clone(),
                generation,
                request.cancel.clone(),
                self.config,
            )
            .instrument(span),
        ))
    }

    /// Artifacts of the direct dependencies, in declaration order.
    fn context_for(&self, run_id: &RunId, spec: &StageSpec) -> Result<Vec<Artifact>, HandoffError> {
        let mut context = Vec::new();
        for dependency in &spec.dependencies {
            context.extend(self.store.list(run_id, dependency)?);
        }
        Ok(context)
    }

    /// Applies a finished stage task: store, validate, transition.
    async fn apply(
        &self,
        run: &mut PipelineRun,
        failures: &mut Vec<StageFailure>,
        result: StageTaskResult,
    ) -> Result<(), HandoffError> {
        let StageTaskResult {
            stage_id,
            attempts,
            outcome,
        } = result;
        run.record_attempts(&stage_id, attempts);

        let generated = match outcome {
            Ok(generated) => generated,
            Err(e) => {
                let category = if e == GenerationError::Cancelled {
                    ErrorCategory::Cancelled
                } else {
                    ErrorCategory::Generation
                };
                let failure = StageFailure {
                    stage: stage_id,
                    category,
                    message: e.to_string(),
                    attempts,
                    issues: Vec::new(),
                };
                return self.fail(run, failures, failure).await;
            }
        };

        let spec = self
            .registry
            .get(&stage_id)
            .ok_or_else(|| HandoffError::Internal(format!("unknown stage '{stage_id}'")))?;
        for artifact in declared_outputs(spec, generated) {
            self.store
                .put(run.run_id(), &stage_id, &artifact.name, &artifact.content)?;
        }
        let stored = self.store.list(run.run_id(), &stage_id)?;

        match self.gate.validate(spec, &stored) {
            Ok(()) => {
                run.transition(&stage_id, StageStatus::Completed)?;
                info!(
                    run_id = %run.run_id(),
                    stage = %stage_id,
                    attempts,
                    artifacts = stored.len(),
                    "Stage completed"
                );
                let artifacts: Vec<ArtifactRef> = stored.iter().map(ArtifactRef::from).collect();
                self.events
                    .emit(
                        events::STAGE_COMPLETED,
                        Some(json!({
                            "run_id": run.run_id(),
                            "stage": stage_id,
                            "attempts": attempts,
                            "artifacts": artifacts,
                        })),
                    )
                    .await;
                Ok(())
            }
            Err(e) => {
                let failure = StageFailure {
                    stage: stage_id,
                    category: ErrorCategory::Validation,
                    message: e.to_string(),
                    attempts,
                    issues: e.issues,
                };
                self.fail(run, failures, failure).await
            }
        }
    }

    async fn fail(
        &self,
        run: &mut PipelineRun,
        failures: &mut Vec<StageFailure>,
        failure: StageFailure,
    ) -> Result<(), HandoffError> {
        run.transition(&failure.stage, StageStatus::Failed)?;
        let blocked = self.registry.transitive_dependents(&failure.stage);
        warn!(
            run_id = %run.run_id(),
            stage = %failure.stage,
            category = %failure.category,
            attempts = failure.attempts,
            error = %failure.message,
            blocked = ?blocked,
            "Stage failed"
        );
        self.events
            .emit(
                events::STAGE_FAILED,
                Some(json!({
                    "run_id": run.run_id(),
                    "stage": failure.stage,
                    "category": failure.category,
                    "error": failure.message,
                    "attempts": failure.attempts,
                    "blocked": blocked,
                })),
            )
            .await;
        failures.push(failure);
        Ok(())
    }

    /// Tears down in-flight stages after a run-level error.
    async fn abort(
        &self,
        run: &PipelineRun,
        tasks: &FuturesUnordered<StageTask>,
        error: HandoffError,
    ) -> HandoffError {
        for task in tasks.iter() {
            task.abort();
        }
        error!(
            run_id = %run.run_id(),
            in_flight = tasks.len(),
            error = %error,
            "Run aborted"
        );
        self.events
            .emit(
                events::RUN_ABORTED,
                Some(json!({
                    "run_id": run.run_id(),
                    "error": error.to_string(),
                    "in_flight": tasks.len(),
                })),
            )
            .await;
        error
    }

    /// Computes the terminal outcome and builds the report.
    async fn finish(
        &self,
        mut run: PipelineRun,
        failures: Vec<StageFailure>,
        request: &RunRequest,
        started: Instant,
    ) -> Result<RunReport, HandoffError> {
        let order = self.registry.topological_order();
        if let Some(open) = order.iter().find(|id| {
            let status = run.status(id);
            status != StageStatus::Pending && !status.is_terminal()
        }) {
            return Err(HandoffError::Internal(format!(
                "stage '{open}' still {} after dispatch drained",
                run.status(open)
            )));
        }
        let pending: Vec<&String> = order
            .iter()
            .filter(|id| run.status(id) == StageStatus::Pending)
            .collect();

        // Dependents of cancelled stages count as not started, not blocked.
        let blocked_by_failure: HashSet<String> = failures
            .iter()
            .filter(|f| f.category != ErrorCategory::Cancelled)
            .flat_map(|f| self.registry.transitive_dependents(&f.stage))
            .collect();
        let (blocked, not_started): (Vec<String>, Vec<String>) = pending
            .into_iter()
            .cloned()
            .partition(|id| blocked_by_failure.contains(id));

        let cancelled = request
            .cancel
            .is_cancelled()
            .then(|| request.cancel.reason().unwrap_or_default());
        let deadlock = (failures.is_empty() && cancelled.is_none() && !not_started.is_empty())
            .then(|| DeadlockError {
                stuck: not_started.clone(),
            });
        if let Some(deadlock) = &deadlock {
            error!(run_id = %run.run_id(), error = %deadlock, "Run deadlocked");
        }

        let outcome = if run.all_completed() {
            RunOutcome::Completed
        } else {
            RunOutcome::Failed
        };
        run.finish(outcome);

        let final_artifacts = self.final_artifacts(&run)?;
        let stages = order
            .iter()
            .filter_map(|id| self.registry.get(id))
            .map(|spec| StageReport {
                stage: spec.id.clone(),
                role: spec.role.clone(),
                status: run.status(&spec.id),
                attempts: run.attempts(&spec.id),
            })
            .collect();

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let completed = run.count(StageStatus::Completed);
        let report = RunReport {
            run_id: run.run_id().clone(),
            outcome,
            stages,
            failures,
            blocked,
            not_started,
            deadlock,
            cancelled,
            final_artifacts,
            started_at: run.created_at(),
            finished_at: Utc::now(),
            duration_ms,
        };

        let event = if report.is_completed() {
            info!(run_id = %report.run_id, completed, duration_ms, "Run completed");
            events::RUN_COMPLETED
        } else {
            warn!(
                run_id = %report.run_id,
                completed,
                failed = ?report.failed_stages(),
                blocked = ?report.blocked,
                not_started = ?report.not_started,
                "Run failed"
            );
            events::RUN_FAILED
        };
        self.events
            .emit(
                event,
                Some(json!({
                    "run_id": report.run_id,
                    "outcome": report.outcome,
                    "failed": report.failed_stages(),
                    "blocked": report.blocked,
                    "not_started": report.not_started,
                    "duration_ms": duration_ms,
                })),
            )
            .await;

        Ok(report)
    }

    /// Outputs of the synthesis stage, or of every completed sink stage when
    /// the graph has no synthesis stage.
    fn final_artifacts(&self, run: &PipelineRun) -> Result<Vec<ArtifactRef>, HandoffError> {
        let terminal: Vec<&str> = match self.registry.synthesis_stage() {
            Some(spec) => vec![spec.id.as_str()],
            None => self
                .registry
                .topological_order()
                .iter()
                .filter(|id| self.registry.dependents(id).is_empty())
                .map(String::as_str)
                .collect(),
        };

        let mut refs = Vec::new();
        for stage in terminal {
            if run.status(stage) == StageStatus::Completed {
                refs.extend(
                    self.store
                        .list(run.run_id(), stage)?
                        .iter()
                        .map(ArtifactRef::from),
                );
            }
        }
        Ok(refs)
    }
}

/// Keeps the first document for each declared output, in declared order.
fn declared_outputs(spec: &StageSpec, generated: Vec<GeneratedArtifact>) -> Vec<GeneratedArtifact> {
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(spec.outputs.len());
    for artifact in generated {
        if !spec.outputs.contains(&artifact.name) {
            warn!(stage = %spec.id, artifact = %artifact.name, "Dropping undeclared artifact");
        } else if !seen.insert(artifact.name.clone()) {
            warn!(stage = %spec.id, artifact = %artifact.name, "Dropping repeated artifact");
        } else {
            kept.push(artifact);
        }
    }
    kept.sort_by_key(|a| spec.outputs.iter().position(|o| *o == a.name));
    kept
}

/// Body of a stage task: bounded retries, each under the call deadline,
/// raced against run cancellation.
async fn run_stage(
    port: Arc<dyn GenerationPort>,
    sink: Arc<dyn EventSink>,
    request: GenerationRequest,
    cancel: Arc<CancellationToken>,
    config: OrchestratorConfig,
) -> StageTaskResult {
    let attempts = AtomicU32::new(0);
    let timeout = config.call_timeout;

    let outcome = {
        let port = port.as_ref();
        let request = &request;
        let attempts = &attempts;
        let sink = sink.as_ref();

        let generation = with_retry(
            &config.retry,
            move |attempt| {
                attempts.store(attempt, Ordering::SeqCst);
                async move {
                    debug!(attempt, port = port.name(), "Invoking generation port");
                    let call = AssertUnwindSafe(port.generate(request)).catch_unwind();
                    match tokio::time::timeout(timeout, call).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(_)) => Err(GenerationError::Permanent(format!(
                            "generation port '{}' panicked",
                            port.name()
                        ))),
                        Err(_) => Err(GenerationError::Timeout { after: timeout }),
                    }
                }
            },
            move |attempt, error: &GenerationError, delay| {
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                warn!(attempt, delay_ms, error = %error, "Generation attempt failed; retrying");
                sink.try_emit(
                    events::STAGE_RETRYING,
                    Some(json!({
                        "run_id": request.run_id,
                        "stage": request.stage_id,
                        "attempt": attempt,
                        "delay_ms": delay_ms,
                        "error": error.to_string(),
                    })),
                );
            },
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(GenerationError::Cancelled),
            result = generation => result,
        }
    };

    StageTaskResult {
        stage_id: request.stage_id,
        attempts: attempts.load(Ordering::SeqCst),
        outcome,
    }
}
