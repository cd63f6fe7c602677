//! End-to-end scenarios for the orchestrator.

use super::*;
use crate::cancellation::CancellationToken;
use crate::config::PipelineConfig;
use crate::core::{Artifact, RunId, RunOutcome, StageStatus};
use crate::errors::{HandoffError, RegistryError, StoreError, ValidationIssue};
use crate::events;
use crate::generation::TemplateGenerationPort;
use crate::registry::{RegistryBuilder, StageRegistry, StageSpec};
use crate::store::{ArtifactStore, FileArtifactStore, InMemoryArtifactStore};
use crate::testing::{fast_config, markdown_document, ScriptedGenerationPort, TestHarness};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

/// `{a: [], b: [], c: [a, b]}`
fn fan_in() -> StageRegistry {
    RegistryBuilder::new()
        .stage("a", &[], &["doc"])
        .stage("b", &[], &["doc"])
        .stage("c", &["a", "b"], &["doc"])
        .build()
        .unwrap()
}

fn run_id(id: &str) -> RunId {
    RunId::parse(id).unwrap()
}

#[tokio::test]
async fn test_fan_in_completes_after_both_dependencies() {
    let port = Arc::new(ScriptedGenerationPort::new());
    let harness = TestHarness::new(fan_in(), port.clone());

    let report = harness.orchestrator.run(RunRequest::new()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(report.failures.is_empty());
    assert!(report.blocked.is_empty());
    assert_eq!(report.status_of("c"), Some(StageStatus::Completed));
    assert_eq!(port.calls("c"), 1);

    let context = port.contexts("c");
    assert_eq!(context.len(), 1);
    let a = context[0].find("<!-- source: a_doc -->").unwrap();
    let b = context[0].find("<!-- source: b_doc -->").unwrap();
    assert!(a < b);

    let c_running = harness.events.position(events::STAGE_RUNNING, "c").unwrap();
    for dep in ["a", "b"] {
        assert!(harness.events.position(events::STAGE_COMPLETED, dep).unwrap() < c_running);
    }

    let emitted = harness.events.events();
    assert_eq!(emitted.first().unwrap().0, events::RUN_STARTED);
    assert_eq!(emitted.last().unwrap().0, events::RUN_COMPLETED);
}

#[tokio::test]
async fn test_failed_branch_blocks_fan_in() {
    let port = Arc::new(ScriptedGenerationPort::new().fail_always("b"));
    let harness = TestHarness::new(fan_in(), port.clone());

    let report = harness.orchestrator.run(RunRequest::new()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.status_of("a"), Some(StageStatus::Completed));
    assert_eq!(report.status_of("b"), Some(StageStatus::Failed));
    assert_eq!(report.status_of("c"), Some(StageStatus::Pending));
    assert_eq!(report.blocked, vec!["c"]);
    assert!(report.not_started.is_empty());
    assert!(report.deadlock.is_none());

    let failure = report.failure_of("b").unwrap();
    assert_eq!(failure.category, ErrorCategory::Generation);
    assert_eq!(failure.attempts, 3);
    assert_eq!(port.calls("b"), 3);
    assert_eq!(port.calls("c"), 0);

    assert_eq!(harness.events.stages_for(events::STAGE_RETRYING), vec!["b", "b"]);
    assert_eq!(harness.events.events().last().unwrap().0, events::RUN_FAILED);
}

#[tokio::test]
async fn test_panicking_port_fails_only_its_stage() {
    let port = Arc::new(ScriptedGenerationPort::new().panic_on("b"));
    let harness = TestHarness::new(fan_in(), port.clone());

    let report = harness.orchestrator.run(RunRequest::new()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.status_of("a"), Some(StageStatus::Completed));
    assert_eq!(report.status_of("b"), Some(StageStatus::Failed));
    assert_eq!(report.blocked, vec!["c"]);

    let failure = report.failure_of("b").unwrap();
    assert_eq!(failure.category, ErrorCategory::Generation);
    assert_eq!(failure.attempts, 1);
    assert!(failure.message.contains("panicked"));
    assert_eq!(port.calls("b"), 1);
    assert_eq!(port.calls("c"), 0);
}

#[tokio::test]
async fn test_transient_failures_within_budget() {
    let registry = RegistryBuilder::new()
        .stage("a", &[], &["doc"])
        .build()
        .unwrap();
    let port = Arc::new(ScriptedGenerationPort::new().fail_times("a", 2));
    let harness = TestHarness::new(registry, port.clone());

    let report = harness.orchestrator.run(RunRequest::new()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(port.calls("a"), 3);
    assert_eq!(report.attempts_of("a"), 3);
}

#[tokio::test]
async fn test_cycle_rejected_before_any_run() {
    let err = RegistryBuilder::new()
        .stage("a", &["c"], &["doc"])
        .stage("b", &["a"], &["doc"])
        .stage("c", &["b"], &["doc"])
        .build()
        .unwrap_err();

    assert!(matches!(err, RegistryError::CyclicDependency { .. }));
    let err: HandoffError = err.into();
    assert_eq!(err.to_string(), "Cyclic dependency: a -> c -> b -> a");
}

#[tokio::test]
async fn test_failure_blocks_exactly_transitive_dependents() {
    // a -> b -> c -> f, a -> d, e -> f
    let registry = RegistryBuilder::new()
        .stage("a", &[], &["doc"])
        .stage("b", &["a"], &["doc"])
        .stage("c", &["b"], &["doc"])
        .stage("d", &["a"], &["doc"])
        .stage("e", &[], &["doc"])
        .stage("f", &["c", "e"], &["doc"])
        .build()
        .unwrap();
    let port = Arc::new(ScriptedGenerationPort::new().fail_permanently("b"));
    let harness = TestHarness::new(registry, port.clone());

    let report = harness.orchestrator.run(RunRequest::new()).await.unwrap();

    assert_eq!(report.blocked, vec!["c", "f"]);
    for stage in ["a", "d", "e"] {
        assert_eq!(report.status_of(stage), Some(StageStatus::Completed), "{stage}");
    }
    assert_eq!(port.calls("b"), 1);
    assert_eq!(report.failure_of("b").unwrap().attempts, 1);
}

#[tokio::test]
async fn test_validation_failure_is_not_retried_and_keeps_artifacts() {
    let registry = RegistryBuilder::new()
        .stage("a", &[], &["doc"])
        .stage("b", &["a"], &["doc"])
        .build()
        .unwrap();
    let port = Arc::new(ScriptedGenerationPort::new().respond_with("a", &[("doc", "too short")]));
    let harness = TestHarness::new(registry, port.clone());

    let request = RunRequest::new().with_run_id(run_id("audit"));
    let report = harness.orchestrator.run(request).await.unwrap();

    let failure = report.failure_of("a").unwrap();
    assert_eq!(failure.category, ErrorCategory::Validation);
    assert!(matches!(failure.issues[..], [ValidationIssue::TooShort { .. }, ..]));
    assert_eq!(port.calls("a"), 1);
    assert_eq!(report.blocked, vec!["b"]);

    let stored = harness.store.get(&run_id("audit"), "a", "doc").unwrap();
    assert_eq!(stored.content, "too short");
}

#[tokio::test]
async fn test_missing_and_empty_outputs_fail_validation() {
    let registry = RegistryBuilder::new()
        .stage("a", &[], &["report", "dashboard"])
        .stage("b", &[], &["doc"])
        .build()
        .unwrap();
    let report_doc = markdown_document("Report", "Loss ratios improved in every region.");
    let port = Arc::new(
        ScriptedGenerationPort::new()
            .respond_with("a", &[("report", report_doc.as_str())])
            .respond_with("b", &[("doc", "   \n")]),
    );
    let harness = TestHarness::new(registry, port);

    let report = harness.orchestrator.run(RunRequest::new()).await.unwrap();

    assert_eq!(
        report.failure_of("a").unwrap().issues,
        vec![ValidationIssue::MissingArtifact {
            name: "dashboard".into()
        }]
    );
    assert_eq!(
        report.failure_of("b").unwrap().issues,
        vec![ValidationIssue::EmptyArtifact { name: "doc".into() }]
    );
}

#[tokio::test]
async fn test_dependency_order_holds_under_concurrency() {
    let config = PipelineConfig::builtin();
    let registry = config.build_registry().unwrap();
    let port = Arc::new(
        ScriptedGenerationPort::new()
            .with_delay(Duration::from_millis(5))
            .with_stage_delay("insurance_metrics", Duration::from_millis(30))
            .with_stage_delay("sales_strategies", Duration::from_millis(20)),
    );
    let harness = TestHarness::new(registry.clone(), port.clone());

    let report = harness.orchestrator.run(RunRequest::new()).await.unwrap();

    assert!(report.is_completed());
    for spec in registry.stages() {
        let running = harness.events.position(events::STAGE_RUNNING, &spec.id).unwrap();
        for dep in &spec.dependencies {
            let completed = harness.events.position(events::STAGE_COMPLETED, dep).unwrap();
            assert!(completed < running, "{} ran before {dep} completed", spec.id);
        }
    }
    assert!(port.max_in_flight() >= 2);

    let finals: Vec<&str> = report.final_artifacts.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(finals, vec!["final_sales_report", "executive_dashboard"]);
}

#[tokio::test]
async fn test_concurrency_limit_respected() {
    let registry = (0..6)
        .fold(RegistryBuilder::new(), |builder, i| {
            builder.stage(&format!("s{i}"), &[], &["doc"])
        })
        .build()
        .unwrap();
    let port = Arc::new(ScriptedGenerationPort::new().with_delay(Duration::from_millis(20)));
    let harness = TestHarness::with_config(
        registry,
        port.clone(),
        fast_config().with_max_concurrency(2),
    );

    let report = harness.orchestrator.run(RunRequest::new()).await.unwrap();

    assert!(report.is_completed());
    assert_eq!(port.total_calls(), 6);
    assert_eq!(port.max_in_flight(), 2);
}

#[tokio::test]
async fn test_timeout_counts_against_retry_budget() {
    let registry = RegistryBuilder::new()
        .stage("a", &[], &["doc"])
        .stage("b", &[], &["doc"])
        .build()
        .unwrap();
    let port = Arc::new(ScriptedGenerationPort::new().hang("a").hang("a").hang("b"));
    let config = fast_config()
        .with_call_timeout(Duration::from_millis(30))
        .with_retry(fast_config().retry.with_max_attempts(2));
    let harness = TestHarness::with_config(registry, port.clone(), config);

    let report = harness.orchestrator.run(RunRequest::new()).await.unwrap();

    let failure = report.failure_of("a").unwrap();
    assert_eq!(failure.category, ErrorCategory::Generation);
    assert!(failure.message.contains("timed out"), "{}", failure.message);
    assert_eq!(port.calls("a"), 2);

    assert_eq!(report.status_of("b"), Some(StageStatus::Completed));
    assert_eq!(report.attempts_of("b"), 2);
}

#[tokio::test]
async fn test_cancellation_aborts_in_flight_and_stops_dispatch() {
    let port = Arc::new(ScriptedGenerationPort::new().hang("b"));
    let harness = TestHarness::new(fan_in(), port.clone());
    let cancel = Arc::new(CancellationToken::new());

    let trigger = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel("interrupted by operator");
        })
    };
    let report = tokio::time::timeout(
        Duration::from_secs(5),
        harness
            .orchestrator
            .run(RunRequest::new().with_cancellation(cancel)),
    )
    .await
    .unwrap()
    .unwrap();
    trigger.await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.status_of("a"), Some(StageStatus::Completed));
    assert_eq!(
        report.failure_of("b").unwrap().category,
        ErrorCategory::Cancelled
    );
    assert!(report.blocked.is_empty());
    assert_eq!(report.not_started, vec!["c"]);
    assert_eq!(report.cancelled.as_deref(), Some("interrupted by operator"));
    assert!(report.deadlock.is_none());
    assert_eq!(port.calls("c"), 0);
}

#[tokio::test]
async fn test_cancelled_before_start_dispatches_nothing() {
    let port = Arc::new(ScriptedGenerationPort::new());
    let harness = TestHarness::new(fan_in(), port.clone());
    let cancel = Arc::new(CancellationToken::new());
    cancel.cancel("shutdown");

    let report = harness
        .orchestrator
        .run(RunRequest::new().with_cancellation(cancel))
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.not_started, vec!["a", "b", "c"]);
    assert_eq!(port.total_calls(), 0);
}

#[tokio::test]
async fn test_store_integrity_error_aborts_run() {
    let port = Arc::new(ScriptedGenerationPort::new().with_stage_delay("b", Duration::from_secs(30)));
    let harness = TestHarness::new(fan_in(), port);
    harness
        .store
        .put(&run_id("collide"), "a", "doc", "# Earlier\nleftover")
        .unwrap();

    let request = RunRequest::new().with_run_id(run_id("collide"));
    let err = tokio::time::timeout(Duration::from_secs(5), harness.orchestrator.run(request))
        .await
        .unwrap()
        .unwrap_err();

    assert!(matches!(
        err,
        HandoffError::Store(StoreError::DuplicateArtifact { .. })
    ));
    assert_eq!(harness.events.events().last().unwrap().0, events::RUN_ABORTED);
    assert_eq!(
        harness.store.get(&run_id("collide"), "a", "doc").unwrap().content,
        "# Earlier\nleftover"
    );
}

fn checksums(artifacts: &[Artifact]) -> Vec<(String, String, String)> {
    let mut sums: Vec<_> = artifacts
        .iter()
        .map(|a| (a.stage_id.clone(), a.name.clone(), a.checksum.clone()))
        .collect();
    sums.sort();
    sums
}

#[tokio::test]
async fn test_rerun_with_identical_inputs_yields_identical_checksums() {
    let registry = PipelineConfig::builtin().build_registry().unwrap();
    let store = Arc::new(InMemoryArtifactStore::new());
    let orchestrator = Orchestrator::new(
        registry,
        store.clone(),
        Arc::new(TemplateGenerationPort::new()),
    )
    .with_config(fast_config());

    for id in ["first", "second"] {
        let request = RunRequest::new()
            .with_run_id(run_id(id))
            .with_input("dataset", "claims.csv");
        assert!(orchestrator.run(request).await.unwrap().is_completed());
    }

    let first = store.list_run(&run_id("first")).unwrap();
    let second = store.list_run(&run_id("second")).unwrap();
    assert_eq!(first.len(), 10);
    assert_eq!(checksums(&first), checksums(&second));
}

#[tokio::test]
async fn test_builtin_pipeline_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::builtin();
    let store = Arc::new(FileArtifactStore::open(dir.path()).unwrap());
    let orchestrator = Orchestrator::new(
        config.build_registry().unwrap(),
        store.clone(),
        Arc::new(TemplateGenerationPort::new()),
    )
    .with_config(fast_config())
    .with_gate(config.gate());

    let request = RunRequest::new()
        .with_run_id(run_id("disk"))
        .with_input("dataset", "claims.csv");
    let report = orchestrator.run(request).await.unwrap();

    assert!(report.is_completed(), "{}", report.summary());
    for file in [
        "structure_analysis_report.md",
        "prospect_targeting_report.md",
        "final_synthesis_final_sales_report.md",
        "final_synthesis_executive_dashboard.md",
    ] {
        assert!(dir.path().join("disk").join(file).is_file(), "{file}");
    }

    let reopened = FileArtifactStore::open(dir.path()).unwrap();
    assert_eq!(reopened.list_run(&run_id("disk")).unwrap().len(), 10);
}

#[tokio::test]
async fn test_synthesis_sees_every_stage_output() {
    let registry = RegistryBuilder::new()
        .stage("a", &[], &["doc"])
        .stage("b", &["a"], &["doc"])
        .synthesis(StageSpec::new("final").with_outputs(["report"]))
        .build()
        .unwrap();
    let port = Arc::new(ScriptedGenerationPort::new());
    let harness = TestHarness::new(registry, port.clone());

    let report = harness.orchestrator.run(RunRequest::new()).await.unwrap();

    assert!(report.is_completed());
    let context = &port.contexts("final")[0];
    assert!(context.contains("a_doc") && context.contains("b_doc"));
    assert_eq!(report.final_artifacts.len(), 1);
    assert_eq!(report.final_artifacts[0].stage, "final");
}
