//! Fixtures for orchestrator tests.

use crate::events::CollectingEventSink;
use crate::generation::GenerationPort;
use crate::orchestrator::{JitterStrategy, Orchestrator, OrchestratorConfig, RetryConfig};
use crate::registry::StageRegistry;
use crate::store::InMemoryArtifactStore;
use std::sync::Arc;
use std::time::Duration;

/// A markdown document that passes the default validation rules.
#[must_use]
pub fn markdown_document(title: &str, body: &str) -> String {
    format!(
        "# {title}\n\n## Summary\n\n{body}\n\nThis section records the findings handed to downstream stages.\n"
    )
}

/// Orchestrator config with millisecond backoff and a short call deadline.
#[must_use]
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_retry(
            RetryConfig::default()
                .with_base_delay_ms(1)
                .with_max_delay_ms(5)
                .with_jitter(JitterStrategy::None),
        )
        .with_call_timeout(Duration::from_secs(5))
}

/// An orchestrator wired to an in-memory store and a collecting sink.
#[derive(Debug)]
pub struct TestHarness {
    /// The orchestrator under test.
    pub orchestrator: Orchestrator,
    /// The store it writes to.
    pub store: Arc<InMemoryArtifactStore>,
    /// Every lifecycle event it emitted.
    pub events: Arc<CollectingEventSink>,
}

impl TestHarness {
    /// Wires `registry` and `port` with [`fast_config`].
    #[must_use]
    pub fn new(registry: StageRegistry, port: Arc<dyn GenerationPort>) -> Self {
        Self::with_config(registry, port, fast_config())
    }

    /// Wires `registry` and `port` with an explicit config.
    #[must_use]
    pub fn with_config(
        registry: StageRegistry,
        port: Arc<dyn GenerationPort>,
        config: OrchestratorConfig,
    ) -> Self {
        let store = Arc::new(InMemoryArtifactStore::new());
        let events = Arc::new(CollectingEventSink::new());
        let orchestrator = Orchestrator::new(registry, store.clone(), port)
            .with_config(config)
            .with_event_sink(events.clone());
        Self {
            orchestrator,
            store,
            events,
        }
    }
}
