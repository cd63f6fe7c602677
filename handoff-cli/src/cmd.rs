//! Subcommand implementations.

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use handoff::cancellation::CancellationToken;
use handoff::config::PipelineConfig;
use handoff::core::{RunId, RunOutcome};
use handoff::errors::{ConfigError, HandoffError, RegistryError};
use handoff::events::LoggingEventSink;
use handoff::generation::{CommandGenerationPort, GenerationPort, TemplateGenerationPort};
use handoff::orchestrator::{Orchestrator, RunReport, RunRequest};
use handoff::store::{write_atomic, ArtifactStore, FileArtifactStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// File name of the run report inside the run directory.
pub const REPORT_FILE: &str = "run_report.json";

/// Exit code for a completed run.
pub const EXIT_OK: u8 = 0;
/// Exit code for a failed, cancelled or aborted run.
pub const EXIT_FAILED: u8 = 1;
/// Exit code for a rejected invocation, before any stage ran.
pub const EXIT_SETUP: u8 = 2;

/// A problem with the invocation found before any stage ran.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct UsageError(pub String);

/// Which generation port drives the stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Generator {
    /// Deterministic offline template generator.
    #[default]
    Offline,
    /// External command, one process per attempt.
    Command,
}

/// Arguments for `handoff run`.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Dataset handed to every stage as the `dataset` input
    #[arg(long)]
    pub dataset: PathBuf,

    /// Artifact store root; the run writes to `<output>/<run-id>/`
    #[arg(short, long)]
    pub output: PathBuf,

    /// Run id (defaults to a fresh time-ordered id)
    #[arg(long)]
    pub run_id: Option<String>,

    #[arg(long, value_enum, default_value_t = Generator::Offline)]
    pub generator: Generator,

    /// Generator argv, overriding `[generation] command`
    #[arg(long, num_args = 1.., allow_hyphen_values = true)]
    pub command: Vec<String>,

    /// Maximum stages in flight
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Deadline for one generation attempt
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Total generation attempts per stage
    #[arg(long)]
    pub max_attempts: Option<u32>,
}

/// Maps a finished run to the process exit code.
pub fn exit_code(outcome: RunOutcome) -> u8 {
    match outcome {
        RunOutcome::Completed => EXIT_OK,
        RunOutcome::Running | RunOutcome::Failed => EXIT_FAILED,
    }
}

/// Maps an error to the process exit code.
///
/// Anything rejected before the run started (config, graph, arguments)
/// exits with [`EXIT_SETUP`]; everything else is a run failure.
pub fn error_exit_code(err: &anyhow::Error) -> u8 {
    let setup = err.downcast_ref::<UsageError>().is_some()
        || err.downcast_ref::<ConfigError>().is_some()
        || err.downcast_ref::<RegistryError>().is_some()
        || matches!(
            err.downcast_ref::<HandoffError>(),
            Some(HandoffError::Config(_) | HandoffError::Registry(_))
        );
    if setup {
        EXIT_SETUP
    } else {
        EXIT_FAILED
    }
}

/// Loads the config file, or the built-in research pipeline.
pub fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => Ok(PipelineConfig::load(path)?),
        None => Ok(PipelineConfig::builtin()),
    }
}

/// Applies command-line overrides, then re-checks the result.
pub fn apply_overrides(config: &mut PipelineConfig, args: &RunArgs) -> Result<()> {
    if let Some(concurrency) = args.concurrency {
        config.pipeline.max_concurrency = concurrency;
    }
    if let Some(timeout_secs) = args.timeout_secs {
        config.generation.timeout_secs = timeout_secs;
    }
    if let Some(max_attempts) = args.max_attempts {
        config.retry.max_attempts = max_attempts;
    }
    if !args.command.is_empty() {
        config.generation.command = Some(args.command.clone());
    }
    config.check()?;
    Ok(())
}

fn generation_port(config: &PipelineConfig, generator: Generator) -> Result<Arc<dyn GenerationPort>> {
    match generator {
        Generator::Offline => Ok(Arc::new(TemplateGenerationPort::new())),
        Generator::Command => {
            let port = config
                .generation
                .command
                .as_deref()
                .and_then(CommandGenerationPort::from_argv)
                .ok_or_else(|| {
                    UsageError(
                        "--generator command needs --command or [generation] command".into(),
                    )
                })?;
            Ok(Arc::new(port))
        }
    }
}

fn parse_run_id(raw: Option<&str>) -> Result<RunId> {
    match raw {
        Some(raw) => RunId::parse(raw)
            .ok_or_else(|| UsageError(format!("invalid run id '{raw}'")).into()),
        None => Ok(RunId::generate()),
    }
}

/// `handoff run`
/// Event records log at debug level once `-v` is given.
fn event_sink(verbose: u8) -> LoggingEventSink {
    if verbose > 0 {
        LoggingEventSink::debug()
    } else {
        LoggingEventSink::default()
    }
}

pub async fn run(config_path: Option<&Path>, args: &RunArgs, verbose: u8) -> Result<u8> {
    let mut config = load_config(config_path)?;
    apply_overrides(&mut config, args)?;
    if !args.dataset.is_file() {
        return Err(UsageError(format!("dataset {} not found", args.dataset.display())).into());
    }
    let registry = config.build_registry()?;
    let run_id = parse_run_id(args.run_id.as_deref())?;
    let port = generation_port(&config, args.generator)?;

    let store = Arc::new(
        FileArtifactStore::open(&args.output)
            .with_context(|| format!("opening artifact store at {}", args.output.display()))?,
    );
    let orchestrator = Orchestrator::new(registry, store.clone(), port)
        .with_config(config.orchestrator_config())
        .with_gate(config.gate())
        .with_event_sink(Arc::new(event_sink(verbose)));

    let cancel = Arc::new(CancellationToken::new());
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; cancelling run");
                cancel.cancel("interrupted");
            }
        })
    };

    let request = RunRequest::new()
        .with_run_id(run_id.clone())
        .with_input("dataset", args.dataset.display().to_string())
        .with_input("output_dir", store.run_dir(&run_id).display().to_string())
        .with_cancellation(cancel);
    info!(pipeline = %config.pipeline.name, run_id = %run_id, "Starting run");
    let result = orchestrator.run(request).await;
    interrupt.abort();
    let report = result?;

    let report_path = write_report(store.run_dir(&run_id), &report)?;
    print!("{}", report.summary());
    println!("Report: {}", report_path.display());
    Ok(exit_code(report.outcome))
}

/// Writes `run_report.json` into the run directory.
pub fn write_report(run_dir: PathBuf, report: &RunReport) -> Result<PathBuf> {
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let path = run_dir.join(REPORT_FILE);
    let json = serde_json::to_string_pretty(report)?;
    write_atomic(&path, &json)?;
    Ok(path)
}

/// `handoff stages`
pub fn stages(config_path: Option<&Path>) -> Result<u8> {
    let config = load_config(config_path)?;
    let registry = config.build_registry()?;
    for id in registry.topological_order() {
        let Some(spec) = registry.get(id) else {
            continue;
        };
        let deps = if spec.dependencies.is_empty() {
            "-".to_string()
        } else {
            spec.dependencies.join(", ")
        };
        println!(
            "{id:<28} {role:<18} needs: {deps}  outputs: {outputs}",
            role = spec.role,
            outputs = spec.outputs.join(", ")
        );
    }
    Ok(EXIT_OK)
}

/// `handoff check`
pub fn check(config_path: Option<&Path>) -> Result<u8> {
    let config = load_config(config_path)?;
    let registry = config.build_registry()?;
    println!(
        "{}: {} stages, max concurrency {}",
        config.pipeline.name,
        registry.len(),
        config.pipeline.max_concurrency
    );
    Ok(EXIT_OK)
}

/// `handoff artifacts`
pub fn artifacts(output: &Path, run_id: &str, stage: Option<&str>) -> Result<u8> {
    let run_id = parse_run_id(Some(run_id))?;
    let store = FileArtifactStore::open(output)
        .with_context(|| format!("opening artifact store at {}", output.display()))?;
    let artifacts = match stage {
        Some(stage) => store.list(&run_id, stage)?,
        None => store.list_run(&run_id)?,
    };
    if artifacts.is_empty() {
        return Err(UsageError(format!("no artifacts recorded for run {run_id}")).into());
    }
    for artifact in &artifacts {
        println!(
            "{}  {}  {:>8}  {}",
            artifact.created_at.to_rfc3339(),
            artifact.checksum,
            artifact.len(),
            artifact.key().file_stem()
        );
    }
    Ok(EXIT_OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use handoff::errors::StoreError;
    use pretty_assertions::assert_eq;

    fn args(dataset: PathBuf, output: PathBuf) -> RunArgs {
        RunArgs {
            dataset,
            output,
            run_id: None,
            generator: Generator::Offline,
            command: Vec::new(),
            concurrency: None,
            timeout_secs: None,
            max_attempts: None,
        }
    }

    #[test]
    fn test_event_sink_follows_verbosity() {
        assert_eq!(event_sink(0), LoggingEventSink::default());
        assert_eq!(event_sink(1), LoggingEventSink::debug());
        assert_eq!(event_sink(2), LoggingEventSink::debug());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(RunOutcome::Completed), EXIT_OK);
        assert_eq!(exit_code(RunOutcome::Failed), EXIT_FAILED);
        assert_eq!(exit_code(RunOutcome::Running), EXIT_FAILED);

        let usage = anyhow::Error::from(UsageError("bad".into()));
        assert_eq!(error_exit_code(&usage), EXIT_SETUP);
        let config = anyhow::Error::from(ConfigError::Invalid("x".into()));
        assert_eq!(error_exit_code(&config), EXIT_SETUP);
        let registry = anyhow::Error::from(RegistryError::Empty);
        assert_eq!(error_exit_code(&registry), EXIT_SETUP);

        let store = anyhow::Error::from(HandoffError::Store(StoreError::NotFound {
            key: "r/a/doc".into(),
        }));
        assert_eq!(error_exit_code(&store), EXIT_FAILED);
    }

    #[test]
    fn test_overrides_are_checked() {
        let mut config = PipelineConfig::builtin();
        let mut run = args(PathBuf::from("d.csv"), PathBuf::from("out"));
        run.concurrency = Some(2);
        run.max_attempts = Some(5);
        apply_overrides(&mut config, &run).unwrap();
        assert_eq!(config.pipeline.max_concurrency, 2);
        assert_eq!(config.retry.max_attempts, 5);

        run.concurrency = Some(0);
        let err = apply_overrides(&mut config, &run).unwrap_err();
        assert_eq!(error_exit_code(&err), EXIT_SETUP);
    }

    #[test]
    fn test_command_generator_requires_argv() {
        let config = PipelineConfig::builtin();
        let err = generation_port(&config, Generator::Command)
            .err()
            .expect("command generator without argv is rejected");
        assert_eq!(error_exit_code(&err), EXIT_SETUP);
        assert!(generation_port(&config, Generator::Offline).is_ok());
    }

    #[test]
    fn test_invalid_run_id_is_usage_error() {
        let err = parse_run_id(Some("../escape")).unwrap_err();
        assert_eq!(error_exit_code(&err), EXIT_SETUP);
        assert!(parse_run_id(None).is_ok());
    }

    #[tokio::test]
    async fn test_missing_dataset_is_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        let run_args = args(dir.path().join("missing.csv"), dir.path().join("out"));
        let err = run(None, &run_args, 0).await.unwrap_err();
        assert_eq!(error_exit_code(&err), EXIT_SETUP);
    }

    #[tokio::test]
    async fn test_offline_run_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dir.path().join("claims.csv");
        std::fs::write(&dataset, "policy,premium\np1,100\n").unwrap();
        let mut run_args = args(dataset, dir.path().join("out"));
        run_args.run_id = Some("offline".into());

        let code = run(None, &run_args, 0).await.unwrap();
        assert_eq!(code, EXIT_OK);

        let raw = std::fs::read_to_string(dir.path().join("out/offline").join(REPORT_FILE)).unwrap();
        let report: RunReport = serde_json::from_str(&raw).unwrap();
        assert!(report.is_completed());
        assert_eq!(report.final_artifacts.len(), 2);

        assert_eq!(artifacts(&dir.path().join("out"), "offline", None).unwrap(), EXIT_OK);
        let err = artifacts(&dir.path().join("out"), "unknown", None).unwrap_err();
        assert_eq!(error_exit_code(&err), EXIT_SETUP);
    }
}
