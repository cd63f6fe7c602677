//! Generation through an external command.

use super::{GenerationPort, GenerationRequest};
use crate::core::GeneratedArtifact;
use crate::errors::GenerationError;
use async_trait::async_trait;
use regex::Regex;
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[allow(clippy::expect_used)]
static ARTIFACT_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*<!--\s*artifact:\s*([A-Za-z0-9][A-Za-z0-9_-]*)\s*-->\s*$")
        .expect("artifact marker pattern compiles")
});

/// Maximum number of stderr bytes carried into an error message.
const STDERR_TAIL: usize = 2048;

/// Splits command output into the stage's artifacts.
///
/// A single-output stage receives the whole text. Otherwise each artifact
/// starts at a `<!-- artifact: NAME -->` line and runs to the next marker;
/// text before the first marker is dropped.
#[must_use]
pub fn split_outputs(stdout: &str, outputs: &[String]) -> Vec<GeneratedArtifact> {
    if let [only] = outputs {
        return vec![GeneratedArtifact::new(only, stdout.trim_end())];
    }

    let mut artifacts: Vec<GeneratedArtifact> = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in stdout.lines() {
        if let Some(captures) = ARTIFACT_MARKER.captures(line) {
            if let Some((name, lines)) = current.take() {
                artifacts.push(GeneratedArtifact::new(name, lines.join("\n").trim()));
            }
            current = Some((captures[1].to_string(), Vec::new()));
        } else if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        }
    }
    if let Some((name, lines)) = current {
        artifacts.push(GeneratedArtifact::new(name, lines.join("\n").trim()));
    }
    artifacts
}

/// Runs an external program once per stage invocation.
///
/// The rendered prompt is written to stdin and the documents are read from
/// stdout. The child sees `HANDOFF_RUN_ID`, `HANDOFF_STAGE`, `HANDOFF_ROLE`
/// and one `HANDOFF_INPUT_<KEY>` variable per run input. The child is killed
/// if the call is dropped (timeout or cancellation).
#[derive(Debug, Clone)]
pub struct CommandGenerationPort {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl CommandGenerationPort {
    /// Creates a port running `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Creates a port from an argv list; `None` if it is empty.
    #[must_use]
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone()).with_args(args.iter().cloned()))
    }

    /// Appends arguments.
    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an extra environment variable for the child.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// The program being run.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    fn command(&self, request: &GenerationRequest) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("HANDOFF_RUN_ID", request.run_id.as_str())
            .env("HANDOFF_STAGE", &request.stage_id)
            .env("HANDOFF_ROLE", &request.role)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &request.inputs {
            command.env(input_var(key), value);
        }
        command
    }
}

fn input_var(key: &str) -> String {
    let key: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("HANDOFF_INPUT_{key}")
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let start = text.len().saturating_sub(STDERR_TAIL);
    let start = (start..=text.len())
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(text.len());
    text[start..].to_string()
}

#[async_trait]
impl GenerationPort for CommandGenerationPort {
    fn name(&self) -> &str {
        &self.program
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<Vec<GeneratedArtifact>, GenerationError> {
        let mut child = self.command(request).spawn().map_err(|e| {
            GenerationError::Permanent(format!("cannot spawn '{}': {e}", self.program))
        })?;

        let prompt = request.prompt();
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A child that ignores stdin may close it early.
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    debug!(error = %e, "Generation command closed stdin");
                }
            }
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|e| GenerationError::failed(format!("wait failed: {e}")))?;

        if !output.status.success() {
            return Err(GenerationError::failed(format!(
                "'{}' exited with {}: {}",
                self.program,
                output.status,
                stderr_tail(&output.stderr)
            )));
        }

        let stdout = String::from_utf8(output.stdout)
            .map_err(|_| GenerationError::failed(format!("'{}' wrote non-UTF-8 output", self.program)))?;
        Ok(split_outputs(&stdout, &request.outputs))
    }
}
