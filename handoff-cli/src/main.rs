use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;
mod logging;

use cmd::RunArgs;
use logging::LogFormat;

#[derive(Parser)]
#[command(name = "handoff")]
#[command(version, about = "Run dependency-ordered generation pipelines")]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    /// Pipeline config (TOML). Defaults to the built-in research pipeline.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a pipeline run
    Run(RunArgs),
    /// List stages in execution order
    Stages,
    /// Validate the pipeline configuration
    Check,
    /// List the artifacts a run recorded
    Artifacts {
        /// Artifact store root
        #[arg(short, long)]
        output: PathBuf,

        #[arg(long)]
        run_id: String,

        /// Only this stage
        #[arg(long)]
        stage: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::init(cli.verbose, cli.log_format) {
        eprintln!("error: cannot initialise logging: {e:#}");
        return ExitCode::from(cmd::EXIT_SETUP);
    }

    let config = cli.config.as_deref();
    let result = match &cli.command {
        Commands::Run(args) => cmd::run(config, args, cli.verbose).await,
        Commands::Stages => cmd::stages(config),
        Commands::Check => cmd::check(config),
        Commands::Artifacts {
            output,
            run_id,
            stage,
        } => cmd::artifacts(output, run_id, stage.as_deref()),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(cmd::error_exit_code(&e))
        }
    }
}
