mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    attempts::AttemptsSubcommand, config::ConfigSubcommand, handoff::HandoffSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "autoheal",
    about = "Self-healing ops pipeline: detect backend errors, classify them, remediate and verify",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .autoheal/ or .git/)
    #[arg(long, global = true, env = "AUTOHEAL_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter .autoheal/config.yaml
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Run the pipeline until interrupted
    Run,

    /// Validate or print the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Inspect or apply the latest handoff record
    Handoff {
        #[command(subcommand)]
        subcommand: HandoffSubcommand,
    },

    /// Dry-run the error extractor on a raw record
    Extract {
        /// Source kind: warehouse or orchestrator
        #[arg(long)]
        kind: String,
        /// File holding the raw record (default: stdin)
        file: Option<PathBuf>,
    },

    /// Check a SQL command against the grant allowlist without running it
    CheckCommand {
        /// The SQL command to check
        command: String,
    },

    /// Inspect recorded fix attempts
    Attempts {
        #[command(subcommand)]
        subcommand: AttemptsSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run | Commands::Handoff { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init { force } => cmd::init::run(&root, force),
        Commands::Run => cmd::run::run(&root, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
        Commands::Handoff { subcommand } => cmd::handoff::run(&root, subcommand, cli.json),
        Commands::Extract { kind, file } => cmd::extract::run(&kind, file.as_deref(), cli.json),
        Commands::CheckCommand { command } => cmd::gate::run(&command, cli.json),
        Commands::Attempts { subcommand } => cmd::attempts::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
