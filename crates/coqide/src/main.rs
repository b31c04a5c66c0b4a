mod config;
mod pipeline;
mod results;
mod script;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pipeline::{ProfileArgs, QueryArgs, RunArgs};

/// coqide: drive coqtop over its XML protocol from the command line.
#[derive(Parser)]
#[command(name = "coqide", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Options shared by every subcommand for locating and configuring coqtop.
#[derive(Args, Debug, Clone)]
struct CoqtopOpts {
    /// Path to a config TOML file with a `[coqtop]` section.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory containing the coqtop binary (overrides config and COQBIN).
    #[arg(long)]
    coq_path: Option<PathBuf>,
    /// Wrapper executable to launch coqtop through.
    #[arg(long)]
    wrapper: Option<PathBuf>,
    /// Set `Printing Width` after init.
    #[arg(long)]
    columns: Option<u32>,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Check a script sentence by sentence and show the goals at the end.
    Run {
        #[command(flatten)]
        coqtop: CoqtopOpts,
        /// The `.v` script to check.
        script: PathBuf,
        /// Output as JSON instead of human-readable text.
        #[arg(long)]
        json: bool,
    },
    /// Run a query (`Check`, `Print`, `Search`, ...), optionally after loading a script.
    Query {
        #[command(flatten)]
        coqtop: CoqtopOpts,
        /// The query text, e.g. "Check nat."
        query: String,
        /// Script to process before the query.
        #[arg(long)]
        load: Option<PathBuf>,
    },
    /// Check a script with Ltac profiling on and print the profile.
    Profile {
        #[command(flatten)]
        coqtop: CoqtopOpts,
        /// The `.v` script to profile.
        script: PathBuf,
        /// Output as JSON instead of an indented tree.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            coqtop,
            script,
            json,
        } => {
            pipeline::run_script(RunArgs {
                settings: coqtop.into(),
                script,
                json,
            })
            .await
        }
        Command::Query {
            coqtop,
            query,
            load,
        } => {
            pipeline::run_query(QueryArgs {
                settings: coqtop.into(),
                query,
                load,
            })
            .await
        }
        Command::Profile {
            coqtop,
            script,
            json,
        } => {
            pipeline::run_profile(ProfileArgs {
                settings: coqtop.into(),
                script,
                json,
            })
            .await
        }
    }
}

impl From<CoqtopOpts> for config::SettingsArgs {
    fn from(opts: CoqtopOpts) -> Self {
        config::SettingsArgs {
            config: opts.config,
            coq_path: opts.coq_path,
            wrapper: opts.wrapper,
            columns: opts.columns,
        }
    }
}
