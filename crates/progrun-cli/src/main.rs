//! progrun CLI - Run quiz code snippets through Python and R runners.

mod preload;
mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use progrun_core::{LANGUAGE_SYNONYMS, LanguageRunners, RunnerConfig};

#[derive(Parser)]
#[command(name = "progrun")]
#[command(about = "Run Python and R code blocks the way quiz questions do")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory question resource files are read from
    #[arg(long, global = true)]
    resources: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run code blocks in one fresh session and print the results as JSON
    Run {
        /// Runner or language name (pyodide, webr, python, r)
        #[arg(short, long)]
        language: String,

        /// Question context the blocks run in
        #[arg(long)]
        context: Option<String>,

        /// Resource files to mount before running
        #[arg(long, num_args = 1..)]
        files: Vec<String>,

        /// Packages to load before running
        #[arg(long, num_args = 1..)]
        packages: Vec<String>,

        /// Files holding one code block each, run in order
        #[arg(required = true)]
        blocks: Vec<PathBuf>,
    },

    /// Start a runner and load packages and files, reporting any failure
    Preload {
        /// Runner or language name (pyodide, webr, python, r)
        #[arg(short, long)]
        language: String,

        /// Packages to load
        #[arg(long, num_args = 1..)]
        packages: Vec<String>,

        /// Resource files to register
        #[arg(long, num_args = 1..)]
        files: Vec<String>,

        /// Question context the files belong to
        #[arg(long)]
        context: Option<String>,
    },

    /// List the available runners and the languages they implement
    Languages,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let mut config = RunnerConfig::from_env();
    if let Some(resources) = cli.resources {
        config.resources_dir = resources;
    }
    let runners = LanguageRunners::with_defaults(&config);

    match cli.command {
        Commands::Run {
            language,
            context,
            files,
            packages,
            blocks,
        } => {
            let backend = backend_name(&language);
            run::execute(&runners, backend, context, files, packages, &blocks).await?;
        }

        Commands::Preload {
            language,
            packages,
            files,
            context,
        } => {
            let backend = backend_name(&language);
            preload::execute(&runners, backend, packages, files, context).await?;
        }

        Commands::Languages => {
            for name in runners.names() {
                println!("{name}\t{}", progrun_core::language_synonym(name));
            }
        }
    }

    Ok(())
}

/// Map a language name (`python`, `r`) to the runner that implements it.
///
/// Runner names pass through unchanged.
fn backend_name(name: &str) -> &str {
    LANGUAGE_SYNONYMS
        .iter()
        .find(|(_, language)| language.eq_ignore_ascii_case(name))
        .map_or(name, |&(backend, _)| backend)
}
