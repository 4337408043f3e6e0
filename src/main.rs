use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod cli;

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Dynamic module runtime: install, resolve and inspect bundles")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the parsed manifest of a bundle archive or directory
    Inspect {
        /// Bundle archive (.jar/.zip) or exploded bundle directory
        bundle: PathBuf,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Install every bundle in a directory, resolve them and print the wiring
    Resolve {
        /// Directory holding bundle archives or exploded bundles
        dir: PathBuf,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
        /// Persist bundles in this directory instead of memory
        #[arg(long)]
        storage_dir: Option<PathBuf>,
        /// Framework config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Inspect { bundle, json } => cli::inspect::run(&bundle, json).map(|()| true),
        Commands::Resolve {
            dir,
            json,
            storage_dir,
            config,
        } => cli::resolve::run(cli::resolve::ResolveOptions {
            dir,
            json,
            storage_dir,
            config,
        }),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        // Unresolved bundles were already reported
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
