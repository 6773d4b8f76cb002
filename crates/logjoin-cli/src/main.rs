//! Logjoin CLI - replays tracking pixel logs through the session join

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use logjoin_cli::config::{Config, JoinSection, OutputSection};
use logjoin_cli::replay::{run_replay, ReplayOptions};
use logjoin_cli::{check_line, logging};

#[derive(Parser)]
#[command(name = "logjoin")]
#[command(version)]
#[command(about = "Joins tracking pixel queries, clicks and item visits into sessions", long_about = None)]
struct Cli {
    /// Path to configuration file (YAML or TOML)
    #[arg(short, long, global = true, env = "LOGJOIN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a recorded pixel log through the join
    Replay {
        /// Input file, one query string or `tenant<TAB>unix_secs<TAB>query` per line
        #[arg(short, long)]
        file: PathBuf,

        /// Tenant for lines that do not carry one
        #[arg(short, long)]
        tenant: Option<String>,

        /// JSON lines output file (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Run the join without writing any output
        #[arg(long)]
        dry_run: bool,

        /// Enrich item visits from the feature table
        #[arg(long)]
        enable_cache: bool,

        /// Flush every open session at the end of the input
        #[arg(long)]
        drain: bool,

        /// Number of ingest workers (1 replays inline)
        #[arg(long, short = 'w')]
        workers: Option<usize>,
    },

    /// Decode one pixel line and show the typed event
    Check {
        /// Raw query string
        line: String,

        /// Tenant to attach to the event
        #[arg(short, long, default_value = "default")]
        tenant: String,
    },

    /// Print an example configuration file
    ConfigExample {
        /// Output format (yaml, toml)
        #[arg(short, long, default_value = "yaml")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path).map_err(|e| anyhow::anyhow!("{}", e))?,
        None => Config::default(),
    };

    logging::init(&config.logging)?;

    match cli.command {
        Commands::Replay {
            file,
            tenant,
            output,
            dry_run,
            enable_cache,
            drain,
            workers,
        } => {
            config.merge(Config {
                join: JoinSection {
                    dry_run,
                    enable_cache,
                    ..Default::default()
                },
                output: OutputSection {
                    path: output,
                    ..Default::default()
                },
                ..Default::default()
            });
            config.validate().map_err(|e| anyhow::anyhow!("{}", e))?;

            let options = ReplayOptions {
                file,
                tenant,
                workers,
                drain,
            };
            let summary = run_replay(&config, &options).await?;
            if config.output.path.is_some() || config.join.dry_run {
                summary.print();
            } else {
                // Joined records already went to stdout
                eprintln!("{:#?}", summary.stats);
            }
        }

        Commands::Check { line, tenant } => {
            println!("{}", check_line(&tenant, &line)?);
        }

        Commands::ConfigExample { format } => {
            let content = match format.to_lowercase().as_str() {
                "yaml" | "yml" => Config::example_yaml(),
                "toml" => Config::example_toml(),
                _ => anyhow::bail!("Unsupported format: {}. Use 'yaml' or 'toml'", format),
            };
            println!("{}", content);
        }
    }

    Ok(())
}
