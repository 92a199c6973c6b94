use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use patrol::{aggregate, config, gate, retention, run};

#[derive(Debug, Parser)]
#[command(name = "patrol")]
#[command(about = "Release-gate harnesses for the indexer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Deploy supervised agent runs across target repos and gate the evidence.
    Run(run::Args),
    /// Sweep transient artifacts under storage-hygiene quotas.
    Retention(retention::Args),
    /// Drive the indexer end-to-end in a fresh clone and verify health.
    CleanClone(gate::Args),
    /// Merge saved patrol reports into a deduplicated findings summary.
    Aggregate(aggregate::Args),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let env = config::snapshot_env();

    let exit_code = match cli.command {
        Command::Run(args) => run::run(args, &env).await,
        Command::Retention(args) => match retention::run(&args, &env) {
            Ok(audit) => {
                println!(
                    "retention: {} class(es) swept, {} byte(s) deleted{}",
                    audit.classes.len(),
                    audit.total_deleted_bytes,
                    if audit.dry_run { " (dry run)" } else { "" }
                );
                0
            }
            Err(err) => {
                eprintln!("{err}");
                1
            }
        },
        Command::CleanClone(args) => gate::run(&args, &env).await,
        Command::Aggregate(args) => match aggregate::run(&args).await {
            Ok(code) => code,
            Err(err) => {
                eprintln!("{err}");
                1
            }
        },
    };

    std::process::exit(exit_code);
}
