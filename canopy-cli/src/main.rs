use std::path::PathBuf;

use clap::Parser;

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "canopy",
    version,
    about = "Turn flat URL catalogs into category trees and analyze them"
)]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,

    /// Path to a canopy.toml configuration file
    #[arg(long, global = true, env = "CANOPY_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,
}

/// Map an error to the process exit code.
///
///   0 = success
///   1 = general/unknown error
///   2 = configuration error
///   3 = catalog file missing or unreadable
///   4 = pipeline job failed or was cancelled
fn classify_exit_code(err: &anyhow::Error) -> i32 {
    let lower = format!("{err:#}").to_lowercase();

    if lower.contains("config") {
        2
    } else if lower.contains("cannot read catalog") || lower.contains("cannot parse catalog") {
        3
    } else if lower.contains("job") && (lower.contains("failed") || lower.contains("cancelled")) {
        4
    } else {
        1
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (_, 0) => "warn",
        (_, 1) => "info",
        (_, 2) => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: Failed to create runtime: {e}");
            std::process::exit(1);
        }
    };

    let globals = commands::Globals {
        config: cli.config,
        quiet: cli.quiet,
    };
    match runtime.block_on(commands::run(cli.command, &globals)) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(classify_exit_code(&e));
        }
    }
}
