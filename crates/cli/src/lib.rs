pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "stagehand",
    about = "Stagehand operator CLI",
    long_about = "Operate the Stagehand approval engine: migrations, config inspection, readiness checks, and offline policy tooling.",
    after_help = "Examples:\n  stagehand doctor --json\n  stagehand policy validate policies.toml\n  stagehand policy match policies.toml item.toml"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution"
    )]
    Config,
    #[command(about = "Validate config, DB connectivity, and schema migration state")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(subcommand, about = "Validate policy files and preview policy selection")]
    Policy(PolicyCommand),
}

#[derive(Debug, Subcommand)]
enum PolicyCommand {
    #[command(about = "Check every policy in a TOML file, including the one-default rule")]
    Validate {
        #[arg(help = "Path to a TOML file with [[policies]] entries")]
        path: PathBuf,
    },
    #[command(about = "Show which policy a work item would be routed to")]
    Match {
        #[arg(help = "Path to a TOML file with [[policies]] entries")]
        policies: PathBuf,
        #[arg(help = "Path to a TOML file describing the work item")]
        item: PathBuf,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Policy(PolicyCommand::Validate { path }) => commands::policy::validate(&path),
        Command::Policy(PolicyCommand::Match { policies, item }) => {
            commands::policy::matches(&policies, &item)
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
