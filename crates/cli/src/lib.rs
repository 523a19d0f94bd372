pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use edgesec_core::config::{AppConfig, LogFormat};

use crate::commands::CommandResult;

#[derive(Debug, Parser)]
#[command(
    name = "edgesec",
    about = "EdgeSec operator CLI",
    long_about = "Analyse edge traffic logs, dry-run WAF rule candidates, and inspect staged rule rollouts.",
    after_help = "Examples:\n  edgesec classify logs.json\n  edgesec simulate logs.json rule.json\n  edgesec status rule-block-wp-admin"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Classify a JSON array of traffic log records into an anomaly report")]
    Classify { log_file: PathBuf },
    #[command(about = "Dry-run a rule candidate against a historical log batch")]
    Simulate {
        log_file: PathBuf,
        rule_file: PathBuf,
        #[arg(long, help = "Print the plain-text report instead of JSON")]
        text: bool,
    },
    #[command(about = "Validate a rule candidate and assess its deployment risk")]
    Assess { rule_file: PathBuf },
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Show the latest rollout execution recorded for a rule")]
    Status { rule_id: String },
    #[command(about = "List every rollout execution recorded for a rule, oldest first")]
    History { rule_id: String },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Classify { .. } => "classify",
            Self::Simulate { .. } => "simulate",
            Self::Assess { .. } => "assess",
            Self::Migrate => "migrate",
            Self::Status { .. } => "status",
            Self::History { .. } => "history",
        }
    }
}

/// Logs go to stderr so stdout stays a single JSON payload.
pub fn init_logging(config: &AppConfig) {
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);

    let _ = match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let result = match commands::load_config(cli.command.name()) {
        Ok(config) => {
            init_logging(&config);
            execute(cli.command, &config)
        }
        Err(failure) => failure,
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

fn execute(command: Command, config: &AppConfig) -> CommandResult {
    match command {
        Command::Classify { log_file } => commands::classify::run(config, &log_file),
        Command::Simulate { log_file, rule_file, text } => {
            commands::simulate::run(&log_file, &rule_file, text)
        }
        Command::Assess { rule_file } => commands::assess::run(&rule_file),
        Command::Migrate => commands::migrate::run(config),
        Command::Status { rule_id } => commands::status::run(config, &rule_id),
        Command::History { rule_id } => commands::history::run(config, &rule_id),
    }
}
