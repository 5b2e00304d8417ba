pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "cadence",
    about = "Cadence operator CLI",
    long_about = "Operate the Cadence dialogue engine: migrations, config inspection, readiness checks, template validation and offline conversation replay.",
    after_help = "Examples:\n  cadence doctor --json\n  cadence templates validate templates/\n  cadence simulate conversation.jsonl"
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
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, slot templates, executor settings and DB readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(subcommand, about = "Inspect and validate slot templates")]
    Templates(TemplatesCommand),
    #[command(about = "Replay a JSONL script of extractor turns through an in-memory runtime")]
    Simulate {
        #[arg(help = "Path to the JSONL turn script")]
        script: PathBuf,
        #[arg(long, help = "Template directory to use instead of the configured one")]
        templates: Option<PathBuf>,
    },
}

#[derive(Debug, Subcommand)]
enum TemplatesCommand {
    #[command(about = "List loaded templates with their required and optional slots")]
    List {
        #[arg(long, help = "Template directory to list instead of the configured one")]
        dir: Option<PathBuf>,
    },
    #[command(about = "Validate a template file or every template in a directory")]
    Validate {
        #[arg(help = "Template file or directory")]
        path: PathBuf,
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
        Command::Templates(TemplatesCommand::List { dir }) => commands::templates::list(dir.as_deref()),
        Command::Templates(TemplatesCommand::Validate { path }) => commands::templates::validate(&path),
        Command::Simulate { script, templates } => {
            commands::simulate::run(&script, templates.as_deref())
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
