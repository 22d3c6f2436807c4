pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use credeval_core::config::{AppConfig, LlmProvider, LoadOptions, LogFormat};
use credeval_core::domain::conversation::EvaluationType;

use crate::commands::analyze::AnalyzeArgs;

#[derive(Debug, Parser)]
#[command(
    name = "credeval",
    about = "Credential evaluation operator CLI",
    long_about = "Analyze academic credential documents against the reference catalog, and operate the catalog database.",
    after_help = "Examples:\n  credeval migrate\n  credeval migrate --reset\n  credeval seed\n  credeval analyze transcript.pdf --evaluation course-by-course --output out/\n  credeval analyze inbox/ --output out/\n  credeval doctor --json"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending catalog migrations and return structured status output")]
    Migrate {
        #[arg(long, help = "Revert every migration first, dropping all catalog rows")]
        reset: bool,
    },
    #[command(about = "Load the deterministic fixture catalog (idempotent)")]
    Seed,
    #[command(about = "Report catalog row counts and integrity issues")]
    Catalog,
    #[command(about = "Analyze a credential document, or every PDF in a folder, and write results and audit trails")]
    Analyze {
        #[arg(help = "Path to a PDF document or a folder of PDFs")]
        document: PathBuf,
        #[arg(long, default_value = "general", help = "general | course-by-course")]
        evaluation: String,
        #[arg(long, default_value = ".", help = "Directory for <stem>_analysis.json and <stem>_audit.json")]
        output: PathBuf,
        #[arg(long, help = "Override llm.provider (anthropic | gemini)")]
        provider: Option<String>,
    },
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, provider credentials, and catalog readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let result = match cli.command {
        Command::Migrate { reset } => commands::migrate::run(reset),
        Command::Seed => commands::seed::run(),
        Command::Catalog => commands::catalog::run(),
        Command::Analyze { document, evaluation, output, provider } => {
            match analyze_args(document, &evaluation, output, provider.as_deref()) {
                Ok(args) => commands::analyze::run(args),
                Err(result) => result,
            }
        }
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

fn analyze_args(
    document: PathBuf,
    evaluation: &str,
    output_dir: PathBuf,
    provider: Option<&str>,
) -> Result<AnalyzeArgs, commands::CommandResult> {
    let invalid = |message: String| {
        commands::CommandResult::failure("analyze", "invalid_argument", message, 2)
    };
    let evaluation_type =
        evaluation.parse::<EvaluationType>().map_err(|error| invalid(error.to_string()))?;
    let provider = provider
        .map(str::parse::<LlmProvider>)
        .transpose()
        .map_err(|error| invalid(error.to_string()))?;
    Ok(AnalyzeArgs { document, evaluation_type, output_dir, provider })
}

/// Logs go to stderr so stdout stays one JSON line per command. Commands
/// report configuration errors themselves, so a config that fails to load
/// leaves logging off.
fn init_logging() {
    use tracing::Level;

    let Ok(config) = AppConfig::load(LoadOptions::default()) else {
        return;
    };
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

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::analyze_args;
    use credeval_core::config::LlmProvider;
    use credeval_core::domain::conversation::EvaluationType;

    #[test]
    fn analyze_arguments_are_parsed() {
        let args = analyze_args(
            PathBuf::from("transcript.pdf"),
            "course-by-course",
            PathBuf::from("out"),
            Some("anthropic"),
        )
        .expect("valid arguments");
        assert_eq!(args.evaluation_type, EvaluationType::CourseByCourse);
        assert_eq!(args.provider, Some(LlmProvider::Anthropic));
    }

    #[test]
    fn unknown_evaluation_type_is_an_argument_error() {
        let result = analyze_args(PathBuf::from("a.pdf"), "detailed", PathBuf::from("."), None)
            .expect_err("invalid evaluation type");
        assert_eq!(result.exit_code, 2);
        assert!(result.output.contains("invalid_argument"));
    }
}
