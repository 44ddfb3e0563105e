use std::process::ExitCode;

use clap::Parser;
use moodle_solr_telemetry::Tracing;
use moodle_solr_tenant::{
    cli::Cli,
    commands::{self, Outcome},
};
use snafu::Report;

const APP_NAME: &str = "moodle-solr-tenant";

#[tokio::main]
async fn main() -> ExitCode {
    let Cli {
        command,
        options,
        telemetry,
    } = Cli::parse();

    // Dropping the guard flushes and stops the file logger.
    let _tracing_guard = match Tracing::pre_configured(APP_NAME, telemetry).init() {
        Ok(guard) => guard,
        Err(error) => {
            eprintln!("{}", Report::from_error(error));
            return ExitCode::FAILURE;
        }
    };

    match commands::run(command, &options).await {
        Ok(Outcome::Success) => ExitCode::SUCCESS,
        Ok(Outcome::Failure) => ExitCode::FAILURE,
        Err(error) => {
            let consistency_warning = error.is_consistency_warning();
            let remediation = error.remediation();

            eprintln!("ERROR: {}", Report::from_error(error));
            if consistency_warning {
                eprintln!("WARNING: inconsistent state, nothing was cleaned up automatically");
            }
            if let Some(remediation) = remediation {
                eprintln!("To fix: {remediation}");
            }
            ExitCode::FAILURE
        }
    }
}
