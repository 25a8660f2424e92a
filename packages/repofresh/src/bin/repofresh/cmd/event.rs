use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use repofresh::event::{EventNotification, handle_record};

#[derive(Args, Debug)]
pub struct EventCommand {
    /// Read the event JSON from a file instead of stdin
    #[arg(long)]
    pub file: Option<PathBuf>,
}

pub async fn run(command: EventCommand) -> ExitCode {
    let config = match super::load_config() {
        Ok(config) => config,
        Err(code) => return code,
    };

    let raw = match &command.file {
        Some(path) => tokio::fs::read_to_string(path).await,
        None => std::io::read_to_string(std::io::stdin()),
    };
    let raw = match raw {
        Ok(raw) => raw,
        Err(error) => {
            eprintln!("Unable to read event: {error}");
            return ExitCode::FAILURE;
        }
    };
    let notification: EventNotification = match serde_json::from_str(&raw) {
        Ok(notification) => notification,
        Err(error) => {
            eprintln!("Unable to decode event: {error}");
            return ExitCode::FAILURE;
        }
    };

    for record in &notification.records {
        match handle_record(record, &config).await {
            Ok(Some(url)) => println!(
                "Applied {:?} for {:?} to repository {url:?}",
                record.event_name, record.s3.object.key
            ),
            Ok(None) => {}
            Err(error) => {
                eprintln!("Unable to apply event: {error}");
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}
