mod add;
mod event;
mod remove;

use std::process::ExitCode;

use clap::Subcommand;
use repofresh::repository::{Config, Variables};

#[derive(Subcommand)]
pub enum Command {
    /// Add a package to the repository its filename resolves to
    Add(add::AddCommand),
    /// Remove a package from the repository its filename resolves to
    Remove(remove::RemoveCommand),
    /// Apply a storage event notification (JSON on stdin or from a file)
    Event(event::EventCommand),
}

pub async fn run(command: Command) -> ExitCode {
    match command {
        Command::Add(command) => add::run(command).await,
        Command::Remove(command) => remove::run(command).await,
        Command::Event(command) => event::run(command).await,
    }
}

pub(crate) fn load_config() -> Result<Config, ExitCode> {
    Config::from_env().map_err(|error| {
        eprintln!("Error: {error}");
        ExitCode::FAILURE
    })
}

pub(crate) fn parse_vars(raw: &[String]) -> Result<Variables, ExitCode> {
    let mut variables = Variables::new();
    for entry in raw {
        let Some((name, value)) = entry.split_once('=') else {
            eprintln!("Error: invalid variable {entry:?}, expected NAME=VALUE");
            return Err(ExitCode::FAILURE);
        };
        variables.insert(name.to_string(), value.to_string());
    }
    Ok(variables)
}
