use std::process::ExitCode;

use clap::Args;
use repofresh::repository::{RepositoryOptions, get_repository};

#[derive(Args, Debug)]
pub struct AddCommand {
    /// Object key of the package to ingest
    pub key: String,

    /// Keep the source object after it is copied into the repository
    #[arg(long)]
    pub keep_source: bool,

    /// Extra repository template variables
    #[arg(long = "var", value_name = "NAME=VALUE")]
    pub vars: Vec<String>,
}

pub async fn run(command: AddCommand) -> ExitCode {
    let config = match super::load_config() {
        Ok(config) => config,
        Err(code) => return code,
    };
    let variables = match super::parse_vars(&command.vars) {
        Ok(variables) => variables,
        Err(code) => return code,
    };

    let mut repo = match get_repository(
        &command.key,
        &variables,
        &config,
        RepositoryOptions::default(),
    )
    .await
    {
        Ok(repo) => repo,
        Err(error) => {
            eprintln!("Unable to open repository: {error}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(error) = repo.add(&command.key, !command.keep_source).await {
        eprintln!("Unable to add package: {error}");
        return ExitCode::FAILURE;
    }
    match repo.close().await {
        Ok(summary) => {
            let filename = command.key.rsplit('/').next().unwrap_or(&command.key);
            println!("Added package {filename:?} to repository {:?}", summary.url);
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("Unable to update repository: {error}");
            ExitCode::FAILURE
        }
    }
}
