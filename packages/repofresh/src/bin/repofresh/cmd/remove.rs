use std::process::ExitCode;

use clap::Args;
use repofresh::repository::{RepositoryOptions, get_repository};

#[derive(Args, Debug)]
pub struct RemoveCommand {
    /// Object key of the package to drop
    pub key: String,

    /// Extra repository template variables
    #[arg(long = "var", value_name = "NAME=VALUE")]
    pub vars: Vec<String>,
}

pub async fn run(command: RemoveCommand) -> ExitCode {
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
    if let Err(error) = repo.remove(&command.key).await {
        eprintln!("Unable to remove package: {error}");
        return ExitCode::FAILURE;
    }
    match repo.close().await {
        Ok(summary) => {
            let filename = command.key.rsplit('/').next().unwrap_or(&command.key);
            println!(
                "Removed package {filename:?} from repository {:?}",
                summary.url
            );
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("Unable to update repository: {error}");
            ExitCode::FAILURE
        }
    }
}
