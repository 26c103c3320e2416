// ABOUTME: Entry point for the machine-ssh CLI application.
// ABOUTME: Builds a RemoteClient from flags and settings, then runs one operation.

mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use machine_ssh::config::{self, ClientFactory, ClientSettings};
use machine_ssh::error::{Error, Result};
use machine_ssh::ssh::{Credential, RemoteClient};
use std::env;
use std::io::Write;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = match &cli.config {
        Some(path) => ClientSettings::load(path)?,
        None => ClientSettings::default(),
    };

    let default_user = env::var("USER").unwrap_or_else(|_| "root".to_string());
    let endpoint = config::parse_endpoint(&cli.target, &default_user)?;
    let credential = load_credential(&cli)?;
    let factory = ClientFactory::new(settings);
    let client = factory.client(endpoint, credential);

    let result = execute(&client, cli.command).await;
    factory.shutdown().await;
    result
}

fn load_credential(cli: &Cli) -> Result<Credential> {
    let Some(key_path) = &cli.key else {
        return Ok(Credential::none());
    };
    let key = std::fs::read(key_path)?;

    let passphrase = match &cli.passphrase_env {
        Some(var) => Some(env::var(var).map_err(|_| Error::MissingEnvVar(var.clone()))?),
        None => None,
    };
    Ok(Credential::new(key, passphrase.as_deref()))
}

async fn execute(client: &RemoteClient, command: Commands) -> Result<()> {
    match command {
        Commands::Run { command } => client.run(&command).await?,
        Commands::Output { command } => {
            let result = client.run_for_output(&command).await?;
            std::io::stdout().write_all(&result.output)?;
            if let Some(err) = result.exit_error() {
                return Err(err.into());
            }
        }
        Commands::Kubeconfig => {
            let kubeconfig = client.kubeconfig_bytes().await?;
            std::io::stdout().write_all(&kubeconfig)?;
        }
        Commands::Copy {
            local,
            remote,
            mode,
        } => {
            let content = std::fs::read(&local)?;
            client.write_file_with_mode(&content, &remote, mode).await?;
        }
        Commands::Authorize { public_key } => {
            let key = std::fs::read_to_string(&public_key)?;
            client.authorize_public_key(&key).await?;
        }
        Commands::Revoke { public_key } => {
            let key = std::fs::read_to_string(&public_key)?;
            client.revoke_public_key(&key).await?;
        }
    }
    Ok(())
}
