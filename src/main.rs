use std::{path::PathBuf, process};

use clap::{Parser, Subcommand, ValueEnum};
use proknow_rs::{Config, Credentials, ProKnow, ProKnowError};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Override the organization URL from the environment variable
    #[clap(short, long, global = true)]
    api_url: Option<String>,
    /// Path to the credentials file of the API key
    #[clap(short, long, global = true)]
    credentials_file: Option<PathBuf>,
    /// Set the log level
    #[arg(value_enum)]
    #[clap(short = 'L', long, default_value = "info", global = true)]
    log_level: LogLevel,
    /// Display timestamps with log messages
    #[clap(short = 'T', long, global = true)]
    timestamp: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload DICOM files or directories to a workspace
    Upload {
        /// Workspace name or id
        workspace: String,
        /// Path to DICOM file(s) or directories
        #[clap(required = true)]
        paths: Vec<PathBuf>,
    },
    /// List the workspaces of the organization
    Workspaces,
    /// List the patients of a workspace
    Patients {
        /// Workspace name or id
        workspace: String,
        /// Only list patients matching this text
        #[clap(short, long)]
        search: Option<String>,
    },
}

#[derive(Copy, Clone, ValueEnum, Debug)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Quiet,
}

#[tokio::main]
pub async fn main() {
    let args = Args::parse();

    tracing_subscriber_handler(&args);

    let pk = match client_from_args(&args) {
        Ok(pk) => pk,
        Err(e) => {
            error!("Error: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run(&pk, args.command).await {
        error!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(pk: &ProKnow, command: Command) -> Result<(), ProKnowError> {
    match command {
        Command::Upload { workspace, paths } => {
            let batch = pk.uploads().upload(&workspace, &paths).await?;
            for patient in batch.patients() {
                println!(
                    "{}\t{}",
                    patient.id(),
                    patient.data()["mrn"].as_str().unwrap_or_default()
                );
                for entity in patient.entities() {
                    println!(
                        "  {}\t{}",
                        entity.id(),
                        entity.data()["type"].as_str().unwrap_or_default()
                    );
                }
            }
            info!("Uploaded {} patients", batch.patients().len());
        }
        Command::Workspaces => {
            for workspace in pk.workspaces().query().await? {
                println!("{}\t{}\t{}", workspace.id(), workspace.slug, workspace.name);
            }
        }
        Command::Patients { workspace, search } => {
            for patient in pk.patients().query(&workspace, search.as_deref()).await? {
                println!("{}\t{}\t{}", patient.id(), patient.mrn(), patient.name());
            }
        }
    }
    Ok(())
}

/// Builds the client from the environment, with the command line flags taking precedence.
fn client_from_args(args: &Args) -> Result<ProKnow, ProKnowError> {
    let base_url = match &args.api_url {
        Some(url) => url.clone(),
        None => Config::base_url_from_env()?,
    };
    let credentials = match &args.credentials_file {
        Some(path) => Credentials::from_file(path)?,
        None => Credentials::from_env()?,
    };
    ProKnow::new(Config::new(base_url, credentials))
}

fn tracing_subscriber_handler(args: &Args) {
    let env_filter = match args.log_level {
        LogLevel::Debug => "proknow_rs=debug",
        LogLevel::Info => "proknow_rs=info",
        LogLevel::Warn => "proknow_rs=warn",
        LogLevel::Error => "proknow_rs=error",
        LogLevel::Quiet => "proknow_rs=off",
    };

    // "if" because the subscriber doesn't yield the same type with or without time wich prevents
    // using a match statement.
    if args.timestamp {
        let sub = tracing_subscriber::fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .finish();
        tracing::subscriber::set_global_default(sub)
            .expect("Error while setting subscriber for tracing.");
    } else {
        let sub = tracing_subscriber::fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .without_time()
            .finish();
        tracing::subscriber::set_global_default(sub)
            .expect("Error while setting subscriber for tracing.");
    };
}
