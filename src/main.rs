mod config;
mod endpoint;
mod ems_client;
mod identity;
mod prompt;
mod shc_client;
mod transport;
mod trust;

#[cfg(test)]
mod test_support;

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "shc-ems-syncer",
    about = "Pair with a Bosch Smart Home Controller and talk to an EMS-ESP gateway"
)]
struct Cli {
    /// Path to config.toml
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bosch Smart Home Controller
    #[command(subcommand)]
    Shc(ShcCommands),
    /// EMS-ESP gateway
    #[command(subcommand)]
    Ems(EmsCommands),
}

#[derive(Subcommand)]
enum ShcCommands {
    /// Fetch the controller's public information
    Ping,
    /// Register this client's certificate (press the controller's pairing button first)
    Register {
        /// Read the system password from this file instead of prompting
        #[arg(long)]
        password_file: Option<PathBuf>,
    },
    /// GET a path below /smarthome/ using the registered client certificate
    Get { path: String },
}

#[derive(Subcommand)]
enum EmsCommands {
    /// Read the thermostat set temperature
    Ping,
}

#[tokio::main]
async fn main() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    tracing_subscriber::registry().with(fmt_layer).init();

    let cli = Cli::parse();
    let cfg = config::Config::load(&cli.config)?;

    match cli.command {
        Commands::Shc(command) => {
            let client = cfg.shc_client()?;
            info!("Using SHC at {}", cfg.shc.host);
            match command {
                ShcCommands::Ping => {
                    let body = client.ping().await?;
                    println!("{}", body);
                }
                ShcCommands::Register { password_file } => {
                    let password = match password_file {
                        Some(path) => prompt::password_from_file(&path)?,
                        None => prompt::PromptPassword::new(
                            "Enter Bosch Smart Home system password:",
                        )?
                        .prompt()?,
                    };
                    let result = client.register(&password).await?;
                    println!("Registration successful.");
                    if let Some(message) = result.message.filter(|m| !m.is_empty()) {
                        println!("{}", message);
                    }
                }
                ShcCommands::Get { path } => {
                    let response = client.get(&path).await?;
                    if !response.is_success() {
                        bail!("SHC answered {}: {}", response.status, response.body);
                    }
                    println!("{}", response.body);
                }
            }
        }
        Commands::Ems(EmsCommands::Ping) => {
            let client = cfg.ems_client()?;
            let body = client.ping().await?;
            println!("{}", body);
        }
    }

    Ok(())
}
