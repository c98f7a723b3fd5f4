use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cidr;
mod cli;
#[cfg(feature = "aws")]
mod cloudformation;
mod conformance;
mod echo;
mod error;
mod settings;
mod stack;
mod template;

use template::TemplateFormat;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render the CloudFormation template for the stack
    #[command(visible_alias = "s")]
    Synth {
        /// Template encoding
        #[arg(long, short, value_enum, default_value = "json")]
        format: TemplateFormat,
        /// Write the template to this file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Run the structural checks against the rendered template
    #[command(visible_alias = "c")]
    Check,
    /// List resources, their dependencies and the creation order
    #[command(visible_alias = "ls")]
    Resources,
    /// Create or update the stack
    #[cfg(feature = "aws")]
    Deploy {
        /// Return once the change is submitted
        #[arg(long)]
        no_wait: bool,
    },
    /// Delete the stack
    #[cfg(feature = "aws")]
    Destroy {
        /// Return once the deletion is submitted
        #[arg(long)]
        no_wait: bool,
    },
    /// Run the echo server that the pipeline packages
    EchoServer {
        /// Address to bind (overrides settings)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides settings)
        #[arg(long, short)]
        port: Option<u16>,
    },
    /// Check configuration for errors and unused options
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        // stdout carries rendered templates
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Synth { format, output } => cli::synth::handle_synth(format, output.as_deref()),
        Commands::Check => cli::check::handle_check(),
        Commands::Resources => cli::resources::handle_resources(),
        #[cfg(feature = "aws")]
        Commands::Deploy { no_wait } => cli::deploy::handle_deploy(no_wait).await,
        #[cfg(feature = "aws")]
        Commands::Destroy { no_wait } => cli::deploy::handle_destroy(no_wait).await,
        Commands::EchoServer { host, port } => cli::echo::handle_echo_server(host, port).await,
        Commands::CheckConfig => cli::handle_check_config(),
    }
}
