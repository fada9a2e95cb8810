//! Multidimensional Pod Autoscaler CLI
//!
//! Inspects MPA objects and checkpoints, previews admission patches and
//! prints the CustomResourceDefinitions.

mod client;
mod commands;
mod output;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commands::{crd, explain, get};
use mpa_lib::FeatureGates;

/// Multidimensional Pod Autoscaler CLI
#[derive(Parser)]
#[command(name = "mpactl")]
#[command(author, version, about = "CLI for the Multidimensional Pod Autoscaler", long_about = None)]
pub struct Cli {
    /// Path to kubeconfig file (uses default if not specified)
    #[arg(long, env = "KUBECONFIG", global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Output format
    #[arg(long, short, default_value = "table", global = true)]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List autoscaler objects
    #[command(subcommand)]
    Get(GetCommands),

    /// Show what the admission webhook would do to a pod
    #[command(subcommand)]
    Explain(ExplainCommands),

    /// Print the CustomResourceDefinitions as JSON
    Crd,
}

#[derive(Subcommand)]
pub enum GetCommands {
    /// List MPAs with their recommendations
    Mpas {
        /// Filter by namespace (all namespaces if not specified)
        #[arg(long, short)]
        namespace: Option<String>,
    },

    /// List recommender checkpoints
    Checkpoints {
        /// Filter by namespace (all namespaces if not specified)
        #[arg(long, short)]
        namespace: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum ExplainCommands {
    /// Compute the resource patch for an existing pod
    Pod {
        /// Pod reference (format: namespace/pod or just pod)
        pod: String,

        /// Feature gates, e.g. InPlaceOrRecreate=true,NativeSidecar=true
        #[arg(long, default_value = "")]
        feature_gates: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let connect = || client::MpaCtlClient::connect(cli.kubeconfig.as_deref());

    match &cli.command {
        Commands::Get(get_cmd) => match get_cmd {
            GetCommands::Mpas { namespace } => {
                get::get_mpas(&connect().await?, namespace.clone(), cli.format).await?;
            }
            GetCommands::Checkpoints { namespace } => {
                get::get_checkpoints(&connect().await?, namespace.clone(), cli.format).await?;
            }
        },
        Commands::Explain(ExplainCommands::Pod { pod, feature_gates }) => {
            let features: FeatureGates = feature_gates
                .parse()
                .with_context(|| format!("Invalid feature gates {:?}", feature_gates))?;
            explain::explain_pod(&connect().await?, pod, features, cli.format).await?;
        }
        // Needs no cluster
        Commands::Crd => crd::print_crds()?,
    }

    Ok(())
}
