//! Operator CLI surface (§6.4): `vaultd init|run|status|account|version`.

pub mod account;
pub mod init;
pub mod run;
pub mod status;
pub mod version;

use clap::{Parser, Subcommand};
use crate::config::VaultConfig;

#[derive(Parser, Debug)]
#[command(name = "vaultd", about = "Operator CLI for a vault in a content-addressed storage network")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

fn default_config_path() -> String {
    VaultConfig::default_path().display().to_string()
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate an Ed25519 identity and write a starter `vault.toml`.
    Init {
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        identity_path: Option<String>,
        #[arg(long)]
        chunkstore_path: Option<String>,
    },
    /// Load the config, open the chunk store, and serve RPCs until shutdown.
    Run {
        #[arg(long)]
        config: Option<String>,
    },
    /// Report this vault's own account and chunk-store usage.
    Status {
        #[arg(long)]
        config: Option<String>,
    },
    /// Look up another PMID's account balance.
    Account {
        /// Hex-encoded PMID to query.
        pmid: String,
        #[arg(long)]
        config: Option<String>,
    },
    /// Print the crate version.
    Version,
}

impl Commands {
    fn config_arg(config: Option<String>) -> String {
        config.unwrap_or_else(default_config_path)
    }
}

pub async fn execute(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Init { config, identity_path, chunkstore_path } => {
            init::execute(Commands::config_arg(config), identity_path, chunkstore_path)
        }
        Commands::Run { config } => run::execute(Commands::config_arg(config)).await,
        Commands::Status { config } => status::execute(Commands::config_arg(config)).await,
        Commands::Account { pmid, config } => account::execute(pmid, Commands::config_arg(config)).await,
        Commands::Version => {
            version::execute();
            Ok(())
        }
    }
}
