//! CLI tool for managing routes on a running proxyd
//!
//! Usage:
//!   proxyctl list [--json]
//!   proxyctl add <domain> <target>
//!   proxyctl remove <domain>
//!   proxyctl health

use anyhow::Result;
use clap::{Parser, Subcommand};
use proxyd::ControlClient;
use std::path::PathBuf;

/// CLI tool for managing proxyd routes over the control socket
#[derive(Parser, Debug)]
#[command(name = "proxyctl")]
#[command(version = "1.0.0")]
#[command(about = "Manage routes of a running proxyd")]
struct Args {
    /// Control socket path
    #[arg(long, env = "PROXYD_SOCKET", default_value = "./storage/proxyd.sock")]
    sock: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List all routes
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Add a route, replacing any existing target for the domain
    Add {
        /// Domain name (e.g., api.example.com)
        domain: String,

        /// Backend target (e.g., 127.0.0.1:3000 or https://backend.internal)
        target: String,
    },

    /// Remove a route
    Remove {
        /// Domain name
        domain: String,
    },

    /// Check that the daemon is up
    Health,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let client = ControlClient::new(&args.sock);

    match args.command {
        Commands::List { json } => {
            let routes = client.list().await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&routes)?);
                return Ok(());
            }

            if routes.is_empty() {
                println!("No routes configured");
                return Ok(());
            }

            println!("{:<40} {:<40}", "DOMAIN", "TARGET");
            println!("{}", "-".repeat(81));
            for route in &routes {
                println!("{:<40} {:<40}", route.domain, route.target);
            }
            println!("\nTotal: {} route(s)", routes.len());
        }

        Commands::Add { domain, target } => {
            client.add(&domain, &target).await?;
            println!("Added {} -> {}", domain, target);
        }

        Commands::Remove { domain } => {
            client.remove(&domain).await?;
            println!("Removed {}", domain);
        }

        Commands::Health => {
            client.health().await?;
            println!("ok ({})", client.socket_path().display());
        }
    }

    Ok(())
}
