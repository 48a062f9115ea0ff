use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mcpd", version)]
#[command(about = "Local MCP host: pools downstream servers behind one control plane")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Control socket path (defaults to the per-user runtime directory)
    #[arg(long, global = true, env = "MCPD_SOCKET")]
    pub socket: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the host
    Serve {
        /// Catalog file (defaults to ~/.config/mcpd/catalog.yaml)
        #[arg(long, env = "MCPD_CATALOG")]
        catalog: Option<PathBuf>,

        /// Detach and run in the background
        #[arg(long, conflicts_with = "foreground")]
        background: bool,

        /// Stay in the foreground (default)
        #[arg(long)]
        foreground: bool,
    },

    /// Show whether a host is running and what it serves
    Status,

    /// Ask a running host to stop
    Stop,

    /// Ask a running host to reload its catalog
    Reload,

    /// Call one tool through a running host
    Call {
        /// Public tool name, e.g. `github.search_issues`
        name: String,

        /// JSON object with the tool arguments
        #[arg(long, default_value = "{}")]
        args: String,

        /// Sticky routing key
        #[arg(long)]
        routing_key: Option<String>,
    },
}
