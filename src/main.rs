mod api;
mod collector;
mod commands;
mod config;
mod server;
mod status;
mod telemetry;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "iiq-companion", version, about = "incidentIQ device companion agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the companion agent (telemetry pipeline + local status API)
    Daemon {
        /// HTTP listen address (overrides config)
        #[arg(long)]
        http_addr: Option<String>,

        /// Log level (overrides config)
        #[arg(long)]
        log_level: Option<String>,

        /// Path to settings file (default: ~/.config/iiq-companion/settings.toml)
        #[arg(long)]
        config: Option<String>,
    },

    /// Run a single telemetry push and print the outcome
    Push {
        /// Output format (table or json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Show the persisted sync status and health summary
    Status {
        /// Output format (table or json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Collect and print the device snapshot without transmitting
    Collect {
        /// Output format (table or json)
        #[arg(long, default_value = "table")]
        format: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            http_addr,
            log_level,
            config,
        } => commands::daemon::run(http_addr, log_level, config),
        Commands::Push { format } => commands::push::run(&format),
        Commands::Status { format } => commands::status::run(&format),
        Commands::Collect { format } => commands::collect::run(&format),
    }
}
