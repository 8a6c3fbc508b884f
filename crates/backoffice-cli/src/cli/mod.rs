//! CLI entry and dispatch.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;

/// Environment variable holding the log filter (e.g. `debug`, `backoffice_core=trace`).
const LOG_ENV: &str = "BACKOFFICE_LOG";

#[derive(Parser)]
#[command(name = "backoffice")]
#[command(version = "0.1")]
#[command(about = "Command line client for the admin console API")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Log in with email and password
    Login {
        #[arg(long)]
        email: String,

        /// Read from stdin when omitted
        #[arg(long, env = "BACKOFFICE_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Log out (clear the stored session)
    Logout,

    /// Show the current user
    Whoami {
        /// Re-fetch the user from the server first
        #[arg(long)]
        refresh: bool,
    },

    /// Override the current user's role locally
    Role {
        #[arg(value_name = "ROLE")]
        role: String,
    },

    /// Send one request with the current session
    Request {
        /// HTTP method (GET, POST, PUT, PATCH, DELETE, ...)
        #[arg(value_name = "METHOD")]
        method: String,

        /// Path relative to the API base URL, or an absolute URL
        #[arg(value_name = "PATH")]
        path: String,

        /// Query parameter, repeatable
        #[arg(long = "query", short = 'q', value_name = "KEY=VALUE", value_parser = commands::request::parse_query)]
        query: Vec<(String, String)>,

        /// JSON request body
        #[arg(long, value_name = "JSON")]
        body: Option<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
    /// Save the API base URL
    SetUrl {
        #[arg(value_name = "URL")]
        url: String,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    init_tracing();

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;

    rt.block_on(async move { dispatch(cli).await })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        eprintln!("failed to install tracing subscriber: {e}");
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let command = match cli.command {
        Commands::Config { command } => return run_config(command),
        command => command,
    };

    let backend = commands::Backend::open().context("open session")?;

    match command {
        Commands::Login { email, password } => {
            commands::auth::login(&backend, &email, password).await
        }
        Commands::Logout => commands::auth::logout(&backend),
        Commands::Whoami { refresh } => commands::auth::whoami(&backend, refresh).await,
        Commands::Role { role } => commands::auth::role(&backend, &role),
        Commands::Request {
            method,
            path,
            query,
            body,
        } => {
            commands::request::run(
                &backend,
                commands::request::RequestArgs {
                    method: &method,
                    path: &path,
                    query,
                    body: body.as_deref(),
                },
            )
            .await
        }
        Commands::Config { command } => run_config(command),
    }
}

fn run_config(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Path => {
            commands::config::path();
            Ok(())
        }
        ConfigCommands::Init => commands::config::init(),
        ConfigCommands::SetUrl { url } => commands::config::set_url(&url),
    }
}
