// Scripted Gateway - Main Entry Point
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// CLI and HTTP server. Tokens are issued here and served by `serve`.
// Usage:
//   scripted-gateway serve [--host H] [--port P]          # Run the gateway
//   scripted-gateway register <root> [--token T]          # Bind a project root
//   scripted-gateway revoke <token>                       # Drop a binding
//   scripted-gateway tokens                               # List bindings
//   scripted-gateway status                               # Show gateway status
//   scripted-gateway config-export <json_file>            # Write effective config

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use scripted_gateway::{
    config::GatewayConfig, paths, projects_db::ProjectsDb, registry::is_token_shaped, server,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "scripted-gateway")]
#[command(author = "Joseph Stone")]
#[command(version)]
#[command(about = "Scripted Gateway - token-confined project file and command gateway")]
struct Cli {
    /// Gateway config file (JSON)
    #[arg(short, long, default_value_os_t = paths::default_config_path())]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway
    Serve {
        /// Listen host (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Listen port (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Bind a project root to a token. Prints the token.
    Register {
        /// Project root directory
        root: PathBuf,

        /// Token to use (lowercase hex, 8+ chars). Random when omitted.
        #[arg(long)]
        token: Option<String>,
    },

    /// Revoke a token
    Revoke {
        token: String,
    },

    /// List registered tokens and their roots
    Tokens,

    /// Show gateway status
    Status,

    /// Export the effective config to a JSON file
    ConfigExport {
        /// Device file to write JSON to
        json_file: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging (safe if already init)
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();

    let cli = Cli::parse();
    let mut config = GatewayConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;
            runtime.block_on(server::run(config))?;
        }

        Commands::Register { root, token } => {
            let root = root
                .canonicalize()
                .with_context(|| format!("Project root not found: {:?}", root))?;
            if !root.is_dir() {
                bail!("Project root is not a directory: {:?}", root);
            }
            let token = match token {
                Some(t) if is_token_shaped(&t) => t,
                Some(t) => bail!("Invalid token {:?}: expected lowercase hex, at least 8 chars", t),
                None => hex::encode(rand::random::<[u8; 16]>()),
            };

            let db = open_projects(&config)?;
            if let Some(previous) = db.get(&token)? {
                log::warn!("Token was bound to {:?}, rebinding", previous);
            }
            db.set(&token, &root)?;
            println!("{}", token);
            log::info!("Registered {:?}", root);
        }

        Commands::Revoke { token } => {
            let db = open_projects(&config)?;
            if db.delete(&token)? {
                println!("Revoked.");
            } else {
                println!("Token not registered.");
                std::process::exit(1);
            }
        }

        Commands::Tokens => {
            let db = open_projects(&config)?;
            let projects = db.list_all()?;
            if projects.is_empty() {
                println!("No projects registered.");
            }
            for (token, root) in projects {
                println!("{}  {}", token, root.display());
            }
        }

        Commands::Status => {
            let db = open_projects(&config)?;
            println!("Scripted Gateway v{}", env!("CARGO_PKG_VERSION"));
            println!("Config:   {:?}", cli.config);
            println!("Listen:   {}:{}", config.host, config.port);
            println!("Client:   {:?}", config.client_dir);
            println!("Data:     {:?}", config.data_dir);
            println!("Projects: {}", db.count()?);
            match config.command_timeout() {
                Some(limit) => println!("Command limit: {}s", limit.as_secs()),
                None => println!("Command limit: none"),
            }
        }

        Commands::ConfigExport { json_file } => {
            config
                .save(&json_file)
                .with_context(|| format!("Failed to write {:?}", json_file))?;
            println!("config-export: wrote {:?}", json_file);
        }
    }

    Ok(())
}

fn open_projects(config: &GatewayConfig) -> Result<ProjectsDb> {
    let path = paths::projects_db_path(&config.data_dir);
    ProjectsDb::open(&path).with_context(|| format!("Failed to open project store at {:?}", path))
}
