mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "strand")]
#[command(about = "Checkpointed agent execution runtime", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Append a user message to a thread and run it to completion
    Run {
        /// Thread ID
        #[arg(short, long, default_value = "cli:default")]
        thread: String,

        /// User message
        message: String,

        /// Print the full run outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Continue a thread from its last checkpoint
    Resume {
        /// Thread ID
        #[arg(short, long, default_value = "cli:default")]
        thread: String,

        /// Print the full run outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Serve profile data over the Data Protocol on stdin/stdout
    ServeData {
        /// Profile file (defaults to ~/.strand/user_profile.json)
        #[arg(long)]
        profiles: Option<PathBuf>,

        /// Also expose the built-in finance capabilities
        #[arg(long)]
        finance: bool,
    },

    /// Inspect stored threads
    Thread {
        #[command(subcommand)]
        command: ThreadCommands,
    },

    /// List the capabilities a run can invoke
    Capabilities,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ThreadCommands {
    /// Print the latest checkpointed state of a thread
    Show {
        /// Thread ID
        thread: String,
    },
    /// List the checkpoints of a thread, newest first
    History {
        /// Thread ID
        thread: String,
    },
    /// Delete every checkpoint of a thread
    Delete {
        /// Thread ID
        thread: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries protocol frames under `serve-data`, so logs go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Run { thread, message, json } => {
            commands::run_cmd::run(&thread, &message, json).await?;
        }
        Commands::Resume { thread, json } => {
            commands::run_cmd::resume(&thread, json).await?;
        }
        Commands::ServeData { profiles, finance } => {
            commands::serve::run(profiles, finance).await?;
        }
        Commands::Thread { command } => match command {
            ThreadCommands::Show { thread } => {
                commands::thread_cmd::show(&thread).await?;
            }
            ThreadCommands::History { thread } => {
                commands::thread_cmd::history(&thread).await?;
            }
            ThreadCommands::Delete { thread } => {
                commands::thread_cmd::delete(&thread).await?;
            }
        },
        Commands::Capabilities => {
            commands::capabilities::list().await?;
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                commands::config_cmd::show().await?;
            }
            ConfigCommands::Init { force } => {
                commands::config_cmd::init(force).await?;
            }
        },
    }

    Ok(())
}
