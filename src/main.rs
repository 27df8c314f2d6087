use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use ferry::commands::{receive, send};
use ferry::TRANSFER_PORT;

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "Secure file transfer between overlay network peers", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send files or directory trees
    Send {
        /// Files or directories to send
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Bind to localhost (127.0.0.1) for containerized environments
        #[arg(long)]
        pod: bool,
        /// Compress data frames with a fast LZ codec
        #[arg(long)]
        compress: bool,
        /// Exclude entries whose path components match this pattern (repeatable)
        #[arg(long = "exclude", value_name = "PATTERN")]
        excludes: Vec<String>,
        /// Also walk venv/cache/VCS directories that are skipped by default
        #[arg(long)]
        include_cache_dirs: bool,
    },
    /// Receive files from a sender
    Receive {
        /// Connection string printed by the sender: ip:token
        connection: String,
        /// Accept a localhost (127.0.0.1) sender for containerized environments
        #[arg(long)]
        pod: bool,
        /// Overwrite conflicting files instead of writing suffixed copies
        #[arg(long)]
        overwrite: bool,
        /// Ignore any existing resume state and start fresh
        #[arg(long)]
        no_resume: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match cli.command {
        Commands::Send {
            paths,
            pod,
            compress,
            excludes,
            include_cache_dirs,
        } => {
            send::run(send::SendConfig {
                paths,
                pod,
                compress,
                excludes,
                skip_cache_dirs: !include_cache_dirs,
                port: TRANSFER_PORT,
                token: None,
            })
            .await?;
        }
        Commands::Receive {
            connection,
            pod,
            overwrite,
            no_resume,
        } => {
            receive::run(receive::ReceiveConfig {
                connection,
                pod,
                overwrite,
                resume: !no_resume,
                port: TRANSFER_PORT,
                target_dir: std::env::current_dir()?,
            })
            .await?;
        }
    }

    Ok(())
}
