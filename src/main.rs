use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use qsync::config::Config;
use qsync::scanner::Scanner;
use qsync::streaming::IdAllocator;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "qsync",
    about = "Directory synchronization over QUIC",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML file with engine tuning
    #[arg(long, global = true, env = "QSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Receive pushes into a directory
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:4433")]
        listen: SocketAddr,
        /// Destination directory (created if missing)
        #[arg(long)]
        dest: PathBuf,
        /// Shared password clients must know
        #[arg(long, env = "QSYNC_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Push a directory to a server
    Push {
        /// Server address
        #[arg(long)]
        server: SocketAddr,
        /// Source directory
        #[arg(long)]
        source: PathBuf,
        /// Expected blake3 fingerprint of the server certificate (hex)
        #[arg(long, conflicts_with = "password")]
        fingerprint: Option<String>,
        /// Shared password; authenticates both ends instead of a fingerprint
        #[arg(long, env = "QSYNC_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Print the inventory of a directory without syncing
    Scan {
        dir: PathBuf,
    },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "qsync=info",
        1 => "qsync=debug",
        _ => "qsync=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            Config::load(path).with_context(|| format!("Failed to load {}", path.display()))
        }
        None => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Serve {
            listen,
            dest,
            password,
        } => qsync::server::serve(listen, &dest, password.as_deref(), &config).await,
        Command::Push {
            server,
            source,
            fingerprint,
            password,
        } => {
            let stats = qsync::server::push(
                server,
                &source,
                fingerprint.as_deref(),
                password.as_deref(),
                &config,
            )
            .await?;
            println!(
                "{} records, {} files sent ({} bytes)",
                stats.records_advertised, stats.pulls_served, stats.bytes_transferred
            );
            Ok(())
        }
        Command::Scan { dir } => {
            let ids = IdAllocator::new();
            let summary = Scanner::new(&dir)
                .scan(&ids, |record| {
                    println!(
                        "{:>6} {:<11} {:>12} {}{}",
                        record.id,
                        format!("{:?}", record.kind),
                        record.size,
                        record.path,
                        record
                            .link_target
                            .as_deref()
                            .map(|t| format!(" -> {}", t))
                            .unwrap_or_default()
                    );
                    Ok(())
                })
                .with_context(|| format!("Failed to scan {}", dir.display()))?;
            println!(
                "{} files ({} bytes), {} dirs, {} symlinks, {} skipped",
                summary.files, summary.bytes, summary.dirs, summary.symlinks, summary.skipped
            );
            Ok(())
        }
    }
}
