use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "migrate",
    version,
    about = "Mailbox migration from Microsoft 365 to IMAP"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration directory (default: ~/.mailferry/config)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Skip messages already present on disk (download stage)
    #[arg(long, global = true)]
    resume: bool,

    /// Redownload or re-upload regardless of existing data
    #[arg(long, global = true)]
    force: bool,

    /// Clear all migration state before the stage runs
    #[arg(long, global = true)]
    reset: bool,

    /// Output structured JSON where supported
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check configuration permissions and connectivity to both servers
    Verify,
    /// Download all mailbox folders to the local content store
    Download,
    /// Upload the local content store to the target IMAP server
    Upload,
    /// Show migration counters and per-folder progress
    Status,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = commands::dispatch(cli).await;
    std::process::exit(code);
}

mod commands {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use mailferry::config::Config;
    use mailferry::driver::{Driver, Stage, StageFlags, EXIT_CONFIG};

    use super::{Cli, Commands};

    pub async fn dispatch(cli: Cli) -> i32 {
        let config_dir = match cli.config.clone().map(Ok).unwrap_or_else(Config::default_config_dir) {
            Ok(dir) => dir,
            Err(error) => {
                eprintln!("error: {error}");
                return EXIT_CONFIG;
            }
        };

        let config = match Config::load(&config_dir) {
            Ok(config) => config,
            Err(error) => {
                eprintln!("error: {error}");
                return EXIT_CONFIG;
            }
        };

        let flags = StageFlags {
            resume: cli.resume,
            force: cli.force,
            reset: cli.reset,
        };
        let stage = match cli.command {
            Commands::Verify => Stage::Verify,
            Commands::Download => Stage::Download,
            Commands::Upload => Stage::Upload,
            Commands::Status => Stage::Status,
        };

        // On interrupt the driver stops dispatching new work, drains what is
        // in flight, and exits with the abort code.
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let cancelled = cancelled.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("interrupt received, finishing in-flight work");
                    cancelled.store(true, Ordering::SeqCst);
                }
            });
        }

        let driver = Driver::new(config, flags, cancelled);
        driver.run(stage, cli.json).await
    }
}
