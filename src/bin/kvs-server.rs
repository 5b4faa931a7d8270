use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use kvs::{discover_jobs, BackupEngine, KvsError, KvsServer, Result, Store};

/// Run the job directory and serve client sessions over named pipes.
#[derive(Parser)]
#[command(name = "kvs-server", version, about = "A key-value store server")]
struct Cli {
    /// Directory containing the `.job` files
    jobs_dir: PathBuf,

    /// Maximum number of concurrent job threads
    max_threads: usize,

    /// Maximum number of concurrent backups
    max_backups: usize,

    /// Path of the registration FIFO clients connect through
    register_pipe_path: PathBuf,
}

fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        error!("{}", e);
        exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    if cli.max_backups == 0 {
        return Err(KvsError::Config(
            "maximum concurrent backups must be a positive number".to_owned(),
        ));
    }
    if cli.max_threads == 0 {
        return Err(KvsError::Config(
            "maximum job threads must be a positive number".to_owned(),
        ));
    }
    if !cli.jobs_dir.is_dir() {
        return Err(KvsError::Config(format!(
            "jobs path '{}' does not exist",
            cli.jobs_dir.display()
        )));
    }

    let store = Arc::new(Store::new());
    let backups = Arc::new(BackupEngine::new(cli.max_backups));
    let server = KvsServer::new(store, backups, cli.register_pipe_path)?;

    let jobs = discover_jobs(&cli.jobs_dir)?;
    info!("kvs-server {}", env!("CARGO_PKG_VERSION"));
    info!("{} jobs from {}", jobs.len(), cli.jobs_dir.display());

    server.run(jobs, cli.max_threads)
}
