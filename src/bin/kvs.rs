use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use kvs::{discover_jobs, BackupEngine, JobRunner, KvsError, Result, Store, ThreadPool};

/// Run every `.job` script in a directory against a fresh store.
#[derive(Parser)]
#[command(name = "kvs", version, about = "A concurrent key-value store job runner")]
struct Cli {
    /// Directory containing the `.job` files
    jobs_dir: PathBuf,

    /// Maximum number of concurrent backups
    max_backups: usize,

    /// Maximum number of concurrent job threads
    max_threads: usize,
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
    if !cli.jobs_dir.is_dir() {
        return Err(KvsError::Config(format!(
            "jobs path '{}' does not exist",
            cli.jobs_dir.display()
        )));
    }

    let store = Arc::new(Store::new());
    let backups = Arc::new(BackupEngine::new(cli.max_backups));
    let runner = Arc::new(JobRunner::new(store, backups));

    let jobs = discover_jobs(&cli.jobs_dir)?;
    info!("running {} jobs from {}", jobs.len(), cli.jobs_dir.display());

    let pool = ThreadPool::new(cli.max_threads)?;
    for job in jobs {
        let runner = runner.clone();
        pool.spawn(move || {
            if let Err(e) = runner.run(&job) {
                error!("job {} failed: {}", job.input().display(), e);
            }
        });
    }
    pool.shutdown();

    Ok(())
}
