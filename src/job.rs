//! Job files and the runner that executes them.
//!
//! A job is a `.job` script; its results go to the sibling `.out` file
//! and its backups to `<stem>-<N>.bck`. The runner drives a parsed
//! command stream against the store, the backup engine and, in server
//! mode, the notification fan-out.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::debug;
use walkdir::WalkDir;

use crate::backup::BackupEngine;
use crate::notifier::Notifier;
use crate::parser::{Command, CommandStream};
use crate::store::Store;
use crate::Result;

const HELP_TEXT: &str = "Available commands:\n\
    \x20 WRITE [(key,value)(key2,value2),...]\n\
    \x20 READ [key,key2,...]\n\
    \x20 DELETE [key,key2,...]\n\
    \x20 SHOW\n\
    \x20 WAIT <delay_ms>\n\
    \x20 BACKUP\n\
    \x20 HELP\n";

/// One `.job` file and its derived output paths.
#[derive(Debug, Clone)]
pub struct Job {
    input: PathBuf,
    output: PathBuf,
    backup_stem: PathBuf,
}

impl Job {
    /// Builds a job from a `.job` path. Returns `None` for any other
    /// extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        if path.extension()? != "job" {
            return None;
        }
        Some(Self {
            input: path.to_owned(),
            output: path.with_extension("out"),
            backup_stem: path.with_extension(""),
        })
    }

    /// The `.job` script path.
    pub fn input(&self) -> &Path {
        &self.input
    }

    /// The `.out` results path.
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// The path of this job's `n`-th backup.
    pub fn backup_path(&self, n: usize) -> PathBuf {
        let mut name = self.backup_stem.as_os_str().to_owned();
        name.push(format!("-{n}.bck"));
        PathBuf::from(name)
    }
}

/// Lists the `.job` files directly inside `dir`, sorted by path.
pub fn discover_jobs(dir: &Path) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            crate::KvsError::Config(format!("cannot walk {}: {e}", dir.display()))
        })?;
        if let Some(job) = Job::from_path(entry.path()) {
            jobs.push(job);
        }
    }
    Ok(jobs)
}

/// Executes job scripts against the shared store.
pub struct JobRunner {
    store: Arc<Store>,
    backups: Arc<BackupEngine>,
    notifier: Option<Arc<Notifier>>,
}

impl JobRunner {
    /// Creates a runner for job-only mode (no notifications).
    pub fn new(store: Arc<Store>, backups: Arc<BackupEngine>) -> Self {
        Self {
            store,
            backups,
            notifier: None,
        }
    }

    /// Attaches the server's fan-out so WRITE/DELETE notify subscribers.
    pub fn with_notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Runs one job to completion, writing its `.out` file.
    ///
    /// A malformed or failing command is reported and the job continues;
    /// only an unusable input or output file aborts the job.
    pub fn run(&self, job: &Job) -> Result<()> {
        let input = BufReader::new(File::open(job.input())?);
        let mut out = BufWriter::new(File::create(job.output())?);
        let result = self.run_commands(job, CommandStream::new(input), &mut out);
        out.flush()?;
        result
    }

    fn run_commands(
        &self,
        job: &Job,
        commands: CommandStream<impl BufRead>,
        out: &mut impl Write,
    ) -> Result<()> {
        let mut backup_count = 0usize;

        for command in commands {
            debug!("{}: {command:?}", job.input().display());
            match command {
                Command::Write(pairs) => {
                    if let Err(e) = self.store.write(&pairs) {
                        eprintln!("Failed to write pair: {e}");
                        continue;
                    }
                    if let Some(notifier) = &self.notifier {
                        for (key, value) in &pairs {
                            notifier.notify_write(key, value);
                        }
                    }
                }
                Command::Read(keys) => {
                    let results = self.store.read(&keys);
                    write!(out, "[")?;
                    for (key, value) in &results {
                        match value {
                            Some(v) => write!(out, "({key},{v})")?,
                            None => write!(out, "({key},KVSERROR)")?,
                        }
                    }
                    writeln!(out, "]")?;
                }
                Command::Delete(keys) => {
                    let outcome = self.store.delete(&keys);
                    if !outcome.missing.is_empty() {
                        write!(out, "[")?;
                        for key in &outcome.missing {
                            write!(out, "({key},KVSMISSING)")?;
                        }
                        writeln!(out, "]")?;
                    }
                    if let Some(notifier) = &self.notifier {
                        for key in &outcome.deleted {
                            notifier.notify_delete(key);
                            notifier.registry().remove_key(key);
                        }
                    }
                }
                Command::Show => {
                    self.store.show(out)?;
                }
                Command::Wait(ms) => {
                    if ms > 0 {
                        out.write_all(b"Waiting...\n")?;
                        out.flush()?;
                        thread::sleep(Duration::from_millis(ms));
                    }
                }
                Command::Backup => {
                    let dest = job.backup_path(backup_count + 1);
                    match self.backups.backup(&self.store, &dest) {
                        Ok(()) => backup_count += 1,
                        Err(e) => eprintln!("Failed to perform backup: {e}"),
                    }
                }
                Command::Help => {
                    print!("{HELP_TEXT}");
                }
                Command::Invalid => {
                    eprintln!("Invalid command. See HELP for usage");
                }
                Command::Empty => {}
            }
        }
        Ok(())
    }
}
