//! Point-in-time backups with a bounded concurrency budget.
//!
//! A backup captures the store under the table read lock, releases it,
//! then serializes the copy and syncs the destination file before
//! returning. At most `max_backups` captures may be in flight across all
//! job workers; further requests block until a slot frees up.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Condvar, Mutex};

use log::debug;

use crate::store::Store;
use crate::Result;

/// Slot-bounded backup executor, shared by every job worker.
pub struct BackupEngine {
    max_backups: usize,
    in_flight: Mutex<usize>,
    reaped: Condvar,
}

impl BackupEngine {
    /// Creates an engine allowing `max_backups` concurrent snapshots.
    pub fn new(max_backups: usize) -> Self {
        Self {
            max_backups: max_backups.max(1),
            in_flight: Mutex::new(0),
            reaped: Condvar::new(),
        }
    }

    /// Snapshots `store` into `dest`, blocking first if the concurrency
    /// budget is exhausted. Returns once the file is durably written.
    pub fn backup(&self, store: &Store, dest: &Path) -> Result<()> {
        let _slot = self.acquire_slot();
        debug!("writing backup {}", dest.display());

        let pairs = store.snapshot();
        let file = File::create(dest)?;
        let mut writer = BufWriter::new(file);
        for (key, value) in &pairs {
            writeln!(writer, "({key}, {value})")?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Number of snapshots currently in flight.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.lock().unwrap()
    }

    fn acquire_slot(&self) -> SlotGuard<'_> {
        let mut count = self.in_flight.lock().unwrap();
        while *count >= self.max_backups {
            count = self.reaped.wait(count).unwrap();
        }
        *count += 1;
        SlotGuard(self)
    }
}

/// Releases the slot on every exit path, including write failures.
struct SlotGuard<'a>(&'a BackupEngine);

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut count = self.0.in_flight.lock().unwrap();
        *count -= 1;
        self.0.reaped.notify_one();
    }
}
