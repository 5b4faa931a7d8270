#![deny(missing_docs)]

//! A concurrent in-memory key-value store.
//!
//! The store routes keys into per-letter buckets guarded by per-entry
//! reader/writer locks, executes `.job` script files on a bounded worker
//! pool, takes slot-bounded point-in-time backups, and serves client
//! sessions over named pipes with asynchronous change notifications on
//! subscribed keys.

mod backup;
mod client;
pub mod common;
mod error;
mod job;
mod notifier;
mod parser;
mod server;
mod store;
mod subscriptions;
mod thread_pool;

pub use backup::BackupEngine;
pub use client::{KvsClient, Notification, NotificationStream};
pub use error::{KvsError, Result};
pub use job::{discover_jobs, Job, JobRunner};
pub use notifier::Notifier;
pub use parser::{parse_client_line, parse_line, ClientCommand, Command, CommandStream};
pub use server::{KvsServer, Registration, SessionTable};
pub use store::{DeleteOutcome, Store};
pub use subscriptions::{NotificationSink, SubscriptionRegistry};
pub use thread_pool::ThreadPool;
