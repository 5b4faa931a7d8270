//! The session-serving server.
//!
//! The main thread reads CONNECT frames from the registration FIFO and
//! queues them on a bounded channel; a fixed pool of session handler
//! threads consumes registrations and serves one client each. Job files
//! run concurrently on their own worker pool and fan change notifications
//! out to subscribed sessions.
//!
//! SIGUSR1 is the control signal: it drops every live session and purges
//! the subscription registry without stopping job execution. The handler
//! only sets a flag; the registration loop acts on it between reads, and
//! session threads observe their teardown flag on the next request poll.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, info};
use signal_hook::consts::SIGUSR1;

use crate::backup::BackupEngine;
use crate::common::{
    create_fifo, decode_connect, read_padded, CONNECT_FRAME_SIZE, MAX_SESSIONS, MAX_SUBS,
    OP_CONNECT, OP_DISCONNECT, OP_SUBSCRIBE, OP_UNSUBSCRIBE, REQUEST_FRAME_SIZE,
    STATUS_DENIED, STATUS_GRANTED, STATUS_SUCCESS,
};
use crate::job::{Job, JobRunner};
use crate::notifier::Notifier;
use crate::store::Store;
use crate::subscriptions::{NotificationSink, SubscriptionRegistry};
use crate::thread_pool::ThreadPool;
use crate::Result;

/// Pause between empty polls of the registration pipe.
const REGISTER_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Pause between empty polls of a session's request pipe.
const SESSION_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// One dequeued client registration: the trio of pipe paths from a
/// CONNECT frame.
#[derive(Debug, Clone)]
pub struct Registration {
    /// Client-created FIFO the server reads requests from.
    pub request_path: String,
    /// Client-created FIFO the server writes responses to.
    pub response_path: String,
    /// Client-created FIFO the server writes notifications to.
    pub notification_path: String,
}

/// Teardown flags for the active sessions, one slot per handler thread.
///
/// Dropping a session sets its flag; the owning handler observes it on
/// its next request poll, closes the trio of streams itself and clears
/// the slot. Fan-out and the control-signal path both tear down through
/// here.
pub struct SessionTable {
    slots: Mutex<Vec<Option<Arc<AtomicBool>>>>,
}

impl SessionTable {
    /// Creates a table with `capacity` session slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new((0..capacity).map(|_| None).collect()),
        }
    }

    /// Marks one session for teardown. No-op for an empty slot.
    pub fn drop_session(&self, id: usize) {
        let slots = self.slots.lock().unwrap();
        if let Some(Some(closed)) = slots.get(id) {
            closed.store(true, Ordering::SeqCst);
        }
    }

    /// Marks every active session for teardown, returning how many.
    pub fn drop_all(&self) -> usize {
        let slots = self.slots.lock().unwrap();
        let mut dropped = 0;
        for slot in slots.iter().flatten() {
            slot.store(true, Ordering::SeqCst);
            dropped += 1;
        }
        dropped
    }

    /// Number of currently registered sessions.
    pub fn active_count(&self) -> usize {
        self.slots.lock().unwrap().iter().flatten().count()
    }

    fn register(&self, id: usize) -> Arc<AtomicBool> {
        let closed = Arc::new(AtomicBool::new(false));
        self.slots.lock().unwrap()[id] = Some(closed.clone());
        closed
    }

    fn clear(&self, id: usize) {
        self.slots.lock().unwrap()[id] = None;
    }
}

/// Shared state every session handler works against.
struct SessionContext {
    store: Arc<Store>,
    registry: Arc<SubscriptionRegistry>,
    sessions: Arc<SessionTable>,
}

/// The server: job execution plus the client session subsystem.
pub struct KvsServer {
    store: Arc<Store>,
    backups: Arc<BackupEngine>,
    registry: Arc<SubscriptionRegistry>,
    sessions: Arc<SessionTable>,
    notifier: Arc<Notifier>,
    register_path: PathBuf,
    sigusr1: Arc<AtomicBool>,
}

impl KvsServer {
    /// Creates a server around a store and backup engine, registering
    /// the control-signal flag.
    pub fn new(
        store: Arc<Store>,
        backups: Arc<BackupEngine>,
        register_path: PathBuf,
    ) -> Result<Self> {
        let registry = Arc::new(SubscriptionRegistry::new());
        let sessions = Arc::new(SessionTable::new(MAX_SESSIONS));
        let notifier = Arc::new(Notifier::new(registry.clone(), sessions.clone()));

        let sigusr1 = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(SIGUSR1, sigusr1.clone())?;

        Ok(Self {
            store,
            backups,
            registry,
            sessions,
            notifier,
            register_path,
            sigusr1,
        })
    }

    /// The shared store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The fan-out used for this server's change notifications.
    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// The subscription registry.
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// The active-session table.
    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    /// Runs the server: executes `jobs` on a pool of `max_threads`
    /// workers and serves client sessions until the process is killed.
    pub fn run(&self, jobs: Vec<Job>, max_threads: usize) -> Result<()> {
        create_fifo(&self.register_path)?;

        let (tx, rx) = channel::bounded::<Registration>(MAX_SESSIONS);
        self.spawn_session_handlers(rx)?;
        self.spawn_job_dispatcher(jobs, max_threads)?;

        info!(
            "serving registrations on {}",
            self.register_path.display()
        );
        self.registration_loop(&tx)
    }

    fn spawn_session_handlers(&self, rx: Receiver<Registration>) -> Result<()> {
        let ctx = Arc::new(SessionContext {
            store: self.store.clone(),
            registry: self.registry.clone(),
            sessions: self.sessions.clone(),
        });
        for id in 0..MAX_SESSIONS {
            let rx = rx.clone();
            let ctx = ctx.clone();
            thread::Builder::new()
                .name(format!("session-{id}"))
                .spawn(move || {
                    while let Ok(registration) = rx.recv() {
                        if let Err(e) = serve_session(id, &registration, &ctx) {
                            error!("session {id}: {e}");
                        }
                    }
                })?;
        }
        Ok(())
    }

    fn spawn_job_dispatcher(&self, jobs: Vec<Job>, max_threads: usize) -> Result<()> {
        let runner = Arc::new(
            JobRunner::new(self.store.clone(), self.backups.clone())
                .with_notifier(self.notifier.clone()),
        );
        thread::Builder::new()
            .name("job-dispatcher".to_owned())
            .spawn(move || match ThreadPool::new(max_threads) {
                Ok(pool) => {
                    for job in jobs {
                        let runner = runner.clone();
                        pool.spawn(move || {
                            if let Err(e) = runner.run(&job) {
                                error!("job {} failed: {e}", job.input().display());
                            }
                        });
                    }
                    pool.shutdown();
                    info!("job pool drained");
                }
                Err(e) => error!("cannot start job pool: {e}"),
            })?;
        Ok(())
    }

    /// Reads CONNECT frames from the registration FIFO forever.
    ///
    /// The FIFO is opened non-blocking so the loop can act on the
    /// control-signal flag between reads even while no client is
    /// connected.
    fn registration_loop(&self, tx: &Sender<Registration>) -> Result<()> {
        let register = OpenOptions::new()
            .read(true)
            .custom_flags(nix::libc::O_NONBLOCK)
            .open(&self.register_path)?;
        let mut reader: &File = &register;

        let mut frame = [0u8; CONNECT_FRAME_SIZE];
        let mut filled = 0usize;
        loop {
            if self.sigusr1.swap(false, Ordering::SeqCst) {
                self.purge_sessions();
            }

            match reader.read(&mut frame[filled..]) {
                // No writer on the pipe right now; a half-read frame was
                // abandoned by its writer and the next bytes start fresh.
                Ok(0) => {
                    filled = 0;
                    thread::sleep(REGISTER_POLL_INTERVAL);
                }
                Ok(n) => {
                    filled += n;
                    if filled < CONNECT_FRAME_SIZE {
                        continue;
                    }
                    filled = 0;
                    if frame[0] != OP_CONNECT {
                        error!("invalid message received on register pipe");
                        continue;
                    }
                    match decode_connect(&frame) {
                        Ok((request_path, response_path, notification_path)) => {
                            debug!("registration for {response_path}");
                            let _ = tx.send(Registration {
                                request_path,
                                response_path,
                                notification_path,
                            });
                        }
                        Err(e) => error!("invalid registration frame: {e}"),
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(REGISTER_POLL_INTERVAL);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn purge_sessions(&self) {
        let dropped = self.sessions.drop_all();
        self.registry.cleanup();
        info!("control signal: dropped {dropped} sessions and purged all subscriptions");
    }
}

/// Serves one accepted registration to completion.
///
/// Stream opening order pairs with the client: response (write) first so
/// the CONNECT reply unblocks the client, then request (read), then
/// notification (write).
fn serve_session(id: usize, registration: &Registration, ctx: &SessionContext) -> Result<()> {
    let mut response = OpenOptions::new()
        .write(true)
        .open(&registration.response_path)?;
    response.write_all(&[OP_CONNECT, STATUS_SUCCESS])?;

    // Non-blocking so the teardown flag is observed even while idle; the
    // client may not have opened its write end yet (see serve_requests).
    let request = OpenOptions::new()
        .read(true)
        .custom_flags(nix::libc::O_NONBLOCK)
        .open(&registration.request_path)?;
    let notification = OpenOptions::new()
        .write(true)
        .open(&registration.notification_path)?;

    let sink = Arc::new(NotificationSink::new(id, notification));
    let closed = ctx.sessions.register(id);
    info!("session {id}: connected");

    let mut subscribed: Vec<String> = Vec::new();
    let outcome = serve_requests(
        id,
        &request,
        &mut response,
        &sink,
        &closed,
        ctx,
        &mut subscribed,
    );

    // CLOSING: detach only this session's subscriptions, then free the
    // slot. The three streams close when they drop at the end of this
    // call.
    for key in &subscribed {
        ctx.registry.remove(key, id);
    }
    ctx.sessions.clear(id);
    info!("session {id}: closed");
    outcome
}

/// The SERVING state: polls 41-byte request frames and dispatches them.
fn serve_requests(
    id: usize,
    request: &File,
    response: &mut File,
    sink: &Arc<NotificationSink>,
    closed: &AtomicBool,
    ctx: &SessionContext,
    subscribed: &mut Vec<String>,
) -> Result<()> {
    let mut reader: &File = request;
    // EOF on the request pipe means "no writer": before the client opens
    // its end that is normal, afterwards it means the client went away.
    let mut saw_writer = false;

    let mut frame = [0u8; REQUEST_FRAME_SIZE];
    let mut filled = 0usize;
    loop {
        if closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        match reader.read(&mut frame[filled..]) {
            Ok(0) if saw_writer => return Ok(()),
            Ok(0) => thread::sleep(SESSION_POLL_INTERVAL),
            Ok(n) => {
                saw_writer = true;
                filled += n;
                // DISCONNECT is a one-byte frame; every other request
                // carries a key field, so accumulate the full 41 bytes
                // before dispatching on the opcode.
                if frame[0] != OP_DISCONNECT && filled < REQUEST_FRAME_SIZE {
                    continue;
                }
                filled = 0;
                match frame[0] {
                    OP_DISCONNECT => {
                        response.write_all(&[OP_DISCONNECT, STATUS_SUCCESS])?;
                        debug!("session {id}: disconnect");
                        return Ok(());
                    }
                    OP_SUBSCRIBE => {
                        let granted = match read_padded(&frame[1..]) {
                            Ok(key) => {
                                let grant = subscribed.len() < MAX_SUBS
                                    && !subscribed.contains(&key)
                                    && ctx.store.contains(&key);
                                if grant {
                                    ctx.registry.add(&key, sink.clone());
                                    subscribed.push(key.clone());
                                }
                                debug!("session {id}: subscribe {key:?} -> {grant}");
                                grant
                            }
                            Err(_) => false,
                        };
                        let status = if granted { STATUS_GRANTED } else { STATUS_DENIED };
                        response.write_all(&[OP_SUBSCRIBE, status])?;
                    }
                    OP_UNSUBSCRIBE => {
                        let granted = match read_padded(&frame[1..]) {
                            Ok(key) => {
                                let grant = ctx.store.contains(&key)
                                    && subscribed.contains(&key);
                                if grant {
                                    ctx.registry.remove(&key, id);
                                    subscribed.retain(|k| *k != key);
                                }
                                debug!("session {id}: unsubscribe {key:?} -> {grant}");
                                grant
                            }
                            Err(_) => false,
                        };
                        let status = if granted { STATUS_GRANTED } else { STATUS_DENIED };
                        response.write_all(&[OP_UNSUBSCRIBE, status])?;
                    }
                    // An unknown opcode leaves no way to re-frame the
                    // stream: answer the pending request and close.
                    op => {
                        error!("session {id}: unknown request opcode {op}");
                        response.write_all(&[op, STATUS_DENIED])?;
                        return Ok(());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                saw_writer = true;
                thread::sleep(SESSION_POLL_INTERVAL);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
}
