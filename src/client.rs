//! The client side of the session protocol.
//!
//! A client creates its three session FIFOs under `/tmp`, posts a
//! CONNECT frame on the server's registration pipe and then talks the
//! fixed-width request/response protocol. Notifications arrive
//! asynchronously on the third pipe and are consumed through
//! [`NotificationStream`].

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use log::debug;

use crate::common::{
    create_fifo, encode_connect, encode_key_request, read_padded, read_response,
    EVENT_FRAME_SIZE, OP_CONNECT, OP_DISCONNECT, OP_SUBSCRIBE, OP_UNSUBSCRIBE,
    STATUS_GRANTED, STATUS_SUCCESS,
};
use crate::{KvsError, Result};

/// A connected session with a kvs server.
pub struct KvsClient {
    request: File,
    response: File,
    notification: Option<File>,
    req_path: PathBuf,
    resp_path: PathBuf,
    notif_path: PathBuf,
}

/// One delivered notification event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The subscribed key now holds this value.
    Write {
        /// The mutated key.
        key: String,
        /// Its new value.
        value: String,
    },
    /// The subscribed key was deleted.
    Delete {
        /// The removed key.
        key: String,
    },
}

/// Blocking iterator over a session's notification events.
pub struct NotificationStream {
    pipe: File,
}

impl KvsClient {
    /// Connects to the server listening on `register_pipe`.
    ///
    /// Creates `/tmp/req<id>`, `/tmp/resp<id>` and `/tmp/notif<id>`,
    /// posts the CONNECT frame and waits for the server's reply.
    pub fn connect(id: &str, register_pipe: &Path) -> Result<Self> {
        let req_path = PathBuf::from(format!("/tmp/req{id}"));
        let resp_path = PathBuf::from(format!("/tmp/resp{id}"));
        let notif_path = PathBuf::from(format!("/tmp/notif{id}"));
        create_fifo(&req_path)?;
        create_fifo(&resp_path)?;
        create_fifo(&notif_path)?;

        let frame = encode_connect(
            path_str(&req_path)?,
            path_str(&resp_path)?,
            path_str(&notif_path)?,
        )?;
        let mut register = OpenOptions::new().write(true).open(register_pipe)?;
        register.write_all(&frame)?;
        debug!("sent CONNECT on {}", register_pipe.display());

        // Open order pairs with the server: response, request,
        // notification.
        let mut response = OpenOptions::new().read(true).open(&resp_path)?;
        let status = read_response(&mut response, OP_CONNECT)?;
        if status != STATUS_SUCCESS {
            return Err(KvsError::Denied("connect"));
        }
        let request = OpenOptions::new().write(true).open(&req_path)?;
        let notification = OpenOptions::new().read(true).open(&notif_path)?;

        Ok(Self {
            request,
            response,
            notification: Some(notification),
            req_path,
            resp_path,
            notif_path,
        })
    }

    /// Asks for notifications on `key`. Returns whether the server
    /// granted the subscription.
    pub fn subscribe(&mut self, key: &str) -> Result<bool> {
        let frame = encode_key_request(OP_SUBSCRIBE, key)?;
        self.request.write_all(&frame)?;
        Ok(read_response(&mut self.response, OP_SUBSCRIBE)? == STATUS_GRANTED)
    }

    /// Cancels a subscription on `key`. Returns whether the server
    /// granted the request.
    pub fn unsubscribe(&mut self, key: &str) -> Result<bool> {
        let frame = encode_key_request(OP_UNSUBSCRIBE, key)?;
        self.request.write_all(&frame)?;
        Ok(read_response(&mut self.response, OP_UNSUBSCRIBE)? == STATUS_GRANTED)
    }

    /// Takes the notification pipe out of the client, typically to hand
    /// it to a dedicated reader thread. Returns `None` after the first
    /// call.
    pub fn take_notifications(&mut self) -> Option<NotificationStream> {
        self.notification
            .take()
            .map(|pipe| NotificationStream { pipe })
    }

    /// Ends the session. The server replies before the streams close.
    pub fn disconnect(mut self) -> Result<()> {
        self.request.write_all(&[OP_DISCONNECT])?;
        let status = read_response(&mut self.response, OP_DISCONNECT)?;
        if status != STATUS_SUCCESS {
            return Err(KvsError::Denied("disconnect"));
        }
        Ok(())
    }
}

impl Drop for KvsClient {
    fn drop(&mut self) {
        // The FIFOs are this client's files; remove them on the way out.
        let _ = fs::remove_file(&self.req_path);
        let _ = fs::remove_file(&self.resp_path);
        let _ = fs::remove_file(&self.notif_path);
    }
}

impl Iterator for NotificationStream {
    type Item = Result<Notification>;

    /// Blocks for the next key/value frame pair. Ends (`None`) when the
    /// server closes the pipe.
    fn next(&mut self) -> Option<Self::Item> {
        let mut key_frame = [0u8; EVENT_FRAME_SIZE];
        match self.pipe.read_exact(&mut key_frame) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return None,
            Err(e) => return Some(Err(e.into())),
        }
        let mut value_frame = [0u8; EVENT_FRAME_SIZE];
        if let Err(e) = self.pipe.read_exact(&mut value_frame) {
            return Some(Err(e.into()));
        }

        let event: Result<Notification> = (|| {
            let key = read_padded(&key_frame)?;
            let value = read_padded(&value_frame)?;
            Ok(if value == crate::common::DELETED_MARKER {
                Notification::Delete { key }
            } else {
                Notification::Write { key, value }
            })
        })();
        Some(event)
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| KvsError::Protocol(format!("non-UTF-8 pipe path {path:?}")))
}
