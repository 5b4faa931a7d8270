//! Protocol constants and fixed-width frame helpers shared by the server,
//! the client and the job runner.
//!
//! Every field on the wire has a fixed width: pipe paths and request keys
//! occupy [`MAX_STRING_SIZE`] bytes, notification fields occupy
//! [`EVENT_FRAME_SIZE`] bytes. Shorter strings are NUL-padded.

use std::io::Read;
use std::path::Path;

use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use crate::{KvsError, Result};

/// Maximum number of pairs accepted by one WRITE command.
pub const MAX_WRITE_SIZE: usize = 256;

/// Maximum key/value length in bytes; also the on-wire width of a pipe
/// path or request key field.
pub const MAX_STRING_SIZE: usize = 40;

/// Width of a request frame: opcode byte plus one key field.
pub const REQUEST_FRAME_SIZE: usize = 1 + MAX_STRING_SIZE;

/// Width of one notification field (key or value), NUL terminator included.
pub const EVENT_FRAME_SIZE: usize = MAX_STRING_SIZE + 1;

/// Width of a CONNECT registration frame: opcode plus three pipe paths.
pub const CONNECT_FRAME_SIZE: usize = 1 + 3 * MAX_STRING_SIZE;

/// Maximum number of concurrently served client sessions.
pub const MAX_SESSIONS: usize = 8;

/// Maximum number of keys one session may be subscribed to.
pub const MAX_SUBS: usize = 16;

/// Opcode of a CONNECT registration frame.
pub const OP_CONNECT: u8 = 1;
/// Opcode of a DISCONNECT request.
pub const OP_DISCONNECT: u8 = 2;
/// Opcode of a SUBSCRIBE request.
pub const OP_SUBSCRIBE: u8 = 3;
/// Opcode of an UNSUBSCRIBE request.
pub const OP_UNSUBSCRIBE: u8 = 4;

/// Status byte of a successful CONNECT/DISCONNECT response.
pub const STATUS_SUCCESS: u8 = b'0';
/// Status byte granting a SUBSCRIBE/UNSUBSCRIBE.
pub const STATUS_GRANTED: u8 = b'1';
/// Status byte denying a SUBSCRIBE/UNSUBSCRIBE.
pub const STATUS_DENIED: u8 = b'0';

/// Value field of a delete notification.
pub const DELETED_MARKER: &str = "DELETED";

/// Copies `s` into `dest`, NUL-padding the remainder.
///
/// The caller guarantees `s` fits; [`check_field`] enforces that at the
/// protocol boundary.
fn fill_padded(dest: &mut [u8], s: &str) {
    dest[..s.len()].copy_from_slice(s.as_bytes());
    for byte in dest[s.len()..].iter_mut() {
        *byte = 0;
    }
}

/// Reads the string out of a NUL-padded field.
///
/// Takes the bytes up to the first NUL (or the whole field if none) and
/// validates UTF-8.
pub fn read_padded(field: &[u8]) -> Result<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8(field[..end].to_vec())
        .map_err(|_| KvsError::Protocol("field is not valid UTF-8".to_owned()))
}

/// Rejects strings that do not fit in a fixed-width field.
pub fn check_field(s: &str) -> Result<()> {
    if s.is_empty() {
        return Err(KvsError::Protocol("empty field".to_owned()));
    }
    if s.len() > MAX_STRING_SIZE {
        return Err(KvsError::Protocol(format!(
            "{s:?} exceeds the {MAX_STRING_SIZE}-byte field limit"
        )));
    }
    Ok(())
}

/// Builds the CONNECT registration frame from the three session pipe paths.
pub fn encode_connect(
    req_path: &str,
    resp_path: &str,
    notif_path: &str,
) -> Result<[u8; CONNECT_FRAME_SIZE]> {
    check_field(req_path)?;
    check_field(resp_path)?;
    check_field(notif_path)?;

    let mut frame = [0u8; CONNECT_FRAME_SIZE];
    frame[0] = OP_CONNECT;
    fill_padded(&mut frame[1..1 + MAX_STRING_SIZE], req_path);
    fill_padded(
        &mut frame[1 + MAX_STRING_SIZE..1 + 2 * MAX_STRING_SIZE],
        resp_path,
    );
    fill_padded(
        &mut frame[1 + 2 * MAX_STRING_SIZE..CONNECT_FRAME_SIZE],
        notif_path,
    );
    Ok(frame)
}

/// Splits a CONNECT frame back into `(request, response, notification)`
/// pipe paths. The opcode byte must already have been checked.
pub fn decode_connect(frame: &[u8]) -> Result<(String, String, String)> {
    if frame.len() != CONNECT_FRAME_SIZE {
        return Err(KvsError::Protocol(format!(
            "CONNECT frame has {} bytes, expected {CONNECT_FRAME_SIZE}",
            frame.len()
        )));
    }
    let req = read_padded(&frame[1..1 + MAX_STRING_SIZE])?;
    let resp = read_padded(&frame[1 + MAX_STRING_SIZE..1 + 2 * MAX_STRING_SIZE])?;
    let notif = read_padded(&frame[1 + 2 * MAX_STRING_SIZE..CONNECT_FRAME_SIZE])?;
    if req.is_empty() || resp.is_empty() || notif.is_empty() {
        return Err(KvsError::Protocol("CONNECT frame with empty path".to_owned()));
    }
    Ok((req, resp, notif))
}

/// Builds a SUBSCRIBE/UNSUBSCRIBE request frame.
pub fn encode_key_request(opcode: u8, key: &str) -> Result<[u8; REQUEST_FRAME_SIZE]> {
    check_field(key)?;
    let mut frame = [0u8; REQUEST_FRAME_SIZE];
    frame[0] = opcode;
    fill_padded(&mut frame[1..], key);
    Ok(frame)
}

/// Builds one notification field (key, value, or the DELETED marker).
pub fn encode_event_field(s: &str) -> [u8; EVENT_FRAME_SIZE] {
    let mut frame = [0u8; EVENT_FRAME_SIZE];
    fill_padded(&mut frame, s);
    frame
}

/// Creates a FIFO at `path` with mode 0666. An already existing FIFO is
/// reused.
pub fn create_fifo(path: &Path) -> Result<()> {
    match mkfifo(path, Mode::from_bits_truncate(0o666)) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(e) => Err(KvsError::Sys(e)),
    }
}

/// Reads a two-byte `[opcode, status]` response, checking the opcode.
pub fn read_response(reader: &mut impl Read, expected_op: u8) -> Result<u8> {
    let mut reply = [0u8; 2];
    reader.read_exact(&mut reply)?;
    if reply[0] != expected_op {
        return Err(KvsError::Protocol(format!(
            "response opcode {} does not match request {expected_op}",
            reply[0]
        )));
    }
    Ok(reply[1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_frame_round_trips() {
        let frame = encode_connect("/tmp/req1", "/tmp/resp1", "/tmp/notif1").unwrap();
        assert_eq!(frame.len(), CONNECT_FRAME_SIZE);
        assert_eq!(frame[0], OP_CONNECT);
        let (req, resp, notif) = decode_connect(&frame).unwrap();
        assert_eq!(req, "/tmp/req1");
        assert_eq!(resp, "/tmp/resp1");
        assert_eq!(notif, "/tmp/notif1");
    }

    #[test]
    fn oversized_path_is_refused() {
        let long = "x".repeat(MAX_STRING_SIZE + 1);
        assert!(encode_connect(&long, "/tmp/r", "/tmp/n").is_err());
    }

    #[test]
    fn key_request_is_nul_padded() {
        let frame = encode_key_request(OP_SUBSCRIBE, "alpha").unwrap();
        assert_eq!(frame[0], OP_SUBSCRIBE);
        assert_eq!(&frame[1..6], b"alpha");
        assert!(frame[6..].iter().all(|&b| b == 0));
        assert_eq!(read_padded(&frame[1..]).unwrap(), "alpha");
    }

    #[test]
    fn full_width_field_reads_back_without_nul() {
        let key = "k".repeat(MAX_STRING_SIZE);
        let frame = encode_key_request(OP_UNSUBSCRIBE, &key).unwrap();
        assert_eq!(read_padded(&frame[1..]).unwrap(), key);
    }

    #[test]
    fn event_field_fits_deleted_marker() {
        let frame = encode_event_field(DELETED_MARKER);
        assert_eq!(read_padded(&frame).unwrap(), "DELETED");
        assert_eq!(frame.len(), EVENT_FRAME_SIZE);
    }
}
