// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A single client connection: its id, its two endpoints, its locality, and
//! its cancellation/lifecycle flags.

use std::io;
use std::io::Read;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use tabd_protocol::HEADER_SIZE;
use tabd_protocol::ProtocolError;
use tabd_protocol::parse_header;
use thiserror::Error;

use crate::error::SessionError;

/// `Session::state`: `Open -> Closing -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered in the manager and eligible to have commands read from
    /// and responses written to it.
    Open,
    /// An endpoint returned EOF, a bus disconnect was observed, or a
    /// transport error occurred; removal from the manager has been
    /// requested but may not have completed yet.
    Closing,
    /// Removed from the manager and drained from every pipeline stage.
    Closed,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Open,
            1 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// A client's logical connection to the broker.
///
/// `recv_endpoint` and `send_endpoint` are each guarded by their own mutex
/// even though, in steady state, exactly one pipeline stage ever touches
/// one of them at a time: the mutex exists so `Session` is `Sync` and
/// cheap to share as an `Arc`, not to arbitrate real contention.
pub struct Session {
    id: AtomicU64,
    recv_fd: RawFd,
    recv_endpoint: Mutex<UnixStream>,
    send_endpoint: Mutex<UnixStream>,
    locality: AtomicU8,
    cancel_pending: AtomicBool,
    state: AtomicU8,
}

impl Session {
    /// Wrap a freshly-allocated endpoint pair as a new, `Open` session.
    pub fn new(id: u64, recv_endpoint: UnixStream, send_endpoint: UnixStream) -> Self {
        let recv_fd = recv_endpoint.as_raw_fd();
        Self {
            id: AtomicU64::new(id),
            recv_fd,
            recv_endpoint: Mutex::new(recv_endpoint),
            send_endpoint: Mutex::new(send_endpoint),
            locality: AtomicU8::new(0),
            cancel_pending: AtomicBool::new(false),
            state: AtomicU8::new(SessionState::Open as u8),
        }
    }

    /// The session's opaque 64-bit id.
    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    /// Overwrite the id. Used only by the `CreateConnection` retry loop to
    /// redraw an id for a session whose endpoints are already allocated,
    /// without tearing them down.
    pub fn set_id(&self, id: u64) {
        self.id.store(id, Ordering::Release);
    }

    /// The raw fd backing `recv_endpoint`, stable for the session's
    /// lifetime. Used by `CommandSource` to arm `poll` without holding the
    /// endpoint's mutex for the duration of the wait.
    pub fn recv_fd(&self) -> RawFd {
        self.recv_fd
    }

    /// The locality applied to this session's next command.
    pub fn locality(&self) -> u8 {
        self.locality.load(Ordering::Acquire)
    }

    /// Update the locality; takes effect on the session's next command.
    pub fn set_locality(&self, locality: u8) {
        self.locality.store(locality, Ordering::Release);
    }

    /// Whether a `Cancel` has been requested since the last command
    /// completed.
    pub fn cancel_pending(&self) -> bool {
        self.cancel_pending.load(Ordering::Acquire)
    }

    /// Set by the bus facade's `Cancel` handler.
    pub fn set_cancel_pending(&self) {
        self.cancel_pending.store(true, Ordering::Release);
    }

    /// Cleared once the next command completion is observed.
    pub fn clear_cancel_pending(&self) {
        self.cancel_pending.store(false, Ordering::Release);
    }

    /// Atomically read and clear the flag, for the "was cancel requested
    /// before transmit" check in `Tab`.
    pub fn take_cancel_pending(&self) -> bool {
        self.cancel_pending.swap(false, Ordering::AcqRel)
    }

    /// The session's lifecycle state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Shorthand for `state() == SessionState::Open`.
    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Transition `Open -> Closing`. A no-op if already `Closing`/`Closed`.
    pub fn mark_closing(&self) {
        let _ = self.state.compare_exchange(
            SessionState::Open as u8,
            SessionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Transition to `Closed`. Called by the manager once the session is
    /// removed from both indexes.
    pub fn mark_closed(&self) {
        self.state.store(SessionState::Closed as u8, Ordering::Release);
    }

    /// Read one framed command from `recv_endpoint`: a 10-byte header,
    /// validated against `max_cmd`, followed by `size - 10` more body
    /// bytes. Partial reads loop until the declared size is reached.
    pub fn read_command(&self, max_cmd: u32) -> Result<Vec<u8>, ReadCommandError> {
        let mut endpoint = self.recv_endpoint.lock();

        let mut header = [0u8; HEADER_SIZE];
        let got = read_fill(&mut endpoint, &mut header)?;
        if got == 0 {
            return Err(ReadCommandError::Eof);
        }
        if got < HEADER_SIZE {
            return Err(ProtocolError::TruncatedHeader { got }.into());
        }

        let parsed = parse_header(&header, max_cmd)?;
        let body_len = parsed.size() as usize - HEADER_SIZE;

        let mut buffer = header.to_vec();
        if body_len > 0 {
            let mut body = vec![0u8; body_len];
            let got_body = read_fill(&mut endpoint, &mut body)?;
            if got_body < body_len {
                return Err(ProtocolError::TruncatedBody {
                    got: got_body,
                    want: body_len,
                }
                .into());
            }
            buffer.extend_from_slice(&body);
        }

        Ok(buffer)
    }

    /// Write one complete response to `send_endpoint`. `write_all` already
    /// retries partial writes until the buffer is fully
    /// written, EOF is hit (surfaced as a `WriteZero` error), or a real
    /// error occurs.
    pub fn write_response(&self, buffer: &[u8]) -> Result<(), SessionError> {
        Ok(self.send_endpoint.lock().write_all(buffer)?)
    }
}

/// Read into `buf` until it is full or EOF is reached, looping across
/// partial reads and retrying on `EINTR`. Returns the number of bytes
/// actually read, which is less than `buf.len()` only on EOF.
fn read_fill(stream: &mut UnixStream, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match stream.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(total)
}

/// Every variant here is scoped to the one session whose endpoint produced
/// it: the caller closes that session and leaves every other session
/// untouched.
#[derive(Debug, Error)]
pub enum ReadCommandError {
    /// The endpoint returned EOF before any header bytes were read: a clean
    /// client disconnect, not a protocol violation.
    #[error("session closed (EOF)")]
    Eof,
    /// A malformed header or a body shorter than declared.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The read itself failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(tag: u16, code: u32, body: &[u8]) -> Vec<u8> {
        let size = (HEADER_SIZE + body.len()) as u32;
        let mut buf = Vec::with_capacity(size as usize);
        buf.extend_from_slice(&tag.to_be_bytes());
        buf.extend_from_slice(&size.to_be_bytes());
        buf.extend_from_slice(&code.to_be_bytes());
        buf.extend_from_slice(body);
        buf
    }

    fn session_pair(id: u64) -> (Session, UnixStream, UnixStream) {
        let (broker_recv, client_send) = UnixStream::pair().unwrap();
        let (client_recv, broker_send) = UnixStream::pair().unwrap();
        (Session::new(id, broker_recv, broker_send), client_send, client_recv)
    }

    #[test]
    fn reads_a_complete_command() {
        let (session, mut client_send, _client_recv) = session_pair(1);
        let cmd = encode(0x8001, 0x0000_017a, &[0xDE, 0xAD, 0xBE, 0xEF]);
        client_send.write_all(&cmd).unwrap();
        let read = session.read_command(4096).unwrap();
        assert_eq!(read, cmd);
    }

    #[test]
    fn reports_eof_on_clean_disconnect() {
        let (session, client_send, _client_recv) = session_pair(2);
        drop(client_send);
        assert!(matches!(
            session.read_command(4096),
            Err(ReadCommandError::Eof)
        ));
    }

    #[test]
    fn reports_protocol_error_on_truncated_body() {
        let (session, mut client_send, _client_recv) = session_pair(3);
        let cmd = encode(0x8001, 0, &[0xDE, 0xAD, 0xBE, 0xEF]);
        client_send.write_all(&cmd[..cmd.len() - 1]).unwrap();
        drop(client_send);
        assert!(matches!(
            session.read_command(4096),
            Err(ReadCommandError::Protocol(ProtocolError::TruncatedBody { .. }))
        ));
    }

    #[test]
    fn writes_a_response_to_the_client() {
        let (session, _client_send, mut client_recv) = session_pair(4);
        let resp = encode(0x8001, 0, &[1, 2, 3]);
        session.write_response(&resp).unwrap();
        let mut buf = vec![0u8; resp.len()];
        client_recv.read_exact(&mut buf).unwrap();
        assert_eq!(buf, resp);
    }

    #[test]
    fn cancel_flag_round_trips() {
        let (session, _client_send, _client_recv) = session_pair(5);
        assert!(!session.cancel_pending());
        session.set_cancel_pending();
        assert!(session.cancel_pending());
        assert!(session.take_cancel_pending());
        assert!(!session.cancel_pending());
    }

    #[test]
    fn state_transitions_are_monotonic() {
        let (session, _client_send, _client_recv) = session_pair(6);
        assert_eq!(session.state(), SessionState::Open);
        session.mark_closing();
        assert_eq!(session.state(), SessionState::Closing);
        session.mark_closed();
        assert_eq!(session.state(), SessionState::Closed);
        // Closing again after Closed must not resurrect the session.
        session.mark_closing();
        assert_eq!(session.state(), SessionState::Closed);
    }
}
