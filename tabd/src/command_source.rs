// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fan-in worker: multiplexes every live session's receive endpoint into one
//! ordered stream of framed [`Command`]s.

// UNSAFETY: needed to borrow raw fds for `poll` without holding each
// session's endpoint mutex for the duration of the wait.
#![expect(unsafe_code)]

use std::io;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc::SyncSender;
use std::thread;
use std::thread::JoinHandle;

use nix::errno::Errno;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use nix::poll::poll;
use parking_lot::Mutex;
use tracing::debug;
use tracing::warn;

use crate::command::Command;
use crate::control::ControlWaker;
use crate::session::ReadCommandError;
use crate::session::Session;
use crate::session_manager::SessionManager;

/// Watches every session's receive endpoint and emits one [`Command`] per
/// framed read.
pub struct CommandSource {
    manager: Arc<SessionManager>,
    waker: Arc<ControlWaker>,
    control_rx: Mutex<Option<UnixStream>>,
    sink: Mutex<Option<SyncSender<Command>>>,
    running: Arc<AtomicBool>,
    max_cmd: u32,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CommandSource {
    /// `control_rx` must already be set non-blocking: reads on it only ever
    /// happen after `poll` reports it readable, but draining must not block
    /// if more than one wake-byte is pending.
    pub fn new(
        manager: Arc<SessionManager>,
        waker: Arc<ControlWaker>,
        control_rx: UnixStream,
        max_cmd: u32,
    ) -> Self {
        Self {
            manager,
            waker,
            control_rx: Mutex::new(Some(control_rx)),
            sink: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            max_cmd,
            handle: Mutex::new(None),
        }
    }

    /// Set the downstream consumer. Must be called exactly once, before
    /// [`CommandSource::start`].
    pub fn add_sink(&self, sink: SyncSender<Command>) {
        let mut slot = self.sink.lock();
        assert!(slot.is_none(), "CommandSource::add_sink called twice");
        *slot = Some(sink);
    }

    /// Spawn the worker thread.
    pub fn start(self: &Arc<Self>) {
        let sink = self
            .sink
            .lock()
            .take()
            .expect("CommandSource::add_sink must be called before start");
        let control_rx = self
            .control_rx
            .lock()
            .take()
            .expect("CommandSource::start called twice");
        let manager = self.manager.clone();
        let running = self.running.clone();
        let max_cmd = self.max_cmd;

        self.running.store(true, Ordering::Release);
        let handle = thread::Builder::new()
            .name("tabd-command-source".into())
            .spawn(move || run(manager, control_rx, sink, running, max_cmd))
            .expect("failed to spawn CommandSource thread");
        *self.handle.lock() = Some(handle);
    }

    /// Request cooperative shutdown and join. Dropping `sink` when the
    /// worker thread exits is what lets the `Tab` worker downstream observe
    /// end-of-stream.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.waker.wake();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run(
    manager: Arc<SessionManager>,
    mut control_rx: UnixStream,
    sink: SyncSender<Command>,
    running: Arc<AtomicBool>,
    max_cmd: u32,
) {
    let control_fd = control_rx.as_raw_fd();

    while running.load(Ordering::Acquire) {
        let sessions = manager.iter_sessions();
        let mut fds = Vec::with_capacity(sessions.len() + 1);
        // SAFETY: `control_fd` is owned by `control_rx`, which outlives
        // this `poll` call and is not otherwise touched until after it
        // returns.
        fds.push(PollFd::new(
            unsafe { BorrowedFd::borrow_raw(control_fd) },
            PollFlags::POLLIN,
        ));
        for session in &sessions {
            // SAFETY: `session` is kept alive in `sessions` for the
            // duration of this `poll` call, so its recv fd stays open.
            fds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(session.recv_fd()) },
                PollFlags::POLLIN,
            ));
        }

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(err) => {
                warn!(%err, "poll failed in command source, stopping");
                break;
            }
        }

        if ready(&fds[0]) {
            drain_control(&mut control_rx);
            continue;
        }

        for (session, pfd) in sessions.iter().zip(fds.iter().skip(1)) {
            if !ready(pfd) {
                continue;
            }
            if !handle_ready_session(&manager, session, &sink, max_cmd) {
                return;
            }
        }
    }
}

/// Read one command from `session` and forward it downstream. On EOF or a
/// protocol/transport error, close the session and leave every other
/// session unaffected. Returns `false` only if the downstream sink has
/// disconnected, in which case the whole worker stops.
fn handle_ready_session(
    manager: &Arc<SessionManager>,
    session: &Arc<Session>,
    sink: &SyncSender<Command>,
    max_cmd: u32,
) -> bool {
    match session.read_command(max_cmd) {
        Ok(buffer) => sink
            .send(Command {
                session: session.clone(),
                buffer,
            })
            .is_ok(),
        Err(ReadCommandError::Eof) => {
            debug!(session_id = session.id(), "session closed (EOF)");
            session.mark_closing();
            manager.remove(session.id());
            true
        }
        Err(err) => {
            warn!(session_id = session.id(), %err, "closing session after read error");
            session.mark_closing();
            manager.remove(session.id());
            true
        }
    }
}

fn ready(pfd: &PollFd<'_>) -> bool {
    pfd.revents()
        .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
        .unwrap_or(false)
}

fn drain_control(control_rx: &mut UnixStream) {
    let mut buf = [0u8; 64];
    loop {
        match control_rx.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(_) => break,
        }
    }
}
