// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The AccessBroker ("Tab"): the sole owner of the TCTI, performing one
//! command/response transaction against the TPM at a time.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::SyncSender;
use std::thread;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tabd_protocol::rc;
use tabd_tcti::CancelHandle;
use tabd_tcti::Tcti;
use tracing::warn;

use crate::command::Command;
use crate::command::Response;

/// Owns the TCTI and drains the command queue one entry at a time. No other
/// component ever touches the TCTI directly, except through the
/// [`CancelHandle`] obtained at construction.
pub struct Tab {
    inbound: Mutex<Option<Receiver<Command>>>,
    sink: Mutex<Option<SyncSender<Response>>>,
    tcti: Mutex<Option<Box<dyn Tcti>>>,
    cancel_handle: Arc<dyn CancelHandle>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Tab {
    /// `tcti` must already be initialized (`Tcti::initialize` called) by
    /// the caller, matching `Pipeline::start`'s ordering.
    pub fn new(tcti: Box<dyn Tcti>, inbound: Receiver<Command>) -> Self {
        let cancel_handle = tcti.cancel_handle();
        Self {
            inbound: Mutex::new(Some(inbound)),
            sink: Mutex::new(None),
            tcti: Mutex::new(Some(tcti)),
            cancel_handle,
            handle: Mutex::new(None),
        }
    }

    /// Set the downstream consumer. Must be called exactly once, before
    /// [`Tab::start`].
    pub fn add_sink(&self, sink: SyncSender<Response>) {
        let mut slot = self.sink.lock();
        assert!(slot.is_none(), "Tab::add_sink called twice");
        *slot = Some(sink);
    }

    /// A cloneable handle that may be used to request cancellation of an
    /// in-flight command from another thread, for the bus facade's `Cancel`
    /// handler.
    pub fn cancel_handle(&self) -> Arc<dyn CancelHandle> {
        self.cancel_handle.clone()
    }

    /// Spawn the worker thread.
    pub fn start(self: &Arc<Self>) {
        let inbound = self
            .inbound
            .lock()
            .take()
            .expect("Tab::start called twice");
        let sink = self
            .sink
            .lock()
            .take()
            .expect("Tab::add_sink must be called before start");
        let tcti = self
            .tcti
            .lock()
            .take()
            .expect("Tab::start called twice");

        let handle = thread::Builder::new()
            .name("tabd-access-broker".into())
            .spawn(move || run(inbound, tcti, sink))
            .expect("failed to spawn AccessBroker thread");
        *self.handle.lock() = Some(handle);
    }

    /// Join the worker thread. The thread itself exits once its inbound
    /// channel disconnects (after `CommandSource::stop` drops its sender),
    /// draining any already-queued commands first.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run(inbound: Receiver<Command>, mut tcti: Box<dyn Tcti>, sink: SyncSender<Response>) {
    let mut current_locality: Option<u8> = None;

    while let Ok(command) = inbound.recv() {
        if !command.session.is_open() {
            // Session vanished between dequeue and processing: drop the
            // command, produce no response.
            continue;
        }

        let locality = command.session.locality();
        if current_locality != Some(locality) {
            match tcti.set_locality(locality) {
                Ok(()) => current_locality = Some(locality),
                Err(err) => {
                    warn!(
                        session_id = command.session.id(),
                        %err,
                        "failed to set TCTI locality"
                    );
                }
            }
        }

        let tag = tabd_protocol::header_of(&command.buffer)
            .map(|h| h.tag())
            .unwrap_or(0);

        let response_buffer = if command.session.take_cancel_pending() {
            tabd_protocol::synthetic_response(tag, rc::CANCELED)
        } else {
            transact(&mut *tcti, &command, tag)
        };

        command.session.clear_cancel_pending();

        if sink
            .send(Response {
                session: command.session,
                buffer: response_buffer,
            })
            .is_err()
        {
            break;
        }
    }
}

/// Transmit/receive one command, handling a mid-flight cancel and turning a
/// `TctiError` into a synthetic failure response rather than propagating it
/// out of the loop.
fn transact(tcti: &mut dyn Tcti, command: &Command, tag: u16) -> Vec<u8> {
    if let Err(err) = tcti.transmit(&command.buffer) {
        warn!(session_id = command.session.id(), %err, "TCTI transmit failed");
        return tabd_protocol::synthetic_response(tag, rc::FAILURE);
    }
    match tcti.receive(None) {
        Ok(buffer) => buffer,
        Err(err) => {
            warn!(session_id = command.session.id(), %err, "TCTI receive failed");
            tabd_protocol::synthetic_response(tag, rc::FAILURE)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc::sync_channel;

    use tabd_tcti::LoopbackTcti;
    use tabd_tcti::TctiError;

    use super::*;
    use crate::session::Session;

    fn session(id: u64) -> Arc<Session> {
        let (recv, _client_send) = UnixStream::pair().unwrap();
        let (_client_recv, send) = UnixStream::pair().unwrap();
        Arc::new(Session::new(id, recv, send))
    }

    fn encode(tag: u16, code: u32, body: &[u8]) -> Vec<u8> {
        let size = (10 + body.len()) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&tag.to_be_bytes());
        buf.extend_from_slice(&size.to_be_bytes());
        buf.extend_from_slice(&code.to_be_bytes());
        buf.extend_from_slice(body);
        buf
    }

    #[test]
    fn echoes_through_loopback_tcti() {
        let (cmd_tx, cmd_rx) = sync_channel(1);
        let (resp_tx, resp_rx) = sync_channel(1);
        let mut tcti: Box<dyn Tcti> = Box::new(LoopbackTcti::new());
        tcti.initialize().unwrap();
        let tab = Arc::new(Tab::new(tcti, cmd_rx));
        tab.add_sink(resp_tx);
        tab.start();

        let session = session(1);
        let cmd = encode(0x8001, 0x0000_017a, &[0xDE, 0xAD]);
        cmd_tx
            .send(Command {
                session: session.clone(),
                buffer: cmd.clone(),
            })
            .unwrap();
        let response = resp_rx.recv().unwrap();
        assert_eq!(&response.buffer[..6], &cmd[..6]);
        assert_eq!(&response.buffer[6..10], &0u32.to_be_bytes());

        drop(cmd_tx);
        tab.stop();
    }

    #[test]
    fn dropped_when_session_is_not_open() {
        let (cmd_tx, cmd_rx) = sync_channel(1);
        let (resp_tx, resp_rx) = sync_channel(1);
        let mut tcti: Box<dyn Tcti> = Box::new(LoopbackTcti::new());
        tcti.initialize().unwrap();
        let tab = Arc::new(Tab::new(tcti, cmd_rx));
        tab.add_sink(resp_tx);
        tab.start();

        let session = session(2);
        session.mark_closing();
        cmd_tx
            .send(Command {
                session,
                buffer: encode(0x8001, 0, &[]),
            })
            .unwrap();

        drop(cmd_tx);
        tab.stop();
        assert!(resp_rx.try_recv().is_err());
    }

    #[test]
    fn cancel_before_dispatch_synthesizes_response() {
        let (cmd_tx, cmd_rx) = sync_channel(1);
        let (resp_tx, resp_rx) = sync_channel(1);
        let mut tcti: Box<dyn Tcti> = Box::new(LoopbackTcti::new());
        tcti.initialize().unwrap();
        let tab = Arc::new(Tab::new(tcti, cmd_rx));
        tab.add_sink(resp_tx);
        tab.start();

        let session = session(3);
        session.set_cancel_pending();
        cmd_tx
            .send(Command {
                session,
                buffer: encode(0x8001, 0, &[]),
            })
            .unwrap();
        let response = resp_rx.recv().unwrap();
        assert_eq!(&response.buffer[6..10], &rc::CANCELED.to_be_bytes());
        assert_eq!(response.buffer.len(), 10);

        drop(cmd_tx);
        tab.stop();
    }

    /// An instrumented `Tcti` that records call order and panics on
    /// re-entrancy, asserting that the AccessBroker never has two
    /// concurrent TCTI transmit/receive calls outstanding.
    struct RecordingTcti {
        calls: Arc<Mutex<Vec<String>>>,
        in_use: Arc<std::sync::atomic::AtomicBool>,
    }

    impl RecordingTcti {
        fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    calls: calls.clone(),
                    in_use: Arc::new(std::sync::atomic::AtomicBool::new(false)),
                },
                calls,
            )
        }

        fn enter(&self) {
            assert!(
                !self.in_use.swap(true, std::sync::atomic::Ordering::SeqCst),
                "re-entrant TCTI call observed"
            );
        }

        fn exit(&self) {
            self.in_use.store(false, std::sync::atomic::Ordering::SeqCst);
        }
    }

    impl Tcti for RecordingTcti {
        fn initialize(&mut self) -> Result<(), TctiError> {
            Ok(())
        }

        fn transmit(&mut self, _command: &[u8]) -> Result<(), TctiError> {
            self.enter();
            self.calls.lock().push("transmit".into());
            self.exit();
            Ok(())
        }

        fn receive(&mut self, _timeout: Option<std::time::Duration>) -> Result<Vec<u8>, TctiError> {
            self.enter();
            self.calls.lock().push("receive".into());
            self.exit();
            Ok(encode(0x8001, 0, &[]))
        }

        fn set_locality(&mut self, locality: u8) -> Result<(), TctiError> {
            self.enter();
            self.calls.lock().push(format!("set_locality({locality})"));
            self.exit();
            Ok(())
        }

        fn cancel_handle(&self) -> Arc<dyn CancelHandle> {
            Arc::new(NoopCancelHandle)
        }
    }

    struct NoopCancelHandle;

    impl CancelHandle for NoopCancelHandle {
        fn supports_concurrent_cancel(&self) -> bool {
            false
        }

        fn cancel(&self) -> Result<(), TctiError> {
            Ok(())
        }
    }

    /// `set_locality` is called before `transmit` whenever the session's
    /// locality differs from the TCTI's current one.
    #[test]
    fn set_locality_is_called_before_transmit() {
        let (cmd_tx, cmd_rx) = sync_channel(1);
        let (resp_tx, resp_rx) = sync_channel(1);
        let (recording, calls) = RecordingTcti::new();
        let tab = Arc::new(Tab::new(Box::new(recording), cmd_rx));
        tab.add_sink(resp_tx);
        tab.start();

        let session = session(1);
        session.set_locality(3);
        cmd_tx
            .send(Command {
                session,
                buffer: encode(0x8001, 0, &[]),
            })
            .unwrap();
        resp_rx.recv().unwrap();

        drop(cmd_tx);
        tab.stop();

        let calls = calls.lock();
        assert_eq!(*calls, vec!["set_locality(3)", "transmit", "receive"]);
    }

    /// Unchanged locality on the next command does not re-issue
    /// `set_locality`.
    #[test]
    fn unchanged_locality_is_not_reapplied() {
        let (cmd_tx, cmd_rx) = sync_channel(2);
        let (resp_tx, resp_rx) = sync_channel(2);
        let (recording, calls) = RecordingTcti::new();
        let tab = Arc::new(Tab::new(Box::new(recording), cmd_rx));
        tab.add_sink(resp_tx);
        tab.start();

        let session = session(2);
        for _ in 0..2 {
            cmd_tx
                .send(Command {
                    session: session.clone(),
                    buffer: encode(0x8001, 0, &[]),
                })
                .unwrap();
            resp_rx.recv().unwrap();
        }

        drop(cmd_tx);
        tab.stop();

        let calls = calls.lock();
        let set_locality_calls = calls.iter().filter(|c| c.starts_with("set_locality")).count();
        assert_eq!(set_locality_calls, 1);
    }
}
