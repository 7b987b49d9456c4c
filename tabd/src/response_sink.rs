// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Writes each response buffer to the originating session's send endpoint.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::thread;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::warn;

use crate::command::Response;
use crate::session_manager::SessionManager;

/// The terminal pipeline stage: no downstream, so it has no `add_sink`.
pub struct ResponseSink {
    inbound: Mutex<Option<Receiver<Response>>>,
    manager: Arc<SessionManager>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ResponseSink {
    /// Build the stage. Call [`ResponseSink::start`] to spawn its worker
    /// thread.
    pub fn new(inbound: Receiver<Response>, manager: Arc<SessionManager>) -> Self {
        Self {
            inbound: Mutex::new(Some(inbound)),
            manager,
            handle: Mutex::new(None),
        }
    }

    /// Spawn the worker thread.
    pub fn start(self: &Arc<Self>) {
        let inbound = self
            .inbound
            .lock()
            .take()
            .expect("ResponseSink::start called twice");
        let manager = self.manager.clone();
        let handle = thread::Builder::new()
            .name("tabd-response-sink".into())
            .spawn(move || run(inbound, manager))
            .expect("failed to spawn ResponseSink thread");
        *self.handle.lock() = Some(handle);
    }

    /// Join the worker thread. It exits once its inbound channel
    /// disconnects, after `Tab`'s worker thread drops its response sender.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run(inbound: Receiver<Response>, manager: Arc<SessionManager>) {
    while let Ok(response) = inbound.recv() {
        if !response.session.is_open() {
            continue;
        }
        if let Err(err) = response.session.write_response(&response.buffer) {
            warn!(
                session_id = response.session.id(),
                %err,
                "failed to write response; closing session"
            );
            response.session.mark_closing();
            manager.remove(response.session.id());
        }
    }
}
