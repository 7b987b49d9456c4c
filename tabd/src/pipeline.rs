// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The pipeline supervisor: builds the three worker threads, wires their
//! channels, and exposes the bus facade's operations once startup has fully
//! completed.
//!
//! No handler is ever given a reference to a [`Pipeline`] until
//! construction has fully completed, so there is no partially-initialized
//! state a concurrent bus call could observe.

use std::os::unix::net::UnixStream;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::sync_channel;

use socket2::Domain;
use socket2::Socket;
use socket2::Type;
use tabd_protocol::DEFAULT_MAX_CMD;
use tabd_protocol::rc;
use tabd_tcti::Tcti;
use tracing::info;

use crate::command::Command;
use crate::command::Response;
use crate::command_source::CommandSource;
use crate::control::ControlWaker;
use crate::control;
use crate::error::BusError;
use crate::error::InitError;
use crate::response_sink::ResponseSink;
use crate::rng::DEFAULT_RAND_FILE;
use crate::rng::IdGenerator;
use crate::session::Session;
use crate::session_manager::SessionManager;
use crate::tab::Tab;

/// Number of consecutive id collisions `create_connection` tolerates before
/// giving up. Not reachable in practice with a 64-bit id space and a
/// well-seeded generator; it exists only to bound the retry loop.
const MAX_ID_COLLISIONS: u32 = 16;

/// Runtime knobs, exposed as CLI flags (max command size, queue depth) or
/// an environment variable (the entropy source) rather than compiled in.
pub struct PipelineConfig {
    /// Ceiling on a command's declared total size.
    pub max_cmd: u32,
    /// Depth of each pipeline stage's bounded inbound queue.
    pub queue_depth: usize,
    /// Entropy source for the session id generator.
    pub rand_file: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_cmd: DEFAULT_MAX_CMD,
            queue_depth: 64,
            rand_file: PathBuf::from(DEFAULT_RAND_FILE),
        }
    }
}

impl PipelineConfig {
    /// A config tuned for fast, deterministic tests: a shallow queue so
    /// backpressure tests don't need hundreds of in-flight commands.
    pub fn for_tests() -> Self {
        Self {
            queue_depth: 4,
            ..Self::default()
        }
    }
}

/// Owns the three pipeline workers and the session manager, and implements
/// the bus facade's three operations.
pub struct Pipeline {
    manager: Arc<SessionManager>,
    command_source: Arc<CommandSource>,
    tab: Arc<Tab>,
    response_sink: Arc<ResponseSink>,
    id_gen: IdGenerator,
    max_cmd: u32,
}

impl Pipeline {
    /// Seed the id generator, initialize the TCTI, wire the three workers,
    /// and start them. Every failure here is fatal to the daemon; once this
    /// returns `Ok`, the pipeline is fully initialized and ready to hand to
    /// a [`BusTransport`](crate::bus::BusTransport).
    pub fn start(mut tcti: Box<dyn Tcti>, config: PipelineConfig) -> Result<Arc<Self>, InitError> {
        let id_gen = IdGenerator::from_entropy_file(&config.rand_file)?;
        tcti.initialize().map_err(InitError::Tcti)?;

        let (control_writer, mut control_reader) =
            control::pair().map_err(InitError::ControlEndpoint)?;
        control_reader
            .set_nonblocking(true)
            .expect("failed to set control endpoint non-blocking");
        let waker = Arc::new(ControlWaker::new(control_writer));

        let manager = Arc::new(SessionManager::new(waker.clone()));

        let (cmd_tx, cmd_rx) = sync_channel::<Command>(config.queue_depth.max(1));
        let (resp_tx, resp_rx) = sync_channel::<Response>(config.queue_depth.max(1));

        let command_source = Arc::new(CommandSource::new(
            manager.clone(),
            waker,
            control_reader,
            config.max_cmd,
        ));
        command_source.add_sink(cmd_tx);

        let tab = Arc::new(Tab::new(tcti, cmd_rx));
        tab.add_sink(resp_tx);

        let response_sink = Arc::new(ResponseSink::new(resp_rx, manager.clone()));

        command_source.start();
        tab.start();
        response_sink.start();

        info!("tabd pipeline started");

        Ok(Arc::new(Self {
            manager,
            command_source,
            tab,
            response_sink,
            id_gen,
            max_cmd: config.max_cmd,
        }))
    }

    /// Allocate a fresh pair of endpoint pairs, draw an id (retrying on
    /// collision), and register the session. On failure the endpoints are
    /// dropped (closing them) and an error is returned.
    pub fn create_connection(&self) -> Result<(UnixStream, UnixStream, u64), BusError> {
        let (broker_recv, client_send) = socket_pair()?;
        let (client_recv, broker_send) = socket_pair()?;

        let session = Arc::new(Session::new(self.id_gen.next_id(), broker_recv, broker_send));
        let mut attempts = 0;
        loop {
            match self.manager.insert(session.clone()) {
                Ok(()) => return Ok((client_send, client_recv, session.id())),
                Err(_duplicate) => {
                    attempts += 1;
                    if attempts >= MAX_ID_COLLISIONS {
                        return Err(BusError::IdSpaceExhausted { attempts });
                    }
                    session.set_id(self.id_gen.next_id());
                    continue;
                }
            }
        }
    }

    /// Best-effort cancellation: never blocks on the pipeline.
    pub fn cancel(&self, id: u64) -> u32 {
        match self.manager.lookup_by_id(id) {
            Some(session) => {
                session.set_cancel_pending();
                let handle = self.tab.cancel_handle();
                if handle.supports_concurrent_cancel() {
                    let _ = handle.cancel();
                }
                rc::SUCCESS
            }
            None => rc::NOT_FOUND,
        }
    }

    /// Takes effect on the session's next command.
    pub fn set_locality(&self, id: u64, locality: u8) -> u32 {
        match self.manager.lookup_by_id(id) {
            Some(session) => {
                session.set_locality(locality);
                rc::SUCCESS
            }
            None => rc::NOT_FOUND,
        }
    }

    /// The configured ceiling on a command's declared size, for a
    /// `BusTransport` that wants to validate before handing endpoints to a
    /// client.
    pub fn max_cmd(&self) -> u32 {
        self.max_cmd
    }

    /// Stop the three workers in order, join them, and close every
    /// remaining session endpoint. Tearing down the TCTI happens
    /// implicitly: `Tab`'s worker thread owns it and drops it when the
    /// thread exits.
    pub fn shutdown(&self) {
        self.command_source.stop();
        self.tab.stop();
        self.response_sink.stop();
        for session in self.manager.iter_sessions() {
            self.manager.remove(session.id());
        }
    }
}

fn socket_pair() -> std::io::Result<(UnixStream, UnixStream)> {
    let (a, b) = Socket::pair(Domain::UNIX, Type::STREAM, None)?;
    Ok((a.into(), b.into()))
}

/// Resolve the entropy source for the id generator: `TABD_RAND_FILE` if
/// set, else the compiled-in default.
pub fn rand_file_from_env() -> PathBuf {
    std::env::var_os("TABD_RAND_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|| Path::new(DEFAULT_RAND_FILE).to_path_buf())
}
