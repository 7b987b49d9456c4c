// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The bus facade: translates the three externally-invoked requests
//! (`CreateConnection`, `Cancel`, `SetLocality`) into [`Pipeline`]
//! operations.
//!
//! `BusTransport` is the seam where bus name acquisition and method
//! dispatch live: they are not this crate's concern. A real binding (D-Bus,
//! grpc, whatever the host actually uses) is a thin adapter implementing
//! this trait against a running [`Pipeline`]. [`LocalBusTransport`] is the
//! reference implementation used by tests and by single-process embedding:
//! it performs no IPC of its own.

use std::os::unix::net::UnixStream;
use std::sync::Arc;

use crate::error::BusError;
use crate::pipeline::Pipeline;

/// The three operations the bus layer dispatches to the broker.
pub trait BusTransport: Send + Sync {
    /// `CreateConnection`: allocate a session and hand back its client-side
    /// endpoints and id. Fails only if endpoint allocation or manager
    /// insertion fails.
    fn create_connection(&self) -> Result<(UnixStream, UnixStream, u64), BusError>;

    /// `Cancel`: returns `TPM_RC_SUCCESS` or `TPM_RC_NOT_FOUND`. Never
    /// blocks on the pipeline.
    fn cancel(&self, id: u64) -> u32;

    /// `SetLocality`: returns `TPM_RC_SUCCESS` or `TPM_RC_NOT_FOUND`.
    fn set_locality(&self, id: u64, locality: u8) -> u32;
}

/// The in-process reference implementation of [`BusTransport`].
pub struct LocalBusTransport {
    pipeline: Arc<Pipeline>,
}

impl LocalBusTransport {
    /// Wrap an already-started pipeline. Construction happens only after
    /// `Pipeline::start` returns successfully, so no handler here can ever
    /// observe a partially-initialized system.
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

impl BusTransport for LocalBusTransport {
    fn create_connection(&self) -> Result<(UnixStream, UnixStream, u64), BusError> {
        self.pipeline.create_connection()
    }

    fn cancel(&self, id: u64) -> u32 {
        self.pipeline.cancel(id)
    }

    fn set_locality(&self, id: u64, locality: u8) -> u32 {
        self.pipeline.set_locality(id, locality)
    }
}
