// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error taxonomy. Errors scoped to a single session never affect others;
//! only initialization errors are fatal to the daemon.

use thiserror::Error;

/// A session-scoped transport failure: the recv or send endpoint returned an
/// error other than a clean EOF. Closes the offending session only.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Read or write on a session endpoint failed.
    #[error("session transport error")]
    Transport(#[from] std::io::Error),
}

/// Failures that prevent the daemon from starting at all. All are fatal
/// (`main` exits with status 1).
#[derive(Debug, Error)]
pub enum InitError {
    /// Failed to open or read the entropy source named by `TABD_RAND_FILE`.
    #[error("failed to seed the session id generator from {path}")]
    Entropy {
        /// The entropy source path that failed.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The TCTI failed to initialize.
    #[error("failed to initialize TCTI")]
    Tcti(#[source] tabd_tcti::TctiError),
    /// Allocating the control endpoint used to wake `CommandSource`'s
    /// `poll` wait failed.
    #[error("failed to allocate the pipeline control endpoint")]
    ControlEndpoint(#[source] std::io::Error),
}

/// Errors returned to a bus caller from `CreateConnection`. `Cancel` and
/// `SetLocality` never fail at the bus level: an unknown id is reported as
/// `TPM_RC_NOT_FOUND` in their ordinary `u32` return value instead.
#[derive(Debug, Error)]
pub enum BusError {
    /// Allocating the session's endpoint pair failed.
    #[error("failed to allocate session endpoints")]
    Io(#[from] std::io::Error),
    /// The id generator produced the same id too many times in a row. Not
    /// reachable with a `u64` id space and a well-seeded generator; present
    /// so the retry-on-collision loop has a termination condition instead of
    /// spinning forever.
    #[error("session id space exhausted after {attempts} collisions")]
    IdSpaceExhausted {
        /// Number of consecutive collisions observed before giving up.
        attempts: u32,
    },
}
