// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The TCTI (TPM Command Transmission Interface) abstraction: the transport
//! between the broker and the TPM itself.
//!
//! The broker core treats the TCTI as an external collaborator: this crate
//! defines the trait the core programs against, plus a loopback fake used
//! in tests and a Linux character-device transport for a real TPM resource
//! manager node (`/dev/tpmrm*`).

mod device;
mod loopback;

use std::sync::Arc;
use std::time::Duration;

pub use device::DeviceTcti;
pub use loopback::LoopbackTcti;
use thiserror::Error;

/// Errors a TCTI call can produce. All are non-fatal to the daemon: the
/// caller (the `Tab` worker) turns them into a synthetic response and keeps
/// the originating session open.
#[derive(Debug, Error)]
pub enum TctiError {
    /// `initialize` failed; this one variant is fatal when it occurs during
    /// daemon startup.
    #[error("failed to initialize TCTI")]
    Initialize(#[source] std::io::Error),
    /// `transmit` failed to hand the command to the TPM.
    #[error("failed to transmit command to TPM")]
    Transmit(#[source] std::io::Error),
    /// `receive` failed to read a response from the TPM.
    #[error("failed to receive response from TPM")]
    Receive(#[source] std::io::Error),
    /// `set_locality` failed.
    #[error("failed to set locality {locality}")]
    SetLocality {
        /// The locality that failed to apply.
        locality: u8,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// `cancel` failed.
    #[error("failed to cancel in-flight command")]
    Cancel(#[source] std::io::Error),
}

/// A handle that can be cloned and invoked from a thread other than the one
/// driving `transmit`/`receive`, to request cancellation of an in-flight
/// command.
///
/// Whether this actually interrupts a pending `receive` depends on the
/// transport: [`supports_concurrent_cancel`] tells the caller (the bus
/// facade's Cancel handler) whether invoking `cancel` here has any effect,
/// or whether it should fall back to the deferred
/// `cancel_pending`-at-next-dequeue path instead.
///
/// [`supports_concurrent_cancel`]: CancelHandle::supports_concurrent_cancel
pub trait CancelHandle: Send + Sync {
    /// Whether `cancel` may be safely called while a `transmit`/`receive`
    /// pair is in flight on another thread.
    fn supports_concurrent_cancel(&self) -> bool;

    /// Request cancellation of whatever command is currently in flight, if
    /// any. A no-op (not an error) if nothing is in flight.
    fn cancel(&self) -> Result<(), TctiError>;
}

/// The transport between the broker and the TPM.
///
/// `transmit`/`receive`/`set_locality`/`initialize` are exclusively owned by
/// the `Tab` worker thread; only [`cancel_handle`] may be shared across
/// threads.
///
/// [`cancel_handle`]: Tcti::cancel_handle
pub trait Tcti: Send {
    /// Perform any one-time setup (open the device, run self-test, etc.)
    /// before the first command is transmitted.
    fn initialize(&mut self) -> Result<(), TctiError>;

    /// Hand a complete, framed command buffer to the TPM.
    fn transmit(&mut self, command: &[u8]) -> Result<(), TctiError>;

    /// Block for a response to the most recently transmitted command. `None`
    /// means wait indefinitely.
    fn receive(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, TctiError>;

    /// Change the locality applied to subsequent commands.
    fn set_locality(&mut self, locality: u8) -> Result<(), TctiError>;

    /// Obtain a cloneable, `Send + Sync` handle that may be used to request
    /// cancellation of an in-flight command from another thread.
    fn cancel_handle(&self) -> Arc<dyn CancelHandle>;
}
