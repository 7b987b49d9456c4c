// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A loopback TCTI fake: returns its input with the response-code field
//! overwritten, matching the echo behavior exercised by the daemon's
//! end-to-end tests.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tabd_protocol::HEADER_SIZE;
use tabd_protocol::rc;

use crate::CancelHandle;
use crate::Tcti;
use crate::TctiError;

/// Loopback TCTI: `receive` echoes the last `transmit`-ed buffer back with
/// its response-code field zeroed, or with [`rc::CANCELED`] if a cancel was
/// requested since the last `transmit`.
pub struct LoopbackTcti {
    pending: Option<Vec<u8>>,
    locality: u8,
    cancel_requested: Arc<AtomicBool>,
}

impl LoopbackTcti {
    /// Create a new loopback TCTI. Starts uninitialized; `initialize` must
    /// be called before use, matching every other `Tcti` implementation.
    pub fn new() -> Self {
        Self {
            pending: None,
            locality: 0,
            cancel_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The locality most recently applied via `set_locality`.
    pub fn locality(&self) -> u8 {
        self.locality
    }
}

impl Default for LoopbackTcti {
    fn default() -> Self {
        Self::new()
    }
}

impl Tcti for LoopbackTcti {
    fn initialize(&mut self) -> Result<(), TctiError> {
        Ok(())
    }

    fn transmit(&mut self, command: &[u8]) -> Result<(), TctiError> {
        self.pending = Some(command.to_vec());
        // A cancel request that arrived before this transmit was already
        // consumed by `Tab` as a cancel-before-dispatch, which skips
        // transmit/receive entirely. Reaching here means that earlier
        // flag, if any, belongs to a past command; clear it so it can't be
        // mistaken for a cancel of this one.
        self.cancel_requested.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn receive(&mut self, _timeout: Option<Duration>) -> Result<Vec<u8>, TctiError> {
        let mut response = self
            .pending
            .take()
            .expect("receive called without a preceding transmit");
        let code = if self.cancel_requested.swap(false, Ordering::SeqCst) {
            rc::CANCELED
        } else {
            rc::SUCCESS
        };
        if response.len() >= HEADER_SIZE {
            response[6..10].copy_from_slice(&code.to_be_bytes());
        }
        Ok(response)
    }

    fn set_locality(&mut self, locality: u8) -> Result<(), TctiError> {
        self.locality = locality;
        Ok(())
    }

    fn cancel_handle(&self) -> Arc<dyn CancelHandle> {
        Arc::new(LoopbackCancelHandle {
            cancel_requested: self.cancel_requested.clone(),
        })
    }
}

struct LoopbackCancelHandle {
    cancel_requested: Arc<AtomicBool>,
}

impl CancelHandle for LoopbackCancelHandle {
    fn supports_concurrent_cancel(&self) -> bool {
        true
    }

    fn cancel(&self) -> Result<(), TctiError> {
        self.cancel_requested.store(true, Ordering::SeqCst);
        Ok(())
    }
}
