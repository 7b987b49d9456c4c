// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A TCTI transport backed by a Linux TPM resource-manager character device
//! (e.g. `/dev/tpmrm0`). The kernel driver serializes access to the
//! underlying TPM itself; this transport only needs to move bytes.

// UNSAFETY: needed for a raw `poll(2)` call to honor the caller's timeout.
#![expect(unsafe_code)]

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::CancelHandle;
use crate::Tcti;
use crate::TctiError;

/// Maximum response size we're willing to allocate for a single `receive`.
const MAX_RESPONSE: usize = 64 * 1024;

/// A TCTI that reads and writes a TPM resource-manager device node directly.
///
/// The kernel `tpmrm` driver does not expose a cancel primitive to
/// userspace, so [`CancelHandle::supports_concurrent_cancel`] returns
/// `false` here: the bus facade falls back to the deferred
/// `cancel_pending`-at-next-dequeue path for this transport.
pub struct DeviceTcti {
    path: PathBuf,
    file: Option<File>,
    locality: u8,
}

impl DeviceTcti {
    /// Create a transport targeting the given device node. The device is not
    /// opened until [`Tcti::initialize`] is called.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            locality: 0,
        }
    }

    fn file_mut(&mut self) -> Result<&mut File, TctiError> {
        self.file
            .as_mut()
            .ok_or_else(|| TctiError::Transmit(std::io::Error::other("TCTI not initialized")))
    }
}

impl Tcti for DeviceTcti {
    fn initialize(&mut self) -> Result<(), TctiError> {
        debug!(path = %self.path.display(), "opening TPM device");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(TctiError::Initialize)?;
        self.file = Some(file);
        Ok(())
    }

    fn transmit(&mut self, command: &[u8]) -> Result<(), TctiError> {
        self.file_mut()?
            .write_all(command)
            .map_err(TctiError::Transmit)
    }

    fn receive(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, TctiError> {
        if let Some(timeout) = timeout {
            wait_readable(self.file_mut()?, timeout).map_err(TctiError::Receive)?;
        }
        let mut buf = vec![0u8; MAX_RESPONSE];
        let n = self
            .file_mut()?
            .read(&mut buf)
            .map_err(TctiError::Receive)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn set_locality(&mut self, locality: u8) -> Result<(), TctiError> {
        // The tpmrm driver accepts the locality as the high nibble of a
        // dedicated sysfs attribute next to the device node; real hardware
        // TCTIs vary here, which is exactly why this concern is pluggable.
        let attr = locality_attr_path(&self.path);
        std::fs::write(&attr, locality.to_string()).map_err(|source| TctiError::SetLocality {
            locality,
            source,
        })?;
        self.locality = locality;
        Ok(())
    }

    fn cancel_handle(&self) -> Arc<dyn CancelHandle> {
        Arc::new(NoConcurrentCancel)
    }
}

fn locality_attr_path(device: &Path) -> PathBuf {
    let name = device
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Path::new("/sys/class/tpmrm")
        .join(name)
        .join("device/locality")
}

fn wait_readable(file: &File, timeout: Duration) -> std::io::Result<()> {
    let mut fds = [libc::pollfd {
        fd: file.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    }];
    let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    // SAFETY: `fds` is a valid, exclusively-borrowed array of one `pollfd`
    // for the lifetime of the call.
    let ret = unsafe { libc::poll(fds.as_mut_ptr(), 1, millis) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if ret == 0 {
        return Err(std::io::ErrorKind::TimedOut.into());
    }
    Ok(())
}

struct NoConcurrentCancel;

impl CancelHandle for NoConcurrentCancel {
    fn supports_concurrent_cancel(&self) -> bool {
        false
    }

    fn cancel(&self) -> Result<(), TctiError> {
        Ok(())
    }
}
