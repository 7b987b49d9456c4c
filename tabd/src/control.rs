// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The control endpoint that interrupts [`CommandSource`](crate::command_source::CommandSource)'s
//! blocking multiplexed wait whenever the session set changes or shutdown is
//! requested.

use std::io;
use std::io::Write;
use std::os::unix::net::UnixStream;

use parking_lot::Mutex;

/// The writer half of a connected `UnixStream` pair, shared by whichever
/// threads need to interrupt [`CommandSource`](crate::command_source::CommandSource)'s
/// `poll` wait: [`SessionManager`](crate::session_manager::SessionManager)
/// (on insert/remove) and `CommandSource` itself (on `stop`).
pub struct ControlWaker {
    writer: Mutex<UnixStream>,
}

impl ControlWaker {
    /// Wrap the writer half of a control pair.
    pub fn new(writer: UnixStream) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Write one byte to wake a blocked `poll`. Best-effort: if the pipe
    /// buffer is already full a wake is already pending, which serves the
    /// same purpose, so a write error here is not escalated.
    pub fn wake(&self) {
        let mut writer = self.writer.lock();
        let _ = writer.write_all(&[0]);
    }
}

/// Create a connected pair for control signaling. The reader half is given
/// exclusively to `CommandSource`; the writer half is shared (via
/// [`ControlWaker`]) by every thread that needs to interrupt its wait.
pub fn pair() -> io::Result<(UnixStream, UnixStream)> {
    UnixStream::pair()
}
