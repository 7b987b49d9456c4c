// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The units handed between pipeline stages.

use std::sync::Arc;

use crate::session::Session;

/// A framed command read from a session's receive endpoint, paired with the
/// session it originated from so the eventual response can be routed back.
/// Created by the [`CommandSource`](crate::command_source::CommandSource),
/// consumed exactly once by the [`Tab`](crate::tab::Tab).
pub struct Command {
    /// The session that submitted this command.
    pub session: Arc<Session>,
    /// The complete, header-included command buffer.
    pub buffer: Vec<u8>,
}

/// The response produced for a [`Command`], consumed exactly once by the
/// [`ResponseSink`](crate::response_sink::ResponseSink).
pub struct Response {
    /// The session this response must be routed to.
    pub session: Arc<Session>,
    /// The complete, header-included response buffer.
    pub buffer: Vec<u8>,
}
