// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! `tabd`: a user-space broker daemon that multiplexes access to a single
//! TPM 2.0 device among many concurrent client processes.
//!
//! The binary (`main.rs`) is a thin CLI/logging/signal-handling shell
//! around [`pipeline::Pipeline`], which owns the session manager and the
//! three pipeline workers: [`command_source::CommandSource`], [`tab::Tab`]
//! (the "AccessBroker"), and [`response_sink::ResponseSink`].

/// The bus facade: `CreateConnection`/`Cancel`/`SetLocality`.
pub mod bus;
/// The `Command`/`Response` units handed between pipeline stages.
pub mod command;
/// The fan-in worker that frames client commands.
pub mod command_source;
/// The control endpoint that interrupts `CommandSource`'s poll wait.
pub mod control;
/// The daemon's error taxonomy.
pub mod error;
/// Logger selection (`--logger stdout|syslog`).
pub mod logging;
/// The pipeline supervisor: wiring, startup, and shutdown.
pub mod pipeline;
/// The worker that writes responses back to clients.
pub mod response_sink;
/// The entropy-seeded session id generator.
pub mod rng;
/// A single client connection.
pub mod session;
/// The thread-safe session registry.
pub mod session_manager;
/// The AccessBroker ("Tab"): the sole owner of the TCTI.
pub mod tab;
