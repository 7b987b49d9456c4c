// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Logger selection (`--logger {stdout|syslog}`). The binary never calls
//! `println!`/`eprintln!` for diagnostics: every log statement goes through
//! `tracing`, with an `EnvFilter` driven by `RUST_LOG` (defaulting to
//! `info`).

use std::io;
use std::io::Write;
use std::os::unix::net::UnixDatagram;

use tracing_subscriber::EnvFilter;

/// Where log output goes. The real bus/transport selection plumbing lives
/// outside this crate; this is the minimal surface the daemon needs to
/// satisfy `--logger`.
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum LoggerKind {
    /// The default `tracing_subscriber::fmt` writer.
    Stdout,
    /// Forward formatted lines to the local syslog socket.
    Syslog,
}

/// Install the global `tracing` subscriber. Call exactly once, at the top
/// of `main`.
pub fn init(kind: LoggerKind) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match kind {
        LoggerKind::Stdout => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        LoggerKind::Syslog => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(SyslogWriter::connect)
                .without_time()
                .init();
        }
    }
}

/// Formats and forwards log lines to `/dev/log` over a plain
/// `UnixDatagram`, rather than pulling in a dedicated syslog client crate.
/// A fresh socket is opened per log event (`tracing_subscriber` calls
/// `connect` as its `MakeWriter`); log volume here is bounded by session
/// activity, not by guest-triggered events, so the cost is immaterial.
struct SyslogWriter {
    socket: UnixDatagram,
}

impl SyslogWriter {
    fn connect() -> Self {
        let socket = UnixDatagram::unbound().expect("failed to create syslog socket");
        if let Err(err) = socket.connect("/dev/log") {
            // No subscriber is installed yet at this point, so fall back to
            // stderr for this one diagnostic.
            eprintln!("tabd: failed to connect to /dev/log: {err}");
        }
        Self { socket }
    }
}

impl Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // RFC 3164: "<PRI>message". Facility "daemon" (3), severity "info"
        // (6): 3 * 8 + 6 = 30.
        let mut line = Vec::with_capacity(buf.len() + 16);
        line.extend_from_slice(b"<30>tabd: ");
        line.extend_from_slice(buf);
        let _ = self.socket.send(&line);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
