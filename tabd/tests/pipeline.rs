// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end tests driving the full [`Pipeline`] through
//! [`LocalBusTransport`] with a [`LoopbackTcti`], exactly the way a real
//! client process and a real bus binding would.

use std::io::Read;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tabd::bus::BusTransport;
use tabd::bus::LocalBusTransport;
use tabd::pipeline::Pipeline;
use tabd::pipeline::PipelineConfig;
use tabd_protocol::rc;
use tabd_tcti::LoopbackTcti;

fn start() -> LocalBusTransport {
    let pipeline = Pipeline::start(Box::new(LoopbackTcti::new()), PipelineConfig::for_tests())
        .expect("pipeline starts");
    LocalBusTransport::new(pipeline)
}

fn encode(tag: u16, code: u32, body: &[u8]) -> Vec<u8> {
    let size = (10 + body.len()) as u32;
    let mut buf = Vec::with_capacity(size as usize);
    buf.extend_from_slice(&tag.to_be_bytes());
    buf.extend_from_slice(&size.to_be_bytes());
    buf.extend_from_slice(&code.to_be_bytes());
    buf.extend_from_slice(body);
    buf
}

fn read_framed(stream: &mut UnixStream) -> Vec<u8> {
    let mut header = [0u8; 10];
    stream.read_exact(&mut header).expect("read header");
    let size = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
    let mut body = vec![0u8; size - 10];
    stream.read_exact(&mut body).expect("read body");
    let mut full = header.to_vec();
    full.extend_from_slice(&body);
    full
}

/// A loopback TCTI returns its input with the response-code field zeroed.
#[test]
fn echoes_command_through_loopback_tcti() {
    let transport = start();
    let (mut client_send, mut client_recv, _id) =
        transport.create_connection().expect("connection created");

    let cmd = encode(0x8001, 0x0000_017a, &[0xDE, 0xAD]);
    client_send.write_all(&cmd).unwrap();

    let response = read_framed(&mut client_recv);
    assert_eq!(&response[..6], &cmd[..6]);
    assert_eq!(&response[6..10], &0u32.to_be_bytes());
    assert_eq!(&response[10..], &cmd[10..]);
}

/// Two clients each submit 100 distinct commands; per-client response order
/// matches per-client command order and neither client observes the
/// other's buffers.
#[test]
fn two_clients_interleave_without_corruption() {
    let transport = start();
    let (mut a_send, mut a_recv, _a_id) = transport.create_connection().unwrap();
    let (mut b_send, mut b_recv, _b_id) = transport.create_connection().unwrap();

    let a_writer = thread::spawn(move || {
        for i in 0..100u32 {
            let cmd = encode(0x8001, i, &i.to_be_bytes());
            a_send.write_all(&cmd).unwrap();
        }
        a_send
    });
    let b_writer = thread::spawn(move || {
        for i in 0..100u32 {
            let cmd = encode(0x8002, i + 1000, &(i + 1000).to_be_bytes());
            b_send.write_all(&cmd).unwrap();
        }
        b_send
    });

    for i in 0..100u32 {
        let resp = read_framed(&mut a_recv);
        assert_eq!(&resp[10..], &i.to_be_bytes());
    }
    for i in 0..100u32 {
        let resp = read_framed(&mut b_recv);
        assert_eq!(&resp[10..], &(i + 1000).to_be_bytes());
    }

    a_writer.join().unwrap();
    b_writer.join().unwrap();
}

/// A cancel issued before the AccessBroker dequeues the command synthesizes
/// a `TPM_RC_CANCELED` response with an empty body.
#[test]
fn cancel_before_dispatch_synthesizes_canceled_response() {
    let transport = start();
    let (mut client_send, mut client_recv, id) = transport.create_connection().unwrap();

    assert_eq!(transport.cancel(id), rc::SUCCESS);

    let cmd = encode(0x8001, 0x0000_017a, &[0xDE, 0xAD, 0xBE, 0xEF]);
    client_send.write_all(&cmd).unwrap();

    let response = read_framed(&mut client_recv);
    assert_eq!(response.len(), 10);
    assert_eq!(&response[6..10], &rc::CANCELED.to_be_bytes());
}

/// `SetLocality` takes effect on the session's next command.
#[test]
fn set_locality_takes_effect_on_next_command() {
    let transport = start();
    let (mut client_send, mut client_recv, id) = transport.create_connection().unwrap();

    assert_eq!(transport.set_locality(id, 3), rc::SUCCESS);

    let cmd = encode(0x8001, 0, &[]);
    client_send.write_all(&cmd).unwrap();
    let _ = read_framed(&mut client_recv);

    // There is no direct hook to observe `Tcti::set_locality` calls from
    // outside the pipeline with the production `LoopbackTcti`, so this
    // confirms the session-local effect instead: the broker does not error
    // out and the command still completes, which it would not if
    // `set_locality` propagated an error up through `Tab::run`.
}

/// The client closes its end mid-flight. The broker completes the TPM
/// transaction, fails to write the response, removes the session, and
/// keeps serving other sessions.
#[test]
fn client_disconnect_mid_flight_does_not_affect_other_sessions() {
    let transport = start();
    let (mut dying_send, dying_recv, _dying_id) = transport.create_connection().unwrap();
    let (mut alive_send, mut alive_recv, _alive_id) = transport.create_connection().unwrap();

    let cmd = encode(0x8001, 0, &[]);
    dying_send.write_all(&cmd).unwrap();
    drop(dying_recv);
    drop(dying_send);

    // Give the pipeline a moment to observe the disconnect and process the
    // in-flight command before exercising the other session.
    thread::sleep(Duration::from_millis(50));

    let cmd = encode(0x8001, 0, &[1, 2, 3]);
    alive_send.write_all(&cmd).unwrap();
    let response = read_framed(&mut alive_recv);
    assert_eq!(&response[6..10], &0u32.to_be_bytes());
}

/// `Cancel` on a never-seen id returns `TPM_RC_NOT_FOUND` and leaves daemon
/// state unchanged.
#[test]
fn cancel_on_unknown_id_is_not_found() {
    let transport = start();
    assert_eq!(transport.cancel(0xDEAD_BEEF), rc::NOT_FOUND);
    assert_eq!(transport.set_locality(0xDEAD_BEEF, 1), rc::NOT_FOUND);

    // The daemon must still be able to serve a real connection afterward.
    let (mut client_send, mut client_recv, _id) = transport.create_connection().unwrap();
    let cmd = encode(0x8001, 0, &[]);
    client_send.write_all(&cmd).unwrap();
    let _ = read_framed(&mut client_recv);
}

/// `Cancel` returns promptly regardless of how many commands are already
/// queued ahead of it: a liveness property of the bus facade.
#[test]
fn cancel_is_bounded_in_time_under_pipeline_depth() {
    let transport = start();
    let (mut client_send, mut client_recv, id) = transport.create_connection().unwrap();

    for i in 0..8u32 {
        let cmd = encode(0x8001, i, &[]);
        client_send.write_all(&cmd).unwrap();
    }

    let start_time = std::time::Instant::now();
    let rc = transport.cancel(id);
    assert!(start_time.elapsed() < Duration::from_millis(500));
    assert_eq!(rc, rc::SUCCESS);

    for _ in 0..8u32 {
        let _ = read_framed(&mut client_recv);
    }
}

/// After `shutdown`, every worker thread has joined and no session
/// survives.
#[test]
fn shutdown_drains_everything() {
    let pipeline = Pipeline::start(Box::new(LoopbackTcti::new()), PipelineConfig::for_tests())
        .expect("pipeline starts");
    let transport = LocalBusTransport::new(pipeline.clone());
    let (_send, _recv, _id) = transport.create_connection().unwrap();

    pipeline.shutdown();

    // A second shutdown must not panic or deadlock: workers are already
    // joined and sessions already removed.
    pipeline.shutdown();
}

/// Two ids drawn in the same run are never both handed to distinct
/// sessions: collisions are retried internally by `create_connection`.
#[test]
fn ids_are_unique_across_many_connections() {
    let transport = start();
    let mut ids = std::collections::HashSet::new();
    let mut streams = Vec::new();
    for _ in 0..64 {
        let (send, recv, id) = transport.create_connection().unwrap();
        assert!(ids.insert(id), "duplicate id observed: {id}");
        streams.push((send, recv));
    }
}

/// Sanity check that `LocalBusTransport` can be shared across threads, as a
/// real bus dispatcher would hand requests to it concurrently.
#[test]
fn bus_transport_is_shareable_across_threads() {
    let transport = Arc::new(start());
    let mut handles = Vec::new();
    for _ in 0..4 {
        let transport = transport.clone();
        handles.push(thread::spawn(move || {
            let (_send, _recv, id) = transport.create_connection().unwrap();
            id
        }));
    }
    let mut ids = std::collections::HashSet::new();
    for handle in handles {
        assert!(ids.insert(handle.join().unwrap()));
    }
}
