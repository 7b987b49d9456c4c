// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire framing for TPM 2.0 command/response buffers exchanged between a
//! client and the access broker.
//!
//! Every buffer sent over a session endpoint begins with the standard
//! 10-byte TPM header: a 2-byte tag, a 4-byte big-endian size (covering the
//! whole buffer, header included), and a 4-byte big-endian command or
//! response code. The broker parses only this header; the command/response
//! body is opaque.

#![forbid(unsafe_code)]

use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::byteorder::BigEndian;
use zerocopy::byteorder::U32;
use zerocopy::byteorder::U16;

/// Size, in bytes, of the fixed TPM command/response header.
pub const HEADER_SIZE: usize = 10;

/// Default ceiling on a command's declared total size.
pub const DEFAULT_MAX_CMD: u32 = 4096;

/// TPM response codes the broker itself can produce, as opposed to codes
/// that originate from the TPM.
pub mod rc {
    /// `TPM_RC_SUCCESS`.
    pub const SUCCESS: u32 = 0x0000_0000;
    /// `TPM_RC_CANCELED`, in the encoding this broker uses for synthetic
    /// cancellation responses.
    pub const CANCELED: u32 = 0x0000_0099;
    /// `TPM_RC_FAILURE`, used when a TCTI call fails and no structured code
    /// is available from the transport.
    pub const FAILURE: u32 = 0x0000_0101;
    /// A broker-local code returned by the bus facade's `Cancel`/
    /// `SetLocality` handlers when the named session id is unknown. Not a
    /// TPM-issued response code: the TPM never sees these requests, so
    /// there is no real `TPM_RC_NOT_FOUND` to reuse.
    pub const NOT_FOUND: u32 = 0x0000_8001;
}

/// The fixed 10-byte header shared by TPM commands and responses. The
/// trailing `u32` is the command code on a command buffer and the response
/// code on a response buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Header {
    tag: U16<BigEndian>,
    size: U32<BigEndian>,
    code: U32<BigEndian>,
}

impl Header {
    /// The TPM structure tag (e.g. `TPM_ST_NO_SESSIONS`).
    pub fn tag(&self) -> u16 {
        self.tag.get()
    }

    /// The declared total size of the buffer, header included.
    pub fn size(&self) -> u32 {
        self.size.get()
    }

    /// The command code (on a command) or response code (on a response).
    pub fn code(&self) -> u32 {
        self.code.get()
    }
}

/// Errors produced while framing a command read from a session endpoint.
///
/// Every variant here is scoped to the one session whose endpoint produced
/// it, never fatal to the daemon.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Fewer than [`HEADER_SIZE`] bytes were available before EOF.
    #[error("truncated header: got {got} of {HEADER_SIZE} bytes")]
    TruncatedHeader {
        /// Bytes actually read before EOF.
        got: usize,
    },
    /// The header's declared `size` field is smaller than the header itself.
    #[error("declared size {declared} is smaller than the {HEADER_SIZE}-byte header")]
    UndersizeHeader {
        /// The declared size.
        declared: u32,
    },
    /// The header's declared `size` field exceeds the configured ceiling.
    #[error("declared size {declared} exceeds the {max}-byte limit")]
    Oversize {
        /// The declared size.
        declared: u32,
        /// The configured ceiling (see [`DEFAULT_MAX_CMD`]).
        max: u32,
    },
    /// EOF was hit while reading the body after a valid header.
    #[error("truncated body: got {got} of {want} bytes")]
    TruncatedBody {
        /// Bytes actually read before EOF.
        got: usize,
        /// Bytes the header declared.
        want: usize,
    },
}

/// Parse and validate a command/response header, checking the declared size
/// against `max`.
pub fn parse_header(buf: &[u8], max: u32) -> Result<Header, ProtocolError> {
    if buf.len() < HEADER_SIZE {
        return Err(ProtocolError::TruncatedHeader { got: buf.len() });
    }
    let header = Header::read_from_bytes(&buf[..HEADER_SIZE])
        .unwrap_or_else(|_| unreachable!("slice is exactly HEADER_SIZE bytes"));
    if header.size() < HEADER_SIZE as u32 {
        return Err(ProtocolError::UndersizeHeader {
            declared: header.size(),
        });
    }
    if header.size() > max {
        return Err(ProtocolError::Oversize {
            declared: header.size(),
            max,
        });
    }
    Ok(header)
}

/// Read just the header from the front of an already-framed buffer, without
/// re-validating its declared size. Used to recover the original tag when
/// building a synthetic response for a command that was never transmitted.
pub fn header_of(buf: &[u8]) -> Option<Header> {
    Header::read_from_bytes(buf.get(..HEADER_SIZE)?).ok()
}

/// Build a synthetic, body-less response with the given tag and response
/// code. Used for the cancel-before-dispatch and TCTI-failure paths, where
/// the broker answers on the TPM's behalf.
pub fn synthetic_response(tag: u16, code: u32) -> Vec<u8> {
    let header = Header {
        tag: U16::new(tag),
        size: U32::new(HEADER_SIZE as u32),
        code: U32::new(code),
    };
    header.as_bytes().to_vec()
}
