//! Packet framing (spec §4.1 / §6).
//!
//! `u32 total_length | u8 direction | u32 request_id`, with `u32 function`
//! appended for requests and `i32 status` (+ results iff `status == OK`)
//! appended for replies.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use super::primitive::{Decoder, Encoder};
use crate::error::{ReconcileError, Result};

/// Maximum packet size, carried forward from `original_source/zfsd/data-coding.h`'s
/// `DC_SIZE` rather than the spec's approximate "≈8900".
pub const MAX_PACKET_SIZE: usize = 8888;

/// Packet direction byte (spec §4.1).
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Direction {
    Request = 0,
    Reply = 1,
    OneWay = 2,
}

impl Direction {
    fn from_u8(v: u8) -> Result<Self> {
        FromPrimitive::from_u8(v).ok_or(ReconcileError::InvalidRequest)
    }
}

/// Decoded packet header, common to every direction.
#[derive(Debug, Copy, Clone)]
pub struct Header {
    pub direction: Direction,
    pub request_id: u32,
}

/// Begin encoding a request packet body; `function` is the wire op id (§6).
pub fn encode_request(request_id: u32, function: u32) -> Encoder {
    let mut enc = Encoder::new(MAX_PACKET_SIZE);
    // total_length patched in by `finish`.
    enc.u32(0).ok();
    enc.u8(Direction::Request as u8).ok();
    enc.u32(request_id).ok();
    enc.u32(function).ok();
    enc
}

/// Begin encoding a one-way packet body (no reply expected).
pub fn encode_oneway(request_id: u32, function: u32) -> Encoder {
    let mut enc = Encoder::new(MAX_PACKET_SIZE);
    enc.u32(0).ok();
    enc.u8(Direction::OneWay as u8).ok();
    enc.u32(request_id).ok();
    enc.u32(function).ok();
    enc
}

/// Begin encoding a reply packet body; `status == ZFS_OK` (0) for success.
pub fn encode_reply(request_id: u32, status: i32) -> Encoder {
    let mut enc = Encoder::new(MAX_PACKET_SIZE);
    enc.u32(0).ok();
    enc.u8(Direction::Reply as u8).ok();
    enc.u32(request_id).ok();
    enc.i32(status).ok();
    enc
}

/// Patch the leading `total_length` field and return the finished frame.
pub fn finish(enc: Encoder) -> Result<Vec<u8>> {
    let mut buf = enc.into_bytes();
    if buf.len() > MAX_PACKET_SIZE {
        return Err(ReconcileError::RequestTooLong);
    }
    let len = buf.len() as u32;
    buf[0..4].copy_from_slice(&len.to_le_bytes());
    Ok(buf)
}

/// Parse the common header out of a full packet buffer (length already
/// consumed by the caller's framing reader).
pub fn decode_header(buf: &[u8]) -> Result<(Header, Decoder<'_>)> {
    let mut dec = Decoder::new(buf);
    let total_len = dec.u32()?;
    if total_len as usize != buf.len() || total_len as usize > MAX_PACKET_SIZE {
        return Err(ReconcileError::InvalidRequest);
    }
    let direction = Direction::from_u8(dec.u8()?)?;
    let request_id = dec.u32()?;
    Ok((Header { direction, request_id }, dec))
}
