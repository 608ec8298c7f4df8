// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Zero-copy wire frames on the daemon link.
//!
//! Every frame is `[u8 opcode][u16 len LE][len body bytes]`. Fixed-size
//! bodies are plain `zerocopy` structs so both sides read and write them
//! without hand-rolled offset math.

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout,
    byteorder::little_endian::{U16, U64},
};

use crate::daemon::opcode::DaemonOpcode;

pub const FRAME_HEADER_LEN: usize = 3;

/// Concatenated 20-byte halves of the authenticated session key.
pub const KEY_HALVES_LEN: usize = 40;
/// Length of one derived RC4 key.
pub const RC4_KEY_LEN: usize = 16;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Debug, Clone)]
#[repr(C)]
pub struct FrameHeader {
    pub opcode: u8,
    pub len: U16,
}

/// Body of `NEW_KEYS_REQ`.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Debug, Clone)]
#[repr(C)]
pub struct NewKeysReqBody {
    pub session_id: U64,
    pub key_halves: [u8; KEY_HALVES_LEN],
}

/// Body of `NEW_KEYS_RSP`.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Debug, Clone)]
#[repr(C)]
pub struct NewKeysRspBody {
    pub session_id: U64,
    pub client_key: [u8; RC4_KEY_LEN],
    pub server_key: [u8; RC4_KEY_LEN],
}

/// Encodes one complete frame ready for the socket.
pub fn encode_frame(opcode: DaemonOpcode, body: &[u8]) -> Vec<u8> {
    let header = FrameHeader {
        opcode: opcode as u8,
        len: U16::new(body.len() as u16),
    };

    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(body);
    out
}
