// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Warden sub-opcodes, one byte at the front of every `SMSG_WARDEN_DATA` /
//! `CMSG_WARDEN_DATA` payload. Values are fixed by the legacy client.

use thiserror::Error;

/// Game-protocol opcode carrying server->client Warden payloads.
pub const SMSG_WARDEN_DATA: u16 = 0x02E6;
/// Game-protocol opcode carrying client->server Warden payloads.
pub const CMSG_WARDEN_DATA: u16 = 0x02E7;

/// Server -> client sub-opcodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerOpcode {
    LoadModule = 0x00,
    ModuleChunk = 0x01,
    CheatChecksRequest = 0x02,
    HashRequest = 0x05,
}

/// Client -> server sub-opcodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientOpcode {
    ModuleMissing = 0x00,
    ModuleLoaded = 0x01,
    CheatChecksResult = 0x02,
    ModuleFailed = 0x04,
    HashResult = 0x05,
}

/// Returned when a client payload starts with an undefined sub-opcode.
#[derive(Debug, Error)]
#[error("invalid warden sub-opcode: 0x{0:02x}")]
pub struct UnknownOpcode(pub u8);

impl TryFrom<u8> for ClientOpcode {
    type Error = UnknownOpcode;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            0x00 => Self::ModuleMissing,
            0x01 => Self::ModuleLoaded,
            0x02 => Self::CheatChecksResult,
            0x04 => Self::ModuleFailed,
            0x05 => Self::HashResult,
            other => return Err(UnknownOpcode(other)),
        })
    }
}
