// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Outbound cheat-check request assembly.
//!
//! Layout (before keystream encryption):
//!
//! ```text
//! [u8   sub-opcode = CHEAT_CHECKS_REQUEST]
//! [for each referenced string: u8 len ^ xorkey, bytes]
//! [u8   0 ^ xorkey]                      <- string table terminator
//! [for each check, kind-grouped: id ^ xorkey, kind-specific prelude]
//! [u8   xorkey]                          <- trailing sentinel
//! ```
//!
//! Strings are interned in first-use order over the kind-grouped batch and
//! referenced by 1-based index from the check preludes.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use crate::{
    catalog::checks::{Check, CheckKind},
    packet::{
        opcode::ServerOpcode,
        wire::{StringTable, WireCheck, kind_of_wire_id, prelude_body_len},
    },
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("request truncated at byte {at}")]
    Truncated { at: usize },

    #[error("unexpected sub-opcode 0x{0:02x}")]
    BadOpcode(u8),

    #[error("unknown check id 0x{0:02x}")]
    UnknownCheckId(u8),
}

/// Assembles the plaintext request payload for an already kind-grouped
/// batch. The caller encrypts the result with the session's outbound
/// keystream before sending.
pub fn build_check_request(batch: &[&Check], xor: u8) -> Vec<u8> {
    let mut table = StringTable::default();
    for check in batch {
        (*check).collect_strings(&mut table);
    }

    let mut out = BytesMut::with_capacity(64);
    out.put_u8(ServerOpcode::CheatChecksRequest as u8);

    for s in table.iter() {
        out.put_u8((s.len() as u8) ^ xor);
        out.put_slice(s.as_bytes());
    }
    out.put_u8(xor); // 0 ^ xor

    for check in batch {
        (*check).encode_request(&mut out, xor, &table);
    }

    out.put_u8(xor);
    out.to_vec()
}

/// Recovers the kind sequence from a plaintext request payload.
///
/// Exercised by the round-trip tests and mock clients; the real consumer
/// is the client-side module.
pub fn decode_check_request(plain: &[u8]) -> Result<Vec<CheckKind>, RequestError> {
    let (&xor, rest) = plain
        .split_last()
        .ok_or(RequestError::Truncated { at: 0 })?;

    let mut pos = 0usize;
    let next = |pos: &mut usize| -> Result<u8, RequestError> {
        let b = *rest
            .get(*pos)
            .ok_or(RequestError::Truncated { at: *pos })?;
        *pos += 1;
        Ok(b)
    };

    let op = next(&mut pos)?;
    if op != ServerOpcode::CheatChecksRequest as u8 {
        return Err(RequestError::BadOpcode(op));
    }

    // String table: length-prefixed entries until the zero-length mark.
    loop {
        let len = (next(&mut pos)? ^ xor) as usize;
        if len == 0 {
            break;
        }
        if pos + len > rest.len() {
            return Err(RequestError::Truncated { at: pos });
        }
        pos += len;
    }

    let mut kinds = Vec::new();
    while pos < rest.len() {
        let id = next(&mut pos)? ^ xor;
        let kind =
            kind_of_wire_id(id).ok_or(RequestError::UnknownCheckId(id))?;
        let body = prelude_body_len(kind);
        if pos + body > rest.len() {
            return Err(RequestError::Truncated { at: pos });
        }
        pos += body;
        kinds.push(kind);
    }

    Ok(kinds)
}
