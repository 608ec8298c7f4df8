// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Inbound `CMSG_WARDEN_DATA` payloads: handshake acks and the cheat-check
//! result blob.
//!
//! The result blob is validated in two passes: the folded-SHA-1 checksum
//! over the result bytes first, then a single cursor walk that consumes
//! exactly the bytes each staged check is entitled to. Anything short,
//! long or misaligned is a [`ReplyError`] and ends in discipline.

use thiserror::Error;

use crate::{
    catalog::checks::Check,
    crypto::{checksum::packet_checksum, seed::SEED_LEN},
    packet::{
        opcode::ClientOpcode,
        wire::{CheckResult, WireCheck},
    },
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplyError {
    #[error("unexpected sub-opcode 0x{0:02x}")]
    BadOpcode(u8),

    #[error("reply truncated at byte {at}")]
    Truncated { at: usize },

    #[error("declared length {declared} but {actual} bytes follow")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("checksum mismatch: declared {declared:#010x}, computed {computed:#010x}")]
    BadChecksum { declared: u32, computed: u32 },

    #[error("unterminated result string")]
    UnterminatedString,

    #[error("{count} trailing bytes after last check result")]
    TrailingBytes { count: usize },
}

/// Byte cursor over the result section of a cheat-check reply.
#[derive(Debug)]
pub struct ReplyCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ReplyCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], ReplyError> {
        if self.remaining() < n {
            return Err(ReplyError::Truncated { at: self.pos });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, ReplyError> {
        Ok(self.take(1)?[0])
    }

    /// Reads a NUL-terminated string of at most `cap` bytes (exclusive of
    /// the terminator) and advances past the terminator.
    pub fn read_cstr(&mut self, cap: usize) -> Result<&'a [u8], ReplyError> {
        let window = &self.buf[self.pos..];
        let limit = window.len().min(cap + 1);
        let nul = window[..limit]
            .iter()
            .position(|&b| b == 0)
            .ok_or(ReplyError::UnterminatedString)?;
        let s = &window[..nul];
        self.pos += nul + 1;
        Ok(s)
    }
}

/// Verdict over one whole batch; any single failing check fails the batch.
#[derive(Debug, Default)]
pub struct BatchVerdict {
    /// Indices (into the staged batch) of checks the client failed.
    pub failures: Vec<usize>,
}

impl BatchVerdict {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Validates a decrypted cheat-check result payload against the staged
/// batch, in the exact order the batch was sent.
pub fn parse_check_reply(
    plain: &[u8],
    batch: &[&Check],
) -> Result<BatchVerdict, ReplyError> {
    let mut outer = ReplyCursor::new(plain);

    let op = outer.read_u8()?;
    if op != ClientOpcode::CheatChecksResult as u8 {
        return Err(ReplyError::BadOpcode(op));
    }

    let declared = {
        let raw = outer.take(2)?;
        u16::from_le_bytes([raw[0], raw[1]]) as usize
    };
    if declared != outer.remaining() {
        return Err(ReplyError::LengthMismatch {
            declared,
            actual: outer.remaining(),
        });
    }

    let checksum = {
        let raw = outer.take(4)?;
        u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
    };
    let results = outer.take(outer.remaining())?;
    let computed = packet_checksum(results);
    if checksum != computed {
        return Err(ReplyError::BadChecksum {
            declared: checksum,
            computed,
        });
    }

    let mut cur = ReplyCursor::new(results);
    let mut verdict = BatchVerdict::default();
    for (idx, check) in batch.iter().enumerate() {
        if (*check).consume_reply(&mut cur)? == CheckResult::Fail {
            verdict.failures.push(idx);
        }
    }

    if cur.remaining() != 0 {
        return Err(ReplyError::TrailingBytes {
            count: cur.remaining(),
        });
    }

    Ok(verdict)
}

/// Plaintext client packets seen before the session keystreams exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMessage {
    ModuleMissing,
    ModuleLoaded,
    ModuleFailed,
    HashResult([u8; SEED_LEN]),
}

/// Parses a handshake-phase `CMSG_WARDEN_DATA` payload.
pub fn parse_handshake(bytes: &[u8]) -> Result<HandshakeMessage, ReplyError> {
    let mut cur = ReplyCursor::new(bytes);
    let op = ClientOpcode::try_from(cur.read_u8()?)
        .map_err(|e| ReplyError::BadOpcode(e.0))?;

    let msg = match op {
        ClientOpcode::ModuleMissing => HandshakeMessage::ModuleMissing,
        ClientOpcode::ModuleLoaded => HandshakeMessage::ModuleLoaded,
        ClientOpcode::ModuleFailed => HandshakeMessage::ModuleFailed,
        ClientOpcode::HashResult => {
            let raw = cur.take(SEED_LEN)?;
            let mut seed = [0u8; SEED_LEN];
            seed.copy_from_slice(raw);
            HandshakeMessage::HashResult(seed)
        },
        ClientOpcode::CheatChecksResult => {
            return Err(ReplyError::BadOpcode(op as u8));
        },
    };

    if cur.remaining() != 0 {
        return Err(ReplyError::TrailingBytes {
            count: cur.remaining(),
        });
    }
    Ok(msg)
}
