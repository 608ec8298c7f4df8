// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-kind wire behavior of catalog checks.
//!
//! Every check kind knows three things: the prelude it contributes to an
//! outbound request, the strings it interns into the request string table,
//! and the slice of the reply it consumes. The packet builder and parser
//! drive these through [`WireCheck`] without matching on kinds.

use bytes::{BufMut, BytesMut};
use enum_dispatch::enum_dispatch;

use crate::{
    catalog::checks::{
        Check, CheckKind, DriverCheck, FileCheck, LuaCheck, MemoryCheck,
        ModuleCheck, PageCheck, SHA_LEN,
    },
    packet::reply::{ReplyCursor, ReplyError},
};

// Check id bytes understood by the client module.
const MEM_CHECK: u8 = 0xF3;
const PAGE_CHECK: u8 = 0xB2;
const MPQ_CHECK: u8 = 0x98;
const LUA_STR_CHECK: u8 = 0x8B;
const DRIVER_CHECK: u8 = 0x71;
const MODULE_CHECK: u8 = 0xD9;

/// Longest Lua result string the parser will consume.
pub const LUA_RESULT_CAP: usize = 255;

/// Maps a wire id byte back to its check kind.
pub fn kind_of_wire_id(id: u8) -> Option<CheckKind> {
    Some(match id {
        MEM_CHECK => CheckKind::Memory,
        PAGE_CHECK => CheckKind::Page,
        MPQ_CHECK => CheckKind::File,
        LUA_STR_CHECK => CheckKind::Lua,
        DRIVER_CHECK => CheckKind::Driver,
        MODULE_CHECK => CheckKind::Module,
        _ => return None,
    })
}

/// Bytes a kind's request prelude occupies after its id byte.
pub const fn prelude_body_len(kind: CheckKind) -> usize {
    match kind {
        // string index + offset + length
        CheckKind::Memory => 1 + 4 + 1,
        // seed + offset + length
        CheckKind::Page => 4 + 4 + 1,
        // seed + string index
        CheckKind::Driver => 4 + 1,
        // string index only
        CheckKind::File | CheckKind::Lua => 1,
        // seed only
        CheckKind::Module => 4,
    }
}

/// Outcome of judging one check's reply bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    Pass,
    Fail,
}

/// String table emitted ahead of the check preludes in a request packet.
///
/// Entries are deduplicated and indexed 1-based; index 0 means "no string".
#[derive(Debug, Default)]
pub struct StringTable {
    entries: Vec<String>,
}

impl StringTable {
    /// Interns `s`, returning its 1-based index.
    pub fn intern(&mut self, s: &str) -> u8 {
        if let Some(pos) = self.entries.iter().position(|e| e == s) {
            return (pos + 1) as u8;
        }
        debug_assert!(self.entries.len() < u8::MAX as usize);
        self.entries.push(s.to_string());
        self.entries.len() as u8
    }

    /// 1-based index of an already-interned string; 0 when absent.
    pub fn index_of(&self, s: &str) -> u8 {
        self.entries
            .iter()
            .position(|e| e == s)
            .map_or(0, |pos| (pos + 1) as u8)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[enum_dispatch]
pub trait WireCheck {
    /// Check id byte the client module dispatches on (stored un-xored).
    fn wire_id(&self) -> u8;

    /// Interns any strings this check references into the request table.
    fn collect_strings(&self, table: &mut StringTable);

    /// Appends the kind-specific request prelude. Integers little-endian;
    /// the id byte is XORed with the per-request key.
    fn encode_request(&self, out: &mut BytesMut, xor: u8, table: &StringTable);

    /// Consumes this check's slice of the decoded reply and judges it.
    fn consume_reply(
        &self,
        cur: &mut ReplyCursor<'_>,
    ) -> Result<CheckResult, ReplyError>;
}

fn judge_digest(
    cur: &mut ReplyCursor<'_>,
    expected: &[u8; SHA_LEN],
) -> Result<CheckResult, ReplyError> {
    let got = cur.take(SHA_LEN)?;
    Ok(if got == expected {
        CheckResult::Pass
    } else {
        CheckResult::Fail
    })
}

impl WireCheck for MemoryCheck {
    fn wire_id(&self) -> u8 {
        MEM_CHECK
    }

    fn collect_strings(&self, table: &mut StringTable) {
        table.intern(&self.label);
    }

    fn encode_request(&self, out: &mut BytesMut, xor: u8, table: &StringTable) {
        out.put_u8(self.wire_id() ^ xor);
        out.put_u8(table.index_of(&self.label));
        out.put_u32_le(self.offset);
        out.put_u8(self.length);
    }

    fn consume_reply(
        &self,
        cur: &mut ReplyCursor<'_>,
    ) -> Result<CheckResult, ReplyError> {
        judge_digest(cur, &self.expected)
    }
}

impl WireCheck for PageCheck {
    fn wire_id(&self) -> u8 {
        PAGE_CHECK
    }

    fn collect_strings(&self, _table: &mut StringTable) {}

    fn encode_request(&self, out: &mut BytesMut, xor: u8, _table: &StringTable) {
        out.put_u8(self.wire_id() ^ xor);
        out.put_u32_le(self.seed);
        out.put_u32_le(self.offset);
        out.put_u8(self.length);
    }

    fn consume_reply(
        &self,
        cur: &mut ReplyCursor<'_>,
    ) -> Result<CheckResult, ReplyError> {
        judge_digest(cur, &self.expected)
    }
}

impl WireCheck for FileCheck {
    fn wire_id(&self) -> u8 {
        MPQ_CHECK
    }

    fn collect_strings(&self, table: &mut StringTable) {
        table.intern(&self.filename);
    }

    fn encode_request(&self, out: &mut BytesMut, xor: u8, table: &StringTable) {
        out.put_u8(self.wire_id() ^ xor);
        out.put_u8(table.index_of(&self.filename));
    }

    fn consume_reply(
        &self,
        cur: &mut ReplyCursor<'_>,
    ) -> Result<CheckResult, ReplyError> {
        judge_digest(cur, &self.expected)
    }
}

impl WireCheck for LuaCheck {
    fn wire_id(&self) -> u8 {
        LUA_STR_CHECK
    }

    fn collect_strings(&self, table: &mut StringTable) {
        table.intern(&self.ident);
    }

    fn encode_request(&self, out: &mut BytesMut, xor: u8, table: &StringTable) {
        out.put_u8(self.wire_id() ^ xor);
        out.put_u8(table.index_of(&self.ident));
    }

    /// A non-zero status means the module found a matching global; the
    /// global's name follows NUL-terminated.
    fn consume_reply(
        &self,
        cur: &mut ReplyCursor<'_>,
    ) -> Result<CheckResult, ReplyError> {
        let status = cur.read_u8()?;
        if status == 0 {
            return Ok(CheckResult::Pass);
        }
        let _found = cur.read_cstr(LUA_RESULT_CAP)?;
        Ok(CheckResult::Fail)
    }
}

impl WireCheck for DriverCheck {
    fn wire_id(&self) -> u8 {
        DRIVER_CHECK
    }

    fn collect_strings(&self, table: &mut StringTable) {
        table.intern(&self.name);
    }

    fn encode_request(&self, out: &mut BytesMut, xor: u8, table: &StringTable) {
        out.put_u8(self.wire_id() ^ xor);
        out.put_u32_le(self.seed);
        out.put_u8(table.index_of(&self.name));
    }

    fn consume_reply(
        &self,
        cur: &mut ReplyCursor<'_>,
    ) -> Result<CheckResult, ReplyError> {
        judge_digest(cur, &self.expected)
    }
}

impl WireCheck for ModuleCheck {
    fn wire_id(&self) -> u8 {
        MODULE_CHECK
    }

    fn collect_strings(&self, _table: &mut StringTable) {}

    fn encode_request(&self, out: &mut BytesMut, xor: u8, _table: &StringTable) {
        out.put_u8(self.wire_id() ^ xor);
        out.put_u32_le(self.seed);
    }

    fn consume_reply(
        &self,
        cur: &mut ReplyCursor<'_>,
    ) -> Result<CheckResult, ReplyError> {
        judge_digest(cur, &self.expected)
    }
}
