// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed integrity-check entries.
//!
//! The legacy server modeled these as a tag byte plus a C union of pointers;
//! here each kind is a struct and [`Check`] is the tagged union. The wire
//! behavior (request prelude, reply consumption) hangs off the
//! [`WireCheck`] trait so the packet codec never matches on kinds directly.

use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

use crate::packet::wire::WireCheck;

pub const SHA_LEN: usize = 20;

/// The six check kinds, in wire-grouping order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CheckKind {
    Page,
    Memory,
    Driver,
    File,
    Lua,
    /// Reserved: present in catalogs, never drawn into a batch.
    Module,
}

impl CheckKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Page => "page",
            CheckKind::Memory => "memory",
            CheckKind::Driver => "driver",
            CheckKind::File => "file",
            CheckKind::Lua => "lua",
            CheckKind::Module => "module",
        }
    }
}

/// Hash of a memory region at a fixed offset inside the client binary.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryCheck {
    /// Operator-facing description; also interned into the request strings.
    pub label: String,
    pub offset: u32,
    pub length: u8,
    #[serde(with = "serde_sha")]
    pub expected: [u8; SHA_LEN],
}

/// Seeded hash of a code page.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PageCheck {
    pub seed: u32,
    pub offset: u32,
    pub length: u8,
    #[serde(with = "serde_sha")]
    pub expected: [u8; SHA_LEN],
}

/// Hash of a client-side file's content.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileCheck {
    pub filename: String,
    #[serde(with = "serde_sha")]
    pub expected: [u8; SHA_LEN],
}

/// Probe for a Lua global the stock client never defines.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LuaCheck {
    pub ident: String,
}

/// Seeded hash over a loaded driver image.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriverCheck {
    pub seed: u32,
    #[serde(with = "serde_sha")]
    pub expected: [u8; SHA_LEN],
    pub name: String,
}

/// Seeded hash over a loaded module. Reserved kind.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModuleCheck {
    pub seed: u32,
    #[serde(with = "serde_sha")]
    pub expected: [u8; SHA_LEN],
}

#[enum_dispatch(WireCheck)]
#[derive(Debug, Clone)]
pub enum Check {
    Memory(MemoryCheck),
    Page(PageCheck),
    File(FileCheck),
    Lua(LuaCheck),
    Driver(DriverCheck),
    Module(ModuleCheck),
}

impl Check {
    pub fn kind(&self) -> CheckKind {
        match self {
            Check::Memory(_) => CheckKind::Memory,
            Check::Page(_) => CheckKind::Page,
            Check::File(_) => CheckKind::File,
            Check::Lua(_) => CheckKind::Lua,
            Check::Driver(_) => CheckKind::Driver,
            Check::Module(_) => CheckKind::Module,
        }
    }
}

/// Serde helpers storing 20-byte digests as lowercase hex strings.
mod serde_sha {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    use super::SHA_LEN;

    pub fn serialize<S: Serializer>(
        v: &[u8; SHA_LEN],
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<[u8; SHA_LEN], D::Error> {
        let raw = String::deserialize(d)?;
        let bytes = hex::decode(raw.trim()).map_err(Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| Error::custom("expected a 20-byte hex digest"))
    }
}
