//! Client side of the key/module daemon protocol: one long-lived TCP link,
//! heartbeat, and the serialized key-derivation queue.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Wire frames exchanged with the daemon.
pub mod frame;
/// The TCP link state machine.
pub mod link;
/// Daemon opcodes.
pub mod opcode;
