// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use thiserror::Error;

/// Everything that can go wrong between the manager, the key daemon and a
/// monitored client.
///
/// The first two variants are local to the daemon link and recovered by
/// reconnecting; the `Client*` variants all end in the discipline path.
#[derive(Debug, Error)]
pub enum WardenError {
    #[error("key daemon unreachable at {addr}")]
    DaemonUnreachable { addr: String },

    #[error("key daemon protocol violation: {reason}")]
    DaemonProtocolViolation { reason: String },

    /// A NEW_KEYS_RSP arrived for a session that is no longer alive.
    #[error("orphan key response for session {session_id}")]
    KeyResponseOrphan { session_id: u64 },

    #[error("malformed cheat-check reply from session {session_id}: {reason}")]
    ClientMalformedReply { session_id: u64, reason: String },

    #[error("session {session_id} did not answer within {timeout:?}")]
    ClientReplyTimeout { session_id: u64, timeout: Duration },

    #[error("session {session_id} failed integrity check")]
    ClientIntegrityFail { session_id: u64 },

    /// Fingerprint drawn from the module map has no file under module_dir.
    #[error("warden module {fingerprint} missing on disk")]
    ModuleMissingOnDisk { fingerprint: String },

    #[error("check catalog has no entries of kind {kind}")]
    CatalogEmpty { kind: &'static str },
}
