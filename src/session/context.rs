// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-session state: phase, seeds, the keystream pair and the batch
//! currently awaiting a client reply.
//!
//! Only the manager mutates the phase; everything else reads. Key material
//! is overwritten with zeros when the context is destroyed.

use tokio::time::Instant;

use crate::{
    catalog::checks::CheckKind,
    crypto::{rc4::KeyStream, seed::SEED_LEN},
    daemon::frame::{KEY_HALVES_LEN, RC4_KEY_LEN},
};

/// Where a session currently sits in the Warden lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WardenPhase {
    Unregistered,
    LoadingModule,
    /// Terminal: module load or seed handshake failed.
    LoadFailed,
    TransformingSeed,
    ChecksOutstanding,
    ChecksReceived,
    /// Operator opted this session out; no checks are issued.
    UserDisabled,
    /// Waiting for the daemon's key response.
    PendingWarden,
    /// Daemon was down at registration; retried every tick.
    NeedsWarden,
}

/// One slot of an outstanding batch: the kind plus its catalog index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedCheck {
    pub kind: CheckKind,
    pub index: usize,
}

pub struct SessionContext {
    pub session_id: u64,
    pub account_id: u32,

    phase: WardenPhase,
    /// Fixed once assigned at module load.
    pub module_fp: Option<String>,

    /// Expected transformed seed, fixed when the hash request goes out.
    pub client_seed: [u8; SEED_LEN],
    /// Random seed sent to the client for transformation.
    pub server_seed: [u8; SEED_LEN],

    key_halves: [u8; KEY_HALVES_LEN],

    keystream_in: Option<KeyStream>,
    keystream_out: Option<KeyStream>,

    pending_batch: Vec<StagedCheck>,
    /// Per-request obfuscation byte for the outstanding batch.
    pub xor_key: u8,

    pub last_activity: Instant,
    /// When the next batch should go out (set while in ChecksReceived).
    pub next_check_due: Option<Instant>,
    /// When the outstanding batch expires (set while in ChecksOutstanding).
    pub reply_deadline: Option<Instant>,

    /// Informational; discipline policy lives in the manager.
    pub fail_counter: u32,
}

impl SessionContext {
    pub fn new(
        session_id: u64,
        account_id: u32,
        key_halves: [u8; KEY_HALVES_LEN],
    ) -> Self {
        Self {
            session_id,
            account_id,
            phase: WardenPhase::Unregistered,
            module_fp: None,
            client_seed: [0u8; SEED_LEN],
            server_seed: [0u8; SEED_LEN],
            key_halves,
            keystream_in: None,
            keystream_out: None,
            pending_batch: Vec::new(),
            xor_key: 0,
            last_activity: Instant::now(),
            next_check_due: None,
            reply_deadline: None,
            fail_counter: 0,
        }
    }

    pub fn phase(&self) -> WardenPhase {
        self.phase
    }

    /// Moves the session to `phase`. Leaving `ChecksOutstanding` clears the
    /// batch so it is non-empty exactly while checks are outstanding, and
    /// any transition out of the keyed phases wipes the keystream pair, so
    /// keys exist exactly while the session is in one of them.
    pub fn set_phase(&mut self, phase: WardenPhase) {
        if phase != WardenPhase::ChecksOutstanding {
            self.pending_batch.clear();
            self.reply_deadline = None;
        }
        if !phase_keeps_keys(phase) {
            self.clear_keys();
        }
        self.phase = phase;
    }

    pub fn key_halves(&self) -> [u8; KEY_HALVES_LEN] {
        self.key_halves
    }

    /// Seeds both keystreams from the daemon-derived RC4 keys. The client
    /// key decrypts inbound traffic, the server key encrypts outbound.
    pub fn install_keys(
        &mut self,
        client_key: &[u8; RC4_KEY_LEN],
        server_key: &[u8; RC4_KEY_LEN],
    ) {
        self.keystream_in = Some(KeyStream::init(client_key));
        self.keystream_out = Some(KeyStream::init(server_key));
    }

    pub fn has_keys(&self) -> bool {
        self.keystream_in.is_some() && self.keystream_out.is_some()
    }

    /// Encrypts an outbound payload in place. Returns false when the
    /// keystreams are not installed yet.
    pub fn encrypt_outbound(&mut self, buf: &mut [u8]) -> bool {
        match self.keystream_out.as_mut() {
            Some(ks) => {
                ks.apply(buf);
                true
            },
            None => false,
        }
    }

    /// Decrypts an inbound payload in place. Returns false when the
    /// keystreams are not installed yet.
    pub fn decrypt_inbound(&mut self, buf: &mut [u8]) -> bool {
        match self.keystream_in.as_mut() {
            Some(ks) => {
                ks.apply(buf);
                true
            },
            None => false,
        }
    }

    /// Records the batch just sent and its obfuscation key.
    pub fn stage_batch(&mut self, batch: Vec<StagedCheck>, xor_key: u8) {
        debug_assert!(!batch.is_empty());
        self.pending_batch = batch;
        self.xor_key = xor_key;
    }

    pub fn pending_batch(&self) -> &[StagedCheck] {
        &self.pending_batch
    }

    /// Takes the outstanding batch for validation, leaving it empty.
    pub fn consume_reply(&mut self) -> Vec<StagedCheck> {
        self.reply_deadline = None;
        std::mem::take(&mut self.pending_batch)
    }

    /// Zeroes and drops both keystreams.
    fn clear_keys(&mut self) {
        if let Some(ks) = self.keystream_in.as_mut() {
            ks.wipe();
        }
        if let Some(ks) = self.keystream_out.as_mut() {
            ks.wipe();
        }
        self.keystream_in = None;
        self.keystream_out = None;
    }

    fn wipe(&mut self) {
        self.client_seed = [0u8; SEED_LEN];
        self.server_seed = [0u8; SEED_LEN];
        self.key_halves = [0u8; KEY_HALVES_LEN];
        self.clear_keys();
    }
}

fn phase_keeps_keys(phase: WardenPhase) -> bool {
    matches!(
        phase,
        WardenPhase::ChecksOutstanding
            | WardenPhase::ChecksReceived
            | WardenPhase::NeedsWarden
            | WardenPhase::PendingWarden
    )
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("session_id", &self.session_id)
            .field("account_id", &self.account_id)
            .field("phase", &self.phase)
            .field("module_fp", &self.module_fp)
            .field("pending", &self.pending_batch.len())
            .finish_non_exhaustive()
    }
}
