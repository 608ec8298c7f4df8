//! The Warden manager: owns every session context and the daemon link,
//! advances the per-session state machines, and turns validated cheating
//! into discipline.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, bail};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use rand::RngExt;
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    catalog::{CheckCatalog, checks::{Check, CheckKind}},
    cfg::config::{CHECK_JITTER, Config},
    crypto::seed::{SeedTransform, sha1_truncate},
    daemon::link::{DaemonEvent, DaemonLink},
    error::WardenError,
    packet::{
        module_transfer::{
            FINGERPRINT_LEN, build_hash_request, build_load_module,
            build_module_chunks,
        },
        opcode::{CMSG_WARDEN_DATA, SMSG_WARDEN_DATA},
        reply::{HandshakeMessage, parse_check_reply, parse_handshake},
        request::build_check_request,
    },
    session::context::{SessionContext, StagedCheck, WardenPhase},
};

// Cumulative kind ratios, measured over long production sessions.
const PAGE1_RATIO: f32 = 25.0;
const PAGE2_RATIO: f32 = 50.0;
const MEMORY_RATIO: f32 = 94.0;
const DRIVER_RATIO: f32 = 97.4;
const FILE_RATIO: f32 = 98.7;

const MIN_BATCH: usize = 4;
const MAX_BATCH: usize = 9;

/// Redraw attempts before giving a batch slot up to index deduplication.
const MAX_SLOT_REDRAWS: usize = 16;
/// Module redraw attempts before declaring registration stuck.
const MAX_MODULE_DRAWS: usize = 8;

/// Draw order when a kind's catalog is empty: fall through to the
/// next-most-common kind.
const FALLBACK_ORDER: [CheckKind; 5] = [
    CheckKind::Memory,
    CheckKind::Page,
    CheckKind::Driver,
    CheckKind::File,
    CheckKind::Lua,
];

/// Maps a roll in `[0, 100)` onto a check kind via the cumulative ratios.
pub fn draw_kind(roll: f32) -> CheckKind {
    if roll < PAGE1_RATIO || roll < PAGE2_RATIO {
        CheckKind::Page
    } else if roll < MEMORY_RATIO {
        CheckKind::Memory
    } else if roll < DRIVER_RATIO {
        CheckKind::Driver
    } else if roll < FILE_RATIO {
        CheckKind::File
    } else {
        CheckKind::Lua
    }
}

/// Outbound surface towards the game-session layer.
///
/// The manager never owns sockets to clients; it hands payloads and
/// discipline decisions to whatever implements this.
pub trait SessionSink: Send + Sync {
    fn send_to_client(&self, session_id: u64, opcode: u16, bytes: &[u8]);
    fn kick(&self, session_id: u64, reason: &str);
    /// `duration` of `None` means permanent.
    fn ban(&self, account_id: u32, reason: &str, duration: Option<Duration>);
}

pub struct WardenManager {
    cfg: Config,
    catalog: Arc<CheckCatalog>,
    sink: Arc<dyn SessionSink>,
    link: DaemonLink,
    sessions: DashMap<u64, Arc<Mutex<SessionContext>>>,
    enabled: AtomicBool,
    transform: SeedTransform,
    cancel: CancellationToken,
}

static MANAGER: OnceCell<Arc<WardenManager>> = OnceCell::new();

/// Installs the process-wide manager. Fails if called twice.
pub fn init(
    cfg: Config,
    catalog: CheckCatalog,
    sink: Arc<dyn SessionSink>,
) -> Result<Arc<WardenManager>> {
    let mgr = WardenManager::new(cfg, catalog, sink);
    if MANAGER.set(Arc::clone(&mgr)).is_err() {
        bail!("warden manager already initialized");
    }
    Ok(mgr)
}

pub fn instance() -> Option<Arc<WardenManager>> {
    MANAGER.get().cloned()
}

/// Tears the process-wide manager down: closes the daemon link and drops
/// (and thereby zeroes) every session context.
pub async fn shutdown() {
    if let Some(mgr) = instance() {
        mgr.stop().await;
    }
}

impl WardenManager {
    pub fn new(
        cfg: Config,
        catalog: CheckCatalog,
        sink: Arc<dyn SessionSink>,
    ) -> Arc<Self> {
        Self::with_transform(cfg, catalog, sink, sha1_truncate)
    }

    pub fn with_transform(
        cfg: Config,
        catalog: CheckCatalog,
        sink: Arc<dyn SessionSink>,
        transform: SeedTransform,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let link = DaemonLink::new(
            cfg.daemon_endpoint(),
            cfg.daemon.ping_interval,
            cancel.child_token(),
        );
        Arc::new(Self {
            cfg,
            catalog: Arc::new(catalog),
            sink,
            link,
            sessions: DashMap::new(),
            enabled: AtomicBool::new(true),
            transform,
            cancel,
        })
    }

    pub fn catalog(&self) -> &CheckCatalog {
        &self.catalog
    }

    pub fn link(&self) -> &DaemonLink {
        &self.link
    }

    /// Operator switch: when disabled, sessions register but no checks are
    /// ever issued.
    pub fn set_disabled(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub async fn stop(&self) {
        self.link.shutdown().await;
        self.sessions.clear();
        self.cancel.cancel();
        info!("warden manager stopped");
    }

    // ── upstream (game-session layer) contract ──────────────────────────

    /// Registers a freshly authenticated session.
    pub async fn register(
        &self,
        session_id: u64,
        account_id: u32,
        key_halves: [u8; 40],
    ) {
        let ctx = Arc::new(Mutex::new(SessionContext::new(
            session_id, account_id, key_halves,
        )));
        self.sessions.insert(session_id, Arc::clone(&ctx));

        let mut ctx = ctx.lock().await;
        if !self.is_enabled() {
            debug!(session_id, "warden disabled, session idles unregistered");
            return;
        }

        if self.link.is_ready().await {
            self.start_session(&mut ctx);
        } else {
            warn!(session_id, account_id, "daemon not ready, deferring registration");
            ctx.set_phase(WardenPhase::NeedsWarden);
        }
    }

    /// Destroys a session: discards its batch, cancels its key request and
    /// zeroes its crypto state.
    pub async fn unregister(&self, session_id: u64) {
        self.link.cancel_session(session_id).await;
        if self.sessions.remove(&session_id).is_some() {
            debug!(session_id, "session unregistered");
        }
    }

    /// Operator opt-out for one session.
    pub async fn set_session_disabled(&self, session_id: u64) {
        if let Some(ctx) = self.session(session_id) {
            let mut ctx = ctx.lock().await;
            ctx.set_phase(WardenPhase::UserDisabled);
        }
    }

    /// Re-enables a previously opted-out session.
    pub async fn set_session_enabled(&self, session_id: u64) {
        if let Some(ctx) = self.session(session_id) {
            let mut ctx = ctx.lock().await;
            if ctx.phase() == WardenPhase::UserDisabled {
                ctx.set_phase(WardenPhase::NeedsWarden);
            }
        }
    }

    /// Session-specific update: a Warden-carrying client packet arrived.
    pub async fn on_client_packet(&self, session_id: u64, opcode: u16, bytes: &[u8]) {
        if opcode != CMSG_WARDEN_DATA {
            warn!(session_id, opcode, "not a warden packet, ignoring");
            return;
        }
        let Some(ctx) = self.session(session_id) else {
            warn!(session_id, "packet for unknown session");
            return;
        };

        let mut ctx = ctx.lock().await;
        ctx.last_activity = Instant::now();

        match ctx.phase() {
            WardenPhase::LoadingModule => self.on_module_ack(&mut ctx, bytes),
            WardenPhase::TransformingSeed => {
                self.on_seed_result(&mut ctx, bytes).await;
            },
            WardenPhase::ChecksOutstanding => self.on_check_reply(&mut ctx, bytes),
            phase => {
                warn!(session_id, ?phase, "unexpected warden packet in this phase");
            },
        }
    }

    /// Global update: advances the daemon link, drains its messages, and
    /// services per-session timers.
    pub async fn update(&self) {
        self.link.tick().await;

        for ev in self.link.drain_events().await {
            match ev {
                DaemonEvent::NewKeys {
                    session_id,
                    client_key,
                    server_key,
                } => self.on_new_keys(session_id, &client_key, &server_key).await,
                DaemonEvent::Disconnected => {
                    debug!("daemon link dropped, pending sessions wait for reconnect");
                },
                // Local link failures; the link already scheduled recovery.
                DaemonEvent::Fault(err) => warn!(%err, "daemon link fault"),
                DaemonEvent::Pong => {},
            }
        }

        if !self.is_enabled() {
            return;
        }

        let now = Instant::now();
        let ids: Vec<u64> = self.sessions.iter().map(|e| *e.key()).collect();
        for session_id in ids {
            let Some(ctx) = self.session(session_id) else {
                continue;
            };
            let mut ctx = ctx.lock().await;

            match ctx.phase() {
                WardenPhase::NeedsWarden => {
                    if self.link.is_ready().await {
                        self.start_session(&mut ctx);
                    }
                },
                WardenPhase::ChecksOutstanding => {
                    if ctx.reply_deadline.is_some_and(|d| now >= d) {
                        let err = WardenError::ClientReplyTimeout {
                            session_id,
                            timeout: self.cfg.checks.reply_timeout,
                        };
                        self.discipline(&mut ctx, &err, "no-reply");
                        ctx.set_phase(WardenPhase::Unregistered);
                    }
                },
                WardenPhase::ChecksReceived => {
                    if ctx.next_check_due.is_some_and(|d| now >= d) {
                        self.send_check_batch(&mut ctx);
                    }
                },
                _ => {},
            }
        }
    }

    /// Phase of one session; `None` if it is not registered.
    pub async fn session_phase(&self, session_id: u64) -> Option<WardenPhase> {
        let ctx = self.session(session_id)?;
        let ctx = ctx.lock().await;
        Some(ctx.phase())
    }

    /// Snapshot of the batch a session is currently answering.
    pub async fn pending_batch(&self, session_id: u64) -> Option<Vec<StagedCheck>> {
        let ctx = self.session(session_id)?;
        let ctx = ctx.lock().await;
        Some(ctx.pending_batch().to_vec())
    }

    // ── state machine steps ─────────────────────────────────────────────

    fn session(&self, session_id: u64) -> Option<Arc<Mutex<SessionContext>>> {
        self.sessions.get(&session_id).map(|e| Arc::clone(e.value()))
    }

    /// Picks a module and asks the client to load it.
    fn start_session(&self, ctx: &mut SessionContext) {
        for _ in 0..MAX_MODULE_DRAWS {
            let fp = match self.catalog.random_module() {
                Ok(fp) => fp,
                Err(err) => {
                    error!(
                        session_id = ctx.session_id,
                        account_id = ctx.account_id,
                        %err,
                        "no usable warden module"
                    );
                    ctx.set_phase(WardenPhase::NeedsWarden);
                    return;
                },
            };

            let size = match self.catalog.read_module(&fp) {
                Ok(bytes) => bytes.len() as u32,
                // Excluded from the pool by the catalog; draw another.
                Err(_) => continue,
            };

            let Some(raw) = decode_fingerprint(&fp) else {
                warn!(fingerprint = %fp, "fingerprint is not 16 bytes of hex");
                continue;
            };

            debug!(
                session_id = ctx.session_id,
                fingerprint = %fp,
                size,
                "requesting module load"
            );
            ctx.module_fp = Some(fp);
            self.sink.send_to_client(
                ctx.session_id,
                SMSG_WARDEN_DATA,
                &build_load_module(&raw, size),
            );
            ctx.set_phase(WardenPhase::LoadingModule);
            return;
        }

        error!(
            session_id = ctx.session_id,
            "exhausted module draws, deferring session"
        );
        ctx.set_phase(WardenPhase::NeedsWarden);
    }

    fn on_module_ack(&self, ctx: &mut SessionContext, bytes: &[u8]) {
        match parse_handshake(bytes) {
            Ok(HandshakeMessage::ModuleMissing) => self.send_module(ctx),
            Ok(HandshakeMessage::ModuleLoaded) => self.send_seed_request(ctx),
            Ok(HandshakeMessage::ModuleFailed) => {
                error!(
                    session_id = ctx.session_id,
                    account_id = ctx.account_id,
                    "client failed to load warden module"
                );
                ctx.set_phase(WardenPhase::LoadFailed);
                self.sink.kick(ctx.session_id, "module-load-failed");
            },
            Ok(other) => {
                warn!(session_id = ctx.session_id, ?other, "unexpected module ack");
            },
            Err(err) => {
                warn!(session_id = ctx.session_id, %err, "bad module ack, ignoring");
            },
        }
    }

    /// Streams the module image down in chunks; the client acks with
    /// MODULE_LOADED (or MODULE_FAILED) when done.
    fn send_module(&self, ctx: &mut SessionContext) {
        let Some(fp) = ctx.module_fp.clone() else {
            warn!(session_id = ctx.session_id, "module ack without assigned module");
            return;
        };

        match self.catalog.read_module(&fp) {
            Ok(bytes) => {
                debug!(
                    session_id = ctx.session_id,
                    fingerprint = %fp,
                    size = bytes.len(),
                    "streaming module to client"
                );
                for chunk in build_module_chunks(&bytes) {
                    self.sink
                        .send_to_client(ctx.session_id, SMSG_WARDEN_DATA, &chunk);
                }
            },
            Err(err) => {
                // The fingerprint went bad under us; re-assign the session.
                warn!(session_id = ctx.session_id, %err, "re-assigning module");
                ctx.module_fp = None;
                self.start_session(ctx);
            },
        }
    }

    fn send_seed_request(&self, ctx: &mut SessionContext) {
        rand::rng().fill(&mut ctx.server_seed);
        ctx.client_seed = (self.transform)(&ctx.server_seed);

        self.sink.send_to_client(
            ctx.session_id,
            SMSG_WARDEN_DATA,
            &build_hash_request(&ctx.server_seed),
        );
        ctx.set_phase(WardenPhase::TransformingSeed);
    }

    async fn on_seed_result(&self, ctx: &mut SessionContext, bytes: &[u8]) {
        match parse_handshake(bytes) {
            Ok(HandshakeMessage::HashResult(transformed)) => {
                if transformed == ctx.client_seed {
                    debug!(session_id = ctx.session_id, "seed transform verified");
                    ctx.set_phase(WardenPhase::PendingWarden);
                    self.link
                        .request_keys(ctx.session_id, ctx.key_halves())
                        .await;
                } else {
                    let err = WardenError::ClientIntegrityFail {
                        session_id: ctx.session_id,
                    };
                    self.discipline(ctx, &err, "seed-mismatch");
                    ctx.set_phase(WardenPhase::LoadFailed);
                }
            },
            Ok(other) => {
                warn!(session_id = ctx.session_id, ?other, "expected a hash result");
            },
            Err(err) => {
                warn!(session_id = ctx.session_id, %err, "bad hash result, ignoring");
            },
        }
    }

    async fn on_new_keys(
        &self,
        session_id: u64,
        client_key: &[u8; 16],
        server_key: &[u8; 16],
    ) {
        let Some(ctx) = self.session(session_id) else {
            let err = WardenError::KeyResponseOrphan { session_id };
            warn!(%err, "dropping daemon key response");
            return;
        };

        let mut ctx = ctx.lock().await;
        if ctx.phase() != WardenPhase::PendingWarden {
            warn!(
                session_id,
                phase = ?ctx.phase(),
                "key response for session not awaiting keys"
            );
            return;
        }

        ctx.install_keys(client_key, server_key);
        self.send_check_batch(&mut ctx);
    }

    // ── check cycle ─────────────────────────────────────────────────────

    /// Draws a kind-grouped batch of 4-9 checks. Duplicate kinds are fine,
    /// duplicate catalog entries are not.
    pub fn assemble_batch(&self) -> Result<Vec<StagedCheck>, WardenError> {
        let mut rng = rand::rng();
        let size = rng.random_range(MIN_BATCH..=MAX_BATCH);

        let mut staged: Vec<StagedCheck> = Vec::with_capacity(size);
        for _ in 0..size {
            for _ in 0..MAX_SLOT_REDRAWS {
                let kind =
                    self.kind_with_fallback(draw_kind(rng.random::<f32>() * 100.0))?;
                let index = self.catalog.random_of(kind)?;
                if !staged.iter().any(|s| s.kind == kind && s.index == index) {
                    staged.push(StagedCheck { kind, index });
                    break;
                }
                // Small catalogs may not fill every slot; that is fine.
            }
        }

        if staged.is_empty() {
            return Err(WardenError::CatalogEmpty { kind: "any" });
        }

        // Wire order is kind-grouped; the client parser relies on it.
        staged.sort_by_key(|s| s.kind);
        Ok(staged)
    }

    fn kind_with_fallback(&self, kind: CheckKind) -> Result<CheckKind, WardenError> {
        if self.catalog.len_of(kind) > 0 {
            return Ok(kind);
        }
        FALLBACK_ORDER
            .into_iter()
            .find(|k| self.catalog.len_of(*k) > 0)
            .ok_or(WardenError::CatalogEmpty {
                kind: kind.as_str(),
            })
    }

    fn resolve<'a>(&'a self, staged: &[StagedCheck]) -> Option<Vec<&'a Check>> {
        staged
            .iter()
            .map(|s| self.catalog.get(s.kind, s.index))
            .collect()
    }

    fn send_check_batch(&self, ctx: &mut SessionContext) {
        let staged = match self.assemble_batch() {
            Ok(staged) => staged,
            Err(err) => {
                error!(session_id = ctx.session_id, %err, "cannot assemble batch");
                return;
            },
        };
        let Some(checks) = self.resolve(&staged) else {
            error!(session_id = ctx.session_id, "staged batch no longer resolves");
            return;
        };

        let xor_key = rand::rng().random::<u8>();
        let mut payload = build_check_request(&checks, xor_key);

        if !ctx.encrypt_outbound(&mut payload) {
            error!(
                session_id = ctx.session_id,
                "no keystreams; dropping check batch"
            );
            return;
        }

        debug!(
            session_id = ctx.session_id,
            checks = staged.len(),
            "cheat check batch out"
        );
        ctx.stage_batch(staged, xor_key);
        ctx.set_phase(WardenPhase::ChecksOutstanding);
        ctx.reply_deadline = Some(Instant::now() + self.cfg.checks.reply_timeout);
        ctx.next_check_due = None;
        self.sink
            .send_to_client(ctx.session_id, SMSG_WARDEN_DATA, &payload);
    }

    fn on_check_reply(&self, ctx: &mut SessionContext, bytes: &[u8]) {
        let staged = ctx.consume_reply();
        let Some(checks) = self.resolve(&staged) else {
            error!(session_id = ctx.session_id, "pending batch no longer resolves");
            ctx.set_phase(WardenPhase::Unregistered);
            return;
        };

        let mut plain = bytes.to_vec();
        if !ctx.decrypt_inbound(&mut plain) {
            // Unreachable while the phase invariants hold.
            error!(session_id = ctx.session_id, "reply before keystreams installed");
            ctx.set_phase(WardenPhase::Unregistered);
            return;
        }

        match parse_check_reply(&plain, &checks) {
            Ok(verdict) if verdict.passed() => {
                debug!(session_id = ctx.session_id, "cheat check batch passed");
                ctx.set_phase(WardenPhase::ChecksReceived);
                ctx.next_check_due = Some(Instant::now() + self.jittered_interval());
            },
            Ok(verdict) => {
                ctx.fail_counter += 1;
                for idx in &verdict.failures {
                    warn!(
                        session_id = ctx.session_id,
                        check = ?staged.get(*idx),
                        "check failed"
                    );
                }
                let err = WardenError::ClientIntegrityFail {
                    session_id: ctx.session_id,
                };
                self.discipline(ctx, &err, "integrity-fail");
                ctx.set_phase(WardenPhase::Unregistered);
            },
            Err(parse_err) => {
                let err = WardenError::ClientMalformedReply {
                    session_id: ctx.session_id,
                    reason: parse_err.to_string(),
                };
                self.discipline(ctx, &err, "malformed-reply");
                ctx.set_phase(WardenPhase::Unregistered);
            },
        }
    }

    /// Kick, and ban when configured. The client only ever sees a generic
    /// reason; the specifics stay in the operator log.
    fn discipline(&self, ctx: &SessionContext, err: &WardenError, reason: &str) {
        error!(
            session_id = ctx.session_id,
            account_id = ctx.account_id,
            %err,
            "disciplining session"
        );
        self.sink.kick(ctx.session_id, reason);
        if self.cfg.discipline.banning_enabled {
            self.sink.ban(ctx.account_id, reason, None);
        }
    }

    fn jittered_interval(&self) -> Duration {
        let base = self.cfg.checks.check_interval.as_millis() as i64;
        let spread = CHECK_JITTER.as_millis() as i64;
        let jitter = rand::rng().random_range(-spread..=spread);
        Duration::from_millis(base.saturating_add(jitter).max(0) as u64)
    }
}

impl std::fmt::Debug for WardenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WardenManager")
            .field("sessions", &self.sessions.len())
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

fn decode_fingerprint(fp: &str) -> Option<[u8; FINGERPRINT_LEN]> {
    hex::decode(fp).ok()?.try_into().ok()
}
