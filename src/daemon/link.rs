// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Single long-lived TCP client to the key/module daemon.
//!
//! The link owns reconnection (capped exponential backoff), the heartbeat
//! (a PING whose PONG must land before the next ping tick), and the
//! key-derivation queue: at most one `NEW_KEYS_REQ` is on the wire at any
//! moment, later requests wait in FIFO order, and whatever was in flight
//! when the connection dropped is replayed after the next connect.

use std::{collections::VecDeque, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, mpsc},
    time::{Instant, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zerocopy::{FromBytes, IntoBytes};

use crate::{
    daemon::{
        frame::{
            FRAME_HEADER_LEN, FrameHeader, KEY_HALVES_LEN, NewKeysReqBody,
            NewKeysRspBody, RC4_KEY_LEN,
        },
        opcode::DaemonOpcode,
    },
    error::WardenError,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Upper bound on daemon frame bodies; anything larger is a violation.
const MAX_FRAME_BODY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Ready,
    Stalled,
}

/// One queued key derivation.
#[derive(Debug, Clone)]
pub struct KeyRequest {
    pub session_id: u64,
    pub key_halves: [u8; KEY_HALVES_LEN],
    pub requested_at: Instant,
}

/// Inbound daemon messages surfaced to the manager tick.
#[derive(Debug)]
pub enum DaemonEvent {
    Pong,
    NewKeys {
        session_id: u64,
        client_key: [u8; RC4_KEY_LEN],
        server_key: [u8; RC4_KEY_LEN],
    },
    Disconnected,
    /// A local link failure: the daemon was unreachable or spoke garbage.
    /// Recovery (reconnect, replay) has already been scheduled by the link.
    Fault(WardenError),
}

struct LinkInner {
    state: LinkState,
    writer: Option<OwnedWriteHalf>,
    conn_cancel: CancellationToken,

    ping_outstanding: bool,
    next_ping: Instant,

    next_reconnect: Instant,
    backoff: Duration,

    in_flight: Option<KeyRequest>,
    queue: VecDeque<KeyRequest>,
}

pub struct DaemonLink {
    endpoint: String,
    ping_interval: Duration,
    cancel: CancellationToken,

    events_tx: mpsc::UnboundedSender<DaemonEvent>,
    events_rx: Mutex<mpsc::UnboundedReceiver<DaemonEvent>>,
    inner: Mutex<LinkInner>,
}

impl DaemonLink {
    pub fn new(
        endpoint: String,
        ping_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            endpoint,
            ping_interval,
            cancel,
            events_tx,
            events_rx: Mutex::new(events_rx),
            inner: Mutex::new(LinkInner {
                state: LinkState::Disconnected,
                writer: None,
                conn_cancel: CancellationToken::new(),
                ping_outstanding: false,
                next_ping: Instant::now(),
                next_reconnect: Instant::now(),
                backoff: MIN_BACKOFF,
                in_flight: None,
                queue: VecDeque::new(),
            }),
        }
    }

    pub async fn state(&self) -> LinkState {
        self.inner.lock().await.state
    }

    pub async fn is_ready(&self) -> bool {
        self.state().await == LinkState::Ready
    }

    /// Advances reconnect and heartbeat timers. Called from the manager's
    /// global update.
    pub async fn tick(&self) {
        if self.cancel.is_cancelled() {
            return;
        }

        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        match inner.state {
            LinkState::Disconnected if now >= inner.next_reconnect => {
                self.try_connect(&mut inner).await;
            },
            LinkState::Ready if now >= inner.next_ping => {
                if inner.ping_outstanding {
                    warn!("daemon ping unanswered, closing stalled link");
                    inner.state = LinkState::Stalled;
                    self.close_conn(&mut inner);
                } else if self.send_frame(&mut inner, DaemonOpcode::Ping, &[]).await {
                    inner.ping_outstanding = true;
                    inner.next_ping = now + self.ping_interval;
                }
            },
            _ => {},
        }
    }

    /// Queues a key derivation for `session_id`. A session never has two
    /// overlapping requests; duplicates are ignored.
    pub async fn request_keys(
        &self,
        session_id: u64,
        key_halves: [u8; KEY_HALVES_LEN],
    ) {
        let mut inner = self.inner.lock().await;

        let duplicate = inner
            .in_flight
            .as_ref()
            .is_some_and(|r| r.session_id == session_id)
            || inner.queue.iter().any(|r| r.session_id == session_id);
        if duplicate {
            debug!(session_id, "key request already pending");
            return;
        }

        inner.queue.push_back(KeyRequest {
            session_id,
            key_halves,
            requested_at: Instant::now(),
        });
        self.pump(&mut inner).await;
    }

    /// Drops any queued key request for a session being unregistered.
    pub async fn cancel_session(&self, session_id: u64) {
        let mut inner = self.inner.lock().await;
        inner.queue.retain(|r| r.session_id != session_id);
    }

    /// Drains inbound daemon messages, handling link bookkeeping inline
    /// and returning only the events the manager must act on.
    pub async fn drain_events(&self) -> Vec<DaemonEvent> {
        let mut out = Vec::new();
        let mut rx = self.events_rx.lock().await;

        while let Ok(ev) = rx.try_recv() {
            match ev {
                DaemonEvent::Pong => {
                    let mut inner = self.inner.lock().await;
                    inner.ping_outstanding = false;
                },
                DaemonEvent::Fault(err) => {
                    out.push(DaemonEvent::Fault(err));
                },
                DaemonEvent::Disconnected => {
                    let mut inner = self.inner.lock().await;
                    if inner.state != LinkState::Disconnected {
                        warn!("daemon link lost");
                        self.close_conn(&mut inner);
                    }
                    out.push(DaemonEvent::Disconnected);
                },
                DaemonEvent::NewKeys {
                    session_id,
                    client_key,
                    server_key,
                } => {
                    let mut inner = self.inner.lock().await;
                    if inner
                        .in_flight
                        .as_ref()
                        .is_some_and(|r| r.session_id == session_id)
                    {
                        if let Some(req) = inner.in_flight.take() {
                            debug!(
                                session_id,
                                elapsed_ms =
                                    req.requested_at.elapsed().as_millis() as u64,
                                "key derivation answered"
                            );
                        }
                        self.pump(&mut inner).await;
                    } else {
                        debug!(session_id, "key response did not match in-flight slot");
                    }
                    drop(inner);
                    out.push(DaemonEvent::NewKeys {
                        session_id,
                        client_key,
                        server_key,
                    });
                },
            }
        }

        out
    }

    /// Sends a graceful DISCONNECT and tears the link down.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == LinkState::Ready {
            let _ = self
                .send_frame(&mut inner, DaemonOpcode::Disconnect, &[])
                .await;
        }
        self.close_conn(&mut inner);
        self.cancel.cancel();
    }

    async fn try_connect(&self, inner: &mut LinkInner) {
        inner.state = LinkState::Connecting;

        match timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.endpoint)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                let (r, w) = stream.into_split();

                let conn_cancel = self.cancel.child_token();
                inner.conn_cancel = conn_cancel.clone();
                inner.writer = Some(w);
                inner.state = LinkState::Ready;
                inner.backoff = MIN_BACKOFF;
                inner.ping_outstanding = false;
                inner.next_ping = Instant::now() + self.ping_interval;

                tokio::spawn(read_loop(r, self.events_tx.clone(), conn_cancel));
                info!(endpoint = %self.endpoint, "daemon link ready");

                // Replay whatever the previous connection swallowed.
                if let Some(req) = inner.in_flight.take() {
                    inner.queue.push_front(req);
                }
                self.pump(inner).await;
            },
            _ => {
                let err = WardenError::DaemonUnreachable {
                    addr: self.endpoint.clone(),
                };
                warn!(%err, "connect attempt failed");
                let _ = self.events_tx.send(DaemonEvent::Fault(err));
                inner.state = LinkState::Disconnected;
                inner.next_reconnect = Instant::now() + inner.backoff;
                inner.backoff = (inner.backoff * 2).min(MAX_BACKOFF);
            },
        }
    }

    /// Moves the head of the queue into the single in-flight slot.
    async fn pump(&self, inner: &mut LinkInner) {
        if inner.state != LinkState::Ready || inner.in_flight.is_some() {
            return;
        }
        let Some(req) = inner.queue.pop_front() else {
            return;
        };

        let body = NewKeysReqBody {
            session_id: req.session_id.into(),
            key_halves: req.key_halves,
        };
        if self
            .send_frame(inner, DaemonOpcode::NewKeysReq, body.as_bytes())
            .await
        {
            debug!(session_id = req.session_id, "key request on the wire");
            inner.in_flight = Some(req);
        } else {
            inner.queue.push_front(req);
        }
    }

    async fn send_frame(
        &self,
        inner: &mut LinkInner,
        opcode: DaemonOpcode,
        body: &[u8],
    ) -> bool {
        let frame = crate::daemon::frame::encode_frame(opcode, body);
        let Some(writer) = inner.writer.as_mut() else {
            return false;
        };

        match timeout(WRITE_TIMEOUT, writer.write_all(&frame)).await {
            Ok(Ok(())) => true,
            _ => {
                warn!(?opcode, "daemon write failed");
                self.close_conn(inner);
                false
            },
        }
    }

    fn close_conn(&self, inner: &mut LinkInner) {
        inner.conn_cancel.cancel();
        inner.writer = None;
        inner.ping_outstanding = false;
        if let Some(req) = inner.in_flight.take() {
            inner.queue.push_front(req);
        }
        inner.state = LinkState::Disconnected;
        inner.next_reconnect = Instant::now() + inner.backoff;
        inner.backoff = (inner.backoff * 2).min(MAX_BACKOFF);
    }
}

impl std::fmt::Debug for DaemonLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonLink")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    tx: mpsc::UnboundedSender<DaemonEvent>,
    cancel: CancellationToken,
) {
    loop {
        let mut hdr = [0u8; FRAME_HEADER_LEN];
        tokio::select! {
            _ = cancel.cancelled() => return,
            res = reader.read_exact(&mut hdr) => {
                if res.is_err() {
                    break;
                }
            },
        }

        let Ok(header) = FrameHeader::read_from_bytes(&hdr) else {
            break;
        };
        let len = header.len.get() as usize;
        if len > MAX_FRAME_BODY {
            violation(&tx, format!("frame body of {len} bytes exceeds limit"));
            break;
        }

        let mut body = vec![0u8; len];
        if len > 0 {
            tokio::select! {
                _ = cancel.cancelled() => return,
                res = reader.read_exact(&mut body) => {
                    if res.is_err() {
                        break;
                    }
                },
            }
        }

        match DaemonOpcode::from_u8(header.opcode) {
            Some(DaemonOpcode::Pong) => {
                if tx.send(DaemonEvent::Pong).is_err() {
                    return;
                }
            },
            Some(DaemonOpcode::NewKeysRsp) => {
                let Ok(rsp) = NewKeysRspBody::read_from_bytes(&body) else {
                    violation(&tx, format!("NEW_KEYS_RSP body of {len} bytes"));
                    break;
                };
                let ev = DaemonEvent::NewKeys {
                    session_id: rsp.session_id.get(),
                    client_key: rsp.client_key,
                    server_key: rsp.server_key,
                };
                if tx.send(ev).is_err() {
                    return;
                }
            },
            Some(DaemonOpcode::Disconnect) => break,
            Some(other) => {
                violation(
                    &tx,
                    format!("unexpected opcode 0x{:02x}", other as u8),
                );
                break;
            },
            None => {
                violation(
                    &tx,
                    format!("unknown opcode 0x{:02x}", header.opcode),
                );
                break;
            },
        }
    }

    let _ = tx.send(DaemonEvent::Disconnected);
}

/// Logs a protocol violation and hands the typed error up to the manager.
fn violation(tx: &mpsc::UnboundedSender<DaemonEvent>, reason: String) {
    let err = WardenError::DaemonProtocolViolation { reason };
    warn!(%err, "closing daemon link");
    let _ = tx.send(DaemonEvent::Fault(err));
}
