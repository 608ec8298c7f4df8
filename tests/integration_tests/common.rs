// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use md5::{Digest as _, Md5};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use warden_mgr_rs::{
    catalog::{
        CheckCatalog,
        checks::{LuaCheck, MemoryCheck, PageCheck},
        store::CatalogData,
    },
    cfg::config::{CheckSchedule, Config, DaemonConfig, Discipline, Modules},
    daemon::{
        frame::{
            FRAME_HEADER_LEN, FrameHeader, NewKeysReqBody, NewKeysRspBody,
            encode_frame,
        },
        opcode::DaemonOpcode,
    },
    manager::SessionSink,
};
use zerocopy::{FromBytes, IntoBytes};

/// Keys the mock daemon hands out, fixed so tests can key client-side
/// streams.
pub const CLIENT_KEY: [u8; 16] = [
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C,
    0x0D, 0x0E, 0x0F, 0x10,
];
pub const SERVER_KEY: [u8; 16] = [
    0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1C,
    0x1D, 0x1E, 0x1F, 0x20,
];

/// Sink that records everything the manager pushes towards the game layer.
#[derive(Default)]
pub struct RecordingSink {
    pub sent: StdMutex<Vec<(u64, u16, Vec<u8>)>>,
    pub kicks: StdMutex<Vec<(u64, String)>>,
    pub bans: StdMutex<Vec<(u32, String)>>,
}

impl RecordingSink {
    pub fn payloads(&self, session_id: u64) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .expect("sent lock")
            .iter()
            .filter(|(sid, _, _)| *sid == session_id)
            .map(|(_, _, b)| b.clone())
            .collect()
    }

    pub fn last_payload(&self, session_id: u64) -> Option<Vec<u8>> {
        self.payloads(session_id).pop()
    }

    pub fn kick_reasons(&self, session_id: u64) -> Vec<String> {
        self.kicks
            .lock()
            .expect("kicks lock")
            .iter()
            .filter(|(sid, _)| *sid == session_id)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn ban_reasons(&self, account_id: u32) -> Vec<String> {
        self.bans
            .lock()
            .expect("bans lock")
            .iter()
            .filter(|(acc, _)| *acc == account_id)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

impl SessionSink for RecordingSink {
    fn send_to_client(&self, session_id: u64, opcode: u16, bytes: &[u8]) {
        self.sent
            .lock()
            .expect("sent lock")
            .push((session_id, opcode, bytes.to_vec()));
    }

    fn kick(&self, session_id: u64, reason: &str) {
        self.kicks
            .lock()
            .expect("kicks lock")
            .push((session_id, reason.to_string()));
    }

    fn ban(&self, account_id: u32, reason: &str, _duration: Option<Duration>) {
        self.bans
            .lock()
            .expect("bans lock")
            .push((account_id, reason.to_string()));
    }
}

/// Config with short timers pointed at a test daemon port.
pub fn test_config(port: u16, module_dir: PathBuf) -> Config {
    Config {
        daemon: DaemonConfig {
            address: "127.0.0.1".into(),
            port,
            ping_interval: Duration::from_secs(30),
        },
        checks: CheckSchedule {
            check_interval: Duration::from_secs(6),
            reply_timeout: Duration::from_secs(1),
        },
        discipline: Discipline {
            banning_enabled: true,
        },
        modules: Modules { module_dir },
    }
}

/// A module image on disk plus its identifiers.
pub struct TestModule {
    pub dir: PathBuf,
    pub fp: String,
    pub raw_fp: [u8; 16],
    pub bytes: Vec<u8>,
}

/// Writes a deterministic module image into a per-test temp dir, named by
/// its MD5 fingerprint the way the daemon-side archive stores them.
pub fn write_test_module(tag: &str) -> TestModule {
    let dir = std::env::temp_dir().join(format!(
        "warden-mgr-test-{tag}-{}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).expect("create module dir");

    let bytes: Vec<u8> = (0..1117u32).map(|i| (i % 251) as u8).collect();
    let digest = Md5::digest(&bytes);
    let fp = hex::encode(digest);
    let mut raw_fp = [0u8; 16];
    raw_fp.copy_from_slice(&digest);

    std::fs::write(dir.join(&fp), &bytes).expect("write module");

    TestModule {
        dir,
        fp,
        raw_fp,
        bytes,
    }
}

/// Catalog with known digests and the given module map.
pub fn test_catalog(module: &TestModule) -> CheckCatalog {
    let mut data = CatalogData {
        memory: vec![
            MemoryCheck {
                label: "client text".into(),
                offset: 0x0040_1000,
                length: 0x20,
                expected: [0x5A; 20],
            },
            MemoryCheck {
                label: "overlay table".into(),
                offset: 0x0048_2000,
                length: 0x40,
                expected: [0x6B; 20],
            },
        ],
        page: vec![
            PageCheck {
                seed: 0xDEAD_CAFE,
                offset: 0x0040_2000,
                length: 16,
                expected: [0x7C; 20],
            },
            PageCheck {
                seed: 0xFEED_BEEF,
                offset: 0x0040_3000,
                length: 16,
                expected: [0x8D; 20],
            },
        ],
        lua: vec![LuaCheck {
            ident: "SuspiciousGlobal".into(),
        }],
        ..CatalogData::default()
    };
    data.modules.insert(module.fp.clone(), vec![1, 2, 3]);
    CheckCatalog::new(data, module.dir.clone())
}

#[derive(Debug, Clone, Copy)]
pub struct DaemonBehavior {
    pub answer_pings: bool,
    pub answer_keys: bool,
    /// Close the connection on the first NEW_KEYS_REQ instead of replying.
    pub drop_on_first_key_req: bool,
}

impl Default for DaemonBehavior {
    fn default() -> Self {
        Self {
            answer_pings: true,
            answer_keys: true,
            drop_on_first_key_req: false,
        }
    }
}

/// Minimal in-process stand-in for the key daemon.
pub struct MockDaemon {
    pub port: u16,
    pub connections: Arc<AtomicUsize>,
    pub key_requests: Arc<StdMutex<Vec<u64>>>,
}

impl MockDaemon {
    pub async fn spawn(behavior: DaemonBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        Self::run(listener, behavior)
    }

    pub async fn spawn_on(port: u16, behavior: DaemonBehavior) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("bind fixed port");
        Self::run(listener, behavior)
    }

    fn run(listener: TcpListener, behavior: DaemonBehavior) -> Self {
        let port = listener.local_addr().expect("local addr").port();
        let connections = Arc::new(AtomicUsize::new(0));
        let key_requests = Arc::new(StdMutex::new(Vec::new()));
        let dropped_once = Arc::new(AtomicBool::new(false));

        {
            let connections = Arc::clone(&connections);
            let key_requests = Arc::clone(&key_requests);
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve_conn(
                        stream,
                        behavior,
                        Arc::clone(&key_requests),
                        Arc::clone(&dropped_once),
                    ));
                }
            });
        }

        Self {
            port,
            connections,
            key_requests,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn seen_key_requests(&self) -> Vec<u64> {
        self.key_requests.lock().expect("key requests lock").clone()
    }
}

async fn serve_conn(
    mut stream: TcpStream,
    behavior: DaemonBehavior,
    key_requests: Arc<StdMutex<Vec<u64>>>,
    dropped_once: Arc<AtomicBool>,
) {
    loop {
        let mut hdr = [0u8; FRAME_HEADER_LEN];
        if stream.read_exact(&mut hdr).await.is_err() {
            return;
        }
        let Ok(header) = FrameHeader::read_from_bytes(&hdr) else {
            return;
        };

        let mut body = vec![0u8; header.len.get() as usize];
        if !body.is_empty() && stream.read_exact(&mut body).await.is_err() {
            return;
        }

        match DaemonOpcode::from_u8(header.opcode) {
            Some(DaemonOpcode::Ping) => {
                if behavior.answer_pings {
                    let frame = encode_frame(DaemonOpcode::Pong, &[]);
                    if stream.write_all(&frame).await.is_err() {
                        return;
                    }
                }
            },
            Some(DaemonOpcode::NewKeysReq) => {
                let Ok(req) = NewKeysReqBody::read_from_bytes(&body) else {
                    return;
                };
                key_requests
                    .lock()
                    .expect("key requests lock")
                    .push(req.session_id.get());

                if behavior.drop_on_first_key_req
                    && !dropped_once.swap(true, Ordering::SeqCst)
                {
                    return;
                }
                if behavior.answer_keys {
                    let rsp = NewKeysRspBody {
                        session_id: req.session_id,
                        client_key: CLIENT_KEY,
                        server_key: SERVER_KEY,
                    };
                    let frame =
                        encode_frame(DaemonOpcode::NewKeysRsp, rsp.as_bytes());
                    if stream.write_all(&frame).await.is_err() {
                        return;
                    }
                }
            },
            Some(DaemonOpcode::Disconnect) => return,
            _ => return,
        }
    }
}

/// Reserves a TCP port that nothing is listening on.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    listener.local_addr().expect("local addr").port()
}
