// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::time::sleep;
use tracing::info;
use warden_mgr_rs::{
    catalog::{CheckCatalog, store::CatalogData},
    cfg::{
        cli::{CATALOG_ENV, CONFIG_ENV, resolve_config_path},
        config::Config,
        logger::init_logger,
    },
    manager::{self, SessionSink},
};

/// Sink that only logs; a real deployment wires the world-session layer in
/// here.
struct LogSink;

impl SessionSink for LogSink {
    fn send_to_client(&self, session_id: u64, opcode: u16, bytes: &[u8]) {
        info!(session_id, opcode, len = bytes.len(), "would send to client");
    }

    fn kick(&self, session_id: u64, reason: &str) {
        info!(session_id, reason, "would kick");
    }

    fn ban(&self, account_id: u32, reason: &str, duration: Option<Duration>) {
        info!(account_id, reason, ?duration, "would ban");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _init_logger = init_logger("tests/config_logger.yaml")?;

    let cfg = resolve_config_path(CONFIG_ENV, "tests/config.yaml")
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")?;

    let catalog_path = resolve_config_path(CATALOG_ENV, "tests/catalog.yaml")
        .context("failed to resolve catalog")?;
    let data = CatalogData::load_from_file(catalog_path)?;
    let catalog = CheckCatalog::new(data, cfg.modules.module_dir.clone());

    let mgr = manager::init(cfg, catalog, Arc::new(LogSink))
        .context("manager init failed")?;
    info!("warden manager up, driving the daemon link; <Ctrl-C> to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sleep(Duration::from_millis(100)) => mgr.update().await,
        }
    }

    manager::shutdown().await;
    Ok(())
}
