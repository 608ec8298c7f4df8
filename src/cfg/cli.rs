// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Environment variable overriding the manager config file location.
pub const CONFIG_ENV: &str = "WARDEN_CONFIG";
/// Environment variable overriding the check catalog file location.
pub const CATALOG_ENV: &str = "WARDEN_CATALOG";

/// Resolves a config file path for deployment: `env_var` wins over the
/// `default` location, relative paths are anchored at the working
/// directory, and the file must exist (the path is canonicalized so log
/// lines name the real file).
pub fn resolve_config_path(env_var: &str, default: &str) -> Result<PathBuf> {
    let chosen = match std::env::var(env_var) {
        Ok(p) if !p.is_empty() => PathBuf::from(p),
        _ => PathBuf::from(default),
    };

    let abs = if chosen.is_absolute() {
        chosen
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(chosen)
    };

    abs.canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))
}
