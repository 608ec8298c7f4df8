// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Catalog loading seam.
//!
//! The game server fills [`CatalogData`] from its relational store at
//! startup; tests and the demo binary load the same shape from YAML. The
//! catalog itself never talks to a database.

use std::{collections::HashMap, fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::catalog::checks::{
    DriverCheck, FileCheck, LuaCheck, MemoryCheck, ModuleCheck, PageCheck,
};

/// Raw catalog content, one vector per check kind plus the module map.
#[derive(Deserialize, Serialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct CatalogData {
    #[serde(default)]
    pub memory: Vec<MemoryCheck>,
    #[serde(default)]
    pub page: Vec<PageCheck>,
    #[serde(default)]
    pub file: Vec<FileCheck>,
    #[serde(default)]
    pub lua: Vec<LuaCheck>,
    #[serde(default)]
    pub driver: Vec<DriverCheck>,
    /// Reserved kind; loaded but never drawn.
    #[serde(default)]
    pub module: Vec<ModuleCheck>,
    /// Module fingerprint (lowercase hex MD5) -> supported check ids.
    #[serde(default)]
    pub modules: HashMap<String, Vec<u16>>,
}

impl CatalogData {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(&path).with_context(|| {
            format!("failed to read catalog {:?}", path.as_ref())
        })?;
        serde_yaml::from_str(&s).context("failed to parse catalog YAML")
    }
}
