//! In-memory catalogs of integrity checks and Warden modules.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Typed check entries and the tagged `Check` union.
pub mod checks;
/// Loader seam between the relational store and the in-memory catalog.
pub mod store;

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Mutex,
};

use md5::{Digest, Md5};
use rand::RngExt;
use tracing::warn;

use crate::{
    catalog::{
        checks::{Check, CheckKind},
        store::CatalogData,
    },
    error::WardenError,
};

/// Immutable post-load catalog of checks plus the module map.
///
/// The only mutable piece is the set of fingerprints found missing on disk,
/// which only ever grows and only shrinks the draw pool.
pub struct CheckCatalog {
    page: Vec<Check>,
    memory: Vec<Check>,
    driver: Vec<Check>,
    file: Vec<Check>,
    lua: Vec<Check>,
    module: Vec<Check>,

    modules: std::collections::HashMap<String, Vec<u16>>,
    module_dir: PathBuf,
    missing: Mutex<HashSet<String>>,
}

impl CheckCatalog {
    pub fn new(data: CatalogData, module_dir: PathBuf) -> Self {
        Self {
            page: data.page.into_iter().map(Check::Page).collect(),
            memory: data.memory.into_iter().map(Check::Memory).collect(),
            driver: data.driver.into_iter().map(Check::Driver).collect(),
            file: data.file.into_iter().map(Check::File).collect(),
            lua: data.lua.into_iter().map(Check::Lua).collect(),
            module: data.module.into_iter().map(Check::Module).collect(),
            modules: data.modules,
            module_dir,
            missing: Mutex::new(HashSet::new()),
        }
    }

    fn of_kind(&self, kind: CheckKind) -> &[Check] {
        match kind {
            CheckKind::Page => &self.page,
            CheckKind::Memory => &self.memory,
            CheckKind::Driver => &self.driver,
            CheckKind::File => &self.file,
            CheckKind::Lua => &self.lua,
            CheckKind::Module => &self.module,
        }
    }

    pub fn len_of(&self, kind: CheckKind) -> usize {
        self.of_kind(kind).len()
    }

    /// Uniformly random index into the catalog for `kind`.
    pub fn random_of(&self, kind: CheckKind) -> Result<usize, WardenError> {
        let entries = self.of_kind(kind);
        if entries.is_empty() {
            return Err(WardenError::CatalogEmpty {
                kind: kind.as_str(),
            });
        }
        Ok(rand::rng().random_range(0..entries.len()))
    }

    pub fn get(&self, kind: CheckKind, index: usize) -> Option<&Check> {
        self.of_kind(kind).get(index)
    }

    /// Fingerprints still eligible for assignment.
    pub fn module_fingerprints(&self) -> HashSet<String> {
        let missing = self.missing.lock().unwrap_or_else(|e| e.into_inner());
        self.modules
            .keys()
            .filter(|fp| !missing.contains(*fp))
            .cloned()
            .collect()
    }

    /// Check ids supported by a module, when known.
    pub fn module_check_ids(&self, fingerprint: &str) -> Option<&[u16]> {
        self.modules.get(fingerprint).map(Vec::as_slice)
    }

    pub fn module_path(&self, fingerprint: &str) -> PathBuf {
        self.module_dir.join(fingerprint)
    }

    /// Draws a random module whose binary is present on disk. Fingerprints
    /// with no backing file are excluded from all future draws.
    pub fn random_module(&self) -> Result<String, WardenError> {
        let mut candidates: Vec<String> =
            self.module_fingerprints().into_iter().collect();

        if candidates.is_empty() {
            return Err(WardenError::CatalogEmpty { kind: "module" });
        }

        let mut rng = rand::rng();
        while !candidates.is_empty() {
            let pick = rng.random_range(0..candidates.len());
            let fp = candidates.swap_remove(pick);

            if self.module_path(&fp).is_file() {
                return Ok(fp);
            }
            warn!(fingerprint = %fp, "warden module missing on disk, excluding");
            self.missing
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(fp.clone());

            if candidates.is_empty() {
                return Err(WardenError::ModuleMissingOnDisk { fingerprint: fp });
            }
        }

        Err(WardenError::CatalogEmpty { kind: "module" })
    }

    /// Reads a module image and verifies it still matches its fingerprint.
    pub fn read_module(&self, fingerprint: &str) -> Result<Vec<u8>, WardenError> {
        let path = self.module_path(fingerprint);
        let bytes = std::fs::read(&path).map_err(|_| {
            self.mark_missing(fingerprint);
            WardenError::ModuleMissingOnDisk {
                fingerprint: fingerprint.to_string(),
            }
        })?;

        let digest = hex::encode(Md5::digest(&bytes));
        if digest != fingerprint {
            warn!(fingerprint, actual = %digest, "module content does not match fingerprint");
            self.mark_missing(fingerprint);
            return Err(WardenError::ModuleMissingOnDisk {
                fingerprint: fingerprint.to_string(),
            });
        }

        Ok(bytes)
    }

    fn mark_missing(&self, fingerprint: &str) {
        self.missing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(fingerprint.to_string());
    }
}

impl std::fmt::Debug for CheckCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckCatalog")
            .field("page", &self.page.len())
            .field("memory", &self.memory.len())
            .field("driver", &self.driver.len())
            .field("file", &self.file.len())
            .field("lua", &self.lua.len())
            .field("module", &self.module.len())
            .field("modules", &self.modules.len())
            .field("module_dir", &self.module_dir)
            .finish()
    }
}

/// Returns the lowercase hex MD5 fingerprint of a module image on disk.
pub fn fingerprint_of(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(hex::encode(Md5::digest(&bytes)))
}
