// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use rand::RngExt;
use warden_mgr_rs::{
    catalog::{CheckCatalog, checks::{CheckKind, LuaCheck}, store::CatalogData},
    manager::{WardenManager, draw_kind},
};

use crate::unit_tests::{NullSink, rich_catalog, sample_config};

#[test]
fn kind_distribution_matches_configured_ratios() {
    const DRAWS: usize = 10_000;
    let mut rng = rand::rng();

    let mut counts: HashMap<CheckKind, usize> = HashMap::new();
    for _ in 0..DRAWS {
        *counts
            .entry(draw_kind(rng.random::<f32>() * 100.0))
            .or_default() += 1;
    }

    let expected = [
        (CheckKind::Page, 50.0f64),
        (CheckKind::Memory, 44.0),
        (CheckKind::Driver, 3.4),
        (CheckKind::File, 1.3),
        (CheckKind::Lua, 1.3),
    ];
    for (kind, pct) in expected {
        let actual = *counts.get(&kind).unwrap_or(&0) as f64 / DRAWS as f64 * 100.0;
        assert!(
            (actual - pct).abs() <= 2.0,
            "{kind:?}: expected ~{pct}%, drew {actual:.2}%"
        );
    }
    assert!(!counts.contains_key(&CheckKind::Module));
}

#[test]
fn batches_are_sized_grouped_and_deduplicated() {
    let mgr = WardenManager::new(sample_config(), rich_catalog(), Arc::new(NullSink));

    for _ in 0..200 {
        let batch = mgr.assemble_batch().expect("rich catalog");

        assert!((4..=9).contains(&batch.len()), "batch size {}", batch.len());

        // Kind-grouped wire order.
        for pair in batch.windows(2) {
            assert!(pair[0].kind <= pair[1].kind, "batch not kind-grouped");
        }

        // Duplicate kinds are fine, duplicate catalog entries are not.
        for (i, a) in batch.iter().enumerate() {
            for b in &batch[i + 1..] {
                assert!(
                    !(a.kind == b.kind && a.index == b.index),
                    "duplicate catalog entry in batch"
                );
            }
        }

        assert!(batch.iter().all(|s| s.kind != CheckKind::Module));
    }
}

#[test]
fn empty_kinds_fall_through_to_populated_ones() {
    let data = CatalogData {
        lua: (0..12)
            .map(|i| LuaCheck {
                ident: format!("G{i}"),
            })
            .collect(),
        ..CatalogData::default()
    };
    let catalog = CheckCatalog::new(data, PathBuf::from("modules"));
    let mgr = WardenManager::new(sample_config(), catalog, Arc::new(NullSink));

    for _ in 0..50 {
        let batch = mgr.assemble_batch().expect("lua entries exist");
        assert!(!batch.is_empty());
        assert!(batch.iter().all(|s| s.kind == CheckKind::Lua));
    }
}

#[test]
fn fully_empty_catalog_is_an_error() {
    let catalog = CheckCatalog::new(CatalogData::default(), PathBuf::from("modules"));
    let mgr = WardenManager::new(sample_config(), catalog, Arc::new(NullSink));
    assert!(mgr.assemble_batch().is_err());
}
