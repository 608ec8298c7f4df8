// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use sha1::{Digest, Sha1};

pub const SEED_LEN: usize = 16;

/// Deterministic 16-byte -> 16-byte transform the client module applies to
/// the server seed during the registration handshake.
///
/// The concrete function is dictated by the deployed client build, so it is
/// injected at manager construction. [`sha1_truncate`] is the default.
pub type SeedTransform = fn(&[u8; SEED_LEN]) -> [u8; SEED_LEN];

/// Default transform: first 16 bytes of SHA-1 over the seed.
pub fn sha1_truncate(seed: &[u8; SEED_LEN]) -> [u8; SEED_LEN] {
    let digest = Sha1::digest(seed);
    let mut out = [0u8; SEED_LEN];
    out.copy_from_slice(&digest[..SEED_LEN]);
    out
}
