// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use sha1::{Digest, Sha1};

/// Legacy packet checksum: SHA-1 over `data`, the five 32-bit digest words
/// folded together with XOR. Words are read little-endian, matching the
/// client's fold.
pub fn packet_checksum(data: &[u8]) -> u32 {
    let digest = Sha1::digest(data);

    let mut folded = 0u32;
    for word in digest.chunks_exact(4) {
        folded ^= u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
    }
    folded
}
