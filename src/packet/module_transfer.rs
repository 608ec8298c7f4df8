// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Handshake payloads sent before the session keystreams exist: module
//! announcement, chunked module transfer, and the seed hash request.

use bytes::{BufMut, BytesMut};

use crate::{crypto::seed::SEED_LEN, packet::opcode::ServerOpcode};

/// Raw (un-hexed) module fingerprint length.
pub const FINGERPRINT_LEN: usize = 16;

/// Largest module slice carried by one MODULE_CHUNK payload.
pub const MODULE_CHUNK_LEN: usize = 500;

/// `LOAD_MODULE`: announces the chosen module by raw fingerprint and size.
pub fn build_load_module(fingerprint: &[u8; FINGERPRINT_LEN], size: u32) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(1 + FINGERPRINT_LEN + 4);
    out.put_u8(ServerOpcode::LoadModule as u8);
    out.put_slice(fingerprint);
    out.put_u32_le(size);
    out.to_vec()
}

/// `MODULE_CHUNK` sequence covering the whole module image, in order.
pub fn build_module_chunks(module: &[u8]) -> Vec<Vec<u8>> {
    module
        .chunks(MODULE_CHUNK_LEN)
        .map(|chunk| {
            let mut out = BytesMut::with_capacity(3 + chunk.len());
            out.put_u8(ServerOpcode::ModuleChunk as u8);
            out.put_u16_le(chunk.len() as u16);
            out.put_slice(chunk);
            out.to_vec()
        })
        .collect()
}

/// `HASH_REQUEST`: carries the 16-byte server seed to transform.
pub fn build_hash_request(server_seed: &[u8; SEED_LEN]) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(1 + SEED_LEN);
    out.put_u8(ServerOpcode::HashRequest as u8);
    out.put_slice(server_seed);
    out.to_vec()
}
