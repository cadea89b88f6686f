// This file is part of xgq, a command-queue coordinator that schedules compute-unit work on FPGA accelerators.
//
// Copyright 2025 Canonical Ltd.
//
// SPDX-License-Identifier: GPL-3.0-only
//
// xgq is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License version 3, as published by the Free Software Foundation.
//
// xgq is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranties of MERCHANTABILITY, SATISFACTORY QUALITY, or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with this program.  If not, see http://www.gnu.org/licenses/.

//! Shared Memory Region Access
//!
//! The submission and completion rings, together with the auxiliary log and data pages, live in
//! memory that both the host and the embedded controller can see. This module gives that memory
//! a word-addressed interface so the ring code never has to know whether it is backed by a
//! mapped BAR, a reserved carve-out or, as in tests and the CLI, plain heap memory.
//!
//! Two kinds of access are offered. Plain word reads and writes are used for record payloads.
//! Acquire loads and release stores are used for the ring counters. A producer writes the
//! payload words first and then publishes the counter with a release store, so a consumer that
//! observes the counter with an acquire load also observes every payload word written before it.
//!
//! # Examples
//!
//! ```rust
//! # use xgq::region::{HeapRegion, SharedRegion, write_words, read_words};
//! let region = HeapRegion::new(64);
//! write_words(region.as_ref(), 8, &[0xabad_c0de, 7]);
//! let mut out = [0u32; 2];
//! read_words(region.as_ref(), 8, &mut out);
//! assert_eq!(out, [0xabad_c0de, 7]);
//! ```

use log::trace;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Size in bytes of the native word every record field is made of.
pub const WORD_SIZE: usize = 4;

/// Word-addressed view of memory shared with the peer.
///
/// Offsets are in bytes and must be word aligned. Out of range offsets are a programming error
/// and panic in the same way slice indexing does; ring geometry is validated against
/// [`SharedRegion::size`] once at attach time so the hot paths never see one.
pub trait SharedRegion: Send + Sync + Debug {
    /// Size of the region in bytes.
    fn size(&self) -> usize;
    /// Plain read of a payload word.
    fn read32(&self, offset: usize) -> u32;
    /// Plain write of a payload word.
    fn write32(&self, offset: usize, value: u32);
    /// Read a counter published by the peer.
    fn load_acquire32(&self, offset: usize) -> u32;
    /// Publish a counter to the peer. Every earlier write becomes visible before this one.
    fn store_release32(&self, offset: usize, value: u32);
}

/// A region backed by heap memory, shared between threads of one process.
#[derive(Debug)]
pub struct HeapRegion {
    words: Box<[AtomicU32]>,
}

impl HeapRegion {
    /// Allocate a zeroed region of at least `size` bytes, rounded up to whole words.
    pub fn new(size: usize) -> Arc<HeapRegion> {
        let count = size.div_ceil(WORD_SIZE);
        trace!("Allocating heap backed shared region of {count} words");
        let words: Vec<AtomicU32> = (0..count).map(|_| AtomicU32::new(0)).collect();
        Arc::new(HeapRegion {
            words: words.into_boxed_slice(),
        })
    }

    fn word(&self, offset: usize) -> &AtomicU32 {
        assert!(
            offset % WORD_SIZE == 0,
            "unaligned shared region offset {offset:#x}"
        );
        &self.words[offset / WORD_SIZE]
    }
}

impl SharedRegion for HeapRegion {
    fn size(&self) -> usize {
        self.words.len() * WORD_SIZE
    }

    fn read32(&self, offset: usize) -> u32 {
        self.word(offset).load(Ordering::Relaxed)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.word(offset).store(value, Ordering::Relaxed)
    }

    fn load_acquire32(&self, offset: usize) -> u32 {
        self.word(offset).load(Ordering::Acquire)
    }

    fn store_release32(&self, offset: usize, value: u32) {
        self.word(offset).store(value, Ordering::Release)
    }
}

/// Copy consecutive words into the region starting at `offset`.
///
/// # Arguments
///
/// * `region` - The shared region to write into
/// * `offset` - Byte offset of the first word
/// * `words` - The words to write, in order
pub fn write_words(region: &dyn SharedRegion, offset: usize, words: &[u32]) {
    trace!("Writing {} words at {offset:#x}", words.len());
    for (i, word) in words.iter().enumerate() {
        region.write32(offset + i * WORD_SIZE, *word);
    }
}

/// Copy consecutive words out of the region starting at `offset`, filling `out`.
///
/// # Arguments
///
/// * `region` - The shared region to read from
/// * `offset` - Byte offset of the first word
/// * `out` - Destination buffer, its length decides how many words are read
pub fn read_words(region: &dyn SharedRegion, offset: usize, out: &mut [u32]) {
    trace!("Reading {} words at {offset:#x}", out.len());
    for (i, word) in out.iter_mut().enumerate() {
        *word = region.read32(offset + i * WORD_SIZE);
    }
}

/// Write a byte buffer as little endian words. A trailing partial word is zero padded.
pub fn write_bytes(region: &dyn SharedRegion, offset: usize, bytes: &[u8]) {
    trace!("Writing {} bytes at {offset:#x}", bytes.len());
    for (i, chunk) in bytes.chunks(WORD_SIZE).enumerate() {
        let mut word = [0u8; WORD_SIZE];
        word[..chunk.len()].copy_from_slice(chunk);
        region.write32(offset + i * WORD_SIZE, u32::from_le_bytes(word));
    }
}

/// Read `len` bytes stored as little endian words.
///
/// # Returns: `Vec<u8>`
/// * Exactly `len` bytes, the tail of the last word is dropped when `len` is not word aligned
pub fn read_bytes(region: &dyn SharedRegion, offset: usize, len: usize) -> Vec<u8> {
    trace!("Reading {len} bytes at {offset:#x}");
    let mut bytes = Vec::with_capacity(len.next_multiple_of(WORD_SIZE));
    for i in 0..len.div_ceil(WORD_SIZE) {
        bytes.extend_from_slice(&region.read32(offset + i * WORD_SIZE).to_le_bytes());
    }
    bytes.truncate(len);
    bytes
}
