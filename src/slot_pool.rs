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

//! Fixed pool of submission slots.
//!
//! Every in-flight command holds exactly one slot from the moment it is accepted until its
//! completion is processed. The pool is not locked on its own; the coordinator keeps it behind
//! the same lock as the command registry so both always agree on what is outstanding.

use crate::error::XgqError;
use log::{trace, warn};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotPolicy {
    /// Hand out free slots from a cache of free indices that is rebuilt once it runs dry.
    FirstAvailable,
    /// Scan from the slot after the one handed out last, so light load does not keep reusing
    /// slot 0.
    AfterLastReturned,
}

#[derive(Debug)]
pub struct Slot {
    index: usize,
    in_use: bool,
    owning_command_id: Option<u32>,
    staging: Vec<u32>,
}

impl Slot {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }

    pub fn owning_command_id(&self) -> Option<u32> {
        self.owning_command_id
    }
}

#[derive(Debug)]
pub struct SlotPool {
    slots: Vec<Slot>,
    policy: SlotPolicy,
    free_cache: Vec<usize>,
    cursor: usize,
}

impl SlotPool {
    /// Create `count` slots, each with a staging buffer of `slot_words` words.
    pub fn new(count: usize, slot_words: usize, policy: SlotPolicy) -> Result<SlotPool, XgqError> {
        if count == 0 {
            return Err(XgqError::InvalidArgument(
                "a slot pool needs at least one slot".to_string(),
            ));
        }
        trace!("Creating slot pool of {count} slots using {policy:?}");
        let slots = (0..count)
            .map(|index| Slot {
                index,
                in_use: false,
                owning_command_id: None,
                staging: vec![0; slot_words],
            })
            .collect();
        Ok(SlotPool {
            slots,
            policy,
            free_cache: Vec::with_capacity(count),
            cursor: 0,
        })
    }

    /// Mark a free slot in use and return its index, or `None` when every slot is taken.
    pub fn acquire(&mut self) -> Option<usize> {
        let index = match self.policy {
            SlotPolicy::FirstAvailable => self.acquire_cached(),
            SlotPolicy::AfterLastReturned => self.acquire_after_cursor(),
        }?;
        self.slots[index].in_use = true;
        trace!("Acquired slot {index}");
        Some(index)
    }

    fn acquire_cached(&mut self) -> Option<usize> {
        if self.free_cache.is_empty() {
            self.free_cache
                .extend(self.slots.iter().filter(|s| !s.in_use).map(|s| s.index));
        }
        // only acquire removes entries, so everything still cached is free
        self.free_cache.pop()
    }

    fn acquire_after_cursor(&mut self) -> Option<usize> {
        let count = self.slots.len();
        let index = (0..count)
            .map(|offset| (self.cursor + offset) % count)
            .find(|&index| !self.slots[index].in_use)?;
        self.cursor = (index + 1) % count;
        Some(index)
    }

    /// Record which command a slot carries.
    pub fn bind(&mut self, index: usize, command_id: u32) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.owning_command_id = Some(command_id);
        }
    }

    /// Give a slot back. Releasing a slot that is already free is logged and ignored.
    pub fn release(&mut self, index: usize) -> bool {
        match self.slots.get_mut(index) {
            Some(slot) if slot.in_use => {
                slot.in_use = false;
                slot.owning_command_id = None;
                trace!("Released slot {index}");
                true
            }
            Some(_) => {
                warn!("Slot {index} released while already free");
                false
            }
            None => {
                warn!("Slot {index} does not exist in a pool of {}", self.slots.len());
                false
            }
        }
    }

    /// Release every slot and return how many were in use.
    pub fn release_all(&mut self) -> usize {
        let mut released = 0;
        for slot in self.slots.iter_mut().filter(|s| s.in_use) {
            slot.in_use = false;
            slot.owning_command_id = None;
            released += 1;
        }
        released
    }

    pub fn staging_mut(&mut self, index: usize) -> Option<&mut [u32]> {
        self.slots.get_mut(index).map(|s| s.staging.as_mut_slice())
    }

    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
