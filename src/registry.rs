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

//! In-flight command bookkeeping.
//!
//! [`CommandRegistry`] answers "is this command still outstanding". [`IdGenerator`] hands out
//! the primary and secondary ids. [`FinishedCommands`] keeps the outcome of every finished
//! command until the caller fetches it.

use crate::wire::{Opcode, RESULT_PAYLOAD_SIZE};
use log::{debug, trace};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{HashMap, VecDeque};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Result code recorded for commands drained without a completion.
pub const ETIME_RESULT: i32 = -62;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Submitted,
    Completed,
    Errored,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct CommandRecord {
    pub primary_id: u32,
    pub secondary_id: u32,
    pub opcode: Opcode,
    pub target_unit_index: u32,
    pub assigned_slot: usize,
    pub state: CommandState,
    pub result_code: i32,
    pub result_payload: [u8; RESULT_PAYLOAD_SIZE],
    pub deadline: Instant,
}

impl CommandRecord {
    pub fn new(
        primary_id: u32,
        secondary_id: u32,
        opcode: Opcode,
        target_unit_index: u32,
        assigned_slot: usize,
        deadline: Instant,
    ) -> CommandRecord {
        CommandRecord {
            primary_id,
            secondary_id,
            opcode,
            target_unit_index,
            assigned_slot,
            state: CommandState::Submitted,
            result_code: 0,
            result_payload: [0; RESULT_PAYLOAD_SIZE],
            deadline,
        }
    }
}

#[derive(Debug, Default)]
pub struct CommandRegistry {
    records: HashMap<u32, CommandRecord>,
}

impl CommandRegistry {
    /// Insert `record` unless its primary id is already live. Returns whether it was inserted.
    pub fn insert(&mut self, record: CommandRecord) -> bool {
        match self.records.entry(record.primary_id) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                trace!("Registered command {}", record.primary_id);
                slot.insert(record);
                true
            }
        }
    }

    pub fn remove(&mut self, primary_id: u32) -> Option<CommandRecord> {
        self.records.remove(&primary_id)
    }

    pub fn find(&self, primary_id: u32) -> Option<&CommandRecord> {
        self.records.get(&primary_id)
    }

    /// A command is outstanding when its primary id is live and carries the same secondary id.
    pub fn is_outstanding(&self, primary_id: u32, secondary_id: u32) -> bool {
        self.find(primary_id)
            .is_some_and(|r| r.secondary_id == secondary_id)
    }

    /// Remove every record whose deadline has passed.
    pub fn take_expired(&mut self, now: Instant) -> Vec<CommandRecord> {
        let expired: Vec<u32> = self
            .records
            .values()
            .filter(|r| r.deadline <= now)
            .map(|r| r.primary_id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.records.remove(&id))
            .collect()
    }

    pub fn has_expired(&self, now: Instant) -> bool {
        self.first_expired(now).is_some()
    }

    /// The expired record with the earliest deadline.
    pub fn first_expired(&self, now: Instant) -> Option<&CommandRecord> {
        self.records
            .values()
            .filter(|r| r.deadline <= now)
            .min_by_key(|r| r.deadline)
    }

    pub fn drain(&mut self) -> Vec<CommandRecord> {
        self.records.drain().map(|(_, r)| r).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn fresh_rng() -> ChaCha8Rng {
    let entropy: u64 = rand::rng().random();
    let wall_clock = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    ChaCha8Rng::seed_from_u64(entropy ^ wall_clock.rotate_left(32))
}

/// Per-device id source.
///
/// The primary id counts up from 1 and skips 0 when it wraps. Every wrap reseeds the generator
/// behind the secondary id, so a handle kept across 2^32 submissions does not match the command
/// that reuses its primary id.
#[derive(Debug)]
pub struct IdGenerator {
    primary: u32,
    secondary: u32,
    rng: ChaCha8Rng,
    reseeds: u64,
}

impl Default for IdGenerator {
    fn default() -> Self {
        IdGenerator::new()
    }
}

impl IdGenerator {
    pub fn new() -> IdGenerator {
        IdGenerator::starting_after(0)
    }

    /// Start so that the next primary id is `primary + 1`.
    pub fn starting_after(primary: u32) -> IdGenerator {
        let mut rng = fresh_rng();
        let secondary = rng.random();
        IdGenerator {
            primary,
            secondary,
            rng,
            reseeds: 0,
        }
    }

    pub fn next_ids(&mut self) -> (u32, u32) {
        self.primary = self.primary.wrapping_add(1);
        if self.primary == 0 {
            self.primary = 1;
            self.rng = fresh_rng();
            self.secondary = self.rng.random();
            self.reseeds += 1;
            debug!("Command id wrapped, secondary id reseeded");
        } else {
            self.secondary = self.secondary.wrapping_add(1);
        }
        (self.primary, self.secondary)
    }

    pub fn reseeds(&self) -> u64 {
        self.reseeds
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorEntry {
    pub state: CommandState,
    pub result_code: i32,
}

/// What `fetch_result` hands out for one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub state: CommandState,
    pub result_code: i32,
    pub payload: [u8; RESULT_PAYLOAD_SIZE],
}

/// Primary and secondary id of one command. The secondary id tells apart commands that reuse
/// a primary id after a wrap.
pub type CommandKey = (u32, u32);

/// Outcomes of finished commands waiting to be fetched.
///
/// Result payloads and the error-command set are kept apart: absence from the error set means
/// the command completed with result code 0. An outcome is handed out at most once. The oldest
/// outcomes are dropped once more than `capacity` are retained.
#[derive(Debug)]
pub struct FinishedCommands {
    payloads: HashMap<CommandKey, [u8; RESULT_PAYLOAD_SIZE]>,
    errors: HashMap<CommandKey, ErrorEntry>,
    order: VecDeque<CommandKey>,
    capacity: usize,
}

impl FinishedCommands {
    pub fn new(capacity: usize) -> FinishedCommands {
        FinishedCommands {
            payloads: HashMap::new(),
            errors: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, record: &CommandRecord) {
        let key = (record.primary_id, record.secondary_id);
        self.payloads.insert(key, record.result_payload);
        if record.state != CommandState::Completed || record.result_code != 0 {
            self.errors.insert(
                key,
                ErrorEntry {
                    state: record.state,
                    result_code: record.result_code,
                },
            );
        } else {
            self.errors.remove(&key);
        }
        self.order.push_back(key);
        self.evict();
    }

    fn evict(&mut self) {
        while self.payloads.len() > self.capacity {
            let Some(key) = self.order.pop_front() else {
                break;
            };
            if self.payloads.remove(&key).is_some() {
                debug!("Dropping unfetched result of command {}", key.0);
            }
            self.errors.remove(&key);
        }
        if self.order.len() > self.capacity * 2 {
            let payloads = &self.payloads;
            self.order.retain(|key| payloads.contains_key(key));
        }
    }

    /// Whether an outcome is stored for the command and not fetched yet.
    pub fn contains(&self, key: CommandKey) -> bool {
        self.payloads.contains_key(&key)
    }

    pub fn is_error(&self, key: CommandKey) -> bool {
        self.errors.contains_key(&key)
    }

    /// Take the outcome of a finished command. `None` when it was already taken or dropped.
    pub fn take(&mut self, key: CommandKey) -> Option<Outcome> {
        let payload = self.payloads.remove(&key)?;
        let outcome = match self.errors.remove(&key) {
            Some(entry) => Outcome {
                state: entry.state,
                result_code: entry.result_code,
                payload,
            },
            None => Outcome {
                state: CommandState::Completed,
                result_code: 0,
                payload,
            },
        };
        Some(outcome)
    }

    pub fn retained(&self) -> usize {
        self.payloads.len()
    }
}
