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

//! Submission and completion rings.
//!
//! Both rings of a channel live in one shared region laid out as
//!
//! ```text
//! 0x00                 ring header (magic, version, ring base, geometry of both rings)
//! ring base + 0x00     SQ produced counter
//! ring base + 0x04     SQ consumed counter
//! ring base + 0x08     CQ produced counter
//! ring base + 0x0c     CQ consumed counter
//! ring base + 0x40     SQ slots, then CQ slots
//! ```
//!
//! Each counter has exactly one writer. [`RingProducer`] owns "produced" and [`RingConsumer`]
//! owns "consumed"; neither type is `Clone`, so one side of a ring can only be driven from one
//! place at a time. Counters are free running `u32`s and slot counts are powers of two, so the
//! slot index stays continuous when a counter wraps.

use crate::error::XgqError;
use crate::region::{SharedRegion, WORD_SIZE, read_words};
use crate::wire::{CQ_ENTRY_SIZE, SQ_HEADER_SIZE};
use log::{debug, trace};
use std::fmt::Debug;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

pub const RING_MAGIC: u32 = 0x5847_5121;
pub const RING_VERSION: u32 = 0x0001_0000;
pub const RING_HEADER_SIZE: u32 = 0x40;
const RING_CTRL_SIZE: usize = 0x40;

const HDR_MAGIC: usize = 0x00;
const HDR_VERSION: usize = 0x04;
const HDR_RING_BASE: usize = 0x08;
const HDR_SQ_SLOT_NUM: usize = 0x0c;
const HDR_SQ_SLOT_SIZE: usize = 0x10;
const HDR_CQ_SLOT_NUM: usize = 0x14;
const HDR_CQ_SLOT_SIZE: usize = 0x18;

const SQ_PRODUCED: usize = 0x00;
const SQ_CONSUMED: usize = 0x04;
const CQ_PRODUCED: usize = 0x08;
const CQ_CONSUMED: usize = 0x0c;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    pub slot_num: u32,
    pub slot_size: u32,
}

impl RingGeometry {
    fn bytes(&self) -> usize {
        self.slot_num as usize * self.slot_size as usize
    }

    fn validate(&self, name: &str, min_slot_size: usize) -> Result<(), XgqError> {
        if self.slot_num == 0 || !self.slot_num.is_power_of_two() {
            return Err(XgqError::Device(format!(
                "{name} slot count {} is not a power of two",
                self.slot_num
            )));
        }
        let slot_size = self.slot_size as usize;
        if slot_size < min_slot_size || slot_size % WORD_SIZE != 0 {
            return Err(XgqError::Device(format!(
                "{name} slot size {slot_size} must be a multiple of {WORD_SIZE} and at least {min_slot_size}"
            )));
        }
        Ok(())
    }
}

/// The header the controller publishes at offset 0 of the ring region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingHeader {
    pub version: u32,
    pub ring_base: u32,
    pub sq: RingGeometry,
    pub cq: RingGeometry,
}

impl RingHeader {
    pub fn new(sq: RingGeometry, cq: RingGeometry) -> RingHeader {
        RingHeader {
            version: RING_VERSION,
            ring_base: RING_HEADER_SIZE,
            sq,
            cq,
        }
    }

    /// Bytes a region must provide to hold the header and both rings.
    pub fn region_size(&self) -> usize {
        self.ring_base as usize + RING_CTRL_SIZE + self.sq.bytes() + self.cq.bytes()
    }

    fn sq_slot_base(&self) -> usize {
        self.ring_base as usize + RING_CTRL_SIZE
    }

    fn cq_slot_base(&self) -> usize {
        self.sq_slot_base() + self.sq.bytes()
    }

    fn validate(&self, region_size: usize) -> Result<(), XgqError> {
        if self.version >> 16 != RING_VERSION >> 16 {
            return Err(XgqError::Device(format!(
                "unsupported ring version {:#x}, expected major {}",
                self.version,
                RING_VERSION >> 16
            )));
        }
        if (self.ring_base as usize) < RING_HEADER_SIZE as usize
            || self.ring_base as usize % WORD_SIZE != 0
        {
            return Err(XgqError::Device(format!(
                "ring base {:#x} overlaps the ring header",
                self.ring_base
            )));
        }
        self.sq.validate("submission ring", SQ_HEADER_SIZE)?;
        self.cq.validate("completion ring", CQ_ENTRY_SIZE)?;
        if self.region_size() > region_size {
            return Err(XgqError::Device(format!(
                "rings need {:#x} bytes but the shared region is only {region_size:#x}",
                self.region_size()
            )));
        }
        Ok(())
    }

    /// Lay the rings out in `region` and zero every counter. The magic word is published last.
    pub fn format(&self, region: &dyn SharedRegion) -> Result<(), XgqError> {
        self.validate(region.size())?;
        trace!("Formatting ring region: {self:?}");
        region.write32(HDR_VERSION, self.version);
        region.write32(HDR_RING_BASE, self.ring_base);
        region.write32(HDR_SQ_SLOT_NUM, self.sq.slot_num);
        region.write32(HDR_SQ_SLOT_SIZE, self.sq.slot_size);
        region.write32(HDR_CQ_SLOT_NUM, self.cq.slot_num);
        region.write32(HDR_CQ_SLOT_SIZE, self.cq.slot_size);
        let base = self.ring_base as usize;
        for counter in [SQ_PRODUCED, SQ_CONSUMED, CQ_PRODUCED, CQ_CONSUMED] {
            region.write32(base + counter, 0);
        }
        region.store_release32(HDR_MAGIC, RING_MAGIC);
        Ok(())
    }

    /// Read and validate the header. This is done once when a side attaches.
    pub fn read(region: &dyn SharedRegion) -> Result<RingHeader, XgqError> {
        let magic = region.load_acquire32(HDR_MAGIC);
        if magic != RING_MAGIC {
            return Err(XgqError::Device(format!(
                "ring region is not ready, magic is {magic:#x}"
            )));
        }
        let header = RingHeader {
            version: region.read32(HDR_VERSION),
            ring_base: region.read32(HDR_RING_BASE),
            sq: RingGeometry {
                slot_num: region.read32(HDR_SQ_SLOT_NUM),
                slot_size: region.read32(HDR_SQ_SLOT_SIZE),
            },
            cq: RingGeometry {
                slot_num: region.read32(HDR_CQ_SLOT_NUM),
                slot_size: region.read32(HDR_CQ_SLOT_SIZE),
            },
        };
        header.validate(region.size())?;
        debug!("Attached to ring region: {header:?}");
        Ok(header)
    }
}

/// Byte offset of one ring slot inside the shared region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAddr(usize);

impl SlotAddr {
    pub fn offset(self) -> usize {
        self.0
    }
}

/// How one side tells the other that a counter moved.
///
/// `wait` returns `true` when the bell was rung while waiting, or since the last wait.
pub trait Doorbell: Send + Sync + Debug {
    fn ring(&self);
    fn wait(&self, timeout: Duration) -> bool;
}

/// No interrupt line. Waiting is a short sleep and the caller re-checks the counters.
#[derive(Debug)]
pub struct PollingDoorbell {
    interval: Duration,
}

impl PollingDoorbell {
    pub fn new(interval: Duration) -> PollingDoorbell {
        PollingDoorbell { interval }
    }
}

impl Doorbell for PollingDoorbell {
    fn ring(&self) {}

    fn wait(&self, timeout: Duration) -> bool {
        std::thread::sleep(self.interval.min(timeout));
        false
    }
}

/// Interrupt style doorbell. A ring is latched until a waiter takes it.
#[derive(Debug, Default)]
pub struct InterruptDoorbell {
    pending: Mutex<bool>,
    raised: Condvar,
}

impl InterruptDoorbell {
    pub fn new() -> InterruptDoorbell {
        InterruptDoorbell::default()
    }
}

impl Doorbell for InterruptDoorbell {
    fn ring(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            *pending = true;
            self.raised.notify_all();
        }
    }

    fn wait(&self, timeout: Duration) -> bool {
        let Ok(pending) = self.pending.lock() else {
            return false;
        };
        match self.raised.wait_timeout_while(pending, timeout, |pending| !*pending) {
            Ok((mut pending, _)) => std::mem::take(&mut *pending),
            Err(_) => false,
        }
    }
}

/// The pair of doorbells of one channel.
#[derive(Debug, Clone)]
pub struct Doorbells {
    /// Rung by the host after producing a submission or consuming a completion.
    pub to_controller: Arc<dyn Doorbell>,
    /// Rung by the controller after producing a completion or consuming a submission.
    pub to_host: Arc<dyn Doorbell>,
}

impl Doorbells {
    pub fn polling(interval: Duration) -> Doorbells {
        Doorbells {
            to_controller: Arc::new(PollingDoorbell::new(interval)),
            to_host: Arc::new(PollingDoorbell::new(interval)),
        }
    }

    pub fn interrupt() -> Doorbells {
        Doorbells {
            to_controller: Arc::new(InterruptDoorbell::new()),
            to_host: Arc::new(InterruptDoorbell::new()),
        }
    }
}

#[derive(Debug)]
struct RingCore {
    region: Arc<dyn SharedRegion>,
    produced_off: usize,
    consumed_off: usize,
    slot_base: usize,
    geometry: RingGeometry,
    peer: Arc<dyn Doorbell>,
}

impl RingCore {
    fn new(
        region: &Arc<dyn SharedRegion>,
        header: &RingHeader,
        submission: bool,
        peer: &Arc<dyn Doorbell>,
    ) -> RingCore {
        let base = header.ring_base as usize;
        let (produced, consumed, slot_base, geometry) = if submission {
            (SQ_PRODUCED, SQ_CONSUMED, header.sq_slot_base(), header.sq)
        } else {
            (CQ_PRODUCED, CQ_CONSUMED, header.cq_slot_base(), header.cq)
        };
        RingCore {
            region: Arc::clone(region),
            produced_off: base + produced,
            consumed_off: base + consumed,
            slot_base,
            geometry,
            peer: Arc::clone(peer),
        }
    }

    fn slot_addr(&self, counter: u32) -> SlotAddr {
        let index = (counter & (self.geometry.slot_num - 1)) as usize;
        SlotAddr(self.slot_base + index * self.geometry.slot_size as usize)
    }

    fn slot_words(&self) -> usize {
        self.geometry.slot_size as usize / WORD_SIZE
    }
}

#[derive(Debug)]
pub struct RingProducer {
    core: RingCore,
    produced: u32,
}

impl RingProducer {
    fn new(core: RingCore) -> RingProducer {
        let produced = core.region.load_acquire32(core.produced_off);
        RingProducer { core, produced }
    }

    /// The next free slot, or `None` when the consumer has not caught up.
    pub fn produce(&mut self) -> Option<SlotAddr> {
        let consumed = self.core.region.load_acquire32(self.core.consumed_off);
        if self.produced.wrapping_sub(consumed) >= self.core.geometry.slot_num {
            trace!("Ring full at produced {}", self.produced);
            return None;
        }
        Some(self.core.slot_addr(self.produced))
    }

    /// Copy a record into `slot`. The first word is written last so a record whose first word
    /// reads as new is always complete.
    ///
    /// # Returns: `Result<(), XgqError>`
    /// * `Ok(())` - The record is in place, ready for [`RingProducer::notify_produced`]
    /// * `Err(XgqError::InvalidArgument)` - The record does not fit a slot. Nothing was written
    pub fn write_slot(&self, slot: SlotAddr, words: &[u32]) -> Result<(), XgqError> {
        if words.len() > self.core.slot_words() {
            return Err(XgqError::InvalidArgument(format!(
                "record of {} words overflows a slot of {}",
                words.len(),
                self.core.slot_words()
            )));
        }
        let region = self.core.region.as_ref();
        for (i, word) in words.iter().enumerate().skip(1) {
            region.write32(slot.0 + i * WORD_SIZE, *word);
        }
        if let Some(first) = words.first() {
            region.write32(slot.0, *first);
        }
        Ok(())
    }

    /// Publish every record written so far and ring the peer.
    pub fn notify_produced(&mut self) {
        self.produced = self.produced.wrapping_add(1);
        self.core
            .region
            .store_release32(self.core.produced_off, self.produced);
        self.core.peer.ring();
    }

    pub fn slot_words(&self) -> usize {
        self.core.slot_words()
    }

    pub fn slot_num(&self) -> u32 {
        self.core.geometry.slot_num
    }
}

#[derive(Debug)]
pub struct RingConsumer {
    core: RingCore,
    consumed: u32,
}

impl RingConsumer {
    fn new(core: RingCore) -> RingConsumer {
        let consumed = core.region.load_acquire32(core.consumed_off);
        RingConsumer { core, consumed }
    }

    /// The oldest unread slot, or `None` when nothing new was published.
    pub fn consume(&mut self) -> Option<SlotAddr> {
        let produced = self.core.region.load_acquire32(self.core.produced_off);
        if produced == self.consumed {
            return None;
        }
        Some(self.core.slot_addr(self.consumed))
    }

    pub fn read_slot(&self, slot: SlotAddr, out: &mut [u32]) {
        read_words(self.core.region.as_ref(), slot.0, out);
    }

    /// Copy a record out and clear its first word so it is never mistaken for a new one.
    pub fn take_slot(&self, slot: SlotAddr, out: &mut [u32]) {
        self.read_slot(slot, out);
        self.core.region.write32(slot.0, 0);
    }

    /// Hand the slot back to the producer and ring the peer.
    pub fn notify_consumed(&mut self) {
        self.consumed = self.consumed.wrapping_add(1);
        self.core
            .region
            .store_release32(self.core.consumed_off, self.consumed);
        self.core.peer.ring();
    }

    pub fn slot_words(&self) -> usize {
        self.core.slot_words()
    }

    pub fn slot_num(&self) -> u32 {
        self.core.geometry.slot_num
    }
}

/// The host end of a channel: produces submissions, consumes completions.
#[derive(Debug)]
pub struct HostQueue {
    pub sq: RingProducer,
    pub cq: RingConsumer,
    /// Rung by the controller.
    pub bell: Arc<dyn Doorbell>,
}

/// The controller end of a channel: consumes submissions, produces completions.
#[derive(Debug)]
pub struct ControllerQueue {
    pub sq: RingConsumer,
    pub cq: RingProducer,
    /// Rung by the host.
    pub bell: Arc<dyn Doorbell>,
}

pub fn attach_host(
    region: Arc<dyn SharedRegion>,
    bells: &Doorbells,
) -> Result<HostQueue, XgqError> {
    let header = RingHeader::read(region.as_ref())?;
    Ok(HostQueue {
        sq: RingProducer::new(RingCore::new(&region, &header, true, &bells.to_controller)),
        cq: RingConsumer::new(RingCore::new(&region, &header, false, &bells.to_controller)),
        bell: Arc::clone(&bells.to_host),
    })
}

pub fn attach_controller(
    region: Arc<dyn SharedRegion>,
    bells: &Doorbells,
) -> Result<ControllerQueue, XgqError> {
    let header = RingHeader::read(region.as_ref())?;
    Ok(ControllerQueue {
        sq: RingConsumer::new(RingCore::new(&region, &header, true, &bells.to_host)),
        cq: RingProducer::new(RingCore::new(&region, &header, false, &bells.to_host)),
        bell: Arc::clone(&bells.to_controller),
    })
}
