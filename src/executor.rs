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

//! Simulated Controller
//!
//! An in-process stand-in for the embedded controller on the other side of the rings. The
//! [`Executor`] thread consumes submissions, hands each record to a [`CommandHandler`] and
//! produces whatever completion the handler returns. [`ControllerHandler`] implements the
//! opcode table of a small device: compute unit configuration and starts, clocks, sensors,
//! identify and log pages. Tests plug in their own closures to hold back or fail commands.

use crate::error::XgqError;
use crate::region::{SharedRegion, WORD_SIZE, write_bytes};
use crate::ring::{ControllerQueue, Doorbell};
use crate::session::MAX_CUS;
use crate::wire::{
    ClockRequestKind, CqEntry, IdentifyResponse, LogPid, MAX_CLOCK_FREQS, Opcode, QueryCuKind,
    QueryCuResponse, RESULT_PAYLOAD_SIZE, SQ_HEADER_WORDS, SqEntry,
};
use crate::worker::{StopSignal, Worker};
use log::{debug, trace, warn};
use std::sync::Arc;
use std::time::Duration;

pub const ENOENT: i32 = -2;
pub const ENODEV: i32 = -19;
pub const EINVAL: i32 = -22;
pub const ENOTTY: i32 = -25;

/// The completion a handler wants produced for one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub rcode: i32,
    pub payload: [u8; RESULT_PAYLOAD_SIZE],
}

impl Response {
    pub fn ok(payload: [u8; RESULT_PAYLOAD_SIZE]) -> Response {
        Response { rcode: 0, payload }
    }

    pub fn error(rcode: i32) -> Response {
        Response {
            rcode,
            payload: [0; RESULT_PAYLOAD_SIZE],
        }
    }

    fn from_words(words: &[u32]) -> Response {
        let mut payload = [0u8; RESULT_PAYLOAD_SIZE];
        for (chunk, word) in payload.chunks_exact_mut(WORD_SIZE).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Response::ok(payload)
    }
}

/// Runs one submission. Returning `None` leaves the command without a completion, the way a
/// stuck compute unit would.
pub trait CommandHandler: Send {
    fn handle(&mut self, entry: &SqEntry) -> Option<Response>;
}

impl<F> CommandHandler for F
where
    F: FnMut(&SqEntry) -> Option<Response> + Send,
{
    fn handle(&mut self, entry: &SqEntry) -> Option<Response> {
        self(entry)
    }
}

/// Consumes the submission ring of a [`ControllerQueue`] on its own thread.
#[derive(Debug)]
pub struct Executor {
    worker: Worker,
    bell: Arc<dyn Doorbell>,
}

impl Executor {
    /// Start serving `queue` with `handler`.
    ///
    /// `interval` bounds how long the thread sleeps between looks at the submission ring when
    /// nobody rings it.
    pub fn spawn<H>(
        queue: ControllerQueue,
        handler: H,
        interval: Duration,
    ) -> Result<Executor, XgqError>
    where
        H: CommandHandler + 'static,
    {
        let bell = Arc::clone(&queue.bell);
        let worker = Worker::spawn("xgq-controller", move |stop| {
            serve(queue, handler, &stop, interval)
        })?;
        Ok(Executor { worker, bell })
    }

    /// Stop the thread and wait for it. Submissions still in the ring are left there.
    pub fn stop(&mut self) {
        self.worker.signal_stop();
        self.bell.ring();
        self.worker.join();
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve<H: CommandHandler>(
    mut queue: ControllerQueue,
    mut handler: H,
    stop: &StopSignal,
    interval: Duration,
) {
    let slot_words = queue.sq.slot_words();
    let mut record = vec![0u32; slot_words];
    while !stop.is_stopped() {
        while let Some(slot) = queue.sq.consume() {
            queue.sq.read_slot(slot, &mut record[..SQ_HEADER_WORDS]);
            let len =
                (SQ_HEADER_WORDS + SqEntry::payload_len(record[0]) / WORD_SIZE).min(slot_words);
            queue.sq.take_slot(slot, &mut record[..len]);
            queue.sq.notify_consumed();
            let entry = match SqEntry::decode(&record[..len]) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Controller dropped a submission: {e}");
                    continue;
                }
            };
            trace!("Controller got opcode {:#x} for cid {}", entry.opcode, entry.cid);
            let Some(response) = handler.handle(&entry) else {
                debug!("Controller holds back the completion of cid {}", entry.cid);
                continue;
            };
            let completion = CqEntry {
                cid: entry.cid,
                tag: entry.tag,
                rcode: response.rcode,
                payload: response.payload,
            };
            let cq_slot = loop {
                if let Some(cq_slot) = queue.cq.produce() {
                    break Some(cq_slot);
                }
                if stop.is_stopped() {
                    break None;
                }
                queue.bell.wait(interval);
            };
            let Some(cq_slot) = cq_slot else {
                return;
            };
            if let Err(e) = queue.cq.write_slot(cq_slot, &completion.encode()) {
                warn!("Controller dropped the completion of cid {}: {e}", entry.cid);
                continue;
            }
            queue.cq.notify_produced();
        }
        queue.bell.wait(interval);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct CuConfig {
    base_address: u64,
    map_size: u32,
}

/// Opcode table of the simulated device.
#[derive(Debug)]
pub struct ControllerHandler {
    version: IdentifyResponse,
    cus: Vec<Option<CuConfig>>,
    starts: Vec<u32>,
    configuring: bool,
    clocks: [u16; MAX_CLOCK_FREQS],
    log_region: Option<Arc<dyn SharedRegion>>,
    firmware_log: Vec<u8>,
    firewall_log: Vec<u8>,
}

impl ControllerHandler {
    /// A controller with `num_cus` compute units that accept starts before any configuration.
    pub fn new(num_cus: usize) -> ControllerHandler {
        let num_cus = num_cus.min(MAX_CUS);
        ControllerHandler {
            version: IdentifyResponse { major: 1, minor: 0 },
            cus: vec![None; num_cus],
            starts: vec![0; num_cus],
            configuring: false,
            clocks: [300, 500, 0, 0],
            log_region: None,
            firmware_log: Vec::new(),
            firewall_log: Vec::new(),
        }
    }

    /// Serve log page requests from `firmware_log`, copying into `region`.
    pub fn with_log_region(
        mut self,
        region: Arc<dyn SharedRegion>,
        firmware_log: Vec<u8>,
    ) -> ControllerHandler {
        self.log_region = Some(region);
        self.firmware_log = firmware_log;
        self
    }

    pub fn with_firewall_log(mut self, firewall_log: Vec<u8>) -> ControllerHandler {
        self.firewall_log = firewall_log;
        self
    }

    /// Starts the compute unit has run so far.
    pub fn starts(&self, cu_index: usize) -> Option<u32> {
        self.starts.get(cu_index).copied()
    }

    fn start_cu(&mut self, entry: &SqEntry) -> Response {
        let Some(starts) = self.starts.get_mut(entry.cu_index as usize) else {
            return Response::error(EINVAL);
        };
        *starts = starts.wrapping_add(1);
        // checksum of the register map, so callers can tell their own payload came back
        let checksum = entry
            .payload
            .iter()
            .fold(0u32, |sum, word| sum.wrapping_add(*word));
        Response::from_words(&[checksum, entry.payload.len() as u32])
    }

    fn config_start(&mut self, entry: &SqEntry) -> Response {
        let num_cus = entry.payload.first().copied().unwrap_or(0) as usize;
        if num_cus == 0 || num_cus > MAX_CUS {
            return Response::error(EINVAL);
        }
        self.cus = vec![None; num_cus];
        self.starts = vec![0; num_cus];
        self.configuring = true;
        Response::ok([0; RESULT_PAYLOAD_SIZE])
    }

    fn config_cu(&mut self, entry: &SqEntry) -> Response {
        let [cu_index, base_lo, base_hi, map_size] = entry.payload[..] else {
            return Response::error(EINVAL);
        };
        if !self.configuring {
            return Response::error(EINVAL);
        }
        let Some(cu) = self.cus.get_mut(cu_index as usize) else {
            return Response::error(EINVAL);
        };
        *cu = Some(CuConfig {
            base_address: u64::from(base_lo) | (u64::from(base_hi) << 32),
            map_size,
        });
        Response::ok([0; RESULT_PAYLOAD_SIZE])
    }

    fn query_cu(&self, entry: &SqEntry) -> Response {
        let [cu_index, kind] = entry.payload[..] else {
            return Response::error(EINVAL);
        };
        let index = cu_index as usize;
        if index >= self.cus.len() {
            return Response::error(EINVAL);
        }
        let reply = if kind == QueryCuKind::Config as u32 {
            let Some(config) = self.cus[index] else {
                return Response::error(ENOENT);
            };
            QueryCuResponse {
                value: config.map_size,
                base_address: config.base_address,
            }
        } else if kind == QueryCuKind::Status as u32 {
            QueryCuResponse {
                value: self.starts[index],
                base_address: 0,
            }
        } else {
            return Response::error(EINVAL);
        };
        Response::ok(reply.to_payload())
    }

    fn clock(&mut self, entry: &SqEntry) -> Response {
        let Some(header) = entry.payload.first() else {
            return Response::error(EINVAL);
        };
        let kind = (header >> 8) & 0xff;
        let count = ((header >> 16) & 0xff) as usize;
        if count > MAX_CLOCK_FREQS || entry.payload.len() < 1 + count {
            return Response::error(EINVAL);
        }
        if kind == ClockRequestKind::Scale as u32 {
            for (clock, freq) in self.clocks.iter_mut().zip(&entry.payload[1..=count]) {
                *clock = *freq as u16;
            }
        } else if kind != ClockRequestKind::Get as u32 {
            return Response::error(EINVAL);
        }
        let words: Vec<u32> = self.clocks.iter().map(|f| u32::from(*f)).collect();
        Response::from_words(&words)
    }

    fn sensor(entry: &SqEntry) -> Response {
        let Some(header) = entry.payload.first() else {
            return Response::error(EINVAL);
        };
        let sensor_id = (header >> 8) & 0xff;
        // millidegrees, one per sensor so callers can tell them apart
        Response::from_words(&[42_000 + sensor_id])
    }

    fn log_page(&self, entry: &SqEntry) -> Response {
        let [pid, address, size, offset] = entry.payload[..] else {
            return Response::error(EINVAL);
        };
        let Some(region) = &self.log_region else {
            return Response::error(ENODEV);
        };
        let log = if pid == LogPid::Firmware as u32 {
            &self.firmware_log
        } else if pid == LogPid::AxiFirewall as u32 {
            &self.firewall_log
        } else {
            return Response::error(EINVAL);
        };
        let (address, size, offset) = (address as usize, size as usize, offset as usize);
        if address % WORD_SIZE != 0 || address + size > region.size() {
            return Response::error(EINVAL);
        }
        let tail = log.get(offset..).unwrap_or_default();
        let count = tail.len().min(size);
        write_bytes(region.as_ref(), address, &tail[..count]);
        Response::from_words(&[count as u32])
    }
}

impl Default for ControllerHandler {
    fn default() -> ControllerHandler {
        ControllerHandler::new(MAX_CUS)
    }
}

impl CommandHandler for ControllerHandler {
    fn handle(&mut self, entry: &SqEntry) -> Option<Response> {
        let response = match entry.opcode() {
            Some(Opcode::StartCu) => self.start_cu(entry),
            Some(Opcode::ConfigStart) => self.config_start(entry),
            Some(Opcode::ConfigCu) => self.config_cu(entry),
            Some(Opcode::ConfigEnd) => {
                self.configuring = false;
                Response::ok([0; RESULT_PAYLOAD_SIZE])
            }
            Some(Opcode::QueryCu) => self.query_cu(entry),
            Some(Opcode::Identify) => Response::ok(self.version.to_payload()),
            Some(Opcode::Clock) => self.clock(entry),
            Some(Opcode::Sensor) => ControllerHandler::sensor(entry),
            Some(Opcode::GetLogPage) => self.log_page(entry),
            None => {
                warn!("Controller does not know opcode {:#x}", entry.opcode);
                Response::error(ENOTTY)
            }
        };
        Some(response)
    }
}
