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

//! Command record wire format.
//!
//! A submission record is a 16 byte header followed by an opcode specific payload. Every field
//! is a little endian 32-bit word. Completion records are a fixed 32 bytes.
//!
//! ```text
//! submission   w0  NEW(31) | count in bytes(30..16) | opcode(15..0)
//!              w1  cid (primary id)
//!              w2  tag (secondary id)
//!              w3  compute unit index
//!              w4.. payload, at most MAX_PAYLOAD_SIZE bytes
//!
//! completion   w0  NEW(31) | state(7..0)
//!              w1  cid
//!              w2  tag
//!              w3  result code (i32)
//!              w4..w7 opaque result payload
//! ```

use crate::error::XgqError;
use crate::region::WORD_SIZE;

pub const SLOT_SIZE: usize = 4096;
/// Largest payload a controller accepts behind the header of one 4 KiB slot.
pub const MAX_PAYLOAD_SIZE: usize = 4032;
pub const SQ_HEADER_SIZE: usize = 16;
pub const SQ_HEADER_WORDS: usize = SQ_HEADER_SIZE / WORD_SIZE;
pub const CQ_ENTRY_SIZE: usize = 32;
pub const CQ_ENTRY_WORDS: usize = CQ_ENTRY_SIZE / WORD_SIZE;
pub const RESULT_PAYLOAD_SIZE: usize = 16;
/// Highest number of clock outputs a single scaling request may carry.
pub const MAX_CLOCK_FREQS: usize = 4;

const ENTRY_NEW: u32 = 1 << 31;
const COUNT_SHIFT: u32 = 16;
const COUNT_MASK: u32 = 0x7fff;
const OPCODE_MASK: u32 = 0xffff;
const CQ_STATE_COMPLETED: u32 = 0x4;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    StartCu = 0x0000,
    ConfigStart = 0x0001,
    ConfigEnd = 0x0002,
    ConfigCu = 0x0003,
    QueryCu = 0x0004,
    Identify = 0x0005,
    Clock = 0x0101,
    Sensor = 0x0102,
    GetLogPage = 0x0103,
}

impl TryFrom<u16> for Opcode {
    type Error = XgqError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0000 => Ok(Opcode::StartCu),
            0x0001 => Ok(Opcode::ConfigStart),
            0x0002 => Ok(Opcode::ConfigEnd),
            0x0003 => Ok(Opcode::ConfigCu),
            0x0004 => Ok(Opcode::QueryCu),
            0x0005 => Ok(Opcode::Identify),
            0x0101 => Ok(Opcode::Clock),
            0x0102 => Ok(Opcode::Sensor),
            0x0103 => Ok(Opcode::GetLogPage),
            _ => Err(XgqError::InvalidArgument(format!(
                "unknown opcode {value:#06x}"
            ))),
        }
    }
}

/// One submission record as the controller sees it.
///
/// `opcode` is kept raw so that a controller can answer records it does not understand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqEntry {
    pub opcode: u16,
    pub cid: u32,
    pub tag: u32,
    pub cu_index: u32,
    pub payload: Vec<u32>,
}

impl SqEntry {
    pub fn new(opcode: Opcode, cid: u32, tag: u32, cu_index: u32, payload: Vec<u32>) -> SqEntry {
        SqEntry {
            opcode: opcode as u16,
            cid,
            tag,
            cu_index,
            payload,
        }
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::try_from(self.opcode).ok()
    }

    pub fn len_words(&self) -> usize {
        SQ_HEADER_WORDS + self.payload.len()
    }

    /// Encode into `buf` and return the number of words used.
    pub fn encode_into(&self, buf: &mut [u32]) -> Result<usize, XgqError> {
        let len = self.len_words();
        if len > buf.len() {
            return Err(XgqError::InvalidArgument(format!(
                "record of {len} words does not fit a slot of {} words",
                buf.len()
            )));
        }
        let count = (self.payload.len() * WORD_SIZE) as u32;
        buf[0] = ENTRY_NEW | ((count & COUNT_MASK) << COUNT_SHIFT) | u32::from(self.opcode);
        buf[1] = self.cid;
        buf[2] = self.tag;
        buf[3] = self.cu_index;
        buf[SQ_HEADER_WORDS..len].copy_from_slice(&self.payload);
        Ok(len)
    }

    /// Number of payload bytes announced by the first header word.
    pub fn payload_len(word0: u32) -> usize {
        ((word0 >> COUNT_SHIFT) & COUNT_MASK) as usize
    }

    pub fn decode(words: &[u32]) -> Result<SqEntry, XgqError> {
        if words.len() < SQ_HEADER_WORDS {
            return Err(XgqError::Device(format!(
                "truncated submission header of {} words",
                words.len()
            )));
        }
        if words[0] & ENTRY_NEW == 0 {
            return Err(XgqError::Device(
                "submission slot does not hold a new record".to_string(),
            ));
        }
        let count = SqEntry::payload_len(words[0]);
        if count % WORD_SIZE != 0 || SQ_HEADER_WORDS + count / WORD_SIZE > words.len() {
            return Err(XgqError::Device(format!(
                "submission payload of {count} bytes does not fit the record"
            )));
        }
        Ok(SqEntry {
            opcode: (words[0] & OPCODE_MASK) as u16,
            cid: words[1],
            tag: words[2],
            cu_index: words[3],
            payload: words[SQ_HEADER_WORDS..SQ_HEADER_WORDS + count / WORD_SIZE].to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CqEntry {
    pub cid: u32,
    pub tag: u32,
    pub rcode: i32,
    pub payload: [u8; RESULT_PAYLOAD_SIZE],
}

impl CqEntry {
    pub fn encode(&self) -> [u32; CQ_ENTRY_WORDS] {
        let mut words = [0u32; CQ_ENTRY_WORDS];
        words[0] = ENTRY_NEW | CQ_STATE_COMPLETED;
        words[1] = self.cid;
        words[2] = self.tag;
        words[3] = self.rcode as u32;
        for (word, chunk) in words[4..]
            .iter_mut()
            .zip(self.payload.chunks_exact(WORD_SIZE))
        {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        words
    }

    pub fn decode(words: &[u32; CQ_ENTRY_WORDS]) -> Result<CqEntry, XgqError> {
        if words[0] & ENTRY_NEW == 0 {
            return Err(XgqError::Device(format!(
                "stale completion record for cid {}",
                words[1]
            )));
        }
        let mut payload = [0u8; RESULT_PAYLOAD_SIZE];
        for (chunk, word) in payload.chunks_exact_mut(WORD_SIZE).zip(&words[4..]) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Ok(CqEntry {
            cid: words[1],
            tag: words[2],
            rcode: words[3] as i32,
            payload,
        })
    }
}

/// Pack a word aligned byte payload into little endian words.
pub fn bytes_to_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(WORD_SIZE)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn result_word(payload: &[u8; RESULT_PAYLOAD_SIZE], index: usize) -> u32 {
    let at = index * WORD_SIZE;
    u32::from_le_bytes([
        payload[at],
        payload[at + 1],
        payload[at + 2],
        payload[at + 3],
    ])
}

/// A typed controller request that can be handed to
/// [`Coordinator::submit_request`](crate::coordinator::Coordinator::submit_request).
pub trait CommandRequest {
    fn opcode(&self) -> Opcode;
    fn encode(&self) -> Result<Vec<u8>, XgqError>;
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockRequestKind {
    Get = 0x1,
    Scale = 0x2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockRequest {
    pub region: u8,
    pub kind: ClockRequestKind,
    pub freqs_mhz: Vec<u16>,
}

impl CommandRequest for ClockRequest {
    fn opcode(&self) -> Opcode {
        Opcode::Clock
    }

    fn encode(&self) -> Result<Vec<u8>, XgqError> {
        if self.freqs_mhz.len() > MAX_CLOCK_FREQS {
            return Err(XgqError::InvalidArgument(format!(
                "clock request carries {} frequencies, at most {MAX_CLOCK_FREQS} are supported",
                self.freqs_mhz.len()
            )));
        }
        if self.kind == ClockRequestKind::Scale && self.freqs_mhz.is_empty() {
            return Err(XgqError::InvalidArgument(
                "clock scaling needs at least one frequency".to_string(),
            ));
        }
        let mut words = vec![
            u32::from(self.region)
                | ((self.kind as u32) << 8)
                | ((self.freqs_mhz.len() as u32) << 16),
        ];
        words.extend(self.freqs_mhz.iter().map(|f| u32::from(*f)));
        Ok(words_to_bytes(&words))
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPid {
    Firmware = 0x0,
    AxiFirewall = 0x1,
}

/// Ask the controller to copy one of its logs into the shared log page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPageRequest {
    pub pid: LogPid,
    pub address: u32,
    pub size: u32,
    pub offset: u32,
}

impl CommandRequest for LogPageRequest {
    fn opcode(&self) -> Opcode {
        Opcode::GetLogPage
    }

    fn encode(&self) -> Result<Vec<u8>, XgqError> {
        if self.size == 0 {
            return Err(XgqError::InvalidArgument(
                "log page request needs a non-empty destination".to_string(),
            ));
        }
        Ok(words_to_bytes(&[
            self.pid as u32,
            self.address,
            self.size,
            self.offset,
        ]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPageResponse {
    pub count: u32,
}

impl LogPageResponse {
    pub fn from_payload(payload: &[u8; RESULT_PAYLOAD_SIZE]) -> LogPageResponse {
        LogPageResponse {
            count: result_word(payload, 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorRequest {
    pub pid: u8,
    pub sensor_id: u8,
}

impl CommandRequest for SensorRequest {
    fn opcode(&self) -> Opcode {
        Opcode::Sensor
    }

    fn encode(&self) -> Result<Vec<u8>, XgqError> {
        Ok(words_to_bytes(&[
            u32::from(self.pid) | (u32::from(self.sensor_id) << 8)
        ]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorResponse {
    pub value: u32,
}

impl SensorResponse {
    pub fn from_payload(payload: &[u8; RESULT_PAYLOAD_SIZE]) -> SensorResponse {
        SensorResponse {
            value: result_word(payload, 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IdentifyRequest;

impl CommandRequest for IdentifyRequest {
    fn opcode(&self) -> Opcode {
        Opcode::Identify
    }

    fn encode(&self) -> Result<Vec<u8>, XgqError> {
        // the controller ignores the body but records are never empty
        Ok(words_to_bytes(&[0]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifyResponse {
    pub major: u16,
    pub minor: u16,
}

impl IdentifyResponse {
    pub fn from_payload(payload: &[u8; RESULT_PAYLOAD_SIZE]) -> IdentifyResponse {
        let word = result_word(payload, 0);
        IdentifyResponse {
            major: (word >> 16) as u16,
            minor: (word & 0xffff) as u16,
        }
    }

    pub fn to_payload(self) -> [u8; RESULT_PAYLOAD_SIZE] {
        let mut payload = [0u8; RESULT_PAYLOAD_SIZE];
        let word = (u32::from(self.major) << 16) | u32::from(self.minor);
        payload[..WORD_SIZE].copy_from_slice(&word.to_le_bytes());
        payload
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigStartRequest {
    pub num_cus: u32,
}

impl CommandRequest for ConfigStartRequest {
    fn opcode(&self) -> Opcode {
        Opcode::ConfigStart
    }

    fn encode(&self) -> Result<Vec<u8>, XgqError> {
        Ok(words_to_bytes(&[self.num_cus]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigEndRequest;

impl CommandRequest for ConfigEndRequest {
    fn opcode(&self) -> Opcode {
        Opcode::ConfigEnd
    }

    fn encode(&self) -> Result<Vec<u8>, XgqError> {
        Ok(words_to_bytes(&[0]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigCuRequest {
    pub cu_index: u32,
    pub base_address: u64,
    pub map_size: u32,
}

impl CommandRequest for ConfigCuRequest {
    fn opcode(&self) -> Opcode {
        Opcode::ConfigCu
    }

    fn encode(&self) -> Result<Vec<u8>, XgqError> {
        Ok(words_to_bytes(&[
            self.cu_index,
            self.base_address as u32,
            (self.base_address >> 32) as u32,
            self.map_size,
        ]))
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryCuKind {
    Config = 0x0,
    Status = 0x1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryCuRequest {
    pub cu_index: u32,
    pub kind: QueryCuKind,
}

impl CommandRequest for QueryCuRequest {
    fn opcode(&self) -> Opcode {
        Opcode::QueryCu
    }

    fn encode(&self) -> Result<Vec<u8>, XgqError> {
        Ok(words_to_bytes(&[self.cu_index, self.kind as u32]))
    }
}

/// Reply to a [`QueryCuRequest`]. Config queries return the map size and base address, status
/// queries return the number of starts the unit has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryCuResponse {
    pub value: u32,
    pub base_address: u64,
}

impl QueryCuResponse {
    pub fn from_payload(payload: &[u8; RESULT_PAYLOAD_SIZE]) -> QueryCuResponse {
        QueryCuResponse {
            value: result_word(payload, 0),
            base_address: u64::from(result_word(payload, 1))
                | (u64::from(result_word(payload, 2)) << 32),
        }
    }

    pub fn to_payload(self) -> [u8; RESULT_PAYLOAD_SIZE] {
        let mut payload = [0u8; RESULT_PAYLOAD_SIZE];
        let words = [
            self.value,
            self.base_address as u32,
            (self.base_address >> 32) as u32,
        ];
        for (chunk, word) in payload.chunks_exact_mut(WORD_SIZE).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        payload
    }
}
