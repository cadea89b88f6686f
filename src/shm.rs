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

//! Payload Partition
//!
//! Requests that move more than a result payload's worth of data, such as log retrieval, use an
//! auxiliary shared region next to the rings. It is split into a fixed log page followed by a
//! data transfer area. Each area is guarded by a binary semaphore so only one request at a time
//! hands its address to the controller.
//!
//! A log page request that times out may still be written by the controller later. The page
//! stays reserved for that request until it has finished or been drained by a reset.

use crate::coordinator::Coordinator;
use crate::error::XgqError;
use crate::region::{SharedRegion, WORD_SIZE, read_bytes, write_bytes};
use crate::session::CommandHandle;
use crate::wire::{LogPageRequest, LogPageResponse, LogPid};
use log::{debug, trace, warn};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Size of the log page at the start of the auxiliary region.
pub const LOG_PAGE_SIZE: usize = 64 * 1024;

#[derive(Debug, Default)]
struct Semaphore {
    taken: Mutex<bool>,
    released: Condvar,
}

impl Semaphore {
    fn acquire(&self, timeout: Duration) -> Result<bool, XgqError> {
        let taken = self
            .taken
            .lock()
            .map_err(|e| XgqError::Internal(format!("Failed when locking a partition: {e}")))?;
        let (mut taken, _) = self
            .released
            .wait_timeout_while(taken, timeout, |taken| *taken)
            .map_err(|e| XgqError::Internal(format!("Failed when waiting for a partition: {e}")))?;
        if *taken {
            return Ok(false);
        }
        *taken = true;
        Ok(true)
    }

    fn release(&self) {
        if let Ok(mut taken) = self.taken.lock() {
            *taken = false;
            self.released.notify_one();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionArea {
    LogPage,
    Data,
}

/// The auxiliary region split into its log page and data transfer area.
#[derive(Debug)]
pub struct PayloadPartition {
    region: Arc<dyn SharedRegion>,
    log_page: Semaphore,
    data: Semaphore,
    /// Log page request that was given up on while the controller still owned the page.
    unfinished_log_request: Mutex<Option<CommandHandle>>,
}

impl PayloadPartition {
    /// Split `region`, which must be larger than the log page.
    pub fn new(region: Arc<dyn SharedRegion>) -> Result<PayloadPartition, XgqError> {
        if region.size() <= LOG_PAGE_SIZE {
            return Err(XgqError::InvalidArgument(format!(
                "auxiliary region of {} bytes leaves no room after the {LOG_PAGE_SIZE} byte log page",
                region.size()
            )));
        }
        Ok(PayloadPartition {
            region,
            log_page: Semaphore::default(),
            data: Semaphore::default(),
            unfinished_log_request: Mutex::new(None),
        })
    }

    pub fn region(&self) -> &Arc<dyn SharedRegion> {
        &self.region
    }

    /// Take exclusive use of one area, waiting at most `timeout` for the current user.
    ///
    /// # Returns: `Result<PartitionGuard, XgqError>`
    /// * `Ok(PartitionGuard)` - The area is held until the guard is dropped
    /// * `Err(XgqError::TimedOut)` - Someone else kept the area for the whole timeout
    pub fn acquire(
        &self,
        area: PartitionArea,
        timeout: Duration,
    ) -> Result<PartitionGuard<'_>, XgqError> {
        let semaphore = match area {
            PartitionArea::LogPage => &self.log_page,
            PartitionArea::Data => &self.data,
        };
        if !semaphore.acquire(timeout)? {
            return Err(XgqError::TimedOut(format!(
                "{area:?} area of the payload partition is still in use"
            )));
        }
        trace!("Acquired {area:?} area");
        let (offset, size) = match area {
            PartitionArea::LogPage => (0, LOG_PAGE_SIZE),
            PartitionArea::Data => (LOG_PAGE_SIZE, self.region.size() - LOG_PAGE_SIZE),
        };
        Ok(PartitionGuard {
            partition: self,
            semaphore,
            area,
            offset,
            size,
        })
    }

    fn unfinished_log_request(&self) -> Result<MutexGuard<'_, Option<CommandHandle>>, XgqError> {
        self.unfinished_log_request
            .lock()
            .map_err(|e| XgqError::Internal(format!("Failed when locking the log page: {e}")))
    }

    /// Wait for a log page request given up on earlier, so its late write can not land in the
    /// page while it is handed out again.
    fn settle_log_page(
        &self,
        coordinator: &Coordinator,
        timeout: Duration,
    ) -> Result<(), XgqError> {
        let mut unfinished = self.unfinished_log_request()?;
        let Some(handle) = *unfinished else {
            return Ok(());
        };
        coordinator.wait_for(&[handle], timeout).map_err(|_| {
            XgqError::TimedOut(format!(
                "log page is still in use by unfinished command {}",
                handle.primary_id
            ))
        })?;
        if let Err(e) = coordinator.fetch_result(&[handle]) {
            debug!(
                "Result of abandoned log page command {} is gone: {e}",
                handle.primary_id
            );
        }
        *unfinished = None;
        Ok(())
    }
}

/// Exclusive use of one partition area. Released on drop.
#[derive(Debug)]
pub struct PartitionGuard<'a> {
    partition: &'a PayloadPartition,
    semaphore: &'a Semaphore,
    area: PartitionArea,
    offset: usize,
    size: usize,
}

impl PartitionGuard<'_> {
    /// Offset of the area within the auxiliary region, as handed to the controller.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn read(&self, len: usize) -> Result<Vec<u8>, XgqError> {
        if len > self.size {
            return Err(XgqError::InvalidArgument(format!(
                "can not read {len} bytes from the {} byte {:?} area",
                self.size, self.area
            )));
        }
        Ok(read_bytes(self.partition.region.as_ref(), self.offset, len))
    }

    pub fn write(&self, bytes: &[u8]) -> Result<(), XgqError> {
        if bytes.len().next_multiple_of(WORD_SIZE) > self.size {
            return Err(XgqError::InvalidArgument(format!(
                "can not write {} bytes into the {} byte {:?} area",
                bytes.len(),
                self.size,
                self.area
            )));
        }
        write_bytes(self.partition.region.as_ref(), self.offset, bytes);
        Ok(())
    }
}

impl Drop for PartitionGuard<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
        trace!("Released {:?} area", self.area);
    }
}

/// Copy the controller's firmware log out through the log page.
///
/// # Arguments
///
/// * `coordinator` - The channel the log page request is submitted on
/// * `partition` - The auxiliary region shared with the same controller
/// * `timeout` - Bounds the wait for the log page, the submit and the completion separately
///
/// # Returns: `Result<Vec<u8>, XgqError>`
/// * `Ok(Vec<u8>)` - The log bytes the controller reported
/// * `Err(XgqError::Device)` - The controller failed the request or reported an impossible size
/// * `Err(XgqError::TimedOut)` - The log page stayed busy or the request never finished
pub fn fetch_firmware_log(
    coordinator: &Coordinator,
    partition: &PayloadPartition,
    timeout: Duration,
) -> Result<Vec<u8>, XgqError> {
    let page = partition.acquire(PartitionArea::LogPage, timeout)?;
    partition.settle_log_page(coordinator, timeout)?;
    let request = LogPageRequest {
        pid: LogPid::Firmware,
        address: page.offset() as u32,
        size: page.size() as u32,
        offset: 0,
    };
    let started = Instant::now();
    let handle = coordinator.submit_request(&request, timeout)?;
    if let Err(e) = coordinator.wait_for(&[handle], timeout) {
        *partition.unfinished_log_request()? = Some(handle);
        warn!("Log page stays reserved until command {} finishes", handle.primary_id);
        return Err(e);
    }
    let fetched = coordinator.fetch_result(&[handle])?;
    let Some(result) = fetched.results.first() else {
        return Err(XgqError::Internal("no result for the log page request".to_string()));
    };
    if result.result_code != 0 {
        warn!("Log page request failed with result code {}", result.result_code);
        return Err(XgqError::Device(format!(
            "log page request failed with result code {}",
            result.result_code
        )));
    }
    let count = LogPageResponse::from_payload(&result.payload).count as usize;
    if count == 0 || count > page.size() {
        return Err(XgqError::Device(format!(
            "controller reported a log of {count} bytes for a {} byte page",
            page.size()
        )));
    }
    debug!(
        "Fetched {count} bytes of firmware log in {:?}",
        started.elapsed()
    );
    page.read(count)
}
