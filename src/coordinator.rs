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

//! Command Coordinator
//!
//! The coordinator is the only owner of a channel's slot pool, command registry and finished
//! command outcomes. It moves commands through `Submitted → {Completed, Errored, TimedOut}`:
//!
//! 1. [`Coordinator::submit`] validates the payload, acquires a slot, registers a fresh id and
//!    produces the record on the submission ring, all under one lock. Nobody can hold a handle
//!    whose registry entry is not visible yet.
//! 2. Completions are drained from the completion ring by the completion worker, by waiting
//!    callers, or by [`Coordinator::process_completions`]. Each one removes its record from the
//!    registry, releases the slot and stores the outcome.
//! 3. [`Coordinator::poll`] and [`Coordinator::await_any`] wait for commands in one of the
//!    [`WaitStrategy`](crate::waiter::WaitStrategy) ways. [`Coordinator::fetch_result`] hands
//!    out the outcome.
//!
//! There is no cancellation. A wedged command is only ever recovered by [`Coordinator::reset`],
//! or by the health monitor halting the channel and draining it.
//!
//! # Examples
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # use xgq::config::CoordinatorConfig;
//! # use xgq::coordinator::Coordinator;
//! # use xgq::region::HeapRegion;
//! # use xgq::ring::attach_host;
//! # use xgq::session::{ComputeUnit, DeviceContext, Session, SessionKind};
//! # fn example() -> Result<(), xgq::error::XgqError> {
//! let config = CoordinatorConfig::default();
//! let header = config.ring_header();
//! let region = HeapRegion::new(header.region_size());
//! header.format(region.as_ref())?;
//! let bells = config.doorbells();
//! let device = Arc::new(DeviceContext::new(
//!     0,
//!     vec![ComputeUnit { name: "kernel_0".into(), regmap_size: 256 }],
//! )?);
//! let session = Session::new(&device, SessionKind::Kernel, 0, 0)?;
//! let coordinator = Coordinator::attach(device, session, attach_host(region, &bells)?, config)?;
//!
//! let handle = coordinator.submit(&[0u8; 64], None, Duration::from_secs(1))?;
//! coordinator.poll(&[handle], true)?;
//! let fetched = coordinator.fetch_result(&[handle])?;
//! println!("errors: {}", fetched.error_count);
//! # Ok(())
//! # }
//! ```

use crate::config::CoordinatorConfig;
use crate::error::XgqError;
use crate::region::WORD_SIZE;
use crate::registry::{
    CommandRecord, CommandRegistry, CommandState, ETIME_RESULT, FinishedCommands,
};
use crate::ring::{Doorbell, HostQueue, RingConsumer, RingProducer};
use crate::session::{CommandHandle, DeviceContext, INVALID_CU_INDEX, Session};
use crate::slot_pool::SlotPool;
use crate::waiter;
use crate::wire::{
    CQ_ENTRY_WORDS, CommandRequest, CqEntry, MAX_PAYLOAD_SIZE, Opcode, RESULT_PAYLOAD_SIZE,
    SQ_HEADER_SIZE, SqEntry, bytes_to_words,
};
use crate::worker::{self, Worker};
use log::{debug, error, info, trace, warn};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

const OUTSTANDING_WAIT_SLICE: Duration = Duration::from_millis(1);
const SLOT_WAIT_SLICE: Duration = Duration::from_millis(10);
/// Completions waiting for `await_any` beyond this many suggest the caller is falling behind.
const COMPLETION_BACKLOG_WARN: u32 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitApi {
    Poll,
    AwaitAny,
}

impl fmt::Display for WaitApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitApi::Poll => write!(f, "poll"),
            WaitApi::AwaitAny => write!(f, "await_any"),
        }
    }
}

/// Everything guarded by the coordinator lock.
#[derive(Debug)]
pub(crate) struct DeviceState {
    pool: SlotPool,
    registry: CommandRegistry,
    finished: FinishedCommands,
    sq: RingProducer,
    completed_count: u32,
    halted: bool,
    wait_api: Option<WaitApi>,
}

impl DeviceState {
    /// Release the slot of a record already taken out of the registry and keep its outcome.
    fn finish(&mut self, record: CommandRecord) {
        self.pool.release(record.assigned_slot);
        self.finished.record(&record);
        self.completed_count = self.completed_count.saturating_add(1);
    }

    /// Every held slot belongs to exactly one outstanding command.
    fn check_conservation(&self) {
        debug_assert_eq!(self.pool.in_use(), self.registry.len());
    }
}

#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) session: Session,
    pub(crate) config: CoordinatorConfig,
    pub(crate) host_bell: Arc<dyn Doorbell>,
    pub(crate) work_item_done: Condvar,
    device: Arc<DeviceContext>,
    state: Mutex<DeviceState>,
    slot_freed: Condvar,
    done_or_free: Condvar,
    completions: Mutex<RingConsumer>,
    max_payload: usize,
}

impl Shared {
    pub(crate) fn lock_state(&self) -> Result<MutexGuard<'_, DeviceState>, XgqError> {
        self.state.lock().map_err(|e| {
            XgqError::Internal(format!(
                "{}. Failed when locking coordinator state: {e}",
                self.session
            ))
        })
    }

    fn wake_all(&self) {
        self.slot_freed.notify_all();
        self.done_or_free.notify_all();
        self.work_item_done.notify_all();
    }

    /// Drain the completion ring, waiting for whoever else is draining it.
    pub(crate) fn drain_completions(&self) -> Result<usize, XgqError> {
        let mut cq = self.completions.lock().map_err(|e| {
            XgqError::Internal(format!("Failed when locking the completion ring: {e}"))
        })?;
        self.drain_ring(&mut cq)
    }

    /// Drain the completion ring unless somebody else is already doing it.
    pub(crate) fn try_drain_completions(&self) -> Result<usize, XgqError> {
        let mut cq = match self.completions.try_lock() {
            Ok(cq) => cq,
            Err(TryLockError::WouldBlock) => return Ok(0),
            Err(TryLockError::Poisoned(e)) => {
                return Err(XgqError::Internal(format!(
                    "Failed when locking the completion ring: {e}"
                )));
            }
        };
        self.drain_ring(&mut cq)
    }

    fn drain_ring(&self, cq: &mut RingConsumer) -> Result<usize, XgqError> {
        let mut words = [0u32; CQ_ENTRY_WORDS];
        let mut completed = 0;
        while let Some(slot) = cq.consume() {
            cq.take_slot(slot, &mut words);
            cq.notify_consumed();
            match CqEntry::decode(&words) {
                Ok(entry) => {
                    if self.complete(entry)? {
                        completed += 1;
                    }
                }
                Err(e) => warn!("{}. Dropping completion: {e}", self.session),
            }
        }
        Ok(completed)
    }

    /// Finish the command a completion refers to. Completions for commands that are no longer
    /// outstanding are ignored, so a command is never completed twice.
    fn complete(&self, entry: CqEntry) -> Result<bool, XgqError> {
        let mut state = self.lock_state()?;
        if !state.registry.is_outstanding(entry.cid, entry.tag) {
            warn!(
                "{}. Completion for unknown command id {} tag {:#x} ignored",
                self.session, entry.cid, entry.tag
            );
            return Ok(false);
        }
        let Some(mut record) = state.registry.remove(entry.cid) else {
            return Ok(false);
        };
        record.result_code = entry.rcode;
        record.result_payload = entry.payload;
        record.state = if entry.rcode == 0 {
            CommandState::Completed
        } else {
            debug!(
                "{}. Command {} finished with result code {}",
                self.session, record.primary_id, entry.rcode
            );
            CommandState::Errored
        };
        trace!("{}. Command {} finished", self.session, record.primary_id);
        state.finish(record);
        state.check_conservation();
        drop(state);
        self.wake_all();
        Ok(true)
    }

    pub(crate) fn has_expired(&self, now: Instant) -> Result<bool, XgqError> {
        Ok(self.lock_state()?.registry.has_expired(now))
    }

    /// Stop accepting submissions after a command blew its deadline.
    pub(crate) fn halt(&self) -> Result<(), XgqError> {
        let mut state = self.lock_state()?;
        if !state.halted {
            if let Some(record) = state.registry.first_expired(Instant::now()) {
                error!(
                    "{}. Command id {} opcode {:?} timed out, hot reset is required",
                    self.session, record.primary_id, record.opcode
                );
            }
            error!("{}. Halting the command queue", self.session);
        }
        state.halted = true;
        Ok(())
    }

    /// Drain expired commands as timed out. Returns how many were drained and how many remain.
    pub(crate) fn drain_expired(&self, now: Instant) -> Result<(usize, usize), XgqError> {
        let mut state = self.lock_state()?;
        let expired = state.registry.take_expired(now);
        let drained = expired.len();
        for mut record in expired {
            record.state = CommandState::TimedOut;
            record.result_code = ETIME_RESULT;
            state.finish(record);
        }
        state.check_conservation();
        let remaining = state.registry.len();
        drop(state);
        if drained > 0 {
            self.wake_all();
        }
        Ok((drained, remaining))
    }
}

/// Outcome of one fetched command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandResult {
    pub handle: CommandHandle,
    pub state: CommandState,
    pub result_code: i32,
    pub payload: [u8; RESULT_PAYLOAD_SIZE],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResults {
    pub results: Vec<CommandResult>,
    /// How many of `results` did not complete cleanly.
    pub error_count: usize,
}

#[derive(Debug)]
pub struct Coordinator {
    shared: Arc<Shared>,
    workers: Vec<Worker>,
}

impl Coordinator {
    /// Take over the host end of a channel on behalf of `session`.
    ///
    /// # Arguments
    ///
    /// * `device` - The device the session was opened on
    /// * `session` - The session every handle of this coordinator is bound to
    /// * `queue` - The host end of an attached channel
    /// * `config` - Pool, wait and background worker settings
    ///
    /// # Returns: `Result<Coordinator, XgqError>`
    /// * `Ok(Coordinator)` - Ready to submit, with its configured workers running
    /// * `Err(XgqError::InvalidArgument)` - Config is invalid, the session belongs to another
    ///   device, or the rings are smaller than the slot pool
    /// * `Err(XgqError::Internal)` - A worker thread could not be started
    pub fn attach(
        device: Arc<DeviceContext>,
        session: Session,
        queue: HostQueue,
        config: CoordinatorConfig,
    ) -> Result<Coordinator, XgqError> {
        config.validate()?;
        if session.device_index() != device.index() {
            return Err(XgqError::InvalidArgument(format!(
                "{session} belongs to device {}, not device {}",
                session.device_index(),
                device.index()
            )));
        }
        let HostQueue { sq, cq, bell } = queue;
        let ring_slots = sq.slot_num().min(cq.slot_num()) as usize;
        if config.slot_count > ring_slots {
            return Err(XgqError::InvalidArgument(format!(
                "slot_count {} exceeds the {ring_slots} slots of the attached rings",
                config.slot_count
            )));
        }
        let slot_words = sq.slot_words();
        let max_payload = MAX_PAYLOAD_SIZE.min(slot_words * WORD_SIZE - SQ_HEADER_SIZE);
        let state = DeviceState {
            pool: SlotPool::new(config.slot_count, slot_words, config.slot_policy)?,
            registry: CommandRegistry::default(),
            finished: FinishedCommands::new(config.max_retained_results),
            sq,
            completed_count: 0,
            halted: false,
            wait_api: None,
        };
        info!(
            "{session}. Attached with {} slots, {:?} slots, {:?} waits",
            config.slot_count, config.slot_policy, config.wait_strategy
        );
        let shared = Arc::new(Shared {
            session,
            config,
            host_bell: bell,
            work_item_done: Condvar::new(),
            device,
            state: Mutex::new(state),
            slot_freed: Condvar::new(),
            done_or_free: Condvar::new(),
            completions: Mutex::new(cq),
            max_payload,
        });
        let mut coordinator = Coordinator {
            shared: Arc::clone(&shared),
            workers: Vec::new(),
        };
        if shared.config.completion_worker {
            coordinator
                .workers
                .push(worker::spawn_completion_worker(Arc::clone(&shared))?);
        }
        if shared.config.health.enabled {
            coordinator
                .workers
                .push(worker::spawn_health_monitor(Arc::clone(&shared))?);
        }
        Ok(coordinator)
    }

    pub fn session(&self) -> &Session {
        &self.shared.session
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    /// Largest payload `submit` accepts on this channel.
    pub fn max_payload(&self) -> usize {
        self.shared.max_payload
    }

    /// Start a compute unit with `regmap` as its register map.
    ///
    /// Ordinary sessions always start their own unit and `target_unit` is ignored. Admin sessions
    /// must name the unit. `timeout` bounds both the wait for a free slot and the time the
    /// command may stay outstanding before the health monitor gives up on it.
    pub fn submit(
        &self,
        regmap: &[u8],
        target_unit: Option<u32>,
        timeout: Duration,
    ) -> Result<CommandHandle, XgqError> {
        self.submit_command(Opcode::StartCu, regmap, target_unit, timeout)
    }

    /// Submit a typed controller request.
    pub fn submit_request<R: CommandRequest + ?Sized>(
        &self,
        request: &R,
        timeout: Duration,
    ) -> Result<CommandHandle, XgqError> {
        let payload = request.encode()?;
        self.submit_command(request.opcode(), &payload, None, timeout)
    }

    pub fn submit_command(
        &self,
        opcode: Opcode,
        payload: &[u8],
        target_unit: Option<u32>,
        timeout: Duration,
    ) -> Result<CommandHandle, XgqError> {
        let shared = &self.shared;
        let session = &shared.session;
        self.validate_payload(payload)?;
        let cu_index = self.resolve_target(opcode, target_unit)?;
        if opcode == Opcode::StartCu {
            if let Some(unit) = shared.device.unit(cu_index) {
                if payload.len() > unit.regmap_size {
                    warn!(
                        "{session}. Payload of {} bytes exceeds the {} byte register map of {}",
                        payload.len(),
                        unit.regmap_size,
                        unit.name
                    );
                }
            }
        }
        let words = bytes_to_words(payload);
        let deadline = Instant::now() + timeout;

        let mut state = shared.lock_state()?;
        let mut attempts: u32 = 0;
        let slot = loop {
            if state.halted {
                return Err(XgqError::Device(format!(
                    "{session}. The command queue is halted, a reset is required"
                )));
            }
            if shared.config.single_outstanding && !state.registry.is_empty() {
                trace!("{session}. Waiting for the outstanding command to finish");
                state = self.wait_slice(
                    &shared.done_or_free,
                    state,
                    deadline,
                    OUTSTANDING_WAIT_SLICE,
                )?;
                continue;
            }
            if let Some(slot) = state.pool.acquire() {
                break slot;
            }
            if attempts >= shared.config.acquire_retries || Instant::now() >= deadline {
                warn!("{session}. No free slot after {attempts} attempts");
                return Err(XgqError::ResourceExhausted(format!(
                    "{session}. All {} slots are in use",
                    state.pool.capacity()
                )));
            }
            attempts += 1;
            debug!("{session}. No free slot, attempt {attempts}");
            state = self.wait_slice(&shared.slot_freed, state, deadline, SLOT_WAIT_SLICE)?;
        };

        let st = &mut *state;
        let (primary_id, secondary_id) = loop {
            let (primary_id, secondary_id) = match shared.device.next_ids() {
                Ok(ids) => ids,
                Err(e) => {
                    st.pool.release(slot);
                    return Err(e);
                }
            };
            let record =
                CommandRecord::new(primary_id, secondary_id, opcode, cu_index, slot, deadline);
            if st.registry.insert(record) {
                break (primary_id, secondary_id);
            }
            debug!("{session}. Command id {primary_id} is still outstanding, drawing another");
        };
        st.pool.bind(slot, primary_id);

        let entry = SqEntry::new(opcode, primary_id, secondary_id, cu_index, words);
        if let Err(e) = Coordinator::transmit(st, slot, &entry) {
            st.registry.remove(primary_id);
            st.pool.release(slot);
            drop(state);
            shared.wake_all();
            error!("{session}. Failed to submit command {primary_id}: {e}");
            return Err(e);
        }
        st.check_conservation();
        drop(state);
        trace!("{session}. Submitted command {primary_id} on slot {slot}");

        Ok(CommandHandle {
            primary_id,
            secondary_id,
            cu_index: cu_index as i32,
            signature: session.signature(),
        })
    }

    fn transmit(st: &mut DeviceState, slot: usize, entry: &SqEntry) -> Result<(), XgqError> {
        let staging = st
            .pool
            .staging_mut(slot)
            .ok_or_else(|| XgqError::Internal(format!("slot {slot} has no staging buffer")))?;
        let len = entry.encode_into(staging)?;
        let Some(addr) = st.sq.produce() else {
            return Err(XgqError::Device("the submission ring is full".to_string()));
        };
        st.sq.write_slot(addr, &staging[..len])?;
        st.sq.notify_produced();
        Ok(())
    }

    fn wait_slice<'a>(
        &self,
        condvar: &Condvar,
        state: MutexGuard<'a, DeviceState>,
        deadline: Instant,
        slice: Duration,
    ) -> Result<MutexGuard<'a, DeviceState>, XgqError> {
        let now = Instant::now();
        if now >= deadline {
            return Err(XgqError::TimedOut(format!(
                "{}. Gave up waiting to submit",
                self.shared.session
            )));
        }
        match condvar.wait_timeout(state, slice.min(deadline - now)) {
            Ok((state, _)) => Ok(state),
            Err(e) => Err(XgqError::Internal(format!(
                "{}. Failed when waiting on coordinator state: {e}",
                self.shared.session
            ))),
        }
    }

    fn validate_payload(&self, payload: &[u8]) -> Result<(), XgqError> {
        let session = &self.shared.session;
        let len = payload.len();
        if len == 0 {
            return Err(XgqError::InvalidArgument(format!(
                "{session}. Payload size of 0 is invalid"
            )));
        }
        if len > self.shared.max_payload {
            return Err(XgqError::InvalidArgument(format!(
                "{session}. Payload size of {len} exceeds the maximum of {} bytes",
                self.shared.max_payload
            )));
        }
        if len % WORD_SIZE != 0 {
            return Err(XgqError::InvalidArgument(format!(
                "{session}. Payload size of {len} is not a multiple of {WORD_SIZE} bytes"
            )));
        }
        Ok(())
    }

    fn resolve_target(&self, opcode: Opcode, target_unit: Option<u32>) -> Result<u32, XgqError> {
        let session = &self.shared.session;
        if !session.kind().is_admin() {
            if let Some(cu) = target_unit.filter(|cu| *cu != session.cu_index()) {
                info!(
                    "{session}. cu_index {cu} ignored, this session always targets cu {}",
                    session.cu_index()
                );
            }
            return Ok(session.cu_index());
        }
        let cu = match (opcode, target_unit) {
            (_, Some(cu)) => cu,
            (Opcode::StartCu, None) => {
                return Err(XgqError::InvalidArgument(format!(
                    "{session}. Admin sessions must name the cu_index of every CU start"
                )));
            }
            (_, None) => session.cu_index(),
        };
        if self.shared.device.unit(cu).is_none() {
            return Err(XgqError::InvalidArgument(format!(
                "{session}. Invalid cu_index {cu}, the device has {} compute units",
                self.shared.device.units().len()
            )));
        }
        Ok(cu)
    }

    fn validate_handles(&self, handles: &[CommandHandle]) -> Result<(), XgqError> {
        let session = &self.shared.session;
        if handles.is_empty() {
            return Err(XgqError::InvalidArgument(format!(
                "{session}. No command handles given"
            )));
        }
        for handle in handles {
            if handle.primary_id == 0 || handle.cu_index == INVALID_CU_INDEX {
                return Err(XgqError::InvalidHandle(format!(
                    "{session}. Command handle is invalid, the submit that returned it may have failed"
                )));
            }
            if handle.signature != session.signature() {
                return Err(XgqError::Corrupted(format!(
                    "{session}. Signature of command {} does not belong to this session",
                    handle.primary_id
                )));
            }
            if !session.kind().is_admin() && handle.cu_index != session.cu_index() as i32 {
                return Err(XgqError::Corrupted(format!(
                    "{session}. Command {} targets cu {} but the session owns cu {}",
                    handle.primary_id,
                    handle.cu_index,
                    session.cu_index()
                )));
            }
        }
        Ok(())
    }

    fn claim_wait_api(&self, api: WaitApi) -> Result<(), XgqError> {
        let mut state = self.shared.lock_state()?;
        match state.wait_api {
            None => {
                state.wait_api = Some(api);
                Ok(())
            }
            Some(current) if current == api => Ok(()),
            Some(current) => Err(XgqError::OperationNotPermitted(format!(
                "{}. {api} can not be used in a session that already uses {current}",
                self.shared.session
            ))),
        }
    }

    /// Report which of `handles` have finished. With `wait`, block until all of them have, for
    /// at most the configured wait timeout.
    pub fn poll(&self, handles: &[CommandHandle], wait: bool) -> Result<Vec<bool>, XgqError> {
        self.validate_handles(handles)?;
        self.claim_wait_api(WaitApi::Poll)?;
        self.shared.try_drain_completions()?;
        if wait {
            self.wait_for(handles, self.shared.config.wait_timeout)
                .inspect_err(|e| warn!("{e}"))?;
        }
        let state = self.shared.lock_state()?;
        Ok(handles
            .iter()
            .map(|h| !state.registry.is_outstanding(h.primary_id, h.secondary_id))
            .collect())
    }

    /// Wait until every handle has finished, without claiming a wait API for the session.
    pub(crate) fn wait_for(
        &self,
        handles: &[CommandHandle],
        timeout: Duration,
    ) -> Result<(), XgqError> {
        waiter::wait_until(
            &self.shared,
            self.shared.config.wait_strategy,
            Instant::now() + timeout,
            |state| {
                handles
                    .iter()
                    .all(|h| !state.registry.is_outstanding(h.primary_id, h.secondary_id))
            },
        )
    }

    /// Wait until any command of the session finishes, consuming that one completion.
    pub fn await_any(&self, timeout: Duration) -> Result<(), XgqError> {
        let session = &self.shared.session;
        if session.kind().is_admin() {
            return Err(XgqError::OperationNotPermitted(format!(
                "{session}. await_any is not allowed for admin sessions"
            )));
        }
        self.claim_wait_api(WaitApi::AwaitAny)?;
        let mut warned_idle = false;
        waiter::wait_until(
            &self.shared,
            self.shared.config.wait_strategy,
            Instant::now() + timeout,
            |state| {
                if state.completed_count > 0 {
                    if state.completed_count > COMPLETION_BACKLOG_WARN {
                        warn!(
                            "{session}. {} completions are waiting, the application may be too slow",
                            state.completed_count
                        );
                    }
                    state.completed_count -= 1;
                    return true;
                }
                if state.registry.is_empty() && !warned_idle {
                    warned_idle = true;
                    warn!("{session}. There may not be any outstanding command to wait for");
                }
                false
            },
        )
        .inspect_err(|e| warn!("{e}"))
    }

    /// Hand out the outcomes of finished commands. Each outcome is handed out once.
    ///
    /// Every handle is checked before anything is taken, so a bad handle leaves all outcomes in
    /// place.
    ///
    /// # Returns: `Result<FetchedResults, XgqError>`
    /// * `Ok(FetchedResults)` - One result per handle, in order, and the number of failures
    /// * `Err(XgqError::InvalidArgument)` - The same handle is given more than once
    /// * `Err(XgqError::InvalidHandle)` / `Err(XgqError::Corrupted)` - A handle is unusable, or
    ///   its outcome was already fetched or dropped
    /// * `Err(XgqError::OperationNotPermitted)` - A command has not finished yet
    pub fn fetch_result(&self, handles: &[CommandHandle]) -> Result<FetchedResults, XgqError> {
        let session = &self.shared.session;
        self.validate_handles(handles)?;
        let mut seen = HashSet::with_capacity(handles.len());
        if let Some(duplicate) = handles.iter().find(|h| !seen.insert(h.key())) {
            return Err(XgqError::InvalidArgument(format!(
                "{session}. Command {} is given more than once",
                duplicate.primary_id
            )));
        }
        let mut state = self.shared.lock_state()?;
        if let Some(pending) = handles
            .iter()
            .find(|h| state.registry.is_outstanding(h.primary_id, h.secondary_id))
        {
            return Err(XgqError::OperationNotPermitted(format!(
                "{session}. Command {} has not finished, its result must be fetched only after it has",
                pending.primary_id
            )));
        }
        if let Some(gone) = handles.iter().find(|h| !state.finished.contains(h.key())) {
            return Err(XgqError::InvalidHandle(format!(
                "{session}. No result is held for command {}, it was already fetched or dropped",
                gone.primary_id
            )));
        }
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            let outcome = state.finished.take(handle.key()).ok_or_else(|| {
                XgqError::Internal(format!(
                    "{session}. Result of command {} vanished while fetching",
                    handle.primary_id
                ))
            })?;
            results.push(CommandResult {
                handle: *handle,
                state: outcome.state,
                result_code: outcome.result_code,
                payload: outcome.payload,
            });
        }
        let error_count = results
            .iter()
            .filter(|r| r.state != CommandState::Completed || r.result_code != 0)
            .count();
        Ok(FetchedResults {
            results,
            error_count,
        })
    }

    /// Drain the completion ring now. Returns how many commands finished.
    pub fn process_completions(&self) -> Result<usize, XgqError> {
        self.shared.drain_completions()
    }

    /// Forcibly finish every outstanding command as timed out and accept submissions again.
    pub fn reset(&self) -> Result<usize, XgqError> {
        let mut state = self.shared.lock_state()?;
        let outstanding = state.registry.drain();
        let drained = outstanding.len();
        for mut record in outstanding {
            record.state = CommandState::TimedOut;
            record.result_code = ETIME_RESULT;
            state.finish(record);
        }
        let stray = state.pool.release_all();
        if stray > 0 {
            error!(
                "{}. {stray} slots were held without a registered command",
                self.shared.session
            );
        }
        state.halted = false;
        state.check_conservation();
        drop(state);
        self.shared.wake_all();
        warn!(
            "{}. Reset drained {drained} outstanding commands",
            self.shared.session
        );
        Ok(drained)
    }

    /// Refuse new submissions until the next [`Coordinator::reset`].
    pub fn halt(&self) -> Result<(), XgqError> {
        self.shared.halt()
    }

    pub fn is_halted(&self) -> Result<bool, XgqError> {
        Ok(self.shared.lock_state()?.halted)
    }

    /// Commands submitted and not yet finished.
    pub fn outstanding(&self) -> Result<usize, XgqError> {
        Ok(self.shared.lock_state()?.registry.len())
    }

    pub fn slots_in_use(&self) -> Result<usize, XgqError> {
        Ok(self.shared.lock_state()?.pool.in_use())
    }

    /// Finished commands whose outcome has not been fetched.
    pub fn retained_results(&self) -> Result<usize, XgqError> {
        Ok(self.shared.lock_state()?.finished.retained())
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.signal_stop();
        }
        self.shared.host_bell.ring();
        for worker in &mut self.workers {
            worker.join();
        }
    }
}
