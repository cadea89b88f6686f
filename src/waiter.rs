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

//! The wait loop behind `poll(wait = true)` and `await_any`.
//!
//! Every strategy runs the same loop: reap what the controller has finished, test the caller's
//! condition under the coordinator lock, then back off in the strategy's own way until the
//! deadline passes.

use crate::coordinator::{DeviceState, Shared};
use crate::error::XgqError;
use serde::Deserialize;
use std::time::{Duration, Instant};

const NOTIFY_SLICE: Duration = Duration::from_millis(10);
const DEVICE_WAIT_SLICE: Duration = Duration::from_millis(10);
const HYBRID_SLEEP: Duration = Duration::from_millis(3);
const HYBRID_SLEEP_ITERATIONS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    /// Sleep on the coordinator's completion condvar in short slices.
    BlockingNotify,
    /// Spin, reaping completions inline and yielding between checks.
    BusyPoll,
    /// Sleep on the transport doorbell.
    DeviceWait,
    /// A few short sleeps first, then the doorbell.
    HybridLowPower,
}

/// Wait until `ready` returns true or `deadline` passes.
///
/// `ready` runs with the coordinator lock held and may update the state it inspects, for example
/// to consume one completion.
pub(crate) fn wait_until<F>(
    shared: &Shared,
    strategy: WaitStrategy,
    deadline: Instant,
    mut ready: F,
) -> Result<(), XgqError>
where
    F: FnMut(&mut DeviceState) -> bool,
{
    // with a completion worker running, the condvar alone is enough for blocking waits
    let reap_inline = !shared.config.completion_worker || strategy != WaitStrategy::BlockingNotify;
    let mut iteration: u32 = 0;
    loop {
        if reap_inline {
            shared.try_drain_completions()?;
        }
        let mut state = shared.lock_state()?;
        if ready(&mut state) {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(XgqError::TimedOut(format!(
                "{}. Command is still pending, the CU might be stuck",
                shared.session
            )));
        }
        let remaining = deadline - now;
        match strategy {
            WaitStrategy::BlockingNotify => {
                let (mut state, _) = shared
                    .work_item_done
                    .wait_timeout(state, NOTIFY_SLICE.min(remaining))
                    .map_err(|e| {
                        XgqError::Internal(format!("Failed when waiting for a completion: {e}"))
                    })?;
                if ready(&mut state) {
                    return Ok(());
                }
            }
            WaitStrategy::BusyPoll => {
                drop(state);
                std::thread::yield_now();
            }
            WaitStrategy::DeviceWait => {
                drop(state);
                shared.host_bell.wait(DEVICE_WAIT_SLICE.min(remaining));
            }
            WaitStrategy::HybridLowPower => {
                drop(state);
                if iteration < HYBRID_SLEEP_ITERATIONS {
                    std::thread::sleep(HYBRID_SLEEP.min(remaining));
                } else {
                    shared.host_bell.wait(DEVICE_WAIT_SLICE.min(remaining));
                }
            }
        }
        iteration = iteration.saturating_add(1);
    }
}
