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

//! Keep every slot of a channel busy from several submitters at once and report throughput.

use crate::sim::SimulatedDevice;
use log::{debug, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use xgq::error::XgqError;

const BACKOFF: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
struct SoakTally {
    completed: u64,
    errored: u64,
    backoffs: u64,
}

fn submitter(
    device: &SimulatedDevice,
    seed: u32,
    commands: u32,
    payload_words: usize,
    timeout: Duration,
) -> Result<SoakTally, XgqError> {
    let coordinator = &device.coordinator;
    let mut tally = SoakTally::default();
    for i in 0..commands {
        let regmap: Vec<u8> = (0..payload_words as u32)
            .flat_map(|w| (seed ^ i ^ w).to_le_bytes())
            .collect();
        let handle = loop {
            match coordinator.submit(&regmap, None, timeout) {
                Ok(handle) => break handle,
                Err(e) if e.is_retryable() => {
                    tally.backoffs += 1;
                    std::thread::sleep(BACKOFF);
                }
                Err(e) => return Err(e),
            }
        };
        coordinator.poll(&[handle], true)?;
        let fetched = coordinator.fetch_result(&[handle])?;
        tally.errored += fetched.error_count as u64;
        tally.completed += (fetched.results.len() - fetched.error_count) as u64;
    }
    debug!("Submitter {seed} done: {tally:?}");
    Ok(tally)
}

/// Run `submitters` blocking submit loops of `commands` each and summarise them
pub async fn soak_handler(
    device: Arc<SimulatedDevice>,
    submitters: u32,
    commands: u32,
    payload_words: usize,
    timeout: Duration,
) -> Result<String, XgqError> {
    let started = Instant::now();
    let tasks: Vec<_> = (0..submitters)
        .map(|seed| {
            let device = Arc::clone(&device);
            tokio::task::spawn_blocking(move || {
                submitter(&device, seed, commands, payload_words, timeout)
            })
        })
        .collect();

    let mut total = SoakTally::default();
    for task in tasks {
        let tally = task
            .await
            .map_err(|e| XgqError::Internal(format!("Soak submitter failed: {e}")))??;
        total.completed += tally.completed;
        total.errored += tally.errored;
        total.backoffs += tally.backoffs;
    }
    let elapsed = started.elapsed();
    if total.errored > 0 {
        warn!("{} commands finished with an error", total.errored);
    }
    let coordinator = &device.coordinator;
    Ok(format!(
        "---- SOAK ----\n\
        | submitters | completed | errored | backoffs | elapsed | commands/s |\n\
        | {submitters} | {} | {} | {} | {elapsed:.2?} | {:.0} |\n\
        slots in use after the run: {}, outstanding: {}",
        total.completed,
        total.errored,
        total.backoffs,
        (total.completed + total.errored) as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        coordinator.slots_in_use()?,
        coordinator.outstanding()?,
    ))
}
