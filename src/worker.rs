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

//! Background threads owned by a coordinator.
//!
//! The completion worker drains the completion ring whenever the controller rings the host or,
//! in polling mode, every poll interval. The health monitor looks for commands that outlived
//! their deadline; finding one halts the coordinator and drains every expired command as timed
//! out until nothing is outstanding.

use crate::coordinator::Shared;
use crate::error::XgqError;
use log::{debug, error, trace};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A stop flag a sleeping worker can be woken from.
#[derive(Debug, Default)]
pub(crate) struct StopSignal {
    stopped: Mutex<bool>,
    raised: Condvar,
}

impl StopSignal {
    pub(crate) fn stop(&self) {
        if let Ok(mut stopped) = self.stopped.lock() {
            *stopped = true;
            self.raised.notify_all();
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.lock().map(|s| *s).unwrap_or(true)
    }

    /// Sleep for `duration` unless stopped first. Returns whether the signal was raised.
    pub(crate) fn sleep(&self, duration: Duration) -> bool {
        let Ok(stopped) = self.stopped.lock() else {
            return true;
        };
        match self
            .raised
            .wait_timeout_while(stopped, duration, |stopped| !*stopped)
        {
            Ok((stopped, _)) => *stopped,
            Err(_) => true,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Worker {
    name: &'static str,
    stop: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn<F>(name: &'static str, body: F) -> Result<Worker, XgqError>
    where
        F: FnOnce(Arc<StopSignal>) + Send + 'static,
    {
        let stop = Arc::new(StopSignal::default());
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(thread_stop))
            .map_err(|e| XgqError::Internal(format!("Failed to start the {name} thread: {e}")))?;
        trace!("Started {name}");
        Ok(Worker {
            name,
            stop,
            handle: Some(handle),
        })
    }

    pub(crate) fn signal_stop(&self) {
        self.stop.stop();
    }

    pub(crate) fn join(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("The {} thread panicked", self.name);
            } else {
                trace!("Stopped {}", self.name);
            }
        }
    }
}

pub(crate) fn spawn_completion_worker(shared: Arc<Shared>) -> Result<Worker, XgqError> {
    Worker::spawn("xgq-complete", move |stop| {
        let interval = shared.config.transport.poll_interval;
        while !stop.is_stopped() {
            if let Err(e) = shared.drain_completions() {
                error!("{}. Completion worker failed to drain: {e}", shared.session);
            }
            shared.host_bell.wait(interval);
        }
    })
}

pub(crate) fn spawn_health_monitor(shared: Arc<Shared>) -> Result<Worker, XgqError> {
    Worker::spawn("xgq-health", move |stop| {
        let interval = shared.config.health.check_interval;
        while !stop.sleep(interval) {
            match shared.has_expired(Instant::now()) {
                Ok(true) => stop_services(&shared, &stop, interval),
                Ok(false) => {}
                Err(e) => error!("{}. Health check failed: {e}", shared.session),
            }
        }
    })
}

/// Halt the coordinator, then keep draining expired commands until none is outstanding.
fn stop_services(shared: &Shared, stop: &StopSignal, interval: Duration) {
    if let Err(e) = shared.halt() {
        error!("{}. Failed to halt: {e}", shared.session);
        return;
    }
    loop {
        match shared.drain_expired(Instant::now()) {
            Ok((drained, 0)) => {
                debug!(
                    "{}. Drained {drained} commands, nothing is outstanding",
                    shared.session
                );
                return;
            }
            Ok((drained, remaining)) => {
                debug!(
                    "{}. Drained {drained} commands, {remaining} still outstanding",
                    shared.session
                );
            }
            Err(e) => {
                error!("{}. Failed to drain: {e}", shared.session);
                return;
            }
        }
        if stop.sleep(interval) {
            return;
        }
    }
}
