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

//! Coordinator configuration.
//!
//! Values come from up to two TOML files: the user file (`/etc/xgq/config.toml`) overrides the
//! vendor file (`/usr/lib/xgq/config.toml`), which overrides the hardcoded defaults below. A file
//! that is missing or fails to parse is skipped with a warning so a bad config never keeps the
//! coordinator from coming up.
//!
//! ```toml
//! [coordinator]
//! slot_count = 4
//! slot_policy = "after_last_returned"
//! single_outstanding = false
//! wait_strategy = "hybrid_low_power"
//!
//! [transport]
//! polling = false
//!
//! [health]
//! check_interval_ms = 10000
//! ```

mod config_files;

use crate::error::XgqError;
use crate::ring::{Doorbells, RingGeometry, RingHeader};
use crate::slot_pool::SlotPolicy;
use crate::waiter::WaitStrategy;
use crate::wire::{CQ_ENTRY_SIZE, SLOT_SIZE, SQ_HEADER_SIZE};
use log::{trace, warn};
use std::path::Path;
use std::time::Duration;

pub static VENDOR_CONFIG_PATH: &str = "/usr/lib/xgq/config.toml";
pub static USER_CONFIG_PATH: &str = "/etc/xgq/config.toml";

// Hardcoded fallbacks used for anything the config files leave out.
pub const SLOT_COUNT: usize = 4;
pub const SLOT_POLICY: SlotPolicy = SlotPolicy::FirstAvailable;
pub const SINGLE_OUTSTANDING: bool = false;
/// Fewest slot acquisition attempts allowed before a submit reports exhaustion.
pub const MIN_ACQUIRE_RETRIES: u32 = 16;
pub const WAIT_STRATEGY: WaitStrategy = WaitStrategy::BlockingNotify;
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_RETAINED_RESULTS: usize = 1024;
pub const COMPLETION_WORKER: bool = true;
pub const SQ_SLOTS: u32 = 4;
pub const SQ_SLOT_SIZE: u32 = SLOT_SIZE as u32;
pub const CQ_SLOTS: u32 = 4;
pub const POLLING: bool = true;
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);
pub const HEALTH_ENABLED: bool = true;
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub sq_slots: u32,
    pub sq_slot_size: u32,
    pub cq_slots: u32,
    /// Poll the rings instead of waiting for a doorbell.
    pub polling: bool,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    pub enabled: bool,
    pub check_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub slot_count: usize,
    pub slot_policy: SlotPolicy,
    /// Allow at most one outstanding command on the channel.
    pub single_outstanding: bool,
    pub acquire_retries: u32,
    pub wait_strategy: WaitStrategy,
    /// Budget for `poll` calls that wait.
    pub wait_timeout: Duration,
    pub max_retained_results: usize,
    /// Drain completions on a background thread.
    pub completion_worker: bool,
    pub transport: TransportConfig,
    pub health: HealthConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            slot_count: SLOT_COUNT,
            slot_policy: SLOT_POLICY,
            single_outstanding: SINGLE_OUTSTANDING,
            acquire_retries: MIN_ACQUIRE_RETRIES,
            wait_strategy: WAIT_STRATEGY,
            wait_timeout: WAIT_TIMEOUT,
            max_retained_results: MAX_RETAINED_RESULTS,
            completion_worker: COMPLETION_WORKER,
            transport: TransportConfig {
                sq_slots: SQ_SLOTS,
                sq_slot_size: SQ_SLOT_SIZE,
                cq_slots: CQ_SLOTS,
                polling: POLLING,
                poll_interval: POLL_INTERVAL,
            },
            health: HealthConfig {
                enabled: HEALTH_ENABLED,
                check_interval: HEALTH_CHECK_INTERVAL,
            },
        }
    }
}

impl CoordinatorConfig {
    /// Load from the standard user and vendor locations.
    pub fn load() -> CoordinatorConfig {
        CoordinatorConfig::load_from(Path::new(USER_CONFIG_PATH), Path::new(VENDOR_CONFIG_PATH))
    }

    /// Load `user` over `vendor` over the defaults, skipping files that cannot be used.
    pub fn load_from(user: &Path, vendor: &Path) -> CoordinatorConfig {
        let read = |path: &Path| match config_files::config_from_file(path) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Ignoring config {path:?}: {e}");
                None
            }
        };
        let merged = match (read(user), read(vendor)) {
            (Some(user), Some(vendor)) => user.merge(vendor),
            (Some(only), None) | (None, Some(only)) => only,
            (None, None) => {
                trace!("No config file found. Using hardcoded defaults.");
                config_files::TomlConfig::default()
            }
        };
        let config = CoordinatorConfig::from(merged);
        match config.validate() {
            Ok(()) => config,
            Err(e) => {
                warn!("Config files produced an unusable configuration, using defaults: {e}");
                CoordinatorConfig::default()
            }
        }
    }

    /// Parse one TOML document on top of the defaults.
    pub fn from_toml_str(toml_string: &str) -> Result<CoordinatorConfig, XgqError> {
        let config = CoordinatorConfig::from(config_files::toml_str_to_config(toml_string)?);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<CoordinatorConfig, XgqError> {
        let config = CoordinatorConfig::from(config_files::config_from_file(path)?);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), XgqError> {
        if self.slot_count == 0 {
            return Err(XgqError::InvalidArgument(
                "slot_count must be at least 1".to_string(),
            ));
        }
        if self.acquire_retries < MIN_ACQUIRE_RETRIES {
            return Err(XgqError::InvalidArgument(format!(
                "acquire_retries must be at least {MIN_ACQUIRE_RETRIES}, got {}",
                self.acquire_retries
            )));
        }
        if self.max_retained_results == 0 {
            return Err(XgqError::InvalidArgument(
                "max_retained_results must be at least 1".to_string(),
            ));
        }
        let transport = &self.transport;
        for (name, slots) in [("sq_slots", transport.sq_slots), ("cq_slots", transport.cq_slots)] {
            if !slots.is_power_of_two() || (slots as usize) < self.slot_count {
                return Err(XgqError::InvalidArgument(format!(
                    "{name} must be a power of two no smaller than slot_count {}, got {slots}",
                    self.slot_count
                )));
            }
        }
        let slot_size = transport.sq_slot_size as usize;
        if slot_size <= SQ_HEADER_SIZE || slot_size % 4 != 0 {
            return Err(XgqError::InvalidArgument(format!(
                "sq_slot_size must be a multiple of 4 larger than the {SQ_HEADER_SIZE} byte header, got {slot_size}"
            )));
        }
        if transport.poll_interval.is_zero() || self.health.check_interval.is_zero() {
            return Err(XgqError::InvalidArgument(
                "poll and health check intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Ring geometry matching this configuration.
    pub fn ring_header(&self) -> RingHeader {
        RingHeader::new(
            RingGeometry {
                slot_num: self.transport.sq_slots,
                slot_size: self.transport.sq_slot_size,
            },
            RingGeometry {
                slot_num: self.transport.cq_slots,
                slot_size: CQ_ENTRY_SIZE as u32,
            },
        )
    }

    pub fn doorbells(&self) -> Doorbells {
        if self.transport.polling {
            Doorbells::polling(self.transport.poll_interval)
        } else {
            Doorbells::interrupt()
        }
    }
}
