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

use crate::config::{self, CoordinatorConfig, HealthConfig, TransportConfig};
use crate::error::XgqError;
use crate::slot_pool::SlotPolicy;
use crate::waiter::WaitStrategy;
use log::trace;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// This is the top level struct which holds all sections
#[derive(Debug, Default, Deserialize)]
pub(crate) struct TomlConfig {
    coordinator: Option<CoordinatorToml>,
    transport: Option<TransportToml>,
    health: Option<HealthToml>,
}

/// This is the "coordinator" section struct
#[derive(Debug, Default, Deserialize)]
struct CoordinatorToml {
    slot_count: Option<usize>,
    slot_policy: Option<SlotPolicy>,
    single_outstanding: Option<bool>,
    acquire_retries: Option<u32>,
    wait_strategy: Option<WaitStrategy>,
    wait_timeout_ms: Option<u64>,
    max_retained_results: Option<usize>,
    completion_worker: Option<bool>,
}

/// This is the "transport" section struct
#[derive(Debug, Default, Deserialize)]
struct TransportToml {
    sq_slots: Option<u32>,
    sq_slot_size: Option<u32>,
    cq_slots: Option<u32>,
    polling: Option<bool>,
    poll_interval_us: Option<u64>,
}

/// This is the "health" section struct
#[derive(Debug, Default, Deserialize)]
struct HealthToml {
    enabled: Option<bool>,
    check_interval_ms: Option<u64>,
}

fn merge_section<T>(primary: Option<T>, fallback: Option<T>, merge: fn(T, T) -> T) -> Option<T> {
    match (primary, fallback) {
        (Some(primary), Some(fallback)) => Some(merge(primary, fallback)),
        (primary, fallback) => primary.or(fallback),
    }
}

impl TomlConfig {
    /// Fill every value missing from `self` with the one from `fallback`.
    pub(crate) fn merge(self, fallback: TomlConfig) -> TomlConfig {
        TomlConfig {
            coordinator: merge_section(
                self.coordinator,
                fallback.coordinator,
                CoordinatorToml::merge,
            ),
            transport: merge_section(self.transport, fallback.transport, TransportToml::merge),
            health: merge_section(self.health, fallback.health, HealthToml::merge),
        }
    }
}

impl CoordinatorToml {
    fn merge(self, fallback: CoordinatorToml) -> CoordinatorToml {
        CoordinatorToml {
            slot_count: self.slot_count.or(fallback.slot_count),
            slot_policy: self.slot_policy.or(fallback.slot_policy),
            single_outstanding: self.single_outstanding.or(fallback.single_outstanding),
            acquire_retries: self.acquire_retries.or(fallback.acquire_retries),
            wait_strategy: self.wait_strategy.or(fallback.wait_strategy),
            wait_timeout_ms: self.wait_timeout_ms.or(fallback.wait_timeout_ms),
            max_retained_results: self.max_retained_results.or(fallback.max_retained_results),
            completion_worker: self.completion_worker.or(fallback.completion_worker),
        }
    }
}

impl TransportToml {
    fn merge(self, fallback: TransportToml) -> TransportToml {
        TransportToml {
            sq_slots: self.sq_slots.or(fallback.sq_slots),
            sq_slot_size: self.sq_slot_size.or(fallback.sq_slot_size),
            cq_slots: self.cq_slots.or(fallback.cq_slots),
            polling: self.polling.or(fallback.polling),
            poll_interval_us: self.poll_interval_us.or(fallback.poll_interval_us),
        }
    }
}

impl HealthToml {
    fn merge(self, fallback: HealthToml) -> HealthToml {
        HealthToml {
            enabled: self.enabled.or(fallback.enabled),
            check_interval_ms: self.check_interval_ms.or(fallback.check_interval_ms),
        }
    }
}

impl From<TomlConfig> for CoordinatorConfig {
    fn from(value: TomlConfig) -> Self {
        trace!("Creating coordinator config from {value:?}");
        let coordinator = value.coordinator.unwrap_or_default();
        let transport = value.transport.unwrap_or_default();
        let health = value.health.unwrap_or_default();
        CoordinatorConfig {
            slot_count: coordinator.slot_count.unwrap_or(config::SLOT_COUNT),
            slot_policy: coordinator.slot_policy.unwrap_or(config::SLOT_POLICY),
            single_outstanding: coordinator
                .single_outstanding
                .unwrap_or(config::SINGLE_OUTSTANDING),
            acquire_retries: coordinator
                .acquire_retries
                .unwrap_or(config::MIN_ACQUIRE_RETRIES),
            wait_strategy: coordinator.wait_strategy.unwrap_or(config::WAIT_STRATEGY),
            wait_timeout: coordinator
                .wait_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(config::WAIT_TIMEOUT),
            max_retained_results: coordinator
                .max_retained_results
                .unwrap_or(config::MAX_RETAINED_RESULTS),
            completion_worker: coordinator
                .completion_worker
                .unwrap_or(config::COMPLETION_WORKER),
            transport: TransportConfig {
                sq_slots: transport.sq_slots.unwrap_or(config::SQ_SLOTS),
                sq_slot_size: transport.sq_slot_size.unwrap_or(config::SQ_SLOT_SIZE),
                cq_slots: transport.cq_slots.unwrap_or(config::CQ_SLOTS),
                polling: transport.polling.unwrap_or(config::POLLING),
                poll_interval: transport
                    .poll_interval_us
                    .map(Duration::from_micros)
                    .unwrap_or(config::POLL_INTERVAL),
            },
            health: HealthConfig {
                enabled: health.enabled.unwrap_or(config::HEALTH_ENABLED),
                check_interval: health
                    .check_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(config::HEALTH_CHECK_INTERVAL),
            },
        }
    }
}

pub(crate) fn toml_str_to_config(toml_string: &str) -> Result<TomlConfig, XgqError> {
    let config: TomlConfig = match toml::from_str(toml_string) {
        Ok(config) => config,
        Err(e) => {
            return Err(XgqError::TomlDe {
                toml_string: toml_string.into(),
                e,
            });
        }
    };
    Ok(config)
}

pub(crate) fn config_from_file(file_path: &Path) -> Result<TomlConfig, XgqError> {
    if !file_path.is_file() {
        return Err(XgqError::Internal(format!(
            "Config file not found in {file_path:?}"
        )));
    }
    trace!("Attempting to read from {file_path:?}");
    let toml_string = std::fs::read_to_string(file_path).map_err(|e| XgqError::IORead {
        file: file_path.into(),
        e,
    })?;
    toml_str_to_config(&toml_string)
}
