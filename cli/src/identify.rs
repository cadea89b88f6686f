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

use crate::sim::SimulatedDevice;
use std::time::Duration;
use xgq::error::XgqError;
use xgq::wire::{IdentifyRequest, IdentifyResponse};

/// Ask the controller for its version and return it as a printable line
pub fn identify_handler(device: &SimulatedDevice, timeout: Duration) -> Result<String, XgqError> {
    let coordinator = &device.coordinator;
    let handle = coordinator.submit_request(&IdentifyRequest, timeout)?;
    coordinator.poll(&[handle], true)?;
    let fetched = coordinator.fetch_result(&[handle])?;
    match fetched.results.first() {
        Some(result) if result.result_code == 0 => {
            let version = IdentifyResponse::from_payload(&result.payload);
            Ok(format!("controller version {}.{}", version.major, version.minor))
        }
        Some(result) => Err(XgqError::Device(format!(
            "identify failed with result code {}",
            result.result_code
        ))),
        None => Err(XgqError::Internal("identify returned no result".to_string())),
    }
}
