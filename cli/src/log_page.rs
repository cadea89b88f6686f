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
use xgq::shm::fetch_firmware_log;

/// Copy the controller's firmware log out through the log page
pub fn log_page_handler(device: &SimulatedDevice, timeout: Duration) -> Result<String, XgqError> {
    let log = fetch_firmware_log(&device.coordinator, &device.partition, timeout)?;
    Ok(String::from_utf8_lossy(&log).into_owned())
}
