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

//! A simulated accelerator: one channel with the in-process controller on the far end and an
//! auxiliary region for log pages.

use log::info;
use std::sync::Arc;
use xgq::config::CoordinatorConfig;
use xgq::coordinator::Coordinator;
use xgq::error::XgqError;
use xgq::executor::{ControllerHandler, Executor};
use xgq::region::HeapRegion;
use xgq::ring::{attach_controller, attach_host};
use xgq::session::{ComputeUnit, DeviceContext, Session, SessionKind};
use xgq::shm::{LOG_PAGE_SIZE, PayloadPartition};

const REGMAP_SIZE: usize = 0x1000;
const DATA_AREA_SIZE: usize = 64 * 1024;

pub struct SimulatedDevice {
    pub coordinator: Coordinator,
    pub partition: PayloadPartition,
    _executor: Executor,
}

impl SimulatedDevice {
    /// Bring up a device with `units` compute units and open one `kind` session on CU 0.
    pub fn open(
        config: CoordinatorConfig,
        units: u32,
        kind: SessionKind,
    ) -> Result<SimulatedDevice, XgqError> {
        let header = config.ring_header();
        let region = HeapRegion::new(header.region_size());
        header.format(region.as_ref())?;
        let aux = HeapRegion::new(LOG_PAGE_SIZE + DATA_AREA_SIZE);
        let bells = config.doorbells();

        let handler = ControllerHandler::new(units as usize)
            .with_log_region(aux.clone(), boot_log(units).into_bytes());
        let executor = Executor::spawn(
            attach_controller(region.clone(), &bells)?,
            handler,
            config.transport.poll_interval,
        )?;

        let units = (0..units)
            .map(|i| ComputeUnit {
                name: format!("krnl_{i}"),
                regmap_size: REGMAP_SIZE,
            })
            .collect();
        let device = Arc::new(DeviceContext::new(0, units)?);
        let session = Session::new(&device, kind, 0, 0)?;
        info!("Simulated device up with {} compute units", device.units().len());
        let coordinator =
            Coordinator::attach(device, session, attach_host(region, &bells)?, config)?;
        Ok(SimulatedDevice {
            coordinator,
            partition: PayloadPartition::new(aux)?,
            _executor: executor,
        })
    }
}

fn boot_log(units: u32) -> String {
    format!(
        "[    0.000000] xgq controller 1.0 starting\n\
         [    0.000410] submission ring ready\n\
         [    0.000415] completion ring ready\n\
         [    0.001200] {units} compute units registered\n"
    )
}
