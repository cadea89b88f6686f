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

//! Devices, sessions and command handles.
//!
//! A [`DeviceContext`] is the explicit stand-in for what used to be process wide device state:
//! its compute unit table and the id generator every session on the device draws from. A
//! [`Session`] is built against a device and validated once, so the coordinator never has to
//! trust an unchecked session.

use crate::error::XgqError;
use crate::registry::{CommandKey, IdGenerator};
use log::{info, trace};
use rand::Rng;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// Unit index carried by a handle that never made it into the registry.
pub const INVALID_CU_INDEX: i32 = -1;
/// Upper bound on the compute units a device may expose.
pub const MAX_CUS: usize = 256;
/// Upper bound on channels per compute unit.
pub const MAX_CHANNELS: u32 = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeUnit {
    pub name: String,
    /// Size in bytes of the register map the unit decodes.
    pub regmap_size: usize,
}

#[derive(Debug)]
pub struct DeviceContext {
    index: u32,
    units: Vec<ComputeUnit>,
    ids: Mutex<IdGenerator>,
    next_session: AtomicU32,
}

impl DeviceContext {
    pub fn new(index: u32, units: Vec<ComputeUnit>) -> Result<DeviceContext, XgqError> {
        DeviceContext::with_ids(index, units, IdGenerator::new())
    }

    /// Build a device whose sessions draw ids from `ids`.
    pub fn with_ids(
        index: u32,
        units: Vec<ComputeUnit>,
        ids: IdGenerator,
    ) -> Result<DeviceContext, XgqError> {
        if units.is_empty() || units.len() > MAX_CUS {
            return Err(XgqError::InvalidArgument(format!(
                "device {index} must expose between 1 and {MAX_CUS} compute units, got {}",
                units.len()
            )));
        }
        trace!("Device {index} registered with {} compute units", units.len());
        Ok(DeviceContext {
            index,
            units,
            ids: Mutex::new(ids),
            next_session: AtomicU32::new(1),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn units(&self) -> &[ComputeUnit] {
        &self.units
    }

    pub fn unit(&self, cu_index: u32) -> Option<&ComputeUnit> {
        self.units.get(cu_index as usize)
    }

    pub(crate) fn next_ids(&self) -> Result<(u32, u32), XgqError> {
        match self.ids.lock() {
            Ok(mut ids) => Ok(ids.next_ids()),
            Err(e) => Err(XgqError::Internal(format!(
                "Failed when locking the id generator of device {}: {e}",
                self.index
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Decoder,
    Encoder,
    Scaler,
    Filter,
    Kernel,
    Admin,
}

impl SessionKind {
    pub fn is_admin(self) -> bool {
        self == SessionKind::Admin
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionKind::Decoder => "decoder",
            SessionKind::Encoder => "encoder",
            SessionKind::Scaler => "scaler",
            SessionKind::Filter => "filter",
            SessionKind::Kernel => "kernel",
            SessionKind::Admin => "admin",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: u32,
    device_index: u32,
    channel_id: u32,
    kind: SessionKind,
    cu_index: u32,
    signature: u64,
}

impl Session {
    /// Open a session on `device`.
    ///
    /// Ordinary sessions are bound to `cu_index` for their whole life. Admin sessions use
    /// `cu_index` only as the default target of controller requests and may not use channels.
    ///
    /// # Returns: `Result<Session, XgqError>`
    /// * `Ok(Session)` - A session with a fresh, non-zero signature
    /// * `Err(XgqError::InvalidArgument)` - Unknown compute unit, channel out of range, or a
    ///   channel requested on an admin session
    pub fn new(
        device: &DeviceContext,
        kind: SessionKind,
        cu_index: u32,
        channel_id: u32,
    ) -> Result<Session, XgqError> {
        if device.unit(cu_index).is_none() {
            return Err(XgqError::InvalidArgument(format!(
                "cu_index {cu_index} does not exist on device {}, it has {} compute units",
                device.index(),
                device.units().len()
            )));
        }
        if channel_id >= MAX_CHANNELS {
            return Err(XgqError::InvalidArgument(format!(
                "channel_id {channel_id} is out of range, at most {MAX_CHANNELS} channels are supported"
            )));
        }
        if kind.is_admin() && channel_id != 0 {
            return Err(XgqError::InvalidArgument(
                "channel_id is not allowed for admin sessions".to_string(),
            ));
        }
        let id = device.next_session.fetch_add(1, Ordering::Relaxed);
        let signature = rand::rng().random::<u64>() | 1;
        info!(
            "Session id: {id}, type: {kind} opened on device {} cu {cu_index} channel {channel_id}",
            device.index()
        );
        Ok(Session {
            id,
            device_index: device.index(),
            channel_id,
            kind,
            cu_index,
            signature,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn device_index(&self) -> u32 {
        self.device_index
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn cu_index(&self) -> u32 {
        self.cu_index
    }

    pub fn signature(&self) -> u64 {
        self.signature
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session id: {}, type: {}", self.id, self.kind)
    }
}

/// What `submit` hands back. The default value is the handle of a failed submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHandle {
    pub primary_id: u32,
    pub secondary_id: u32,
    pub cu_index: i32,
    pub signature: u64,
}

impl CommandHandle {
    pub fn key(&self) -> CommandKey {
        (self.primary_id, self.secondary_id)
    }
}

impl Default for CommandHandle {
    fn default() -> Self {
        CommandHandle {
            primary_id: 0,
            secondary_id: 0,
            cu_index: INVALID_CU_INDEX,
            signature: 0,
        }
    }
}
