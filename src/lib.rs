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

//! # xgq
//!
//! A host side command-queue coordinator for compute units on FPGA accelerator cards. Work is
//! handed to an embedded controller over a pair of single producer, single consumer rings in
//! shared memory: a submission ring carrying command records and a completion ring carrying
//! their results.
//!
//! The crate is organised leaf to root:
//!
//! - [`region`] - word addressed access to the memory shared with the controller
//! - [`wire`] - record layout and typed controller requests
//! - [`ring`] - ring header, producer and consumer halves, doorbells
//! - [`slot_pool`] - reusable staging buffers for submissions
//! - [`registry`] - outstanding commands, id generation and finished outcomes
//! - [`session`] - devices, sessions and command handles
//! - [`coordinator`] - submit, poll, await and fetch on one channel
//! - [`waiter`] - the wait strategies used by the coordinator
//! - [`shm`] - the auxiliary log page and data area
//! - [`executor`] - an in-process simulated controller
//! - [`config`] - layered TOML configuration
//!
//! Errors from every module are reported as [`error::XgqError`].

pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod region;
pub mod registry;
pub mod ring;
pub mod session;
pub mod shm;
pub mod slot_pool;
pub mod waiter;
pub mod wire;
mod worker;

pub use config::CoordinatorConfig;
pub use coordinator::{CommandResult, Coordinator, FetchedResults};
pub use error::XgqError;
pub use registry::CommandState;
pub use session::{CommandHandle, ComputeUnit, DeviceContext, Session, SessionKind};
