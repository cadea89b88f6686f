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

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum XgqError {
    #[error("XgqError::InvalidArgument: {0}")]
    InvalidArgument(String),
    #[error("XgqError::InvalidHandle: {0}")]
    InvalidHandle(String),
    #[error("XgqError::Corrupted: Command handle is corrupted: {0}")]
    Corrupted(String),
    #[error("XgqError::ResourceExhausted: {0}")]
    ResourceExhausted(String),
    #[error("XgqError::OperationNotPermitted: {0}")]
    OperationNotPermitted(String),
    #[error("XgqError::TimedOut: {0}")]
    TimedOut(String),
    #[error("XgqError::Device: A device or transport error occurred: {0}")]
    Device(String),
    #[error("XgqError::IORead: An IO error occurred when reading from {file:?}: {e}")]
    IORead { file: PathBuf, e: std::io::Error },
    #[error("XgqError::TomlDe: Failed to parse config string {toml_string:?}: {e}")]
    TomlDe {
        toml_string: String,
        e: toml::de::Error,
    },
    #[error("XgqError::Internal: An Internal error occurred: {0}")]
    Internal(String),
}

impl XgqError {
    /// Only slot exhaustion is worth retrying as-is. Everything else is either a caller bug or
    /// needs a reset first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, XgqError::ResourceExhausted(..))
    }
}
