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

use crate::common::{self, Harness, TIMEOUT, logger, regmap};
use googletest::prelude::*;
use rstest::*;
use std::time::Duration;
use xgq::session::{CommandHandle, SessionKind};
use xgq::waiter::WaitStrategy;

#[gtest]
#[rstest]
fn poll_without_waiting_reports_progress(_logger: ()) {
    let harness = Harness::gated(common::config(4), SessionKind::Kernel);
    let coordinator = &harness.coordinator;
    let first = coordinator.submit(&regmap(1, 4), None, TIMEOUT).expect("submit");
    let second = coordinator.submit(&regmap(2, 4), None, TIMEOUT).expect("submit");

    assert_that!(coordinator.poll(&[first, second], false), ok(eq(&vec![false, false])));
    harness.release(1);
    assert_that!(
        common::eventually(TIMEOUT, || {
            coordinator.poll(&[first, second], false).ok() == Some(vec![true, false])
        }),
        eq(true)
    );
    harness.release(1);
    assert_that!(coordinator.poll(&[first, second], true), ok(eq(&vec![true, true])));
}

#[gtest]
#[rstest]
#[case::notify_with_worker(WaitStrategy::BlockingNotify, true)]
#[case::notify_without_worker(WaitStrategy::BlockingNotify, false)]
#[case::busy_poll(WaitStrategy::BusyPoll, false)]
#[case::device_wait(WaitStrategy::DeviceWait, true)]
#[case::hybrid_low_power(WaitStrategy::HybridLowPower, false)]
fn every_strategy_waits_for_all_handles(
    _logger: (),
    #[case] strategy: WaitStrategy,
    #[case] completion_worker: bool,
) {
    let mut config = common::config(4);
    config.wait_strategy = strategy;
    config.completion_worker = completion_worker;
    let harness = Harness::kernel(config);
    let coordinator = &harness.coordinator;

    let handles: Vec<CommandHandle> = (0..4)
        .map(|i| coordinator.submit(&regmap(i, 8), None, TIMEOUT).expect("submit"))
        .collect();
    assert_that!(coordinator.poll(&handles, true), ok(eq(&vec![true; 4])));
    assert_that!(coordinator.slots_in_use(), ok(eq(&0)));
}

#[gtest]
#[rstest]
fn waiting_on_a_stuck_unit_times_out(_logger: ()) {
    let mut config = common::config(4);
    config.wait_timeout = Duration::from_millis(50);
    let harness = Harness::start(config, SessionKind::Kernel, common::stuck());
    let handle = harness
        .coordinator
        .submit(&regmap(1, 4), None, TIMEOUT)
        .expect("submit");
    assert_that!(
        harness.coordinator.poll(&[handle], true),
        err(displays_as(contains_substring("the CU might be stuck")))
    );
    assert_that!(harness.coordinator.poll(&[handle], false), ok(eq(&vec![false])));
}

#[gtest]
#[rstest]
fn handles_are_checked_before_polling(_logger: ()) {
    let harness = Harness::kernel(common::config(4));
    let coordinator = &harness.coordinator;
    let handle = coordinator.submit(&regmap(1, 4), None, TIMEOUT).expect("submit");

    expect_that!(
        coordinator.poll(&[], false),
        err(displays_as(contains_substring("No command handles")))
    );
    expect_that!(
        coordinator.poll(&[CommandHandle::default()], false),
        err(displays_as(contains_substring("InvalidHandle")))
    );
    let foreign = CommandHandle {
        signature: handle.signature ^ 0x10,
        ..handle
    };
    expect_that!(
        coordinator.poll(&[handle, foreign], false),
        err(displays_as(contains_substring("Corrupted")))
    );
    let other_unit = CommandHandle {
        cu_index: 1,
        ..handle
    };
    expect_that!(
        coordinator.poll(&[other_unit], false),
        err(displays_as(contains_substring("targets cu 1")))
    );
}

#[gtest]
#[rstest]
fn poll_and_await_any_do_not_mix(_logger: ()) {
    let harness = Harness::kernel(common::config(4));
    let coordinator = &harness.coordinator;
    let handle = coordinator.submit(&regmap(1, 4), None, TIMEOUT).expect("submit");
    coordinator.poll(&[handle], true).expect("poll");
    assert_that!(
        coordinator.await_any(Duration::from_millis(10)),
        err(displays_as(contains_substring("already uses poll")))
    );
}
