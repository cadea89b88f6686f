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

use crate::common::{self, Harness, NUM_UNITS, TIMEOUT, logger, regmap};
use googletest::prelude::*;
use rstest::*;
use std::time::{Duration, Instant};
use xgq::executor::ControllerHandler;
use xgq::session::SessionKind;
use xgq::waiter::WaitStrategy;

#[gtest]
#[rstest]
#[case::blocking_notify(WaitStrategy::BlockingNotify)]
#[case::busy_poll(WaitStrategy::BusyPoll)]
#[case::device_wait(WaitStrategy::DeviceWait)]
#[case::hybrid_low_power(WaitStrategy::HybridLowPower)]
fn idle_await_any_times_out_promptly(_logger: (), #[case] strategy: WaitStrategy) {
    let mut config = common::config(4);
    config.wait_strategy = strategy;
    let harness = Harness::kernel(config);

    let started = Instant::now();
    let result = harness.coordinator.await_any(Duration::from_millis(50));
    let elapsed = started.elapsed();

    assert_that!(result, err(displays_as(contains_substring("TimedOut"))));
    assert_that!(elapsed, ge(Duration::from_millis(50)));
    assert_that!(elapsed, le(Duration::from_millis(100)));
}

#[gtest]
#[rstest]
#[case::blocking_notify(WaitStrategy::BlockingNotify)]
#[case::busy_poll(WaitStrategy::BusyPoll)]
#[case::device_wait(WaitStrategy::DeviceWait)]
#[case::hybrid_low_power(WaitStrategy::HybridLowPower)]
fn each_completion_satisfies_one_await(_logger: (), #[case] strategy: WaitStrategy) {
    let mut config = common::config(4);
    config.wait_strategy = strategy;
    let harness = Harness::kernel(config);
    let coordinator = &harness.coordinator;

    for i in 0..3 {
        coordinator.submit(&regmap(i, 4), None, TIMEOUT).expect("submit");
    }
    for _ in 0..3 {
        assert_that!(coordinator.await_any(TIMEOUT), ok(eq(&())));
    }
    assert_that!(
        coordinator.await_any(Duration::from_millis(20)),
        err(displays_as(contains_substring("TimedOut")))
    );
}

#[gtest]
#[rstest]
fn await_any_wakes_when_a_held_command_finishes(_logger: ()) {
    let harness = Harness::gated(common::config(4), SessionKind::Kernel);
    let coordinator = &harness.coordinator;
    coordinator.submit(&regmap(1, 4), None, TIMEOUT).expect("submit");

    expect_that!(
        coordinator.await_any(Duration::from_millis(30)),
        err(displays_as(contains_substring("still pending")))
    );
    harness.release(1);
    expect_that!(coordinator.await_any(TIMEOUT), ok(eq(&())));
}

#[gtest]
#[rstest]
fn admin_sessions_can_not_await_any(_logger: ()) {
    let harness = Harness::start(
        common::config(4),
        SessionKind::Admin,
        ControllerHandler::new(NUM_UNITS),
    );
    assert_that!(
        harness.coordinator.await_any(Duration::from_millis(10)),
        err(displays_as(contains_substring("not allowed for admin")))
    );
}

#[gtest]
#[rstest]
fn await_any_then_poll_is_refused(_logger: ()) {
    let harness = Harness::kernel(common::config(4));
    let coordinator = &harness.coordinator;
    let handle = coordinator.submit(&regmap(1, 4), None, TIMEOUT).expect("submit");
    coordinator.await_any(TIMEOUT).expect("await_any");
    assert_that!(
        coordinator.poll(&[handle], false),
        err(displays_as(contains_substring("already uses await_any")))
    );
}
