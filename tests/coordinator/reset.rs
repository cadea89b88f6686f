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
use std::time::{Duration, Instant};
use xgq::registry::{CommandState, ETIME_RESULT};
use xgq::session::{CommandHandle, SessionKind};

#[gtest]
#[rstest]
fn reset_drains_outstanding_commands_as_timed_out(_logger: ()) {
    let harness = Harness::start(common::config(4), SessionKind::Kernel, common::stuck());
    let coordinator = &harness.coordinator;
    let handles: Vec<CommandHandle> = (0..3)
        .map(|i| coordinator.submit(&regmap(i, 4), None, TIMEOUT).expect("submit"))
        .collect();
    assert_that!(coordinator.slots_in_use(), ok(eq(&3)));

    assert_that!(coordinator.reset(), ok(eq(&3)));
    assert_that!(coordinator.slots_in_use(), ok(eq(&0)));
    assert_that!(coordinator.outstanding(), ok(eq(&0)));
    assert_that!(coordinator.poll(&handles, false), ok(eq(&vec![true; 3])));

    let fetched = coordinator.fetch_result(&handles).expect("fetch");
    assert_that!(fetched.error_count, eq(3));
    for result in &fetched.results {
        expect_that!(result.state, eq(CommandState::TimedOut));
        expect_that!(result.result_code, eq(ETIME_RESULT));
    }
}

#[gtest]
#[rstest]
fn a_completion_after_reset_is_ignored(_logger: ()) {
    let (coordinator, peer) = common::manual(common::config(4), SessionKind::Kernel);
    let handle = coordinator.submit(&regmap(1, 4), None, TIMEOUT).expect("submit");
    let entry = peer.next_submission();
    coordinator.reset().expect("reset");

    peer.complete(entry.cid, entry.tag, 0);
    assert_that!(
        common::eventually(TIMEOUT, || coordinator.process_completions().ok() == Some(0)),
        eq(true)
    );
    let fetched = coordinator.fetch_result(&[handle]).expect("fetch");
    assert_that!(fetched.results[0].state, eq(CommandState::TimedOut));
    assert_that!(coordinator.slots_in_use(), ok(eq(&0)));
}

#[gtest]
#[rstest]
fn health_monitor_halts_and_drains_a_stuck_channel(_logger: ()) {
    let mut config = common::config(4);
    config.health.enabled = true;
    config.health.check_interval = Duration::from_millis(20);
    let harness = Harness::start(config, SessionKind::Kernel, common::stuck());
    let coordinator = &harness.coordinator;

    let handle = coordinator
        .submit(&regmap(1, 4), None, Duration::from_millis(30))
        .expect("submit");
    assert_that!(
        common::eventually(TIMEOUT, || coordinator.is_halted().unwrap_or(false)),
        eq(true)
    );
    assert_that!(
        common::eventually(TIMEOUT, || coordinator.outstanding().ok() == Some(0)),
        eq(true)
    );
    assert_that!(
        coordinator.submit(&regmap(2, 4), None, TIMEOUT),
        err(displays_as(contains_substring("halted")))
    );
    let fetched = coordinator.fetch_result(&[handle]).expect("fetch");
    assert_that!(fetched.results[0].state, eq(CommandState::TimedOut));

    coordinator.reset().expect("reset");
    assert_that!(coordinator.is_halted(), ok(eq(&false)));
}

#[gtest]
#[rstest]
fn healthy_commands_do_not_halt_the_channel(_logger: ()) {
    let mut config = common::config(4);
    config.health.enabled = true;
    config.health.check_interval = Duration::from_millis(10);
    let harness = Harness::kernel(config);
    let coordinator = &harness.coordinator;
    for i in 0..10 {
        let handle = coordinator.submit(&regmap(i, 4), None, TIMEOUT).expect("submit");
        coordinator.poll(&[handle], true).expect("poll");
    }
    std::thread::sleep(Duration::from_millis(30));
    assert_that!(coordinator.is_halted(), ok(eq(&false)));
}

#[gtest]
#[rstest]
fn dropping_the_coordinator_stops_its_workers_promptly(_logger: ()) {
    let mut config = common::config(4);
    config.health.enabled = true;
    let harness = Harness::start(config, SessionKind::Kernel, common::stuck());
    harness
        .coordinator
        .submit(&regmap(1, 4), None, TIMEOUT)
        .expect("submit");
    let started = Instant::now();
    drop(harness);
    assert_that!(started.elapsed(), lt(Duration::from_secs(1)));
}
