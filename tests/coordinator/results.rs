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
use xgq::executor::ControllerHandler;
use xgq::registry::CommandState;
use xgq::session::{CommandHandle, SessionKind};
use xgq::wire::{
    ConfigCuRequest, ConfigEndRequest, ConfigStartRequest, IdentifyRequest, IdentifyResponse,
    QueryCuKind, QueryCuRequest, QueryCuResponse, bytes_to_words,
};

#[gtest]
#[rstest]
fn completed_commands_return_their_payload(_logger: ()) {
    let harness = Harness::kernel(common::config(4));
    let coordinator = &harness.coordinator;
    let handle = coordinator
        .submit(&regmap(10, 4), None, TIMEOUT)
        .expect("submit");
    coordinator.poll(&[handle], true).expect("poll");

    let fetched = coordinator.fetch_result(&[handle]).expect("fetch");
    assert_that!(fetched.error_count, eq(0));
    let result = &fetched.results[0];
    expect_that!(result.handle, eq(handle));
    expect_that!(result.state, eq(CommandState::Completed));
    expect_that!(result.result_code, eq(0));
    // the simulated unit answers with the sum of the register map words
    expect_that!(bytes_to_words(&result.payload)[0], eq(10 + 11 + 12 + 13));
    expect_that!(coordinator.retained_results(), ok(eq(&0)));
}

#[gtest]
#[rstest]
fn failed_commands_are_counted_as_errors(_logger: ()) {
    let harness = Harness::start(common::config(4), SessionKind::Kernel, common::failing(-5));
    let coordinator = &harness.coordinator;
    let handles: Vec<CommandHandle> = (0..2)
        .map(|i| coordinator.submit(&regmap(i, 4), None, TIMEOUT).expect("submit"))
        .collect();
    coordinator.poll(&handles, true).expect("poll");

    let fetched = coordinator.fetch_result(&handles).expect("fetch");
    assert_that!(fetched.error_count, eq(2));
    for result in &fetched.results {
        expect_that!(result.state, eq(CommandState::Errored));
        expect_that!(result.result_code, eq(-5));
    }
}

#[gtest]
#[rstest]
fn results_are_only_handed_out_once_finished(_logger: ()) {
    let harness = Harness::gated(common::config(4), SessionKind::Kernel);
    let coordinator = &harness.coordinator;
    let handle = coordinator.submit(&regmap(1, 4), None, TIMEOUT).expect("submit");
    assert_that!(
        coordinator.fetch_result(&[handle]),
        err(displays_as(contains_substring("has not finished")))
    );
    harness.release(1);
    coordinator.poll(&[handle], true).expect("poll");
    assert_that!(
        coordinator.fetch_result(&[handle]).map(|f| f.error_count),
        ok(eq(&0))
    );
}

#[gtest]
#[rstest]
fn a_failed_result_is_not_handed_out_twice(_logger: ()) {
    let harness = Harness::start(common::config(4), SessionKind::Kernel, common::failing(-5));
    let coordinator = &harness.coordinator;
    let handle = coordinator.submit(&regmap(1, 4), None, TIMEOUT).expect("submit");
    coordinator.poll(&[handle], true).expect("poll");

    let fetched = coordinator.fetch_result(&[handle]).expect("first fetch");
    assert_that!(fetched.error_count, eq(1));
    assert_that!(fetched.results[0].result_code, eq(-5));
    assert_that!(
        coordinator.fetch_result(&[handle]),
        err(displays_as(contains_substring("already fetched or dropped")))
    );
}

#[gtest]
#[rstest]
fn duplicate_handles_are_refused_before_anything_is_taken(_logger: ()) {
    let harness = Harness::start(common::config(4), SessionKind::Kernel, common::failing(-5));
    let coordinator = &harness.coordinator;
    let handle = coordinator.submit(&regmap(1, 4), None, TIMEOUT).expect("submit");
    coordinator.poll(&[handle], true).expect("poll");

    assert_that!(
        coordinator.fetch_result(&[handle, handle]),
        err(displays_as(contains_substring("given more than once")))
    );
    assert_that!(coordinator.retained_results(), ok(eq(&1)));
    let fetched = coordinator.fetch_result(&[handle]).expect("fetch");
    assert_that!(fetched.error_count, eq(1));
    assert_that!(fetched.results[0].state, eq(CommandState::Errored));
}

#[gtest]
#[rstest]
fn an_evicted_result_is_not_reported_as_clean(_logger: ()) {
    let mut config = common::config(4);
    config.max_retained_results = 1;
    let harness = Harness::start(config, SessionKind::Kernel, common::failing(-5));
    let coordinator = &harness.coordinator;
    let first = coordinator.submit(&regmap(1, 4), None, TIMEOUT).expect("first submit");
    coordinator.poll(&[first], true).expect("first poll");
    let second = coordinator.submit(&regmap(2, 4), None, TIMEOUT).expect("second submit");
    coordinator.poll(&[second], true).expect("second poll");

    assert_that!(coordinator.retained_results(), ok(eq(&1)));
    assert_that!(
        coordinator.fetch_result(&[first]),
        err(displays_as(contains_substring("XgqError::InvalidHandle")))
    );
    assert_that!(
        coordinator.fetch_result(&[second]).map(|f| f.error_count),
        ok(eq(&1))
    );
}

#[gtest]
#[rstest]
fn a_corrupted_handle_leaves_every_result_in_place(_logger: ()) {
    let harness = Harness::kernel(common::config(4));
    let coordinator = &harness.coordinator;
    let handle = coordinator.submit(&regmap(3, 4), None, TIMEOUT).expect("submit");
    coordinator.poll(&[handle], true).expect("poll");
    let corrupted = CommandHandle {
        signature: !handle.signature,
        ..handle
    };

    assert_that!(
        coordinator.fetch_result(&[handle, corrupted]),
        err(displays_as(contains_substring("Corrupted")))
    );
    assert_that!(coordinator.retained_results(), ok(eq(&1)));
    let fetched = coordinator.fetch_result(&[handle]).expect("fetch");
    assert_that!(
        bytes_to_words(&fetched.results[0].payload)[0],
        eq(3 + 4 + 5 + 6)
    );
}

#[gtest]
#[rstest]
fn late_and_duplicate_completions_are_ignored(_logger: ()) {
    let (coordinator, peer) = common::manual(common::config(4), SessionKind::Kernel);
    let handle = coordinator.submit(&regmap(1, 4), None, TIMEOUT).expect("submit");
    let entry = peer.next_submission();
    assert_that!(entry.cid, eq(handle.primary_id));
    assert_that!(entry.tag, eq(handle.secondary_id));

    // wrong tag first: not this command
    peer.complete(entry.cid, entry.tag ^ 1, 0);
    peer.complete(entry.cid, entry.tag, -7);
    peer.complete(entry.cid, entry.tag, 0);
    assert_that!(coordinator.poll(&[handle], true), ok(eq(&vec![true])));
    assert_that!(
        common::eventually(TIMEOUT, || coordinator.process_completions().ok() == Some(0)),
        eq(true)
    );

    let fetched = coordinator.fetch_result(&[handle]).expect("fetch");
    assert_that!(fetched.results[0].result_code, eq(-7));
    assert_that!(fetched.results[0].state, eq(CommandState::Errored));
    assert_that!(coordinator.slots_in_use(), ok(eq(&0)));
}

#[gtest]
#[rstest]
fn admin_requests_configure_and_query_units(_logger: ()) {
    let harness = Harness::start(
        common::config(4),
        SessionKind::Admin,
        ControllerHandler::new(NUM_UNITS),
    );
    let coordinator = &harness.coordinator;
    let run = |handle: CommandHandle| {
        coordinator.poll(&[handle], true).expect("poll");
        let fetched = coordinator.fetch_result(&[handle]).expect("fetch");
        assert_eq!(fetched.error_count, 0, "{:?}", fetched.results);
        fetched.results[0].payload
    };

    let version = run(coordinator.submit_request(&IdentifyRequest, TIMEOUT).expect("identify"));
    expect_that!(
        IdentifyResponse::from_payload(&version),
        eq(IdentifyResponse { major: 1, minor: 0 })
    );

    run(coordinator
        .submit_request(&ConfigStartRequest { num_cus: 2 }, TIMEOUT)
        .expect("config start"));
    run(coordinator
        .submit_request(
            &ConfigCuRequest {
                cu_index: 1,
                base_address: 0x2000_0000,
                map_size: 0x400,
            },
            TIMEOUT,
        )
        .expect("config cu"));
    run(coordinator
        .submit_request(&ConfigEndRequest, TIMEOUT)
        .expect("config end"));

    for _ in 0..2 {
        run(coordinator.submit(&regmap(1, 4), Some(1), TIMEOUT).expect("start cu 1"));
    }
    let config = run(coordinator
        .submit_request(
            &QueryCuRequest {
                cu_index: 1,
                kind: QueryCuKind::Config,
            },
            TIMEOUT,
        )
        .expect("query config"));
    expect_that!(
        QueryCuResponse::from_payload(&config),
        eq(QueryCuResponse {
            value: 0x400,
            base_address: 0x2000_0000
        })
    );
    let status = run(coordinator
        .submit_request(
            &QueryCuRequest {
                cu_index: 1,
                kind: QueryCuKind::Status,
            },
            TIMEOUT,
        )
        .expect("query status"));
    expect_that!(QueryCuResponse::from_payload(&status).value, eq(2));
}
