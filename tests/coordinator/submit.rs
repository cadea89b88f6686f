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
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::mpsc::{RecvTimeoutError, channel};
use std::time::Duration;
use xgq::executor::ControllerHandler;
use xgq::registry::IdGenerator;
use xgq::session::{DeviceContext, SessionKind};
use xgq::wire::Opcode;

#[gtest]
#[rstest]
fn submitted_handles_carry_the_session(_logger: ()) {
    let harness = Harness::kernel(common::config(4));
    let coordinator = &harness.coordinator;
    let first = coordinator
        .submit(&regmap(1, 16), None, TIMEOUT)
        .expect("first submit");
    let second = coordinator
        .submit(&regmap(2, 16), None, TIMEOUT)
        .expect("second submit");

    expect_that!(first.primary_id, not(eq(0)));
    expect_that!(second.primary_id, not(eq(first.primary_id)));
    expect_that!(first.cu_index, eq(0));
    expect_that!(first.signature, eq(coordinator.session().signature()));
}

#[gtest]
#[rstest]
#[case::empty(0, "Payload size of 0")]
#[case::too_large(4036, "exceeds the maximum")]
#[case::not_word_aligned(6, "not a multiple of 4")]
fn payload_size_is_validated(_logger: (), #[case] size: usize, #[case] expected: &str) {
    let harness = Harness::kernel(common::config(4));
    assert_that!(
        harness.coordinator.submit(&vec![0u8; size], None, TIMEOUT),
        err(displays_as(contains_substring(expected)))
    );
    assert_that!(harness.coordinator.slots_in_use(), ok(eq(&0)));
}

#[gtest]
#[rstest]
fn largest_payload_fits_one_slot(_logger: ()) {
    let harness = Harness::kernel(common::config(4));
    let max = harness.coordinator.max_payload();
    assert_that!(max, eq(4032));
    let handle = harness
        .coordinator
        .submit_command(Opcode::StartCu, &vec![1u8; max], None, TIMEOUT)
        .expect("max sized submit");
    assert_that!(harness.coordinator.poll(&[handle], true), ok(eq(&vec![true])));
}

#[gtest]
#[rstest]
fn single_outstanding_submit_waits_for_the_previous_command(_logger: ()) {
    let mut config = common::config(2);
    config.single_outstanding = true;
    let harness = Harness::gated(config, SessionKind::Kernel);
    let coordinator = &harness.coordinator;

    let first = coordinator
        .submit(&regmap(1, 16), None, TIMEOUT)
        .expect("first submit");
    std::thread::scope(|scope| {
        let (tx, rx) = channel();
        scope.spawn(move || {
            let _ = tx.send(coordinator.submit(&regmap(2, 16), None, TIMEOUT));
        });

        assert_that!(
            rx.recv_timeout(Duration::from_millis(150)).err(),
            some(eq(RecvTimeoutError::Timeout))
        );
        harness.release(1);
        let second = rx
            .recv_timeout(TIMEOUT)
            .expect("second submit returns")
            .expect("second submit succeeds");
        expect_that!(second.primary_id, not(eq(first.primary_id)));
        assert_that!(coordinator.poll(&[first], false), ok(eq(&vec![true])));
        harness.release(1);
        assert_that!(coordinator.poll(&[second], true), ok(eq(&vec![true])));
    });
}

#[gtest]
#[rstest]
fn exhausted_pool_is_reported_as_retryable(_logger: ()) {
    let harness = Harness::start(common::config(1), SessionKind::Kernel, common::stuck());
    harness
        .coordinator
        .submit(&regmap(1, 4), None, TIMEOUT)
        .expect("first submit takes the only slot");
    let error = harness
        .coordinator
        .submit(&regmap(2, 4), None, TIMEOUT)
        .expect_err("no slot is left");
    expect_that!(error.is_retryable(), eq(true));
    expect_that!(error.to_string(), contains_substring("ResourceExhausted"));
    expect_that!(harness.coordinator.outstanding(), ok(eq(&1)));
}

#[gtest]
#[rstest]
fn ordinary_sessions_ignore_the_target_unit(_logger: ()) {
    let harness = Harness::kernel(common::config(4));
    let handle = harness
        .coordinator
        .submit(&regmap(1, 4), Some(3), TIMEOUT)
        .expect("submit");
    assert_that!(handle.cu_index, eq(0));
}

#[gtest]
#[rstest]
fn admin_sessions_must_name_a_valid_unit(_logger: ()) {
    let harness = Harness::start(
        common::config(4),
        SessionKind::Admin,
        ControllerHandler::new(NUM_UNITS),
    );
    let coordinator = &harness.coordinator;
    expect_that!(
        coordinator.submit(&regmap(1, 4), None, TIMEOUT),
        err(displays_as(contains_substring("must name the cu_index")))
    );
    expect_that!(
        coordinator.submit(&regmap(1, 4), Some(NUM_UNITS as u32), TIMEOUT),
        err(displays_as(contains_substring("Invalid cu_index")))
    );
    let handle = coordinator
        .submit(&regmap(1, 4), Some(2), TIMEOUT)
        .expect("submit to cu 2");
    expect_that!(handle.cu_index, eq(2));
    expect_that!(coordinator.slots_in_use(), ok(le(&1)));
}

#[gtest]
#[rstest]
fn a_halted_coordinator_refuses_work_until_reset(_logger: ()) {
    let harness = Harness::kernel(common::config(4));
    let coordinator = &harness.coordinator;
    coordinator.halt().expect("halt");
    expect_that!(
        coordinator.submit(&regmap(1, 4), None, TIMEOUT),
        err(displays_as(contains_substring("halted")))
    );
    coordinator.reset().expect("reset");
    expect_that!(coordinator.is_halted(), ok(eq(&false)));
    expect_that!(coordinator.submit(&regmap(1, 4), None, TIMEOUT).is_ok(), eq(true));
}

#[gtest]
#[rstest]
fn a_full_submission_ring_fails_without_holding_a_slot(_logger: ()) {
    // the peer never consumes, so the four ring slots stay occupied across the reset
    let (coordinator, _peer) = common::manual(common::config(4), SessionKind::Kernel);
    for i in 0..4 {
        coordinator.submit(&regmap(i, 4), None, TIMEOUT).expect("submit");
    }
    assert_that!(coordinator.reset(), ok(eq(&4)));

    assert_that!(
        coordinator.submit(&regmap(9, 4), None, TIMEOUT),
        err(displays_as(all!(
            contains_substring("XgqError::Device"),
            contains_substring("the submission ring is full")
        )))
    );
    expect_that!(coordinator.outstanding(), ok(eq(&0)));
    expect_that!(coordinator.slots_in_use(), ok(eq(&0)));
}

#[gtest]
#[rstest]
#[case::first_available(xgq::slot_pool::SlotPolicy::FirstAvailable)]
#[case::after_last_returned(xgq::slot_pool::SlotPolicy::AfterLastReturned)]
fn concurrent_submitters_never_lose_a_slot(
    _logger: (),
    #[case] policy: xgq::slot_pool::SlotPolicy,
) {
    const THREADS: u32 = 6;
    const PER_THREAD: u32 = 40;
    let mut config = common::config(4);
    config.slot_policy = policy;
    config.acquire_retries = 1000;
    let harness = Harness::kernel(config);
    let coordinator = &harness.coordinator;

    let ids: Vec<u32> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..THREADS)
            .map(|t| {
                scope.spawn(move || {
                    let mut ids = Vec::new();
                    for i in 0..PER_THREAD {
                        let handle = coordinator
                            .submit(&regmap(t * 1000 + i, 8), None, TIMEOUT)
                            .expect("submit");
                        coordinator.poll(&[handle], true).expect("poll");
                        let fetched = coordinator.fetch_result(&[handle]).expect("fetch");
                        assert_eq!(fetched.error_count, 0);
                        ids.push(handle.primary_id);
                    }
                    ids
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().expect("submitter thread"))
            .collect()
    });

    assert_that!(ids.len(), eq((THREADS * PER_THREAD) as usize));
    // ids may only repeat once the earlier command is gone, and these runs are far from a wrap
    assert_that!(ids.iter().collect::<HashSet<_>>().len(), eq(ids.len()));
    assert_that!(coordinator.slots_in_use(), ok(eq(&0)));
    assert_that!(coordinator.outstanding(), ok(eq(&0)));
    assert_that!(coordinator.retained_results(), ok(eq(&0)));
}

#[gtest]
#[rstest]
fn ids_stay_non_zero_and_unique_across_a_wrap(_logger: ()) {
    let device = Arc::new(
        DeviceContext::with_ids(0, common::units(), IdGenerator::starting_after(u32::MAX - 2))
            .expect("device"),
    );
    let harness = Harness::with_device(device, common::config(4), common::stuck());
    let ids: Vec<u32> = (0..4)
        .map(|i| {
            harness
                .coordinator
                .submit(&regmap(i, 4), None, TIMEOUT)
                .expect("submit")
                .primary_id
        })
        .collect();
    assert_that!(ids, eq(&vec![u32::MAX - 1, u32::MAX, 1, 2]));
}
