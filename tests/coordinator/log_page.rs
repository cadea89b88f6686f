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

use crate::common::{self, Harness, NUM_UNITS, TIMEOUT, logger};
use googletest::prelude::*;
use rstest::*;
use xgq::executor::ControllerHandler;
use std::time::Duration;
use xgq::region::{HeapRegion, write_bytes};
use xgq::session::SessionKind;
use xgq::shm::{LOG_PAGE_SIZE, PartitionArea, PayloadPartition, fetch_firmware_log};

fn aux_region() -> std::sync::Arc<HeapRegion> {
    HeapRegion::new(LOG_PAGE_SIZE + 16 * 1024)
}

#[gtest]
#[rstest]
fn firmware_log_is_read_through_the_log_page(_logger: ()) {
    let aux = aux_region();
    let log = b"[    0.000] controller up\n[    0.004] 4 compute units\n".to_vec();
    let handler = ControllerHandler::new(NUM_UNITS).with_log_region(aux.clone(), log.clone());
    let harness = Harness::start(common::config(4), SessionKind::Admin, handler);
    let partition = PayloadPartition::new(aux).expect("partition");

    assert_that!(
        fetch_firmware_log(&harness.coordinator, &partition, TIMEOUT),
        ok(eq(&log))
    );
    // the page is released again
    assert_that!(
        partition
            .acquire(PartitionArea::LogPage, TIMEOUT)
            .map(|page| page.offset()),
        ok(eq(&0))
    );
}

#[gtest]
#[rstest]
fn a_log_longer_than_the_page_is_truncated_to_it(_logger: ()) {
    let aux = aux_region();
    let handler = ControllerHandler::new(NUM_UNITS)
        .with_log_region(aux.clone(), vec![b'x'; LOG_PAGE_SIZE + 100]);
    let harness = Harness::start(common::config(4), SessionKind::Admin, handler);
    let partition = PayloadPartition::new(aux).expect("partition");

    let fetched = fetch_firmware_log(&harness.coordinator, &partition, TIMEOUT).expect("log");
    assert_that!(fetched.len(), eq(LOG_PAGE_SIZE));
}

#[gtest]
#[rstest]
fn an_empty_log_is_a_device_error(_logger: ()) {
    let aux = aux_region();
    let handler = ControllerHandler::new(NUM_UNITS).with_log_region(aux.clone(), Vec::new());
    let harness = Harness::start(common::config(4), SessionKind::Admin, handler);
    let partition = PayloadPartition::new(aux).expect("partition");

    assert_that!(
        fetch_firmware_log(&harness.coordinator, &partition, TIMEOUT),
        err(displays_as(contains_substring("log of 0 bytes")))
    );
}

#[gtest]
#[rstest]
fn a_controller_without_a_log_region_fails_the_request(_logger: ()) {
    let harness = Harness::start(
        common::config(4),
        SessionKind::Admin,
        ControllerHandler::new(NUM_UNITS),
    );
    let partition = PayloadPartition::new(aux_region()).expect("partition");

    assert_that!(
        fetch_firmware_log(&harness.coordinator, &partition, TIMEOUT),
        err(displays_as(contains_substring("result code -19")))
    );
}

#[gtest]
#[rstest]
fn a_timed_out_log_request_keeps_the_page_until_it_finishes(_logger: ()) {
    let aux = aux_region();
    let (coordinator, peer) = common::manual(common::config(4), SessionKind::Admin);
    let partition = PayloadPartition::new(aux.clone()).expect("partition");
    let short = Duration::from_millis(50);

    assert_that!(
        fetch_firmware_log(&coordinator, &partition, short),
        err(displays_as(contains_substring("XgqError::TimedOut")))
    );
    let abandoned = peer.next_submission();
    assert_that!(
        fetch_firmware_log(&coordinator, &partition, short),
        err(displays_as(contains_substring("still in use by unfinished command")))
    );

    // the late answer lands in the page before the next request may use it
    write_bytes(aux.as_ref(), 0, b"stale");
    peer.complete(abandoned.cid, abandoned.tag, 0);
    let log = b"fresh log".to_vec();
    let fetched = std::thread::scope(|scope| {
        let controller = scope.spawn(|| {
            let request = peer.next_submission();
            write_bytes(aux.as_ref(), 0, &log);
            let mut payload = [0u8; 16];
            payload[..4].copy_from_slice(&(log.len() as u32).to_le_bytes());
            peer.complete_with(request.cid, request.tag, 0, payload);
        });
        let fetched = fetch_firmware_log(&coordinator, &partition, TIMEOUT);
        controller.join().expect("controller thread");
        fetched
    });
    assert_that!(fetched, ok(eq(&log)));
    assert_that!(coordinator.retained_results(), ok(eq(&0)));
}
