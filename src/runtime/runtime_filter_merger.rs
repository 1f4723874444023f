// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Per-query accumulation of partial runtime filters on the merge node.
//!
//! Responsibilities:
//! - Collects one partial filter per build backend for every filter id.
//! - Abandons a filter id for good once its accumulated size exceeds the budget.
//! - Concatenates the partials and emits the total filter exactly once.
//!
//! Key exported interfaces:
//! - Types: `RuntimeFilterMerger`, `RuntimeFilterParams`, `MergeOutcome`, `MergedRuntimeFilter`.
//!
//! A merger is owned by the runtime filter worker thread and is never shared.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::common::types::{FilterId, FragmentInstanceId, NetworkAddress, QueryId, SenderId};
use crate::exec::runtime_filter::JoinRuntimeFilter;
use crate::rfrelay_logging::debug;
use crate::runtime::runtime_filter_events::now_millis;
use crate::runtime::runtime_filter_relay::{RuntimeFilterDestination, coalesce_destinations};
use crate::service::proto::{PTransmitRuntimeFilterParams, PUniqueId};

/// Query options that influence runtime filter transmission.
#[derive(Clone, Debug, Default)]
pub struct RuntimeFilterQueryOptions {
    pub runtime_filter_send_timeout_ms: Option<u64>,
    pub query_timeout: Option<i64>,
}

impl RuntimeFilterQueryOptions {
    pub fn send_timeout(&self, default_timeout: Duration) -> Duration {
        self.runtime_filter_send_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(default_timeout)
    }
}

/// A probe fragment instance waiting for a filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeFilterProberParams {
    pub fragment_instance_id: FragmentInstanceId,
    pub fragment_instance_address: NetworkAddress,
}

/// Merge plan handed to the merge node when the query opens.
#[derive(Clone, Debug, Default)]
pub struct RuntimeFilterParams {
    pub id_to_prober_params: HashMap<FilterId, Vec<RuntimeFilterProberParams>>,
    pub runtime_filter_builder_number: HashMap<FilterId, usize>,
    /// Budget on the summed size of partial filters. Non-positive means unlimited.
    pub runtime_filter_max_size: i64,
}

/// Total filter ready to be distributed.
#[derive(Clone, Debug)]
pub struct MergedRuntimeFilter {
    pub params: PTransmitRuntimeFilterParams,
    pub filter: Arc<JoinRuntimeFilter>,
    pub destinations: Vec<RuntimeFilterDestination>,
    pub timeout: Duration,
}

#[derive(Debug)]
pub enum MergeOutcome {
    /// Dropped without touching merge state.
    Discarded(&'static str),
    /// Counted; more senders are expected.
    Accepted,
    /// This partial pushed the filter over its size budget.
    Stopped,
    Completed(MergedRuntimeFilter),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeFilterMergeSnapshot {
    pub expected_senders: usize,
    pub arrived_senders: usize,
    pub current_size: i64,
    pub stopped: bool,
}

struct RuntimeFilterMergeStatus {
    expected_senders: usize,
    max_size: i64,
    current_size: i64,
    arrives: HashSet<SenderId>,
    // arrival order
    filters: Vec<JoinRuntimeFilter>,
    stop: bool,
    recv_first_filter_ts: i64,
    recv_last_filter_ts: i64,
}

impl RuntimeFilterMergeStatus {
    fn new(expected_senders: usize, max_size: i64) -> Self {
        Self {
            expected_senders: expected_senders.max(1),
            max_size: if max_size > 0 { max_size } else { i64::MAX },
            current_size: 0,
            arrives: HashSet::new(),
            filters: Vec::new(),
            stop: false,
            recv_first_filter_ts: 0,
            recv_last_filter_ts: 0,
        }
    }
}

pub struct RuntimeFilterMerger {
    query_id: QueryId,
    is_pipeline: bool,
    send_timeout: Duration,
    targets: HashMap<FilterId, Vec<RuntimeFilterProberParams>>,
    statuses: HashMap<FilterId, RuntimeFilterMergeStatus>,
}

impl RuntimeFilterMerger {
    pub fn new(
        query_id: QueryId,
        query_options: &RuntimeFilterQueryOptions,
        is_pipeline: bool,
        default_timeout: Duration,
    ) -> Self {
        Self {
            query_id,
            is_pipeline,
            send_timeout: query_options.send_timeout(default_timeout),
            targets: HashMap::new(),
            statuses: HashMap::new(),
        }
    }

    /// Idempotent per filter id: state of an already known id is kept.
    pub fn init(&mut self, params: &RuntimeFilterParams) {
        for (filter_id, probers) in &params.id_to_prober_params {
            self.targets
                .entry(*filter_id)
                .or_insert_with(|| probers.clone());
        }
        for (filter_id, expected) in &params.runtime_filter_builder_number {
            self.statuses.entry(*filter_id).or_insert_with(|| {
                RuntimeFilterMergeStatus::new(*expected, params.runtime_filter_max_size)
            });
        }
    }

    pub fn merge_runtime_filter(
        &mut self,
        filter_id: FilterId,
        be_number: SenderId,
        data: &[u8],
    ) -> MergeOutcome {
        match self.targets.get(&filter_id) {
            Some(probers) if !probers.is_empty() => {}
            _ => return MergeOutcome::Discarded("no prober waits for filter"),
        }
        let Some(status) = self.statuses.get_mut(&filter_id) else {
            return MergeOutcome::Discarded("filter not pending merge");
        };
        if status.stop {
            return MergeOutcome::Discarded("filter exceeded size budget");
        }
        if status.arrives.contains(&be_number) {
            debug!(
                "runtime filter merge: duplicated partial filter: query_id={} filter_id={} build_be={}",
                self.query_id, filter_id, be_number
            );
            return MergeOutcome::Discarded("duplicated sender");
        }
        let filter = match JoinRuntimeFilter::deserialize(data) {
            Ok(filter) => filter,
            Err(err) => {
                debug!(
                    "runtime filter merge: drop undecodable partial filter: query_id={} filter_id={} build_be={} err={}",
                    self.query_id, filter_id, be_number, err
                );
                return MergeOutcome::Discarded("undecodable partial filter");
            }
        };

        let now = now_millis();
        if status.recv_first_filter_ts == 0 {
            status.recv_first_filter_ts = now;
        }
        status.recv_last_filter_ts = now;

        status.current_size = status.current_size.saturating_add(filter.size() as i64);
        if status.current_size > status.max_size {
            debug!(
                "runtime filter merge: stop building since size too large: query_id={} filter_id={} size={} max_size={}",
                self.query_id, filter_id, status.current_size, status.max_size
            );
            // Terminal: the filter id never completes, so its partials are released.
            status.stop = true;
            status.arrives.clear();
            status.filters.clear();
            return MergeOutcome::Stopped;
        }

        status.arrives.insert(be_number);
        status.filters.push(filter);
        if status.filters.len() < status.expected_senders {
            return MergeOutcome::Accepted;
        }

        match self.statuses.remove(&filter_id) {
            Some(status) => MergeOutcome::Completed(self.build_total(filter_id, status)),
            None => MergeOutcome::Discarded("filter not pending merge"),
        }
    }

    fn build_total(
        &self,
        filter_id: FilterId,
        status: RuntimeFilterMergeStatus,
    ) -> MergedRuntimeFilter {
        let mut parts = status.filters.into_iter();
        let mut out = match parts.next() {
            Some(first) => {
                let mut out = first.create_empty();
                out.concat(&first);
                out
            }
            None => JoinRuntimeFilter::with_expected_rows(0).create_empty(),
        };
        for part in parts {
            out.concat(&part);
        }

        let broadcast_ts = now_millis();
        let probers = self.targets.get(&filter_id).cloned().unwrap_or_default();
        let destinations = coalesce_destinations(probers.into_iter().map(|p| {
            RuntimeFilterDestination::new(p.fragment_instance_address, vec![p.fragment_instance_id])
        }));
        debug!(
            "runtime filter merge: total filter ready: query_id={} filter_id={} bytes={} destinations={} last_minus_first_ms={} send_minus_first_ms={}",
            self.query_id,
            filter_id,
            out.size(),
            destinations.len(),
            status.recv_last_filter_ts - status.recv_first_filter_ts,
            broadcast_ts - status.recv_first_filter_ts
        );
        let params = PTransmitRuntimeFilterParams {
            is_partial: Some(false),
            query_id: Some(PUniqueId::from(self.query_id)),
            filter_id: Some(filter_id),
            data: Some(out.serialize().into()),
            broadcast_timestamp: Some(broadcast_ts),
            is_pipeline: self.is_pipeline.then_some(true),
            ..Default::default()
        };
        MergedRuntimeFilter {
            params,
            filter: Arc::new(out),
            destinations,
            timeout: self.send_timeout,
        }
    }

    pub fn status(&self, filter_id: FilterId) -> Option<RuntimeFilterMergeSnapshot> {
        self.statuses
            .get(&filter_id)
            .map(|status| RuntimeFilterMergeSnapshot {
                expected_senders: status.expected_senders,
                arrived_senders: status.arrives.len(),
                current_size: status.current_size,
                stopped: status.stop,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILTER_ID: FilterId = 1;

    fn query_id() -> QueryId {
        QueryId::new(11, 22)
    }

    fn prober(host: &str, lo: i64) -> RuntimeFilterProberParams {
        RuntimeFilterProberParams {
            fragment_instance_id: FragmentInstanceId::new(11, lo),
            fragment_instance_address: NetworkAddress::new(host, 8060),
        }
    }

    fn merger(expected: usize, max_size: i64) -> RuntimeFilterMerger {
        let mut merger = RuntimeFilterMerger::new(
            query_id(),
            &RuntimeFilterQueryOptions::default(),
            true,
            Duration::from_millis(1000),
        );
        let mut params = RuntimeFilterParams {
            runtime_filter_max_size: max_size,
            ..Default::default()
        };
        params.id_to_prober_params.insert(
            FILTER_ID,
            vec![prober("b", 1), prober("a", 2), prober("b", 3)],
        );
        params
            .runtime_filter_builder_number
            .insert(FILTER_ID, expected);
        merger.init(&params);
        merger
    }

    /// Partial filter whose directory is `expected_rows`-sized, holding `keys`.
    fn partial(expected_rows: u64, keys: impl IntoIterator<Item = i64>) -> Vec<u8> {
        let mut filter = JoinRuntimeFilter::with_expected_rows(expected_rows);
        for key in keys {
            filter.insert(key);
        }
        filter.serialize()
    }

    fn completed(outcome: MergeOutcome) -> MergedRuntimeFilter {
        match outcome {
            MergeOutcome::Completed(total) => total,
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn fires_once_after_last_distinct_sender_in_any_order() {
        // three 256-byte partials, budget 1000
        let parts = [
            (1, partial(256, 0..10)),
            (2, partial(256, 100..110)),
            (3, partial(256, 200..210)),
        ];
        let orders = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let mut m = merger(3, 1000);
            let mut totals = Vec::new();
            for (step, idx) in order.iter().enumerate() {
                let (be_number, data) = &parts[*idx];
                match m.merge_runtime_filter(FILTER_ID, *be_number, data) {
                    MergeOutcome::Accepted => {
                        let snapshot = m.status(FILTER_ID).expect("pending status");
                        assert_eq!(snapshot.arrived_senders, step + 1, "order {order:?}");
                        assert_eq!(snapshot.current_size, 256 * (step as i64 + 1));
                    }
                    MergeOutcome::Completed(total) => totals.push(total),
                    other => panic!("order {order:?}: unexpected {other:?}"),
                }
                // a resend of the partial just merged is always a no-op
                assert!(matches!(
                    m.merge_runtime_filter(FILTER_ID, *be_number, data),
                    MergeOutcome::Discarded(_)
                ));
            }
            assert_eq!(totals.len(), 1, "order {order:?}");
            let total = &totals[0];
            assert!(total.filter.size() <= 768);
            assert!((0..10).chain(100..110).chain(200..210).all(|k| total.filter.test(k)));
            assert_eq!(total.params.is_partial, Some(false));
            assert_eq!(total.params.is_pipeline, Some(true));
            assert!(total.params.broadcast_timestamp.is_some());
            assert_eq!(total.timeout, Duration::from_millis(1000));

            // a late partial never re-merges
            assert!(matches!(
                m.merge_runtime_filter(FILTER_ID, 4, &parts[0].1),
                MergeOutcome::Discarded(_)
            ));
            assert!(m.status(FILTER_ID).is_none());
        }
    }

    #[test]
    fn duplicate_sender_leaves_state_untouched() {
        let a = partial(256, 0..10);
        let mut m = merger(3, 1000);
        assert!(matches!(m.merge_runtime_filter(FILTER_ID, 1, &a), MergeOutcome::Accepted));
        let before = m.status(FILTER_ID).expect("status");
        assert!(matches!(
            m.merge_runtime_filter(FILTER_ID, 1, &a),
            MergeOutcome::Discarded("duplicated sender")
        ));
        assert_eq!(m.status(FILTER_ID).expect("status"), before);
    }

    #[test]
    fn exceeding_budget_abandons_filter_for_good() {
        // 512 bytes then 256 bytes against a 600 byte budget
        let a = partial(512, 0..10);
        let b = partial(256, 10..20);
        let mut m = merger(2, 600);
        assert!(matches!(m.merge_runtime_filter(FILTER_ID, 1, &a), MergeOutcome::Accepted));
        assert!(matches!(m.merge_runtime_filter(FILTER_ID, 2, &b), MergeOutcome::Stopped));
        let snapshot = m.status(FILTER_ID).expect("status");
        assert!(snapshot.stopped);
        assert_eq!(snapshot.arrived_senders, 0);
        assert!(matches!(
            m.merge_runtime_filter(FILTER_ID, 3, &b),
            MergeOutcome::Discarded(_)
        ));
        assert!(m.status(FILTER_ID).expect("status").stopped);
    }

    #[test]
    fn undecodable_and_unknown_partials_are_dropped() {
        let mut m = merger(2, 0);
        assert!(matches!(
            m.merge_runtime_filter(FILTER_ID, 1, b"garbage"),
            MergeOutcome::Discarded("undecodable partial filter")
        ));
        assert_eq!(m.status(FILTER_ID).expect("status").arrived_senders, 0);
        assert!(matches!(
            m.merge_runtime_filter(99, 1, &partial(16, [1])),
            MergeOutcome::Discarded("no prober waits for filter")
        ));
    }

    #[test]
    fn filter_without_probers_is_dropped() {
        let mut m = merger(1, 0);
        let mut params = RuntimeFilterParams::default();
        params.id_to_prober_params.insert(2, Vec::new());
        params.runtime_filter_builder_number.insert(2, 1);
        m.init(&params);
        assert!(matches!(
            m.merge_runtime_filter(2, 1, &partial(16, [1])),
            MergeOutcome::Discarded("no prober waits for filter")
        ));
    }

    #[test]
    fn destinations_are_coalesced_by_address() {
        let mut m = merger(1, 0);
        let total = completed(m.merge_runtime_filter(FILTER_ID, 1, &partial(16, [5])));
        assert_eq!(total.destinations.len(), 2);
        assert_eq!(total.destinations[0].address, NetworkAddress::new("a", 8060));
        assert_eq!(
            total.destinations[1].finst_ids,
            vec![FragmentInstanceId::new(11, 1), FragmentInstanceId::new(11, 3)]
        );
    }

    #[test]
    fn query_option_overrides_send_timeout() {
        let options = RuntimeFilterQueryOptions {
            runtime_filter_send_timeout_ms: Some(250),
            ..Default::default()
        };
        assert_eq!(
            options.send_timeout(Duration::from_secs(1)),
            Duration::from_millis(250)
        );
        assert_eq!(
            RuntimeFilterQueryOptions::default().send_timeout(Duration::from_secs(1)),
            Duration::from_secs(1)
        );
    }
}
