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
//! Bounded in-memory trace of runtime filter activity for troubleshooting.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use chrono::Utc;

use crate::common::types::{FilterId, QueryId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeFilterEventKind {
    LocalPublish,
    SendPartRf,
    RecvPartRf,
    RecvTotalRf,
    SendTotalRfRpc,
    Forward,
    DeliverLocal,
    DeliverBroadcastRfPassthrough,
    DeliverBroadcastRfRelay,
    Cache,
    DropSizeExceeded,
}

impl fmt::Display for RuntimeFilterEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RuntimeFilterEventKind::LocalPublish => "LOCAL_PUBLISH",
            RuntimeFilterEventKind::SendPartRf => "SEND_PART_RF",
            RuntimeFilterEventKind::RecvPartRf => "RECV_PART_RF",
            RuntimeFilterEventKind::RecvTotalRf => "RECV_TOTAL_RF",
            RuntimeFilterEventKind::SendTotalRfRpc => "SEND_TOTAL_RF_RPC",
            RuntimeFilterEventKind::Forward => "FORWARD",
            RuntimeFilterEventKind::DeliverLocal => "DELIVER_LOCAL",
            RuntimeFilterEventKind::DeliverBroadcastRfPassthrough => {
                "DELIVER_BROADCAST_RF_PASSTHROUGH"
            }
            RuntimeFilterEventKind::DeliverBroadcastRfRelay => "DELIVER_BROADCAST_RF_RELAY",
            RuntimeFilterEventKind::Cache => "CACHE",
            RuntimeFilterEventKind::DropSizeExceeded => "DROP_SIZE_EXCEEDED",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeFilterEvent {
    pub query_id: QueryId,
    pub filter_id: FilterId,
    pub network: String,
    pub kind: RuntimeFilterEventKind,
    pub timestamp_ms: i64,
}

impl fmt::Display for RuntimeFilterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] query_id={} filter_id={} network={} kind={}",
            self.timestamp_ms, self.query_id, self.filter_id, self.network, self.kind
        )
    }
}

pub struct RuntimeFilterEventLog {
    capacity: usize,
    events: Mutex<VecDeque<RuntimeFilterEvent>>,
}

impl RuntimeFilterEventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn record(
        &self,
        query_id: QueryId,
        filter_id: FilterId,
        network: impl fmt::Display,
        kind: RuntimeFilterEventKind,
    ) {
        if !self.is_enabled() {
            return;
        }
        let event = RuntimeFilterEvent {
            query_id,
            filter_id,
            network: network.to_string(),
            kind,
            timestamp_ms: Utc::now().timestamp_millis(),
        };
        let mut events = self.events.lock().expect("runtime filter event log lock");
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn events_for_query(&self, query_id: QueryId) -> Vec<RuntimeFilterEvent> {
        let events = self.events.lock().expect("runtime filter event log lock");
        events
            .iter()
            .filter(|e| e.query_id == query_id)
            .cloned()
            .collect()
    }

    pub fn clear_query(&self, query_id: QueryId) {
        let mut events = self.events.lock().expect("runtime filter event log lock");
        events.retain(|e| e.query_id != query_id);
    }
}

/// Wall-clock milliseconds stamped on outbound messages.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
