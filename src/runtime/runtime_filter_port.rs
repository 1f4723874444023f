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
//! Per fragment-instance runtime filter port.
//!
//! Responsibilities:
//! - Holds the probes (consumers) a fragment instance waits on, keyed by filter id.
//! - Delivers locally published and network-received filters to those probes.
//! - Replays filters that arrived before a probe registered, from the port's own
//!   history or from the process arrival cache.
//! - Publishes built filters toward merge nodes or broadcast destinations.
//!
//! Key exported interfaces:
//! - Types: `RuntimeFilterPort`, `RuntimeFilterProbe`, `RuntimeFilterBuildDescriptor`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::common::types::{FilterId, FragmentInstanceId, NetworkAddress, QueryId, SenderId};
use crate::exec::runtime_filter::JoinRuntimeFilter;
use crate::rfrelay_logging::debug;
use crate::runtime::runtime_filter_cache::RuntimeFilterCache;
use crate::runtime::runtime_filter_events::{RuntimeFilterEventKind, RuntimeFilterEventLog};
use crate::runtime::runtime_filter_merger::RuntimeFilterQueryOptions;
use crate::runtime::runtime_filter_relay::RuntimeFilterDestination;
use crate::runtime::runtime_filter_worker::RuntimeFilterWorkerHandle;
use crate::service::proto::{PTransmitRuntimeFilterParams, PUniqueId};

/// Consumer side of one runtime filter. Clones share the same slot.
#[derive(Clone)]
pub struct RuntimeFilterProbe {
    inner: Arc<ProbeInner>,
}

struct ProbeInner {
    filter_id: FilterId,
    arrived: OnceLock<(Arc<JoinRuntimeFilter>, Instant)>,
}

impl RuntimeFilterProbe {
    pub fn new(filter_id: FilterId) -> Self {
        Self {
            inner: Arc::new(ProbeInner {
                filter_id,
                arrived: OnceLock::new(),
            }),
        }
    }

    pub fn filter_id(&self) -> FilterId {
        self.inner.filter_id
    }

    pub fn runtime_filter(&self) -> Option<Arc<JoinRuntimeFilter>> {
        self.inner.arrived.get().map(|(filter, _)| Arc::clone(filter))
    }

    pub fn is_ready(&self) -> bool {
        self.inner.arrived.get().is_some()
    }

    pub fn arrived_at(&self) -> Option<Instant> {
        self.inner.arrived.get().map(|(_, at)| *at)
    }

    /// Returns false when a filter was already set; the first one is kept.
    pub fn set_runtime_filter(&self, filter: Arc<JoinRuntimeFilter>) -> bool {
        self.inner.arrived.set((filter, Instant::now())).is_ok()
    }
}

impl fmt::Debug for RuntimeFilterProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeFilterProbe")
            .field("filter_id", &self.inner.filter_id)
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeFilterJoinMode {
    Broadcast,
    Partitioned,
}

/// What the build side knows about one filter it just produced.
#[derive(Clone, Debug)]
pub struct RuntimeFilterBuildDescriptor {
    pub filter_id: FilterId,
    pub join_mode: RuntimeFilterJoinMode,
    /// None when the build side gave up on the filter.
    pub filter: Option<Arc<JoinRuntimeFilter>>,
    pub has_remote_targets: bool,
    pub merge_nodes: Vec<NetworkAddress>,
    pub broadcast_grf_senders: Vec<FragmentInstanceId>,
    pub broadcast_grf_destinations: Vec<RuntimeFilterDestination>,
    pub sender_finst_id: Option<FragmentInstanceId>,
    pub is_pipeline: bool,
}

impl RuntimeFilterBuildDescriptor {
    pub fn new(filter_id: FilterId, join_mode: RuntimeFilterJoinMode) -> Self {
        Self {
            filter_id,
            join_mode,
            filter: None,
            has_remote_targets: false,
            merge_nodes: Vec::new(),
            broadcast_grf_senders: Vec::new(),
            broadcast_grf_destinations: Vec::new(),
            sender_finst_id: None,
            is_pipeline: true,
        }
    }
}

pub(crate) struct RuntimeFilterPublisher {
    pub(crate) worker: RuntimeFilterWorkerHandle,
    pub(crate) events: Arc<RuntimeFilterEventLog>,
    pub(crate) local_address: NetworkAddress,
    pub(crate) be_number: SenderId,
    pub(crate) send_timeout: Duration,
    pub(crate) passthrough_bytes_limit: usize,
}

pub struct RuntimeFilterPort {
    query_id: QueryId,
    finst_id: FragmentInstanceId,
    cache: Arc<RuntimeFilterCache>,
    publisher: Option<RuntimeFilterPublisher>,
    state: Mutex<PortState>,
}

#[derive(Default)]
struct PortState {
    listeners: HashMap<FilterId, Vec<RuntimeFilterProbe>>,
    // filters received from the network, replayed to late listeners
    received: HashMap<FilterId, Arc<JoinRuntimeFilter>>,
}

impl RuntimeFilterPort {
    pub(crate) fn new(
        query_id: QueryId,
        finst_id: FragmentInstanceId,
        cache: Arc<RuntimeFilterCache>,
        publisher: RuntimeFilterPublisher,
    ) -> Self {
        Self {
            query_id,
            finst_id,
            cache,
            publisher: Some(publisher),
            state: Mutex::new(PortState::default()),
        }
    }

    /// A port that only delivers locally and never publishes to the network.
    pub fn detached(
        query_id: QueryId,
        finst_id: FragmentInstanceId,
        cache: Arc<RuntimeFilterCache>,
    ) -> Self {
        Self {
            query_id,
            finst_id,
            cache,
            publisher: None,
            state: Mutex::new(PortState::default()),
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn finst_id(&self) -> FragmentInstanceId {
        self.finst_id
    }

    pub fn add_listener(&self, probe: RuntimeFilterProbe) {
        let filter_id = probe.filter_id();
        let mut state = self.state.lock().expect("runtime filter port lock");
        let arrived = state
            .received
            .get(&filter_id)
            .cloned()
            .or_else(|| self.cache.get(self.query_id, filter_id));
        if let Some(filter) = arrived {
            debug!(
                "runtime filter already arrived, deliver on listen: query_id={} finst_id={} filter_id={}",
                self.query_id, self.finst_id, filter_id
            );
            probe.set_runtime_filter(filter);
        }
        state.listeners.entry(filter_id).or_default().push(probe);
    }

    pub fn listener_count(&self, filter_id: FilterId) -> usize {
        let state = self.state.lock().expect("runtime filter port lock");
        state.listeners.get(&filter_id).map_or(0, Vec::len)
    }

    /// Deliver a filter built by this process to the probes registered now.
    /// Returns how many probes took it.
    pub fn publish_local(&self, filter_id: FilterId, filter: Arc<JoinRuntimeFilter>) -> usize {
        if let Some(publisher) = &self.publisher {
            publisher.events.record(
                self.query_id,
                filter_id,
                &publisher.local_address,
                RuntimeFilterEventKind::LocalPublish,
            );
        }
        let state = self.state.lock().expect("runtime filter port lock");
        Self::notify(&state, filter_id, &filter)
    }

    /// Deliver a total filter received from the network. The filter is kept
    /// for probes that register afterwards.
    pub fn receive_runtime_filter(&self, filter_id: FilterId, filter: Arc<JoinRuntimeFilter>) -> usize {
        let mut state = self.state.lock().expect("runtime filter port lock");
        state
            .received
            .entry(filter_id)
            .or_insert_with(|| Arc::clone(&filter));
        Self::notify(&state, filter_id, &filter)
    }

    /// Pull filters parked in the arrival cache into probes still waiting.
    pub fn poll_arrival_cache(&self) -> usize {
        let mut state = self.state.lock().expect("runtime filter port lock");
        let waiting: Vec<FilterId> = state
            .listeners
            .iter()
            .filter(|(id, probes)| {
                !state.received.contains_key(*id) && probes.iter().any(|p| !p.is_ready())
            })
            .map(|(id, _)| *id)
            .collect();
        let mut delivered = 0;
        for filter_id in waiting {
            if let Some(filter) = self.cache.get(self.query_id, filter_id) {
                state.received.insert(filter_id, Arc::clone(&filter));
                delivered += Self::notify(&state, filter_id, &filter);
            }
        }
        delivered
    }

    fn notify(state: &PortState, filter_id: FilterId, filter: &Arc<JoinRuntimeFilter>) -> usize {
        state.listeners.get(&filter_id).map_or(0, |probes| {
            probes
                .iter()
                .filter(|probe| probe.set_runtime_filter(Arc::clone(filter)))
                .count()
        })
    }

    /// Publish freshly built filters: local probes first, then toward the
    /// merge nodes or straight to broadcast destinations.
    pub fn publish_runtime_filters(
        &self,
        descriptors: &[RuntimeFilterBuildDescriptor],
        query_options: &RuntimeFilterQueryOptions,
    ) {
        for desc in descriptors {
            let Some(filter) = &desc.filter else {
                continue;
            };
            self.publish_local(desc.filter_id, Arc::clone(filter));

            let Some(publisher) = &self.publisher else {
                continue;
            };
            if !desc.has_remote_targets {
                continue;
            }
            let is_broadcast = desc.join_mode == RuntimeFilterJoinMode::Broadcast;
            let send_broadcast_directly = is_broadcast && !desc.broadcast_grf_senders.is_empty();
            if !send_broadcast_directly && desc.merge_nodes.is_empty() {
                continue;
            }
            let need_send = !is_broadcast
                || desc.broadcast_grf_senders.contains(&self.finst_id)
                || desc.sender_finst_id == Some(self.finst_id);
            if !need_send {
                continue;
            }

            let data = filter.serialize();
            let passthrough = data.len() <= publisher.passthrough_bytes_limit;
            let params = PTransmitRuntimeFilterParams {
                is_partial: Some(!send_broadcast_directly),
                query_id: Some(PUniqueId::from(self.query_id)),
                filter_id: Some(desc.filter_id),
                finst_id: Some(PUniqueId::from(self.finst_id)),
                data: Some(data.into()),
                build_be_number: Some(publisher.be_number),
                is_pipeline: desc.is_pipeline.then_some(true),
                ..Default::default()
            };
            let timeout = query_options.send_timeout(publisher.send_timeout);

            if send_broadcast_directly {
                // Small filters go out from every sender; large ones from one.
                let chosen = desc.broadcast_grf_senders.iter().min_by_key(|id| id.lo);
                if passthrough || chosen == Some(&self.finst_id) {
                    publisher.worker.send_broadcast_runtime_filter(
                        params,
                        desc.broadcast_grf_destinations.clone(),
                        timeout,
                    );
                }
            } else {
                publisher
                    .worker
                    .send_part_runtime_filter(params, desc.merge_nodes.clone(), timeout);
            }
        }
    }
}
