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
//! Runtime filter worker: the single thread that owns merge state.
//!
//! Responsibilities:
//! - Drains one FIFO of lifecycle and filter events; producers only enqueue.
//! - Owns the per-query mergers and runs merges on arrival of partial filters.
//! - Distributes total filters: local destinations in-process, remote ones by
//!   passthrough waves or relay hops.
//! - Delivers received total filters to local fragment instances, parking them
//!   in the arrival cache when the consumer is not registered yet.
//!
//! Key exported interfaces:
//! - Types: `RuntimeFilterWorkerHandle`, `RuntimeFilterWorkerEvent`, `RuntimeFilterOptions`.
//!
//! RPCs issued by one distribution step are joined before the step returns.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rand::seq::SliceRandom;

use crate::common::app_config::RuntimeFilterConfig;
use crate::common::types::{FilterId, FragmentInstanceId, NetworkAddress, QueryId};
use crate::exec::runtime_filter::JoinRuntimeFilter;
use crate::rfrelay_logging::{debug, info, warn};
use crate::runtime::query_context::QueryContextManager;
use crate::runtime::rpc_runtime::RpcRuntime;
use crate::runtime::runtime_filter_cache::RuntimeFilterCache;
use crate::runtime::runtime_filter_events::{
    RuntimeFilterEventKind, RuntimeFilterEventLog, now_millis,
};
use crate::runtime::runtime_filter_merger::{
    MergeOutcome, MergedRuntimeFilter, RuntimeFilterMerger, RuntimeFilterParams,
    RuntimeFilterQueryOptions,
};
use crate::runtime::runtime_filter_relay::{
    DeliveryMode, RuntimeFilterDestination, coalesce_destinations, passthrough_waves, relay_hops,
    take_local_destination,
};
use crate::service::grpc_client::RuntimeFilterTransport;
use crate::service::proto::{PTransmitRuntimeFilterParams, PTransmitRuntimeFilterResult};

const WORKER_THREAD_NAME: &str = "runtime_filter";
const RPC_THREAD_NAME: &str = "runtime_filter_rpc";

#[derive(Clone, Debug)]
pub struct RuntimeFilterOptions {
    pub send_rpc_timeout: Duration,
    pub passthrough_bytes_limit: usize,
    pub passthrough_inflight_num: usize,
    /// Threads of the worker's RPC runtime.
    pub rpc_worker_threads: usize,
}

impl RuntimeFilterOptions {
    pub fn from_config(cfg: &RuntimeFilterConfig) -> Self {
        Self {
            send_rpc_timeout: Duration::from_millis(cfg.send_rpc_runtime_filter_timeout_ms),
            passthrough_bytes_limit: cfg.deliver_broadcast_rf_passthrough_bytes_limit,
            passthrough_inflight_num: cfg.deliver_broadcast_rf_passthrough_inflight_num.max(1),
            rpc_worker_threads: cfg.rpc_worker_threads.max(1),
        }
    }
}

impl Default for RuntimeFilterOptions {
    fn default() -> Self {
        Self::from_config(&RuntimeFilterConfig::default())
    }
}

#[derive(Debug)]
pub enum RuntimeFilterWorkerEvent {
    OpenQuery {
        query_id: QueryId,
        query_options: RuntimeFilterQueryOptions,
        params: RuntimeFilterParams,
        is_pipeline: bool,
    },
    CloseQuery {
        query_id: QueryId,
    },
    ReceivePartRf {
        params: PTransmitRuntimeFilterParams,
    },
    ReceiveTotalRf {
        params: PTransmitRuntimeFilterParams,
    },
    SendPartRf {
        params: PTransmitRuntimeFilterParams,
        addrs: Vec<NetworkAddress>,
        timeout: Duration,
    },
    SendBroadcastGrf {
        params: PTransmitRuntimeFilterParams,
        destinations: Vec<RuntimeFilterDestination>,
        timeout: Duration,
    },
}

impl RuntimeFilterWorkerEvent {
    fn name(&self) -> &'static str {
        match self {
            RuntimeFilterWorkerEvent::OpenQuery { .. } => "OPEN_QUERY",
            RuntimeFilterWorkerEvent::CloseQuery { .. } => "CLOSE_QUERY",
            RuntimeFilterWorkerEvent::ReceivePartRf { .. } => "RECEIVE_PART_RF",
            RuntimeFilterWorkerEvent::ReceiveTotalRf { .. } => "RECEIVE_TOTAL_RF",
            RuntimeFilterWorkerEvent::SendPartRf { .. } => "SEND_PART_RF",
            RuntimeFilterWorkerEvent::SendBroadcastGrf { .. } => "SEND_BROADCAST_GRF",
        }
    }
}

struct RuntimeFilterEventQueue {
    inner: Mutex<EventQueueInner>,
    cv: Condvar,
}

#[derive(Default)]
struct EventQueueInner {
    events: VecDeque<RuntimeFilterWorkerEvent>,
    closed: bool,
}

impl RuntimeFilterEventQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(EventQueueInner::default()),
            cv: Condvar::new(),
        }
    }

    /// Returns false once the queue is closed; the event is dropped.
    fn put(&self, event: RuntimeFilterWorkerEvent) -> bool {
        let mut inner = self.inner.lock().expect("runtime filter queue lock");
        if inner.closed {
            return false;
        }
        inner.events.push_back(event);
        self.cv.notify_one();
        true
    }

    /// Blocks for the next event. None after close, once drained.
    fn blocking_get(&self) -> Option<RuntimeFilterWorkerEvent> {
        let mut inner = self.inner.lock().expect("runtime filter queue lock");
        loop {
            if let Some(event) = inner.events.pop_front() {
                return Some(event);
            }
            if inner.closed {
                return None;
            }
            inner = self.cv.wait(inner).expect("runtime filter queue lock");
        }
    }

    fn close(&self) {
        let mut inner = self.inner.lock().expect("runtime filter queue lock");
        inner.closed = true;
        self.cv.notify_all();
    }

    fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("runtime filter queue lock")
            .events
            .len()
    }
}

/// Producer side of the worker. Every call enqueues and returns at once;
/// false means the worker is shut down and the event was dropped.
#[derive(Clone)]
pub struct RuntimeFilterWorkerHandle {
    queue: Arc<RuntimeFilterEventQueue>,
}

impl RuntimeFilterWorkerHandle {
    fn enqueue(&self, event: RuntimeFilterWorkerEvent) -> bool {
        let name = event.name();
        if self.queue.put(event) {
            return true;
        }
        debug!("runtime filter worker closed, drop event: event={}", name);
        false
    }

    pub fn open_query(
        &self,
        query_id: QueryId,
        query_options: RuntimeFilterQueryOptions,
        params: RuntimeFilterParams,
        is_pipeline: bool,
    ) -> bool {
        self.enqueue(RuntimeFilterWorkerEvent::OpenQuery {
            query_id,
            query_options,
            params,
            is_pipeline,
        })
    }

    pub fn close_query(&self, query_id: QueryId) -> bool {
        self.enqueue(RuntimeFilterWorkerEvent::CloseQuery { query_id })
    }

    pub fn receive_runtime_filter(&self, params: PTransmitRuntimeFilterParams) -> bool {
        if params.is_partial.unwrap_or(false) {
            self.enqueue(RuntimeFilterWorkerEvent::ReceivePartRf { params })
        } else {
            self.enqueue(RuntimeFilterWorkerEvent::ReceiveTotalRf { params })
        }
    }

    pub fn send_part_runtime_filter(
        &self,
        params: PTransmitRuntimeFilterParams,
        addrs: Vec<NetworkAddress>,
        timeout: Duration,
    ) -> bool {
        self.enqueue(RuntimeFilterWorkerEvent::SendPartRf {
            params,
            addrs,
            timeout,
        })
    }

    pub fn send_broadcast_runtime_filter(
        &self,
        params: PTransmitRuntimeFilterParams,
        destinations: Vec<RuntimeFilterDestination>,
        timeout: Duration,
    ) -> bool {
        self.enqueue(RuntimeFilterWorkerEvent::SendBroadcastGrf {
            params,
            destinations,
            timeout,
        })
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

/// Everything the worker thread needs, owned by the thread.
pub(crate) struct RuntimeFilterWorkerContext {
    pub(crate) local_address: NetworkAddress,
    pub(crate) options: RuntimeFilterOptions,
    pub(crate) query_contexts: Arc<QueryContextManager>,
    pub(crate) cache: Arc<RuntimeFilterCache>,
    pub(crate) events: Arc<RuntimeFilterEventLog>,
    pub(crate) transport: Arc<dyn RuntimeFilterTransport>,
}

pub(crate) struct RuntimeFilterWorker {
    queue: Arc<RuntimeFilterEventQueue>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RuntimeFilterWorker {
    pub(crate) fn start(ctx: RuntimeFilterWorkerContext) -> Result<Self, String> {
        let rpc = RpcRuntime::new(RPC_THREAD_NAME, ctx.options.rpc_worker_threads)?;
        let queue = Arc::new(RuntimeFilterEventQueue::new());
        let loop_queue = Arc::clone(&queue);
        let thread = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                let mut worker = RuntimeFilterWorkerLoop::new(ctx, rpc);
                worker.run(&loop_queue);
            })
            .map_err(|e| format!("start runtime filter worker failed: {e}"))?;
        Ok(Self {
            queue,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn handle(&self) -> RuntimeFilterWorkerHandle {
        RuntimeFilterWorkerHandle {
            queue: Arc::clone(&self.queue),
        }
    }

    /// Close the queue, let the thread drain it and join. Idempotent.
    pub(crate) fn shutdown(&self) {
        self.queue.close();
        let thread = self.thread.lock().expect("runtime filter worker lock").take();
        let Some(thread) = thread else {
            return;
        };
        if thread.thread().id() == std::thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            warn!("runtime filter worker thread panicked");
        }
    }
}

impl Drop for RuntimeFilterWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DistributionOrigin {
    Merge,
    Broadcast,
    Forward,
}

impl DistributionOrigin {
    fn event_kind(self, mode: DeliveryMode) -> RuntimeFilterEventKind {
        match (self, mode) {
            (DistributionOrigin::Merge, _) => RuntimeFilterEventKind::SendTotalRfRpc,
            (DistributionOrigin::Forward, _) => RuntimeFilterEventKind::Forward,
            (DistributionOrigin::Broadcast, DeliveryMode::Passthrough) => {
                RuntimeFilterEventKind::DeliverBroadcastRfPassthrough
            }
            (DistributionOrigin::Broadcast, DeliveryMode::Relay) => {
                RuntimeFilterEventKind::DeliverBroadcastRfRelay
            }
        }
    }
}

struct PendingRpc {
    dest: NetworkAddress,
    filter_id: Option<FilterId>,
    task: tokio::task::JoinHandle<Result<PTransmitRuntimeFilterResult, String>>,
}

/// RPCs spawned on the worker's RPC runtime, joined by `join` or on drop.
struct RpcBatch<'a> {
    transport: &'a Arc<dyn RuntimeFilterTransport>,
    rpc: &'a RpcRuntime,
    pending: Vec<PendingRpc>,
}

impl<'a> RpcBatch<'a> {
    fn new(transport: &'a Arc<dyn RuntimeFilterTransport>, rpc: &'a RpcRuntime) -> Self {
        Self {
            transport,
            rpc,
            pending: Vec::new(),
        }
    }

    fn send(&mut self, dest: NetworkAddress, params: PTransmitRuntimeFilterParams, timeout: Duration) {
        let filter_id = params.filter_id;
        let call = self.transport.transmit_runtime_filter(&dest, params);
        let task = self.rpc.spawn(async move {
            match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
            }
        });
        self.pending.push(PendingRpc {
            dest,
            filter_id,
            task,
        });
    }

    fn join(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        let mut targets = Vec::with_capacity(pending.len());
        let mut tasks = Vec::with_capacity(pending.len());
        for rpc in pending {
            targets.push((rpc.dest, rpc.filter_id));
            tasks.push(rpc.task);
        }
        let results = match self.rpc.block_on(futures::future::join_all(tasks)) {
            Ok(results) => results,
            Err(err) => {
                warn!("join runtime filter rpcs failed: err={}", err);
                return;
            }
        };
        for ((dest, filter_id), result) in targets.into_iter().zip(results) {
            match result {
                Ok(Ok(resp)) if resp.is_ok() => {}
                Ok(Ok(resp)) => warn!(
                    "transmit runtime filter rejected: dest={} filter_id={:?} status={:?}",
                    dest, filter_id, resp.status
                ),
                Ok(Err(err)) => warn!(
                    "transmit runtime filter failed: dest={} filter_id={:?} err={}",
                    dest, filter_id, err
                ),
                Err(err) => warn!(
                    "transmit runtime filter task aborted: dest={} filter_id={:?} err={}",
                    dest, filter_id, err
                ),
            }
        }
    }
}

impl Drop for RpcBatch<'_> {
    fn drop(&mut self) {
        self.join();
    }
}

fn message_ids(params: &PTransmitRuntimeFilterParams) -> Option<(QueryId, FilterId)> {
    let query_id = params.query_id.as_ref().map(QueryId::from)?;
    Some((query_id, params.filter_id?))
}

struct RuntimeFilterWorkerLoop {
    ctx: RuntimeFilterWorkerContext,
    rpc: RpcRuntime,
    mergers: HashMap<QueryId, RuntimeFilterMerger>,
}

impl RuntimeFilterWorkerLoop {
    fn new(ctx: RuntimeFilterWorkerContext, rpc: RpcRuntime) -> Self {
        Self {
            ctx,
            rpc,
            mergers: HashMap::new(),
        }
    }

    fn rpc_batch(&self) -> RpcBatch<'_> {
        RpcBatch::new(&self.ctx.transport, &self.rpc)
    }

    fn run(&mut self, queue: &RuntimeFilterEventQueue) {
        info!("runtime filter worker started: local={}", self.ctx.local_address);
        while let Some(event) = queue.blocking_get() {
            self.dispatch(event);
        }
        info!("runtime filter worker stopped: local={}", self.ctx.local_address);
    }

    fn dispatch(&mut self, event: RuntimeFilterWorkerEvent) {
        match event {
            RuntimeFilterWorkerEvent::OpenQuery {
                query_id,
                query_options,
                params,
                is_pipeline,
            } => self.open_query(query_id, &query_options, &params, is_pipeline),
            RuntimeFilterWorkerEvent::CloseQuery { query_id } => self.close_query(query_id),
            RuntimeFilterWorkerEvent::ReceivePartRf { params } => {
                self.receive_part_runtime_filter(&params)
            }
            RuntimeFilterWorkerEvent::ReceiveTotalRf { params } => {
                self.receive_total_runtime_filter(params)
            }
            RuntimeFilterWorkerEvent::SendPartRf {
                params,
                addrs,
                timeout,
            } => self.send_part_runtime_filter(&params, addrs, timeout),
            RuntimeFilterWorkerEvent::SendBroadcastGrf {
                params,
                destinations,
                timeout,
            } => self.send_broadcast_runtime_filter(params, destinations, timeout),
        }
    }

    fn open_query(
        &mut self,
        query_id: QueryId,
        query_options: &RuntimeFilterQueryOptions,
        params: &RuntimeFilterParams,
        is_pipeline: bool,
    ) {
        if self.mergers.contains_key(&query_id) {
            debug!(
                "runtime filter merger already exists, skip open: query_id={}",
                query_id
            );
            return;
        }
        let mut merger = RuntimeFilterMerger::new(
            query_id,
            query_options,
            is_pipeline,
            self.ctx.options.send_rpc_timeout,
        );
        merger.init(params);
        self.mergers.insert(query_id, merger);
    }

    fn close_query(&mut self, query_id: QueryId) {
        let had_merger = self.mergers.remove(&query_id).is_some();
        let cached = self.ctx.cache.remove_query(query_id);
        self.ctx.events.clear_query(query_id);
        debug!(
            "runtime filter query closed: query_id={} had_merger={} cached={}",
            query_id, had_merger, cached
        );
    }

    fn receive_part_runtime_filter(&mut self, params: &PTransmitRuntimeFilterParams) {
        let Some((query_id, filter_id)) = message_ids(params) else {
            warn!("partial runtime filter without query or filter id");
            return;
        };
        self.ctx.events.record(
            query_id,
            filter_id,
            &self.ctx.local_address,
            RuntimeFilterEventKind::RecvPartRf,
        );
        let Some(merger) = self.mergers.get_mut(&query_id) else {
            debug!(
                "no runtime filter merger, drop partial: query_id={} filter_id={}",
                query_id, filter_id
            );
            return;
        };
        let be_number = params.build_be_number.unwrap_or(0);
        let data = params.data.as_deref().unwrap_or(&[]);
        let outcome = merger.merge_runtime_filter(filter_id, be_number, data);
        match outcome {
            MergeOutcome::Completed(total) => self.send_total_runtime_filter(query_id, total),
            MergeOutcome::Stopped => self.ctx.events.record(
                query_id,
                filter_id,
                &self.ctx.local_address,
                RuntimeFilterEventKind::DropSizeExceeded,
            ),
            MergeOutcome::Accepted => {}
            MergeOutcome::Discarded(reason) => {
                debug!(
                    "partial runtime filter discarded: query_id={} filter_id={} build_be={} reason={}",
                    query_id, filter_id, be_number, reason
                )
            }
        }
    }

    fn send_total_runtime_filter(&self, query_id: QueryId, total: MergedRuntimeFilter) {
        debug!(
            "send total runtime filter: query_id={} filter_id={:?} destinations={}",
            query_id,
            total.params.filter_id,
            total.destinations.len()
        );
        let MergedRuntimeFilter {
            params,
            filter,
            destinations,
            timeout,
        } = total;
        self.distribute(DistributionOrigin::Merge, params, &filter, destinations, timeout);
    }

    fn receive_total_runtime_filter(&self, params: PTransmitRuntimeFilterParams) {
        let Some((query_id, filter_id)) = message_ids(&params) else {
            warn!("total runtime filter without query or filter id");
            return;
        };
        self.ctx.events.record(
            query_id,
            filter_id,
            &self.ctx.local_address,
            RuntimeFilterEventKind::RecvTotalRf,
        );
        let now = now_millis();
        debug!(
            "runtime filter receive total: query_id={} filter_id={} since_send_ms={:?} since_broadcast_ms={:?}",
            query_id,
            filter_id,
            params.send_timestamp.map(|ts| now - ts),
            params.broadcast_timestamp.map(|ts| now - ts)
        );
        let filter = match JoinRuntimeFilter::deserialize(params.data.as_deref().unwrap_or(&[])) {
            Ok(filter) => Arc::new(filter),
            Err(err) => {
                warn!(
                    "drop undecodable total runtime filter: query_id={} filter_id={} err={}",
                    query_id, filter_id, err
                );
                return;
            }
        };
        let finst_ids: Vec<FragmentInstanceId> =
            params.probe_finst_ids.iter().map(Into::into).collect();
        self.deliver_local(query_id, filter_id, &filter, &finst_ids);

        let forward: Vec<RuntimeFilterDestination> = params
            .forward_targets
            .iter()
            .filter_map(RuntimeFilterDestination::from_forward_target)
            .collect();
        if forward.is_empty() {
            return;
        }
        let mut base = params;
        base.forward_targets = Vec::new();
        base.probe_finst_ids = Vec::new();
        self.distribute(
            DistributionOrigin::Forward,
            base,
            &filter,
            forward,
            self.ctx.options.send_rpc_timeout,
        );
    }

    fn send_part_runtime_filter(
        &self,
        params: &PTransmitRuntimeFilterParams,
        addrs: Vec<NetworkAddress>,
        timeout: Duration,
    ) {
        let Some((query_id, filter_id)) = message_ids(params) else {
            warn!("partial runtime filter to send without query or filter id");
            return;
        };
        let mut batch = self.rpc_batch();
        for addr in addrs {
            let mut request = params.clone();
            request.send_timestamp = Some(now_millis());
            self.ctx
                .events
                .record(query_id, filter_id, &addr, RuntimeFilterEventKind::SendPartRf);
            batch.send(addr, request, timeout);
        }
    }

    fn send_broadcast_runtime_filter(
        &self,
        mut params: PTransmitRuntimeFilterParams,
        destinations: Vec<RuntimeFilterDestination>,
        timeout: Duration,
    ) {
        let Some((query_id, filter_id)) = message_ids(&params) else {
            warn!("broadcast runtime filter without query or filter id");
            return;
        };
        let filter = match JoinRuntimeFilter::deserialize(params.data.as_deref().unwrap_or(&[])) {
            Ok(filter) => Arc::new(filter),
            Err(err) => {
                warn!(
                    "drop undecodable broadcast runtime filter: query_id={} filter_id={} err={}",
                    query_id, filter_id, err
                );
                return;
            }
        };
        params.is_partial = Some(false);
        params.build_be_number = None;
        if params.broadcast_timestamp.is_none() {
            params.broadcast_timestamp = Some(now_millis());
        }
        self.distribute(
            DistributionOrigin::Broadcast,
            params,
            &filter,
            destinations,
            timeout,
        );
    }

    /// Push a total filter to `destinations`. The local address is served
    /// in-process before any RPC is issued.
    fn distribute(
        &self,
        origin: DistributionOrigin,
        base: PTransmitRuntimeFilterParams,
        filter: &Arc<JoinRuntimeFilter>,
        destinations: Vec<RuntimeFilterDestination>,
        timeout: Duration,
    ) {
        let Some((query_id, filter_id)) = message_ids(&base) else {
            return;
        };
        let mut destinations = coalesce_destinations(destinations);
        if let Some(local) = take_local_destination(&mut destinations, &self.ctx.local_address) {
            self.deliver_local(query_id, filter_id, filter, &local.finst_ids);
        }
        if destinations.is_empty() {
            return;
        }
        if origin == DistributionOrigin::Broadcast {
            destinations.shuffle(&mut rand::thread_rng());
        }

        let payload_len = base.data.as_ref().map_or(0, |data| data.len());
        let mode = DeliveryMode::for_payload(payload_len, self.ctx.options.passthrough_bytes_limit);
        let kind = origin.event_kind(mode);
        match mode {
            DeliveryMode::Passthrough => {
                for wave in passthrough_waves(&destinations, self.ctx.options.passthrough_inflight_num)
                {
                    let mut batch = self.rpc_batch();
                    for dest in wave {
                        let mut request = base.clone();
                        request.probe_finst_ids = dest.probe_finst_ids();
                        request.forward_targets = Vec::new();
                        request.send_timestamp = Some(now_millis());
                        self.ctx
                            .events
                            .record(query_id, filter_id, &dest.address, kind);
                        batch.send(dest.address.clone(), request, timeout);
                    }
                    batch.join();
                }
            }
            DeliveryMode::Relay => {
                let mut batch = self.rpc_batch();
                for hop in relay_hops(&destinations) {
                    let mut request = base.clone();
                    request.probe_finst_ids = hop.target.probe_finst_ids();
                    request.forward_targets = hop
                        .forward
                        .iter()
                        .map(RuntimeFilterDestination::to_forward_target)
                        .collect();
                    request.send_timestamp = Some(now_millis());
                    self.ctx
                        .events
                        .record(query_id, filter_id, &hop.target.address, kind);
                    batch.send(hop.target.address.clone(), request, timeout);
                }
            }
        }
    }

    /// Hand a total filter to local fragment instances. A filter that beats
    /// its consumer's registration is parked in the arrival cache, and the
    /// lookup is repeated once.
    fn deliver_local(
        &self,
        query_id: QueryId,
        filter_id: FilterId,
        filter: &Arc<JoinRuntimeFilter>,
        finst_ids: &[FragmentInstanceId],
    ) {
        self.ctx.events.record(
            query_id,
            filter_id,
            &self.ctx.local_address,
            RuntimeFilterEventKind::DeliverLocal,
        );
        let query_ctx = match self.ctx.query_contexts.get(query_id) {
            Some(query_ctx) => query_ctx,
            None => {
                self.park_in_cache(query_id, filter_id, filter);
                match self.ctx.query_contexts.get(query_id) {
                    Some(query_ctx) => query_ctx,
                    None => return,
                }
            }
        };
        if query_ctx.has_no_active_instances() || query_ctx.is_query_expired() {
            debug!(
                "query finished, skip runtime filter delivery: query_id={} filter_id={}",
                query_id, filter_id
            );
            return;
        }
        for finst_id in finst_ids {
            let fragment = match query_ctx.get_fragment(*finst_id) {
                Some(fragment) => fragment,
                None => {
                    self.park_in_cache(query_id, filter_id, filter);
                    match query_ctx.get_fragment(*finst_id) {
                        Some(fragment) => fragment,
                        None => continue,
                    }
                }
            };
            if fragment.is_canceled() {
                continue;
            }
            fragment
                .runtime_filter_port()
                .receive_runtime_filter(filter_id, Arc::clone(filter));
        }
    }

    fn park_in_cache(&self, query_id: QueryId, filter_id: FilterId, filter: &Arc<JoinRuntimeFilter>) {
        if self
            .ctx
            .cache
            .put_if_absent(query_id, filter_id, Arc::clone(filter))
        {
            self.ctx.events.record(
                query_id,
                filter_id,
                &self.ctx.local_address,
                RuntimeFilterEventKind::Cache,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    use futures::future::BoxFuture;

    use super::*;
    use crate::runtime::query_context::FragmentContext;
    use crate::runtime::runtime_filter_merger::RuntimeFilterProberParams;
    use crate::runtime::runtime_filter_port::{RuntimeFilterPort, RuntimeFilterProbe};
    use crate::service::proto::{PTransmitRuntimeFilterForwardTarget, PUniqueId};

    const FILTER_ID: FilterId = 5;

    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<(NetworkAddress, PTransmitRuntimeFilterParams)>>,
        fail: AtomicBool,
    }

    impl RecordingTransport {
        fn calls(&self) -> Vec<(NetworkAddress, PTransmitRuntimeFilterParams)> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    impl RuntimeFilterTransport for RecordingTransport {
        fn transmit_runtime_filter(
            &self,
            dest: &NetworkAddress,
            params: PTransmitRuntimeFilterParams,
        ) -> BoxFuture<'static, Result<PTransmitRuntimeFilterResult, String>> {
            let filter_id = params.filter_id.unwrap_or_default();
            self.calls
                .lock()
                .expect("calls lock")
                .push((dest.clone(), params));
            let fail = self.fail.load(Ordering::Acquire);
            Box::pin(async move {
                if fail {
                    Err("injected failure".to_string())
                } else {
                    Ok(PTransmitRuntimeFilterResult::ok(filter_id))
                }
            })
        }
    }

    struct Harness {
        worker: RuntimeFilterWorker,
        transport: Arc<RecordingTransport>,
        query_contexts: Arc<QueryContextManager>,
        cache: Arc<RuntimeFilterCache>,
        events: Arc<RuntimeFilterEventLog>,
    }

    fn local() -> NetworkAddress {
        NetworkAddress::new("self", 8060)
    }

    fn remote(i: usize) -> NetworkAddress {
        NetworkAddress::new(&format!("be{i}"), 8060)
    }

    fn query_id() -> QueryId {
        QueryId::new(100, 1)
    }

    fn finst(lo: i64) -> FragmentInstanceId {
        FragmentInstanceId::new(100, lo)
    }

    fn harness(passthrough_bytes_limit: usize, inflight: usize) -> Harness {
        let transport = Arc::new(RecordingTransport::default());
        let query_contexts = Arc::new(QueryContextManager::new());
        let cache = Arc::new(RuntimeFilterCache::new(64, Duration::from_secs(60)));
        let events = Arc::new(RuntimeFilterEventLog::new(256));
        let worker = RuntimeFilterWorker::start(RuntimeFilterWorkerContext {
            local_address: local(),
            options: RuntimeFilterOptions {
                send_rpc_timeout: Duration::from_millis(500),
                passthrough_bytes_limit,
                passthrough_inflight_num: inflight,
                rpc_worker_threads: 2,
            },
            query_contexts: Arc::clone(&query_contexts),
            cache: Arc::clone(&cache),
            events: Arc::clone(&events),
            transport: Arc::clone(&transport) as Arc<dyn RuntimeFilterTransport>,
        })
        .expect("start worker");
        Harness {
            worker,
            transport,
            query_contexts,
            cache,
            events,
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn register_probe(h: &Harness, lo: i64) -> RuntimeFilterProbe {
        let port = Arc::new(RuntimeFilterPort::detached(
            query_id(),
            finst(lo),
            Arc::clone(&h.cache),
        ));
        let probe = RuntimeFilterProbe::new(FILTER_ID);
        port.add_listener(probe.clone());
        let ctx = h
            .query_contexts
            .get_or_register(query_id(), Duration::from_secs(60));
        ctx.register_fragment(Arc::new(FragmentContext::new(finst(lo), port)));
        probe
    }

    fn partial(be_number: i32, keys: std::ops::Range<i64>) -> PTransmitRuntimeFilterParams {
        let mut filter = JoinRuntimeFilter::with_expected_rows(64);
        for key in keys {
            filter.insert(key);
        }
        PTransmitRuntimeFilterParams {
            is_partial: Some(true),
            query_id: Some(PUniqueId::from(query_id())),
            filter_id: Some(FILTER_ID),
            data: Some(filter.serialize().into()),
            build_be_number: Some(be_number),
            ..Default::default()
        }
    }

    fn total(keys: std::ops::Range<i64>) -> PTransmitRuntimeFilterParams {
        PTransmitRuntimeFilterParams {
            is_partial: Some(false),
            ..partial(0, keys)
        }
    }

    fn merge_params(senders: usize, remotes: usize) -> RuntimeFilterParams {
        let mut probers = vec![RuntimeFilterProberParams {
            fragment_instance_id: finst(1),
            fragment_instance_address: local(),
        }];
        for i in 0..remotes {
            probers.push(RuntimeFilterProberParams {
                fragment_instance_id: finst(10 + i as i64),
                fragment_instance_address: remote(i),
            });
        }
        let mut params = RuntimeFilterParams::default();
        params.id_to_prober_params.insert(FILTER_ID, probers);
        params.runtime_filter_builder_number.insert(FILTER_ID, senders);
        params
    }

    #[test]
    fn events_after_shutdown_are_dropped() {
        let h = harness(1 << 20, 4);
        let handle = h.worker.handle();
        assert!(handle.close_query(query_id()));
        h.worker.shutdown();
        h.worker.shutdown();
        assert!(!handle.close_query(query_id()));
        assert_eq!(handle.queue_len(), 0);
    }

    #[test]
    fn merged_filter_reaches_local_and_remote_probers() {
        let h = harness(1 << 20, 2);
        let probe = register_probe(&h, 1);
        let handle = h.worker.handle();
        handle.open_query(query_id(), RuntimeFilterQueryOptions::default(), merge_params(2, 3), true);
        handle.receive_runtime_filter(partial(1, 0..10));
        handle.receive_runtime_filter(partial(1, 0..10));
        handle.receive_runtime_filter(partial(2, 50..60));

        assert!(wait_for(|| probe.is_ready() && h.transport.calls().len() == 3));
        let filter = probe.runtime_filter().expect("filter");
        assert!(filter.test(5) && filter.test(55));

        let calls = h.transport.calls();
        assert!(calls.iter().all(|(dest, _)| dest != &local()));
        for (dest, params) in &calls {
            assert_eq!(params.is_partial, Some(false));
            assert!(params.forward_targets.is_empty());
            assert!(params.send_timestamp.is_some());
            let i: usize = dest.hostname[2..].parse().expect("remote index");
            assert_eq!(params.probe_finst_ids, vec![PUniqueId::from(finst(10 + i as i64))]);
        }
        let kinds: Vec<_> = h
            .events
            .events_for_query(query_id())
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert!(kinds.contains(&RuntimeFilterEventKind::DeliverLocal));
        assert_eq!(
            kinds
                .iter()
                .filter(|k| **k == RuntimeFilterEventKind::SendTotalRfRpc)
                .count(),
            3
        );
    }

    #[test]
    fn large_filter_is_relayed_through_halving_hops() {
        let h = harness(0, 2);
        let handle = h.worker.handle();
        let destinations: Vec<_> = (0..7)
            .map(|i| RuntimeFilterDestination::new(remote(i), vec![finst(10 + i as i64)]))
            .collect();
        handle.send_broadcast_runtime_filter(total(0..10), destinations, Duration::from_secs(1));

        assert!(wait_for(|| h.transport.calls().len() == 3));
        let calls = h.transport.calls();
        let covered: usize = calls
            .iter()
            .map(|(_, params)| 1 + params.forward_targets.len())
            .sum();
        assert_eq!(covered, 7);
        let mut forward_lens: Vec<_> = calls
            .iter()
            .map(|(_, params)| params.forward_targets.len())
            .collect();
        forward_lens.sort_unstable();
        assert_eq!(forward_lens, vec![0, 1, 3]);
        assert!(calls.iter().all(|(_, p)| p.broadcast_timestamp.is_some()));
    }

    #[test]
    fn relay_hop_delivers_locally_and_forwards_the_rest() {
        let h = harness(0, 2);
        let probe = register_probe(&h, 1);
        let mut params = total(0..10);
        params.probe_finst_ids = vec![PUniqueId::from(finst(1))];
        params.forward_targets = (0..3)
            .map(|i| PTransmitRuntimeFilterForwardTarget {
                host: Some(format!("be{i}")),
                port: Some(8060),
                probe_finst_ids: vec![PUniqueId::from(finst(10 + i))],
            })
            .collect();
        h.worker.handle().receive_runtime_filter(params);

        assert!(wait_for(|| probe.is_ready() && h.transport.calls().len() == 2));
        let calls = h.transport.calls();
        assert_eq!(calls[0].0, remote(0));
        assert_eq!(calls[0].1.forward_targets.len(), 1);
        assert_eq!(calls[1].0, remote(2));
        assert!(calls[1].1.forward_targets.is_empty());
    }

    #[test]
    fn filter_arriving_before_query_is_cached() {
        let h = harness(1 << 20, 2);
        let mut params = total(0..10);
        params.probe_finst_ids = vec![PUniqueId::from(finst(1))];
        h.worker.handle().receive_runtime_filter(params);
        assert!(wait_for(|| h.cache.get(query_id(), FILTER_ID).is_some()));

        let probe = register_probe(&h, 1);
        assert!(probe.runtime_filter().expect("filter").test(3));
    }

    fn total_for(lo: &[i64]) -> PTransmitRuntimeFilterParams {
        let mut params = total(0..10);
        params.probe_finst_ids = lo.iter().map(|lo| PUniqueId::from(finst(*lo))).collect();
        params
    }

    #[test]
    fn expired_query_is_neither_delivered_nor_cached() {
        let h = harness(1 << 20, 2);
        let probe = register_probe(&h, 1);
        // replace the query with one that expires at once
        h.query_contexts.remove(query_id());
        let ctx = h
            .query_contexts
            .get_or_register(query_id(), Duration::from_millis(1));
        let port = Arc::new(RuntimeFilterPort::detached(
            query_id(),
            finst(2),
            Arc::clone(&h.cache),
        ));
        let late = RuntimeFilterProbe::new(FILTER_ID);
        port.add_listener(late.clone());
        ctx.register_fragment(Arc::new(FragmentContext::new(finst(2), port)));
        std::thread::sleep(Duration::from_millis(10));
        assert!(ctx.is_query_expired());

        h.worker.handle().receive_runtime_filter(total_for(&[1, 2]));
        h.worker.shutdown();
        assert!(!probe.is_ready());
        assert!(!late.is_ready());
        assert!(h.cache.get(query_id(), FILTER_ID).is_none());
    }

    #[test]
    fn finished_query_is_neither_delivered_nor_cached() {
        let h = harness(1 << 20, 2);
        let probe = register_probe(&h, 1);
        let ctx = h.query_contexts.get(query_id()).expect("query context");
        assert!(ctx.finish_fragment(finst(1)));
        assert!(ctx.has_no_active_instances());

        h.worker.handle().receive_runtime_filter(total_for(&[1]));
        h.worker.shutdown();
        assert!(!probe.is_ready());
        assert!(h.cache.get(query_id(), FILTER_ID).is_none());
    }

    #[test]
    fn canceled_fragment_is_skipped_and_siblings_still_receive() {
        let h = harness(1 << 20, 2);
        let canceled = register_probe(&h, 1);
        let sibling = register_probe(&h, 2);
        h.query_contexts
            .get(query_id())
            .and_then(|ctx| ctx.get_fragment(finst(1)))
            .expect("fragment 1")
            .cancel();

        h.worker.handle().receive_runtime_filter(total_for(&[1, 2]));
        h.worker.shutdown();
        assert!(sibling.runtime_filter().expect("filter").test(3));
        assert!(!canceled.is_ready());
    }

    #[test]
    fn filter_for_unregistered_fragment_of_live_query_is_parked() {
        let h = harness(1 << 20, 2);
        let other = register_probe(&h, 1);

        h.worker.handle().receive_runtime_filter(total_for(&[2]));
        h.worker.shutdown();
        assert!(!other.is_ready());
        assert!(h.cache.get(query_id(), FILTER_ID).is_some());
        assert!(
            h.events
                .events_for_query(query_id())
                .iter()
                .any(|e| e.kind == RuntimeFilterEventKind::Cache)
        );

        let late = register_probe(&h, 2);
        assert!(late.runtime_filter().expect("filter").test(7));
    }

    #[test]
    fn part_filter_is_sent_to_every_merge_node() {
        let h = harness(1 << 20, 2);
        h.transport.fail.store(true, Ordering::Release);
        let addrs = vec![remote(0), remote(1), local()];
        h.worker
            .handle()
            .send_part_runtime_filter(partial(3, 0..4), addrs.clone(), Duration::from_millis(100));
        assert!(wait_for(|| h.transport.calls().len() == 3));
        let sent: Vec<_> = h.transport.calls().into_iter().map(|(dest, _)| dest).collect();
        assert_eq!(sent, addrs);

        // the worker keeps running after failed rpcs
        h.transport.fail.store(false, Ordering::Release);
        h.worker
            .handle()
            .send_part_runtime_filter(partial(3, 0..4), vec![remote(5)], Duration::from_millis(100));
        assert!(wait_for(|| h.transport.calls().len() == 4));
    }

    #[test]
    fn size_overflow_records_drop_event() {
        let h = harness(1 << 20, 2);
        let handle = h.worker.handle();
        let mut params = merge_params(2, 1);
        params.runtime_filter_max_size = 1;
        handle.open_query(query_id(), RuntimeFilterQueryOptions::default(), params, true);
        handle.receive_runtime_filter(partial(1, 0..10));
        assert!(wait_for(|| {
            h.events
                .events_for_query(query_id())
                .iter()
                .any(|e| e.kind == RuntimeFilterEventKind::DropSizeExceeded)
        }));
        handle.receive_runtime_filter(partial(2, 0..10));
        handle.close_query(query_id());
        h.worker.shutdown();
        assert!(h.transport.calls().is_empty());
    }
}
