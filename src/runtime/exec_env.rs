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
//! Process-scoped runtime filter context.
//!
//! An `ExecEnv` owns everything one backend process needs to take part in
//! runtime filter propagation: the query registry, the arrival cache, the
//! event log and the worker thread. Several can live in one process; each
//! behaves as an independent backend.

use std::sync::Arc;
use std::time::Duration;

use crate::common::app_config::{AppConfig, RuntimeFilterConfig};
use crate::common::types::{FragmentInstanceId, NetworkAddress, QueryId, SenderId};
use crate::rfrelay_logging::info;
use crate::runtime::query_context::{FragmentContext, QueryContextManager, query_expire_duration};
use crate::runtime::runtime_filter_cache::RuntimeFilterCache;
use crate::runtime::runtime_filter_events::RuntimeFilterEventLog;
use crate::runtime::runtime_filter_merger::RuntimeFilterQueryOptions;
use crate::runtime::runtime_filter_port::{RuntimeFilterPort, RuntimeFilterPublisher};
use crate::runtime::runtime_filter_worker::{
    RuntimeFilterOptions, RuntimeFilterWorker, RuntimeFilterWorkerContext,
    RuntimeFilterWorkerHandle,
};
use crate::service::grpc_client::{GrpcRuntimeFilterTransport, RuntimeFilterTransport};

#[derive(Clone, Debug)]
pub struct ExecEnvOptions {
    pub local_address: NetworkAddress,
    pub be_number: SenderId,
    pub runtime_filter: RuntimeFilterOptions,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    /// 0 disables the event log.
    pub event_log_capacity: usize,
}

impl ExecEnvOptions {
    pub fn new(local_address: NetworkAddress, be_number: SenderId) -> Self {
        Self::with_runtime_filter_config(local_address, be_number, &RuntimeFilterConfig::default())
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::with_runtime_filter_config(
            NetworkAddress::new(&cfg.server.host, cfg.server.brpc_port),
            cfg.server.be_number,
            &cfg.runtime_filter,
        )
    }

    fn with_runtime_filter_config(
        local_address: NetworkAddress,
        be_number: SenderId,
        cfg: &RuntimeFilterConfig,
    ) -> Self {
        Self {
            local_address,
            be_number,
            runtime_filter: RuntimeFilterOptions::from_config(cfg),
            cache_capacity: cfg.cache_capacity,
            cache_ttl: Duration::from_secs(cfg.cache_ttl_seconds),
            event_log_capacity: cfg.event_log_capacity,
        }
    }
}

pub struct ExecEnv {
    options: ExecEnvOptions,
    query_contexts: Arc<QueryContextManager>,
    cache: Arc<RuntimeFilterCache>,
    events: Arc<RuntimeFilterEventLog>,
    worker: RuntimeFilterWorker,
}

impl ExecEnv {
    /// Build the context and start its worker thread.
    pub fn new(
        options: ExecEnvOptions,
        transport: Arc<dyn RuntimeFilterTransport>,
    ) -> Result<Arc<Self>, String> {
        let query_contexts = Arc::new(QueryContextManager::new());
        let cache = Arc::new(RuntimeFilterCache::new(
            options.cache_capacity,
            options.cache_ttl,
        ));
        let events = Arc::new(RuntimeFilterEventLog::new(options.event_log_capacity));
        let worker = RuntimeFilterWorker::start(RuntimeFilterWorkerContext {
            local_address: options.local_address.clone(),
            options: options.runtime_filter.clone(),
            query_contexts: Arc::clone(&query_contexts),
            cache: Arc::clone(&cache),
            events: Arc::clone(&events),
            transport,
        })?;
        info!(
            "runtime filter exec env started: local={} be_number={} passthrough_bytes_limit={} passthrough_inflight_num={}",
            options.local_address,
            options.be_number,
            options.runtime_filter.passthrough_bytes_limit,
            options.runtime_filter.passthrough_inflight_num
        );
        Ok(Arc::new(Self {
            options,
            query_contexts,
            cache,
            events,
            worker,
        }))
    }

    /// Context talking to peers over gRPC, configured from `cfg`.
    pub fn from_config(cfg: &AppConfig) -> Result<Arc<Self>, String> {
        Self::new(
            ExecEnvOptions::from_config(cfg),
            Arc::new(GrpcRuntimeFilterTransport::new()),
        )
    }

    pub fn options(&self) -> &ExecEnvOptions {
        &self.options
    }

    pub fn local_address(&self) -> &NetworkAddress {
        &self.options.local_address
    }

    pub fn query_contexts(&self) -> &Arc<QueryContextManager> {
        &self.query_contexts
    }

    pub fn runtime_filter_cache(&self) -> &Arc<RuntimeFilterCache> {
        &self.cache
    }

    pub fn runtime_filter_events(&self) -> &Arc<RuntimeFilterEventLog> {
        &self.events
    }

    pub fn runtime_filter_worker(&self) -> RuntimeFilterWorkerHandle {
        self.worker.handle()
    }

    pub fn create_runtime_filter_port(
        &self,
        query_id: QueryId,
        finst_id: FragmentInstanceId,
    ) -> Arc<RuntimeFilterPort> {
        Arc::new(RuntimeFilterPort::new(
            query_id,
            finst_id,
            Arc::clone(&self.cache),
            RuntimeFilterPublisher {
                worker: self.worker.handle(),
                events: Arc::clone(&self.events),
                local_address: self.options.local_address.clone(),
                be_number: self.options.be_number,
                send_timeout: self.options.runtime_filter.send_rpc_timeout,
                passthrough_bytes_limit: self.options.runtime_filter.passthrough_bytes_limit,
            },
        ))
    }

    /// Make a fragment instance visible to runtime filter delivery. Listeners
    /// must already be on `port`.
    pub fn register_fragment(
        &self,
        query_options: &RuntimeFilterQueryOptions,
        port: Arc<RuntimeFilterPort>,
    ) -> Result<Arc<FragmentContext>, String> {
        let query_id = port.query_id();
        let finst_id = port.finst_id();
        let query_ctx = self
            .query_contexts
            .get_or_register(query_id, query_expire_duration(query_options.query_timeout));
        let fragment = Arc::new(FragmentContext::new(finst_id, port));
        if !query_ctx.register_fragment(Arc::clone(&fragment)) {
            return Err(format!(
                "fragment instance {finst_id} already registered for query {query_id}"
            ));
        }
        Ok(fragment)
    }

    /// Returns true when this was the query's last active instance.
    pub fn finish_fragment(&self, query_id: QueryId, finst_id: FragmentInstanceId) -> bool {
        self.query_contexts.finish_fragment(query_id, finst_id)
    }

    /// Stop the worker after it drained its queue. Idempotent.
    pub fn shutdown(&self) {
        self.worker.shutdown();
    }
}
