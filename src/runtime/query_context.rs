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
//! Query and fragment-instance registry consulted by runtime filter delivery.
//!
//! Responsibilities:
//! - Tracks live queries on this backend and the fragment instances they run.
//! - Answers the liveness questions asked before a filter is delivered:
//!   does the query exist, does it still have active instances, has it expired,
//!   is a given instance canceled.
//!
//! Key exported interfaces:
//! - Types: `QueryContextManager`, `QueryContext`, `FragmentContext`.
//!
//! A fragment instance adds its listeners to its `RuntimeFilterPort` before
//! `QueryContext::register_fragment` makes it visible to delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::common::types::{FragmentInstanceId, QueryId};
use crate::rfrelay_logging::debug;
use crate::runtime::runtime_filter_port::RuntimeFilterPort;

const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 300;

pub struct FragmentContext {
    finst_id: FragmentInstanceId,
    canceled: AtomicBool,
    runtime_filter_port: Arc<RuntimeFilterPort>,
}

impl FragmentContext {
    pub fn new(finst_id: FragmentInstanceId, runtime_filter_port: Arc<RuntimeFilterPort>) -> Self {
        Self {
            finst_id,
            canceled: AtomicBool::new(false),
            runtime_filter_port,
        }
    }

    pub fn finst_id(&self) -> FragmentInstanceId {
        self.finst_id
    }

    pub fn runtime_filter_port(&self) -> &Arc<RuntimeFilterPort> {
        &self.runtime_filter_port
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

pub struct QueryContext {
    inner: Mutex<QueryContextInner>,
}

struct QueryContextInner {
    fragments: HashMap<FragmentInstanceId, Arc<FragmentContext>>,
    num_fragments: usize,
    query_deadline: Instant,
    cancelled: bool,
}

impl QueryContext {
    fn new(query_expire: Duration) -> Self {
        Self {
            inner: Mutex::new(QueryContextInner {
                fragments: HashMap::new(),
                num_fragments: 0,
                query_deadline: Instant::now() + query_expire,
                cancelled: false,
            }),
        }
    }

    /// Make an instance visible to delivery. Returns false for a duplicate id.
    ///
    /// Filters parked in the arrival cache before the instance became visible
    /// are pulled into its port afterwards.
    pub fn register_fragment(&self, fragment: Arc<FragmentContext>) -> bool {
        {
            let mut inner = self.inner.lock().expect("query context lock");
            if inner.fragments.contains_key(&fragment.finst_id()) {
                return false;
            }
            if inner.cancelled {
                fragment.cancel();
            }
            inner.num_fragments += 1;
            inner
                .fragments
                .insert(fragment.finst_id(), Arc::clone(&fragment));
        }
        fragment.runtime_filter_port().poll_arrival_cache();
        true
    }

    pub fn get_fragment(&self, finst_id: FragmentInstanceId) -> Option<Arc<FragmentContext>> {
        let inner = self.inner.lock().expect("query context lock");
        inner.fragments.get(&finst_id).cloned()
    }

    /// Returns true when this was the last active instance.
    pub fn finish_fragment(&self, finst_id: FragmentInstanceId) -> bool {
        let mut inner = self.inner.lock().expect("query context lock");
        inner.fragments.remove(&finst_id);
        inner.fragments.is_empty()
    }

    #[cfg(test)]
    fn num_fragments(&self) -> usize {
        self.inner.lock().expect("query context lock").num_fragments
    }

    /// True once every instance registered so far has finished.
    pub fn has_no_active_instances(&self) -> bool {
        let inner = self.inner.lock().expect("query context lock");
        inner.num_fragments > 0 && inner.fragments.is_empty()
    }

    pub fn is_query_expired(&self) -> bool {
        Instant::now() >= self.inner.lock().expect("query context lock").query_deadline
    }

    pub fn cancel(&self) {
        let mut inner = self.inner.lock().expect("query context lock");
        inner.cancelled = true;
        for fragment in inner.fragments.values() {
            fragment.cancel();
        }
    }
}

#[derive(Default)]
pub struct QueryContextManager {
    inner: Mutex<HashMap<QueryId, Arc<QueryContext>>>,
}

impl QueryContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_register(&self, query_id: QueryId, query_expire: Duration) -> Arc<QueryContext> {
        let mut guard = self.inner.lock().expect("query_ctx_manager lock");
        Arc::clone(
            guard
                .entry(query_id)
                .or_insert_with(|| Arc::new(QueryContext::new(query_expire))),
        )
    }

    pub fn get(&self, query_id: QueryId) -> Option<Arc<QueryContext>> {
        let guard = self.inner.lock().expect("query_ctx_manager lock");
        guard.get(&query_id).cloned()
    }

    pub fn remove(&self, query_id: QueryId) -> Option<Arc<QueryContext>> {
        let mut guard = self.inner.lock().expect("query_ctx_manager lock");
        guard.remove(&query_id)
    }

    /// Finish one instance and drop the query once no instance is left.
    pub fn finish_fragment(&self, query_id: QueryId, finst_id: FragmentInstanceId) -> bool {
        let mut guard = self.inner.lock().expect("query_ctx_manager lock");
        let Some(ctx) = guard.get(&query_id) else {
            return false;
        };
        if !ctx.finish_fragment(finst_id) {
            return false;
        }
        guard.remove(&query_id);
        debug!("query context released: query_id={}", query_id);
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("query_ctx_manager lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Query lifetime from the `query_timeout` option (seconds), defaulting to 300s.
pub fn query_expire_duration(query_timeout_secs: Option<i64>) -> Duration {
    let secs = query_timeout_secs
        .map(|v| v.max(1) as u64)
        .unwrap_or(DEFAULT_QUERY_TIMEOUT_SECS);
    Duration::from_secs(secs)
}
