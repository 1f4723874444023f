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
//! Per-process cache of total runtime filters that arrived before their consumers.
//!
//! Responsibilities:
//! - Holds filters keyed by `(query_id, filter_id)` until a fragment registers a listener.
//! - Bounds memory by entry count and by a time-to-live measured from insertion.
//!
//! Lookups do not consume entries: several fragment instances of one query on
//! this backend may probe the same filter. Entries leave by TTL, by capacity
//! eviction (oldest first) or when the query closes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::common::types::{FilterId, QueryId};
use crate::exec::runtime_filter::JoinRuntimeFilter;

type CacheKey = (QueryId, FilterId);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeFilterCacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub evictions: u64,
}

pub struct RuntimeFilterCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    ttl: Duration,
}

struct CachedFilter {
    filter: Arc<JoinRuntimeFilter>,
    expire_at: Instant,
    seq: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<CacheKey, CachedFilter>,
    // Insertion order; stale (key, seq) pairs are skipped on eviction.
    order: VecDeque<(CacheKey, u64)>,
    next_seq: u64,
    evictions: u64,
}

impl RuntimeFilterCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Returns false when a live entry for the key already exists.
    pub fn put_if_absent(
        &self,
        query_id: QueryId,
        filter_id: FilterId,
        filter: Arc<JoinRuntimeFilter>,
    ) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("runtime filter cache lock");
        inner.purge_expired(now);
        let key = (query_id, filter_id);
        if inner.entries.contains_key(&key) {
            return false;
        }
        while inner.entries.len() >= self.capacity {
            if !inner.evict_oldest() {
                break;
            }
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.push_back((key, seq));
        inner.entries.insert(
            key,
            CachedFilter {
                filter,
                expire_at: now + self.ttl,
                seq,
            },
        );
        true
    }

    pub fn get(&self, query_id: QueryId, filter_id: FilterId) -> Option<Arc<JoinRuntimeFilter>> {
        let now = Instant::now();
        let inner = self.inner.lock().expect("runtime filter cache lock");
        inner
            .entries
            .get(&(query_id, filter_id))
            .filter(|entry| entry.expire_at > now)
            .map(|entry| Arc::clone(&entry.filter))
    }

    /// Drop every entry of a finished query. Returns how many were removed.
    pub fn remove_query(&self, query_id: QueryId) -> usize {
        let mut inner = self.inner.lock().expect("runtime filter cache lock");
        let before = inner.entries.len();
        inner.entries.retain(|(qid, _), _| *qid != query_id);
        let removed = before - inner.entries.len();
        if removed > 0 {
            let CacheInner { entries, order, .. } = &mut *inner;
            order.retain(|(key, seq)| entries.get(key).is_some_and(|e| e.seq == *seq));
        }
        removed
    }

    pub fn stats(&self) -> RuntimeFilterCacheStats {
        let inner = self.inner.lock().expect("runtime filter cache lock");
        RuntimeFilterCacheStats {
            entries: inner.entries.len(),
            capacity: self.capacity,
            evictions: inner.evictions,
        }
    }
}

impl CacheInner {
    fn purge_expired(&mut self, now: Instant) {
        while let Some((key, seq)) = self.order.front().copied() {
            let expired = match self.entries.get(&key) {
                Some(entry) if entry.seq == seq => entry.expire_at <= now,
                _ => true,
            };
            if !expired {
                break;
            }
            self.order.pop_front();
            if self.entries.get(&key).is_some_and(|e| e.seq == seq) {
                self.entries.remove(&key);
            }
        }
    }

    fn evict_oldest(&mut self) -> bool {
        while let Some((key, seq)) = self.order.pop_front() {
            if self.entries.get(&key).is_some_and(|e| e.seq == seq) {
                self.entries.remove(&key);
                self.evictions += 1;
                return true;
            }
        }
        false
    }
}
