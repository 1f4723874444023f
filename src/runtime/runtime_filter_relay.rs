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
//! Planning of total runtime filter distribution.
//!
//! Responsibilities:
//! - Coalesces destinations that share a backend address.
//! - Splits a destination list into relay hops (halving forward lists).
//! - Chooses passthrough or relay delivery from the payload size.
//!
//! Key exported interfaces:
//! - Types: `RuntimeFilterDestination`, `RelayHop`, `DeliveryMode`.
//! - Functions: `coalesce_destinations`, `build_relay_plan`, `relay_hops`, `passthrough_waves`.
//!
//! Everything here is pure; the worker turns the plan into RPCs.

use std::collections::BTreeMap;

use crate::common::types::{FragmentInstanceId, NetworkAddress};
use crate::service::proto::{PTransmitRuntimeFilterForwardTarget, PUniqueId};

/// One backend and the probe fragment instances waiting there.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeFilterDestination {
    pub address: NetworkAddress,
    pub finst_ids: Vec<FragmentInstanceId>,
}

impl RuntimeFilterDestination {
    pub fn new(address: NetworkAddress, finst_ids: Vec<FragmentInstanceId>) -> Self {
        Self { address, finst_ids }
    }

    pub fn probe_finst_ids(&self) -> Vec<PUniqueId> {
        self.finst_ids.iter().copied().map(PUniqueId::from).collect()
    }

    pub fn to_forward_target(&self) -> PTransmitRuntimeFilterForwardTarget {
        PTransmitRuntimeFilterForwardTarget {
            host: Some(self.address.hostname.clone()),
            port: Some(i32::from(self.address.port)),
            probe_finst_ids: self.probe_finst_ids(),
        }
    }

    /// Returns None when the target carries no usable address.
    pub fn from_forward_target(target: &PTransmitRuntimeFilterForwardTarget) -> Option<Self> {
        Some(Self {
            address: target.address()?,
            finst_ids: target.probe_finst_ids.iter().map(Into::into).collect(),
        })
    }
}

/// One direct RPC of a relay pass: `target` receives the filter and is asked
/// to continue distribution to `forward`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayHop {
    pub target: RuntimeFilterDestination,
    pub forward: Vec<RuntimeFilterDestination>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    Passthrough,
    Relay,
}

impl DeliveryMode {
    pub fn for_payload(payload_len: usize, passthrough_bytes_limit: usize) -> Self {
        if payload_len <= passthrough_bytes_limit {
            DeliveryMode::Passthrough
        } else {
            DeliveryMode::Relay
        }
    }
}

/// Merge destinations sharing an address, keeping each instance id once and
/// in first-seen order. The result is ordered by address.
pub fn coalesce_destinations(
    destinations: impl IntoIterator<Item = RuntimeFilterDestination>,
) -> Vec<RuntimeFilterDestination> {
    let mut by_address: BTreeMap<NetworkAddress, Vec<FragmentInstanceId>> = BTreeMap::new();
    for dest in destinations {
        let ids = by_address.entry(dest.address).or_default();
        for id in dest.finst_ids {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    by_address
        .into_iter()
        .map(|(address, finst_ids)| RuntimeFilterDestination { address, finst_ids })
        .collect()
}

/// Remove and return the destination at `local`, if present.
pub fn take_local_destination(
    destinations: &mut Vec<RuntimeFilterDestination>,
    local: &NetworkAddress,
) -> Option<RuntimeFilterDestination> {
    let pos = destinations.iter().position(|d| &d.address == local)?;
    Some(destinations.remove(pos))
}

/// Split off the first relay hop: the head destination receives the filter
/// and forwards to the next `len / 2` destinations; the rest is returned for
/// the caller to keep splitting.
pub fn build_relay_plan(
    destinations: &[RuntimeFilterDestination],
) -> Option<(RelayHop, &[RuntimeFilterDestination])> {
    let (first, rest) = destinations.split_first()?;
    let half = destinations.len() / 2;
    let (forward, remainder) = rest.split_at(half);
    Some((
        RelayHop {
            target: first.clone(),
            forward: forward.to_vec(),
        },
        remainder,
    ))
}

/// All direct hops the current node sends for `destinations`.
pub fn relay_hops(destinations: &[RuntimeFilterDestination]) -> Vec<RelayHop> {
    let mut hops = Vec::new();
    let mut remaining = destinations;
    while let Some((hop, rest)) = build_relay_plan(remaining) {
        hops.push(hop);
        remaining = rest;
    }
    hops
}

/// Batches of at most `inflight` destinations, sent and joined one at a time.
pub fn passthrough_waves(
    destinations: &[RuntimeFilterDestination],
    inflight: usize,
) -> std::slice::Chunks<'_, RuntimeFilterDestination> {
    destinations.chunks(inflight.max(1))
}
