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
//! Outbound runtime filter RPCs.
//!
//! `RuntimeFilterTransport` is the seam the worker dispatches through;
//! `GrpcRuntimeFilterTransport` speaks the backend internal service over tonic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tonic::transport::{Channel, Endpoint};

use crate::common::types::NetworkAddress;
use crate::rfrelay_logging::debug;
use crate::service::proto::{PTransmitRuntimeFilterParams, PTransmitRuntimeFilterResult};

const TRANSMIT_RUNTIME_FILTER_PATH: &str = "/starrocks.PInternalService/transmit_runtime_filter";
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Sends one runtime filter message to one backend.
///
/// The returned future must not borrow `self`: the worker spawns it onto the
/// RPC runtime and bounds it with its own timeout.
pub trait RuntimeFilterTransport: Send + Sync {
    fn transmit_runtime_filter(
        &self,
        dest: &NetworkAddress,
        params: PTransmitRuntimeFilterParams,
    ) -> BoxFuture<'static, Result<PTransmitRuntimeFilterResult, String>>;
}

/// tonic client with one lazily connected channel per backend. Clones share
/// the channel cache.
#[derive(Clone)]
pub struct GrpcRuntimeFilterTransport {
    inner: Arc<ChannelCache>,
}

struct ChannelCache {
    channels: Mutex<HashMap<NetworkAddress, Channel>>,
    keepalive: Duration,
    connect_timeout: Duration,
}

impl Default for GrpcRuntimeFilterTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl GrpcRuntimeFilterTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ChannelCache {
                channels: Mutex::new(HashMap::new()),
                keepalive: Duration::from_secs(60),
                connect_timeout: Duration::from_secs(10),
            }),
        }
    }

    #[cfg(test)]
    fn cached_channels(&self) -> usize {
        self.inner.channels.lock().expect("channel cache lock").len()
    }
}

impl ChannelCache {
    fn endpoint(&self, dest: &NetworkAddress) -> Result<Endpoint, String> {
        let endpoint = Endpoint::from_shared(format!("http://{}:{}", dest.hostname, dest.port))
            .map_err(|e| format!("invalid runtime filter endpoint {dest}: {e}"))?;
        Ok(endpoint
            .tcp_keepalive(Some(self.keepalive))
            .connect_timeout(self.connect_timeout))
    }

    /// Channels are lazy and must be created inside the RPC runtime.
    fn get_channel(&self, dest: &NetworkAddress) -> Result<Channel, String> {
        let mut channels = self.channels.lock().expect("channel cache lock");
        if let Some(channel) = channels.get(dest) {
            return Ok(channel.clone());
        }
        let channel = self.endpoint(dest)?.connect_lazy();
        debug!("runtime filter channel created: dest={}", dest);
        channels.insert(dest.clone(), channel.clone());
        Ok(channel)
    }

    fn evict_channel(&self, dest: &NetworkAddress) {
        self.channels
            .lock()
            .expect("channel cache lock")
            .remove(dest);
    }
}

async fn call_transmit_runtime_filter(
    channel: Channel,
    params: PTransmitRuntimeFilterParams,
) -> Result<PTransmitRuntimeFilterResult, tonic::Status> {
    let mut grpc = tonic::client::Grpc::new(channel)
        .max_encoding_message_size(MAX_MESSAGE_SIZE)
        .max_decoding_message_size(MAX_MESSAGE_SIZE);
    grpc.ready()
        .await
        .map_err(|e| tonic::Status::unavailable(format!("service not ready: {e}")))?;
    let codec =
        tonic::codec::ProstCodec::<PTransmitRuntimeFilterParams, PTransmitRuntimeFilterResult>::default();
    let path = http::uri::PathAndQuery::from_static(TRANSMIT_RUNTIME_FILTER_PATH);
    let resp = grpc.unary(tonic::Request::new(params), path, codec).await?;
    Ok(resp.into_inner())
}

impl RuntimeFilterTransport for GrpcRuntimeFilterTransport {
    fn transmit_runtime_filter(
        &self,
        dest: &NetworkAddress,
        params: PTransmitRuntimeFilterParams,
    ) -> BoxFuture<'static, Result<PTransmitRuntimeFilterResult, String>> {
        let cache = Arc::clone(&self.inner);
        let dest = dest.clone();
        Box::pin(async move {
            let channel = cache.get_channel(&dest)?;
            match call_transmit_runtime_filter(channel, params).await {
                Ok(result) => Ok(result),
                Err(status) => {
                    if status.code() == tonic::Code::Unavailable {
                        cache.evict_channel(&dest);
                    }
                    Err(format!(
                        "transmit_runtime_filter to {dest} failed: {}",
                        status.message()
                    ))
                }
            }
        })
    }
}
