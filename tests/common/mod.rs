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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]
#![allow(unused_imports)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tempfile::TempDir;

use rfrelay::common::types::{FragmentInstanceId, UniqueId};
use rfrelay::runtime::exec_env::{ExecEnv, ExecEnvOptions};
use rfrelay::service::grpc_client::RuntimeFilterTransport;
use rfrelay::service::proto::{PTransmitRuntimeFilterParams, PTransmitRuntimeFilterResult};
use rfrelay::{NetworkAddress, rfrelay_config, rfrelay_logging, transmit_runtime_filter};

/// Test configuration for integration tests.
pub struct TestConfig {
    /// Temporary directory for test artifacts
    pub temp_dir: TempDir,
    /// Test config path
    pub config_path: PathBuf,
}

impl TestConfig {
    /// Create a new test configuration with default settings.
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("test_rfrelay.toml");

        let config_content = r#"
log_level = "debug"

[server]
host = "127.0.0.1"
brpc_port = 9060
be_number = 0

[runtime_filter]
send_rpc_runtime_filter_timeout_ms = 2000
deliver_broadcast_rf_passthrough_bytes_limit = 131072
deliver_broadcast_rf_passthrough_inflight_num = 10
cache_capacity = 1024
cache_ttl_seconds = 60
event_log_capacity = 4096
"#;

        std::fs::write(&config_path, config_content)?;

        Ok(Self {
            temp_dir,
            config_path,
        })
    }

    /// Initialize logging for tests.
    pub fn init_logging(&self) {
        rfrelay_logging::init_with_level("debug");
    }

    /// Load the test configuration.
    pub fn load_config(&self) -> anyhow::Result<&'static rfrelay_config::AppConfig> {
        rfrelay_config::init_from_path(&self.config_path)
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new().expect("Failed to create test config")
    }
}

/// Generate a unique query ID based on test name.
pub fn unique_query_id(test_name: &str) -> UniqueId {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    test_name.hash(&mut hasher);
    let hash = hasher.finish();

    UniqueId {
        hi: hash as i64,
        lo: (hash >> 32) as i64,
    }
}

/// Fragment instance id inside `query_id`.
pub fn finst_id(query_id: UniqueId, lo: i64) -> FragmentInstanceId {
    FragmentInstanceId::new(query_id.hi, lo)
}

/// Wait for a condition to become true, with timeout.
pub fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

type NodeRegistry = Arc<Mutex<HashMap<NetworkAddress, Weak<ExecEnv>>>>;

/// One recorded outbound RPC.
#[derive(Clone, Debug)]
pub struct SentRpc {
    pub dest: NetworkAddress,
    pub params: PTransmitRuntimeFilterParams,
}

/// Transport that hands RPCs to in-process `ExecEnv`s after `latency`,
/// counting how many calls of this node are in flight.
#[derive(Clone)]
pub struct LoopbackTransport {
    registry: NodeRegistry,
    latency: Duration,
    inflight: Arc<AtomicUsize>,
    max_inflight: Arc<AtomicUsize>,
    sent: Arc<Mutex<Vec<SentRpc>>>,
}

impl LoopbackTransport {
    pub fn sent(&self) -> Vec<SentRpc> {
        self.sent.lock().expect("sent rpcs lock").clone()
    }

    pub fn sent_totals(&self) -> Vec<SentRpc> {
        self.sent()
            .into_iter()
            .filter(|rpc| !rpc.params.is_partial.unwrap_or(false))
            .collect()
    }

    pub fn max_inflight(&self) -> usize {
        self.max_inflight.load(Ordering::Acquire)
    }
}

impl RuntimeFilterTransport for LoopbackTransport {
    fn transmit_runtime_filter(
        &self,
        dest: &NetworkAddress,
        params: PTransmitRuntimeFilterParams,
    ) -> BoxFuture<'static, Result<PTransmitRuntimeFilterResult, String>> {
        self.sent.lock().expect("sent rpcs lock").push(SentRpc {
            dest: dest.clone(),
            params: params.clone(),
        });
        let registry = Arc::clone(&self.registry);
        let inflight = Arc::clone(&self.inflight);
        let max_inflight = Arc::clone(&self.max_inflight);
        let latency = self.latency;
        let dest = dest.clone();
        Box::pin(async move {
            let now = inflight.fetch_add(1, Ordering::AcqRel) + 1;
            max_inflight.fetch_max(now, Ordering::AcqRel);
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let env = registry
                .lock()
                .expect("node registry lock")
                .get(&dest)
                .and_then(Weak::upgrade);
            let result = match env {
                Some(env) => Ok(transmit_runtime_filter(&env, params)),
                None => Err(format!("no node at {dest}")),
            };
            inflight.fetch_sub(1, Ordering::AcqRel);
            result
        })
    }
}

pub struct ClusterNode {
    pub env: Arc<ExecEnv>,
    pub transport: LoopbackTransport,
}

impl ClusterNode {
    pub fn address(&self) -> NetworkAddress {
        self.env.local_address().clone()
    }
}

/// A set of backends living in this process, wired through `LoopbackTransport`.
pub struct LoopbackCluster {
    registry: NodeRegistry,
    nodes: Vec<ClusterNode>,
}

impl LoopbackCluster {
    pub fn start(size: usize, latency: Duration, configure: impl Fn(&mut ExecEnvOptions)) -> Self {
        let registry: NodeRegistry = Arc::new(Mutex::new(HashMap::new()));
        let mut nodes = Vec::with_capacity(size);
        for i in 0..size {
            let address = NetworkAddress::new(format!("node{i}"), 9060);
            let mut options = ExecEnvOptions::new(address.clone(), i as i32);
            options.event_log_capacity = 4096;
            configure(&mut options);
            let transport = LoopbackTransport {
                registry: Arc::clone(&registry),
                latency,
                inflight: Arc::new(AtomicUsize::new(0)),
                max_inflight: Arc::new(AtomicUsize::new(0)),
                sent: Arc::new(Mutex::new(Vec::new())),
            };
            let env = ExecEnv::new(options, Arc::new(transport.clone())).expect("start node");
            registry
                .lock()
                .expect("node registry lock")
                .insert(address, Arc::downgrade(&env));
            nodes.push(ClusterNode { env, transport });
        }
        Self { registry, nodes }
    }

    pub fn node(&self, i: usize) -> &ClusterNode {
        &self.nodes[i]
    }

    pub fn nodes(&self) -> &[ClusterNode] {
        &self.nodes
    }

    pub fn total_rpcs_sent(&self) -> Vec<SentRpc> {
        self.nodes
            .iter()
            .flat_map(|node| node.transport.sent_totals())
            .collect()
    }

    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.env.shutdown();
        }
    }
}

impl Drop for LoopbackCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}
