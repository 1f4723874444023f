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
//! Tokio runtime that carries one worker's outbound runtime filter RPCs.
//!
//! The worker thread owns it: RPC tasks are spawned onto it and joined with
//! `block_on` from the worker thread. Backends sharing a process each get
//! their own RPC threads.

use std::future::Future;

use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;

use crate::rfrelay_logging::info;

pub(crate) struct RpcRuntime {
    handle: Handle,
    // Taken on drop so shutdown never blocks the dropping thread.
    runtime: Option<Runtime>,
}

impl RpcRuntime {
    pub(crate) fn new(thread_name: &str, worker_threads: usize) -> Result<Self, String> {
        let worker_threads = worker_threads.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .worker_threads(worker_threads)
            .thread_name(thread_name)
            .build()
            .map_err(|e| format!("init runtime filter rpc runtime failed: {e}"))?;
        info!(
            "runtime filter rpc runtime started: thread_name={} worker_threads={}",
            thread_name, worker_threads
        );
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Block the calling thread on `future`. Refused from inside any tokio
    /// runtime, where blocking would stall its executor.
    pub(crate) fn block_on<F: Future>(&self, future: F) -> Result<F::Output, String> {
        if Handle::try_current().is_ok() {
            return Err("rpc block_on cannot run inside an async runtime context".to_string());
        }
        Ok(self.handle.block_on(future))
    }
}

impl Drop for RpcRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
