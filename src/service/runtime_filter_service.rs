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
//! Inbound `transmit_runtime_filter` handling.
//!
//! Validates the message and hands it to the runtime filter worker. The RPC
//! thread never waits for the merge or the delivery.

use crate::common::types::QueryId;
use crate::exec::runtime_filter::peek_runtime_filter_type;
use crate::rfrelay_logging::{debug, warn};
use crate::runtime::exec_env::ExecEnv;
use crate::service::proto::{PTransmitRuntimeFilterParams, PTransmitRuntimeFilterResult};

pub fn transmit_runtime_filter(
    env: &ExecEnv,
    params: PTransmitRuntimeFilterParams,
) -> PTransmitRuntimeFilterResult {
    let Some(filter_id) = params.filter_id else {
        return PTransmitRuntimeFilterResult::error(0, "missing filter_id for transmit_runtime_filter");
    };
    let Some(query_id) = params.query_id.as_ref().map(QueryId::from) else {
        return PTransmitRuntimeFilterResult::error(
            filter_id,
            "missing query_id for transmit_runtime_filter",
        );
    };
    let wire_type = match params.data.as_deref() {
        Some(data) if !data.is_empty() => peek_runtime_filter_type(data),
        _ => {
            return PTransmitRuntimeFilterResult::error(
                filter_id,
                format!("runtime filter payload is empty: query_id={query_id} filter_id={filter_id}"),
            );
        }
    };

    let is_partial = params.is_partial.unwrap_or(false);
    debug!(
        "transmit_runtime_filter received: query_id={} filter_id={} is_partial={} type={:?} build_be={:?} forward_targets={}",
        query_id,
        filter_id,
        is_partial,
        wire_type,
        params.build_be_number,
        params.forward_targets.len()
    );
    if !env.runtime_filter_worker().receive_runtime_filter(params) {
        warn!(
            "runtime filter worker stopped, drop filter: query_id={} filter_id={}",
            query_id, filter_id
        );
    }
    PTransmitRuntimeFilterResult::ok(filter_id)
}
