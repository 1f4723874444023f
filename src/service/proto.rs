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
//! Internal-service messages for runtime filter transmission.
//!
//! Field tags follow the backend `internal_service.proto` so that payloads
//! stay wire compatible with peers generated from the proto file.

use bytes::Bytes;

use crate::common::types::{NetworkAddress, UniqueId};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PUniqueId {
    #[prost(int64, required, tag = "1")]
    pub hi: i64,
    #[prost(int64, required, tag = "2")]
    pub lo: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusPb {
    #[prost(int32, required, tag = "1")]
    pub status_code: i32,
    #[prost(string, repeated, tag = "2")]
    pub error_msgs: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PTransmitRuntimeFilterForwardTarget {
    #[prost(string, optional, tag = "1")]
    pub host: Option<String>,
    #[prost(int32, optional, tag = "2")]
    pub port: Option<i32>,
    #[prost(message, repeated, tag = "3")]
    pub probe_finst_ids: Vec<PUniqueId>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PTransmitRuntimeFilterParams {
    #[prost(bool, optional, tag = "1")]
    pub is_partial: Option<bool>,
    #[prost(message, optional, tag = "2")]
    pub query_id: Option<PUniqueId>,
    #[prost(int32, optional, tag = "3")]
    pub filter_id: Option<i32>,
    #[prost(message, optional, tag = "4")]
    pub finst_id: Option<PUniqueId>,
    #[prost(bytes = "bytes", optional, tag = "5")]
    pub data: Option<Bytes>,
    #[prost(message, repeated, tag = "6")]
    pub probe_finst_ids: Vec<PUniqueId>,
    #[prost(int32, optional, tag = "7")]
    pub build_be_number: Option<i32>,
    #[prost(message, repeated, tag = "8")]
    pub forward_targets: Vec<PTransmitRuntimeFilterForwardTarget>,
    #[prost(int64, optional, tag = "9")]
    pub send_timestamp: Option<i64>,
    #[prost(int64, optional, tag = "10")]
    pub recv_timestamp: Option<i64>,
    #[prost(int64, optional, tag = "11")]
    pub broadcast_timestamp: Option<i64>,
    #[prost(bool, optional, tag = "12")]
    pub is_pipeline: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PTransmitRuntimeFilterResult {
    #[prost(message, optional, tag = "1")]
    pub status: Option<StatusPb>,
    #[prost(int32, optional, tag = "2")]
    pub filter_id: Option<i32>,
}

impl From<UniqueId> for PUniqueId {
    fn from(id: UniqueId) -> Self {
        Self {
            hi: id.hi,
            lo: id.lo,
        }
    }
}

impl From<&PUniqueId> for UniqueId {
    fn from(id: &PUniqueId) -> Self {
        UniqueId {
            hi: id.hi,
            lo: id.lo,
        }
    }
}

impl PTransmitRuntimeFilterForwardTarget {
    /// Address of this hop. Missing or out-of-range ports are rejected.
    pub fn address(&self) -> Option<NetworkAddress> {
        let host = self.host.as_deref().filter(|h| !h.is_empty())?;
        let port = u16::try_from(self.port?).ok()?;
        Some(NetworkAddress::new(host, port))
    }
}

impl PTransmitRuntimeFilterResult {
    pub fn ok(filter_id: i32) -> Self {
        Self {
            status: Some(StatusPb {
                status_code: 0,
                error_msgs: Vec::new(),
            }),
            filter_id: Some(filter_id),
        }
    }

    pub fn error(filter_id: i32, msg: impl Into<String>) -> Self {
        Self {
            status: Some(StatusPb {
                status_code: 1,
                error_msgs: vec![msg.into()],
            }),
            filter_id: Some(filter_id),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.as_ref().is_none_or(|s| s.status_code == 0)
    }
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn forward_target_address_requires_host_and_port() {
        let target = PTransmitRuntimeFilterForwardTarget {
            host: Some("10.0.0.3".to_string()),
            port: Some(8060),
            probe_finst_ids: Vec::new(),
        };
        assert_eq!(target.address(), Some(NetworkAddress::new("10.0.0.3", 8060)));

        let missing_port = PTransmitRuntimeFilterForwardTarget {
            port: None,
            ..target.clone()
        };
        assert_eq!(missing_port.address(), None);

        let bad_port = PTransmitRuntimeFilterForwardTarget {
            port: Some(70_000),
            ..target
        };
        assert_eq!(bad_port.address(), None);
    }

    #[test]
    fn params_keep_nested_forward_targets_on_the_wire() {
        let params = PTransmitRuntimeFilterParams {
            is_partial: Some(false),
            query_id: Some(PUniqueId { hi: 1, lo: 2 }),
            filter_id: Some(7),
            data: Some(Bytes::from_static(b"payload")),
            probe_finst_ids: vec![PUniqueId { hi: 1, lo: 10 }],
            forward_targets: vec![PTransmitRuntimeFilterForwardTarget {
                host: Some("b".to_string()),
                port: Some(8060),
                probe_finst_ids: vec![PUniqueId { hi: 1, lo: 11 }],
            }],
            broadcast_timestamp: Some(42),
            ..Default::default()
        };
        let decoded =
            PTransmitRuntimeFilterParams::decode(params.encode_to_vec().as_slice()).expect("decode");
        assert_eq!(decoded, params);
    }

    #[test]
    fn result_status_helpers() {
        assert!(PTransmitRuntimeFilterResult::ok(3).is_ok());
        let err = PTransmitRuntimeFilterResult::error(3, "missing query_id");
        assert!(!err.is_ok());
        assert_eq!(err.filter_id, Some(3));
    }
}
