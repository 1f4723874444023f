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
//! Runtime-filter wire codec.
//!
//! Responsibilities:
//! - Encodes and decodes `JoinRuntimeFilter` payloads exchanged between backends.
//! - Implements binary parsing helpers with strict bounds and type validation.
//!
//! Layout: version byte, type tag, has-null byte, min-max section, then the
//! bloom directory when the type tag is `BLOOM`.

use super::bloom::SimdBlockFilter;
use super::join_filter::{BloomMembership, JoinRuntimeFilter};
use super::min_max::RuntimeMinMaxFilter;

const RF_VERSION_V3: u8 = 0x4;
const RF_TYPE_EMPTY_FILTER: u8 = 1;
const RF_TYPE_BLOOM_FILTER: u8 = 2;
const RF_TYPE_DISABLED_FILTER: u8 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Wire-level type tags of join runtime filter payloads.
pub enum RuntimeFilterWireType {
    Empty,
    Bloom,
    Disabled,
}

/// Read the type tag of a payload without decoding it.
pub fn peek_runtime_filter_type(data: &[u8]) -> Result<RuntimeFilterWireType, String> {
    let mut offset = 0;
    let version = read_u8(data, &mut offset)
        .map_err(|_| "runtime filter data is empty".to_string())?;
    if version != RF_VERSION_V3 {
        return Err(format!("unsupported runtime filter version: {version}"));
    }
    let tag = read_u8(data, &mut offset)
        .map_err(|_| "runtime filter data truncated (missing type)".to_string())?;
    match tag {
        RF_TYPE_EMPTY_FILTER => Ok(RuntimeFilterWireType::Empty),
        RF_TYPE_BLOOM_FILTER => Ok(RuntimeFilterWireType::Bloom),
        RF_TYPE_DISABLED_FILTER => Ok(RuntimeFilterWireType::Disabled),
        _ => Err(format!("unsupported runtime filter type: {tag}")),
    }
}

pub(super) fn encode_join_runtime_filter(filter: &JoinRuntimeFilter) -> Vec<u8> {
    let bloom_size = filter.membership.bloom().map(|bf| bf.byte_size() + 12);
    let mut buf = Vec::with_capacity(20 + bloom_size.unwrap_or(0));
    buf.push(RF_VERSION_V3);
    buf.push(match &filter.membership {
        BloomMembership::Unset => RF_TYPE_EMPTY_FILTER,
        BloomMembership::Ready(_) => RF_TYPE_BLOOM_FILTER,
        BloomMembership::Disabled => RF_TYPE_DISABLED_FILTER,
    });
    buf.push(filter.has_null as u8);
    filter.min_max.serialize(&mut buf);
    if let BloomMembership::Ready(bf) = &filter.membership {
        bf.serialize(&mut buf);
    }
    buf
}

pub(super) fn decode_join_runtime_filter(data: &[u8]) -> Result<JoinRuntimeFilter, String> {
    let wire_type = peek_runtime_filter_type(data)?;
    let mut offset = 2;
    let has_null = read_bool(data, &mut offset)?;
    let min_max = RuntimeMinMaxFilter::deserialize(data, &mut offset)?;
    let membership = match wire_type {
        RuntimeFilterWireType::Empty => BloomMembership::Unset,
        RuntimeFilterWireType::Disabled => BloomMembership::Disabled,
        RuntimeFilterWireType::Bloom => {
            BloomMembership::Ready(SimdBlockFilter::deserialize(data, &mut offset)?)
        }
    };
    if offset != data.len() {
        return Err(format!(
            "runtime filter has {} trailing bytes",
            data.len() - offset
        ));
    }
    Ok(JoinRuntimeFilter {
        has_null,
        min_max,
        membership,
    })
}

pub(super) fn read_u8(data: &[u8], offset: &mut usize) -> Result<u8, String> {
    if data.len() < *offset + 1 {
        return Err("runtime filter data truncated".to_string());
    }
    let v = data[*offset];
    *offset += 1;
    Ok(v)
}

fn read_bool(data: &[u8], offset: &mut usize) -> Result<bool, String> {
    match read_u8(data, offset)? {
        0 => Ok(false),
        1 => Ok(true),
        v => Err(format!("runtime filter bool byte invalid: {v}")),
    }
}

fn read_array<const N: usize>(data: &[u8], offset: &mut usize) -> Result<[u8; N], String> {
    let end = *offset + N;
    let bytes = data
        .get(*offset..end)
        .ok_or_else(|| "runtime filter data truncated".to_string())?;
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    *offset = end;
    Ok(out)
}

pub(super) fn read_i32_le(data: &[u8], offset: &mut usize) -> Result<i32, String> {
    Ok(i32::from_le_bytes(read_array(data, offset)?))
}

pub(super) fn read_u32_le(data: &[u8], offset: &mut usize) -> Result<u32, String> {
    Ok(u32::from_le_bytes(read_array(data, offset)?))
}

pub(super) fn read_i64_le(data: &[u8], offset: &mut usize) -> Result<i64, String> {
    Ok(i64::from_le_bytes(read_array(data, offset)?))
}
