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
//! Runtime min-max filter over 64-bit join keys.
//!
//! Responsibilities:
//! - Tracks the lower/upper bound of inserted build keys.
//! - Rejects probe keys outside the range before the bloom check runs.
//!
//! Key exported interfaces:
//! - Types: `RuntimeMinMaxFilter`.

use super::codec::{read_i64_le, read_u8};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct RuntimeMinMaxFilter {
    range: Option<(i64, i64)>,
}

impl RuntimeMinMaxFilter {
    pub(crate) fn insert(&mut self, value: i64) {
        self.range = Some(match self.range {
            Some((min, max)) => (min.min(value), max.max(value)),
            None => (value, value),
        });
    }

    pub(crate) fn merge_from(&mut self, other: &RuntimeMinMaxFilter) {
        if let Some((min, max)) = other.range {
            self.insert(min);
            self.insert(max);
        }
    }

    /// A filter that never saw a key admits nothing.
    pub(crate) fn contains(&self, value: i64) -> bool {
        self.range
            .map(|(min, max)| min <= value && value <= max)
            .unwrap_or(false)
    }

    pub(crate) fn bounds(&self) -> Option<(i64, i64)> {
        self.range
    }

    pub(crate) fn serialize(&self, buf: &mut Vec<u8>) {
        match self.range {
            Some((min, max)) => {
                buf.push(1);
                buf.extend_from_slice(&min.to_le_bytes());
                buf.extend_from_slice(&max.to_le_bytes());
            }
            None => buf.push(0),
        }
    }

    pub(crate) fn deserialize(data: &[u8], offset: &mut usize) -> Result<Self, String> {
        match read_u8(data, offset)? {
            0 => Ok(Self::default()),
            1 => {
                let min = read_i64_le(data, offset)?;
                let max = read_i64_le(data, offset)?;
                if min > max {
                    return Err(format!("runtime min-max filter inverted: {min} > {max}"));
                }
                Ok(Self {
                    range: Some((min, max)),
                })
            }
            flag => Err(format!("runtime min-max filter flag invalid: {flag}")),
        }
    }
}
