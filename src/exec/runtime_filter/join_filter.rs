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
use super::bloom::{SimdBlockFilter, hash_i64};
use super::codec::{decode_join_runtime_filter, encode_join_runtime_filter};
use super::min_max::RuntimeMinMaxFilter;

/// Membership state of a join runtime filter.
///
/// `Unset` is the identity of `concat`. `Disabled` is absorbing: it appears
/// once two bloom directories of different shape were combined, after which
/// membership answers "maybe" for every key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) enum BloomMembership {
    Unset,
    Ready(SimdBlockFilter),
    Disabled,
}

impl BloomMembership {
    pub(super) fn bloom(&self) -> Option<&SimdBlockFilter> {
        match self {
            BloomMembership::Ready(bf) => Some(bf),
            _ => None,
        }
    }
}

/// Runtime filter built from the build side of a hash join on a 64-bit key.
///
/// A filter never produces false negatives: `test` may admit keys that were
/// never inserted, but never rejects one that was.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinRuntimeFilter {
    pub(super) has_null: bool,
    pub(super) min_max: RuntimeMinMaxFilter,
    pub(super) membership: BloomMembership,
}

impl JoinRuntimeFilter {
    pub fn with_expected_rows(expected_rows: u64) -> Self {
        Self {
            has_null: false,
            min_max: RuntimeMinMaxFilter::default(),
            membership: BloomMembership::Ready(SimdBlockFilter::with_expected_rows(expected_rows)),
        }
    }

    pub fn insert(&mut self, key: i64) {
        self.min_max.insert(key);
        if let BloomMembership::Ready(bf) = &mut self.membership {
            bf.insert_hash(hash_i64(key));
        }
    }

    pub fn insert_null(&mut self) {
        self.has_null = true;
    }

    pub fn test(&self, key: i64) -> bool {
        if !self.min_max.contains(key) {
            return false;
        }
        match &self.membership {
            BloomMembership::Ready(bf) => bf.test_hash(hash_i64(key)),
            BloomMembership::Unset | BloomMembership::Disabled => true,
        }
    }

    pub fn test_null(&self) -> bool {
        self.has_null
    }

    pub fn min_max(&self) -> Option<(i64, i64)> {
        self.min_max.bounds()
    }

    pub fn has_bloom(&self) -> bool {
        self.membership.bloom().is_some()
    }

    /// Bytes held by the membership directory.
    pub fn size(&self) -> usize {
        self.membership.bloom().map_or(0, SimdBlockFilter::byte_size)
    }

    /// A filter with no content, used as the seed of a merge.
    pub fn create_empty(&self) -> Self {
        Self {
            has_null: false,
            min_max: RuntimeMinMaxFilter::default(),
            membership: BloomMembership::Unset,
        }
    }

    /// Union `other` into `self`.
    pub fn concat(&mut self, other: &JoinRuntimeFilter) {
        self.has_null |= other.has_null;
        self.min_max.merge_from(&other.min_max);
        let current = std::mem::replace(&mut self.membership, BloomMembership::Unset);
        self.membership = match (current, &other.membership) {
            (BloomMembership::Disabled, _) | (_, BloomMembership::Disabled) => {
                BloomMembership::Disabled
            }
            (current, BloomMembership::Unset) => current,
            (BloomMembership::Unset, BloomMembership::Ready(src)) => {
                BloomMembership::Ready(src.clone())
            }
            (BloomMembership::Ready(mut dst), BloomMembership::Ready(src)) => {
                match dst.union_with(src) {
                    Ok(()) => BloomMembership::Ready(dst),
                    Err(_) => BloomMembership::Disabled,
                }
            }
        };
    }

    pub fn serialize(&self) -> Vec<u8> {
        encode_join_runtime_filter(self)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, String> {
        decode_join_runtime_filter(data)
    }
}
