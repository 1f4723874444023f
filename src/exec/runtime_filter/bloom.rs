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
//! Block bloom filter used as the membership part of a join runtime filter.
//!
//! Each bucket is 8 x u32 words. A key sets one salted bit per word in exactly
//! one bucket, so two filters of the same shape merge by OR-ing directories.

use super::codec::{read_i32_le, read_u32_le};

const SALT: [u32; 8] = [
    0x47b6137b, 0x44974d91, 0x8824ad5b, 0xa2b7289d, 0x705495c7, 0x2df1424b, 0x9efc4947, 0x5c6bfb31,
];
const WORDS_PER_BUCKET: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SimdBlockFilter {
    log_num_buckets: i32,
    directory_mask: u32,
    directory: Vec<u32>,
}

impl SimdBlockFilter {
    /// Size the directory for `num_elements` keys.
    pub(crate) fn with_expected_rows(num_elements: u64) -> Self {
        let nums = num_elements.max(1);
        let log_heap_space = (nums as f64).log2().ceil() as i32;
        let log_num_buckets = std::cmp::max(1, log_heap_space - 5);
        let directory_mask = ((1u64 << std::cmp::min(63, log_num_buckets as u32)) - 1) as u32;
        let bucket_count = 1usize << log_num_buckets;
        Self {
            log_num_buckets,
            directory_mask,
            directory: vec![0u32; bucket_count * WORDS_PER_BUCKET],
        }
    }

    pub(crate) fn byte_size(&self) -> usize {
        self.directory.len() * std::mem::size_of::<u32>()
    }

    pub(crate) fn same_shape(&self, other: &SimdBlockFilter) -> bool {
        self.log_num_buckets == other.log_num_buckets
            && self.directory_mask == other.directory_mask
            && self.directory.len() == other.directory.len()
    }

    pub(crate) fn union_with(&mut self, other: &SimdBlockFilter) -> Result<(), String> {
        if !self.same_shape(other) {
            return Err(format!(
                "runtime bloom filter shape mismatch: {} vs {} buckets",
                1u64 << self.log_num_buckets,
                1u64 << other.log_num_buckets
            ));
        }
        for (dst, src) in self.directory.iter_mut().zip(other.directory.iter()) {
            *dst |= *src;
        }
        Ok(())
    }

    pub(crate) fn insert_hash(&mut self, hash: u64) {
        let (base, masks) = self.locate(hash);
        for (word, mask) in self.directory[base..base + WORDS_PER_BUCKET]
            .iter_mut()
            .zip(masks)
        {
            *word |= mask;
        }
    }

    pub(crate) fn test_hash(&self, hash: u64) -> bool {
        let (base, masks) = self.locate(hash);
        self.directory[base..base + WORDS_PER_BUCKET]
            .iter()
            .zip(masks)
            .all(|(word, mask)| word & mask != 0)
    }

    fn locate(&self, hash: u64) -> (usize, [u32; 8]) {
        let bucket_idx = (hash as u32) & self.directory_mask;
        let key = (hash >> (self.log_num_buckets as u32)) as u32;
        (bucket_idx as usize * WORDS_PER_BUCKET, make_mask(key))
    }

    pub(crate) fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.log_num_buckets.to_le_bytes());
        buf.extend_from_slice(&self.directory_mask.to_le_bytes());
        buf.extend_from_slice(&(self.byte_size() as i32).to_le_bytes());
        for value in &self.directory {
            buf.extend_from_slice(&value.to_le_bytes());
        }
    }

    pub(crate) fn deserialize(data: &[u8], offset: &mut usize) -> Result<Self, String> {
        let log_num_buckets = read_i32_le(data, offset)?;
        let directory_mask = read_u32_le(data, offset)?;
        let data_size = read_i32_le(data, offset)?;
        if !(1..=30).contains(&log_num_buckets) {
            return Err(format!(
                "runtime bloom filter bucket count invalid: log2={log_num_buckets}"
            ));
        }
        let bucket_count = 1usize << log_num_buckets;
        let expected_size = bucket_count * WORDS_PER_BUCKET * 4;
        if data_size < 0 || data_size as usize != expected_size {
            return Err(format!(
                "runtime bloom filter data size invalid: expected={expected_size} actual={data_size}"
            ));
        }
        if directory_mask as usize != bucket_count - 1 {
            return Err("runtime bloom filter directory mask invalid".to_string());
        }
        if data.len() < *offset + expected_size {
            return Err("runtime bloom filter data truncated".to_string());
        }
        let mut directory = Vec::with_capacity(bucket_count * WORDS_PER_BUCKET);
        for _ in 0..bucket_count * WORDS_PER_BUCKET {
            directory.push(read_u32_le(data, offset)?);
        }
        Ok(Self {
            log_num_buckets,
            directory_mask,
            directory,
        })
    }
}

/// Hash an integer join key the way the build side does.
pub(crate) fn hash_i64(value: i64) -> u64 {
    phmap_mix_8(value as u64)
}

fn make_mask(key: u32) -> [u32; 8] {
    let mut masks = [0u32; 8];
    for (mask, salt) in masks.iter_mut().zip(SALT) {
        *mask = 1u32 << (key.wrapping_mul(salt) >> 27);
    }
    masks
}

fn phmap_mix_8(a: u64) -> u64 {
    let k: u64 = 0xde5fb9d2630458e9;
    let prod = (a as u128) * (k as u128);
    let l = prod as u64;
    let h = (prod >> 64) as u64;
    h.wrapping_add(l)
}
