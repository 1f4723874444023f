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
//! Runtime-filter value types exchanged between backends.
//!
//! Responsibilities:
//! - Provides the concrete join runtime filter (bloom membership plus value range).
//! - Provides its wire codec.
//!
//! Key exported interfaces:
//! - Types: `JoinRuntimeFilter`, `RuntimeFilterWireType`.
//! - Functions: `peek_runtime_filter_type`.

mod bloom;
mod codec;
mod join_filter;
mod min_max;

pub use codec::{RuntimeFilterWireType, peek_runtime_filter_type};
pub use join_filter::JoinRuntimeFilter;
