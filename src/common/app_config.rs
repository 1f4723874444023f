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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static AppConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = AppConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static AppConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = AppConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static AppConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("RFRELAY_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidate = PathBuf::from("rfrelay.toml");
    if candidate.exists() {
        return Ok(candidate);
    }

    Err(anyhow!(
        "missing config file: set $RFRELAY_CONFIG or create ./rfrelay.toml"
    ))
}

#[derive(Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "rfrelay=debug,h2=off,hyper=off,tonic=off"
    #[serde(default)]
    pub log_filter: Option<String>,

    /// Append log lines to this file instead of stderr.
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub runtime_filter: RuntimeFilterConfig,
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: AppConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }

    /// Filter expression handed to the logging subscriber.
    pub fn log_directive(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(&self.log_level)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            log_file: None,
            server: ServerConfig::default(),
            runtime_filter: RuntimeFilterConfig::default(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_brpc_port")]
    pub brpc_port: u16,
    #[serde(default)]
    pub be_number: i32,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}
fn default_brpc_port() -> u16 {
    8060
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            brpc_port: default_brpc_port(),
            be_number: 0,
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct RuntimeFilterConfig {
    #[serde(default = "default_send_rpc_runtime_filter_timeout_ms")]
    pub send_rpc_runtime_filter_timeout_ms: u64,
    /// Total filters up to this many bytes are sent to every destination directly.
    #[serde(default = "default_deliver_broadcast_rf_passthrough_bytes_limit")]
    pub deliver_broadcast_rf_passthrough_bytes_limit: usize,
    #[serde(default = "default_deliver_broadcast_rf_passthrough_inflight_num")]
    pub deliver_broadcast_rf_passthrough_inflight_num: usize,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
    /// Ring buffer size of the runtime filter event log. 0 disables it.
    #[serde(default)]
    pub event_log_capacity: usize,
    #[serde(default = "default_rpc_worker_threads")]
    pub rpc_worker_threads: usize,
}

fn default_send_rpc_runtime_filter_timeout_ms() -> u64 {
    1000
}

fn default_deliver_broadcast_rf_passthrough_bytes_limit() -> usize {
    131_072 // 128KB
}

fn default_deliver_broadcast_rf_passthrough_inflight_num() -> usize {
    10
}

fn default_cache_capacity() -> usize {
    4096
}

fn default_cache_ttl_seconds() -> u64 {
    600
}

fn default_rpc_worker_threads() -> usize {
    4
}

impl Default for RuntimeFilterConfig {
    fn default() -> Self {
        Self {
            send_rpc_runtime_filter_timeout_ms: default_send_rpc_runtime_filter_timeout_ms(),
            deliver_broadcast_rf_passthrough_bytes_limit:
                default_deliver_broadcast_rf_passthrough_bytes_limit(),
            deliver_broadcast_rf_passthrough_inflight_num:
                default_deliver_broadcast_rf_passthrough_inflight_num(),
            cache_capacity: default_cache_capacity(),
            cache_ttl_seconds: default_cache_ttl_seconds(),
            event_log_capacity: 0,
            rpc_worker_threads: default_rpc_worker_threads(),
        }
    }
}
