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
//! Process logging for the runtime filter components.
//!
//! Code logs through the re-exported `tracing` macros. `init_from_config`
//! installs one fmt subscriber for the whole process; later calls are no-ops.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use chrono::Local;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;

use crate::common::app_config::AppConfig;

static INIT: OnceLock<()> = OnceLock::new();

/// Local wall clock with microseconds: `20260101 10:00:00.123456`.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y%m%d %H:%M:%S%.6f"))
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn install(directive: &str, log_file: Option<&Path>) {
    INIT.get_or_init(|| {
        let builder = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(directive))
            .with_timer(LocalTimer)
            .with_thread_names(true)
            .with_target(false)
            .with_file(true)
            .with_line_number(true);
        if let Some(path) = log_file {
            match open_log_file(path) {
                Ok(file) => {
                    let _ = builder
                        .with_writer(Mutex::new(file))
                        .with_ansi(false)
                        .try_init();
                    return;
                }
                Err(err) => eprintln!(
                    "open log file {} failed: {}, fallback to stderr",
                    path.display(),
                    err
                ),
            }
        }
        let _ = builder
            .with_writer(io::stderr)
            .with_ansi(atty::is(atty::Stream::Stderr))
            .try_init();
    });
}

/// Log to stderr with the given filter directive.
pub fn init_with_level(level: &str) {
    install(level, None);
}

pub fn init_from_config(cfg: &AppConfig) {
    install(cfg.log_directive(), cfg.log_file.as_deref());
}

pub use tracing::{debug, error, info, trace, warn};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_parent_is_created() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("nested").join("rfrelay.log");
        open_log_file(&path).expect("open log file");
        assert!(path.exists());
    }
}
