// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

extern crate config as _;

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// Largest payload a single IPv4 UDP datagram can carry.
pub const MAX_UDP_PAYLOAD: usize = 65507;

pub static GLOBAL_CONFIG: OnceCell<ServiceConfig> = OnceCell::new();

/// Returns the process wide configuration, falling back to verified defaults
/// when nothing was loaded.
pub fn global_config() -> &'static ServiceConfig {
    GLOBAL_CONFIG.get_or_init(ServiceConfig::default)
}

fn clamp_ms(value: u64, min: u64, max: u64) -> u64 {
    value.clamp(min, max)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutorCfg {
    pub threads_num: usize,
    pub thread_name: String,
    /// how long `join` waits for in-flight tasks after the stop hooks ran
    pub shutdown_timeout_ms: u64,
}

impl Default for ExecutorCfg {
    fn default() -> Self {
        Self {
            threads_num: num_cpus::get(),
            thread_name: "ytnet-worker".to_string(),
            shutdown_timeout_ms: 3000,
        }
    }
}

impl ExecutorCfg {
    pub fn verify(mut self) -> Self {
        self.threads_num = self.threads_num.clamp(1, 1024);
        if self.thread_name.is_empty() {
            self.thread_name = "ytnet-worker".to_string();
        }
        self.shutdown_timeout_ms = clamp_ms(self.shutdown_timeout_ms, 10, 60_000);
        self
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Settings shared by every UDP session, client or server side.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UdpSessionCfg {
    pub max_package_size: usize,
    pub max_no_data_duration_ms: u64,
}

impl Default for UdpSessionCfg {
    fn default() -> Self {
        Self {
            max_package_size: 1024,
            max_no_data_duration_ms: 60_000,
        }
    }
}

impl UdpSessionCfg {
    pub fn verify(mut self) -> Self {
        self.max_package_size = self.max_package_size.clamp(64, MAX_UDP_PAYLOAD);
        self.max_no_data_duration_ms = clamp_ms(self.max_no_data_duration_ms, 10, 24 * 3600 * 1000);
        self
    }

    pub fn max_no_data_duration(&self) -> Duration {
        Duration::from_millis(self.max_no_data_duration_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UdpClientCfg {
    /// local address each client socket binds to, port 0 picks an ephemeral port
    pub local_ep: SocketAddr,
    pub max_client_num: usize,
    pub mgr_timer_dt_ms: u64,
    pub session: UdpSessionCfg,
}

impl Default for UdpClientCfg {
    fn default() -> Self {
        Self {
            local_ep: SocketAddr::from(([0, 0, 0, 0], 0)),
            max_client_num: 1000,
            mgr_timer_dt_ms: 10_000,
            session: UdpSessionCfg::default(),
        }
    }
}

impl UdpClientCfg {
    pub fn verify(mut self) -> Self {
        self.max_client_num = self.max_client_num.clamp(1, 1_000_000);
        self.mgr_timer_dt_ms = clamp_ms(self.mgr_timer_dt_ms, 10, 3600 * 1000);
        self.session = self.session.verify();
        self
    }

    pub fn mgr_timer_dt(&self) -> Duration {
        Duration::from_millis(self.mgr_timer_dt_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UdpServerCfg {
    pub listen_ep: SocketAddr,
    pub max_session_num: usize,
    pub mgr_timer_dt_ms: u64,
    pub session: UdpSessionCfg,
}

impl Default for UdpServerCfg {
    fn default() -> Self {
        Self {
            listen_ep: SocketAddr::from(([0, 0, 0, 0], 53927)),
            max_session_num: 1000,
            mgr_timer_dt_ms: 10_000,
            session: UdpSessionCfg::default(),
        }
    }
}

impl UdpServerCfg {
    pub fn verify(mut self) -> Self {
        self.max_session_num = self.max_session_num.clamp(1, 1_000_000);
        self.mgr_timer_dt_ms = clamp_ms(self.mgr_timer_dt_ms, 10, 3600 * 1000);
        self.session = self.session.verify();
        self
    }

    pub fn mgr_timer_dt(&self) -> Duration {
        Duration::from_millis(self.mgr_timer_dt_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpPoolCfg {
    pub listen_ep: SocketAddr,
    pub max_conn_num: usize,
    pub max_body_size: usize,
    pub mgr_timer_dt_ms: u64,
    pub connect_timeout_ms: u64,
    /// block size used when encoding outgoing packages
    pub write_block_size: usize,
}

impl Default for TcpPoolCfg {
    fn default() -> Self {
        Self {
            listen_ep: SocketAddr::from(([0, 0, 0, 0], 53928)),
            max_conn_num: 100,
            max_body_size: 16 * 1024 * 1024,
            mgr_timer_dt_ms: 10_000,
            connect_timeout_ms: 5000,
            write_block_size: 4096,
        }
    }
}

impl TcpPoolCfg {
    pub fn verify(mut self) -> Self {
        self.max_conn_num = self.max_conn_num.clamp(1, 65536);
        self.max_body_size = self.max_body_size.clamp(1024, u32::MAX as usize);
        self.mgr_timer_dt_ms = clamp_ms(self.mgr_timer_dt_ms, 10, 3600 * 1000);
        self.connect_timeout_ms = clamp_ms(self.connect_timeout_ms, 10, 600_000);
        self.write_block_size = self.write_block_size.clamp(64, 1024 * 1024);
        self
    }

    pub fn mgr_timer_dt(&self) -> Duration {
        Duration::from_millis(self.mgr_timer_dt_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BufferCfg {
    pub block_size: usize,
}

impl Default for BufferCfg {
    fn default() -> Self {
        Self { block_size: 4096 }
    }
}

impl BufferCfg {
    pub fn verify(mut self) -> Self {
        // the frame header must always fit in the first block
        self.block_size = self.block_size.clamp(16, 64 * 1024 * 1024);
        self
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub executor: ExecutorCfg,
    pub udp_client: UdpClientCfg,
    pub udp_server: UdpServerCfg,
    pub tcp_pool: TcpPoolCfg,
    pub buffer: BufferCfg,
}

impl ServiceConfig {
    pub fn verify(self) -> Self {
        Self {
            executor: self.executor.verify(),
            udp_client: self.udp_client.verify(),
            udp_server: self.udp_server.verify(),
            tcp_pool: self.tcp_pool.verify(),
            buffer: self.buffer.verify(),
        }
    }

    /// Loads the config file, applies `YTNET_` prefixed environment overrides
    /// (e.g. `YTNET_UDP_SERVER__MAX_SESSION_NUM`) and clamps every value.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServiceConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix("YTNET")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let service_config: ServiceConfig = config.try_deserialize()?;

        Ok(service_config.verify())
    }
}
