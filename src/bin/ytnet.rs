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

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use dotenv::dotenv;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use ytnet::buffer::{BufferVec, BufferVecOutputStream};
use ytnet::network::Package;
use ytnet::service::{setup_tracing, Executor};
use ytnet::{AppError, AppResult, ServiceConfig, TcpConnPool, UdpClientPool, UdpServer, GLOBAL_CONFIG};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory of the rolling log files
    #[arg(long, default_value = "./logs")]
    pub log_dir: String,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// print the effective configuration and exit
    PrintConfig,
    /// echo every datagram back to its sender until ctrl-c
    UdpEcho,
    /// send one datagram and print the reply, if any
    UdpSend {
        remote: SocketAddr,
        message: String,
        /// how long to wait for a reply, in milliseconds
        #[arg(long, default_value_t = 2000)]
        wait_ms: u64,
    },
    /// echo every framed package back on its connection until ctrl-c
    TcpEcho,
}

fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let _tracing_guard = setup_tracing(&commandline.log_dir, log_level(commandline.verbose));

    //setup config
    let config = match commandline.conf.as_ref() {
        Some(path) => ServiceConfig::set_up_config(PathBuf::from(path))?,
        None => {
            let default_path = PathBuf::from("./conf.toml");
            if default_path.exists() {
                ServiceConfig::set_up_config(default_path)?
            } else {
                ServiceConfig::default().verify()
            }
        }
    };
    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| AppError::IllegalStateError("global config already set".into()))?;
    let config = ytnet::global_config();

    match commandline.command.unwrap_or(Command::PrintConfig) {
        Command::PrintConfig => {
            println!("{:#?}", config);
            Ok(())
        }
        Command::UdpEcho => run_udp_echo(config),
        Command::UdpSend {
            remote,
            message,
            wait_ms,
        } => run_udp_send(config, remote, message, Duration::from_millis(wait_ms)),
        Command::TcpEcho => run_tcp_echo(config),
    }
}

fn run_udp_echo(config: &ServiceConfig) -> AppResult<()> {
    let mut executor = Executor::new(config.executor.clone())?;
    let handle = executor.handle()?;
    let server = {
        let _guard = handle.enter();
        UdpServer::new(config.udp_server.clone())
    };
    let (tx, mut rx) = mpsc::unbounded_channel::<(SocketAddr, Bytes)>();
    server.register_msg_handle_func(move |remote, data| {
        let _ = tx.send((remote, data));
    });

    let echo_server = server.clone();
    handle.spawn(async move {
        while let Some((remote, data)) = rx.recv().await {
            if let Err(err) = echo_server.send_msg(remote, data).await {
                warn!("udp echo to {} failed: {}", remote, err);
            }
        }
    });

    let start_server = server.clone();
    executor.register_svr_func(
        move || Box::pin(async move { start_server.start().await }),
        move || Box::pin(async move { server.stop().await }),
    );
    executor.start()?;
    info!("udp echo server running, ctrl-c to stop");
    executor.join()
}

fn run_udp_send(
    config: &ServiceConfig,
    remote: SocketAddr,
    message: String,
    wait: Duration,
) -> AppResult<()> {
    let executor = Executor::new(config.executor.clone())?;
    let handle = executor.handle()?;
    let client_cfg = config.udp_client.clone();

    let mut datagram = BufferVec::new();
    let mut stream = BufferVecOutputStream::new(&mut datagram, config.buffer.block_size);
    stream.write_all(message.as_bytes())?;
    stream.finish()?;

    handle.block_on(async move {
        let clients = UdpClientPool::new(client_cfg);
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        clients.register_msg_handle_func(move |_, data| {
            let _ = tx.send(data);
        });
        clients.start()?;
        clients.get_client(remote).await?.send_buffer(datagram).await?;

        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(reply)) => println!("{}", String::from_utf8_lossy(&reply)),
            _ => warn!("no reply from {} within {:?}", remote, wait),
        }
        clients.stop().await;
        Ok::<(), AppError>(())
    })?;

    executor.stop();
    executor.join()
}

fn run_tcp_echo(config: &ServiceConfig) -> AppResult<()> {
    let mut executor = Executor::new(config.executor.clone())?;
    let handle = executor.handle()?;
    let pool = {
        let _guard = handle.enter();
        TcpConnPool::new(config.tcp_pool.clone())
    };
    let (tx, mut rx) = mpsc::unbounded_channel::<(SocketAddr, Package)>();
    pool.register_msg_handle_func(move |remote, package| {
        let _ = tx.send((remote, package));
    });
    pool.register_err_handle_func(|remote, err| {
        error!("tcp connection to {} failed: {}", remote, err);
    });

    let echo_pool = pool.clone();
    handle.spawn(async move {
        while let Some((remote, package)) = rx.recv().await {
            if let Err(err) = echo_pool.send(remote, &package).await {
                warn!("tcp echo to {} failed: {}", remote, err);
            }
        }
    });

    let start_pool = pool.clone();
    executor.register_svr_func(
        move || Box::pin(async move { start_pool.start().await }),
        move || Box::pin(async move { pool.stop().await }),
    );
    executor.start()?;
    info!("tcp echo server running, ctrl-c to stop");
    executor.join()
}
