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

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use stonewire::{
    setup_local_tracing, setup_tracing, AppError, AppResult, ConnectionHandle, Engine,
    EngineConfig, GLOBAL_CONFIG,
};
use tokio::runtime;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
    /// echo every delivered byte back to its sender
    Serve {
        /// directory of the rolling log file, console only when absent
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// send one message to a server and print the echo
    Connect {
        /// server address, defaults to the configured ip:port
        #[arg(short, long)]
        addr: Option<String>,
        message: String,
    },
}

fn level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn main() -> AppResult<()> {
    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline
        .conf
        .as_ref()
        .map_or_else(|| PathBuf::from("conf.toml"), PathBuf::from);
    let engine_config = if config_path.exists() {
        EngineConfig::set_up_config(&config_path)?
    } else {
        EngineConfig::default()
    };
    GLOBAL_CONFIG
        .set(engine_config)
        .map_err(|_| AppError::IllegalStateError("engine config already set".to_string()))?;
    let config = stonewire::global_config();

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    match commandline.command {
        Some(Command::PrintConfig) => {
            println!("{:#?}", config);
            Ok(())
        }
        Some(Command::Connect { addr, message }) => {
            setup_local_tracing()?;
            let addr =
                addr.unwrap_or_else(|| format!("{}:{}", config.network.ip, config.network.port));
            rt.block_on(connect(config.clone(), addr, message))
        }
        Some(Command::Serve { log_dir }) => {
            let _guard = match log_dir {
                Some(dir) => Some(setup_tracing(dir, level(commandline.verbose))?),
                None => {
                    setup_local_tracing()?;
                    None
                }
            };
            rt.block_on(serve(config.clone()))
        }
        None => {
            setup_local_tracing()?;
            rt.block_on(serve(config.clone()))
        }
    }
}

async fn serve(config: EngineConfig) -> AppResult<()> {
    let addr = format!("{}:{}", config.network.ip, config.network.port);
    let engine = Arc::new(Engine::start(config)?);
    let local_addr = engine.listen(&addr).await?;
    info!(%local_addr, "echo server ready");

    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            accepted = engine.accept() => {
                match accepted {
                    Ok(handle) => {
                        let engine = engine.clone();
                        sessions.spawn(async move { echo(engine, handle).await });
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received");
                break;
            }
        }
    }

    sessions.shutdown().await;
    match Arc::try_unwrap(engine) {
        Ok(engine) => engine.shutdown().await,
        Err(_) => Err(AppError::IllegalStateError(
            "engine still shared at shutdown".to_string(),
        )),
    }
}

async fn echo(engine: Arc<Engine>, handle: ConnectionHandle) {
    info!(peer = %handle.peer_addr(), "session started");
    loop {
        match engine.receive(&handle).await {
            Ok(data) => {
                if let Err(e) = engine.send(&handle, &data).await {
                    warn!(peer = %handle.peer_addr(), error = %e, "echo failed");
                    break;
                }
            }
            Err(AppError::PeerClosed) => break,
            Err(AppError::Timeout(_)) => continue,
            Err(e) => {
                warn!(peer = %handle.peer_addr(), error = %e, "receive failed");
                break;
            }
        }
    }
    if let Err(e) = engine.close(&handle).await {
        warn!(peer = %handle.peer_addr(), error = %e, "close failed");
    }
    info!(peer = %handle.peer_addr(), stats = ?engine.stats(&handle), "session finished");
}

async fn connect(config: EngineConfig, addr: String, message: String) -> AppResult<()> {
    let engine = Engine::start(config)?;
    let handle = engine.open(&addr).await?;
    engine.send(&handle, message.as_bytes()).await?;
    let echoed = engine.receive_exact(&handle, message.len()).await?;
    println!("{}", String::from_utf8_lossy(&echoed));
    engine.close(&handle).await?;
    println!("{:#?}", engine.stats(&handle));
    engine.shutdown().await
}
