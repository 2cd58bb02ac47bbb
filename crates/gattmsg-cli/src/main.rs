//! gattmsg CLI
//!
//! 命令行客户端：作为中心端连接并发送消息，或作为外设端广播并接收消息

mod console;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use gattmsg_core::{
    AppSettings, BleClient, CentralOptions, CentralState, GattServer, LogLevel, PeerHandle,
    PeripheralOptions, SessionEvent,
};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gattmsg", version, about = "BLE GATT 文本消息工具")]
struct Cli {
    /// 日志级别 (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 扫描附近设备
    Scan {
        /// 扫描超时时间 (秒)
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// 作为中心端连接设备并发送消息
    Central {
        /// 目标设备地址 (可选，不指定则连接第一个广播消息服务的设备)
        #[arg(short, long)]
        device: Option<String>,
        /// 扫描超时时间 (秒)
        #[arg(short, long)]
        timeout: Option<u64>,
        /// 以 JSON 行输出事件
        #[arg(long)]
        json: bool,
    },
    /// 作为外设端广播并接收消息
    Peripheral {
        /// 广播名称 (默认: 配置中的设备名称)
        #[arg(short, long)]
        name: Option<String>,
        /// 以 JSON 行输出事件
        #[arg(long)]
        json: bool,
    },
    /// 查看或初始化配置
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// 显示当前配置
    Show,
    /// 写入默认配置文件
    Init {
        /// 覆盖已存在的配置文件
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = AppSettings::load();
    init_logging(cli.log_level.unwrap_or(settings.log_level));

    match cli.command {
        Commands::Scan { timeout } => {
            run_scan(&settings, timeout.unwrap_or(settings.scan_timeout_secs)).await?;
        }
        Commands::Central {
            device,
            timeout,
            json,
        } => {
            let timeout = timeout.unwrap_or(settings.scan_timeout_secs);
            run_central(&settings, device, timeout, json).await?;
        }
        Commands::Peripheral { name, json } => {
            run_peripheral(&settings, name, json).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("# {}", AppSettings::config_path().display());
                print!("{}", settings.to_toml()?);
            }
            ConfigAction::Init { force } => {
                let path = AppSettings::config_path();
                if path.exists() && !force {
                    bail!("配置文件已存在: {} (使用 --force 覆盖)", path.display());
                }
                let path = AppSettings::default().save()?;
                println!("已写入配置: {}", path.display());
            }
        },
    }

    Ok(())
}

fn init_logging(level: LogLevel) {
    // 桥接 log crate（gattmsg-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    // 日志输出到 stderr，stdout 留给消息和 JSON 事件
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.filter_directive())),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn central_options(settings: &AppSettings) -> CentralOptions {
    CentralOptions {
        profile: settings.profile(),
        scan_filter: settings.scan_filter(),
        require_peer_name: settings.require_peer_name,
    }
}

async fn run_scan(settings: &AppSettings, timeout: u64) -> Result<()> {
    let central = BleClient::new()
        .await?
        .start(central_options(settings))
        .await?;

    println!("🔍 扫描设备 ({}s)...", timeout);
    central.start_scan().await?;
    tokio::time::sleep(Duration::from_secs(timeout)).await;

    let snapshot = central.snapshot().await?;
    if let Err(e) = central.stop_scan().await {
        tracing::debug!("Stop scan: {}", e);
    }
    console::print_peers(&snapshot.peers);

    central.shutdown().await;
    Ok(())
}

async fn run_central(
    settings: &AppSettings,
    device: Option<String>,
    timeout: u64,
    json: bool,
) -> Result<()> {
    let options = central_options(settings);
    let service = options.profile.service;
    let central = BleClient::new().await?.start(options).await?;
    let mut events = central.subscribe();
    let mut lines = console::stdin_lines();

    let mut connecting = false;
    if let Some(address) = device {
        println!("🔗 连接 {}...", address);
        central.connect(PeerHandle::new(address)).await?;
        connecting = true;
    } else {
        println!("🔍 查找广播消息服务的设备 ({}s)...", timeout);
        central.start_scan().await?;
    }

    let deadline = tokio::time::sleep(Duration::from_secs(timeout));
    tokio::pin!(deadline);
    let mut ready = false;

    loop {
        tokio::select! {
            () = &mut deadline, if !connecting => {
                central.shutdown().await;
                bail!("{}s 内未发现广播消息服务的设备", timeout);
            }
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Dropped {} session events", n);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                console::print_event(&event, json);
                match event {
                    SessionEvent::PeerListChanged { peers } if !connecting => {
                        if let Some(peer) = peers.iter().find(|p| p.advertises(&service)) {
                            println!("🔗 连接 {}...", peer.handle);
                            central.connect(peer.handle.clone()).await?;
                            connecting = true;
                        }
                    }
                    SessionEvent::DiscoveryComplete { .. } => {
                        ready = true;
                        if !json {
                            println!("输入消息后回车发送，Ctrl+C 退出");
                        }
                    }
                    SessionEvent::ConnectionStateChanged {
                        state: CentralState::Idle,
                        ..
                    } if connecting => {
                        println!("连接已断开");
                        break;
                    }
                    _ => {}
                }
            }
            Some(line) = lines.recv() => {
                if !ready {
                    eprintln!("尚未就绪，消息未发送");
                } else if let Err(e) = central.send_text(line).await {
                    eprintln!("发送失败: {e}");
                }
            }
        }
    }

    central.shutdown().await;
    Ok(())
}

async fn run_peripheral(settings: &AppSettings, name: Option<String>, json: bool) -> Result<()> {
    let local_name = name.unwrap_or_else(|| settings.device_name.clone());
    let options = PeripheralOptions {
        profile: settings.profile(),
        local_name: local_name.clone(),
        initial_value: settings.initial_value.clone().into_bytes(),
    };

    let server = GattServer::new().await?.start(options).await?;
    let mut events = server.subscribe();
    let mut lines = console::stdin_lines();

    server.start_advertising().await?;
    println!("📡 正在广播 '{}'，等待中心设备连接...", local_name);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => console::print_event(&event, json),
                Err(RecvError::Lagged(n)) => tracing::warn!("Dropped {} session events", n),
                Err(RecvError::Closed) => break,
            },
            Some(line) = lines.recv() => {
                if let Err(e) = server.publish(line).await {
                    eprintln!("发布失败: {e}");
                }
            }
        }
    }

    server.shutdown().await;
    Ok(())
}
