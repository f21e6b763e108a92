use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
/// 单目标跟踪服务端
/// Single-object tracking server
///
/// 直接运行: cargo run --bin sot-server --release -- --tracks tracks.txt
use sot_rs::{init_tracing, ReplayDetector, TrackerConfig};
use sot_rs::server::TrackServer;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "单目标跟踪服务端", long_about = None)]
struct Args {
    /// 监听地址 (覆盖配置文件)
    #[arg(long)]
    ip: Option<String>,

    /// 监听端口 (覆盖配置文件)
    #[arg(short, long)]
    port: Option<u16>,

    /// 回放检测器使用的轨迹文件 (frame,x,y,a,h 或 frame,tid,x,y,a,h)
    #[arg(short, long)]
    tracks: PathBuf,

    /// JSON配置文件
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TrackerConfig::load(path),
        None => TrackerConfig::default(),
    };
    if let Some(ip) = args.ip {
        config.network.ip = ip;
    }
    if let Some(port) = args.port {
        config.network.port = port;
    }
    config.print_summary();

    // 启动前检查一次轨迹文件
    let replay = ReplayDetector::from_file(&args.tracks, config.detection.target_class)
        .with_context(|| format!("无法加载轨迹文件 {}", args.tracks.display()))?;
    info!("📦 回放检测器: {} 帧", replay.len());

    let tracks = args.tracks.clone();
    let class_id = config.detection.target_class;
    let addr = config.network.addr();
    let server = TrackServer::bind(addr.as_str(), config, move || {
        ReplayDetector::from_file(&tracks, class_id)
    })?;

    server.serve()
}
