use std::io::BufRead;
use std::net::TcpStream;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
/// 单目标跟踪客户端 (无窗口)
/// Headless capture client
///
/// 直接运行: cargo run --bin sot-client --release -- --capture synthetic --bbox 100,150,200,340
use sot_rs::client::{ControlEvent, FrameSink, NullSink, OverlayWriter, TrackClient};
use sot_rs::input::{open_source, FrameBuffer};
use sot_rs::protocol::Channel;
use sot_rs::{init_tracing, TrackerConfig};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "单目标跟踪客户端", long_about = None)]
struct Args {
    /// 视频源: synthetic[:N] / 图片目录 / 图片文件
    #[arg(long, default_value = "synthetic")]
    capture: String,

    /// 服务端地址 (覆盖配置文件)
    #[arg(long)]
    ip: Option<String>,

    /// 服务端端口 (覆盖配置文件)
    #[arg(short, long)]
    port: Option<u16>,

    /// 初始目标框 x1,y1,x2,y2
    #[arg(long)]
    bbox: Option<String>,

    /// 叠加帧输出目录
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// JSON配置文件
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 缩放宽度
    #[arg(long)]
    width: Option<u32>,

    /// 缩放高度
    #[arg(long)]
    height: Option<u32>,
}

fn parse_bbox(text: &str) -> Result<ControlEvent> {
    let coords = text
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("无效的 --bbox: {}", text))?;
    let [x1, y1, x2, y2] = coords.as_slice() else {
        bail!("--bbox 需要4个数值, 得到 {}", coords.len());
    };
    Ok(ControlEvent::Select {
        top_left: (*x1, *y1),
        bottom_right: (*x2, *y2),
    })
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
    if let Some(width) = args.width {
        config.stream.width = width;
    }
    if let Some(height) = args.height {
        config.stream.height = height;
    }
    config.print_summary();

    let addr = config.network.addr();
    let stream = TcpStream::connect(&addr).with_context(|| format!("无法连接服务端 {}", addr))?;
    stream.set_nodelay(true).ok();
    info!("🔗 已连接服务端: {}", addr);
    let channel = Channel::with_limits(stream, config.network.max_message_size, 4096);

    info!("📹 视频源: {}", args.capture);
    let source = open_source(&args.capture, config.stream.resolution())?;
    let mut buffer = FrameBuffer::start(source, &config.stream);

    let (tx, rx) = crossbeam_channel::unbounded::<ControlEvent>();
    if let Some(bbox) = &args.bbox {
        tx.send(parse_bbox(bbox)?)?;
    }

    // 标准输入命令线程: p/r/t/c/q, s x1 y1 x2 y2
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            match ControlEvent::parse(&line) {
                Some(event) => {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => warn!("⚠️ 未知命令: {}", line.trim()),
            }
        }
    });

    let mut sink: Box<dyn FrameSink> = match &args.output {
        Some(dir) => Box::new(OverlayWriter::new(dir)?),
        None => Box::new(NullSink),
    };

    let mut client = TrackClient::new(channel, &config.stream);
    client.run(&mut buffer, &rx, sink.as_mut())?;
    Ok(())
}
