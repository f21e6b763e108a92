// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod client; // 采集客户端
pub mod config; // 配置参数
pub mod detection; // 跟踪核心 (滤波/关联/检测器接口)
pub mod error; // 错误类型
pub mod input; // 视频输入系统
pub mod protocol; // 通信协议
pub mod server; // 跟踪服务端

pub use crate::config::TrackerConfig;
pub use crate::detection::{BBox, Detector, KalmanFilter, ReplayDetector, Track, Xyah};
pub use crate::protocol::{Channel, Message, MessageKind};

/// 安装日志订阅器 (默认 info, 可用 RUST_LOG 覆盖)
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
