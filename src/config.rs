//! 跟踪系统配置 - 通过JSON文件调整参数

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::ConfigError;

/// 跟踪系统参数配置
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub detection: DetectionConfig,
    pub stream: StreamConfig,
    pub network: NetworkConfig,
}

/// 检测与关联参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub target_class: u32,        // 跟踪的目标类别 (COCO-91: 1 = person)
    pub min_confidence: f64,      // 检测置信度下限 (严格大于)
    pub iou_threshold: f64,       // 低于该IOU判定为丢失
    pub pixel_inclusive_iou: bool, // IOU按离散像素 (+1) 计算
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            target_class: 1,
            min_confidence: 0.7,
            iou_threshold: 0.5,
            pixel_inclusive_iou: true,
        }
    }
}

/// 视频流缓冲参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub queue_size: usize,     // 帧队列容量 (背压上限)
    pub width: u32,            // 缩放目标宽度
    pub height: u32,           // 缩放目标高度
    pub full_backoff_ms: u64,  // 队列满时生产者休眠
    pub pause_idle_ms: u64,    // 暂停时生产者休眠
    pub display_interval_ms: u64, // 消费者每帧间隔
    pub jpeg_quality: u8,      // 发送到服务端的JPEG质量
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            queue_size: 256,
            width: 1024,
            height: 768,
            full_backoff_ms: 100,
            pause_idle_ms: 25,
            display_interval_ms: 25,
            jpeg_quality: 90,
        }
    }
}

impl StreamConfig {
    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn full_backoff(&self) -> Duration {
        Duration::from_millis(self.full_backoff_ms)
    }

    pub fn pause_idle(&self) -> Duration {
        Duration::from_millis(self.pause_idle_ms)
    }

    pub fn display_interval(&self) -> Duration {
        Duration::from_millis(self.display_interval_ms)
    }
}

/// 网络通信参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub recv_timeout_ms: u64,            // 单次读超时
    pub retry_backoff_ms: u64,           // 瞬时错误后的退避
    pub max_recv_retries: u32,           // 连续瞬时错误上限
    pub dead_connection_timeout_ms: u64, // 半条消息停滞超过该时长视为死连接
    pub max_message_size: usize,         // 单条消息上限 (字节)
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 9999,
            recv_timeout_ms: 1000,
            retry_backoff_ms: 100,
            max_recv_retries: 5,
            dead_connection_timeout_ms: 30_000,
            max_message_size: 64 * 1024 * 1024,
        }
    }
}

impl NetworkConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn dead_connection_timeout(&self) -> Duration {
        Duration::from_millis(self.dead_connection_timeout_ms)
    }
}

impl TrackerConfig {
    /// 从JSON文件加载配置, 文件不存在时写入默认配置
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::try_load(path) {
            Ok(config) => {
                info!("✅ 配置已从 {} 加载", path.display());
                config
            }
            Err(ConfigError::Io(_)) if !path.exists() => {
                info!("📝 配置文件不存在,创建默认配置...");
                let config = Self::default();
                if let Err(e) = config.save(path) {
                    warn!("❌ 保存配置失败: {}", e);
                }
                config
            }
            Err(e) => {
                warn!("⚠️  配置文件解析失败: {}, 使用默认值", e);
                Self::default()
            }
        }
    }

    pub fn try_load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), json)?;
        info!("💾 配置已保存到 {}", path.as_ref().display());
        Ok(())
    }

    /// 打印当前配置
    pub fn print_summary(&self) {
        info!("🎛️  当前跟踪配置:");
        info!(
            "  目标类别: {} | 置信度 > {:.2} | 丢失IOU < {:.2}",
            self.detection.target_class, self.detection.min_confidence, self.detection.iou_threshold
        );
        info!(
            "  帧队列: {} | 分辨率: {}x{}",
            self.stream.queue_size, self.stream.width, self.stream.height
        );
        info!(
            "  服务地址: {} | 读超时 {}ms | 死连接 {}ms",
            self.network.addr(),
            self.network.recv_timeout_ms,
            self.network.dead_connection_timeout_ms
        );
    }
}
