//! 错误类型定义
//! Error types for capture, framing, filtering and detection

use std::io;
use thiserror::Error;

/// 帧协议错误 (长度头损坏 / 消息截断 / 负载无法解析)
#[derive(Debug, Error)]
pub enum FramingError {
    /// 长度头不是合法的ASCII十进制数
    #[error("Invalid length header: {0:?}")]
    InvalidHeader(String),

    /// 声明长度超过上限
    #[error("Message too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },

    /// 连接在消息中途关闭
    #[error("Truncated message: expected {expected} bytes, got {received}")]
    Truncated { expected: usize, received: usize },

    /// 负载反序列化失败
    #[error("Payload decode failed: {0}")]
    Decode(#[source] bincode::Error),

    /// 负载序列化失败
    #[error("Payload encode failed: {0}")]
    Encode(#[source] bincode::Error),
}

/// 通道错误
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Framing(#[from] FramingError),

    /// 对端在消息边界处正常关闭
    #[error("Peer disconnected")]
    Disconnected,

    /// 读超时 (连接仍可能存活)
    #[error("Receive timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ChannelError {
    /// 是否为可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        match self {
            ChannelError::Timeout => true,
            ChannelError::Io(e) => e.kind() == io::ErrorKind::Interrupted,
            _ => false,
        }
    }
}

/// 采集错误 (流结束以外的失败)
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Failed to open video source {source_id}: {reason}")]
    Open { source_id: String, reason: String },

    #[error("Unsupported video source: {0}")]
    Unsupported(String),

    #[error("Image decode failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// 卡尔曼滤波数值错误
#[derive(Debug, Error)]
pub enum FilterError {
    /// 投影协方差不是正定矩阵, Cholesky分解失败
    #[error("Projected covariance is not positive definite")]
    NumericalDegeneracy,
}

/// 检测器错误
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("Track file parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Detector failure: {0}")]
    Backend(String),
}

/// 配置加载错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(ChannelError::Timeout.is_transient());
        assert!(ChannelError::Io(io::Error::from(io::ErrorKind::Interrupted)).is_transient());
        assert!(!ChannelError::Disconnected.is_transient());
        assert!(!ChannelError::Framing(FramingError::InvalidHeader("x".into())).is_transient());
    }
}
