//! 通信消息定义 (客户端 ⇄ 服务端)
//! Explicit wire schema, encoded with bincode

use serde::{Deserialize, Serialize};

use crate::detection::types::Xyah;
use crate::error::FramingError;

/// 消息类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// 新选择的目标 (客户端 → 服务端)
    Init,
    /// 跟踪中的后续帧 (客户端 → 服务端)
    Update,
    /// 跟踪结果 (服务端 → 客户端)
    Result,
}

/// 一条完整消息
///
/// `boxes`: 每个目标一个 [x, y, a, h] (目前只支持单目标)
/// `state`: 跟踪是否有效
/// `frame`: JPEG压缩后的图像, 只在客户端 → 服务端方向携带
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub boxes: Vec<Xyah>,
    pub state: bool,
    pub frame: Option<Vec<u8>>,
}

impl Message {
    pub fn init(xyah: Xyah, frame: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Init,
            boxes: vec![xyah],
            state: true,
            frame: Some(frame),
        }
    }

    pub fn update(xyah: Xyah, frame: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Update,
            boxes: vec![xyah],
            state: true,
            frame: Some(frame),
        }
    }

    /// 客户端取消跟踪
    pub fn cancel() -> Self {
        Self {
            kind: MessageKind::Update,
            boxes: Vec::new(),
            state: false,
            frame: None,
        }
    }

    pub fn result(state: bool, boxes: Vec<Xyah>) -> Self {
        Self {
            kind: MessageKind::Result,
            boxes,
            state,
            frame: None,
        }
    }

    /// 第一个目标框
    pub fn primary_box(&self) -> Option<&Xyah> {
        self.boxes.first()
    }

    pub fn encode(&self) -> Result<Vec<u8>, FramingError> {
        bincode::serialize(self).map_err(FramingError::Encode)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, FramingError> {
        bincode::deserialize(payload).map_err(FramingError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_encode_decode() {
        let msg = Message::init([100.0, 100.0, 1.0, 50.0], vec![0xFF, 0xD8, 0x00]);
        let bytes = msg.encode().unwrap();
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_result_has_no_frame() {
        let msg = Message::result(false, vec![[1.0, 2.0, 3.0, 4.0]]);
        assert_eq!(msg.kind, MessageKind::Result);
        assert!(msg.frame.is_none());
        assert_eq!(msg.primary_box(), Some(&[1.0, 2.0, 3.0, 4.0]));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            Message::decode(&[0xFF; 3]),
            Err(FramingError::Decode(_))
        ));
    }
}
