/// 客户端/服务端通信协议
///
/// - Message: 消息结构 (bincode 编码)
/// - Channel: 10字节长度头的流式分帧
pub mod channel;
pub mod message;

pub use channel::{encode_frame, parse_header, Channel, FrameDecoder, HEADER_SIZE};
pub use message::{Message, MessageKind};
