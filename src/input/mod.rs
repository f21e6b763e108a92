/// 视频输入系统 (Video Input System)
///
/// 独立生产者线程, 负责采集与预处理
/// - Source: 采集源 (图像序列 / 合成场景)
/// - FrameBuffer: 有界帧队列 (背压)
pub mod frame_buffer;
pub mod source;

pub use frame_buffer::{Frame, FrameBuffer, FrameRead, StreamState};
pub use source::{open_source, FrameSource, ImageSequence, SyntheticSource};
