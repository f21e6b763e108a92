//! 跟踪会话 (Track Session)
//! 职责: 每个连接一个会话, 预测 → 检测 → 关联 → 更新 → 回复

use std::fmt;
use std::io::{Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use image::RgbImage;
use tracing::{debug, info, warn};

use crate::config::{DetectionConfig, NetworkConfig};
use crate::detection::{Association, Associator, BBox, Detector, Track};
use crate::error::ChannelError;
use crate::protocol::{Channel, Message, MessageKind};

/// 接收重试策略
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// 瞬时错误后的退避
    pub backoff: Duration,
    /// 连续瞬时I/O错误上限 (不含空闲超时)
    pub max_retries: u32,
    /// 半条消息停滞超过该时长则断开
    pub dead_connection_timeout: Duration,
}

impl From<&NetworkConfig> for RetryPolicy {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            backoff: config.retry_backoff(),
            max_retries: config.max_recv_retries,
            dead_connection_timeout: config.dead_connection_timeout(),
        }
    }
}

/// 会话结束原因
#[derive(Debug)]
pub enum SessionEnd {
    /// 对端正常关闭
    Disconnected,
    /// 连续瞬时错误超过上限
    RetriesExhausted(u32),
    /// 消息收到一半后长时间停滞
    DeadConnection(Duration),
    /// 分帧/解码/发送失败
    Failed(ChannelError),
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::Disconnected => write!(f, "peer disconnected"),
            SessionEnd::RetriesExhausted(n) => write!(f, "{} consecutive receive errors", n),
            SessionEnd::DeadConnection(d) => write!(f, "partial message stalled for {:.1}s", d.as_secs_f64()),
            SessionEnd::Failed(e) => write!(f, "{}", e),
        }
    }
}

/// 会话统计
#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    pub messages: u64,
    pub initiated: u64,
    pub cycles: u64,
    pub matched: u64,
    pub lost: u64,
    pub cancelled: u64,
    pub detector_calls: u64,
    pub detector_time: Duration,
}

impl SessionStats {
    pub fn avg_detector_ms(&self) -> f64 {
        if self.detector_calls == 0 {
            0.0
        } else {
            self.detector_time.as_secs_f64() * 1000.0 / self.detector_calls as f64
        }
    }
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "消息 {} | 初始化 {} | 循环 {} | 匹配 {} | 丢失 {} | 取消 {} | 检测 {:.1}ms/次",
            self.messages,
            self.initiated,
            self.cycles,
            self.matched,
            self.lost,
            self.cancelled,
            self.avg_detector_ms()
        )
    }
}

/// 单连接跟踪会话: 独立持有轨迹与检测器, 不与其它会话共享状态
pub struct TrackSession<D> {
    track: Track,
    associator: Associator,
    detector: D,
    stats: SessionStats,
}

impl<D: Detector> TrackSession<D> {
    pub fn new(detector: D, config: &DetectionConfig) -> Self {
        Self {
            track: Track::new(),
            associator: Associator::new(config),
            detector,
            stats: SessionStats::default(),
        }
    }

    pub fn track(&self) -> &Track {
        &self.track
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// 处理一条消息, 返回需要回复的消息 (取消跟踪时不回复)
    pub fn handle(&mut self, message: Message) -> Option<Message> {
        self.stats.messages += 1;

        if !message.state {
            debug!("客户端取消跟踪");
            self.track.reset();
            self.stats.cancelled += 1;
            return None;
        }

        if message.kind == MessageKind::Init || !self.track.has_belief() {
            return Some(self.initiate(&message));
        }

        Some(self.cycle(message.frame.as_deref()))
    }

    /// 用客户端的框初始化, 不调用检测器
    fn initiate(&mut self, message: &Message) -> Message {
        let Some(xyah) = message.primary_box().filter(|b| b[3] > 0.0) else {
            warn!("⚠️ 初始化消息缺少有效目标框");
            return Message::result(false, Vec::new());
        };
        let initiated = self.track.initiate(xyah);
        self.stats.initiated += 1;
        info!(
            "🎯 轨迹初始化: ({:.1}, {:.1}) a={:.3} h={:.1}",
            initiated[0], initiated[1], initiated[2], initiated[3]
        );
        Message::result(true, vec![initiated])
    }

    /// 预测 → 检测 → 关联 → 更新或丢失
    fn cycle(&mut self, frame: Option<&[u8]>) -> Message {
        self.stats.cycles += 1;

        let Some(predicted) = self.track.predict() else {
            return self.lose(None);
        };

        let candidates = self.candidates(frame);
        match self.associator.associate(&predicted, &candidates) {
            Association::Matched { index, iou } => match self.track.correct(&candidates[index]) {
                Ok(Some(corrected)) => {
                    self.stats.matched += 1;
                    debug!("✅ 匹配 IOU={:.3}", iou);
                    Message::result(true, vec![corrected])
                }
                Ok(None) => self.lose(Some(iou)),
                Err(e) => {
                    warn!("⚠️ 滤波更新失败: {}", e);
                    self.lose(Some(iou))
                }
            },
            Association::Lost { best_iou } => self.lose(best_iou),
        }
    }

    /// 解码图像并运行检测器; 任何失败都视为没有候选框
    fn candidates(&mut self, frame: Option<&[u8]>) -> Vec<BBox> {
        let Some(image) = frame.and_then(decode_image) else {
            return Vec::new();
        };

        let start = Instant::now();
        let result = self.detector.detect(&image);
        self.stats.detector_calls += 1;
        self.stats.detector_time += start.elapsed();

        match result {
            Ok(detections) => self.associator.filter_candidates(detections),
            Err(e) => {
                warn!("⚠️ 检测器 {} 失败: {}", self.detector.name(), e);
                Vec::new()
            }
        }
    }

    fn lose(&mut self, best_iou: Option<f64>) -> Message {
        self.track.mark_lost();
        self.stats.lost += 1;
        match best_iou {
            Some(iou) => info!("❌ 目标丢失 (最佳IOU={:.3})", iou),
            None => info!("❌ 目标丢失 (无候选框)"),
        }
        Message::result(false, self.track.last_good().into_iter().collect())
    }

    /// 会话主循环: 直到对端断开或出现不可恢复的错误
    ///
    /// 空闲的连接 (客户端暂停或尚未选择目标) 一直保留;
    /// 只有消息收到一半后停滞超过 `dead_connection_timeout` 才断开
    pub fn run<S: Read + Write>(&mut self, channel: &mut Channel<S>, policy: &RetryPolicy) -> SessionEnd {
        let mut consecutive_errors = 0u32;
        // 半条消息开始停滞的时刻及当时的缓存字节数
        let mut stalled: Option<(Instant, usize)> = None;

        loop {
            match channel.recv() {
                Ok(message) => {
                    consecutive_errors = 0;
                    stalled = None;
                    if let Some(response) = self.handle(message) {
                        if let Err(e) = channel.send(&response) {
                            return SessionEnd::Failed(e);
                        }
                    }
                }
                Err(ChannelError::Disconnected) => return SessionEnd::Disconnected,
                Err(ChannelError::Timeout) => {
                    consecutive_errors = 0;
                    let pending = channel.pending();
                    match stalled {
                        _ if pending == 0 => stalled = None,
                        Some((since, seen)) if seen == pending => {
                            if since.elapsed() >= policy.dead_connection_timeout {
                                return SessionEnd::DeadConnection(since.elapsed());
                            }
                        }
                        _ => stalled = Some((Instant::now(), pending)),
                    }
                }
                Err(e) if e.is_transient() => {
                    consecutive_errors += 1;
                    if consecutive_errors > policy.max_retries {
                        return SessionEnd::RetriesExhausted(consecutive_errors);
                    }
                    debug!("接收失败 ({}), {:?} 后重试", e, policy.backoff);
                    thread::sleep(policy.backoff);
                }
                Err(e) => return SessionEnd::Failed(e),
            }
        }
    }
}

fn decode_image(bytes: &[u8]) -> Option<RgbImage> {
    match image::load_from_memory(bytes) {
        Ok(image) => Some(image.to_rgb8()),
        Err(e) => {
            warn!("⚠️ 图像解码失败: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Xyah;
    use crate::error::DetectError;
    use approx::assert_relative_eq;
    use crate::protocol::encode_frame;
    use std::collections::VecDeque;
    use std::io::{self, Cursor};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// 返回预置候选框并记录调用次数
    #[derive(Clone, Default)]
    struct StubDetector {
        calls: Arc<AtomicUsize>,
        next: Arc<Mutex<Vec<BBox>>>,
        fail: bool,
    }

    impl StubDetector {
        fn set(&self, boxes: Vec<BBox>) {
            *self.next.lock().unwrap() = boxes;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Detector for StubDetector {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<BBox>, DetectError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DetectError::Backend("stub failure".into()));
            }
            Ok(self.next.lock().unwrap().clone())
        }
    }

    fn encoded_frame() -> Vec<u8> {
        let mut bytes = Vec::new();
        let image = RgbImage::new(16, 16);
        image
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn person(xyah: Xyah) -> BBox {
        BBox::from_xyah(&xyah).with_class(1, 0.95)
    }

    fn session() -> (TrackSession<StubDetector>, StubDetector) {
        let stub = StubDetector::default();
        (
            TrackSession::new(stub.clone(), &DetectionConfig::default()),
            stub,
        )
    }

    #[test]
    fn test_lifecycle_scenario() {
        let (mut session, stub) = session();

        // 初始化: 回显同一个框, 不调用检测器
        let reply = session
            .handle(Message::init([100.0, 100.0, 1.0, 50.0], encoded_frame()))
            .unwrap();
        assert!(reply.state);
        assert_eq!(reply.kind, MessageKind::Result);
        assert_eq!(reply.boxes, vec![[100.0, 100.0, 1.0, 50.0]]);
        assert!(reply.frame.is_none());
        assert_eq!(stub.calls(), 0);

        // 平移5像素 (IOU约0.82): 匹配, 中心向检测移动
        stub.set(vec![person([105.0, 100.0, 1.0, 50.0])]);
        let reply = session
            .handle(Message::update([0.0; 4], encoded_frame()))
            .unwrap();
        assert!(reply.state);
        assert_eq!(stub.calls(), 1);
        let x = reply.boxes[0][0];
        assert!(x > 100.0 && x <= 105.0, "x = {}", x);

        // 远处的候选 (IOU约0.2): 丢失, 信念丢弃
        stub.set(vec![person([140.0, 100.0, 1.0, 50.0])]);
        let reply = session
            .handle(Message::update([0.0; 4], encoded_frame()))
            .unwrap();
        assert!(!reply.state);
        assert_eq!(reply.boxes.len(), 1);
        assert!(!session.track().has_belief());

        // 重新初始化: 速度为零
        let reply = session
            .handle(Message::init([300.0, 200.0, 0.5, 80.0], encoded_frame()))
            .unwrap();
        assert!(reply.state);
        assert_eq!(stub.calls(), 2);
        let velocity = session.track().belief().unwrap().velocity();
        for v in velocity {
            assert_relative_eq!(v, 0.0);
        }
    }

    #[test]
    fn test_update_without_belief_initiates() {
        let (mut session, stub) = session();
        let reply = session
            .handle(Message::update([50.0, 60.0, 0.5, 40.0], encoded_frame()))
            .unwrap();
        assert!(reply.state);
        assert_eq!(reply.boxes, vec![[50.0, 60.0, 0.5, 40.0]]);
        assert_eq!(stub.calls(), 0);
    }

    #[test]
    fn test_cancel_discards_belief_without_reply() {
        let (mut session, stub) = session();
        session.handle(Message::init([100.0, 100.0, 1.0, 50.0], encoded_frame()));
        assert!(session.handle(Message::cancel()).is_none());
        assert!(!session.track().has_belief());
        assert_eq!(stub.calls(), 0);
        assert_eq!(session.stats().cancelled, 1);
    }

    #[test]
    fn test_empty_candidates_lose_track() {
        let (mut session, _stub) = session();
        session.handle(Message::init([100.0, 100.0, 1.0, 50.0], encoded_frame()));
        let reply = session.handle(Message::update([0.0; 4], encoded_frame())).unwrap();
        assert!(!reply.state);
        assert_eq!(reply.boxes, vec![[100.0, 100.0, 1.0, 50.0]]);
    }

    #[test]
    fn test_low_confidence_and_wrong_class_ignored() {
        let (mut session, stub) = session();
        session.handle(Message::init([100.0, 100.0, 1.0, 50.0], encoded_frame()));
        stub.set(vec![
            BBox::from_xyah(&[100.0, 100.0, 1.0, 50.0]).with_class(1, 0.5),
            BBox::from_xyah(&[100.0, 100.0, 1.0, 50.0]).with_class(2, 0.99),
        ]);
        let reply = session.handle(Message::update([0.0; 4], encoded_frame())).unwrap();
        assert!(!reply.state);
    }

    #[test]
    fn test_bad_image_and_detector_error_are_losses() {
        let (mut session, stub) = session();
        session.handle(Message::init([100.0, 100.0, 1.0, 50.0], encoded_frame()));
        stub.set(vec![person([100.0, 100.0, 1.0, 50.0])]);
        let reply = session
            .handle(Message::update([0.0; 4], vec![1, 2, 3]))
            .unwrap();
        assert!(!reply.state);
        assert_eq!(stub.calls(), 0);

        let failing = StubDetector {
            fail: true,
            ..StubDetector::default()
        };
        let mut session = TrackSession::new(failing.clone(), &DetectionConfig::default());
        session.handle(Message::init([100.0, 100.0, 1.0, 50.0], encoded_frame()));
        let reply = session.handle(Message::update([0.0; 4], encoded_frame())).unwrap();
        assert!(!reply.state);
        assert_eq!(failing.calls(), 1);
    }

    #[test]
    fn test_init_without_box_rejected() {
        let (mut session, _stub) = session();
        let mut message = Message::init([0.0; 4], encoded_frame());
        message.boxes.clear();
        let reply = session.handle(message).unwrap();
        assert!(!reply.state);
        assert!(!session.track().has_belief());
    }

    /// 按脚本返回读结果的连接, 脚本读完后表现为对端关闭
    #[derive(Default)]
    struct ScriptedStream {
        reads: VecDeque<io::Result<Vec<u8>>>,
        written: Vec<u8>,
    }

    impl ScriptedStream {
        fn bytes(mut self, bytes: &[u8]) -> Self {
            self.reads.push_back(Ok(bytes.to_vec()));
            self
        }

        fn errors(mut self, kind: io::ErrorKind, count: usize) -> Self {
            for _ in 0..count {
                self.reads.push_back(Err(kind.into()));
            }
            self
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn init_frame() -> Vec<u8> {
        let message = Message::init([100.0, 100.0, 1.0, 50.0], Vec::new());
        encode_frame(&message.encode().unwrap()).unwrap()
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            backoff: Duration::from_millis(1),
            max_retries,
            dead_connection_timeout: Duration::ZERO,
        }
    }

    fn run_script(stream: ScriptedStream, policy: &RetryPolicy) -> (SessionEnd, TrackSession<StubDetector>, Vec<u8>) {
        let (mut session, _stub) = session();
        let mut channel = Channel::new(stream);
        let end = session.run(&mut channel, policy);
        let written = channel.into_inner().written;
        (end, session, written)
    }

    #[test]
    fn test_idle_peer_is_kept() {
        // 没有任何未完成的消息时, 读超时不计入停滞
        let stream = ScriptedStream::default()
            .errors(io::ErrorKind::TimedOut, 20)
            .bytes(&init_frame());
        let (end, session, written) = run_script(stream, &policy(0));

        assert!(matches!(end, SessionEnd::Disconnected), "{}", end);
        assert_eq!(session.stats().initiated, 1);
        assert!(!written.is_empty());
    }

    #[test]
    fn test_stalled_partial_message_is_dropped() {
        let frame = init_frame();
        let stream = ScriptedStream::default()
            .bytes(&frame[..5])
            .errors(io::ErrorKind::WouldBlock, 3)
            .bytes(&frame[5..]);
        let (end, session, written) = run_script(stream, &policy(0));

        assert!(matches!(end, SessionEnd::DeadConnection(_)), "{}", end);
        assert_eq!(session.stats().messages, 0);
        assert!(written.is_empty());
    }

    #[test]
    fn test_partial_message_still_growing_is_kept() {
        let frame = init_frame();
        let stream = ScriptedStream::default()
            .bytes(&frame[..5])
            .errors(io::ErrorKind::TimedOut, 1)
            .bytes(&frame[5..8])
            .errors(io::ErrorKind::TimedOut, 1)
            .bytes(&frame[8..]);
        let (end, session, _) = run_script(stream, &policy(0));

        assert!(matches!(end, SessionEnd::Disconnected), "{}", end);
        assert_eq!(session.stats().initiated, 1);
    }

    #[test]
    fn test_interrupted_reads_are_retried() {
        let frame = init_frame();
        let stream = ScriptedStream::default()
            .bytes(&frame[..7])
            .errors(io::ErrorKind::Interrupted, 3)
            .bytes(&frame[7..]);
        let (end, session, written) = run_script(stream, &policy(5));

        assert!(matches!(end, SessionEnd::Disconnected), "{}", end);
        assert_eq!(session.stats().initiated, 1);
        assert!(!written.is_empty());
    }

    #[test]
    fn test_too_many_interruptions_end_session() {
        let stream = ScriptedStream::default().errors(io::ErrorKind::Interrupted, 10);
        let (end, _, _) = run_script(stream, &policy(2));
        assert!(matches!(end, SessionEnd::RetriesExhausted(3)), "{}", end);
    }

    #[test]
    fn test_hard_io_error_ends_session() {
        let stream = ScriptedStream::default().errors(io::ErrorKind::ConnectionReset, 1);
        let (end, _, _) = run_script(stream, &policy(5));
        assert!(matches!(end, SessionEnd::Failed(ChannelError::Io(_))), "{}", end);
    }
}
