/// 有界帧缓冲 (Frame Buffer)
/// Bounded producer/consumer queue between a capture source and the consumer
///
/// 生产者线程: 采集 → 缩放 → 入队; 队列满时退避休眠 (不丢帧, 不空转)
/// 消费者: Start 阻塞出队, Pause 重复上一帧, Stop 取完剩余帧后结束
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use image::imageops::{self, FilterType};
use image::RgbImage;
use tracing::{debug, info, warn};

use super::source::FrameSource;
use crate::config::StreamConfig;

/// 阻塞出队时重新检查状态的间隔
const STATE_POLL: Duration = Duration::from_millis(50);

/// 流状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Start = 0,
    Pause = 1,
    Stop = 2,
}

impl StreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => StreamState::Start,
            1 => StreamState::Pause,
            _ => StreamState::Stop,
        }
    }
}

/// 解码后的一帧 (带单调递增序号)
#[derive(Clone, Debug)]
pub struct Frame {
    pub seq: u64,
    pub image: RgbImage,
}

/// 一次读取的结果
#[derive(Clone, Debug)]
pub enum FrameRead {
    /// 新出队的帧
    Fresh(Frame),
    /// 暂停中, 重复上一帧
    Repeated(Frame),
    /// 暂停中且还没有任何帧
    Idle,
    /// 流已结束且队列已空
    EndOfStream,
}

impl FrameRead {
    pub fn frame(&self) -> Option<&Frame> {
        match self {
            FrameRead::Fresh(f) | FrameRead::Repeated(f) => Some(f),
            _ => None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, FrameRead::Fresh(_))
    }

    pub fn is_end(&self) -> bool {
        matches!(self, FrameRead::EndOfStream)
    }
}

/// 生产者与消费者共享的状态
struct Shared {
    state: AtomicU8,
    produced: AtomicU64,
}

impl Shared {
    fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Stop 是终态, 不能被 pause/resume 覆盖
    fn transition(&self, state: StreamState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != StreamState::Stop as u8).then_some(state as u8)
            })
            .is_ok()
    }
}

pub struct FrameBuffer {
    rx: Receiver<Frame>,
    shared: Arc<Shared>,
    capacity: usize,
    resolution: (u32, u32),
    description: String,
    last: Option<Frame>,
    producer: Option<JoinHandle<()>>,
}

impl FrameBuffer {
    /// 启动生产者线程, 立即进入 Start 状态
    pub fn start<S>(source: S, config: &StreamConfig) -> Self
    where
        S: FrameSource + 'static,
    {
        let capacity = config.queue_size.max(1);
        let (tx, rx) = bounded::<Frame>(capacity);
        let shared = Arc::new(Shared {
            state: AtomicU8::new(StreamState::Start as u8),
            produced: AtomicU64::new(0),
        });

        let description = source.describe();
        let producer = Producer {
            source,
            tx,
            shared: shared.clone(),
            resolution: config.resolution(),
            full_backoff: config.full_backoff(),
            pause_idle: config.pause_idle(),
        };

        let handle = thread::Builder::new()
            .name("frame-producer".to_string())
            .spawn(move || producer.run());

        let producer = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("❌ 生产者线程启动失败: {}", e);
                shared.set_state(StreamState::Stop);
                None
            }
        };

        info!(
            "🎬 帧缓冲启动: {} @ {}x{} (队列 {})",
            description, config.width, config.height, capacity
        );

        Self {
            rx,
            shared,
            capacity,
            resolution: config.resolution(),
            description,
            last: None,
            producer,
        }
    }

    /// 读取一帧, 行为取决于当前状态
    pub fn read(&mut self) -> FrameRead {
        loop {
            match self.shared.state() {
                StreamState::Start => match self.rx.recv_timeout(STATE_POLL) {
                    Ok(frame) => return self.fresh(frame),
                    // 状态可能在等待期间改变
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return FrameRead::EndOfStream,
                },
                StreamState::Pause => {
                    if let Some(last) = &self.last {
                        return FrameRead::Repeated(last.clone());
                    }
                    return match self.rx.try_recv() {
                        Ok(frame) => self.fresh(frame),
                        Err(_) => FrameRead::Idle,
                    };
                }
                StreamState::Stop => {
                    return match self.rx.try_recv() {
                        Ok(frame) => self.fresh(frame),
                        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                            FrameRead::EndOfStream
                        }
                    };
                }
            }
        }
    }

    fn fresh(&mut self, frame: Frame) -> FrameRead {
        self.last = Some(frame.clone());
        FrameRead::Fresh(frame)
    }

    pub fn pause(&self) -> bool {
        self.shared.transition(StreamState::Pause)
    }

    pub fn resume(&self) -> bool {
        self.shared.transition(StreamState::Start)
    }

    /// 进入终态 Stop; 生产者在下一轮循环释放采集源
    pub fn stop(&self) {
        self.shared.set_state(StreamState::Stop);
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// 当前队列中的帧数
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.rx.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 生产者累计入队的帧数
    pub fn produced(&self) -> u64 {
        self.shared.produced.load(Ordering::Acquire)
    }

    pub fn resolution(&self) -> (u32, u32) {
        self.resolution
    }
}

impl fmt::Display for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ {}x{} [{}/{} {:?}]",
            self.description,
            self.resolution.0,
            self.resolution.1,
            self.len(),
            self.capacity,
            self.state()
        )
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.producer.take() {
            if handle.join().is_err() {
                warn!("⚠️ 生产者线程异常退出");
            }
        }
    }
}

// ========== 生产者 ==========

struct Producer<S> {
    source: S,
    tx: Sender<Frame>,
    shared: Arc<Shared>,
    resolution: (u32, u32),
    full_backoff: Duration,
    pause_idle: Duration,
}

impl<S: FrameSource> Producer<S> {
    fn run(mut self) {
        let mut seq = 0u64;

        loop {
            match self.shared.state() {
                StreamState::Stop => break,
                StreamState::Pause => {
                    thread::sleep(self.pause_idle);
                }
                StreamState::Start => {
                    if self.tx.is_full() {
                        thread::sleep(self.full_backoff);
                        continue;
                    }

                    match self.source.capture() {
                        Ok(Some(image)) => {
                            let frame = Frame {
                                seq,
                                image: self.resize(image),
                            };
                            // 只有一个生产者, 检查过未满, send 不会阻塞
                            if self.tx.send(frame).is_err() {
                                debug!("消费者已关闭");
                                self.shared.set_state(StreamState::Stop);
                                break;
                            }
                            seq += 1;
                            self.shared.produced.fetch_add(1, Ordering::AcqRel);
                        }
                        Ok(None) => {
                            info!("📹 采集源结束: {} ({} 帧)", self.source.describe(), seq);
                            self.shared.set_state(StreamState::Stop);
                            break;
                        }
                        Err(e) => {
                            warn!("❌ 采集失败: {}", e);
                            self.shared.set_state(StreamState::Stop);
                            break;
                        }
                    }
                }
            }
        }

        self.source.release();
        debug!("生产者线程退出");
    }

    fn resize(&self, image: RgbImage) -> RgbImage {
        let (w, h) = self.resolution;
        if image.dimensions() == (w, h) || w == 0 || h == 0 {
            image
        } else {
            imageops::resize(&image, w, h, FilterType::Triangle)
        }
    }
}
