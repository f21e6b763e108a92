/// 采集客户端 (Capture Client)
///
/// 消费帧缓冲, 跟踪时把帧发给服务端并应用回复
/// - State: 本地跟踪状态 (具名状态转换)
/// - Sink:  叠加绘制与输出
pub mod state;

pub use state::{SelectionPhase, TrackState, TRAJECTORY_LEN};

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::error::ChannelError;
use crate::input::{Frame, FrameBuffer, FrameRead, StreamState};
use crate::protocol::{Channel, Message, MessageKind};

// ========== 控制事件 ==========

/// 显示/输入端发来的用户意图
#[derive(Clone, Debug, PartialEq)]
pub enum ControlEvent {
    Select {
        top_left: (f64, f64),
        bottom_right: (f64, f64),
    },
    Cancel,
    Pause,
    Resume,
    TogglePause,
    Quit,
}

impl ControlEvent {
    /// 解析一行文本命令
    ///
    /// `p` 暂停, `r` 继续, `t` 或空格 切换, `c` 取消, `q` 退出,
    /// `s x1 y1 x2 y2` 选择目标
    pub fn parse(line: &str) -> Option<Self> {
        if line.trim_end_matches(['\r', '\n']) == " " {
            return Some(ControlEvent::TogglePause);
        }
        let mut parts = line.split_whitespace();
        let event = match parts.next()? {
            "p" | "pause" => ControlEvent::Pause,
            "r" | "resume" => ControlEvent::Resume,
            "t" | "toggle" => ControlEvent::TogglePause,
            "c" | "cancel" => ControlEvent::Cancel,
            "q" | "quit" | "exit" => ControlEvent::Quit,
            "s" | "select" => {
                let coords = parts
                    .map(|p| p.parse::<f64>())
                    .collect::<Result<Vec<_>, _>>()
                    .ok()?;
                let [x1, y1, x2, y2] = coords.as_slice() else {
                    return None;
                };
                ControlEvent::Select {
                    top_left: (*x1, *y1),
                    bottom_right: (*x2, *y2),
                }
            }
            _ => return None,
        };
        Some(event)
    }
}

// ========== 输出 ==========

/// 帧输出接口 (窗口显示由外部实现)
pub trait FrameSink {
    fn present(&mut self, frame: &Frame, state: &TrackState) -> Result<()>;
}

/// 丢弃所有帧
pub struct NullSink;

impl FrameSink for NullSink {
    fn present(&mut self, _frame: &Frame, _state: &TrackState) -> Result<()> {
        Ok(())
    }
}

/// 在图像上绘制跟踪框与轨迹
pub fn draw_overlay(image: &mut RgbImage, state: &TrackState) {
    let color = match state.phase() {
        SelectionPhase::Tracking => Rgb([0, 255, 0]),
        _ => Rgb([255, 255, 0]),
    };

    if let Some(bbox) = state.current() {
        let rect = Rect::at(bbox.x1.round() as i32, bbox.y1.round() as i32)
            .of_size(bbox.width().round().max(1.0) as u32, bbox.height().round().max(1.0) as u32);
        draw_hollow_rect_mut(image, rect, color);
    }

    let points: Vec<_> = state.trajectory().collect();
    for pair in points.windows(2) {
        draw_line_segment_mut(
            image,
            (pair[0].x as f32, pair[0].y as f32),
            (pair[1].x as f32, pair[1].y as f32),
            Rgb([0, 128, 255]),
        );
    }
}

/// 把叠加后的帧写入目录 (frame_000000.jpg ...)
pub struct OverlayWriter {
    dir: PathBuf,
    last_seq: Option<u64>,
    written: u64,
}

impl OverlayWriter {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).with_context(|| format!("无法创建输出目录 {}", dir.display()))?;
        info!("💾 叠加帧输出到: {}", dir.display());
        Ok(Self {
            dir,
            last_seq: None,
            written: 0,
        })
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl FrameSink for OverlayWriter {
    fn present(&mut self, frame: &Frame, state: &TrackState) -> Result<()> {
        // 暂停时同一帧只写一次
        if self.last_seq == Some(frame.seq) {
            return Ok(());
        }
        let mut image = frame.image.clone();
        draw_overlay(&mut image, state);
        let path = self.dir.join(format!("frame_{:06}.jpg", frame.seq));
        image
            .save(&path)
            .with_context(|| format!("写入 {} 失败", path.display()))?;
        self.last_seq = Some(frame.seq);
        self.written += 1;
        Ok(())
    }
}

// ========== 客户端主循环 ==========

/// 客户端统计
#[derive(Clone, Debug, Default)]
pub struct ClientStats {
    pub frames: u64,
    pub sent: u64,
    pub tracked: u64,
    pub lost: u64,
}

pub struct TrackClient<S> {
    channel: Channel<S>,
    connected: bool,
    state: TrackState,
    jpeg_quality: u8,
    display_interval: Duration,
    stats: ClientStats,
}

impl<S: Read + Write> TrackClient<S> {
    pub fn new(channel: Channel<S>, config: &StreamConfig) -> Self {
        Self {
            channel,
            connected: true,
            state: TrackState::new(),
            jpeg_quality: config.jpeg_quality.clamp(1, 100),
            display_interval: config.display_interval(),
            stats: ClientStats::default(),
        }
    }

    pub fn state(&self) -> &TrackState {
        &self.state
    }

    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    /// 应用一个用户意图
    pub fn apply_event(&mut self, event: ControlEvent, buffer: &FrameBuffer) {
        match event {
            ControlEvent::Select {
                top_left,
                bottom_right,
            } => {
                if !self.connected {
                    warn!("⚠️ 与服务端的连接已断开, 忽略选择");
                    return;
                }
                match self.state.select(top_left, bottom_right) {
                    Some(xyah) => info!(
                        "🎯 选择目标: ({:.0}, {:.0}) a={:.2} h={:.0}",
                        xyah[0], xyah[1], xyah[2], xyah[3]
                    ),
                    None => warn!("⚠️ 无效选择 {:?} → {:?}", top_left, bottom_right),
                }
            }
            ControlEvent::Cancel => self.cancel(),
            ControlEvent::Pause => {
                self.state.pause();
                buffer.pause();
                info!("⏸️ 暂停");
            }
            ControlEvent::Resume => {
                self.state.resume();
                buffer.resume();
                info!("▶️ 继续");
            }
            ControlEvent::TogglePause => match self.state.toggle_pause() {
                StreamState::Pause => {
                    buffer.pause();
                    info!("⏸️ 暂停");
                }
                StreamState::Start => {
                    buffer.resume();
                    info!("▶️ 继续");
                }
                StreamState::Stop => {}
            },
            ControlEvent::Quit => {
                self.state.quit();
                buffer.stop();
            }
        }
    }

    /// 取消跟踪并通知服务端
    fn cancel(&mut self) {
        if self.state.cancel() && self.connected {
            if let Err(e) = self.channel.send(&Message::cancel()) {
                warn!("⚠️ 发送取消失败: {}", e);
                self.connected = false;
            }
        }
    }

    /// 发送一帧并等待结果; 返回跟踪是否仍有效
    pub fn exchange(&mut self, frame: &Frame) -> Result<bool> {
        let Some((kind, xyah)) = self.state.outgoing() else {
            return Ok(false);
        };

        let jpeg = encode_jpeg(&frame.image, self.jpeg_quality)?;
        let message = match kind {
            MessageKind::Init => Message::init(xyah, jpeg),
            _ => Message::update(xyah, jpeg),
        };

        self.channel.send(&message).context("发送帧失败")?;
        self.stats.sent += 1;
        let result = loop {
            match self.channel.recv() {
                Err(e @ ChannelError::Io(_)) if e.is_transient() => debug!("接收被中断, 重试"),
                received => break received.context("接收结果失败")?,
            }
        };

        let tracking = self.state.apply_result(&result);
        if tracking {
            self.stats.tracked += 1;
        } else {
            self.stats.lost += 1;
            info!("❌ 帧 {} 目标丢失", frame.seq);
        }
        Ok(tracking)
    }

    /// 消费循环: 直到流结束或用户退出
    pub fn run(
        &mut self,
        buffer: &mut FrameBuffer,
        events: &Receiver<ControlEvent>,
        sink: &mut dyn FrameSink,
    ) -> Result<ClientStats> {
        info!("🎬 客户端启动: {}", buffer);
        let mut last_log = Instant::now();
        let mut frames_since_log = 0u64;

        loop {
            while let Ok(event) = events.try_recv() {
                debug!("控制事件: {:?}", event);
                self.apply_event(event, buffer);
            }
            if self.state.should_quit() {
                break;
            }

            match buffer.read() {
                FrameRead::Fresh(frame) => {
                    self.stats.frames += 1;
                    frames_since_log += 1;
                    if self.state.is_active() && self.connected {
                        if let Err(e) = self.exchange(&frame) {
                            warn!("❌ 与服务端通信失败: {:#}", e);
                            self.connected = false;
                            self.state.cancel();
                        }
                    }
                    sink.present(&frame, &self.state)?;
                }
                FrameRead::Repeated(frame) => sink.present(&frame, &self.state)?,
                FrameRead::Idle => {}
                FrameRead::EndOfStream => {
                    self.state.end_of_stream();
                    info!("📹 视频流结束");
                    break;
                }
            }

            if last_log.elapsed() >= Duration::from_secs(1) {
                let fps = frames_since_log as f64 / last_log.elapsed().as_secs_f64();
                info!(
                    "📊 {:.1} FPS | 队列 {}/{} | {:?}",
                    fps,
                    buffer.len(),
                    buffer.capacity(),
                    self.state.phase()
                );
                last_log = Instant::now();
                frames_since_log = 0;
            }

            if !self.display_interval.is_zero() {
                thread::sleep(self.display_interval);
            }
        }

        buffer.stop();
        self.cancel();
        info!(
            "👋 客户端退出: 帧 {} | 发送 {} | 跟踪 {} | 丢失 {}",
            self.stats.frames, self.stats.sent, self.stats.tracked, self.stats.lost
        );
        Ok(self.stats.clone())
    }
}

/// JPEG压缩
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality)
        .encode_image(image)
        .context("JPEG编码失败")?;
    Ok(bytes)
}
