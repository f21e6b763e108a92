//! 客户端跟踪状态
//! 所有修改都经过具名的状态转换函数

use std::collections::VecDeque;

use crate::detection::{BBox, TrackPoint, Xyah};
use crate::input::StreamState;
use crate::protocol::{Message, MessageKind};

/// 轨迹点最多保留数量
pub const TRAJECTORY_LEN: usize = 30;

/// 选择/跟踪阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectionPhase {
    /// 没有目标
    Idle,
    /// 鼠标按下, 等待松开
    Selecting,
    /// 框已选好, 下一帧发送初始化
    Selected,
    /// 服务端正在跟踪
    Tracking,
}

#[derive(Clone, Debug)]
pub struct TrackState {
    stream: StreamState,
    phase: SelectionPhase,
    anchor: Option<(f64, f64)>,
    current: Option<BBox>,
    trajectory: VecDeque<TrackPoint>,
    quit: bool,
}

impl TrackState {
    pub fn new() -> Self {
        Self {
            stream: StreamState::Start,
            phase: SelectionPhase::Idle,
            anchor: None,
            current: None,
            trajectory: VecDeque::with_capacity(TRAJECTORY_LEN),
            quit: false,
        }
    }

    pub fn phase(&self) -> SelectionPhase {
        self.phase
    }

    pub fn stream(&self) -> StreamState {
        self.stream
    }

    pub fn current(&self) -> Option<&BBox> {
        self.current.as_ref()
    }

    pub fn trajectory(&self) -> impl Iterator<Item = &TrackPoint> {
        self.trajectory.iter()
    }

    pub fn should_quit(&self) -> bool {
        self.quit
    }

    /// 是否需要把当前帧发给服务端
    pub fn is_active(&self) -> bool {
        matches!(self.phase, SelectionPhase::Selected | SelectionPhase::Tracking)
    }

    // ========== 选择 ==========

    /// 鼠标按下; 跟踪中忽略
    pub fn begin_selection(&mut self, point: (f64, f64)) -> bool {
        if matches!(self.phase, SelectionPhase::Tracking | SelectionPhase::Selected) {
            return false;
        }
        self.anchor = Some(point);
        self.phase = SelectionPhase::Selecting;
        true
    }

    /// 鼠标松开; 面积为零的框作废
    pub fn finish_selection(&mut self, point: (f64, f64)) -> Option<Xyah> {
        if self.phase != SelectionPhase::Selecting {
            return None;
        }
        let anchor = self.anchor.take()?;
        let bbox = BBox::from_corners(anchor, point);
        match bbox.to_xyah().filter(|_| bbox.width() > 0.0) {
            Some(xyah) => {
                self.phase = SelectionPhase::Selected;
                self.current = Some(bbox);
                self.trajectory.clear();
                Some(xyah)
            }
            None => {
                self.phase = SelectionPhase::Idle;
                None
            }
        }
    }

    pub fn select(&mut self, top_left: (f64, f64), bottom_right: (f64, f64)) -> Option<Xyah> {
        if !self.begin_selection(top_left) {
            return None;
        }
        self.finish_selection(bottom_right)
    }

    /// 当前应该发给服务端的消息 (不含图像)
    pub fn outgoing(&self) -> Option<(MessageKind, Xyah)> {
        let xyah = self.current.as_ref()?.to_xyah()?;
        match self.phase {
            SelectionPhase::Selected => Some((MessageKind::Init, xyah)),
            SelectionPhase::Tracking => Some((MessageKind::Update, xyah)),
            _ => None,
        }
    }

    // ========== 服务端结果 ==========

    /// 应用服务端回复; 返回跟踪是否仍然有效
    pub fn apply_result(&mut self, result: &Message) -> bool {
        if !self.is_active() {
            return false;
        }

        match result.primary_box().filter(|_| result.state) {
            Some(xyah) => {
                let bbox = BBox::from_xyah(xyah);
                let (cx, cy) = bbox.center();
                if self.trajectory.len() == TRAJECTORY_LEN {
                    self.trajectory.pop_front();
                }
                self.trajectory.push_back(TrackPoint { x: cx, y: cy });
                self.current = Some(bbox);
                self.phase = SelectionPhase::Tracking;
                true
            }
            None => {
                self.clear();
                false
            }
        }
    }

    /// 用户取消; 返回之前是否在跟踪 (需要通知服务端)
    pub fn cancel(&mut self) -> bool {
        let was_active = self.is_active();
        self.clear();
        was_active
    }

    fn clear(&mut self) {
        self.phase = SelectionPhase::Idle;
        self.anchor = None;
        self.current = None;
        self.trajectory.clear();
    }

    // ========== 播放控制 ==========

    pub fn pause(&mut self) {
        if self.stream == StreamState::Start {
            self.stream = StreamState::Pause;
        }
    }

    pub fn resume(&mut self) {
        if self.stream == StreamState::Pause {
            self.stream = StreamState::Start;
        }
    }

    pub fn toggle_pause(&mut self) -> StreamState {
        match self.stream {
            StreamState::Start => self.pause(),
            StreamState::Pause => self.resume(),
            StreamState::Stop => {}
        }
        self.stream
    }

    /// 视频流结束或采集失败; 与退出不同, 不要求关闭程序
    pub fn end_of_stream(&mut self) {
        self.stream = StreamState::Stop;
    }

    pub fn quit(&mut self) {
        self.stream = StreamState::Stop;
        self.quit = true;
    }
}

impl Default for TrackState {
    fn default() -> Self {
        Self::new()
    }
}
