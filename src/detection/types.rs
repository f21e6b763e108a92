/// 跟踪系统数据结构定义
/// Data structures for the tracking core

// ========== 公共类型 ==========

/// 观测向量 [cx, cy, a, h]: 中心点, 宽高比 (w/h), 高度
pub type Xyah = [f64; 4];

/// 检测框 (Detection bounding box, 左上/右下角点)
#[derive(Clone, Debug, PartialEq)]
pub struct BBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
    pub confidence: f64,
    pub class_id: u32,
}

impl BBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            confidence: 1.0,
            class_id: 0,
        }
    }

    pub fn with_class(mut self, class_id: u32, confidence: f64) -> Self {
        self.class_id = class_id;
        self.confidence = confidence;
        self
    }

    /// 由两个角点构造 (鼠标拖拽方向任意)
    pub fn from_corners(a: (f64, f64), b: (f64, f64)) -> Self {
        Self::new(a.0.min(b.0), a.1.min(b.1), a.0.max(b.0), a.1.max(b.1))
    }

    /// 由 [cx, cy, a, h] 构造
    pub fn from_xyah(xyah: &Xyah) -> Self {
        let [cx, cy, a, h] = *xyah;
        let w = a * h;
        Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    /// 转换为 [cx, cy, a, h]
    ///
    /// 高度为零的框没有定义宽高比, 返回 None
    pub fn to_xyah(&self) -> Option<Xyah> {
        let h = self.height();
        if h <= 0.0 {
            return None;
        }
        let (cx, cy) = self.center();
        Some([cx, cy, self.width() / h, h])
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    /// 获取中心点
    pub fn center(&self) -> (f64, f64) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }
}

/// 跟踪点 (用于绘制轨迹)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackPoint {
    pub x: f64,
    pub y: f64,
}
