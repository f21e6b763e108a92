//! 单目标跟踪公共组件
//! Association and track lifecycle for single-object tracking

use super::kalman::{measurement_from_xyah, Belief, KalmanFilter};
use super::types::{BBox, Xyah};
use crate::config::DetectionConfig;
use crate::error::FilterError;

// ========== IOU ==========

/// IOU 面积计算方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IouConvention {
    /// 连续坐标面积
    Continuous,
    /// 离散像素网格, 边界包含在内 (宽 = x2 - x1 + 1)
    PixelInclusive,
}

/// 计算两个边界框的IOU (Intersection over Union)
pub fn compute_iou(bbox1: &BBox, bbox2: &BBox, convention: IouConvention) -> f64 {
    let pad = match convention {
        IouConvention::Continuous => 0.0,
        IouConvention::PixelInclusive => 1.0,
    };

    let x1 = bbox1.x1.max(bbox2.x1);
    let y1 = bbox1.y1.max(bbox2.y1);
    let x2 = bbox1.x2.min(bbox2.x2);
    let y2 = bbox1.y2.min(bbox2.y2);

    let intersection = (x2 - x1 + pad).max(0.0) * (y2 - y1 + pad).max(0.0);
    let area1 = (bbox1.x2 - bbox1.x1 + pad) * (bbox1.y2 - bbox1.y1 + pad);
    let area2 = (bbox2.x2 - bbox2.x1 + pad) * (bbox2.y2 - bbox2.y1 + pad);
    let union = area1 + area2 - intersection;

    if union <= 0.0 {
        return 0.0;
    }

    (intersection / union).clamp(0.0, 1.0)
}

// ========== 关联 ==========

/// 单次关联结果
#[derive(Clone, Debug, PartialEq)]
pub enum Association {
    /// 匹配成功: 候选框序号与IOU
    Matched { index: usize, iou: f64 },
    /// 无候选或最佳IOU低于阈值
    Lost { best_iou: Option<f64> },
}

/// 关联器: 预测框 vs 检测候选框
#[derive(Clone, Debug)]
pub struct Associator {
    target_class: u32,
    min_confidence: f64,
    iou_threshold: f64,
    convention: IouConvention,
}

impl Associator {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            target_class: config.target_class,
            min_confidence: config.min_confidence,
            iou_threshold: config.iou_threshold,
            convention: if config.pixel_inclusive_iou {
                IouConvention::PixelInclusive
            } else {
                IouConvention::Continuous
            },
        }
    }

    /// 只保留目标类别且置信度高于下限的检测框
    pub fn filter_candidates(&self, detections: Vec<BBox>) -> Vec<BBox> {
        detections
            .into_iter()
            .filter(|d| d.class_id == self.target_class && d.confidence > self.min_confidence)
            .collect()
    }

    /// 选出与预测框IOU最大的候选框, 并应用丢失阈值
    ///
    /// 空候选列表直接判定丢失, 单个候选同样要过阈值
    pub fn associate(&self, predicted: &BBox, candidates: &[BBox]) -> Association {
        let best = candidates
            .iter()
            .enumerate()
            .map(|(index, c)| (index, compute_iou(predicted, c, self.convention)))
            .fold(None, |best: Option<(usize, f64)>, (index, iou)| match best {
                Some((_, best_iou)) if best_iou >= iou => best,
                _ => Some((index, iou)),
            });

        match best {
            Some((index, iou)) if iou >= self.iou_threshold => Association::Matched { index, iou },
            Some((_, iou)) => Association::Lost {
                best_iou: Some(iou),
            },
            None => Association::Lost { best_iou: None },
        }
    }
}

// ========== 轨迹生命周期 ==========

/// 轨迹状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackPhase {
    /// 无信念
    Idle,
    /// 已由用户框初始化, 尚未调用检测器
    Initiated,
    /// 预测/关联/更新循环中
    Tracking,
    /// 关联失败, 信念已丢弃
    Lost,
}

/// 单目标轨迹: 信念 + 生命周期 + 最近一次有效框
///
/// 所有状态变化都经过下面的具名转换函数
#[derive(Clone, Debug)]
pub struct Track {
    kalman: KalmanFilter,
    belief: Option<Belief>,
    phase: TrackPhase,
    last_good: Option<Xyah>,
    /// 本轨迹成功更新次数
    hits: u32,
}

impl Track {
    pub fn new() -> Self {
        Self {
            kalman: KalmanFilter::new(),
            belief: None,
            phase: TrackPhase::Idle,
            last_good: None,
            hits: 0,
        }
    }

    pub fn phase(&self) -> TrackPhase {
        self.phase
    }

    pub fn belief(&self) -> Option<&Belief> {
        self.belief.as_ref()
    }

    pub fn has_belief(&self) -> bool {
        self.belief.is_some()
    }

    pub fn last_good(&self) -> Option<Xyah> {
        self.last_good
    }

    pub fn hits(&self) -> u32 {
        self.hits
    }

    /// Idle → Initiated: 由客户端提供的框创建信念
    pub fn initiate(&mut self, xyah: &Xyah) -> Xyah {
        let belief = self.kalman.initiate(&measurement_from_xyah(xyah));
        let initiated = belief.xyah();
        self.belief = Some(belief);
        self.phase = TrackPhase::Initiated;
        self.last_good = Some(initiated);
        self.hits = 0;
        initiated
    }

    /// 预测一步, 返回预测框 (角点形式)
    pub fn predict(&mut self) -> Option<BBox> {
        let predicted = self.kalman.predict(self.belief.as_ref()?);
        let bbox = predicted.to_bbox();
        self.belief = Some(predicted);
        Some(bbox)
    }

    /// 用匹配的检测框校正, 进入 Tracking
    pub fn correct(&mut self, detection: &BBox) -> Result<Option<Xyah>, FilterError> {
        let (Some(belief), Some(xyah)) = (self.belief.as_ref(), detection.to_xyah()) else {
            return Ok(None);
        };
        let updated = self.kalman.update(belief, &measurement_from_xyah(&xyah))?;
        let corrected = updated.xyah();
        self.belief = Some(updated);
        self.phase = TrackPhase::Tracking;
        self.last_good = Some(corrected);
        self.hits += 1;
        Ok(Some(corrected))
    }

    /// 关联失败: 丢弃信念
    pub fn mark_lost(&mut self) {
        self.belief = None;
        self.phase = TrackPhase::Lost;
    }

    /// 客户端取消跟踪: 回到 Idle
    pub fn reset(&mut self) {
        self.belief = None;
        self.phase = TrackPhase::Idle;
        self.hits = 0;
    }
}

impl Default for Track {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn person(x1: f64, y1: f64, x2: f64, y2: f64, conf: f64) -> BBox {
        BBox::new(x1, y1, x2, y2).with_class(1, conf)
    }

    #[test]
    fn test_iou_identity() {
        let b = BBox::new(3.0, 4.0, 40.0, 90.0);
        assert_relative_eq!(compute_iou(&b, &b, IouConvention::Continuous), 1.0);
        assert_relative_eq!(compute_iou(&b, &b, IouConvention::PixelInclusive), 1.0);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(compute_iou(&a, &b, IouConvention::Continuous), 0.0);
        assert_eq!(compute_iou(&a, &b, IouConvention::PixelInclusive), 0.0);
    }

    #[test]
    fn test_iou_known_values() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 5.0, 15.0, 15.0);
        assert_relative_eq!(
            compute_iou(&a, &b, IouConvention::Continuous),
            25.0 / 175.0,
            epsilon = 1e-12
        );
        // 6x6 像素交集, 各 11x11 像素
        assert_relative_eq!(
            compute_iou(&a, &b, IouConvention::PixelInclusive),
            36.0 / 206.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_iou_zero_area() {
        let a = BBox::new(5.0, 5.0, 5.0, 5.0);
        assert_eq!(compute_iou(&a, &a, IouConvention::Continuous), 0.0);
    }

    #[test]
    fn test_filter_candidates() {
        let associator = Associator::new(&DetectionConfig::default());
        let detections = vec![
            person(0.0, 0.0, 10.0, 10.0, 0.9),
            person(0.0, 0.0, 10.0, 10.0, 0.7), // 不严格大于下限
            BBox::new(0.0, 0.0, 10.0, 10.0).with_class(3, 0.99),
        ];
        let kept = associator.filter_candidates(detections);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].confidence, 0.9);
    }

    #[test]
    fn test_associate_picks_best() {
        let associator = Associator::new(&DetectionConfig::default());
        let predicted = BBox::new(100.0, 100.0, 150.0, 150.0);
        let candidates = vec![
            person(130.0, 130.0, 180.0, 180.0, 0.9),
            person(102.0, 101.0, 152.0, 151.0, 0.9),
        ];
        match associator.associate(&predicted, &candidates) {
            Association::Matched { index, iou } => {
                assert_eq!(index, 1);
                assert!(iou > 0.85);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_associate_empty_is_lost() {
        let associator = Associator::new(&DetectionConfig::default());
        let predicted = BBox::new(0.0, 0.0, 10.0, 10.0);
        assert_eq!(
            associator.associate(&predicted, &[]),
            Association::Lost { best_iou: None }
        );
    }

    #[test]
    fn test_single_candidate_still_thresholded() {
        let associator = Associator::new(&DetectionConfig::default());
        let predicted = BBox::new(0.0, 0.0, 10.0, 10.0);
        let candidates = vec![person(5.0, 5.0, 15.0, 15.0, 0.95)];
        match associator.associate(&predicted, &candidates) {
            Association::Lost { best_iou: Some(iou) } => assert!(iou < 0.5),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_track_lifecycle() {
        let mut track = Track::new();
        assert_eq!(track.phase(), TrackPhase::Idle);
        assert!(track.predict().is_none());

        let initiated = track.initiate(&[100.0, 100.0, 1.0, 50.0]);
        assert_eq!(initiated, [100.0, 100.0, 1.0, 50.0]);
        assert_eq!(track.phase(), TrackPhase::Initiated);

        let predicted = track.predict().unwrap();
        assert_relative_eq!(predicted.x1, 75.0);
        assert_relative_eq!(predicted.y2, 125.0);

        let corrected = track
            .correct(&BBox::new(78.0, 75.0, 128.0, 125.0))
            .unwrap()
            .unwrap();
        assert!(corrected[0] > 100.0);
        assert_eq!(track.phase(), TrackPhase::Tracking);
        assert_eq!(track.hits(), 1);
        assert_eq!(track.last_good(), Some(corrected));

        track.mark_lost();
        assert_eq!(track.phase(), TrackPhase::Lost);
        assert!(!track.has_belief());
        assert_eq!(track.last_good(), Some(corrected));

        track.reset();
        assert_eq!(track.phase(), TrackPhase::Idle);
    }

    #[test]
    fn test_correct_rejects_degenerate_box() {
        let mut track = Track::new();
        track.initiate(&[50.0, 50.0, 1.0, 20.0]);
        track.predict();
        assert_eq!(track.correct(&BBox::new(40.0, 40.0, 60.0, 40.0)).unwrap(), None);
        assert_eq!(track.phase(), TrackPhase::Initiated);
    }
}
