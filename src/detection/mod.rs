/// 跟踪核心 (Tracking Core)
///
/// 服务端每个会话独立持有
/// - Kalman:   卡尔曼滤波 (信念的预测/校正)
/// - Tracker:  IOU关联与轨迹生命周期
/// - Detector: 检测器接口 (外部协作者)
pub mod detector;
pub mod kalman;
pub mod tracker;
pub mod types;

pub use detector::{Detector, ReplayDetector};
pub use kalman::{Belief, KalmanFilter};
pub use tracker::{compute_iou, Association, Associator, IouConvention, Track, TrackPhase};
pub use types::{BBox, TrackPoint, Xyah};
