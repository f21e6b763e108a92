//! 卡尔曼滤波器 (Kalman filter in image space)
//!
//! 状态向量: [x, y, a, h, vx, vy, va, vh]
//! - (x, y): 边界框中心点
//! - a: 宽高比 (w / h)
//! - h: 高度
//! - v*: 对应的速度
//!
//! 运动模型为匀速模型, (x, y, a, h) 直接作为观测。
//! 噪声标准差与高度成正比, 使滤波器对目标远近尺度不变。

use nalgebra::{SMatrix, SVector};

use super::types::{BBox, Xyah};
use crate::error::FilterError;

pub type Mean = SVector<f64, 8>;
pub type Covariance = SMatrix<f64, 8, 8>;
pub type Measurement = SVector<f64, 4>;
pub type ProjectedCovariance = SMatrix<f64, 4, 4>;

const NDIM: usize = 4;
const DT: f64 = 1.0;

/// 单个目标的信念 (均值 + 协方差), 每一步整体替换
#[derive(Clone, Debug, PartialEq)]
pub struct Belief {
    pub mean: Mean,
    pub covariance: Covariance,
}

impl Belief {
    /// 观测空间部分 [x, y, a, h]
    pub fn xyah(&self) -> Xyah {
        [self.mean[0], self.mean[1], self.mean[2], self.mean[3]]
    }

    /// 速度部分 [vx, vy, va, vh]
    pub fn velocity(&self) -> [f64; 4] {
        [self.mean[4], self.mean[5], self.mean[6], self.mean[7]]
    }

    pub fn to_bbox(&self) -> BBox {
        BBox::from_xyah(&self.xyah())
    }
}

/// 卡尔曼滤波器 (无状态, 所有操作都是纯函数)
#[derive(Clone, Debug)]
pub struct KalmanFilter {
    /// 状态转移矩阵 F (8x8)
    motion_mat: SMatrix<f64, 8, 8>,
    /// 观测矩阵 H (4x8)
    update_mat: SMatrix<f64, 4, 8>,
    /// 位置噪声权重
    std_weight_position: f64,
    /// 速度噪声权重
    std_weight_velocity: f64,
}

impl KalmanFilter {
    pub fn new() -> Self {
        let mut motion_mat = SMatrix::<f64, 8, 8>::identity();
        for i in 0..NDIM {
            motion_mat[(i, NDIM + i)] = DT;
        }

        Self {
            motion_mat,
            update_mat: SMatrix::<f64, 4, 8>::identity(),
            std_weight_position: 1.0 / 20.0,
            std_weight_velocity: 1.0 / 160.0,
        }
    }

    /// 由未关联的观测创建新轨迹
    pub fn initiate(&self, measurement: &Measurement) -> Belief {
        let mut mean = Mean::zeros();
        mean.fixed_rows_mut::<4>(0).copy_from(measurement);

        let h = measurement[3];
        let std = Mean::from_column_slice(&[
            2.0 * self.std_weight_position * h,
            2.0 * self.std_weight_position * h,
            1e-2,
            2.0 * self.std_weight_position * h,
            10.0 * self.std_weight_velocity * h,
            10.0 * self.std_weight_velocity * h,
            1e-5,
            10.0 * self.std_weight_velocity * h,
        ]);

        Belief {
            mean,
            covariance: Covariance::from_diagonal(&std.component_mul(&std)),
        }
    }

    /// 预测: x' = F x, P' = F P Fᵀ + Q
    ///
    /// Q 使用当前均值的高度, 而不是初始观测的高度
    pub fn predict(&self, belief: &Belief) -> Belief {
        let h = belief.mean[3];
        let std = Mean::from_column_slice(&[
            self.std_weight_position * h,
            self.std_weight_position * h,
            1e-2,
            self.std_weight_position * h,
            self.std_weight_velocity * h,
            self.std_weight_velocity * h,
            1e-5,
            self.std_weight_velocity * h,
        ]);
        let motion_cov = Covariance::from_diagonal(&std.component_mul(&std));

        Belief {
            mean: self.motion_mat * belief.mean,
            covariance: self.motion_mat * belief.covariance * self.motion_mat.transpose()
                + motion_cov,
        }
    }

    /// 投影到观测空间: z = H x, S = H P Hᵀ + R
    pub fn project(&self, belief: &Belief) -> (Measurement, ProjectedCovariance) {
        let h = belief.mean[3];
        let std = Measurement::new(
            self.std_weight_position * h,
            self.std_weight_position * h,
            1e-1,
            self.std_weight_position * h,
        );
        let innovation_cov = ProjectedCovariance::from_diagonal(&std.component_mul(&std));

        let mean = self.update_mat * belief.mean;
        let covariance =
            self.update_mat * belief.covariance * self.update_mat.transpose() + innovation_cov;
        (mean, covariance)
    }

    /// 校正: 用观测更新信念
    ///
    /// 卡尔曼增益通过对 S 做 Cholesky 分解后求解 S Kᵀ = (P Hᵀ)ᵀ 得到, 不显式求逆。
    pub fn update(&self, belief: &Belief, measurement: &Measurement) -> Result<Belief, FilterError> {
        let (projected_mean, projected_cov) = self.project(belief);

        let chol = projected_cov
            .cholesky()
            .ok_or(FilterError::NumericalDegeneracy)?;
        let pht = belief.covariance * self.update_mat.transpose();
        let kalman_gain: SMatrix<f64, 8, 4> = chol.solve(&pht.transpose()).transpose();

        let innovation = measurement - projected_mean;
        let mean = belief.mean + kalman_gain * innovation;
        let covariance =
            belief.covariance - kalman_gain * projected_cov * kalman_gain.transpose();

        Ok(Belief {
            mean,
            // 消除舍入误差带来的不对称
            covariance: (covariance + covariance.transpose()) * 0.5,
        })
    }
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// [cx, cy, a, h] → 观测向量
pub fn measurement_from_xyah(xyah: &Xyah) -> Measurement {
    Measurement::new(xyah[0], xyah[1], xyah[2], xyah[3])
}
