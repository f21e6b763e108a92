//! 采集源 (Capture Sources)
//! 职责: 产出原始图像帧, None 表示流结束

use std::fs;
use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use tracing::{debug, info};

use crate::error::CaptureError;

/// 采集源统一接口
pub trait FrameSource: Send {
    /// 读取下一帧; `Ok(None)` 表示流正常结束
    fn capture(&mut self) -> Result<Option<RgbImage>, CaptureError>;

    /// 释放底层资源
    fn release(&mut self) {}

    fn describe(&self) -> String;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn capture(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        (**self).capture()
    }

    fn release(&mut self) {
        (**self).release()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

// ========== 图像序列 ==========

const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "ppm", "tiff"];

/// 图像序列: 目录中的图片 (按文件名排序) 或单张图片
pub struct ImageSequence {
    origin: PathBuf,
    files: Vec<PathBuf>,
    cursor: usize,
}

impl ImageSequence {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        let files = if path.is_dir() {
            let mut files: Vec<PathBuf> = fs::read_dir(path)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| {
                    p.extension()
                        .and_then(|e| e.to_str())
                        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                        .unwrap_or(false)
                })
                .collect();
            files.sort();
            files
        } else if path.is_file() {
            vec![path.to_path_buf()]
        } else {
            return Err(CaptureError::Open {
                source_id: path.display().to_string(),
                reason: "no such file or directory".to_string(),
            });
        };

        if files.is_empty() {
            return Err(CaptureError::Open {
                source_id: path.display().to_string(),
                reason: "no image files found".to_string(),
            });
        }

        info!("📂 图像序列: {} ({} 张)", path.display(), files.len());
        Ok(Self {
            origin: path.to_path_buf(),
            files,
            cursor: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for ImageSequence {
    fn capture(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        let Some(path) = self.files.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        debug!("读取图像: {}", path.display());
        Ok(Some(image::open(path)?.to_rgb8()))
    }

    fn release(&mut self) {
        self.cursor = self.files.len();
    }

    fn describe(&self) -> String {
        format!("images:{}", self.origin.display())
    }
}

// ========== 合成场景 ==========

/// 合成源: 灰色背景上匀速移动的矩形目标
#[derive(Clone, Debug)]
pub struct SyntheticSource {
    width: u32,
    height: u32,
    limit: Option<u64>,
    produced: u64,
    /// 目标左上角与速度 (像素/帧)
    position: (f64, f64),
    velocity: (f64, f64),
    size: (u32, u32),
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, limit: Option<u64>) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            limit,
            produced: 0,
            position: (width as f64 * 0.1, height as f64 * 0.2),
            velocity: (4.0, 2.0),
            size: ((width / 10).max(1), (height / 4).max(1)),
        }
    }

    pub fn with_motion(mut self, position: (f64, f64), velocity: (f64, f64)) -> Self {
        self.position = position;
        self.velocity = velocity;
        self
    }

    /// 当前帧目标的角点 (x1, y1, x2, y2)
    pub fn target_corners(&self) -> (f64, f64, f64, f64) {
        let (x, y) = self.position;
        (x, y, x + self.size.0 as f64, y + self.size.1 as f64)
    }

    fn render(&self) -> RgbImage {
        let (x1, y1, x2, y2) = self.target_corners();
        RgbImage::from_fn(self.width, self.height, |px, py| {
            let (fx, fy) = (px as f64, py as f64);
            if fx >= x1 && fx < x2 && fy >= y1 && fy < y2 {
                Rgb([220, 40, 40])
            } else {
                Rgb([64, 64, 64])
            }
        })
    }

    /// 走一步, 碰到边界反弹
    fn advance(&mut self) {
        let max_x = self.width.saturating_sub(self.size.0) as f64;
        let max_y = self.height.saturating_sub(self.size.1) as f64;

        let (mut x, mut y) = (
            self.position.0 + self.velocity.0,
            self.position.1 + self.velocity.1,
        );
        if x < 0.0 || x > max_x {
            self.velocity.0 = -self.velocity.0;
            x = x.clamp(0.0, max_x);
        }
        if y < 0.0 || y > max_y {
            self.velocity.1 = -self.velocity.1;
            y = y.clamp(0.0, max_y);
        }
        self.position = (x, y);
    }
}

impl FrameSource for SyntheticSource {
    fn capture(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        if self.limit.is_some_and(|limit| self.produced >= limit) {
            return Ok(None);
        }
        let frame = self.render();
        self.advance();
        self.produced += 1;
        Ok(Some(frame))
    }

    fn describe(&self) -> String {
        match self.limit {
            Some(limit) => format!("synthetic:{}", limit),
            None => "synthetic".to_string(),
        }
    }
}

/// 按源标识打开采集源
///
/// - `synthetic` / `synthetic:N`: 合成场景 (可选帧数上限)
/// - 目录或图片路径: 图像序列
/// - 其它 (如摄像头序号): 不支持, 视频解码由外部负责
pub fn open_source(id: &str, resolution: (u32, u32)) -> Result<Box<dyn FrameSource>, CaptureError> {
    if let Some(rest) = id.strip_prefix("synthetic") {
        let limit = match rest.strip_prefix(':') {
            Some(n) => Some(n.parse::<u64>().map_err(|e| CaptureError::Open {
                source_id: id.to_string(),
                reason: e.to_string(),
            })?),
            None if rest.is_empty() => None,
            None => return Err(CaptureError::Unsupported(id.to_string())),
        };
        return Ok(Box::new(SyntheticSource::new(
            resolution.0,
            resolution.1,
            limit,
        )));
    }

    let path = Path::new(id);
    if path.exists() {
        return Ok(Box::new(ImageSequence::open(path)?));
    }

    Err(CaptureError::Unsupported(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_limit() {
        let mut source = SyntheticSource::new(64, 48, Some(3));
        for _ in 0..3 {
            let frame = source.capture().unwrap().unwrap();
            assert_eq!(frame.dimensions(), (64, 48));
        }
        assert!(source.capture().unwrap().is_none());
    }

    #[test]
    fn test_synthetic_target_moves() {
        let mut source = SyntheticSource::new(200, 100, None).with_motion((10.0, 10.0), (5.0, 0.0));
        let frame = source.capture().unwrap().unwrap();
        assert_eq!(frame.get_pixel(12, 12), &Rgb([220, 40, 40]));
        assert_eq!(frame.get_pixel(0, 0), &Rgb([64, 64, 64]));
        assert_eq!(source.target_corners().0, 15.0);
    }

    #[test]
    fn test_open_source_ids() {
        assert_eq!(open_source("synthetic", (32, 32)).unwrap().describe(), "synthetic");
        assert_eq!(
            open_source("synthetic:10", (32, 32)).unwrap().describe(),
            "synthetic:10"
        );
        assert!(matches!(
            open_source("synthetic:x", (32, 32)),
            Err(CaptureError::Open { .. })
        ));
        assert!(matches!(
            open_source("0", (32, 32)),
            Err(CaptureError::Unsupported(_))
        ));
    }

    #[test]
    fn test_image_sequence_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for (name, shade) in [("b.png", 20u8), ("a.png", 10u8), ("notes.txt", 0u8)] {
            let path = dir.path().join(name);
            if name.ends_with(".png") {
                RgbImage::from_pixel(4, 4, Rgb([shade; 3])).save(&path).unwrap();
            } else {
                fs::write(&path, "x").unwrap();
            }
        }

        let mut seq = ImageSequence::open(dir.path()).unwrap();
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.capture().unwrap().unwrap().get_pixel(0, 0), &Rgb([10; 3]));
        assert_eq!(seq.capture().unwrap().unwrap().get_pixel(0, 0), &Rgb([20; 3]));
        assert!(seq.capture().unwrap().is_none());
    }

    #[test]
    fn test_image_sequence_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ImageSequence::open(dir.path()),
            Err(CaptureError::Open { .. })
        ));
    }
}
