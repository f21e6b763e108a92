//! 检测器接口 (Detector)
//! 职责: 图像 → 候选检测框 (角点, 类别, 置信度)

use std::fs;
use std::path::Path;

use image::RgbImage;
use tracing::{debug, info};

use super::types::{BBox, Xyah};
use crate::error::DetectError;

/// 目标检测器统一接口
///
/// 会话持有各自的检测器实例; 对会话而言检测器是无状态的 (图像 → 候选框)
pub trait Detector: Send {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BBox>, DetectError>;

    fn name(&self) -> &str {
        "detector"
    }
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BBox>, DetectError> {
        (**self).detect(image)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// 回放检测器: 按帧回放离线生成的合成轨迹文件
///
/// 支持两种行格式:
/// - `frame,x,y,a,h`      (单条轨迹)
/// - `frame,tid,x,y,a,h`  (多条轨迹合并)
///
/// 第 n 次调用返回第 n 帧的所有框, 超过文件末尾后返回空列表
#[derive(Clone, Debug)]
pub struct ReplayDetector {
    frames: Vec<Vec<BBox>>,
    cursor: usize,
    class_id: u32,
}

impl ReplayDetector {
    pub fn from_file(path: impl AsRef<Path>, class_id: u32) -> Result<Self, DetectError> {
        let text = fs::read_to_string(path.as_ref())?;
        let detector = Self::parse(&text, class_id)?;
        info!(
            "📂 回放轨迹已加载: {} ({} 帧)",
            path.as_ref().display(),
            detector.frames.len()
        );
        Ok(detector)
    }

    pub fn parse(text: &str, class_id: u32) -> Result<Self, DetectError> {
        let mut frames: Vec<Vec<BBox>> = Vec::new();

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields = line
                .split(',')
                .map(|f| f.trim().parse::<f64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| DetectError::Parse {
                    line: lineno + 1,
                    reason: e.to_string(),
                })?;

            let (frame, xyah): (f64, Xyah) = match fields.as_slice() {
                [frame, x, y, a, h] => (*frame, [*x, *y, *a, *h]),
                [frame, _tid, x, y, a, h] => (*frame, [*x, *y, *a, *h]),
                _ => {
                    return Err(DetectError::Parse {
                        line: lineno + 1,
                        reason: format!("expected 5 or 6 fields, got {}", fields.len()),
                    })
                }
            };

            if frame < 0.0 || frame.fract() != 0.0 {
                return Err(DetectError::Parse {
                    line: lineno + 1,
                    reason: format!("invalid frame index {}", frame),
                });
            }

            let index = frame as usize;
            if frames.len() <= index {
                frames.resize_with(index + 1, Vec::new);
            }
            frames[index].push(BBox::from_xyah(&xyah).with_class(class_id, 1.0));
        }

        Ok(Self {
            frames,
            cursor: 0,
            class_id,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn class_id(&self) -> u32 {
        self.class_id
    }
}

impl Detector for ReplayDetector {
    fn detect(&mut self, _image: &RgbImage) -> Result<Vec<BBox>, DetectError> {
        let boxes = self.frames.get(self.cursor).cloned().unwrap_or_default();
        debug!("回放第 {} 帧: {} 个框", self.cursor, boxes.len());
        self.cursor += 1;
        Ok(boxes)
    }

    fn name(&self) -> &str {
        "replay"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;

    #[test]
    fn test_parse_single_track() {
        let text = "0,100,100,0.5,40\n1,102,101,0.5,40\n";
        let mut detector = ReplayDetector::parse(text, 1).unwrap();
        assert_eq!(detector.len(), 2);

        let image = RgbImage::new(4, 4);
        let boxes = detector.detect(&image).unwrap();
        assert_eq!(boxes.len(), 1);
        assert_relative_eq!(boxes[0].x1, 90.0);
        assert_eq!(boxes[0].class_id, 1);
        assert_eq!(boxes[0].confidence, 1.0);

        let boxes = detector.detect(&image).unwrap();
        assert_relative_eq!(boxes[0].center().0, 102.0);

        // 文件结束后没有检测
        assert!(detector.detect(&image).unwrap().is_empty());
    }

    #[test]
    fn test_parse_merged_tracks() {
        let text = "# frame,tid,x,y,a,h\n0,0,10,10,1,4\n0,1,50,50,1,4\n2,0,12,12,1,4\n";
        let mut detector = ReplayDetector::parse(text, 1).unwrap();
        let image = RgbImage::new(1, 1);
        assert_eq!(detector.detect(&image).unwrap().len(), 2);
        assert!(detector.detect(&image).unwrap().is_empty());
        assert_eq!(detector.detect(&image).unwrap().len(), 1);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            ReplayDetector::parse("0,1,2\n", 1),
            Err(DetectError::Parse { line: 1, .. })
        ));
        assert!(matches!(
            ReplayDetector::parse("0,1,2,3,4\nx,1,2,3,4\n", 1),
            Err(DetectError::Parse { line: 2, .. })
        ));
        assert!(ReplayDetector::parse("1.5,1,2,3,4\n", 1).is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0,20,20,0.5,10").unwrap();
        let detector = ReplayDetector::from_file(file.path(), 1).unwrap();
        assert_eq!(detector.len(), 1);
        assert_eq!(detector.class_id(), 1);
    }
}
