use image::RgbImage;
use serde::{Deserialize, Serialize};

/// 进球事件的类别标签
pub const MADE_BASKET_CLASS: &str = "Made-Basket";
/// 推理结果缺失类别时使用的默认标签
pub const DEFAULT_CLASS: &str = "Basketball";

/// 解码后的单帧
#[derive(Debug, Clone)]
pub struct Frame {
    /// 原视频中的帧序号（从 0 开始）
    pub index: u64,
    /// 时间戳（秒）
    pub timestamp: f64,
    /// RGB 像素
    pub image: RgbImage,
}

impl Frame {
    pub fn new(index: u64, timestamp: f64, image: RgbImage) -> Self {
        Self { index, timestamp, image }
    }
}

/// 视频基本信息
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    /// 帧率
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// 视频总帧数（容器未提供时按时长估算）
    pub total_frames: u64,
    /// 视频真实时长（秒）
    pub duration: f64,
}

impl VideoInfo {
    /// 按采样步长计算需要推理的帧数
    pub fn frames_to_process(&self, frame_skip: usize) -> usize {
        let skip = frame_skip.max(1) as u64;
        (self.total_frames.div_ceil(skip)) as usize
    }
}

/// 相邻两帧的内容变化分数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContentScore {
    pub frame_index: u64,
    pub score: f64,
}

/// 视频片段，区间为 [start, end)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
}

impl Segment {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.end
    }
}

/// 检测框，坐标位于原始帧像素空间，(x, y) 为左上角
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i64,
    pub y: i64,
    pub w: i64,
    pub h: i64,
    pub confidence: f64,
    #[serde(rename = "class")]
    pub class_label: String,
}

impl BoundingBox {
    /// 由中心点坐标构造，结果取整，置信度保留三位小数
    pub fn from_center(cx: f64, cy: f64, w: f64, h: f64, confidence: f64, class_label: impl Into<String>) -> Self {
        Self {
            x: (cx - w / 2.0).round() as i64,
            y: (cy - h / 2.0).round() as i64,
            w: w.round() as i64,
            h: h.round() as i64,
            confidence: round_to(confidence, 3),
            class_label: class_label.into(),
        }
    }

    pub fn is_made_basket(&self) -> bool {
        self.class_label == MADE_BASKET_CLASS
    }
}

/// 单个采样帧的检测结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    #[serde(rename = "frame")]
    pub frame_index: u64,
    #[serde(rename = "time")]
    pub timestamp: f64,
    pub boxes: Vec<BoundingBox>,
}

impl DetectionRecord {
    pub fn new(frame_index: u64, timestamp: f64, boxes: Vec<BoundingBox>) -> Self {
        Self {
            frame_index,
            timestamp: round_to(timestamp, 3),
            boxes,
        }
    }

    pub fn empty(frame_index: u64, timestamp: f64) -> Self {
        Self::new(frame_index, timestamp, Vec::new())
    }

    /// 是否包含进球事件
    pub fn has_made_basket(&self) -> bool {
        self.boxes.iter().any(BoundingBox::is_made_basket)
    }
}

/// 返回包含进球事件的片段下标，用于自动选取精彩片段
pub fn segments_with_made_baskets(segments: &[Segment], records: &[DetectionRecord]) -> Vec<usize> {
    let make_times: Vec<f64> = records
        .iter()
        .filter(|r| r.has_made_basket())
        .map(|r| r.timestamp)
        .collect();

    segments
        .iter()
        .enumerate()
        .filter(|(_, seg)| make_times.iter().any(|t| seg.contains(*t)))
        .map(|(i, _)| i)
        .collect()
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
