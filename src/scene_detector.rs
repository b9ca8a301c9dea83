use image::{Rgb, RgbImage};
use std::ops::ControlFlow;
use std::time::Instant;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::metadata::{ContentScore, Segment};
use crate::video_processor::FrameSource;

/// 场景检测参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneConfig {
    /// 内容变化阈值（0-255），分数严格大于阈值才视为候选切点
    pub threshold: f64,
    /// 最小场景长度（帧），从上一切点到候选帧（含两端）计数
    pub min_scene_len: u64,
    /// 线性降采样倍数
    pub downscale: u32,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            threshold: 70.0,
            min_scene_len: 15,
            downscale: 4,
        }
    }
}

/// 降采样后的 HSV 平面，H 取 0-180，S/V 取 0-255
#[derive(Debug, Clone)]
pub struct HsvPlanes {
    width: u32,
    height: u32,
    hue: Vec<u8>,
    sat: Vec<u8>,
    val: Vec<u8>,
}

impl HsvPlanes {
    /// 每隔 `downscale` 个像素取一个样本
    pub fn from_image(image: &RgbImage, downscale: u32) -> Self {
        let step = downscale.max(1) as usize;
        let width = image.width().div_ceil(step as u32);
        let height = image.height().div_ceil(step as u32);
        let capacity = (width * height) as usize;
        let mut hue = Vec::with_capacity(capacity);
        let mut sat = Vec::with_capacity(capacity);
        let mut val = Vec::with_capacity(capacity);

        for y in (0..image.height()).step_by(step) {
            for x in (0..image.width()).step_by(step) {
                let [h, s, v] = pixel_hsv(image.get_pixel(x, y));
                hue.push(h);
                sat.push(s);
                val.push(v);
            }
        }

        Self { width, height, hue, sat, val }
    }
}

/// 单个像素转为 HSV 字节：H 以 2° 为单位取 [0, 180)，S/V 取 [0, 255]
fn pixel_hsv(pixel: &Rgb<u8>) -> [u8; 3] {
    let [r, g, b] = pixel.0.map(i32::from);
    let max = r.max(g).max(b);
    let chroma = max - r.min(g).min(b);
    if chroma == 0 {
        return [0, 0, max as u8];
    }

    let sat = (255 * chroma + max / 2) / max;
    let sector = if max == r {
        (g - b) as f64 / chroma as f64
    } else if max == g {
        2.0 + (b - r) as f64 / chroma as f64
    } else {
        4.0 + (r - g) as f64 / chroma as f64
    };
    // 每个六分区占 30 个单位
    let hue = ((sector * 30.0).rem_euclid(180.0).round() as i32) % 180;

    [hue as u8, sat as u8, max as u8]
}

fn mean_abs_diff(a: &[u8], b: &[u8]) -> f64 {
    if a.is_empty() {
        return 0.0;
    }
    let sum: u64 = a
        .iter()
        .zip(b)
        .map(|(x, y)| (*x as i32 - *y as i32).unsigned_abs() as u64)
        .sum();
    sum as f64 / a.len() as f64
}

/// 内容变化分数：H/S/V 三个通道平均绝对差的均值
///
/// 尺寸不同的两帧视为完全不同，返回 255。
pub fn content_score(prev: &HsvPlanes, cur: &HsvPlanes) -> f64 {
    if prev.width != cur.width || prev.height != cur.height {
        return 255.0;
    }
    let dh = mean_abs_diff(&prev.hue, &cur.hue);
    let ds = mean_abs_diff(&prev.sat, &cur.sat);
    let dv = mean_abs_diff(&prev.val, &cur.val);
    (dh + ds + dv) / 3.0
}

/// 阈值 + 最小长度过滤，逐帧在线判断
#[derive(Debug, Clone)]
struct BoundaryFilter {
    threshold: f64,
    min_scene_len: u64,
    last_boundary: u64,
}

impl BoundaryFilter {
    fn new(config: &SceneConfig) -> Self {
        Self {
            threshold: config.threshold,
            min_scene_len: config.min_scene_len.max(1),
            last_boundary: 0,
        }
    }

    /// 候选帧被接受为切点时返回 true
    fn observe(&mut self, score: ContentScore) -> bool {
        if score.score <= self.threshold {
            return false;
        }
        let run = score.frame_index.saturating_sub(self.last_boundary) + 1;
        if run < self.min_scene_len {
            return false;
        }
        self.last_boundary = score.frame_index;
        true
    }
}

/// 场景检测器，把内容变化信号转换为连续、无重叠的片段
pub struct SceneDetector {
    config: SceneConfig,
}

impl SceneDetector {
    pub fn new(config: SceneConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    /// 由分数序列计算被接受的切点帧序号
    pub fn boundaries_from_scores(&self, scores: &[ContentScore]) -> Vec<u64> {
        let mut filter = BoundaryFilter::new(&self.config);
        scores
            .iter()
            .filter(|s| filter.observe(**s))
            .map(|s| s.frame_index)
            .collect()
    }

    /// 由切点时间构造覆盖 [0, duration) 的片段列表
    pub fn segments_from_boundaries(boundary_times: &[f64], duration: f64) -> Vec<Segment> {
        let mut segments = Vec::with_capacity(boundary_times.len() + 1);
        let mut start = 0.0;
        for &t in boundary_times {
            if t <= start || t >= duration {
                continue;
            }
            segments.push(Segment { start, end: t });
            start = t;
        }
        if duration > start {
            segments.push(Segment { start, end: duration });
        }
        segments
    }

    /// 解码整段视频并输出片段列表；解码失败时不返回部分结果
    pub fn detect_scenes(&self, source: &mut dyn FrameSource) -> Result<Vec<Segment>> {
        let start = Instant::now();
        let info = source.info();
        info!(
            "⏳ [场景检测] 开始检测: threshold={:.1}, min_scene_len={} 帧, downscale={}",
            self.config.threshold, self.config.min_scene_len, self.config.downscale
        );

        let mut filter = BoundaryFilter::new(&self.config);
        let mut previous: Option<HsvPlanes> = None;
        let mut boundary_times = Vec::new();
        let mut last_timestamp = 0.0;
        let mut frame_count = 0u64;

        source.for_each_frame(&mut |frame| {
            let planes = HsvPlanes::from_image(&frame.image, self.config.downscale);
            if let Some(prev) = previous.as_ref() {
                let score = ContentScore {
                    frame_index: frame.index,
                    score: content_score(prev, &planes),
                };
                if filter.observe(score) {
                    debug!("[场景检测] 切点: 帧 {} ({:.2}s) score={:.1}", frame.index, frame.timestamp, score.score);
                    boundary_times.push(frame.timestamp);
                }
            }
            previous = Some(planes);
            last_timestamp = frame.timestamp;
            frame_count += 1;
            ControlFlow::Continue(())
        })?;

        if frame_count == 0 {
            return Err(Error::Decode("视频中没有可解码的帧".to_string()));
        }

        // 容器未提供时长时，以最后一帧再延伸一帧作为结束
        let duration = if info.duration > last_timestamp {
            info.duration
        } else {
            last_timestamp + 1.0 / info.fps.max(1.0)
        };

        let segments = Self::segments_from_boundaries(&boundary_times, duration);
        info!(
            "✅ [场景检测] 完成: {} 帧, {} 个片段, 耗时 {:.2}秒",
            frame_count,
            segments.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(segments)
    }
}

impl Default for SceneDetector {
    fn default() -> Self {
        Self::new(SceneConfig::default())
    }
}
