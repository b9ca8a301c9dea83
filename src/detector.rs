use async_trait::async_trait;
use image::imageops::FilterType;
use image::RgbImage;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::metadata::{BoundingBox, DEFAULT_CLASS};

/// 目标检测后端
///
/// 远程托管接口与本地备用进程实现同一契约，检测流切换到备用路径时只替换这一实现。
#[async_trait]
pub trait Detector: Send + Sync {
    /// 后端名称，用于日志
    fn name(&self) -> &str;

    /// 任务开始前的预检，例如凭据是否已配置
    fn check(&self) -> Result<()> {
        Ok(())
    }

    /// 对一张图像推理，返回的坐标位于传入图像的像素空间
    async fn infer(&self, image: &RgbImage) -> Result<Vec<Prediction>>;
}

/// 推理后端返回的单个预测，(x, y) 为中心点
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Prediction {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub class_name: Option<String>,
}

impl Prediction {
    pub fn new(x: f64, y: f64, width: f64, height: f64, confidence: f64, class: &str) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence,
            class: Some(class.to_string()),
            class_name: None,
        }
    }

    pub fn label(&self) -> &str {
        self.class_name
            .as_deref()
            .or(self.class.as_deref())
            .unwrap_or(DEFAULT_CLASS)
    }

    /// 按两个方向各自的缩放比例映射回原始帧像素空间
    pub fn to_box(&self, scale: Rescale) -> BoundingBox {
        BoundingBox::from_center(
            self.x * scale.x,
            self.y * scale.y,
            self.width * scale.x,
            self.height * scale.y,
            self.confidence,
            self.label(),
        )
    }
}

#[derive(Debug, Deserialize)]
struct PredictionSet {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InferResponse {
    Single(PredictionSet),
    Batch(Vec<PredictionSet>),
}

/// 解析推理响应，兼容单个对象与列表包装两种格式
pub fn parse_predictions(body: &[u8]) -> Result<Vec<Prediction>> {
    let response: InferResponse =
        serde_json::from_slice(body).map_err(|e| Error::Inference(format!("无法解析推理响应: {}", e)))?;
    Ok(match response {
        InferResponse::Single(set) => set.predictions,
        InferResponse::Batch(sets) => sets.into_iter().next().map(|s| s.predictions).unwrap_or_default(),
    })
}

/// 缩放后坐标还原到原始帧的比例（原始 / 缩放后）
///
/// 宽高分别取整，两个方向的比例可能不同。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rescale {
    pub x: f64,
    pub y: f64,
}

impl Rescale {
    pub const IDENTITY: Rescale = Rescale { x: 1.0, y: 1.0 };

    pub fn uniform(factor: f64) -> Self {
        Self { x: factor, y: factor }
    }
}

/// 缩放到长边不超过 `max_edge`，返回缩放后图像与还原比例
pub fn fit_longer_edge(image: RgbImage, max_edge: u32) -> (RgbImage, Rescale) {
    let longer = image.width().max(image.height());
    if max_edge == 0 || longer <= max_edge {
        return (image, Rescale::IDENTITY);
    }
    let ratio = max_edge as f64 / longer as f64;
    let width = ((image.width() as f64 * ratio).round() as u32).max(1);
    let height = ((image.height() as f64 * ratio).round() as u32).max(1);
    let resized = image::imageops::resize(&image, width, height, FilterType::Triangle);
    let scale = Rescale {
        x: image.width() as f64 / width as f64,
        y: image.height() as f64 / height as f64,
    };
    (resized, scale)
}

/// 编码为 JPEG，供远程与本地后端传输
pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, 90)
        .encode(image.as_raw(), image.width(), image.height(), image::ColorType::Rgb8)
        .map_err(|e| Error::Inference(format!("JPEG 编码失败: {}", e)))?;
    Ok(buf)
}
