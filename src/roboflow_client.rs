use async_trait::async_trait;
use base64::Engine;
use image::RgbImage;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

use crate::detector::{encode_jpeg, parse_predictions, Detector, Prediction};
use crate::error::{Error, Result};

pub const DEFAULT_API_URL: &str = "https://detect.roboflow.com";
pub const DEFAULT_MODEL_ID: &str = "made-baskets-gswke/1";

/// Roboflow 托管推理接口配置
#[derive(Debug, Clone)]
pub struct RoboflowConfig {
    pub api_url: String,
    pub model_id: String,
    pub api_key: Option<String>,
    /// 服务端预过滤的置信度
    pub confidence: f64,
    pub overlap: f64,
    pub timeout: Duration,
}

impl Default for RoboflowConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            model_id: DEFAULT_MODEL_ID.to_string(),
            api_key: std::env::var("ROBOFLOW_API_KEY").ok().filter(|k| !k.is_empty()),
            confidence: 0.25,
            overlap: 0.5,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Roboflow 托管推理客户端
///
/// 图像以 base64 编码的 JPEG 作为请求体发送。错误按认证、限流、不可达和普通失败分类。
pub struct RoboflowClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    confidence: f64,
    overlap: f64,
    timeout: Duration,
}

impl RoboflowClient {
    /// 创建客户端；API Key 缺失时由 `check` 与 `infer` 报告认证错误
    pub fn new(config: &RoboflowConfig) -> Result<Self> {
        let api_key = config.api_key.clone().filter(|k| !k.is_empty());

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            http,
            endpoint: format!("{}/{}", config.api_url.trim_end_matches('/'), config.model_id),
            api_key,
            confidence: config.confidence,
            overlap: config.overlap,
            timeout: config.timeout,
        })
    }

    fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| Error::BackendAuth("ROBOFLOW_API_KEY is required".to_string()))
    }

    fn classify_send_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout(self.timeout)
        } else if e.is_connect() {
            Error::BackendUnavailable(e.to_string())
        } else {
            Error::Inference(e.to_string())
        }
    }

    fn classify_status(status: StatusCode, body: &str) -> Error {
        let detail = format!("HTTP {}: {}", status.as_u16(), body.chars().take(200).collect::<String>());
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::BackendAuth(detail),
            StatusCode::TOO_MANY_REQUESTS => Error::RateLimited(detail),
            _ => Error::Inference(detail),
        }
    }
}

#[async_trait]
impl Detector for RoboflowClient {
    fn name(&self) -> &str {
        "roboflow"
    }

    fn check(&self) -> Result<()> {
        self.api_key().map(|_| ())
    }

    async fn infer(&self, image: &RgbImage) -> Result<Vec<Prediction>> {
        let api_key = self.api_key()?.to_string();
        let jpeg = encode_jpeg(image)?;
        let body = base64::engine::general_purpose::STANDARD.encode(jpeg);

        let response = self
            .http
            .post(&self.endpoint)
            .query(&[
                ("api_key", api_key),
                ("confidence", self.confidence.to_string()),
                ("overlap", self.overlap.to_string()),
            ])
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| self.classify_send_error(e))?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| self.classify_send_error(e))?;
        if !status.is_success() {
            return Err(Self::classify_status(status, &String::from_utf8_lossy(&bytes)));
        }

        let predictions = parse_predictions(&bytes)?;
        debug!("[推理] {} 返回 {} 个预测", self.endpoint, predictions.len());
        Ok(predictions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode as AxumStatus, routing::post, Router};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn config(api_url: String) -> RoboflowConfig {
        RoboflowConfig {
            api_url,
            model_id: "test-model/1".to_string(),
            api_key: Some("secret".to_string()),
            timeout: Duration::from_secs(5),
            ..RoboflowConfig::default()
        }
    }

    #[tokio::test]
    async fn test_missing_key_is_auth_error() {
        let cfg = RoboflowConfig { api_key: None, ..RoboflowConfig::default() };
        let client = RoboflowClient::new(&cfg).unwrap();
        assert!(matches!(client.check(), Err(Error::BackendAuth(_))));
        let err = client.infer(&RgbImage::new(4, 4)).await.unwrap_err();
        assert!(matches!(err, Error::BackendAuth(_)));
    }

    #[tokio::test]
    async fn test_successful_inference() {
        let app = Router::new().route(
            "/test-model/1",
            post(|| async {
                r#"{"predictions":[{"x":8,"y":8,"width":4,"height":4,"confidence":0.8,"class":"Basketball"}]}"#
            }),
        );
        let client = RoboflowClient::new(&config(serve(app).await)).unwrap();
        let preds = client.infer(&RgbImage::new(16, 16)).await.unwrap();
        assert_eq!(preds.len(), 1);
        assert_eq!(preds[0].label(), "Basketball");
    }

    #[tokio::test]
    async fn test_unauthorized_is_auth_error() {
        let app = Router::new().route("/test-model/1", post(|| async { (AxumStatus::UNAUTHORIZED, "bad key") }));
        let client = RoboflowClient::new(&config(serve(app).await)).unwrap();
        let err = client.infer(&RgbImage::new(16, 16)).await.unwrap_err();
        assert!(matches!(err, Error::BackendAuth(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_rate_limit_is_classified() {
        let app = Router::new().route("/test-model/1", post(|| async { (AxumStatus::TOO_MANY_REQUESTS, "slow down") }));
        let client = RoboflowClient::new(&config(serve(app).await)).unwrap();
        let err = client.infer(&RgbImage::new(16, 16)).await.unwrap_err();
        assert!(matches!(err, Error::RateLimited(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = RoboflowClient::new(&config(format!("http://{}", addr))).unwrap();
        let err = client.infer(&RgbImage::new(16, 16)).await.unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)), "{:?}", err);
    }
}
