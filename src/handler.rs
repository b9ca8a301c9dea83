use axum::{
    body::{Body, Bytes},
    extract::{Json, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json as ResponseJson, Response},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::{ConfigOverrides, PipelineConfig};
use crate::detector::Detector;
use crate::error::Error;
use crate::local_detector::LocalCommandDetector;
use crate::metadata::{segments_with_made_baskets, DetectionRecord, Segment};
use crate::protocol::{batched_lines, StreamEvent};
use crate::roboflow_client::RoboflowClient;
use crate::scene_detector::{SceneConfig, SceneDetector};
use crate::store::{CacheEntry, DisabledResultStore, FileResultStore, ResultStore, StoredResult, VideoKey};
use crate::streamer::DetectionStreamer;
use crate::video_processor::{SourceFactory, VideoProcessor};

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// 按视频路径创建帧源工厂
pub type SourceOpener = Arc<dyn Fn(&Path) -> SourceFactory + Send + Sync>;

/// 服务共享状态
pub struct AppState {
    pub config: PipelineConfig,
    pub store: Arc<dyn ResultStore>,
    detector: Option<Arc<dyn Detector>>,
    opener: SourceOpener,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// 按配置选择结果存储与推理后端
    pub fn new(config: PipelineConfig) -> Self {
        let store: Arc<dyn ResultStore> = if config.cache_enabled {
            Arc::new(FileResultStore::new(config.cache_dir.clone()))
        } else {
            Arc::new(DisabledResultStore)
        };
        Self {
            config,
            store,
            detector: None,
            opener: Arc::new(|path: &Path| VideoProcessor::factory(path)),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = store;
        self
    }

    /// 替换托管推理后端
    pub fn with_detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn with_source_opener(mut self, opener: SourceOpener) -> Self {
        self.opener = opener;
        self
    }

    fn detector(&self) -> crate::error::Result<Arc<dyn Detector>> {
        match &self.detector {
            Some(detector) => Ok(Arc::clone(detector)),
            None => Ok(Arc::new(RoboflowClient::new(&self.config.roboflow)?)),
        }
    }

    fn fallback(&self) -> Option<Arc<dyn Detector>> {
        self.config
            .fallback_command
            .as_deref()
            .and_then(LocalCommandDetector::from_command_line)
            .map(|d| Arc::new(d) as Arc<dyn Detector>)
    }

    /// 为一个视频构建检测流
    pub fn streamer(&self, video_path: &Path, overrides: &ConfigOverrides) -> crate::error::Result<DetectionStreamer> {
        let key = VideoKey::for_file(video_path)?;
        let mut config = self.config.streamer.clone();
        if let Some(frame_skip) = overrides.frame_skip {
            config.frame_skip = frame_skip.max(1);
        }
        if let Some(confidence) = overrides.confidence_threshold {
            config.pool.confidence_threshold = confidence;
        }
        if let Some(workers) = overrides.max_workers {
            config.pool.max_workers = workers.max(1);
        }

        let mut streamer = DetectionStreamer::new(
            (self.opener)(video_path),
            self.detector()?,
            Arc::clone(&self.store),
            key,
            config,
        )
        .with_label(video_path.display().to_string());
        if let Some(fallback) = self.fallback() {
            streamer = streamer.with_fallback(fallback);
        }
        Ok(streamer)
    }

    /// 场景划分；默认参数下的结果写入存储并在之后复用
    pub async fn scenes(&self, video_path: &Path, overrides: &ConfigOverrides) -> crate::error::Result<(Vec<Segment>, bool)> {
        let key = VideoKey::for_file(video_path)?;
        let config = SceneConfig {
            threshold: overrides.threshold.unwrap_or(self.config.scenes.threshold),
            min_scene_len: overrides.min_scene_len.unwrap_or(self.config.scenes.min_scene_len),
            downscale: self.config.scenes.downscale,
        };
        let cacheable = overrides.threshold.is_none() && overrides.min_scene_len.is_none();

        let existing = match self.store.get(&key).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!("⚠️ [场景检测] 读取结果存储失败: {}", e);
                None
            }
        };
        if cacheable {
            if let Some(segments) = existing.as_ref().and_then(|s| s.segments.clone()) {
                info!("📦 [场景检测] 命中缓存: {} 个场景", segments.len());
                return Ok((segments, true));
            }
        }

        let factory = (self.opener)(video_path);
        let segments = tokio::task::spawn_blocking(move || {
            let mut source = factory(1)?;
            SceneDetector::new(config).detect_scenes(source.as_mut())
        })
        .await
        .map_err(|e| Error::Decode(format!("场景检测任务异常退出: {}", e)))??;

        if cacheable {
            let update = StoredResult {
                source: Some(video_path.display().to_string()),
                segments: Some(segments.clone()),
                ..StoredResult::new()
            };
            if let Err(e) = self.store.put(&key, update.merged_into(existing)).await {
                warn!("⚠️ [场景检测] 写入结果存储失败: {}", e);
            }
        }
        Ok((segments, false))
    }
}

fn bad_request(message: impl Into<String>) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, message.into())
}

fn checked_path(video_path: &str) -> Result<PathBuf, (StatusCode, String)> {
    let path = PathBuf::from(video_path);
    if video_path.is_empty() || !path.is_file() {
        return Err(bad_request(format!("Invalid video_path: {}", video_path)));
    }
    Ok(path)
}

fn internal(e: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
}

/// 健康检查 Handler
pub async fn health_check() -> ResponseJson<HealthResponse> {
    ResponseJson(HealthResponse {
        status: "ok",
        service: "highlight-parse",
    })
}

#[derive(Debug, Deserialize)]
pub struct ScenesRequest {
    pub video_path: String,
    pub threshold: Option<f64>,
    pub min_scene_len: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ScenesResponse {
    pub scenes: Vec<Segment>,
    pub cached: bool,
}

/// 场景划分 Handler
pub async fn handle_scenes(
    State(state): State<SharedState>,
    Json(request): Json<ScenesRequest>,
) -> Result<ResponseJson<ScenesResponse>, (StatusCode, String)> {
    info!("收到场景检测请求: {:?}", request);
    let path = checked_path(&request.video_path)?;
    let overrides = ConfigOverrides {
        threshold: request.threshold,
        min_scene_len: request.min_scene_len,
        ..ConfigOverrides::default()
    };

    let (scenes, cached) = state.scenes(&path, &overrides).await.map_err(|e| {
        error!("❌ [场景检测] 失败: {}", e);
        internal(e.user_message())
    })?;
    Ok(ResponseJson(ScenesResponse { scenes, cached }))
}

#[derive(Debug, Deserialize)]
pub struct BallsRequest {
    pub video_path: String,
    pub frame_skip: Option<usize>,
    pub confidence_threshold: Option<f64>,
    pub max_workers: Option<usize>,
}

impl BallsRequest {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            frame_skip: self.frame_skip,
            confidence_threshold: self.confidence_threshold,
            max_workers: self.max_workers,
            ..ConfigOverrides::default()
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BallsResponse {
    pub ball_detections: Vec<DetectionRecord>,
    pub cached: bool,
    /// 含进球的场景下标（仅在场景已划分时提供）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub made_basket_segments: Option<Vec<usize>>,
}

/// 非流式检测 Handler：等待任务结束后一次性返回
pub async fn handle_balls(
    State(state): State<SharedState>,
    Json(request): Json<BallsRequest>,
) -> Result<ResponseJson<BallsResponse>, (StatusCode, String)> {
    info!("收到检测请求: {:?}", request);
    let path = checked_path(&request.video_path)?;
    let streamer = state
        .streamer(&path, &request.overrides())
        .map_err(|e| internal(e.user_message()))?;

    let mut ball_detections = Vec::new();
    let mut cached = false;
    for event in streamer.run_to_end().await {
        match event {
            StreamEvent::Meta(meta) => cached = meta.cached.unwrap_or(false),
            StreamEvent::Detection { data, .. } => ball_detections.push(data),
            StreamEvent::Error { message } => return Err(internal(message)),
            StreamEvent::Done(_) => {}
        }
    }

    let made_basket_segments = match VideoKey::for_file(&path) {
        Ok(key) => state
            .store
            .get(&key)
            .await
            .ok()
            .flatten()
            .and_then(|s| s.segments)
            .map(|segments| segments_with_made_baskets(&segments, &ball_detections)),
        Err(_) => None,
    };

    Ok(ResponseJson(BallsResponse {
        ball_detections,
        cached,
        made_basket_segments,
    }))
}

/// 流式检测 Handler：NDJSON，每行一个事件
pub async fn handle_balls_stream(
    State(state): State<SharedState>,
    Json(request): Json<BallsRequest>,
) -> Result<Response, (StatusCode, String)> {
    info!("收到流式检测请求: {:?}", request);
    let path = checked_path(&request.video_path)?;
    let streamer = state
        .streamer(&path, &request.overrides())
        .map_err(|e| internal(e.user_message()))?;

    let lines = batched_lines(streamer.run(), state.config.flush_interval)
        .map(|chunk| Ok::<_, Infallible>(Bytes::from(chunk)));

    Ok((
        [(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE), (header::CACHE_CONTROL, "no-cache")],
        Body::from_stream(lines),
    )
        .into_response())
}

#[derive(Debug, Serialize)]
pub struct CacheStatus {
    pub enabled: bool,
    pub entries: Vec<CacheEntry>,
}

/// 缓存概览 Handler
pub async fn handle_cache_status(
    State(state): State<SharedState>,
) -> Result<ResponseJson<CacheStatus>, (StatusCode, String)> {
    let entries = state.store.list().await.map_err(internal)?;
    Ok(ResponseJson(CacheStatus {
        enabled: state.config.cache_enabled,
        entries,
    }))
}

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub success: bool,
    pub removed: usize,
}

/// 清空全部缓存 Handler
pub async fn handle_clear_cache(
    State(state): State<SharedState>,
) -> Result<ResponseJson<ClearResponse>, (StatusCode, String)> {
    let removed = state.store.clear().await.map_err(internal)?;
    info!("🧹 已清空缓存: {} 条", removed);
    Ok(ResponseJson(ClearResponse { success: true, removed }))
}

/// 只清除检测结果缓存 Handler
pub async fn handle_clear_ball_cache(
    State(state): State<SharedState>,
) -> Result<ResponseJson<ClearResponse>, (StatusCode, String)> {
    let removed = state.store.clear_detections().await.map_err(internal)?;
    info!("🧹 已清除检测结果缓存: {} 条", removed);
    Ok(ResponseJson(ClearResponse { success: true, removed }))
}

/// 构建路由
pub fn router(state: SharedState) -> axum::Router {
    use axum::routing::{get, post};
    use tower_http::cors::CorsLayer;

    axum::Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/scenes", post(handle_scenes))
        .route("/balls", post(handle_balls))
        .route("/balls/stream", post(handle_balls_stream))
        .route("/balls/cache", axum::routing::delete(handle_clear_ball_cache))
        .route("/cache", get(handle_cache_status).delete(handle_clear_cache))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigLoader;
    use crate::detector::Prediction;
    use crate::metadata::{Frame, VideoInfo, MADE_BASKET_CLASS};
    use crate::protocol::NdjsonDecoder;
    use crate::store::MemoryResultStore;
    use crate::video_processor::MemoryFrameSource;
    use async_trait::async_trait;
    use axum::http::Request;
    use image::RgbImage;
    use tower::ServiceExt;

    struct MakeDetector;

    #[async_trait]
    impl Detector for MakeDetector {
        fn name(&self) -> &str {
            "make"
        }

        async fn infer(&self, _image: &RgbImage) -> crate::error::Result<Vec<Prediction>> {
            Ok(vec![Prediction::new(4.0, 4.0, 2.0, 2.0, 0.9, MADE_BASKET_CLASS)])
        }
    }

    fn test_state(store: Arc<MemoryResultStore>) -> SharedState {
        let dir = tempfile::tempdir().unwrap();
        let ini = dir.path().join("empty.ini");
        std::fs::write(&ini, "").unwrap();
        let no_env = |_: &str| -> Option<String> { None };
        let config = ConfigLoader::load_with_env(Some(&ini), &ConfigOverrides::default(), &no_env).unwrap();

        let opener: SourceOpener = Arc::new(|_: &Path| {
            let info = VideoInfo { fps: 10.0, width: 8, height: 8, total_frames: 6, duration: 0.6 };
            let frames = (0..6).map(|i| Frame::new(i, i as f64 / 10.0, RgbImage::new(8, 8))).collect();
            MemoryFrameSource::factory(info, frames)
        });
        Arc::new(
            AppState::new(config)
                .with_store(store)
                .with_detector(Arc::new(MakeDetector))
                .with_source_opener(opener),
        )
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(test_state(Arc::new(MemoryResultStore::new())));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_video_is_bad_request() {
        let app = router(test_state(Arc::new(MemoryResultStore::new())));
        let response = app
            .oneshot(json_request(
                "POST",
                "/balls/stream",
                serde_json::json!({"video_path": "/nonexistent/video.mp4"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stream_then_cached_replay() {
        let video = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(video.path(), b"fake video").unwrap();
        let store = Arc::new(MemoryResultStore::new());
        let state = test_state(store.clone());
        let body = serde_json::json!({"video_path": video.path().to_string_lossy()});

        let response = router(state.clone())
            .oneshot(json_request("POST", "/balls/stream", body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], NDJSON_CONTENT_TYPE);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let mut decoder = NdjsonDecoder::new();
        let events = decoder.push(&bytes);
        // frame_skip = 2：帧 0,2,4
        assert_eq!(events.len(), 1 + 3 + 1);
        assert!(matches!(&events[4], StreamEvent::Done(done) if done.made_baskets == Some(3)));
        assert_eq!(store.put_count(), 1);

        let response = router(state)
            .oneshot(json_request("POST", "/balls", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["cached"], true);
        assert_eq!(json["ballDetections"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_scenes_are_cached_and_cache_can_be_cleared() {
        let video = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(video.path(), b"fake video").unwrap();
        let store = Arc::new(MemoryResultStore::new());
        let state = test_state(store.clone());
        let body = serde_json::json!({"video_path": video.path().to_string_lossy()});

        for expect_cached in [false, true] {
            let response = router(state.clone())
                .oneshot(json_request("POST", "/scenes", body.clone()))
                .await
                .unwrap();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(json["cached"], expect_cached);
            assert_eq!(json["scenes"].as_array().unwrap().len(), 1);
        }

        let response = router(state.clone())
            .oneshot(Request::builder().uri("/cache").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["entries"][0]["scenes"], 1);

        let response = router(state.clone())
            .oneshot(Request::builder().method("DELETE").uri("/cache").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(store.list().await.unwrap().is_empty());
    }
}
