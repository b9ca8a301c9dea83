use async_trait::async_trait;
use highlight_parse::aggregator::ErrorPolicy;
use highlight_parse::detector::{Detector, Prediction};
use highlight_parse::error::{Error, Result};
use highlight_parse::metadata::{DetectionRecord, Frame, VideoInfo, MADE_BASKET_CLASS};
use highlight_parse::protocol::StreamEvent;
use highlight_parse::roboflow_client::{RoboflowClient, RoboflowConfig};
use highlight_parse::store::{MemoryResultStore, ResultStore, StoredResult, VideoKey};
use highlight_parse::streamer::{DetectionStreamer, StreamerConfig};
use highlight_parse::video_processor::{MemoryFrameSource, SourceFactory};
use highlight_parse::worker_pool::PoolConfig;
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 帧序号写在左上角像素的红色通道中，检测器据此识别帧
fn clip(count: u64) -> SourceFactory {
    let info = VideoInfo {
        fps: 30.0,
        width: 16,
        height: 16,
        total_frames: count,
        duration: count as f64 / 30.0,
    };
    let frames = (0..count)
        .map(|i| Frame::new(i, i as f64 / 30.0, RgbImage::from_pixel(16, 16, Rgb([i as u8, 0, 0]))))
        .collect();
    MemoryFrameSource::factory(info, frames)
}

#[derive(Default)]
struct MockDetector {
    calls: AtomicUsize,
    delay: Duration,
    jitter: bool,
    fail_frames: Vec<u64>,
    panic_frames: Vec<u64>,
    hang_frames: Vec<u64>,
    error: Option<Error>,
}

impl MockDetector {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Detector for MockDetector {
    fn name(&self) -> &str {
        "mock"
    }

    async fn infer(&self, image: &RgbImage) -> Result<Vec<Prediction>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let frame = image.get_pixel(0, 0)[0] as u64;

        let mut delay = self.delay;
        if self.jitter {
            delay += Duration::from_millis((frame * 7919) % 13);
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.hang_frames.contains(&frame) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.panic_frames.contains(&frame) {
            panic!("detector crashed on frame {}", frame);
        }
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        if self.fail_frames.contains(&frame) {
            return Err(Error::Inference(format!("frame {} failed", frame)));
        }
        let class = if frame % 10 == 0 { MADE_BASKET_CLASS } else { "Basketball" };
        Ok(vec![Prediction::new(frame as f64 + 2.0, 4.0, 2.0, 2.0, 0.9, class)])
    }
}

fn config(max_workers: usize, frame_skip: usize) -> StreamerConfig {
    StreamerConfig {
        frame_skip,
        pool: PoolConfig {
            max_workers,
            ..PoolConfig::default()
        },
        ..StreamerConfig::default()
    }
}

fn detections(events: &[StreamEvent]) -> Vec<DetectionRecord> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Detection { data, .. } => Some(data.clone()),
            _ => None,
        })
        .collect()
}

fn assert_single_terminal(events: &[StreamEvent]) {
    let terminals = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 1, "events: {:?}", events);
    assert!(events.last().map_or(false, StreamEvent::is_terminal));
}

async fn run(
    detector: Arc<dyn Detector>,
    store: Arc<dyn ResultStore>,
    frames: u64,
    config: StreamerConfig,
) -> Vec<StreamEvent> {
    DetectionStreamer::new(clip(frames), detector, store, VideoKey::new("clip"), config)
        .run_to_end()
        .await
}

#[tokio::test]
async fn test_parallel_output_matches_sequential_baseline() {
    let parallel = Arc::new(MockDetector {
        jitter: true,
        ..MockDetector::default()
    });
    let sequential = Arc::new(MockDetector::default());

    let fast = run(parallel, Arc::new(MemoryResultStore::new()), 60, config(4, 1)).await;
    let slow = run(sequential, Arc::new(MemoryResultStore::new()), 60, config(1, 1)).await;

    let fast_records = detections(&fast);
    let slow_records = detections(&slow);
    assert_eq!(fast_records.len(), 60);
    assert_eq!(fast_records, slow_records);
    assert!(fast_records.windows(2).all(|w| w[0].frame_index < w[1].frame_index));

    // 进度单调递增且总数固定
    let progress: Vec<(usize, usize)> = fast
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Detection { processed, total, .. } => Some((*processed, *total)),
            _ => None,
        })
        .collect();
    assert!(progress.iter().enumerate().all(|(i, (p, t))| *p == i + 1 && *t == 60));

    assert!(matches!(&fast[0], StreamEvent::Meta(meta) if meta.total_frames == 60));
    match fast.last() {
        Some(StreamEvent::Done(done)) => {
            assert_eq!(done.processed, 60);
            assert_eq!(done.made_baskets, Some(6));
        }
        other => panic!("expected done, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cached_replay_makes_no_backend_calls() {
    let store = Arc::new(MemoryResultStore::new());
    let records: Vec<DetectionRecord> = (0..5).map(|i| DetectionRecord::empty(i * 2, i as f64 / 15.0)).collect();
    store
        .put(
            &VideoKey::new("clip"),
            StoredResult {
                detections: Some(records.clone()),
                ..StoredResult::new()
            },
        )
        .await
        .unwrap();

    let detector = Arc::new(MockDetector::default());
    let events = run(detector.clone(), store.clone(), 10, config(4, 2)).await;

    assert_eq!(detector.calls(), 0);
    assert_eq!(store.put_count(), 1);
    assert!(matches!(&events[0], StreamEvent::Meta(meta) if meta.cached == Some(true) && meta.total_frames == 5));
    assert_eq!(detections(&events), records);
    assert!(matches!(events.last(), Some(StreamEvent::Done(done)) if done.cached == Some(true) && done.processed == 5));
    assert_single_terminal(&events);
}

#[tokio::test]
async fn test_completed_run_is_persisted_and_replayed() {
    let store = Arc::new(MemoryResultStore::new());
    let detector = Arc::new(MockDetector::default());

    let first = run(detector.clone(), store.clone(), 12, config(3, 2)).await;
    assert_eq!(detector.calls(), 6);
    assert_eq!(store.put_count(), 1);

    let second = run(detector.clone(), store.clone(), 12, config(3, 2)).await;
    assert_eq!(detector.calls(), 6);
    assert_eq!(detections(&first), detections(&second));
}

#[tokio::test]
async fn test_per_frame_failures_do_not_block_neighbours() {
    let detector = Arc::new(MockDetector {
        jitter: true,
        fail_frames: vec![3, 7, 8],
        ..MockDetector::default()
    });
    let events = run(detector, Arc::new(MemoryResultStore::new()), 12, config(4, 1)).await;
    let records = detections(&events);

    assert_eq!(records.len(), 12);
    for record in &records {
        let failed = [3, 7, 8].contains(&record.frame_index);
        assert_eq!(record.boxes.is_empty(), failed, "frame {}", record.frame_index);
    }
    assert!(matches!(events.last(), Some(StreamEvent::Done(_))));

    let dropping = Arc::new(MockDetector {
        fail_frames: vec![3, 7, 8],
        ..MockDetector::default()
    });
    let config = StreamerConfig {
        error_policy: ErrorPolicy::Drop,
        ..config(4, 1)
    };
    let events = run(dropping, Arc::new(MemoryResultStore::new()), 12, config).await;
    let frames: Vec<u64> = detections(&events).iter().map(|r| r.frame_index).collect();
    assert_eq!(frames, vec![0, 1, 2, 4, 5, 6, 9, 10, 11]);
}

fn isolation_config(policy: ErrorPolicy) -> StreamerConfig {
    StreamerConfig {
        frame_skip: 1,
        error_policy: policy,
        job_timeout: Duration::from_secs(60),
        pool: PoolConfig {
            max_workers: 4,
            infer_timeout: Duration::from_millis(300),
            ..PoolConfig::default()
        },
    }
}

fn assert_only_frame_missing(events: &[StreamEvent], frames: u64, missing: u64, policy: ErrorPolicy) {
    let records = detections(events);
    match policy {
        ErrorPolicy::EmptyRecord => {
            assert_eq!(records.len() as u64, frames);
            for record in &records {
                assert_eq!(record.boxes.is_empty(), record.frame_index == missing, "frame {}", record.frame_index);
            }
        }
        ErrorPolicy::Drop => {
            let indices: Vec<u64> = records.iter().map(|r| r.frame_index).collect();
            let expected: Vec<u64> = (0..frames).filter(|i| *i != missing).collect();
            assert_eq!(indices, expected);
        }
    }
    assert!(matches!(events.last(), Some(StreamEvent::Done(done)) if done.processed == records.len()));
    assert_single_terminal(events);
}

#[tokio::test]
async fn test_panicking_detector_only_loses_its_frame() {
    for policy in [ErrorPolicy::EmptyRecord, ErrorPolicy::Drop] {
        let detector = Arc::new(MockDetector {
            panic_frames: vec![3],
            ..MockDetector::default()
        });
        let started = std::time::Instant::now();
        let events = run(detector, Arc::new(MemoryResultStore::new()), 20, isolation_config(policy)).await;

        assert_only_frame_missing(&events, 20, 3, policy);
        assert!(started.elapsed() < Duration::from_secs(10), "took {:?}", started.elapsed());
    }
}

#[tokio::test]
async fn test_hung_inference_is_resolved_by_call_timeout() {
    for policy in [ErrorPolicy::EmptyRecord, ErrorPolicy::Drop] {
        let detector = Arc::new(MockDetector {
            hang_frames: vec![3],
            ..MockDetector::default()
        });
        let started = std::time::Instant::now();
        let events = run(detector, Arc::new(MemoryResultStore::new()), 20, isolation_config(policy)).await;
        let elapsed = started.elapsed();

        assert_only_frame_missing(&events, 20, 3, policy);
        // 只等待单次调用的超时，而非整个任务的超时
        assert!(elapsed >= Duration::from_millis(300), "took {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(10), "took {:?}", elapsed);
    }
}

#[tokio::test]
async fn test_unauthorized_backend_yields_single_auth_error() {
    use axum::{http::StatusCode, routing::post, Router};

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let app = Router::new().route(
        "/test-model/1",
        post(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                (StatusCode::UNAUTHORIZED, "Unauthorized")
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = RoboflowClient::new(&RoboflowConfig {
        api_url: format!("http://{}", addr),
        model_id: "test-model/1".to_string(),
        api_key: Some("wrong".to_string()),
        ..RoboflowConfig::default()
    })
    .unwrap();

    let store = Arc::new(MemoryResultStore::new());
    let events = run(Arc::new(client), store.clone(), 40, config(4, 1)).await;

    assert!(detections(&events).is_empty());
    let errors: Vec<&String> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Error { message } => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("API key"));
    assert_single_terminal(&events);
    assert!(hits.load(Ordering::SeqCst) <= 4);
    assert_eq!(store.put_count(), 0);
}

#[tokio::test]
async fn test_missing_api_key_fails_before_any_work() {
    let client = RoboflowClient::new(&RoboflowConfig {
        api_key: None,
        ..RoboflowConfig::default()
    })
    .unwrap();
    let events = run(Arc::new(client), Arc::new(MemoryResultStore::new()), 10, config(4, 2)).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], StreamEvent::Error { message } if message.contains("API key")));
}

#[tokio::test]
async fn test_unreachable_backend_switches_to_fallback() {
    let primary = Arc::new(MockDetector {
        error: Some(Error::BackendUnavailable("connection refused".into())),
        ..MockDetector::default()
    });
    let fallback = Arc::new(MockDetector::default());
    let store = Arc::new(MemoryResultStore::new());

    let events = DetectionStreamer::new(clip(10), primary, store.clone(), VideoKey::new("clip"), config(4, 2))
        .with_fallback(fallback.clone())
        .run_to_end()
        .await;

    assert_eq!(fallback.calls(), 5);
    assert_eq!(detections(&events).len(), 5);
    let fallback_meta = events.iter().find_map(|e| match e {
        StreamEvent::Meta(meta) if meta.fallback == Some(true) => Some(meta.clone()),
        _ => None,
    });
    let meta = fallback_meta.expect("fallback meta");
    assert_eq!(meta.total_frames, 5);
    assert!(meta.estimated_seconds.is_some());
    assert!(matches!(events.last(), Some(StreamEvent::Done(done)) if done.processed == 5));
    assert_single_terminal(&events);
    assert_eq!(store.put_count(), 1);
}

#[tokio::test]
async fn test_unreachable_backend_without_fallback_reports_error() {
    let primary = Arc::new(MockDetector {
        error: Some(Error::BackendUnavailable("connection refused".into())),
        ..MockDetector::default()
    });
    let events = run(primary, Arc::new(MemoryResultStore::new()), 10, config(4, 2)).await;
    assert!(detections(&events).is_empty());
    assert!(matches!(events.last(), Some(StreamEvent::Error { message }) if message.contains("unreachable")));
    assert_single_terminal(&events);
}

#[tokio::test]
async fn test_consecutive_failures_escalate() {
    let detector = Arc::new(MockDetector {
        error: Some(Error::Inference("HTTP 500".into())),
        ..MockDetector::default()
    });
    let config = StreamerConfig {
        pool: PoolConfig {
            max_workers: 1,
            max_consecutive_failures: 3,
            ..PoolConfig::default()
        },
        frame_skip: 1,
        ..StreamerConfig::default()
    };
    let events = run(detector.clone(), Arc::new(MemoryResultStore::new()), 50, config).await;

    // 前两次失败按单帧错误处理，第三次升级为任务错误
    assert_eq!(detections(&events).len(), 2);
    assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
    assert!(detector.calls() < 50);
}

#[tokio::test]
async fn test_job_timeout_keeps_partial_results() {
    let detector = Arc::new(MockDetector {
        delay: Duration::from_millis(40),
        ..MockDetector::default()
    });
    let store = Arc::new(MemoryResultStore::new());
    let config = StreamerConfig {
        job_timeout: Duration::from_millis(300),
        ..config(2, 1)
    };
    let events = run(detector, store.clone(), 200, config).await;

    let records = detections(&events);
    assert!(!records.is_empty());
    assert!(records.len() < 200);
    assert!(matches!(events.last(), Some(StreamEvent::Error { message }) if message.contains("timed out")));
    assert_single_terminal(&events);
    assert_eq!(store.put_count(), 0);
}

#[tokio::test]
async fn test_dropping_the_stream_cancels_the_job() {
    let detector = Arc::new(MockDetector {
        delay: Duration::from_millis(20),
        ..MockDetector::default()
    });
    let store = Arc::new(MemoryResultStore::new());
    let mut rx = DetectionStreamer::new(
        clip(200),
        detector.clone(),
        store.clone(),
        VideoKey::new("clip"),
        config(2, 1),
    )
    .run();

    let mut seen = 0;
    while let Some(event) = rx.recv().await {
        if matches!(event, StreamEvent::Detection { .. }) {
            seen += 1;
            if seen == 3 {
                break;
            }
        }
    }
    drop(rx);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let settled = detector.calls();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(detector.calls(), settled);
    assert!(settled < 200);
    assert_eq!(store.put_count(), 0);
}
