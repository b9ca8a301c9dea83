use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregator::{AggregateSummary, ErrorPolicy, ResultAggregator};
use crate::detector::Detector;
use crate::error::Error;
use crate::metadata::{round_to, DetectionRecord, Frame, VideoInfo};
use crate::protocol::{DoneEvent, MetaEvent, StreamEvent};
use crate::store::{ResultStore, StoredResult, VideoKey};
use crate::video_processor::SourceFactory;
use crate::worker_pool::{DetectionWorkerPool, PoolConfig, PoolEvent};

/// 事件通道容量
pub const EVENT_BUFFER: usize = 64;
const PROGRESS_LOG_EVERY: usize = 100;
/// 备用路径每帧的保守耗时估计（秒）
const FALLBACK_SECONDS_PER_FRAME: f64 = 0.5;

/// 检测流参数
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// 采样步长
    pub frame_skip: usize,
    pub pool: PoolConfig,
    pub error_policy: ErrorPolicy,
    /// 整个任务的墙钟上限
    pub job_timeout: Duration,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            frame_skip: 2,
            pool: PoolConfig::default(),
            error_policy: ErrorPolicy::default(),
            job_timeout: Duration::from_secs(3600),
        }
    }
}

/// 检测流状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamerState {
    Idle,
    CacheCheck,
    CachedReplay,
    LiveRun,
    Fallback,
    Done,
    Error,
}

enum RunOutcome {
    Completed {
        records: Vec<DetectionRecord>,
        summary: AggregateSummary,
        video: VideoInfo,
    },
    Failed {
        error: Error,
        processed: usize,
    },
    Cancelled,
}

struct Job {
    state: StreamerState,
    events: mpsc::Sender<StreamEvent>,
    started: Instant,
    deadline: tokio::time::Instant,
}

impl Job {
    fn new(events: mpsc::Sender<StreamEvent>, limit: Duration) -> Self {
        Self {
            state: StreamerState::Idle,
            events,
            started: Instant::now(),
            deadline: tokio::time::Instant::now() + limit,
        }
    }

    fn transition(&mut self, next: StreamerState) {
        debug!("[检测流] 状态 {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// 发送失败说明调用方已丢弃流
    async fn send(&self, event: StreamEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

/// 检测流
///
/// 驱动 帧源 → 工作池 → 聚合器，并把结果转换为有序事件流：
/// 先查结果存储，命中则回放；否则实时推理，托管后端不可达且尚未处理任何帧时
/// 整体切换到备用后端重跑。每个流恰好以一个 `done` 或 `error` 结束。
/// 丢弃返回的接收端即取消任务，取消的任务不写入存储。
pub struct DetectionStreamer {
    source: SourceFactory,
    detector: Arc<dyn Detector>,
    fallback: Option<Arc<dyn Detector>>,
    store: Arc<dyn ResultStore>,
    key: VideoKey,
    label: Option<String>,
    config: StreamerConfig,
}

impl DetectionStreamer {
    pub fn new(
        source: SourceFactory,
        detector: Arc<dyn Detector>,
        store: Arc<dyn ResultStore>,
        key: VideoKey,
        config: StreamerConfig,
    ) -> Self {
        Self {
            source,
            detector,
            fallback: None,
            store,
            key,
            label: None,
            config,
        }
    }

    /// 托管后端不可达时使用的备用后端
    pub fn with_fallback(mut self, fallback: Arc<dyn Detector>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// 写入存储的来源描述（通常是视频路径）
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// 在后台启动任务，返回事件接收端
    pub fn run(self) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let span = info_span!("detect", job = %Uuid::new_v4(), video = %self.key);
        tokio::spawn(self.drive(tx).instrument(span));
        rx
    }

    /// 运行到结束并收集全部事件
    pub async fn run_to_end(self) -> Vec<StreamEvent> {
        let mut rx = self.run();
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    async fn drive(self, events: mpsc::Sender<StreamEvent>) {
        let mut job = Job::new(events, self.config.job_timeout);

        job.transition(StreamerState::CacheCheck);
        let existing = match self.store.get(&self.key).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!("⚠️ [检测流] 读取结果存储失败，按未命中处理: {}", e);
                None
            }
        };
        if let Some(records) = existing.as_ref().and_then(|s| s.detections.clone()) {
            job.transition(StreamerState::CachedReplay);
            self.replay(&mut job, records).await;
            return;
        }

        job.transition(StreamerState::LiveRun);
        info!(
            "🏀 [检测流] 开始检测: 后端 {}, 并发 {}, 采样步长 {}",
            self.detector.name(),
            self.config.pool.max_workers,
            self.config.frame_skip
        );
        let mut outcome = self
            .live_run(&job, Arc::clone(&self.detector), self.config.pool.clone(), false)
            .await;

        let wants_fallback = matches!(
            &outcome,
            RunOutcome::Failed { error, processed: 0 } if error.triggers_fallback()
        );
        if wants_fallback {
            if let Some(fallback) = self.fallback.clone() {
                warn!("⚠️ [检测流] 托管后端不可达，切换到备用后端 {}", fallback.name());
                job.transition(StreamerState::Fallback);
                let pool = PoolConfig {
                    max_workers: 1,
                    ..self.config.pool.clone()
                };
                outcome = self.live_run(&job, fallback, pool, true).await;
            }
        }

        match outcome {
            RunOutcome::Completed { records, summary, video } => {
                let elapsed = job.started.elapsed().as_secs_f64();
                info!(
                    "✅ [检测流] 检测完成: {} 帧，{} 个检测框，{} 帧含进球，失败 {} 帧，耗时 {:.2}秒",
                    summary.processed, summary.boxes, summary.made_baskets, summary.failed, elapsed
                );
                self.persist(existing, records, video).await;
                job.transition(StreamerState::Done);
                job.send(StreamEvent::Done(DoneEvent {
                    processed: summary.processed,
                    cached: None,
                    elapsed: Some(round_to(elapsed, 2)),
                    made_baskets: Some(summary.made_baskets),
                }))
                .await;
            }
            RunOutcome::Failed { error, processed } => {
                error!("❌ [检测流] 任务失败 (已输出 {} 帧): {}", processed, error);
                job.transition(StreamerState::Error);
                job.send(StreamEvent::error(error.user_message())).await;
            }
            RunOutcome::Cancelled => {
                info!("[检测流] 调用方已断开，停止推理且不写入结果");
            }
        }
    }

    async fn replay(&self, job: &mut Job, records: Vec<DetectionRecord>) {
        let total = records.len();
        info!("📦 [检测流] 命中缓存，回放 {} 条检测结果", total);
        let meta = MetaEvent {
            total_frames: total,
            cached: Some(true),
            ..MetaEvent::default()
        };
        if !job.send(StreamEvent::Meta(meta)).await {
            return;
        }

        let made_baskets = records.iter().filter(|r| r.has_made_basket()).count();
        for (i, record) in records.into_iter().enumerate() {
            let event = StreamEvent::Detection {
                data: record,
                processed: i + 1,
                total,
            };
            if !job.send(event).await {
                info!("[检测流] 调用方已断开，停止回放");
                return;
            }
        }

        job.transition(StreamerState::Done);
        job.send(StreamEvent::Done(DoneEvent {
            processed: total,
            cached: Some(true),
            elapsed: None,
            made_baskets: Some(made_baskets),
        }))
        .await;
    }

    async fn live_run(
        &self,
        job: &Job,
        detector: Arc<dyn Detector>,
        pool_config: PoolConfig,
        fallback: bool,
    ) -> RunOutcome {
        if let Err(error) = detector.check() {
            return RunOutcome::Failed { error, processed: 0 };
        }

        let frame_skip = self.config.frame_skip.max(1);
        let factory = Arc::clone(&self.source);
        let mut source = match tokio::task::spawn_blocking(move || factory(frame_skip)).await {
            Ok(Ok(source)) => source,
            Ok(Err(error)) => return RunOutcome::Failed { error, processed: 0 },
            Err(e) => {
                return RunOutcome::Failed {
                    error: Error::Decode(format!("打开帧源任务失败: {}", e)),
                    processed: 0,
                }
            }
        };

        let video = source.info();
        let total = video.frames_to_process(frame_skip);
        let meta = MetaEvent {
            total_frames: total,
            cached: None,
            fallback: fallback.then_some(true),
            fps: Some(round_to(video.fps, 3)),
            video_frames: Some(video.total_frames),
            estimated_seconds: fallback.then(|| self.estimate_seconds(total)),
        };
        info!("[检测流] 待推理 {} 帧 (视频共 {} 帧)", total, video.total_frames);
        if !job.send(StreamEvent::Meta(meta)).await {
            return RunOutcome::Cancelled;
        }

        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(pool_config.max_workers.max(1));
        let producer = tokio::task::spawn_blocking(move || {
            source.for_each_frame(&mut |frame| {
                if frame_tx.blocking_send(frame).is_err() {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
        });

        let mut handle = DetectionWorkerPool::new(detector, pool_config).submit(frame_rx);
        let mut aggregator = ResultAggregator::new(total, self.config.error_policy);
        let mut records = Vec::with_capacity(total);
        let mut failure = None;

        loop {
            let event = tokio::select! {
                biased;
                _ = job.events.closed() => return RunOutcome::Cancelled,
                _ = tokio::time::sleep_until(job.deadline) => {
                    failure = Some(Error::JobTimeout(self.config.job_timeout));
                    break;
                }
                event = handle.next_event() => event,
            };

            match event {
                Some(PoolEvent::Completed(completion)) => {
                    for emitted in aggregator.push(completion) {
                        records.push(emitted.record.clone());
                        if emitted.processed % PROGRESS_LOG_EVERY == 0 {
                            info!(
                                "[检测流] 进度 {}/{}，累计 {} 个检测框",
                                emitted.processed,
                                emitted.total,
                                aggregator.summary().boxes
                            );
                        }
                        let event = StreamEvent::Detection {
                            data: emitted.record,
                            processed: emitted.processed,
                            total: emitted.total,
                        };
                        if !job.send(event).await {
                            return RunOutcome::Cancelled;
                        }
                    }
                }
                Some(PoolEvent::Fatal(error)) => {
                    failure = Some(error);
                    break;
                }
                None => break,
            }
        }
        drop(handle);

        if let Some(error) = failure {
            return RunOutcome::Failed {
                error,
                processed: aggregator.processed(),
            };
        }

        // 工作池正常结束意味着帧源已经停止输出
        let decode_error = match producer.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(e) => Some(Error::Decode(format!("解码任务异常退出: {}", e))),
        };
        if let Some(error) = decode_error {
            return RunOutcome::Failed {
                error,
                processed: aggregator.processed(),
            };
        }

        RunOutcome::Completed {
            records,
            summary: aggregator.summary(),
            video,
        }
    }

    fn estimate_seconds(&self, total: usize) -> u64 {
        let estimate = (total as f64 * FALLBACK_SECONDS_PER_FRAME).ceil() as u64;
        estimate.min(self.config.job_timeout.as_secs())
    }

    async fn persist(&self, existing: Option<StoredResult>, records: Vec<DetectionRecord>, video: VideoInfo) {
        let update = StoredResult {
            source: self.label.clone(),
            video: Some(video),
            detections: Some(records),
            ..StoredResult::new()
        };
        if let Err(e) = self.store.put(&self.key, update.merged_into(existing)).await {
            warn!("⚠️ [检测流] 写入结果存储失败，本次结果不受影响: {}", e);
        }
    }
}
