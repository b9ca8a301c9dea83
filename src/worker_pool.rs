use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, warn};

use crate::detector::{fit_longer_edge, Detector};
use crate::error::{Error, Result};
use crate::metadata::{BoundingBox, Frame};

/// 工作池参数
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// 同时在途（含等待按序输出）的最大帧数
    pub max_workers: usize,
    pub confidence_threshold: f64,
    /// 推理前长边上限（像素）
    pub max_infer_width: u32,
    /// 单次推理超时
    pub infer_timeout: Duration,
    /// 连续失败达到该次数视为系统性故障
    pub max_consecutive_failures: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            confidence_threshold: 0.25,
            max_infer_width: 640,
            infer_timeout: Duration::from_secs(30),
            max_consecutive_failures: 10,
        }
    }
}

/// 单帧推理完成结果
///
/// 持有工作池的并发许可，直到聚合器按序输出该帧后才释放，
/// 因此在途帧与重排缓冲区中的帧合计不超过 `max_workers`。
#[derive(Debug)]
pub struct Completion {
    /// 采样序号（0..N），聚合器按此排序
    pub slot: usize,
    pub frame_index: u64,
    pub timestamp: f64,
    pub result: Result<Vec<BoundingBox>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Completion {
    pub fn new(slot: usize, frame_index: u64, timestamp: f64, result: Result<Vec<BoundingBox>>) -> Self {
        Self {
            slot,
            frame_index,
            timestamp,
            result,
            permit: None,
        }
    }

    /// 释放并发许可，允许工作池派发下一帧
    pub fn release(&mut self) {
        self.permit.take();
    }
}

/// 工作池向消费者发出的事件
#[derive(Debug)]
pub enum PoolEvent {
    Completed(Completion),
    /// 系统性故障，工作池已停止派发
    Fatal(Error),
}

struct Shared {
    detector: Arc<dyn Detector>,
    config: PoolConfig,
    events: mpsc::Sender<PoolEvent>,
    halted: Arc<AtomicBool>,
    consecutive_failures: AtomicUsize,
}

impl Shared {
    /// 记录一次失败，需要升级为系统性故障时返回对应错误
    fn record_failure(&self, error: &Error) -> Option<Error> {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if error.is_systemic() {
            return Some(error.clone());
        }
        if failures >= self.config.max_consecutive_failures.max(1) {
            return Some(match error {
                Error::RateLimited(msg) => Error::RateLimited(msg.clone()),
                other => Error::Inference(format!("连续 {} 帧推理失败，最近一次: {}", failures, other)),
            });
        }
        None
    }

    /// 只有第一个系统性故障会被上报
    async fn escalate(&self, error: Error) {
        if !self.halted.swap(true, Ordering::AcqRel) {
            error!("❌ [工作池] 系统性故障，停止派发: {}", error);
            let _ = self.events.send(PoolEvent::Fatal(error)).await;
        }
    }
}

/// 有界并发的推理工作池
pub struct DetectionWorkerPool {
    detector: Arc<dyn Detector>,
    config: PoolConfig,
}

impl DetectionWorkerPool {
    pub fn new(detector: Arc<dyn Detector>, config: PoolConfig) -> Self {
        Self { detector, config }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// 从 `frames` 拉取帧并行推理；完成顺序不保证与提交顺序一致
    pub fn submit(&self, mut frames: mpsc::Receiver<Frame>) -> PoolHandle {
        let workers = self.config.max_workers.max(1);
        let (events_tx, events_rx) = mpsc::channel(workers * 2);
        let halted = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(Shared {
            detector: Arc::clone(&self.detector),
            config: self.config.clone(),
            events: events_tx,
            halted: Arc::clone(&halted),
            consecutive_failures: AtomicUsize::new(0),
        });
        let semaphore = Arc::new(Semaphore::new(workers));

        // 事件通道在派发器与全部推理任务结束后关闭
        let dispatcher = tokio::spawn(async move {
            let mut tasks = JoinSet::new();
            let mut slot = 0usize;

            loop {
                if shared.halted.load(Ordering::Acquire) {
                    break;
                }
                let permit = tokio::select! {
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    _ = shared.events.closed() => break,
                };
                let frame = tokio::select! {
                    frame = frames.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                    _ = shared.events.closed() => break,
                };
                if shared.halted.load(Ordering::Acquire) {
                    break;
                }

                tasks.spawn(run_one(Arc::clone(&shared), slot, frame, permit));
                slot += 1;

                while let Some(joined) = tasks.try_join_next() {
                    log_join_error(joined);
                }
            }

            while let Some(joined) = tasks.join_next().await {
                log_join_error(joined);
            }
            debug!("[工作池] 派发结束，共派发 {} 帧", slot);
        });

        PoolHandle {
            events: events_rx,
            halted,
            dispatcher,
        }
    }
}

fn log_join_error(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        if !err.is_cancelled() {
            error!("[工作池] 推理任务异常退出: {}", err);
        }
    }
}

async fn infer_frame(shared: &Shared, frame: Frame) -> Result<Vec<BoundingBox>> {
    let max_edge = shared.config.max_infer_width;
    let (resized, scale) = tokio::task::spawn_blocking(move || fit_longer_edge(frame.image, max_edge))
        .await
        .map_err(|e| Error::Inference(format!("缩放任务失败: {}", e)))?;

    let predictions = shared.detector.infer(&resized).await?;
    Ok(predictions
        .into_iter()
        .filter(|p| p.confidence >= shared.config.confidence_threshold)
        .map(|p| p.to_box(scale))
        .collect())
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

async fn run_one(shared: Arc<Shared>, slot: usize, frame: Frame, permit: OwnedSemaphorePermit) {
    let frame_index = frame.index;
    let timestamp = frame.timestamp;
    let limit = shared.config.infer_timeout;

    // 推理 panic 也必须产生完成事件，否则聚合器的游标会停在该帧
    let inference = AssertUnwindSafe(infer_frame(&shared, frame)).catch_unwind();
    let result = match tokio::time::timeout(limit, inference).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => Err(Error::Inference(format!("推理任务 panic: {}", panic_message(panic.as_ref())))),
        Err(_) => Err(Error::Timeout(limit)),
    };

    match &result {
        Ok(_) => shared.consecutive_failures.store(0, Ordering::Release),
        Err(e) => {
            warn!("⚠️ [工作池] 帧 {} ({:.2}s) 推理失败: {}", frame_index, timestamp, e);
            if let Some(fatal) = shared.record_failure(e) {
                shared.escalate(fatal).await;
                return;
            }
        }
    }

    let completion = Completion {
        slot,
        frame_index,
        timestamp,
        result,
        permit: Some(permit),
    };
    let _ = shared.events.send(PoolEvent::Completed(completion)).await;
}

/// 工作池句柄；丢弃句柄即停止派发并中止所有在途推理
pub struct PoolHandle {
    events: mpsc::Receiver<PoolEvent>,
    halted: Arc<AtomicBool>,
    dispatcher: JoinHandle<()>,
}

impl PoolHandle {
    /// 下一个完成事件；帧源耗尽且在途任务全部结束后返回 `None`
    pub async fn next_event(&mut self) -> Option<PoolEvent> {
        self.events.recv().await
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// 停止派发新帧，在途任务继续完成
    pub fn halt(&self) {
        self.halted.store(true, Ordering::Release);
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        self.halt();
        self.dispatcher.abort();
    }
}
