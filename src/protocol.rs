use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use crate::metadata::DetectionRecord;

/// 检测流的首个事件
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaEvent {
    pub total_frames: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_frames: Option<u64>,
    /// 备用路径下替代实时进度的预估耗时（秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_seconds: Option<u64>,
}

/// 成功结束事件
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneEvent {
    pub processed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub made_baskets: Option<usize>,
}

/// NDJSON 流中的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Meta(MetaEvent),
    Detection {
        data: DetectionRecord,
        processed: usize,
        total: usize,
    },
    Error {
        message: String,
    },
    Done(DoneEvent),
}

impl StreamEvent {
    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error { message: message.into() }
    }

    /// `done` 与 `error` 是终止事件，每个流恰好一个
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done(_) | StreamEvent::Error { .. })
    }

    /// 序列化为以换行结尾的一行
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// 解析一行，格式错误或未知类型返回 `None`
pub fn parse_line(line: &str) -> Option<StreamEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(event) => Some(event),
        Err(e) => {
            debug!("[协议] 跳过无法解析的行: {} ({})", line, e);
            None
        }
    }
}

/// 增量 NDJSON 解码器：数据块可能在任意字节处截断
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buf: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个数据块，返回其中已完整的事件
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(event) = parse_line(&String::from_utf8_lossy(&line)) {
                events.push(event);
            }
        }
        events
    }

    /// 流结束时处理最后一个没有换行的片段
    pub fn finish(self) -> Option<StreamEvent> {
        parse_line(&String::from_utf8_lossy(&self.buf))
    }
}

struct FlushState {
    events: mpsc::Receiver<StreamEvent>,
    pending: String,
    ticker: tokio::time::Interval,
    closed: bool,
}

impl FlushState {
    fn take(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }

    fn append(&mut self, event: &StreamEvent) {
        match event.to_line() {
            Ok(line) => self.pending.push_str(&line),
            Err(e) => debug!("[协议] 事件序列化失败: {}", e),
        }
    }
}

/// 把事件合并为批量写出的 NDJSON 文本块
///
/// `detection` 行最多缓存 `flush_interval` 后写出；`meta`、`error`、`done`
/// 连同之前积压的行立即写出。丢弃返回的流即关闭事件通道。
pub fn batched_lines(
    events: mpsc::Receiver<StreamEvent>,
    flush_interval: Duration,
) -> impl Stream<Item = String> + Send + 'static {
    let period = flush_interval.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let state = FlushState {
        events,
        pending: String::new(),
        ticker,
        closed: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.closed {
                if state.pending.is_empty() {
                    return None;
                }
                let chunk = state.take();
                return Some((chunk, state));
            }

            tokio::select! {
                event = state.events.recv() => match event {
                    Some(event) => {
                        state.append(&event);
                        if !matches!(event, StreamEvent::Detection { .. }) {
                            let chunk = state.take();
                            return Some((chunk, state));
                        }
                    }
                    None => state.closed = true,
                },
                _ = state.ticker.tick(), if !state.pending.is_empty() => {
                    let chunk = state.take();
                    return Some((chunk, state));
                }
            }
        }
    })
}
