use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};

use crate::metadata::DetectionRecord;
use crate::worker_pool::Completion;

/// 单帧推理失败时的输出策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// 输出不含检测框的记录，输出总数等于采样帧数
    #[default]
    EmptyRecord,
    /// 跳过该帧，输出总数等于采样帧数减去失败帧数
    Drop,
}

/// 按序输出的一条记录及进度
#[derive(Debug, Clone, PartialEq)]
pub struct Emitted {
    pub record: DetectionRecord,
    /// 已输出条数（含本条）
    pub processed: usize,
    pub total: usize,
}

/// 运行结束时的统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AggregateSummary {
    pub processed: usize,
    pub failed: usize,
    pub made_baskets: usize,
    pub boxes: usize,
}

/// 结果聚合器
///
/// 完成结果按任意顺序到达，聚合器按采样序号严格递增输出：
/// 结果先放入重排缓冲区，游标所指序号就绪时连续弹出。
pub struct ResultAggregator {
    total: usize,
    policy: ErrorPolicy,
    pending: BTreeMap<usize, Completion>,
    cursor: usize,
    summary: AggregateSummary,
}

impl ResultAggregator {
    pub fn new(total: usize, policy: ErrorPolicy) -> Self {
        Self {
            total,
            policy,
            pending: BTreeMap::new(),
            cursor: 0,
            summary: AggregateSummary::default(),
        }
    }

    /// 接收一个完成结果，返回因此变为可输出的有序前缀
    pub fn push(&mut self, completion: Completion) -> Vec<Emitted> {
        if completion.slot < self.cursor || self.pending.contains_key(&completion.slot) {
            warn!("[聚合] 忽略重复的完成结果: slot {}", completion.slot);
            return Vec::new();
        }
        self.pending.insert(completion.slot, completion);

        let mut ready = Vec::new();
        while let Some(mut completion) = self.pending.remove(&self.cursor) {
            self.cursor += 1;
            completion.release();
            if let Some(emitted) = self.resolve(completion) {
                ready.push(emitted);
            }
        }
        ready
    }

    fn resolve(&mut self, completion: Completion) -> Option<Emitted> {
        let record = match completion.result {
            Ok(boxes) => DetectionRecord::new(completion.frame_index, completion.timestamp, boxes),
            Err(e) => {
                self.summary.failed += 1;
                debug!("[聚合] 帧 {} 推理失败按 {:?} 处理: {}", completion.frame_index, self.policy, e);
                match self.policy {
                    ErrorPolicy::EmptyRecord => DetectionRecord::empty(completion.frame_index, completion.timestamp),
                    ErrorPolicy::Drop => return None,
                }
            }
        };

        self.summary.processed += 1;
        self.summary.boxes += record.boxes.len();
        if record.has_made_basket() {
            self.summary.made_baskets += 1;
        }
        Some(Emitted {
            record,
            processed: self.summary.processed,
            total: self.total.max(self.summary.processed),
        })
    }

    /// 下一个等待输出的采样序号
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// 重排缓冲区中等待前序结果的条数
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn processed(&self) -> usize {
        self.summary.processed
    }

    pub fn made_baskets(&self) -> usize {
        self.summary.made_baskets
    }

    pub fn summary(&self) -> AggregateSummary {
        self.summary
    }

    /// 惰性地聚合一串完成结果
    pub fn aggregate<I>(total: usize, policy: ErrorPolicy, completions: I) -> Aggregate<I::IntoIter>
    where
        I: IntoIterator<Item = Completion>,
    {
        Aggregate {
            inner: ResultAggregator::new(total, policy),
            completions: completions.into_iter(),
            ready: VecDeque::new(),
        }
    }
}

/// `ResultAggregator::aggregate` 返回的有序迭代器
pub struct Aggregate<I> {
    inner: ResultAggregator,
    completions: I,
    ready: VecDeque<Emitted>,
}

impl<I> Aggregate<I> {
    pub fn summary(&self) -> AggregateSummary {
        self.inner.summary()
    }
}

impl<I: Iterator<Item = Completion>> Iterator for Aggregate<I> {
    type Item = Emitted;

    fn next(&mut self) -> Option<Emitted> {
        loop {
            if let Some(emitted) = self.ready.pop_front() {
                return Some(emitted);
            }
            let completion = self.completions.next()?;
            self.ready.extend(self.inner.push(completion));
        }
    }
}
