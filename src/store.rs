use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metadata::{DetectionRecord, Segment, VideoInfo};

/// 视频身份标识，作为结果存储的键
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoKey(String);

impl VideoKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// 由文件路径、大小与修改时间计算 SHA-1，文件被替换后键随之变化
    pub fn for_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let meta = std::fs::metadata(path)
            .map_err(|e| Error::Decode(format!("无法读取视频文件 {}: {}", path.display(), e)))?;
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let modified = meta
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
            .unwrap_or_default();

        let mut hasher = Sha1::new();
        hasher.update(canonical.to_string_lossy().as_bytes());
        hasher.update(meta.len().to_le_bytes());
        hasher.update(modified.to_le_bytes());
        Ok(Self(format!("{:x}", hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VideoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 存储中的一条完整结果；场景与检测分别写入，互不覆盖
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<Segment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detections: Option<Vec<DetectionRecord>>,
    pub updated_at: DateTime<Utc>,
}

impl StoredResult {
    pub fn new() -> Self {
        Self {
            source: None,
            video: None,
            segments: None,
            detections: None,
            updated_at: Utc::now(),
        }
    }

    /// 以已有条目为基础合并，未提供的部分保留原值
    pub fn merged_into(self, existing: Option<StoredResult>) -> StoredResult {
        let existing = existing.unwrap_or_default();
        StoredResult {
            source: self.source.or(existing.source),
            video: self.video.or(existing.video),
            segments: self.segments.or(existing.segments),
            detections: self.detections.or(existing.detections),
            updated_at: Utc::now(),
        }
    }
}

impl Default for StoredResult {
    fn default() -> Self {
        Self::new()
    }
}

/// 缓存概览中的一条
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: VideoKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub scenes: usize,
    pub ball_detections: usize,
    pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
    fn from_stored(key: VideoKey, stored: &StoredResult) -> Self {
        Self {
            key,
            source: stored.source.clone(),
            scenes: stored.segments.as_ref().map_or(0, Vec::len),
            ball_detections: stored.detections.as_ref().map_or(0, Vec::len),
            updated_at: stored.updated_at,
        }
    }
}

/// 持久化结果存储
///
/// 在任务开始时读取一次，成功完成时写入一次。写入必须整体替换，
/// 读者不会看到写了一半的值。
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn get(&self, key: &VideoKey) -> Result<Option<StoredResult>>;

    async fn put(&self, key: &VideoKey, value: StoredResult) -> Result<()>;

    /// 删除条目，返回条目是否存在
    async fn delete(&self, key: &VideoKey) -> Result<bool>;

    async fn list(&self) -> Result<Vec<CacheEntry>>;

    /// 删除全部条目，返回删除数量
    async fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in self.list().await? {
            if self.delete(&entry.key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// 只清除检测结果，保留场景划分
    async fn clear_detections(&self) -> Result<usize> {
        let mut cleared = 0;
        for entry in self.list().await? {
            if let Some(mut stored) = self.get(&entry.key).await? {
                if stored.detections.take().is_some() {
                    stored.updated_at = Utc::now();
                    self.put(&entry.key, stored).await?;
                    cleared += 1;
                }
            }
        }
        Ok(cleared)
    }
}

/// 以 JSON 文件保存在缓存目录中的结果存储
pub struct FileResultStore {
    dir: PathBuf,
}

impl FileResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &VideoKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.as_str()))
    }
}

#[async_trait]
impl ResultStore for FileResultStore {
    async fn get(&self, key: &VideoKey) -> Result<Option<StoredResult>> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Persistence(format!("读取 {} 失败: {}", path.display(), e))),
        };
        let stored = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Persistence(format!("解析 {} 失败: {}", path.display(), e)))?;
        debug!("[结果存储] 命中 {}", path.display());
        Ok(Some(stored))
    }

    async fn put(&self, key: &VideoKey, value: StoredResult) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        // 先写临时文件再重命名，读者只会看到旧值或新值
        let tmp = self.dir.join(format!(".{}.{}.tmp", key.as_str(), uuid::Uuid::new_v4()));
        let bytes = serde_json::to_vec(&value)?;
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::Persistence(format!("替换 {} 失败: {}", path.display(), e)));
        }
        info!("💾 [结果存储] 已写入 {}", path.display());
        Ok(())
    }

    async fn delete(&self, key: &VideoKey) -> Result<bool> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<CacheEntry>> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.starts_with('.') || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let key = VideoKey::new(stem);
            match self.get(&key).await {
                Ok(Some(stored)) => entries.push(CacheEntry::from_stored(key, &stored)),
                Ok(None) => {}
                Err(e) => warn!("⚠️ [结果存储] 跳过损坏的缓存文件 {}: {}", path.display(), e),
            }
        }
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(entries)
    }
}

/// 进程内结果存储，记录读写次数
#[derive(Default)]
pub struct MemoryResultStore {
    entries: Mutex<HashMap<VideoKey, StoredResult>>,
    gets: AtomicUsize,
    puts: AtomicUsize,
    failing: bool,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 所有读写都返回存储错误
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::Acquire)
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::Acquire)
    }

    fn check(&self) -> Result<()> {
        if self.failing {
            return Err(Error::Persistence("存储不可用".to_string()));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<VideoKey, StoredResult>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Persistence("存储锁已损坏".to_string()))
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn get(&self, key: &VideoKey) -> Result<Option<StoredResult>> {
        self.gets.fetch_add(1, Ordering::AcqRel);
        self.check()?;
        Ok(self.lock()?.get(key).cloned())
    }

    async fn put(&self, key: &VideoKey, value: StoredResult) -> Result<()> {
        self.puts.fetch_add(1, Ordering::AcqRel);
        self.check()?;
        self.lock()?.insert(key.clone(), value);
        Ok(())
    }

    async fn delete(&self, key: &VideoKey) -> Result<bool> {
        self.check()?;
        Ok(self.lock()?.remove(key).is_some())
    }

    async fn list(&self) -> Result<Vec<CacheEntry>> {
        self.check()?;
        Ok(self
            .lock()?
            .iter()
            .map(|(key, stored)| CacheEntry::from_stored(key.clone(), stored))
            .collect())
    }
}

/// 关闭缓存时使用：读取永远未命中，写入直接丢弃
pub struct DisabledResultStore;

#[async_trait]
impl ResultStore for DisabledResultStore {
    async fn get(&self, _key: &VideoKey) -> Result<Option<StoredResult>> {
        Ok(None)
    }

    async fn put(&self, _key: &VideoKey, _value: StoredResult) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _key: &VideoKey) -> Result<bool> {
        Ok(false)
    }

    async fn list(&self) -> Result<Vec<CacheEntry>> {
        Ok(Vec::new())
    }
}
