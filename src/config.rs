use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::aggregator::ErrorPolicy;
use crate::roboflow_client::{RoboflowConfig, DEFAULT_API_URL, DEFAULT_MODEL_ID};
use crate::scene_detector::SceneConfig;
use crate::streamer::StreamerConfig;
use crate::worker_pool::PoolConfig;

const CONFIG_FILE_NAME: &str = "highlight-parse.ini";
const HIDDEN_CONFIG_FILE_NAME: &str = ".highlight-parse.ini";

/// 完整的流水线配置
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub scenes: SceneConfig,
    pub streamer: StreamerConfig,
    pub roboflow: RoboflowConfig,
    /// 备用本地推理命令
    pub fallback_command: Option<String>,
    /// 结果缓存目录
    pub cache_dir: PathBuf,
    pub cache_enabled: bool,
    /// 流式输出中检测行的最长缓冲时间
    pub flush_interval: Duration,
    /// 日志级别（trace, debug, info, warn, error）
    pub log_level: String,
}

/// 命令行或请求体中显式给出的参数，优先级最高
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub threshold: Option<f64>,
    pub min_scene_len: Option<u64>,
    pub frame_skip: Option<usize>,
    pub confidence_threshold: Option<f64>,
    pub max_workers: Option<usize>,
}

/// 按 键 → 值 的来源逐层查找
struct Layers<'a> {
    file: Option<configparser::ini::Ini>,
    env: &'a dyn Fn(&str) -> Option<String>,
}

impl Layers<'_> {
    fn from_file(&self, section: &str, key: &str) -> Option<String> {
        self.file
            .as_ref()
            .and_then(|ini| ini.get(section, key).or_else(|| ini.get("default", key)))
            .filter(|v| !v.trim().is_empty())
    }

    fn from_env(&self, env_key: &str) -> Option<String> {
        (self.env)(env_key).filter(|v| !v.trim().is_empty())
    }

    /// 优先级：显式参数 > 环境变量 > 配置文件 > 默认值
    fn value<T: FromStr>(&self, explicit: Option<T>, env_key: &str, section: &str, key: &str, default: T) -> T {
        explicit
            .or_else(|| self.from_env(env_key).and_then(|v| v.trim().parse().ok()))
            .or_else(|| self.from_file(section, key).and_then(|v| v.trim().parse().ok()))
            .unwrap_or(default)
    }

    fn text(&self, env_key: &str, section: &str, key: &str) -> Option<String> {
        self.from_env(env_key).or_else(|| self.from_file(section, key))
    }

    fn flag(&self, env_key: &str, section: &str, key: &str, default: bool) -> bool {
        self.text(env_key, section, key)
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(default)
    }
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    pub fn load(config_file: Option<&Path>, overrides: &ConfigOverrides) -> Result<PipelineConfig> {
        Self::load_with_env(config_file, overrides, &|key: &str| env::var(key).ok())
    }

    /// 与 `load` 相同，但环境变量从 `env` 读取
    pub fn load_with_env(
        config_file: Option<&Path>,
        overrides: &ConfigOverrides,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<PipelineConfig> {
        // 1. 显式指定的配置文件必须存在，否则尝试默认位置
        let file = match config_file {
            Some(path) => Some(Self::read_ini(path)?),
            None => Self::find_default_location().map(|p| Self::read_ini(&p)).transpose()?,
        };
        let layers = Layers { file, env };

        // 2. 合并各层
        let scenes = SceneConfig {
            threshold: layers.value(overrides.threshold, "HIGHLIGHT_SCENE_THRESHOLD", "scenes", "threshold", 70.0),
            min_scene_len: layers.value(overrides.min_scene_len, "HIGHLIGHT_MIN_SCENE_LEN", "scenes", "min_scene_len", 15),
            downscale: layers.value(None, "HIGHLIGHT_DOWNSCALE", "scenes", "downscale", 4),
        };

        let confidence = layers.value(
            overrides.confidence_threshold,
            "HIGHLIGHT_CONFIDENCE",
            "detection",
            "confidence_threshold",
            0.25,
        );
        let infer_timeout = Duration::from_secs(layers.value(None, "HIGHLIGHT_INFER_TIMEOUT", "detection", "infer_timeout_secs", 30));

        let pool = PoolConfig {
            max_workers: layers.value(overrides.max_workers, "HIGHLIGHT_MAX_WORKERS", "detection", "max_workers", 4),
            confidence_threshold: confidence,
            max_infer_width: layers.value(None, "HIGHLIGHT_MAX_INFER_WIDTH", "detection", "max_infer_width", 640),
            infer_timeout,
            max_consecutive_failures: layers.value(
                None,
                "HIGHLIGHT_MAX_CONSECUTIVE_FAILURES",
                "detection",
                "max_consecutive_failures",
                10,
            ),
        };

        let error_policy = match layers.text("HIGHLIGHT_ERROR_POLICY", "detection", "error_policy").as_deref() {
            Some("drop") => ErrorPolicy::Drop,
            _ => ErrorPolicy::EmptyRecord,
        };

        let streamer = StreamerConfig {
            frame_skip: layers.value(overrides.frame_skip, "HIGHLIGHT_FRAME_SKIP", "stream", "frame_skip", 2),
            pool,
            error_policy,
            job_timeout: Duration::from_secs(layers.value(None, "HIGHLIGHT_JOB_TIMEOUT", "stream", "job_timeout_secs", 3600)),
        };

        let roboflow = RoboflowConfig {
            api_url: layers.value(None, "ROBOFLOW_API_URL", "detection", "api_url", DEFAULT_API_URL.to_string()),
            model_id: layers.value(None, "ROBOFLOW_MODEL_ID", "detection", "model_id", DEFAULT_MODEL_ID.to_string()),
            api_key: layers.text("ROBOFLOW_API_KEY", "detection", "api_key"),
            confidence,
            overlap: layers.value(None, "HIGHLIGHT_OVERLAP", "detection", "overlap", 0.5),
            timeout: infer_timeout,
        };

        let config = PipelineConfig {
            scenes,
            streamer,
            roboflow,
            fallback_command: layers.text("HIGHLIGHT_FALLBACK_COMMAND", "detection", "fallback_command"),
            cache_dir: PathBuf::from(layers.value(None, "CACHE_DIR", "cache", "dir", ".cache".to_string())),
            cache_enabled: layers.flag("CACHE_ENABLED", "cache", "enabled", true),
            flush_interval: Duration::from_millis(layers.value(
                None,
                "HIGHLIGHT_FLUSH_INTERVAL_MS",
                "stream",
                "flush_interval_ms",
                500,
            )),
            log_level: layers.value(None, "LOG_LEVEL", "logging", "level", "info".to_string()),
        };

        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &PipelineConfig) -> Result<()> {
        if config.scenes.threshold < 0.0 {
            anyhow::bail!("场景阈值不能为负数: {}", config.scenes.threshold);
        }
        if config.scenes.downscale == 0 {
            anyhow::bail!("downscale 必须大于 0");
        }
        if config.streamer.frame_skip == 0 {
            anyhow::bail!("frame_skip 必须大于 0");
        }
        if config.streamer.pool.max_workers == 0 {
            anyhow::bail!("max_workers 必须大于 0");
        }
        if !(0.0..=1.0).contains(&config.streamer.pool.confidence_threshold) {
            anyhow::bail!("置信度阈值必须在 0 到 1 之间: {}", config.streamer.pool.confidence_threshold);
        }
        Ok(())
    }

    fn read_ini(path: &Path) -> Result<configparser::ini::Ini> {
        if !path.exists() {
            anyhow::bail!("配置文件不存在: {}", path.display());
        }
        let mut ini = configparser::ini::Ini::new();
        ini.load(path)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        Ok(ini)
    }

    /// 默认位置：当前目录、当前目录隐藏文件、用户主目录、/etc
    fn find_default_location() -> Option<PathBuf> {
        let mut candidates = vec![PathBuf::from(CONFIG_FILE_NAME), PathBuf::from(HIDDEN_CONFIG_FILE_NAME)];
        if let Some(home) = env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(HIDDEN_CONFIG_FILE_NAME));
        }
        candidates.push(PathBuf::from("/etc").join(CONFIG_FILE_NAME));
        candidates.into_iter().find(|p| p.exists())
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let mut ini = configparser::ini::Ini::new();
        let entries: &[(&str, &str, &str)] = &[
            ("scenes", "threshold", "70.0"),
            ("scenes", "min_scene_len", "15"),
            ("scenes", "downscale", "4"),
            ("detection", "api_url", DEFAULT_API_URL),
            ("detection", "model_id", DEFAULT_MODEL_ID),
            ("detection", "api_key", ""),
            ("detection", "confidence_threshold", "0.25"),
            ("detection", "overlap", "0.5"),
            ("detection", "max_workers", "4"),
            ("detection", "max_infer_width", "640"),
            ("detection", "infer_timeout_secs", "30"),
            ("detection", "max_consecutive_failures", "10"),
            ("detection", "error_policy", "empty"),
            ("detection", "fallback_command", ""),
            ("stream", "frame_skip", "2"),
            ("stream", "job_timeout_secs", "3600"),
            ("stream", "flush_interval_ms", "500"),
            ("cache", "dir", ".cache"),
            ("cache", "enabled", "true"),
            ("logging", "level", "info"),
        ];
        for (section, key, value) in entries {
            ini.set(section, key, Some(value.to_string()));
        }

        ini.write(config_path)
            .with_context(|| format!("写入配置文件失败: {}", config_path.display()))?;
        Ok(())
    }
}
