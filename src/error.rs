use std::time::Duration;
use thiserror::Error;

/// 检测流水线的错误分类
///
/// 单帧错误（`Inference`、`Timeout`）由工作池与聚合器吸收，
/// 其余系统性错误向上传递到检测流并以一条 `error` 事件呈现给用户。
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// 视频无法打开或解码
    #[error("视频解码失败: {0}")]
    Decode(String),

    /// 推理后端认证失败（缺失或无效的 API Key）
    #[error("推理后端认证失败: {0}")]
    BackendAuth(String),

    /// 推理后端不可达（连接被拒绝、DNS 失败等）
    #[error("推理后端不可用: {0}")]
    BackendUnavailable(String),

    /// 推理后端限流
    #[error("推理后端限流: {0}")]
    RateLimited(String),

    /// 单帧推理失败
    #[error("推理失败: {0}")]
    Inference(String),

    /// 单次推理调用超时
    #[error("推理调用超时 ({0:?})")]
    Timeout(Duration),

    /// 整个任务超过墙钟上限
    #[error("检测任务超时 ({0:?})")]
    JobTimeout(Duration),

    /// 结果存储读写失败（仅记录日志，不中断任务）
    #[error("结果存储失败: {0}")]
    Persistence(String),

    /// 配置无效
    #[error("配置错误: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

const AUTH_MESSAGE: &str = "Roboflow API key is missing or invalid. Get one at https://docs.roboflow.com/api-reference/authentication#retrieve-an-api-key";

impl Error {
    /// 是否属于系统性错误：出现后工作池必须停止派发新任务
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            Error::BackendAuth(_) | Error::BackendUnavailable(_) | Error::JobTimeout(_)
        )
    }

    /// 是否应切换到本地备用推理路径
    pub fn triggers_fallback(&self) -> bool {
        matches!(self, Error::BackendUnavailable(_))
    }

    /// 面向用户的分类消息
    pub fn user_message(&self) -> String {
        match self {
            Error::Decode(_) => "Could not decode video. Upload a different file.".to_string(),
            Error::BackendAuth(_) => AUTH_MESSAGE.to_string(),
            Error::BackendUnavailable(_) => {
                "Detection backend is unreachable. Check your network connection and try again.".to_string()
            }
            Error::RateLimited(_) => {
                "Detection backend rate limit exceeded. Wait a moment and try again.".to_string()
            }
            Error::Timeout(limit) => {
                format!("Detection backend did not respond within {}s.", limit.as_secs())
            }
            Error::JobTimeout(limit) => {
                format!("Ball detection timed out after {}s. Partial results were kept.", limit.as_secs())
            }
            Error::Inference(msg) | Error::Persistence(msg) | Error::Config(msg) => {
                format!("Ball detection failed: {}", msg)
            }
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}
