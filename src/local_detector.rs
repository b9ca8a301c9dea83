use async_trait::async_trait;
use image::RgbImage;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::detector::{encode_jpeg, parse_predictions, Detector, Prediction};
use crate::error::{Error, Result};

/// 本地单进程推理后端
///
/// 每帧启动一次配置的命令：JPEG 写入 stdin，stdout 输出与托管接口相同格式的 JSON。
/// 托管接口不可达时作为备用路径。
pub struct LocalCommandDetector {
    program: String,
    args: Vec<String>,
}

impl LocalCommandDetector {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// 按空白拆分命令行，如 `python3 detect_local.py --model made-baskets`
    pub fn from_command_line(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

#[async_trait]
impl Detector for LocalCommandDetector {
    fn name(&self) -> &str {
        &self.program
    }

    async fn infer(&self, image: &RgbImage) -> Result<Vec<Prediction>> {
        let jpeg = encode_jpeg(image)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::BackendUnavailable(format!("无法启动本地推理命令 {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&jpeg)
                .await
                .map_err(|e| Error::Inference(format!("写入本地推理进程失败: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::Inference(format!("等待本地推理进程失败: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Inference(format!(
                "本地推理进程退出码 {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }

        parse_predictions(&output.stdout)
    }
}
