use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use highlight_parse::config::{ConfigLoader, ConfigOverrides};
use highlight_parse::handler::{self, AppState};
use highlight_parse::protocol::{batched_lines, NdjsonDecoder, StreamEvent};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// 篮球视频精彩片段工具 - 场景划分、逐帧篮球与进球检测
#[derive(Parser, Debug)]
#[command(name = "highlight-parse")]
#[command(about = "篮球视频精彩片段工具：场景划分、篮球与进球检测、NDJSON 流式输出", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 场景划分，结果以 JSON 输出到标准输出
    Scenes {
        /// 输入视频文件路径
        #[arg(short, long)]
        input: PathBuf,

        /// 配置文件路径（可选，支持 .ini 格式）
        /// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
        #[arg(long)]
        config: Option<PathBuf>,

        /// 内容变化阈值，可通过环境变量 HIGHLIGHT_SCENE_THRESHOLD 设置
        #[arg(long)]
        threshold: Option<f64>,

        /// 最短场景帧数，可通过环境变量 HIGHLIGHT_MIN_SCENE_LEN 设置
        #[arg(long)]
        min_scene_len: Option<u64>,
    },
    /// 篮球与进球检测，事件以 NDJSON 逐行输出到标准输出
    Detect {
        /// 输入视频文件路径
        #[arg(short, long)]
        input: PathBuf,

        /// 配置文件路径（可选，支持 .ini 格式）
        #[arg(long)]
        config: Option<PathBuf>,

        /// 采样步长，可通过环境变量 HIGHLIGHT_FRAME_SKIP 设置
        #[arg(long)]
        frame_skip: Option<usize>,

        /// 置信度阈值，可通过环境变量 HIGHLIGHT_CONFIDENCE 设置
        #[arg(long)]
        confidence: Option<f64>,

        /// 并发推理数，可通过环境变量 HIGHLIGHT_MAX_WORKERS 设置
        #[arg(long)]
        max_workers: Option<usize>,
    },
    /// Web 服务模式
    Serve {
        /// 监听地址（默认从环境变量 PORT 读取，如果不存在则使用 0.0.0.0:5001）
        #[arg(short, long)]
        bind: Option<String>,

        /// 配置文件路径（可选，支持 .ini 格式）
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// 生成默认配置文件
    InitConfig {
        /// 输出路径
        #[arg(short, long, default_value = "highlight-parse.ini")]
        path: PathBuf,
    },
}

fn init_logging(level: &str) {
    let level = level.trim().parse::<tracing::Level>().unwrap_or(tracing::Level::INFO);
    // 标准输出留给结果，日志写到标准错误
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn ensure_video(input: &Path) -> Result<()> {
    if !input.is_file() {
        anyhow::bail!("视频文件不存在: {}", input.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Scenes {
            input,
            config: config_file,
            threshold,
            min_scene_len,
        } => {
            let overrides = ConfigOverrides {
                threshold,
                min_scene_len,
                ..ConfigOverrides::default()
            };
            let config = ConfigLoader::load(config_file.as_deref(), &overrides).context("加载配置失败")?;
            init_logging(&config.log_level);
            ensure_video(&input)?;

            tracing::info!(
                "使用配置: threshold={:.1}, min_scene_len={}, downscale={}",
                config.scenes.threshold,
                config.scenes.min_scene_len,
                config.scenes.downscale
            );
            let state = AppState::new(config);
            let (scenes, cached) = state
                .scenes(&input, &overrides)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))
                .context("场景划分失败")?;

            let output = serde_json::json!({ "scenes": scenes, "cached": cached });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Detect {
            input,
            config: config_file,
            frame_skip,
            confidence,
            max_workers,
        } => {
            let overrides = ConfigOverrides {
                frame_skip,
                confidence_threshold: confidence,
                max_workers,
                ..ConfigOverrides::default()
            };
            let config = ConfigLoader::load(config_file.as_deref(), &overrides).context("加载配置失败")?;
            init_logging(&config.log_level);
            ensure_video(&input)?;

            let flush_interval = config.flush_interval;
            let state = AppState::new(config);
            let streamer = state
                .streamer(&input, &ConfigOverrides::default())
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;

            let mut stdout = tokio::io::stdout();
            let mut decoder = NdjsonDecoder::new();
            let mut failure = None;
            let mut chunks = Box::pin(batched_lines(streamer.run(), flush_interval));
            while let Some(chunk) = chunks.next().await {
                stdout.write_all(chunk.as_bytes()).await.context("写入标准输出失败")?;
                stdout.flush().await.context("写入标准输出失败")?;
                for event in decoder.push(chunk.as_bytes()) {
                    if let StreamEvent::Error { message } = event {
                        failure = Some(message);
                    }
                }
            }

            if let Some(message) = failure {
                anyhow::bail!("检测失败: {}", message);
            }
        }
        Commands::Serve { bind, config: config_file } => {
            let config = ConfigLoader::load(config_file.as_deref(), &ConfigOverrides::default())
                .context("加载配置失败")?;
            init_logging(&config.log_level);

            // 优先使用命令行参数，其次使用环境变量 PORT，最后使用默认值 5001
            let bind_addr = bind.unwrap_or_else(|| {
                std::env::var("PORT")
                    .map(|port| format!("0.0.0.0:{}", port))
                    .unwrap_or_else(|_| "0.0.0.0:5001".to_string())
            });
            start_web_server(&bind_addr, Arc::new(AppState::new(config))).await?;
        }
        Commands::InitConfig { path } => {
            init_logging("info");
            if path.exists() {
                anyhow::bail!("配置文件已存在: {}", path.display());
            }
            ConfigLoader::create_default_config(&path)?;
            println!("已生成配置文件: {}", path.display());
        }
    }

    Ok(())
}

async fn start_web_server(bind: &str, state: handler::SharedState) -> Result<()> {
    let cache_dir = state.config.cache_dir.display().to_string();
    let cache_enabled = state.config.cache_enabled;
    let app = handler::router(state);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .context(format!("绑定地址失败: {}", bind))?;

    tracing::info!("Web 服务器启动在: http://{}", bind);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("可用端点:");
    tracing::info!("  • 健康检查: GET    http://{}/health", bind);
    tracing::info!("  • 场景划分: POST   http://{}/scenes", bind);
    tracing::info!("  • 篮球检测: POST   http://{}/balls", bind);
    tracing::info!("  • 流式检测: POST   http://{}/balls/stream", bind);
    tracing::info!("  • 缓存概览: GET    http://{}/cache", bind);
    tracing::info!("  • 清空缓存: DELETE http://{}/cache", bind);
    tracing::info!("  • 清除检测: DELETE http://{}/balls/cache", bind);
    tracing::info!("  • 缓存目录: {} ({})", cache_dir, if cache_enabled { "启用" } else { "关闭" });
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    axum::serve(listener, app)
        .await
        .context("启动服务器失败")?;

    Ok(())
}
