use ffmpeg_next as ffmpeg;
use image::RgbImage;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::metadata::{Frame, VideoInfo};

/// 有序、带时间戳的帧序列
///
/// 帧按序号与时间戳严格递增的顺序交给 `emit`；`emit` 返回 `Break` 时立即停止解码。
pub trait FrameSource: Send {
    fn info(&self) -> VideoInfo;

    fn for_each_frame(&mut self, emit: &mut dyn FnMut(Frame) -> ControlFlow<()>) -> Result<()>;
}

/// 按采样步长打开帧源的工厂，备用推理路径需要重新打开视频
pub type SourceFactory = Arc<dyn Fn(usize) -> Result<Box<dyn FrameSource>> + Send + Sync>;

/// 基于 FFmpeg 的视频解码器
pub struct VideoProcessor {
    input_path: PathBuf,
    info: VideoInfo,
    /// 采样步长：只输出序号为步长整数倍的帧
    frame_skip: usize,
}

impl VideoProcessor {
    pub fn open(input_path: impl AsRef<Path>, frame_skip: usize) -> Result<Self> {
        ffmpeg::init().map_err(|e| Error::Decode(format!("初始化 FFmpeg 失败: {}", e)))?;

        // 只保留 ERROR 级别的 FFmpeg 日志
        unsafe {
            ffmpeg::sys::av_log_set_level(ffmpeg::sys::AV_LOG_ERROR as i32);
        }

        let input_path = input_path.as_ref().to_path_buf();
        let info = Self::probe(&input_path)?;
        info!(
            "🎞️ [帧源] 打开视频 {}: {}x{}, {:.2} fps, {} 帧, {:.2}秒",
            input_path.display(),
            info.width,
            info.height,
            info.fps,
            info.total_frames,
            info.duration
        );

        Ok(Self {
            input_path,
            info,
            frame_skip: frame_skip.max(1),
        })
    }

    /// 返回按路径打开视频的工厂
    pub fn factory(input_path: impl AsRef<Path>) -> SourceFactory {
        let path = input_path.as_ref().to_path_buf();
        Arc::new(move |frame_skip| {
            Ok(Box::new(VideoProcessor::open(&path, frame_skip)?) as Box<dyn FrameSource>)
        })
    }

    fn probe(path: &Path) -> Result<VideoInfo> {
        let ictx = ffmpeg::format::input(&path)
            .map_err(|e| Error::Decode(format!("无法打开视频文件 {}: {}", path.display(), e)))?;

        let video_stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| Error::Decode("未找到视频流".to_string()))?;

        let decoder_context = ffmpeg::codec::context::Context::from_parameters(video_stream.parameters())
            .map_err(|e| Error::Decode(format!("无法创建解码器上下文: {}", e)))?;
        let decoder = decoder_context
            .decoder()
            .video()
            .map_err(|e| Error::Decode(format!("无法创建视频解码器: {}", e)))?;

        let rate = video_stream.avg_frame_rate();
        let fps = if rate.denominator() > 0 && rate.numerator() > 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            30.0
        };

        let container_duration = if ictx.duration() > 0 {
            ictx.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64
        } else {
            0.0
        };

        // 优先使用流上的帧数，缺失时按容器时长估算
        let total_frames = if video_stream.frames() > 0 {
            video_stream.frames() as u64
        } else {
            (container_duration * fps).round() as u64
        };
        let duration = if total_frames > 0 {
            total_frames as f64 / fps
        } else {
            container_duration
        };

        Ok(VideoInfo {
            fps,
            width: decoder.width(),
            height: decoder.height(),
            total_frames,
            duration,
        })
    }

    /// 将 RGB24 帧转换为图像，逐行拷贝以去掉行对齐填充
    fn frame_to_image(frame: &ffmpeg::frame::Video) -> Result<RgbImage> {
        let width = frame.width();
        let height = frame.height();
        let stride = frame.stride(0);
        let data = frame.data(0);
        let row_bytes = width as usize * 3;

        let mut buf = Vec::with_capacity(row_bytes * height as usize);
        for y in 0..height as usize {
            let start = y * stride;
            let row = data
                .get(start..start + row_bytes)
                .ok_or_else(|| Error::Decode("帧数据长度不足".to_string()))?;
            buf.extend_from_slice(row);
        }

        RgbImage::from_raw(width, height, buf).ok_or_else(|| Error::Decode("无法构造 RGB 图像".to_string()))
    }
}

struct DecodeState {
    next_index: u64,
    fps: f64,
    frame_skip: u64,
    emitted: u64,
}

fn drain_decoder(
    decoder: &mut ffmpeg::decoder::Video,
    scaler: &mut ffmpeg::software::scaling::Context,
    state: &mut DecodeState,
    emit: &mut dyn FnMut(Frame) -> ControlFlow<()>,
) -> Result<ControlFlow<()>> {
    let mut decoded = ffmpeg::frame::Video::empty();
    while decoder.receive_frame(&mut decoded).is_ok() {
        let index = state.next_index;
        state.next_index += 1;

        // 未被采样的帧不做颜色空间转换
        if index % state.frame_skip != 0 {
            continue;
        }

        let mut rgb_frame = ffmpeg::frame::Video::empty();
        scaler
            .run(&decoded, &mut rgb_frame)
            .map_err(|e| Error::Decode(format!("帧 {} 缩放失败: {}", index, e)))?;
        let image = VideoProcessor::frame_to_image(&rgb_frame)?;

        state.emitted += 1;
        if emit(Frame::new(index, index as f64 / state.fps, image)).is_break() {
            return Ok(ControlFlow::Break(()));
        }
    }
    Ok(ControlFlow::Continue(()))
}

impl FrameSource for VideoProcessor {
    fn info(&self) -> VideoInfo {
        self.info
    }

    fn for_each_frame(&mut self, emit: &mut dyn FnMut(Frame) -> ControlFlow<()>) -> Result<()> {
        let start = Instant::now();
        let mut ictx = ffmpeg::format::input(&self.input_path)
            .map_err(|e| Error::Decode(format!("无法打开视频文件: {}", e)))?;

        let video_stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| Error::Decode("未找到视频流".to_string()))?;
        let video_stream_index = video_stream.index();

        let decoder_context = ffmpeg::codec::context::Context::from_parameters(video_stream.parameters())
            .map_err(|e| Error::Decode(format!("无法创建解码器上下文: {}", e)))?;
        let mut decoder = decoder_context
            .decoder()
            .video()
            .map_err(|e| Error::Decode(format!("无法创建视频解码器: {}", e)))?;

        let mut scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .map_err(|e| Error::Decode(format!("无法创建缩放器: {}", e)))?;

        let mut state = DecodeState {
            next_index: 0,
            fps: self.info.fps,
            frame_skip: self.frame_skip as u64,
            emitted: 0,
        };

        for (stream, packet) in ictx.packets() {
            if stream.index() != video_stream_index {
                continue;
            }
            // 损坏的数据包跳过，由后续数据包继续解码
            if decoder.send_packet(&packet).is_err() {
                continue;
            }
            if drain_decoder(&mut decoder, &mut scaler, &mut state, emit)?.is_break() {
                debug!("[帧源] 下游停止拉取，提前结束解码 (已输出 {} 帧)", state.emitted);
                return Ok(());
            }
        }

        decoder
            .send_eof()
            .map_err(|e| Error::Decode(format!("刷新解码器失败: {}", e)))?;
        drain_decoder(&mut decoder, &mut scaler, &mut state, emit)?;

        if state.next_index == 0 {
            return Err(Error::Decode("视频中没有可解码的帧".to_string()));
        }

        debug!(
            "[帧源] 解码完成: 共 {} 帧，输出 {} 帧，耗时 {:.2}秒",
            state.next_index,
            state.emitted,
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }
}

/// 内存中的帧序列，按相同的采样规则输出
pub struct MemoryFrameSource {
    info: VideoInfo,
    frames: Vec<Frame>,
    frame_skip: u64,
}

impl MemoryFrameSource {
    pub fn new(info: VideoInfo, frames: Vec<Frame>) -> Self {
        Self {
            info,
            frames,
            frame_skip: 1,
        }
    }

    pub fn with_frame_skip(mut self, frame_skip: usize) -> Self {
        self.frame_skip = frame_skip.max(1) as u64;
        self
    }

    /// 每次调用都从同一组帧重新构造帧源
    pub fn factory(info: VideoInfo, frames: Vec<Frame>) -> SourceFactory {
        Arc::new(move |frame_skip| {
            Ok(Box::new(MemoryFrameSource::new(info, frames.clone()).with_frame_skip(frame_skip))
                as Box<dyn FrameSource>)
        })
    }
}

impl FrameSource for MemoryFrameSource {
    fn info(&self) -> VideoInfo {
        self.info
    }

    fn for_each_frame(&mut self, emit: &mut dyn FnMut(Frame) -> ControlFlow<()>) -> Result<()> {
        if self.frames.is_empty() {
            return Err(Error::Decode("视频中没有可解码的帧".to_string()));
        }
        for frame in self.frames.drain(..) {
            if frame.index % self.frame_skip != 0 {
                continue;
            }
            if emit(frame).is_break() {
                break;
            }
        }
        Ok(())
    }
}
