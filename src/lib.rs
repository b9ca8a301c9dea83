pub mod aggregator;
pub mod config;
pub mod detector;
pub mod error;
pub mod handler;
pub mod local_detector;
pub mod metadata;
pub mod protocol;
pub mod roboflow_client;
pub mod scene_detector;
pub mod store;
pub mod streamer;
pub mod video_processor;
pub mod worker_pool;

pub use aggregator::{ErrorPolicy, ResultAggregator};
pub use config::{ConfigLoader, ConfigOverrides, PipelineConfig};
pub use detector::{Detector, Prediction};
pub use error::{Error, Result};
pub use metadata::{BoundingBox, DetectionRecord, Frame, Segment, VideoInfo};
pub use protocol::StreamEvent;
pub use scene_detector::SceneDetector;
pub use store::{FileResultStore, MemoryResultStore, ResultStore, VideoKey};
pub use streamer::{DetectionStreamer, StreamerConfig};
pub use video_processor::{FrameSource, MemoryFrameSource, VideoProcessor};
pub use worker_pool::{DetectionWorkerPool, PoolConfig};
