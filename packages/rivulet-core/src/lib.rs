//! rivulet core - a live A/V streaming pipeline substrate.
//!
//! This crate provides the engine underneath a streaming service: a
//! directed graph of processing filters exchanging preallocated media
//! frames through bounded queues, with timestamp-aware buffering and
//! event-driven reconfiguration that never stalls the data path.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`frame`]: media frames and their typed payloads
//! - [`queue`]: bounded frame queues (framed ring, sliced fan-out, audio
//!   circular buffer)
//! - [`io`]: reader/writer endpoints with multi-filter reader sharing
//! - [`filter`]: the filter runtime (shapes, roles, demand strategies) and
//!   builtin bodies
//! - [`event`]: per-filter reconfiguration events
//! - [`pipeline`]: graph construction, validation and scheduling
//! - [`monitor`]: pluggable lifecycle observation
//! - [`stream_info`]: codec/format negotiation at connect time
//! - [`config`]: sizing and pacing policy
//! - [`error`]: centralized error types
//!
//! # Abstraction Traits
//!
//! Plug-in filters implement [`FilterBody`](filter::FilterBody) plus a
//! [`FilterIo`](filter::FilterIo) connect-time contract; embedders can
//! inject a [`TaskSpawner`](runtime::TaskSpawner) and a
//! [`PipelineObserver`](monitor::PipelineObserver). Defaults suit a
//! standalone tokio runtime.

#![warn(clippy::all)]

pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod filter;
pub mod frame;
pub mod io;
pub mod monitor;
pub mod pipeline;
pub mod queue;
pub mod runtime;
pub mod stream_info;
pub mod utils;

// Re-export commonly used types at the crate root
pub use config::{AudioRingConfig, QueueConfig, SchedulerConfig};
pub use error::{ErrorCode, PipelineError, PipelineResult};
pub use event::{Event, EventQueue};
pub use filter::{
    Filter, FilterBody, FilterIo, FilterRole, FilterShape, FrameSet, FramedQueueIo, NoOutputIo,
    Progress,
};
pub use frame::{
    Frame, FrameData, InterleavedAudioFrame, PlanarAudioFrame, Slice, SlicedVideoFrame, VideoFrame,
};
pub use io::{Reader, Writer};
pub use monitor::{LoggingObserver, NoopObserver, PipelineEvent, PipelineObserver};
pub use pipeline::{Path, PipelineManager};
pub use queue::{
    AudioCircularBuffer, ConnectionData, EndpointId, FilterId, FrameQueue, FramedQueue, FrameRef,
    QueueState, ReaderData, SlicedVideoQueue,
};
pub use runtime::{TaskSpawner, TokioSpawner};
pub use stream_info::{
    AudioCodec, AudioStreamInfo, PixelFormat, SampleFormat, StreamInfo, StreamKind, StreamParams,
    VideoCodec, VideoStreamInfo,
};
pub use utils::{now_micros, now_millis};
